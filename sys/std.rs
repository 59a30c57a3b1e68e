
// sys/std.rs backs the sys layer with std: a millisecond tick counter
// rooted at clock creation, a Mutex queue lock, and a coalescing
// condvar semaphore.
//

use core::convert::Infallible;
use core::fmt;
use core::mem::transmute;
use core::sync::atomic::Ordering;
use core::time::Duration;

use cfg_if::cfg_if;

use std::time::Instant;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Condvar;

use crate::traits::*;
use crate::Delta;

#[cfg(feature="alloc")] extern crate alloc as core_alloc;


// Memory allocation, this is optional
#[cfg(feature="alloc")] pub(crate) use core_alloc::alloc::alloc;
#[cfg(feature="alloc")] pub(crate) use core_alloc::alloc::dealloc;
#[cfg(feature="alloc")] pub(crate) use core_alloc::alloc::handle_alloc_error;


// Time primitives
cfg_if! {
    if #[cfg(evq_utick_width="64")] {
        #[allow(non_camel_case_types)] pub type utick = u64;
        #[allow(non_camel_case_types)] pub type itick = i64;
        pub(crate) type AtomicUtick = core::sync::atomic::AtomicU64;
    } else {
        #[allow(non_camel_case_types)] pub type utick = u32;
        #[allow(non_camel_case_types)] pub type itick = i32;
        pub(crate) type AtomicUtick = core::sync::atomic::AtomicU32;
    }
}

// Integer that fits a slot generation count, the anti-ABA half of an id
#[allow(non_camel_case_types)] pub(crate) type ugen = u16;


// Locking primitive
#[derive(Debug)]
pub(crate) struct SysLock(Mutex<()>);

impl SysLock {
    pub(crate) fn new() -> Self {
        SysLock(Mutex::new(()))
    }
}

impl Lock for SysLock {
    // unfortunately we can't define types with lifetimes
    // in traits, the best we can do is unsafely strip the
    // lifetime and leave it up to the caller to drop the
    // types in the correct order
    type Guard = MutexGuard<'static, ()>;

    fn lock(&self) -> Self::Guard {
        // strip lifetime
        let guard = self.0.lock().unwrap();
        unsafe { transmute::<MutexGuard<'_, ()>, _>(guard) }
    }
}


// Delta conversions
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeltaError {
    Negative,
    Overflow,
}

impl fmt::Display for DeltaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeltaError::Negative => write!(f, "Negative delta"),
            DeltaError::Overflow => write!(f, "Delta overflow"),
        }
    }
}

impl TryIntoDelta for Delta {
    type Error = Infallible;
    #[inline]
    fn try_into_delta(self) -> Result<Delta, Self::Error> {
        Ok(self)
    }
}

impl TryIntoDelta for itick {
    type Error = DeltaError;
    #[inline]
    fn try_into_delta(self) -> Result<Delta, Self::Error> {
        Delta::new(self).ok_or(DeltaError::Negative)
    }
}

impl TryIntoDelta for Duration {
    type Error = DeltaError;
    #[inline]
    fn try_into_delta(self) -> Result<Delta, Self::Error> {
        itick::try_from(self.as_millis()).ok()
            .and_then(Delta::new)
            .ok_or(DeltaError::Overflow)
    }
}

cfg_if! {
    if #[cfg(feature="embedded-time")] {
        impl TryIntoDelta for embedded_time::duration::Milliseconds<u32> {
            type Error = DeltaError;
            #[inline]
            fn try_into_delta(self) -> Result<Delta, Self::Error> {
                itick::try_from(self.0).ok()
                    .and_then(Delta::new)
                    .ok_or(DeltaError::Overflow)
            }
        }

        impl TryIntoDelta for embedded_time::duration::Seconds<u32> {
            type Error = DeltaError;
            #[inline]
            fn try_into_delta(self) -> Result<Delta, Self::Error> {
                self.0.checked_mul(1000)
                    .and_then(|ms| itick::try_from(ms).ok())
                    .and_then(Delta::new)
                    .ok_or(DeltaError::Overflow)
            }
        }
    }
}


// Time/semaphore primitive
#[derive(Debug)]
pub struct SysClock {
    instant: Instant,
    offset: AtomicUtick,

    flag: Mutex<bool>,
    cond: Condvar,
}

impl SysClock {
    pub fn new() -> Self {
        Self {
            instant: Instant::now(),
            offset: AtomicUtick::new(0),

            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Artificially advance the tick counter, this is how tests exercise
    /// behavior near the tick wrap point without waiting out a wrap
    pub fn advance(&self, ticks: utick) {
        self.offset.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl Default for SysClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SysClock {
    fn now(&self) -> utick {
        (self.instant.elapsed().as_millis() as utick)
            .wrapping_add(self.offset.load(Ordering::SeqCst))
    }
}

impl Signal for SysClock {
    fn signal(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        drop(flag);

        self.cond.notify_all();
    }
}

impl Sema for SysClock {
    fn wait(&self) {
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            flag = self.cond.wait(flag).unwrap();
        }
        *flag = false;
    }

    fn wait_timeout(&self, delta: Delta) {
        let mut flag = self.flag.lock().unwrap();
        // already signaled?
        if *flag {
            *flag = false;
            return;
        }

        let (mut flag, _) = self.cond
            .wait_timeout(flag, Duration::from_millis(delta.ticks() as u64))
            .unwrap();
        if *flag {
            *flag = false;
        }
    }
}

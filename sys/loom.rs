
// sys/loom.rs backs the sys layer with loom's model-checked primitives.
// Time is virtual here, loom cannot model a real clock, so tests drive
// the tick counter by hand and waits degrade to yields.
//

use core::convert::Infallible;
use core::fmt;
use core::mem::transmute;
use core::time::Duration;

use cfg_if::cfg_if;

use loom::sync::Mutex;
use loom::sync::MutexGuard;
use loom::sync::atomic::Ordering;

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
        pub(crate) type AtomicUtick = loom::sync::atomic::AtomicU64;
    } else {
        #[allow(non_camel_case_types)] pub type utick = u32;
        #[allow(non_camel_case_types)] pub type itick = i32;
        pub(crate) type AtomicUtick = loom::sync::atomic::AtomicU32;
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


// Time/semaphore primitive
//
// In order for loom to work the clock must be deterministic, so instead
// of tracking real time we let the tests set the tick by hand. The tick
// lives in a loom atomic so updates participate in loom's reordering.
loom::lazy_static! {
    static ref EVQ_TICK: AtomicUtick = AtomicUtick::new(0);
}

#[derive(Debug)]
pub struct SysClock();

impl SysClock {
    pub fn new() -> Self {
        Self()
    }

    pub fn set_now(now: utick) {
        EVQ_TICK.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: utick) {
        EVQ_TICK.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl Default for SysClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SysClock {
    fn now(&self) -> utick {
        EVQ_TICK.load(Ordering::SeqCst)
    }
}

impl Signal for SysClock {
    fn signal(&self) {
        // nothing to satisfy, waits are yields under loom
    }
}

impl Sema for SysClock {
    fn wait(&self) {
        // a spurious wakeup as far as the dispatcher is concerned, which
        // keeps loom's state space bounded
        loom::thread::yield_now();
    }

    fn wait_timeout(&self, _delta: Delta) {
        loom::thread::yield_now();
    }
}


use core::fmt::Debug;

use crate::Delta;
use crate::sys::*;


//// post traits ////

/// Post trait, the callable form the dispatch loop consumes
pub trait Post {
    fn post(&mut self);
}

impl<F: FnMut()> Post for F {
    fn post(&mut self) {
        self()
    }
}

/// Post-once trait, a special case for one-shot events
pub trait PostOnce {
    fn post_once(self);
}

impl<F: FnOnce()> PostOnce for F {
    fn post_once(self) {
        self()
    }
}

/// Adapter that lets a PostOnce ride the Post machinery, the callable is
/// consumed on the first fire
pub(crate) struct Once<F>(Option<F>);

impl<F> Once<F> {
    pub(crate) fn new(f: F) -> Self {
        Once(Some(f))
    }
}

impl<F: PostOnce> Post for Once<F> {
    fn post(&mut self) {
        if let Some(f) = self.0.take() {
            f.post_once()
        }
    }
}


//// delta conversion traits ////

/// Conversion into a span of ticks
pub trait TryIntoDelta: Sized {
    type Error;
    fn try_into_delta(self) -> Result<Delta, Self::Error>;
}


//// system level traits ////

/// Some way to get the time, for some definition of time
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> utick;
}

/// Locking primitive guarding the queue state, ports map this onto a
/// mutex or onto disabling interrupts
pub trait Lock: Send + Sync + Debug {
    type Guard;
    fn lock(&self) -> Self::Guard;
}

/// Common signal trait for semaphores, edge-triggered and coalesced
pub trait Signal: Send + Sync + Debug {
    fn signal(&self);
}

/// Binary semaphore, aka a waiting/signalling primitive, waits may return
/// spuriously early
pub trait Sema: Signal {
    fn wait(&self);
    fn wait_timeout(&self, delta: Delta);
}

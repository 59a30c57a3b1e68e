//! A fixed-capacity timed event queue.
//!
//! Events are closures stored inline in a caller-provided (or internally
//! allocated) buffer, posted from any context, and dispatched in deadline
//! order on a single dispatch thread. One-shot, delayed, and periodic
//! events are supported, along with cancellation by id, queue chaining,
//! and backgrounding onto an external timer.

#![cfg_attr(not(any(feature="std", test)), no_std)]

#![deny(missing_debug_implementations)]

use core::alloc::Layout;
use core::borrow::Borrow;
use core::borrow::BorrowMut;
use core::cell::UnsafeCell;
use core::cmp::Ordering;
use core::fmt;
use core::marker::PhantomData;
use core::mem::align_of;
use core::mem::forget;
use core::mem::size_of;
use core::num::NonZeroU32;
use core::ops::Deref;
use core::ops::DerefMut;
use core::ptr;

#[cfg(feature="alloc")] extern crate alloc as core_alloc;
#[cfg(feature="alloc")] use core_alloc::boxed::Box;

mod util;
use util::*;

mod traits;
pub use traits::*;

mod sys;
pub use sys::utick;
pub use sys::itick;
pub use sys::DeltaError;
pub use sys::SysClock;
use sys::*;


/// Event queue errors
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    NoMem,
    WouldCycle,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoMem => write!(f, "Out of memory"),
            Error::WouldCycle => write!(f, "Chain would form a cycle"),
        }
    }
}


/// A non-negative span of ticks
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Delta(itick);

impl Delta {
    pub const ZERO: Delta = Delta(0);
    pub const MAX: Delta = Delta(itick::MAX);

    #[inline]
    pub fn new(ticks: itick) -> Option<Delta> {
        if ticks >= 0 {
            Some(Delta(ticks))
        } else {
            None
        }
    }

    #[inline]
    pub fn ticks(self) -> itick {
        self.0
    }

    #[inline]
    pub fn uticks(self) -> utick {
        self.0 as utick
    }
}


/// How a dispatch call came to return
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The dispatch budget ran out
    Timeout,
    /// Someone called break_dispatch
    Break,
}

/// A unique id for a posted event, valid until the event finishes
/// executing
///
/// Ids encode the slot index in their low bits and the slot's generation
/// count in their high bits, so an id for a slot that has since been
/// recycled simply stops matching. The all-zeros id is never handed out.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Id(NonZeroU32);


/// Slot lifecycle, only ever inspected with the queue lock held
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    /// On the free list
    Free,
    /// Allocated, not yet posted, owned by a producer
    Staged,
    /// Linked in the pending queue
    Pending,
    /// Detached for dispatch or teardown
    Executing,
}

/// Internal event slot header, the payload trails the header in the slab
#[repr(C)]
struct Eslot {
    next: *mut Eslot,
    prev: *mut Eslot,

    cb: Option<fn(*mut u8)>,
    drop: Option<fn(*mut u8)>,

    // absolute deadline once posted, relative delay while staged
    target: utick,
    // negative for one-shot events
    period: itick,
    // drain pass that last rescheduled this slot
    pass: usize,

    gen: ugen,
    state: State,
    cancelled: bool,
}

impl Eslot {
    // maximum alignment of payloads, pointer alignment is a common
    // denominator
    const ALIGN: usize = {
        let a = align_of::<Eslot>();
        let b = align_of::<*const u8>();
        if a > b { a } else { b }
    };

    unsafe fn as_ptr<T>(&self) -> *const T {
        (self as *const Eslot).add(1) as *const T
    }

    unsafe fn as_mut_ptr<T>(&mut self) -> *mut T {
        (self as *mut Eslot).add(1) as *mut T
    }

    fn as_ref<'a, T>(&'a self) -> &'a T {
        unsafe { &*self.as_ptr() }
    }

    fn as_mut<'a, T>(&'a mut self) -> &'a mut T {
        unsafe { &mut *self.as_mut_ptr() }
    }

    unsafe fn from_mut_ptr<'a, T>(ptr: *mut T) -> Option<&'a mut Eslot> {
        if !ptr.is_null() {
            Some(&mut *(ptr as *mut Eslot).sub(1))
        } else {
            None
        }
    }
}

// default payload fits a captured fn pointer and a few words of state
const DEFAULT_PAYLOAD: usize = 4*size_of::<usize>();

const fn alignup_const(a: usize, align: usize) -> usize {
    (a + align-1) / align * align
}

/// Default per-slot footprint in bytes, header included
pub const EVENT_SIZE: usize =
    alignup_const(size_of::<Eslot>() + DEFAULT_PAYLOAD, Eslot::ALIGN);

/// Default queue buffer size in bytes, enough for 32 events
pub const QUEUE_SIZE: usize = 32*EVENT_SIZE;

/// Queue state guarded by the queue lock
struct Inner {
    // LIFO free list threaded through slot headers
    free: *mut Eslot,
    // pending queue, strictly ordered by deadline, FIFO among equals
    head: *mut Eslot,
    // current drain pass, gates period-0 events to one fire per pass
    pass: usize,
    brk: bool,

    // chain topology, chain_next and chain_sources are guarded by the
    // *target's* lock since they form the target's source list
    chain_target: *const Evq,
    chain_next: *const Evq,
    chain_sources: *const Evq,

    #[cfg(feature="alloc")]
    update: Option<Box<dyn FnMut(itick) + Send>>,
}

/// Event queue struct
pub struct Evq {
    // slab geometry, fixed at construction
    slab: *mut u8,
    slab_len: usize,
    slot_size: usize,
    count: usize,
    // id bits spent on the slot index
    npw2: u8,
    owned: Option<Layout>,

    inner: UnsafeCell<Inner>,
    lock: SysLock,
    clock: SysClock,
}

unsafe impl Send for Evq {}
unsafe impl Sync for Evq {}

impl fmt::Debug for Evq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evq")
            .field("slots", &self.count)
            .field("slot_size", &self.slot_size)
            .finish_non_exhaustive()
    }
}

impl Evq {
    /// Create a queue backed by the given buffer, with the default
    /// payload size per slot
    pub fn with_buffer(buffer: &'static mut [u8]) -> Result<Evq, Error> {
        unsafe {
            Evq::from_raw_parts(
                buffer.as_mut_ptr(), buffer.len(),
                DEFAULT_PAYLOAD, None
            )
        }
    }

    /// Create a queue backed by the given buffer, with room for payloads
    /// up to the given size in every slot
    pub fn with_slot_size(
        buffer: &'static mut [u8],
        payload: usize
    ) -> Result<Evq, Error> {
        unsafe {
            Evq::from_raw_parts(
                buffer.as_mut_ptr(), buffer.len(),
                payload, None
            )
        }
    }

    /// Create a queue with an internally allocated buffer of the given
    /// byte size
    ///
    /// Panics if the allocator fails or the size can't fit one event.
    #[cfg(feature="alloc")]
    pub fn with_size(size: usize) -> Evq {
        let layout = Layout::from_size_align(max(size, 1), Eslot::ALIGN)
            .expect("evq: queue size overflows a layout");
        let buffer = unsafe { alloc(layout) };
        if buffer.is_null() {
            handle_alloc_error(layout);
        }

        match unsafe {
            Evq::from_raw_parts(buffer, size, DEFAULT_PAYLOAD, Some(layout))
        } {
            Ok(q) => q,
            Err(_) => {
                unsafe { dealloc(buffer, layout) };
                panic!("evq: buffer too small for a single event");
            }
        }
    }

    /// Create a queue with the default buffer size, enough for 32 events
    #[cfg(feature="alloc")]
    pub fn new() -> Evq {
        Evq::with_size(QUEUE_SIZE)
    }
}

#[cfg(feature="alloc")]
impl Default for Evq {
    fn default() -> Self {
        Evq::new()
    }
}

impl Evq {

    unsafe fn from_raw_parts(
        buffer: *mut u8,
        len: usize,
        payload: usize,
        owned: Option<Layout>
    ) -> Result<Evq, Error> {
        // align the slab base
        let base = alignup(buffer as usize, Eslot::ALIGN);
        let skew = base - buffer as usize;
        if skew > len {
            return Err(Error::NoMem);
        }
        let len = len - skew;
        let slab = base as *mut u8;

        let slot_size = alignup(
            size_of::<Eslot>() + max(payload, size_of::<usize>()),
            Eslot::ALIGN
        );
        let count = len / slot_size;
        if count == 0 {
            return Err(Error::NoMem);
        }

        // thread every slot onto the free list in index order
        let mut next: *mut Eslot = ptr::null_mut();
        for i in (0..count).rev() {
            let e = slab.add(i*slot_size) as *mut Eslot;
            e.write(Eslot {
                next: next,
                prev: ptr::null_mut(),
                cb: None,
                drop: None,
                target: 0,
                period: -1,
                pass: 0,
                gen: 0,
                state: State::Free,
                cancelled: false,
            });
            next = e;
        }

        Ok(Evq {
            slab: slab,
            slab_len: len,
            slot_size: slot_size,
            count: count,
            npw2: npw2(count+1),
            owned: owned,

            inner: UnsafeCell::new(Inner {
                free: next,
                head: ptr::null_mut(),
                pass: 0,
                brk: false,

                chain_target: ptr::null(),
                chain_next: ptr::null(),
                chain_sources: ptr::null(),

                #[cfg(feature="alloc")]
                update: None,
            }),
            lock: SysLock::new(),
            clock: SysClock::new(),
        })
    }

    /// Access the queue's tick source, mostly useful for tests that need
    /// to skew the clock
    pub fn clock(&self) -> &SysClock {
        &self.clock
    }

    /// Millisecond counter underlying the queue, wraps at the tick width
    pub fn tick(&self) -> utick {
        self.clock.now()
    }

    // queue state, the caller must hold the queue lock
    #[allow(clippy::mut_from_ref)]
    unsafe fn inner(&self) -> &mut Inner {
        &mut *self.inner.get()
    }

    fn payload_size(&self) -> usize {
        self.slot_size - size_of::<Eslot>()
    }

    fn index_of(&self, e: *const Eslot) -> usize {
        (e as usize - self.slab as usize) / self.slot_size
    }

    fn contains_eslot(&self, e: *const Eslot) -> bool {
        let p = e as usize;
        p >= self.slab as usize && p < self.slab as usize + self.slab_len
    }

    // Id encoding, (gen << npw2(count+1)) | (index+1), the +1 keeps a
    // fully-zero id impossible
    fn id_of(&self, e: &Eslot) -> Id {
        let index = self.index_of(e) as u32;
        let raw = ((e.gen as u32) << self.npw2) | (index + 1);
        Id(unsafe { NonZeroU32::new_unchecked(raw) })
    }

    // decode an id back into its slot, requires the queue lock since it
    // reads the slot's live generation
    fn decode(&self, id: Id) -> Option<*mut Eslot> {
        let raw = id.0.get();
        let mask = (1u32 << self.npw2) - 1;
        let index = (raw & mask).checked_sub(1)? as usize;
        if index >= self.count {
            return None;
        }

        let e = unsafe { self.slab.add(index*self.slot_size) } as *mut Eslot;

        // compare generations modulo the bits that fit in the id
        let gen_bits = min(32 - self.npw2 as u32, 8*size_of::<ugen>() as u32);
        let gmask = (1u32 << gen_bits) - 1;
        if (unsafe { (*e).gen } as u32) & gmask != (raw >> self.npw2) & gmask {
            return None;
        }

        Some(e)
    }

    // Memory management
    fn alloc_eslot<'a>(&'a self, layout: Layout) -> Result<&'a mut Eslot, Error> {
        if layout.size() > self.payload_size()
            || layout.align() > Eslot::ALIGN
        {
            return Err(Error::NoMem);
        }

        let guard = self.lock.lock();
        let inner = unsafe { self.inner() };
        let e = inner.free;
        if e.is_null() {
            return Err(Error::NoMem);
        }
        let e = unsafe { &mut *e };
        inner.free = e.next;

        e.next = ptr::null_mut();
        e.prev = ptr::null_mut();
        e.cb = None;
        e.drop = None;
        e.target = 0;
        e.period = -1;
        e.pass = inner.pass.wrapping_sub(1);
        e.state = State::Staged;
        e.cancelled = false;
        drop(guard);

        Ok(e)
    }

    // run the slot's destructor and recycle it, the generation bump here
    // is what invalidates any outstanding id
    fn destroy_eslot(&self, e: &mut Eslot) {
        if let Some(dtor) = e.drop.take() {
            dtor(unsafe { e.as_mut_ptr() });
        }

        let guard = self.lock.lock();
        let inner = unsafe { self.inner() };
        e.gen = e.gen.wrapping_add(1);
        e.state = State::Free;
        e.prev = ptr::null_mut();
        e.next = inner.free;
        inner.free = e as *mut Eslot;
        drop(guard);
    }

    // Pending queue management, all of these require the queue lock
    //
    // insert ordered by deadline, FIFO among equal deadlines, which also
    // places periodic reschedules after their currently-due peers
    unsafe fn pending_insert(&self, inner: &mut Inner, e: *mut Eslot) {
        let mut prev: *mut Eslot = ptr::null_mut();
        let mut cur = inner.head;
        while !cur.is_null()
            && scmp((*cur).target, (*e).target) != Ordering::Greater
        {
            prev = cur;
            cur = (*cur).next;
        }

        (*e).next = cur;
        (*e).prev = prev;
        if !cur.is_null() {
            (*cur).prev = e;
        }
        if prev.is_null() {
            inner.head = e;
        } else {
            (*prev).next = e;
        }
        (*e).state = State::Pending;
    }

    unsafe fn pending_unlink(&self, inner: &mut Inner, e: *mut Eslot) {
        if (*e).prev.is_null() {
            inner.head = (*e).next;
        } else {
            (*(*e).prev).next = (*e).next;
        }
        if !(*e).next.is_null() {
            (*(*e).next).prev = (*e).prev;
        }
        (*e).next = ptr::null_mut();
        (*e).prev = ptr::null_mut();
    }

    // detach the head if it's due, refusing slots rescheduled in the
    // running pass so period-0 events fire once per pass
    unsafe fn pending_pop_due(&self, inner: &mut Inner, now: utick) -> *mut Eslot {
        let e = inner.head;
        if e.is_null()
            || sdiff((*e).target, now) > 0
            || (*e).pass == inner.pass
        {
            return ptr::null_mut();
        }

        self.pending_unlink(inner, e);
        (*e).state = State::Executing;
        e
    }

    // let the background timer know the next deadline moved, runs inside
    // the critical section so the update must not call back into the queue
    #[cfg(feature="alloc")]
    unsafe fn notify_head(&self, inner: &mut Inner, now: utick) {
        if let Some(update) = inner.update.as_mut() {
            let delta = if inner.head.is_null() {
                -1
            } else {
                max(sdiff((*inner.head).target, now), 0)
            };
            update(delta);
        }
    }

    #[cfg(not(feature="alloc"))]
    unsafe fn notify_head(&self, _inner: &mut Inner, _now: utick) {}

    // the common post path, converts the staged relative delay into an
    // absolute deadline, enqueues, and wakes the dispatcher
    unsafe fn post_eslot(&self, e: &mut Eslot, cb: fn(*mut u8)) -> Id {
        let guard = self.lock.lock();
        let inner = self.inner();
        let now = self.clock.now();

        e.cb = Some(cb);
        e.target = now.wrapping_add(e.target);
        e.pass = inner.pass.wrapping_sub(1);

        let id = self.id_of(e);
        self.pending_insert(inner, e as *mut Eslot);

        if ptr::eq(inner.head, e) {
            self.notify_head(inner, now);
        }
        let chained = inner.chain_target;
        drop(guard);

        // wake the dispatcher, and every dispatcher up the chain, any one
        // of them may be the one responsible for draining us
        self.clock.signal();
        let mut target = chained;
        while !target.is_null() {
            let t = &*target;
            t.clock.signal();

            let guard = t.lock.lock();
            target = t.inner().chain_target;
            drop(guard);
        }

        id
    }
}

impl Drop for Evq {
    fn drop(&mut self) {
        // unhook ourselves from any chain topology first
        self.unchain();
        loop {
            let guard = self.lock.lock();
            let inner = unsafe { self.inner() };
            let src = inner.chain_sources;
            if src.is_null() {
                drop(guard);
                break;
            }
            inner.chain_sources = unsafe { (*src).inner() }.chain_next;
            drop(guard);

            // orphan the source, it keeps its own events
            let src = unsafe { &*src };
            let guard = src.lock.lock();
            let sinner = unsafe { src.inner() };
            sinner.chain_target = ptr::null();
            sinner.chain_next = ptr::null();
            drop(guard);
        }

        // cancel everything still pending, running destructors
        let inner = self.inner.get_mut();
        let mut e = inner.head;
        inner.head = ptr::null_mut();
        while !e.is_null() {
            let next = unsafe { (*e).next };
            if let Some(dtor) = unsafe { (*e).drop.take() } {
                dtor(unsafe { (*e).as_mut_ptr() });
            }
            e = next;
        }

        #[cfg(feature="alloc")]
        if let Some(layout) = self.owned {
            unsafe { dealloc(self.slab, layout) };
        }
    }
}


/// A staged event: allocated on a queue, configured, but not yet posted
///
/// Dropping a staged event without posting returns its slot to the queue.
pub struct Event<'a, T> {
    q: &'a Evq,
    e: &'a mut Eslot,
    _phantom: PhantomData<T>,
}

impl<T> fmt::Debug for Event<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("q", &self.q)
            .finish_non_exhaustive()
    }
}

impl Evq {
    /// Allocate a staged event containing the given callable
    ///
    /// Fails with NoMem if the queue is out of slots or the callable
    /// doesn't fit a slot's payload.
    pub fn alloc<'a, T: Post + Send>(&'a self, t: T) -> Result<Event<'a, T>, Error> {
        fn drop_thunk<T>(p: *mut u8) {
            unsafe { ptr::drop_in_place(p as *mut T) };
        }

        let e = self.alloc_eslot(Layout::new::<T>())?;
        unsafe { e.as_mut_ptr::<T>().write(t) };
        e.drop = Some(drop_thunk::<T>);
        Ok(Event {
            q: self,
            e: e,
            _phantom: PhantomData,
        })
    }
}

impl<'a, T: Post> Event<'a, T> {
    /// Delay the event's first fire, out-of-range deltas saturate
    pub fn delay<D: TryIntoDelta>(self, delay: D) -> Self {
        let delta = delay.try_into_delta().unwrap_or(Delta::MAX);
        self.e.target = delta.uticks();
        self
    }

    /// Make the event periodic, a zero period refires once per drain
    /// pass, out-of-range deltas saturate
    pub fn period<D: TryIntoDelta>(self, period: D) -> Self {
        let delta = period.try_into_delta().unwrap_or(Delta::MAX);
        self.e.period = delta.ticks();
        self
    }

    /// Post the event, handing its slot to the queue
    pub fn post(self) -> Id {
        fn cb_thunk<T: Post>(p: *mut u8) {
            unsafe { &mut *(p as *mut T) }.post();
        }

        let id = unsafe { self.q.post_eslot(&mut *self.e, cb_thunk::<T>) };
        forget(self);
        id
    }
}

impl<T> Drop for Event<'_, T> {
    fn drop(&mut self) {
        // make sure we clean up if the event is never posted
        self.q.destroy_eslot(self.e);
    }
}

impl<T> Deref for Event<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.e.as_ref()
    }
}

impl<T> DerefMut for Event<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.e.as_mut()
    }
}

impl<T> AsRef<T> for Event<'_, T> {
    fn as_ref(&self) -> &T {
        self.e.as_ref()
    }
}

impl<T> AsMut<T> for Event<'_, T> {
    fn as_mut(&mut self) -> &mut T {
        self.e.as_mut()
    }
}

impl<T> Borrow<T> for Event<'_, T> {
    fn borrow(&self) -> &T {
        self.e.as_ref()
    }
}

impl<T> BorrowMut<T> for Event<'_, T> {
    fn borrow_mut(&mut self) -> &mut T {
        self.e.as_mut()
    }
}


impl Evq {
    // convenience functions

    /// Post a callable to run on the next dispatch
    pub fn call<F: PostOnce + Send>(&self, cb: F) -> Result<Id, Error> {
        Ok(self.alloc(Once::new(cb))?.post())
    }

    /// Post a callable to run after the given delay
    pub fn call_in<D: TryIntoDelta, F: PostOnce + Send>(
        &self,
        delay: D,
        cb: F
    ) -> Result<Id, Error> {
        Ok(self.alloc(Once::new(cb))?.delay(delay).post())
    }

    /// Post a callable to run repeatedly with the given period, the
    /// first fire lands one period from now
    pub fn call_every<D: TryIntoDelta + Copy, F: Post + Send>(
        &self,
        period: D,
        cb: F
    ) -> Result<Id, Error> {
        Ok(self.alloc(cb)?.delay(period).period(period).post())
    }
}


impl Evq {
    // Handling of raw allocations, these serve as the seam for foreign
    // callable adapters that can't go through the typed layer

    /// Reserve payload space for an event
    ///
    /// Returns null if the queue is out of slots or the layout doesn't
    /// fit a slot.
    pub unsafe fn alloc_raw(&self, layout: Layout) -> *mut u8 {
        match self.alloc_eslot(layout) {
            Ok(e) => e.as_mut_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Release an unposted raw allocation, running any registered
    /// destructor
    pub unsafe fn dealloc_raw(&self, p: *mut u8) {
        let e = match Eslot::from_mut_ptr(p) {
            Some(e) => e,
            None => return, // do nothing
        };
        debug_assert!(self.contains_eslot(e));

        self.destroy_eslot(e);
    }

    /// Does this payload pointer live in our slab?
    pub fn contains_raw(&self, p: *mut u8) -> bool {
        match unsafe { Eslot::from_mut_ptr(p) } {
            Some(e) => self.contains_eslot(e),
            None => false,
        }
    }

    /// Set a raw event's delay, call between alloc_raw and post_raw
    pub unsafe fn set_raw_delay(&self, p: *mut u8, delay: Delta) {
        let e = Eslot::from_mut_ptr::<u8>(p).unwrap();
        debug_assert!(self.contains_eslot(e));
        debug_assert!(e.state == State::Staged);
        e.target = delay.uticks();
    }

    /// Set a raw event's period, None means one-shot
    pub unsafe fn set_raw_period(&self, p: *mut u8, period: Option<Delta>) {
        let e = Eslot::from_mut_ptr::<u8>(p).unwrap();
        debug_assert!(self.contains_eslot(e));
        debug_assert!(e.state == State::Staged);
        e.period = match period {
            Some(delta) => delta.ticks(),
            None => -1,
        };
    }

    /// Register a destructor to run when the slot is recycled
    pub unsafe fn set_raw_drop(&self, p: *mut u8, drop: fn(*mut u8)) {
        let e = Eslot::from_mut_ptr::<u8>(p).unwrap();
        debug_assert!(self.contains_eslot(e));
        debug_assert!(e.state == State::Staged);
        e.drop = Some(drop);
    }

    /// Post a raw event, a null pointer from a failed alloc_raw is
    /// propagated as None
    pub unsafe fn post_raw(&self, p: *mut u8, cb: fn(*mut u8)) -> Option<Id> {
        let e = Eslot::from_mut_ptr::<u8>(p)?;
        debug_assert!(self.contains_eslot(e));
        Some(self.post_eslot(e, cb))
    }
}


impl Evq {
    /// Attempt to cancel an in-flight event
    ///
    /// Returns true if the event was unlinked before dispatching, and
    /// runs its destructor. Cancelling an already-executing event returns
    /// false but suppresses any further reschedule. A stale or invalid id
    /// is a no-op returning false.
    pub fn cancel(&self, id: Id) -> bool {
        let guard = self.lock.lock();
        let e = match self.decode(id) {
            Some(e) => e,
            None => return false,
        };
        let e = unsafe { &mut *e };

        match e.state {
            State::Pending => {
                let inner = unsafe { self.inner() };
                let was_head = ptr::eq(inner.head, e as *mut Eslot);
                unsafe { self.pending_unlink(inner, e as *mut Eslot) };
                e.state = State::Executing;
                if was_head {
                    let now = self.clock.now();
                    unsafe { self.notify_head(inner, now) };
                }
                drop(guard);

                self.destroy_eslot(e);
                true
            }
            State::Executing => {
                e.cancelled = true;
                false
            }
            _ => false,
        }
    }

    /// How long until the event with this id is due?
    ///
    /// Returns 0 if the event is due, executing, or the id is no longer
    /// valid.
    pub fn time_left(&self, id: Id) -> itick {
        let _guard = self.lock.lock();
        match self.decode(id) {
            Some(e) => {
                let e = unsafe { &*e };
                if e.state == State::Pending {
                    max(sdiff(e.target, self.clock.now()), 0)
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    /// Force the currently running dispatch to return
    ///
    /// In-flight events finish, the flag is observed between events. One
    /// break terminates exactly one dispatch call.
    pub fn break_dispatch(&self) {
        let guard = self.lock.lock();
        unsafe { self.inner() }.brk = true;
        drop(guard);

        self.clock.signal();
    }
}


impl Evq {
    // Dispatch

    // one pass over our due events, invoking callbacks outside the
    // critical section, returns early if a break is observed
    fn drain_pass(&self) -> Option<Dispatch> {
        let mut guard = self.lock.lock();
        let head_at_entry;
        let target_at_entry;
        {
            let inner = unsafe { self.inner() };
            inner.pass = inner.pass.wrapping_add(1);
            head_at_entry = inner.head;
            target_at_entry = if head_at_entry.is_null() {
                0
            } else {
                unsafe { (*head_at_entry).target }
            };
        }
        // a recycled slot can become head again with a new deadline, so
        // the head's deadline matters as much as its address
        let head_moved = |inner: &Inner| {
            inner.head != head_at_entry
                || (!inner.head.is_null()
                    && unsafe { (*inner.head).target } != target_at_entry)
        };

        loop {
            let inner = unsafe { self.inner() };
            if inner.brk {
                inner.brk = false;
                if head_moved(inner) {
                    let now = self.clock.now();
                    unsafe { self.notify_head(inner, now) };
                }
                drop(guard);
                return Some(Dispatch::Break);
            }

            let now = self.clock.now();
            let e = unsafe { self.pending_pop_due(inner, now) };
            if e.is_null() {
                if head_moved(inner) {
                    unsafe { self.notify_head(inner, now) };
                }
                drop(guard);
                return None;
            }
            let e = unsafe { &mut *e };
            drop(guard);

            // the event runs outside the critical section so it may post
            // freely, a delay-0 post lands in this same pass
            if let Some(cb) = e.cb {
                cb(unsafe { e.as_mut_ptr() });
            }

            guard = self.lock.lock();
            let inner = unsafe { self.inner() };
            if e.period >= 0 && !e.cancelled {
                // periodic, reschedule phase-locked to the original
                // deadline, a late pass skips to the first deadline
                // strictly past now
                e.target = e.target.wrapping_add(e.period as utick);
                if e.period > 0 {
                    let now = self.clock.now();
                    while sdiff(e.target, now) <= 0 {
                        e.target = e.target.wrapping_add(e.period as utick);
                    }
                }
                e.pass = inner.pass;
                unsafe { self.pending_insert(inner, e as *mut Eslot) };
            } else {
                drop(guard);
                self.destroy_eslot(e);
                guard = self.lock.lock();
            }
        }
    }

    // ticks until our own head is due, None if nothing is pending
    fn pending_delta(&self) -> Option<Delta> {
        let guard = self.lock.lock();
        let head = unsafe { self.inner() }.head;
        let delta = if head.is_null() {
            None
        } else {
            Delta::new(max(
                sdiff(unsafe { (*head).target }, self.clock.now()),
                0
            ))
        };
        drop(guard);
        delta
    }

    // ticks until anything in this queue or any chained source, however
    // deep, is due; cycles are rejected at install so the recursion is
    // bounded
    fn next_delta(&self) -> Option<Delta> {
        let mut delta = self.pending_delta();
        self.for_each_source(|src| {
            if let Some(d) = src.next_delta() {
                delta = Some(delta.map_or(d, |cur| min(cur, d)));
            }
        });
        delta
    }

    // walk our chained sources, the chain topology is configuration and
    // must be stable while dispatching
    fn for_each_source(&self, mut f: impl FnMut(&Evq)) {
        let guard = self.lock.lock();
        let mut src = unsafe { self.inner() }.chain_sources;
        drop(guard);

        while !src.is_null() {
            let s = unsafe { &*src };
            f(s);

            let guard = self.lock.lock();
            src = unsafe { s.inner() }.chain_next;
            drop(guard);
        }
    }

    /// Dispatch events for the given number of ticks
    ///
    /// A negative timeout dispatches forever, returning only on
    /// break_dispatch. A zero timeout drains whatever is currently due
    /// without waiting. A positive timeout computes its deadline once on
    /// entry and sleeps out any remaining budget.
    pub fn dispatch(&self, ms: itick) -> Dispatch {
        let deadline = if ms > 0 {
            Some(self.clock.now().wrapping_add(ms as utick))
        } else {
            None
        };

        loop {
            // drain chained sources first, their due events run as if
            // they were ours
            self.for_each_source(|src| {
                src.dispatch_ready();
            });

            if let Some(dispatch) = self.drain_pass() {
                return dispatch;
            }

            if ms == 0 {
                return Dispatch::Timeout;
            }

            // how long are we allowed to sleep? chained sources fold
            // their deadlines, transitively, into our budget
            let now = self.clock.now();
            let mut delta = self.next_delta();

            if let Some(deadline) = deadline {
                let left = sdiff(deadline, now);
                if left <= 0 {
                    return Dispatch::Timeout;
                }
                let left = Delta::new(left).unwrap_or(Delta::ZERO);
                delta = Some(delta.map_or(left, |cur| min(cur, left)));
            }

            // observe breaks before committing to a wait
            {
                let guard = self.lock.lock();
                let inner = unsafe { self.inner() };
                if inner.brk {
                    inner.brk = false;
                    return Dispatch::Break;
                }
                drop(guard);
            }

            match delta {
                Some(delta) => self.clock.wait_timeout(delta),
                None => self.clock.wait(),
            }
        }
    }

    /// Drain whatever is currently due and return without waiting
    pub fn dispatch_ready(&self) -> Dispatch {
        self.dispatch(0)
    }

    /// Dispatch events forever, returning only on break_dispatch
    pub fn dispatch_forever(&self) -> Dispatch {
        self.dispatch(-1)
    }
}


impl Evq {
    /// Chain this queue onto a target queue
    ///
    /// While chained, dispatching the target also drains this queue's due
    /// events and folds our head deadline into the target's sleep budget.
    /// Each queue keeps its own buffer and events. Passing None removes
    /// an existing chain. Chaining onto ourselves, or forming any larger
    /// cycle, fails with WouldCycle.
    ///
    /// Chain edges are raw pointers under the hood: both queues must stay
    /// at fixed addresses while chained. Dropping either queue unlinks it.
    pub fn chain(&self, target: Option<&Evq>) -> Result<(), Error> {
        // fail fast on cycles, walk the forward chain from the target
        if let Some(target) = target {
            let mut cur = target as *const Evq;
            while !cur.is_null() {
                if ptr::eq(cur, self) {
                    return Err(Error::WouldCycle);
                }
                let q = unsafe { &*cur };
                let guard = q.lock.lock();
                cur = unsafe { q.inner() }.chain_target;
                drop(guard);
            }
        }

        self.unchain();

        if let Some(target) = target {
            // splice ourselves into the target's source list, the list
            // links are guarded by the target's lock
            let guard = target.lock.lock();
            let tinner = unsafe { target.inner() };
            let sinner = unsafe { self.inner() };
            sinner.chain_next = tinner.chain_sources;
            tinner.chain_sources = self as *const Evq;
            drop(guard);

            let guard = self.lock.lock();
            unsafe { self.inner() }.chain_target = target as *const Evq;
            drop(guard);
        }

        Ok(())
    }

    // remove ourselves from our target's source list, if any
    fn unchain(&self) {
        let guard = self.lock.lock();
        let target = unsafe { self.inner() }.chain_target;
        drop(guard);
        if target.is_null() {
            return;
        }

        let target = unsafe { &*target };
        let guard = target.lock.lock();
        let tinner = unsafe { target.inner() };
        let us = self as *const Evq;
        if ptr::eq(tinner.chain_sources, us) {
            tinner.chain_sources = unsafe { self.inner() }.chain_next;
        } else {
            let mut cur = tinner.chain_sources;
            while !cur.is_null() {
                let cinner = unsafe { (*cur).inner() };
                if ptr::eq(cinner.chain_next, us) {
                    cinner.chain_next = unsafe { self.inner() }.chain_next;
                    break;
                }
                cur = cinner.chain_next;
            }
        }
        unsafe { self.inner() }.chain_next = ptr::null();
        drop(guard);

        let guard = self.lock.lock();
        unsafe { self.inner() }.chain_target = ptr::null();
        drop(guard);
    }

    /// Background this queue onto an external timer
    ///
    /// The update callback is invoked whenever the next deadline changes,
    /// with the ticks until the new head, or a negative value when the
    /// queue is empty and the timer can be disabled. It runs inside the
    /// queue's critical section and must not call back into the queue,
    /// typically it just reprograms a hardware timer whose interrupt
    /// later calls dispatch_ready. Passing None disables the mechanism.
    #[cfg(feature="alloc")]
    pub fn background<F: FnMut(itick) + Send + 'static>(
        &self,
        update: Option<F>
    ) {
        let update = update
            .map(|f| Box::new(f) as Box<dyn FnMut(itick) + Send>);

        let guard = self.lock.lock();
        let inner = unsafe { self.inner() };
        inner.update = update;
        if inner.update.is_some() {
            // prime the timer with the current deadline
            let now = self.clock.now();
            unsafe { self.notify_head(inner, now) };
        }
        drop(guard);
    }
}


/// Queue introspection
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Usage {
    pub slots_total: usize,
    pub slots_free: usize,
    pub slots_pending: usize,
    pub slot_size: usize,
}

impl Evq {
    pub fn usage(&self) -> Usage {
        let guard = self.lock.lock();
        let inner = unsafe { self.inner() };

        let mut slots_free = 0;
        let mut e = inner.free;
        while !e.is_null() {
            slots_free += 1;
            e = unsafe { (*e).next };
        }

        let mut slots_pending = 0;
        let mut e = inner.head;
        while !e.is_null() {
            slots_pending += 1;
            e = unsafe { (*e).next };
        }
        drop(guard);

        Usage {
            slots_total: self.count,
            slots_free: slots_free,
            slots_pending: slots_pending,
            slot_size: self.slot_size,
        }
    }
}

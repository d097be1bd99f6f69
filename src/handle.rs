//! Deferred callback records: `Handle` for `call_soon`-style FIFO work,
//! `TimerHandle` for `call_later`/`call_at`-style deadline work.
//!
//! Ground truth: no single teacher file owns this — it is the Rust
//! expression of §3's `Handle`/`TimerHandle` records, built the way the
//! teacher represents a registration (`registration.rs`: a cheap, clonable,
//! cancellable front for a shared inner cell) and scheduled the way its
//! `evloop::EventLoop` drains a ready list.

use std::cell::Cell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

/// A boxed, no-argument callback. Arguments are captured by the closure
/// itself (idiomatic Rust; the spec's `(cb, *args)` pair collapses to one
/// `FnOnce`).
pub type Callback = Box<dyn FnOnce()>;

struct Inner {
    callback: Cell<Option<Callback>>,
    cancelled: Cell<bool>,
}

/// A single deferred invocation on the loop thread. Cloning a `Handle`
/// shares the same cancellation flag and callback slot; running or
/// cancelling it through any clone affects all of them.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<Inner>,
}

impl Handle {
    pub fn new(callback: Callback) -> Handle {
        Handle {
            inner: Rc::new(Inner {
                callback: Cell::new(Some(callback)),
                cancelled: Cell::new(false),
            }),
        }
    }

    /// Marks the handle cancelled. Dispatch becomes a no-op; the callback,
    /// if still present, is dropped without running.
    pub fn cancel(&self) {
        self.inner.cancelled.set(true);
        self.inner.callback.set(None);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Runs the callback exactly once, unless cancelled. Subsequent calls
    /// (or calls on a cancelled handle) are no-ops.
    pub fn run(&self) {
        if self.inner.cancelled.get() {
            return;
        }
        if let Some(cb) = self.inner.callback.take() {
            cb();
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("cancelled", &self.inner.cancelled.get())
            .finish()
    }
}

/// A `Handle` additionally ordered by a monotonic deadline. Pushed into the
/// loop's timer min-heap; ties are broken by insertion `seq` so timers
/// scheduled in the same instant still fire in the order they were
/// registered (§3, §8).
#[derive(Clone)]
pub struct TimerHandle {
    pub when: Instant,
    seq: u64,
    handle: Handle,
}

impl TimerHandle {
    pub fn new(when: Instant, seq: u64, callback: Callback) -> TimerHandle {
        TimerHandle { when, seq, handle: Handle::new(callback) }
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn run(&self) {
        self.handle.run();
    }

    pub fn as_handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("when", &self.when)
            .field("seq", &self.seq)
            .field("cancelled", &self.handle.is_cancelled())
            .finish()
    }
}

/// `BinaryHeap` in `std` is a max-heap; reverse the ordering so the
/// earliest deadline (then lowest `seq`) sorts first when wrapped in
/// `std::cmp::Reverse`.
impl Ord for TimerHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.when.cmp(&other.when).then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for TimerHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for TimerHandle {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn cancelled_handle_never_runs() {
        let ran = Rc::new(RefCell::new(false));
        let ran2 = ran.clone();
        let h = Handle::new(Box::new(move || *ran2.borrow_mut() = true));
        h.cancel();
        h.run();
        assert!(!*ran.borrow());
    }

    #[test]
    fn handle_runs_exactly_once() {
        let count = Rc::new(RefCell::new(0));
        let count2 = count.clone();
        let h = Handle::new(Box::new(move || *count2.borrow_mut() += 1));
        h.run();
        h.run();
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn timer_ordering_breaks_ties_by_sequence() {
        let now = Instant::now();
        let a = TimerHandle::new(now, 0, Box::new(|| {}));
        let b = TimerHandle::new(now, 1, Box::new(|| {}));
        assert!(a < b);
    }
}

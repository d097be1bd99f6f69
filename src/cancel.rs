//! The plumbing behind cancellation propagation (§5, §8 scenario 5):
//! "a Task awaiting a Future cancels that Future transitively."
//!
//! Rust has no way to throw an exception into an arbitrary suspended
//! `async fn`, so propagation here works by walking an explicit chain of
//! "what am I currently awaiting" pointers down to the innermost leaf
//! [`crate::future::Future`] and cancelling *that* — which, through the
//! ordinary wake/poll cycle, unwinds back up through every `Task` in
//! between exactly the way a `?`-propagated error would. See SPEC_FULL.md
//! §9 and DESIGN.md for the recorded Open Question decision.

use std::cell::RefCell;
use std::rc::Rc;

/// Anything that can be asked to cancel itself and report completion:
/// implemented by the crate's `Future<T>` (the leaf case) and by `Task<T>`
/// (which forwards to whatever it's currently awaiting).
pub trait Cancellable {
    fn propagate_cancel(&self);
    fn is_done(&self) -> bool;
}

/// Anything that can record "I am now awaiting `child`": implemented by
/// `Task<T>`'s inner state so that when it polls another `Task` or
/// `Future`, that callee can register itself as the awaiter's current
/// dependency.
pub trait WaitingOnSink {
    fn record_waiting_on(&self, child: Rc<dyn Cancellable>);
}

thread_local! {
    /// Stack of tasks currently being stepped, innermost last. Populated
    /// only while a `Task::_step` is actively polling its coroutine;
    /// `Future::poll`/`Task::poll` consult the top entry to register
    /// themselves as that task's current dependency.
    static CURRENT_WAITER: RefCell<Vec<Rc<dyn WaitingOnSink>>> = RefCell::new(Vec::new());
}

/// Pushes `sink` as the active waiter for the duration of `f`. Used by
/// `Task::_step` to bracket the single poll of its coroutine.
pub fn with_current_waiter<R>(sink: Rc<dyn WaitingOnSink>, f: impl FnOnce() -> R) -> R {
    CURRENT_WAITER.with(|stack| stack.borrow_mut().push(sink));
    let result = f();
    CURRENT_WAITER.with(|stack| {
        stack.borrow_mut().pop();
    });
    result
}

/// Called from inside `Future::poll`/`Task::poll` to register `self` as
/// whatever the currently-stepping task is waiting on.
pub fn register_as_waited_on(child: Rc<dyn Cancellable>) {
    CURRENT_WAITER.with(|stack| {
        if let Some(top) = stack.borrow().last() {
            top.record_waiting_on(child);
        }
    });
}

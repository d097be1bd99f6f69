//! `Future<T>`: the single-assignment result cell of §3/§4.3.
//!
//! This is deliberately *not* `std::future::Future` — it is the crate's own
//! value type, modelling the asyncio-style state machine the specification
//! describes (`PENDING` → one of `RESULT`/`EXCEPTION`/`CANCELLED`, with an
//! ordered list of completion callbacks run through `call_soon`). It also
//! *implements* `std::future::Future` so it can be `.await`ed from inside a
//! `Task`'s coroutine — see `task.rs` and design note 9 in SPEC_FULL.md for
//! why that's the idiomatic seam rather than hand-rolling a coroutine
//! driver.

use std::cell::RefCell;
use std::fmt;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll as StdPoll, Waker};

use crate::cancel::{self, Cancellable};
use crate::error::Error;
use crate::event_loop::LoopHandle;
use log::error;

#[derive(Debug)]
enum State<T> {
    Pending,
    Result(T),
    Exception(Error),
    Cancelled,
}

impl<T> State<T> {
    fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }
}

type DoneCallback<T> = Box<dyn FnOnce(&Future<T>)>;

struct Inner<T> {
    state: State<T>,
    callbacks: Vec<DoneCallback<T>>,
    waker: Option<Waker>,
    loop_handle: LoopHandle,
    on_cancel: Option<Box<dyn FnOnce()>>,
    /// Set once anything has looked at the outcome (`result()`, a polled
    /// `.await`, or a registered done-callback). An `Exception` nobody ever
    /// observed is logged when the last reference drops (§7: "errors inside
    /// Tasks are stored on the Task's Future; if no observer consumes them,
    /// they are logged at Task destruction").
    observed: bool,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if !self.observed {
            if let State::Exception(e) = &self.state {
                error!("unhandled exception in dropped future: {e}");
            }
        }
    }
}

/// A single-assignment result cell with ordered completion callbacks.
///
/// Cloning shares the same underlying cell (it is reference-counted, not
/// deep-copied); all clones observe the same state transitions.
pub struct Future<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future { inner: self.inner.clone() }
    }
}

impl<T: 'static> Future<T> {
    pub fn new(loop_handle: LoopHandle) -> Future<T> {
        Future {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                callbacks: Vec::new(),
                waker: None,
                loop_handle,
                on_cancel: None,
                observed: false,
            })),
        }
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.inner.borrow().loop_handle.clone()
    }

    /// Registers a one-shot cleanup to run if this future is cancelled
    /// while still pending (e.g. `sleep` cancelling its underlying timer).
    /// Overwrites any previously set hook; combinators that need this only
    /// ever set it once, right after construction.
    pub fn set_cancel_hook(&self, hook: impl FnOnce() + 'static) {
        self.inner.borrow_mut().on_cancel = Some(Box::new(hook));
    }

    /// Resolves the future with a value. Fails with `InvalidState` if the
    /// future is already complete (§4.3).
    pub fn set_result(&self, value: T) -> Result<(), Error> {
        self.complete(State::Result(value))
    }

    /// Resolves the future with a failure. Fails with `InvalidState` if the
    /// future is already complete.
    pub fn set_exception(&self, exc: Error) -> Result<(), Error> {
        self.complete(State::Exception(exc))
    }

    /// Transitions `PENDING -> CANCELLED` and returns `true`; a no-op that
    /// returns `false` on an already-complete future (§8 idempotence).
    pub fn cancel(&self) -> bool {
        if !self.inner.borrow().state.is_pending() {
            return false;
        }
        let hook = self.inner.borrow_mut().on_cancel.take();
        if let Some(hook) = hook {
            hook();
        }
        self.complete(State::Cancelled).is_ok()
    }

    fn complete(&self, new_state: State<T>) -> Result<(), Error> {
        {
            let inner = self.inner.borrow();
            if !inner.state.is_pending() {
                return Err(Error::invalid_state("future already has a result or exception"));
            }
        }

        let (callbacks, waker, loop_handle) = {
            let mut inner = self.inner.borrow_mut();
            inner.state = new_state;
            let callbacks = std::mem::take(&mut inner.callbacks);
            let waker = inner.waker.take();
            (callbacks, waker, inner.loop_handle.clone())
        };

        for cb in callbacks {
            let this = self.clone();
            loop_handle.call_soon(Box::new(move || cb(&this)));
        }
        if let Some(w) = waker {
            w.wake();
        }
        Ok(())
    }

    pub fn done(&self) -> bool {
        !self.inner.borrow().state.is_pending()
    }

    pub fn cancelled(&self) -> bool {
        matches!(self.inner.borrow().state, State::Cancelled)
    }

    /// Registers a completion callback. If the future is already complete,
    /// it is scheduled via `call_soon` immediately rather than invoked
    /// in-line (§4.3: "adding a callback after completion schedules it
    /// immediately").
    pub fn add_done_callback(&self, cb: impl FnOnce(&Future<T>) + 'static) {
        self.inner.borrow_mut().observed = true;
        let already_done = !self.inner.borrow().state.is_pending();
        if already_done {
            let this = self.clone();
            let loop_handle = this.loop_handle();
            loop_handle.call_soon(Box::new(move || cb(&this)));
        } else {
            self.inner.borrow_mut().callbacks.push(Box::new(cb));
        }
    }

    /// Returns the stored outcome. `PENDING` is `InvalidState`, `CANCELLED`
    /// is `Error::Cancelled`, `EXCEPTION` re-raises the stored error.
    pub fn result(&self) -> Result<T, Error>
    where
        T: Clone,
    {
        let mut inner = self.inner.borrow_mut();
        inner.observed = true;
        match &inner.state {
            State::Pending => Err(Error::invalid_state("result() called on a pending future")),
            State::Result(v) => Ok(v.clone()),
            State::Exception(e) => Err(e.clone()),
            State::Cancelled => Err(Error::Cancelled),
        }
    }

    /// The stored failure, if any. `None` for `PENDING`, `RESULT`, and
    /// `CANCELLED` (cancellation is reported through `cancelled()`, not as
    /// an exception).
    pub fn exception(&self) -> Option<Error> {
        let mut inner = self.inner.borrow_mut();
        inner.observed = true;
        match &inner.state {
            State::Exception(e) => Some(e.clone()),
            _ => None,
        }
    }
}

impl<T: Clone + 'static> StdFuture for Future<T> {
    type Output = Result<T, Error>;

    /// Reads the state non-destructively (`T: Clone`) rather than taking it,
    /// so a `Future` that is both `.await`ed by a `Task` and independently
    /// inspected via `done()`/`result()` sees a consistent outcome either
    /// way — the single-assignment invariant of §3 must hold regardless of
    /// which API observes completion first.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> StdPoll<Self::Output> {
        cancel::register_as_waited_on(Rc::new(self.clone()) as Rc<dyn Cancellable>);
        let mut inner = self.inner.borrow_mut();
        match &inner.state {
            State::Pending => {
                inner.waker = Some(cx.waker().clone());
                StdPoll::Pending
            }
            State::Result(v) => {
                inner.observed = true;
                StdPoll::Ready(Ok(v.clone()))
            }
            State::Exception(e) => {
                let e = e.clone();
                inner.observed = true;
                StdPoll::Ready(Err(e))
            }
            State::Cancelled => {
                inner.observed = true;
                StdPoll::Ready(Err(Error::Cancelled))
            }
        }
    }
}

impl<T: 'static> Cancellable for Future<T> {
    fn propagate_cancel(&self) {
        self.cancel();
    }

    fn is_done(&self) -> bool {
        self.done()
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        let state = match &inner.state {
            State::Pending => "PENDING",
            State::Result(_) => "RESULT",
            State::Exception(_) => "EXCEPTION",
            State::Cancelled => "CANCELLED",
        };
        write!(f, "Future({})", state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;

    #[test]
    fn set_result_then_double_set_fails() {
        let ev = EventLoop::new().unwrap();
        let f: Future<i32> = Future::new(ev.handle());
        f.set_result(1).unwrap();
        assert!(f.done());
        assert!(matches!(f.set_result(2), Err(Error::InvalidState(_))));
    }

    #[test]
    fn cancel_on_pending_then_on_done_returns_false() {
        let ev = EventLoop::new().unwrap();
        let f: Future<i32> = Future::new(ev.handle());
        assert!(f.cancel());
        assert!(!f.cancel());
        assert!(f.cancelled());
    }

    #[test]
    fn done_callback_after_completion_runs_via_call_soon() {
        let mut ev = EventLoop::new().unwrap();
        let f: Future<i32> = Future::new(ev.handle());
        f.set_result(42).unwrap();

        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        f.add_done_callback(move |fut| {
            *seen2.borrow_mut() = Some(fut.result().unwrap());
        });

        assert!(seen.borrow().is_none(), "callback must not run inline");
        ev.run_until_idle();
        assert_eq!(*seen.borrow(), Some(42));
    }
}

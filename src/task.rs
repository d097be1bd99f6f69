//! `Task<T>`: drives an `async fn`/`async {}` coroutine to completion on
//! the loop, exposing the same single-assignment [`crate::future::Future`]
//! contract as any other awaitable (§4.4).
//!
//! Ground truth for the overall shape (a boxed `dyn Future` driven by a
//! hand-rolled single-threaded waker that reschedules via the loop's ready
//! queue) is the reactor/executor pairing in the retrieval pack's
//! `other_examples` stackless-coroutine file; the cancellation machinery is
//! new code built on [`crate::cancel`] because no teacher file needed it.

use std::cell::{Cell, RefCell};
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll as StdPoll, RawWaker, RawWakerVTable, Waker};

use crate::cancel::{self, Cancellable, WaitingOnSink};
use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::future::Future as LoomFuture;

type Coro<T> = Pin<Box<dyn StdFuture<Output = Result<T, Error>>>>;

struct TaskState<T: 'static> {
    coro: RefCell<Option<Coro<T>>>,
    result: LoomFuture<T>,
    must_cancel: Cell<bool>,
    scheduled: Cell<bool>,
    waiting_on: RefCell<Option<Rc<dyn Cancellable>>>,
    loop_handle: LoopHandle,
    /// Key into the loop's live-task registry, keeping this task running
    /// to completion even if every external `Task<T>` handle is dropped
    /// (SPEC_FULL.md §9 design note 9). Cleared once the task finishes.
    live_key: Cell<Option<usize>>,
}

/// A spawned coroutine. Cloning shares the same underlying task (cancelling
/// or awaiting any clone affects all of them); this mirrors `Future<T>`'s
/// own `Rc`-backed sharing.
pub struct Task<T: 'static> {
    state: Rc<TaskState<T>>,
}

impl<T: 'static> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task { state: self.state.clone() }
    }
}

impl<T: 'static> Task<T> {
    /// Spawns `coro` onto `loop_handle`'s loop. The first step is scheduled
    /// via `call_soon`, not run inline — a freshly spawned task never makes
    /// progress before the caller yields back to the loop (§4.4).
    pub fn spawn(loop_handle: LoopHandle, coro: impl StdFuture<Output = Result<T, Error>> + 'static) -> Task<T> {
        let state = Rc::new(TaskState {
            coro: RefCell::new(Some(Box::pin(coro))),
            result: LoomFuture::new(loop_handle.clone()),
            must_cancel: Cell::new(false),
            scheduled: Cell::new(false),
            waiting_on: RefCell::new(None),
            loop_handle: loop_handle.clone(),
            live_key: Cell::new(None),
        });
        let key = loop_handle.register_live_task(state.clone() as Rc<dyn Cancellable>);
        state.live_key.set(Some(key));
        let task = Task { state };
        task.schedule_step();
        task
    }

    fn release_live_key(&self) {
        if let Some(key) = self.state.live_key.take() {
            self.state.loop_handle.unregister_live_task(key);
        }
    }

    pub fn done(&self) -> bool {
        self.state.result.done()
    }

    pub fn cancelled(&self) -> bool {
        self.state.result.cancelled()
    }

    /// Requests cancellation (§5, §8 scenario 5). Returns `false` if the
    /// task is already complete. If the task is currently suspended awaiting
    /// something, cancellation is forwarded down to that dependency (which
    /// may itself be another `Task`, recursing further); otherwise
    /// `must_cancel` is set so the next step injects `Cancelled` without
    /// resuming the coroutine.
    pub fn cancel(&self) -> bool {
        if self.state.result.done() {
            return false;
        }
        self.state.must_cancel.set(true);
        let child = self.state.waiting_on.borrow().clone();
        match child {
            Some(c) if !c.is_done() => c.propagate_cancel(),
            _ => self.schedule_step(),
        }
        true
    }

    pub fn as_future(&self) -> LoomFuture<T>
    where
        T: Clone,
    {
        self.state.result.clone()
    }

    fn schedule_step(&self) {
        if self.state.scheduled.replace(true) {
            return;
        }
        let task = self.clone();
        self.state.loop_handle.call_soon(Box::new(move || task.step()));
    }

    /// One resumption: honors a pending cancellation request, otherwise
    /// polls the coroutine once under a waker that reschedules this step
    /// and records whatever the coroutine awaits as this task's current
    /// `waiting_on` dependency.
    fn step(&self) {
        self.state.scheduled.set(false);
        if self.state.result.done() {
            return;
        }

        if self.state.must_cancel.get() && self.state.coro.borrow().is_some() {
            let still_pending = self.state.waiting_on.borrow().as_ref().map(|c| !c.is_done()).unwrap_or(false);
            if !still_pending {
                self.state.coro.borrow_mut().take();
                let _ = self.state.result.cancel();
                self.release_live_key();
                return;
            }
        }

        let waker = make_waker(self.state.clone());
        let mut cx = Context::from_waker(&waker);

        let sink: Rc<dyn WaitingOnSink> = self.state.clone();
        let poll_result = {
            let mut coro_slot = self.state.coro.borrow_mut();
            let Some(coro) = coro_slot.as_mut() else { return };
            cancel::with_current_waiter(sink, || coro.as_mut().poll(&mut cx))
        };

        match poll_result {
            StdPoll::Pending => {}
            StdPoll::Ready(Ok(v)) => {
                self.state.coro.borrow_mut().take();
                let _ = self.state.result.set_result(v);
                self.release_live_key();
            }
            StdPoll::Ready(Err(Error::Cancelled)) => {
                self.state.coro.borrow_mut().take();
                let _ = self.state.result.cancel();
                self.release_live_key();
            }
            StdPoll::Ready(Err(e)) => {
                self.state.coro.borrow_mut().take();
                let _ = self.state.result.set_exception(e);
                self.release_live_key();
            }
        }
    }
}

impl<T: 'static> WaitingOnSink for TaskState<T> {
    fn record_waiting_on(&self, child: Rc<dyn Cancellable>) {
        *self.waiting_on.borrow_mut() = Some(child);
    }
}

impl<T: 'static> Cancellable for TaskState<T> {
    fn propagate_cancel(&self) {
        let child = self.waiting_on.borrow().clone();
        match child {
            Some(c) if !c.is_done() => c.propagate_cancel(),
            _ => {
                self.must_cancel.set(true);
            }
        }
    }

    fn is_done(&self) -> bool {
        self.result.done()
    }
}

impl<T: Clone + 'static> StdFuture for Task<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> StdPoll<Self::Output> {
        cancel::register_as_waited_on(self.state.clone() as Rc<dyn Cancellable>);
        let mut fut = self.state.result.clone();
        Pin::new(&mut fut).poll(cx)
    }
}

/// Blocks the loop until `task` completes, per §4.2's `run_until_complete`.
pub fn run_until_complete<T: Clone + 'static>(ev: &mut EventLoop, task: &Task<T>) -> Result<T, Error> {
    let handle = ev.handle();
    crate::runtime::with_current(handle.clone(), || {
        loop {
            if task.done() {
                return task.as_future().result();
            }
            // one real iteration of the loop's internal dispatch; reuse
            // `run_forever`'s stop-on-completion wiring by installing a
            // one-shot done callback that calls `stop()`.
            let stopper = handle.clone();
            task.as_future().add_done_callback(move |_| stopper.stop());
            ev.run_forever()?;
        }
    })
}

fn make_waker<T: 'static>(state: Rc<TaskState<T>>) -> Waker {
    let raw = RawWaker::new(Rc::into_raw(state) as *const (), waker_vtable::<T>());
    unsafe { Waker::from_raw(raw) }
}

// A single-threaded, `Rc`-based `RawWaker`. `std::task::Wake` requires
// `Send + Sync` on the waker payload (a `Waker` is meant to be passable
// across threads in general), but this executor never leaves its own
// thread, so the manual vtable is the idiomatic escape hatch rather than
// forcing an `Arc` and atomics the single-threaded loop never needs.
//
// Each monomorphization of `waker_vtable::<T>` gets its own static table
// (the function pointers below are themselves monomorphized per `T`);
// `RawWakerVTable::new` is a `const fn`, so the `&`-reference here is
// promoted to `'static` by the compiler rather than allocated per call.
fn waker_vtable<T: 'static>() -> &'static RawWakerVTable {
    &RawWakerVTable::new(clone_raw::<T>, wake_raw::<T>, wake_by_ref_raw::<T>, drop_raw::<T>)
}

unsafe fn clone_raw<T: 'static>(ptr: *const ()) -> RawWaker {
    let rc = unsafe { Rc::from_raw(ptr as *const TaskState<T>) };
    let cloned = rc.clone();
    std::mem::forget(rc);
    RawWaker::new(Rc::into_raw(cloned) as *const (), waker_vtable::<T>())
}

unsafe fn wake_raw<T: 'static>(ptr: *const ()) {
    let rc = unsafe { Rc::from_raw(ptr as *const TaskState<T>) };
    schedule_from_waker(rc);
}

unsafe fn wake_by_ref_raw<T: 'static>(ptr: *const ()) {
    let rc = unsafe { Rc::from_raw(ptr as *const TaskState<T>) };
    schedule_from_waker(rc.clone());
    std::mem::forget(rc);
}

unsafe fn drop_raw<T: 'static>(ptr: *const ()) {
    drop(unsafe { Rc::from_raw(ptr as *const TaskState<T>) });
}

/// Re-entering a step from a waker only has `Rc<TaskState<T>>`, not the
/// `Task<T>` handle, so it drives the state directly rather than calling
/// `Task::step` (which takes `&self` on the handle wrapper). The logic is
/// identical; `Task::step` is kept as the entry point used by `spawn` and
/// `cancel` because those already hold a `Task<T>`.
fn schedule_from_waker<T: 'static>(state: Rc<TaskState<T>>) {
    if state.result.done() {
        return;
    }
    if state.scheduled.replace(true) {
        return;
    }
    let cb_state = state.clone();
    state.loop_handle.clone().call_soon(Box::new(move || {
        Task { state: cb_state }.step();
    }));
}

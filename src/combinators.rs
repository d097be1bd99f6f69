//! Coroutine combinators built on top of [`crate::future::Future`] and
//! [`crate::task::Task`]: `sleep`, `wait` (with its three `return_when`
//! variants, restored from the tulip original per SPEC_FULL.md §10),
//! `gather`, and `shield`.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::future::Future as LoomFuture;
use crate::task::Task;

/// Suspends the calling coroutine for `delay`. Cancelling the awaiting
/// `Task` cancels this future, which cancels the underlying timer via the
/// cancel hook so it never fires after nobody's listening.
pub async fn sleep(loop_handle: LoopHandle, delay: Duration) -> Result<(), Error> {
    let f: LoomFuture<()> = LoomFuture::new(loop_handle.clone());
    let f2 = f.clone();
    let timer = loop_handle.call_later(delay, Box::new(move || {
        let _ = f2.set_result(());
    }));
    f.set_cancel_hook(move || timer.cancel());
    f.await
}

/// Which subset of `wait`'s futures must finish before it returns (restored
/// from the tulip original; the distilled spec only carried `gather`, but
/// this is exactly the kind of dropped-but-in-scope feature SPEC_FULL.md
/// §10 calls out to bring back).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnWhen {
    FirstCompleted,
    FirstException,
    AllCompleted,
}

/// Waits on a fixed set of already-spawned tasks, returning the `(done,
/// pending)` split once `return_when`'s condition is satisfied. Unlike
/// `gather`, `wait` never cancels the tasks that are still pending when it
/// returns — the caller decides what to do with them.
pub async fn wait<T: Clone + 'static>(
    loop_handle: LoopHandle,
    tasks: Vec<Task<T>>,
    return_when: ReturnWhen,
) -> Result<(Vec<Task<T>>, Vec<Task<T>>), Error> {
    if tasks.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let gate: LoomFuture<()> = LoomFuture::new(loop_handle.clone());
    let remaining = Rc::new(std::cell::Cell::new(tasks.len()));

    for t in &tasks {
        let gate = gate.clone();
        let remaining = remaining.clone();
        let is_err_or_cancel = {
            let t = t.clone();
            move || t.cancelled()
        };
        t.as_future().add_done_callback(move |fut| {
            if gate.done() {
                return;
            }
            remaining.set(remaining.get().saturating_sub(1));
            let satisfied = match return_when {
                ReturnWhen::AllCompleted => remaining.get() == 0,
                ReturnWhen::FirstCompleted => true,
                ReturnWhen::FirstException => fut.result().is_err() && !is_err_or_cancel(),
            };
            if satisfied || remaining.get() == 0 {
                let _ = gate.set_result(());
            }
        });
    }

    gate.await?;

    let mut done = Vec::new();
    let mut pending = Vec::new();
    for t in tasks {
        if t.done() {
            done.push(t);
        } else {
            pending.push(t);
        }
    }
    Ok((done, pending))
}

/// Runs every task to completion and collects results in input order. If
/// `return_exceptions` is `false` (the default in the distilled spec), the
/// first failure cancels every task still outstanding and `gather` itself
/// fails with that error; if `true`, failures are collected positionally
/// as `Err` values alongside the successes.
pub async fn gather<T: Clone + 'static>(
    loop_handle: LoopHandle,
    tasks: Vec<Task<T>>,
    return_exceptions: bool,
) -> Result<Vec<Result<T, Error>>, Error> {
    if tasks.is_empty() {
        return Ok(Vec::new());
    }

    let (done, pending) = wait(loop_handle, tasks.clone(), ReturnWhen::AllCompleted).await?;
    debug_assert!(pending.is_empty(), "AllCompleted wait must leave nothing pending");
    let _ = done;

    let mut results = Vec::with_capacity(tasks.len());
    let mut first_error = None;
    for t in &tasks {
        let r = t.as_future().result();
        if let Err(e) = &r {
            if !return_exceptions && first_error.is_none() {
                first_error = Some(e.clone());
            }
        }
        results.push(r);
    }

    if let Some(e) = first_error {
        for t in &tasks {
            t.cancel();
        }
        return Err(e);
    }
    Ok(results)
}

/// Returns one future per task, each resolving in *completion* order rather
/// than input order — awaiting `gates[0]` gets whichever task finishes
/// first, `gates[1]` the next, and so on (restored from the tulip original
/// alongside `wait`'s `return_when` variants; SPEC_FULL.md §10). Unlike
/// `gather`, a failing task does not cancel its siblings: its error is
/// simply what that slot resolves to.
pub fn as_completed<T: Clone + 'static>(
    loop_handle: LoopHandle,
    tasks: Vec<Task<T>>,
) -> Vec<LoomFuture<Result<T, Error>>> {
    let gates: Vec<LoomFuture<Result<T, Error>>> =
        (0..tasks.len()).map(|_| LoomFuture::new(loop_handle.clone())).collect();
    let next_idx = Rc::new(Cell::new(0usize));

    for t in tasks {
        let gates = gates.clone();
        let next_idx = next_idx.clone();
        t.as_future().add_done_callback(move |fut| {
            let idx = next_idx.get();
            next_idx.set(idx + 1);
            if let Some(gate) = gates.get(idx) {
                let _ = gate.set_result(fut.result());
            }
        });
    }

    gates
}

/// Prevents an outer cancellation from reaching `inner`: awaiting the
/// returned future propagates `inner`'s outcome, but cancelling the task
/// that's awaiting `shield(inner)` stops at the shield rather than forwarding
/// into `inner` (§8's shielding scenario).
pub async fn shield<T: Clone + 'static>(inner: Task<T>) -> Result<T, Error> {
    // Polling `inner` directly (rather than through `Task::poll`, which
    // registers itself as the caller's `waiting_on`) would still expose it
    // to propagation, so the shield instead subscribes via a done callback
    // and exposes a *plain* `Future` to the caller — a plain `Future` is a
    // leaf for cancellation purposes and doesn't forward into `inner`.
    let out: LoomFuture<T> = LoomFuture::new(inner.as_future().loop_handle());
    let out2 = out.clone();
    inner.as_future().add_done_callback(move |fut| {
        match fut.result() {
            Ok(v) => {
                let _ = out2.set_result(v);
            }
            Err(e) => {
                let _ = out2.set_exception(e);
            }
        }
    });
    out.await
}

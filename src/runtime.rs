//! The process-wide (thread-local, per §9's Open Question decision)
//! "current loop" accessor of §6: `new_event_loop`/`get_event_loop`/
//! `set_event_loop`.
//!
//! The implementation favors explicit `LoopHandle`s threaded through every
//! constructor in this crate — it composes better for tests and for
//! running more than one loop per process (one per supervised worker, say)
//! — while still offering this thread-local accessor for code that wants
//! asyncio-style ambient access. `EventLoop::run_forever` and
//! `task::run_until_complete` seed it for the duration of the run and
//! restore whatever was previously current when they return, so a loop
//! started from inside another loop's callback (nested, not concurrent —
//! this is still single-threaded cooperative scheduling per §5) doesn't
//! clobber its parent's entry.

use std::cell::RefCell;

use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};

thread_local! {
    static CURRENT_LOOP: RefCell<Option<LoopHandle>> = RefCell::new(None);
}

/// Constructs a fresh, unstarted event loop. Does not make it "current";
/// callers that want `get_event_loop()` to find it later must run it via
/// `run_forever`/`run_until_complete`, or call [`set_event_loop`] directly.
pub fn new_event_loop() -> Result<EventLoop, Error> {
    EventLoop::new()
}

/// The loop currently running on this thread, if any (or whichever loop
/// was last installed with [`set_event_loop`]).
pub fn get_event_loop() -> Option<LoopHandle> {
    CURRENT_LOOP.with(|c| c.borrow().clone())
}

pub fn set_event_loop(handle: Option<LoopHandle>) {
    CURRENT_LOOP.with(|c| *c.borrow_mut() = handle);
}

/// Installs `handle` as current for the duration of `f`, restoring the
/// previous entry (possibly `None`) afterward.
pub(crate) fn with_current<R>(handle: LoopHandle, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT_LOOP.with(|c| c.borrow_mut().replace(handle));
    let result = f();
    CURRENT_LOOP.with(|c| *c.borrow_mut() = previous);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_loop_is_seeded_and_restored() {
        assert!(get_event_loop().is_none());
        let mut ev = new_event_loop().unwrap();
        let handle = ev.handle();
        with_current(handle.clone(), || {
            assert!(get_event_loop().is_some());
        });
        assert!(get_event_loop().is_none());
        ev.close();
    }
}

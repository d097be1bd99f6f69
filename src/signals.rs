//! Process-wide signal plumbing backing `EventLoop::add_signal_handler` /
//! `remove_signal_handler` (§3 "signal handler table", §4.2, §8 scenario 6).
//!
//! A libc signal handler can only be a bare `extern "C" fn`, so it cannot
//! close over the loop's state directly. Ground truth for the shape this
//! takes — a process-wide flag set from the handler and drained by the loop
//! on its own thread — is the teacher's own self-pipe wakeup idea
//! (`sys/wakeup.rs`), generalized from "one wakeup source" to "one flag per
//! signal number sharing the same wakeup fd", which is how CPython's
//! `signal.set_wakeup_fd` (the mechanism the distilled spec's
//! `add_signal_handler` describes) is implemented.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::OnceLock;

use crate::error::Error;

const NSIG: i32 = 65;

static WAKEUP_FD: AtomicI32 = AtomicI32::new(-1);

fn pending_flags() -> &'static [AtomicBool] {
    static FLAGS: OnceLock<Vec<AtomicBool>> = OnceLock::new();
    FLAGS.get_or_init(|| (0..NSIG).map(|_| AtomicBool::new(false)).collect())
}

/// Async-signal-safe: only touches an atomic and issues a raw `write(2)`.
extern "C" fn dispatch(signum: libc::c_int) {
    if let Some(flag) = pending_flags().get(signum as usize) {
        flag.store(true, Ordering::SeqCst);
    }
    let fd = WAKEUP_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = 1u64.to_ne_bytes();
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, byte.len());
        }
    }
}

/// Points the signal handler's wakeup write at `fd` (the loop's self-pipe).
/// Safe to call repeatedly; the most recent caller wins.
pub fn set_wakeup_fd(fd: RawFd) {
    WAKEUP_FD.store(fd, Ordering::SeqCst);
}

pub fn clear_wakeup_fd() {
    WAKEUP_FD.store(-1, Ordering::SeqCst);
}

/// The fd the signal handler currently writes to on delivery, or `-1` if
/// none is armed. Exposed for tests to observe `add_signal_handler`/
/// `remove_signal_handler`'s wakeup-fd bookkeeping (§4.2, §8 scenario 6).
pub fn wakeup_fd() -> RawFd {
    WAKEUP_FD.load(Ordering::SeqCst)
}

/// Installs `dispatch` as the handler for `sig`. Fails with
/// `Error::Runtime` if the kernel rejects the signal number (§4.2:
/// `"sig N cannot be caught"`).
pub fn install(sig: i32) -> Result<(), Error> {
    if !(1..NSIG).contains(&sig) {
        return Err(Error::runtime(format!("sig {sig} cannot be caught")));
    }
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = dispatch as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = libc::SA_RESTART;
        if libc::sigaction(sig, &sa, std::ptr::null_mut()) == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINVAL) {
                return Err(Error::runtime(format!("sig {sig} cannot be caught")));
            }
            return Err(Error::Io(err));
        }
    }
    Ok(())
}

/// Restores `SIG_DFL` for `sig`. The tulip original special-cases SIGINT
/// with `default_int_handler` (raising `KeyboardInterrupt` back into
/// interpreted code); there is no interpreter-level equivalent to reinstate
/// here, and `SIG_DFL` on SIGINT already terminates the process exactly as
/// it did before any handler was installed, so it is used uniformly.
pub fn restore_default(sig: i32) -> Result<(), Error> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(sig, &sa, std::ptr::null_mut()) == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Drains every signal number whose flag fired since the last call,
/// clearing each as it's reported.
pub fn take_pending() -> Vec<i32> {
    let flags = pending_flags();
    let mut fired = Vec::new();
    for (sig, flag) in flags.iter().enumerate() {
        if flag.swap(false, Ordering::SeqCst) {
            fired.push(sig as i32);
        }
    }
    fired
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_signal() {
        assert!(install(0).is_err());
        assert!(install(NSIG).is_err());
    }

    #[test]
    fn take_pending_drains_and_resets() {
        pending_flags()[libc::SIGUSR1 as usize].store(true, Ordering::SeqCst);
        let fired = take_pending();
        assert!(fired.contains(&libc::SIGUSR1));
        assert!(take_pending().is_empty());
    }
}

//! Platform plumbing: the epoll-backed selector, the self-pipe wakeup
//! primitive, and a raw-fd wrapper shared by the pipe transports.

mod fd;
mod selector;
mod wakeup;

pub use fd::FileDesc;
pub use selector::{Event, Events, Selector};
pub use wakeup::Wakeup;

/// Turns a libc call's `-1` return into `io::Error::last_os_error()`.
/// Mirrors the teacher crate's `syscall!` convention (`sys/epoll.rs`,
/// `sys/socket.rs`) without the macro. `EINTR` is handled at each call site
/// (`Selector::select`'s retry loop) rather than here, since not every
/// caller wants automatic retry.
pub(crate) fn cvt(ret: libc::c_int) -> std::io::Result<libc::c_int> {
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

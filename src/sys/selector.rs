use std::cmp;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{c_int, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::ready::Ready;
use crate::token::Token;

/// A single readiness report: the token supplied at registration time and
/// the set of operations that became ready.
#[derive(Copy, Clone, Debug)]
pub struct Event {
    token: Token,
    readiness: Ready,
}

impl Event {
    fn new(readiness: Ready, token: Token) -> Event {
        Event { readiness, token }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn readiness(&self) -> Ready {
        self.readiness
    }
}

/// Buffer of raw epoll events filled in by [`Selector::select`]. Reused
/// across calls the same way the teacher's `sys::epoll::Events` is.
pub struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events { inner: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn get(&self, idx: usize) -> Option<Event> {
        self.inner.get(idx).map(|raw| {
            let epoll = raw.events as c_int;
            let mut kind = Ready::empty();

            if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
                kind |= Ready::readable();
            }
            if (epoll & EPOLLOUT) != 0 {
                kind |= Ready::writable();
            }
            if (epoll & EPOLLERR) != 0 {
                kind |= Ready::error();
            }
            if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
                kind |= Ready::hup();
            }

            Event::new(kind, Token(raw.u64 as usize))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }
}

/// `Selector::select` returns `AlreadyRegistered`/`NotRegistered` failures
/// as `io::Error`s of these kinds so the event loop can match on them
/// without a dedicated error type of its own (the OS already gives us
/// `EEXIST`/`ENOENT`, which epoll_ctl reports faithfully).
fn edge_triggered(interest: Ready) -> u32 {
    let mut kind = 0u32;
    if interest.is_readable() {
        kind |= EPOLLIN as u32;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT as u32;
    }
    kind | EPOLLET as u32
}

/// Thin wrapper around a Linux `epoll` instance. Ground truth: the teacher
/// crate's `sys::epoll::Epoll`, generalized to the `Selector` vocabulary of
/// the spec (`register`/`modify`/`unregister`/`select`) and to the oneshot
/// edge-triggered interest mask the event loop composes per fd.
pub struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = crate::sys::cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Selector { epfd })
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: edge_triggered(interest),
            u64: token.0 as u64,
        };
        crate::sys::cvt(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info) })
            .map(|_| ())
    }

    pub fn modify(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: edge_triggered(interest),
            u64: token.0 as u64,
        };
        crate::sys::cvt(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info) })
            .map(|_| ())
    }

    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        crate::sys::cvt(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info) })
            .map(|_| ())
    }

    /// Blocks until at least one registered fd is ready, `timeout` elapses,
    /// or a signal interrupts the wait (retried transparently, matching
    /// §7's "non-blocking transient errors are silent retries").
    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout
            .map(|d| cmp::min(d.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        events.inner.clear();
        loop {
            match crate::sys::cvt(unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.inner.as_mut_ptr(),
                    events.inner.capacity() as i32,
                    timeout_ms,
                )
            }) {
                Ok(n) => {
                    unsafe { events.inner.set_len(n as usize) };
                    return Ok(n as usize);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn register_and_wait_for_writable() {
        let (a, _b) = UnixStream::pair().unwrap();
        let sel = Selector::new().unwrap();
        sel.register(a.as_raw_fd(), Token(1), Ready::writable()).unwrap();

        let mut events = Events::with_capacity(8);
        let n = sel.select(&mut events, Some(Duration::from_millis(500))).unwrap();
        assert_eq!(n, 1);
        let ev = events.get(0).unwrap();
        assert_eq!(ev.token(), Token(1));
        assert!(ev.readiness().is_writable());
    }

    #[test]
    fn unregister_then_timeout() {
        let (a, _b) = UnixStream::pair().unwrap();
        let sel = Selector::new().unwrap();
        sel.register(a.as_raw_fd(), Token(1), Ready::writable()).unwrap();
        sel.unregister(a.as_raw_fd()).unwrap();

        let mut events = Events::with_capacity(8);
        let n = sel.select(&mut events, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(n, 0);
    }
}

//! `getaddrinfo`/`getnameinfo` (§4.2, §6): both are blocking libc calls, so
//! both are offloaded to the executor rather than given their own async
//! machinery — exactly what the distilled spec's "runs on the executor"
//! note describes, and the reason `executor.rs` exists at all.

use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::future::Future as LoomFuture;

/// Resolves `host:port` to every address the system's resolver returns,
/// preserving order (consumers needing "try each in turn" — `create_connection`'s
/// multi-address fallback — iterate the result themselves).
pub fn getaddrinfo(loop_handle: LoopHandle, host: String, port: u16) -> LoomFuture<Vec<SocketAddr>> {
    loop_handle.run_in_executor(None, move || {
        (host.as_str(), port)
            .to_socket_addrs()
            .map(|it| it.collect::<Vec<_>>())
            .map_err(Error::Io)
    })
}

/// Reverse-resolves `addr` to a `(host, service)` pair via `getnameinfo(3)`.
pub fn getnameinfo(loop_handle: LoopHandle, addr: SocketAddr) -> LoomFuture<(String, String)> {
    loop_handle.run_in_executor(None, move || raw_getnameinfo(addr))
}

fn raw_getnameinfo(addr: SocketAddr) -> Result<(String, String), Error> {
    use socket2::SockAddr;
    use std::os::raw::c_char;

    let sockaddr: SockAddr = addr.into();
    let mut host = [0 as c_char; libc::NI_MAXHOST as usize];
    let mut serv = [0 as c_char; libc::NI_MAXSERV as usize];

    let rc = unsafe {
        libc::getnameinfo(
            sockaddr.as_ptr(),
            sockaddr.len(),
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            serv.as_mut_ptr(),
            serv.len() as libc::socklen_t,
            0,
        )
    };

    if rc != 0 {
        return Err(Error::runtime(format!("getnameinfo failed with code {rc}")));
    }

    let host = unsafe { std::ffi::CStr::from_ptr(host.as_ptr()) }.to_string_lossy().into_owned();
    let serv = unsafe { std::ffi::CStr::from_ptr(serv.as_ptr()) }.to_string_lossy().into_owned();
    Ok((host, serv))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::time::Duration;

    #[test]
    fn resolves_localhost() {
        let mut ev = EventLoop::new().unwrap();
        let fut = getaddrinfo(ev.handle(), "localhost".to_string(), 0);
        let start = std::time::Instant::now();
        while !fut.done() && start.elapsed() < Duration::from_secs(2) {
            ev.run_until_idle();
            std::thread::sleep(Duration::from_millis(5));
        }
        let addrs = fut.result().expect("localhost should resolve");
        assert!(!addrs.is_empty());
    }
}

//! loomio: a single-threaded cooperative event loop for asynchronous I/O.
//!
//! The design mirrors the asyncio-style loop described by this crate's
//! specification: a ready queue of callbacks, a timer min-heap, an
//! epoll-backed selector, and transports/protocols layered on top of raw
//! non-blocking sockets. Everything runs on one OS thread; concurrency comes
//! from cooperative scheduling of [`task::Task`]s and [`future::Future`]s,
//! not from parallelism.
//!
//! ```no_run
//! use loomio::event_loop::EventLoop;
//! use loomio::{combinators, task};
//! use std::time::Duration;
//!
//! let mut ev = EventLoop::new().unwrap();
//! let handle = ev.handle();
//! let t = task::Task::spawn(handle.clone(), async move {
//!     combinators::sleep(handle, Duration::from_millis(10)).await
//! });
//! task::run_until_complete(&mut ev, &t).unwrap();
//! ```

#[macro_use]
extern crate log;

pub mod cancel;
pub mod combinators;
pub mod endpoints;
pub mod error;
pub mod event_loop;
pub mod executor;
pub mod future;
pub mod handle;
pub mod protocol;
pub mod ready;
pub mod resolve;
pub mod runtime;
pub mod signals;
pub mod socket_ops;
pub mod stream_helpers;
pub mod task;
pub mod transport;

mod sys;
mod token;

pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle, ThreadSafeHandle};
pub use future::Future;
pub use protocol::{DatagramProtocol, Protocol};
pub use ready::Ready;
pub use task::Task;

//! Transports (§4.5): non-blocking byte/datagram conduits that read from
//! and write to a socket or pipe, driving a [`crate::protocol::Protocol`] or
//! [`crate::protocol::DatagramProtocol`] in response. Grounded in the
//! teacher's `net::tcp`/`net::unix` (set-nonblocking-then-`Read`/`Write`)
//! generalized into the full state machine of §4.5: buffered writes,
//! backpressure, graceful close, and the `connection_made` /
//! `data_received`* / `eof_received`? / `connection_lost` callback sequence.

mod datagram;
mod pipe;
mod stream;
mod tls;

pub use datagram::DatagramTransport;
pub use pipe::{ReadPipeTransport, WritePipeTransport};
pub use stream::{RawStream, StreamTransport};
pub use tls::{TlsRole, TlsStreamTransport};

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// A type-erased `get_extra_info`/`set_extra_info` bag, shared by every
/// transport flavor (§3: "extra: mapping of string→arbitrary"). Values are
/// `Rc`-shared rather than cloned so storing something non-`Clone` (e.g. a
/// raw `Socket`) is still possible.
#[derive(Default)]
pub struct ExtraInfo {
    entries: RefCell<HashMap<String, Rc<dyn Any>>>,
}

impl ExtraInfo {
    pub fn new() -> ExtraInfo {
        ExtraInfo::default()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Any) {
        self.entries.borrow_mut().insert(name.into(), Rc::new(value));
    }

    /// Returns a clone of the stored value if present and of type `T`,
    /// otherwise `default`.
    pub fn get_or<T: Clone + 'static>(&self, name: &str, default: T) -> T {
        self.entries
            .borrow()
            .get(name)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
            .unwrap_or(default)
    }

    pub fn get<T: Clone + 'static>(&self, name: &str) -> Option<T> {
        self.entries.borrow().get(name).and_then(|v| v.downcast_ref::<T>()).cloned()
    }

    pub fn get_any(&self, name: &str) -> Option<Rc<dyn Any>> {
        self.entries.borrow().get(name).cloned()
    }
}

/// Past this many writes dropped after the transport entered its
/// post-`conn_lost` state, further drops stop being individually logged
/// (§10's "ambiguities flagged": observed empirically as five in the tulip
/// test suite; kept here as a named, tunable constant rather than a magic
/// number scattered through `stream.rs`/`datagram.rs`).
pub const WRITE_WARNING_THRESHOLD: u32 = 5;

/// The write-transport callback shape of §6, uniform across every flavor a
/// [`crate::protocol::Protocol`] can be registered on (plain stream, TLS).
/// Letting `connection_made` hand the protocol a `Rc<dyn TransportHandle>`
/// rather than a concrete `StreamTransport` is what lets `TlsStreamTransport`
/// sit behind the same `Protocol` contract without the stream transport
/// knowing TLS exists.
pub trait TransportHandle {
    fn write(&self, data: &[u8]);
    fn writelines(&self, lines: &[&[u8]]) {
        for line in lines {
            self.write(line);
        }
    }
    fn write_eof(&self);
    fn can_write_eof(&self) -> bool;
    fn pause_writing(&self);
    fn resume_writing(&self);
    fn discard_output(&self);
    fn get_extra_info_any(&self, name: &str) -> Option<Rc<dyn Any>>;
    fn abort(self: Rc<Self>);
    fn close(self: Rc<Self>);
}

//! Protocol callback contracts (§4.6, §6): the capability-set traits a
//! transport drives. Grounded in the teacher's `evloop::Handler` —
//! "a trait the loop calls back into on readiness" — generalized from one
//! `event()` method to the ordered `connection_made` /
//! `data_received`* / `eof_received`? / `connection_lost` sequence.

use crate::error::Error;
use crate::transport::TransportHandle;
use std::net::SocketAddr;
use std::rc::Rc;

/// Driven by a stream transport (TCP, Unix socket, or TLS-wrapped stream).
pub trait Protocol {
    /// Called once, synchronously scheduled via `call_soon`, when the
    /// transport is registered.
    fn connection_made(&mut self, _transport: Rc<dyn TransportHandle>) {}

    /// Called for every chunk read off the wire. Never called with an
    /// empty slice (`eof_received` covers that).
    fn data_received(&mut self, _data: &[u8]) {}

    /// Returning `true` keeps the transport half-open for writing after
    /// the peer's FIN; `false` (the default) closes it.
    fn eof_received(&mut self) -> bool {
        false
    }

    /// Called exactly once, terminally. `None` for a clean close.
    fn connection_lost(&mut self, _exc: Option<Error>) {}
}

/// Driven by a datagram transport (UDP).
pub trait DatagramProtocol {
    fn connection_made(&mut self) {}

    fn datagram_received(&mut self, _data: &[u8], _addr: SocketAddr) {}

    /// Only fires for a *connected* datagram socket; an unconnected one
    /// silently drops `ECONNREFUSED` (§4.5).
    fn connection_refused(&mut self, _exc: Error) {}

    fn connection_lost(&mut self, _exc: Option<Error>) {}
}

//! Unix pipe transports (§4.5): `ReadPipeTransport` delivers
//! `data_received`/`eof_received` from a raw fd (the read end of a pipe, or
//! a subprocess's stdout/stderr); `WritePipeTransport` is `StreamTransport`'s
//! write half without a paired reader, used for stdin.
//!
//! Ground truth: the teacher's `sys::fd::FileDesc` (a non-blocking raw-fd
//! wrapper) is the foundation both sit on; the buffered-write logic in
//! `WritePipeTransport` is `stream.rs`'s `write`/`try_flush`/`close` pair
//! with the reader half removed, since a pipe transport is one-directional.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

use log::{error, warn};

use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::protocol::Protocol;
use crate::ready::Ready;
use crate::sys::FileDesc;
use crate::transport::{ExtraInfo, TransportHandle, WRITE_WARNING_THRESHOLD};

struct ReadInner {
    fd: FileDesc,
    loop_handle: LoopHandle,
    protocol: RefCell<Option<Box<dyn Protocol>>>,
    lost_delivered: Cell<bool>,
    extra: ExtraInfo,
}

/// Delivers `data_received`/`eof_received` from a raw fd set non-blocking
/// (a pipe's read end, or a subprocess's stdout/stderr).
pub struct ReadPipeTransport {
    inner: Rc<ReadInner>,
}

impl Clone for ReadPipeTransport {
    fn clone(&self) -> Self {
        ReadPipeTransport { inner: self.inner.clone() }
    }
}

impl ReadPipeTransport {
    pub fn new(loop_handle: LoopHandle, fd: FileDesc, extra: ExtraInfo) -> io::Result<Rc<ReadPipeTransport>> {
        fd.set_nonblocking(true)?;
        let raw = fd.raw();
        let inner = Rc::new(ReadInner {
            fd,
            loop_handle: loop_handle.clone(),
            protocol: RefCell::new(None),
            lost_delivered: Cell::new(false),
            extra,
        });
        let transport = Rc::new(ReadPipeTransport { inner: inner.clone() });
        let reader = transport.clone();
        let registered = loop_handle.add_reader(raw, Rc::new(move |_ready: Ready| reader.read_ready()));
        if let Err(e) = registered {
            error!("ReadPipeTransport::new: failed to register reader for fd {raw}: {e}");
        }
        Ok(transport)
    }

    pub fn register_protocol(self: &Rc<Self>, protocol: Box<dyn Protocol>) {
        *self.inner.protocol.borrow_mut() = Some(protocol);
        let this = self.clone();
        self.inner.loop_handle.call_soon(Box::new(move || {
            let handle = this.clone() as Rc<dyn TransportHandle>;
            if let Some(p) = this.inner.protocol.borrow_mut().as_mut() {
                p.connection_made(handle);
            }
        }));
    }

    pub fn get_extra_info<T: Clone + 'static>(&self, name: &str, default: T) -> T {
        self.inner.extra.get_or(name, default)
    }

    pub fn close(self: &Rc<Self>) {
        self.force_close(None);
    }

    fn read_ready(self: &Rc<Self>) {
        let mut buf = [0u8; 8192];
        loop {
            let outcome = (&self.inner.fd).read(&mut buf);
            match outcome {
                Ok(0) => {
                    let keep_open = self
                        .inner
                        .protocol
                        .borrow_mut()
                        .as_mut()
                        .map(|p| p.eof_received())
                        .unwrap_or(false);
                    if !keep_open {
                        self.force_close(None);
                    }
                    return;
                }
                Ok(n) => {
                    if let Some(p) = self.inner.protocol.borrow_mut().as_mut() {
                        p.data_received(&buf[..n]);
                    }
                }
                Err(e) => {
                    let err = Error::Io(e);
                    if err.is_would_block() || err.is_interrupted() {
                        return;
                    }
                    error!("read pipe transport fatal error on fd {}: {err}", self.inner.fd.raw());
                    self.force_close(Some(err));
                    return;
                }
            }
        }
    }

    fn force_close(self: &Rc<Self>, exc: Option<Error>) {
        if self.inner.lost_delivered.replace(true) {
            return;
        }
        let _ = self.inner.loop_handle.remove_reader(self.inner.fd.raw());
        let inner = self.inner.clone();
        self.inner.loop_handle.call_soon(Box::new(move || {
            if let Some(p) = inner.protocol.borrow_mut().as_mut() {
                p.connection_lost(exc);
            }
        }));
    }
}

struct WriteInner {
    fd: FileDesc,
    loop_handle: LoopHandle,
    protocol: RefCell<Option<Box<dyn Protocol>>>,
    write_buffer: RefCell<VecDeque<u8>>,
    writer_registered: Cell<bool>,
    write_eof_pending: Cell<bool>,
    lost_delivered: Cell<bool>,
    dropped_writes: Cell<u32>,
    extra: ExtraInfo,
}

/// The write half of a pipe (a subprocess's stdin). Shares `stream.rs`'s
/// buffered-write/backpressure machinery; `write_eof`/`close` both close
/// the fd once the buffer drains rather than half-shutting a duplex socket.
pub struct WritePipeTransport {
    inner: Rc<WriteInner>,
}

impl Clone for WritePipeTransport {
    fn clone(&self) -> Self {
        WritePipeTransport { inner: self.inner.clone() }
    }
}

impl WritePipeTransport {
    pub fn new(loop_handle: LoopHandle, fd: FileDesc, extra: ExtraInfo) -> io::Result<Rc<WritePipeTransport>> {
        fd.set_nonblocking(true)?;
        let inner = Rc::new(WriteInner {
            fd,
            loop_handle,
            protocol: RefCell::new(None),
            write_buffer: RefCell::new(VecDeque::new()),
            writer_registered: Cell::new(false),
            write_eof_pending: Cell::new(false),
            lost_delivered: Cell::new(false),
            dropped_writes: Cell::new(0),
            extra,
        });
        Ok(Rc::new(WritePipeTransport { inner }))
    }

    pub fn register_protocol(self: &Rc<Self>, protocol: Box<dyn Protocol>) {
        *self.inner.protocol.borrow_mut() = Some(protocol);
        let this = self.clone();
        self.inner.loop_handle.call_soon(Box::new(move || {
            let handle = this.clone() as Rc<dyn TransportHandle>;
            if let Some(p) = this.inner.protocol.borrow_mut().as_mut() {
                p.connection_made(handle);
            }
        }));
    }

    pub fn get_extra_info<T: Clone + 'static>(&self, name: &str, default: T) -> T {
        self.inner.extra.get_or(name, default)
    }

    pub fn write(&self, data: &[u8]) {
        if self.inner.lost_delivered.get() {
            let dropped = self.inner.dropped_writes.get() + 1;
            self.inner.dropped_writes.set(dropped);
            if dropped <= WRITE_WARNING_THRESHOLD {
                warn!("write() on a write-pipe transport past connection_lost; dropping {} bytes", data.len());
            }
            return;
        }
        self.inner.write_buffer.borrow_mut().extend(data.iter().copied());
        self.try_flush();
    }

    /// Shuts the write half down once the buffer drains. A pipe has no
    /// half-close distinct from fully closing the fd, so this and `close`
    /// converge on the same terminal state (§4.5).
    pub fn write_eof(&self) {
        self.inner.write_eof_pending.set(true);
        if self.inner.write_buffer.borrow().is_empty() {
            self.force_close(None);
        }
    }

    pub fn close(self: &Rc<Self>) {
        self.write_eof();
    }

    pub fn abort(self: &Rc<Self>) {
        self.inner.write_buffer.borrow_mut().clear();
        self.force_close(None);
    }

    fn try_flush(&self) {
        loop {
            let chunk: Vec<u8> = {
                let buf = self.inner.write_buffer.borrow();
                if buf.is_empty() {
                    break;
                }
                buf.iter().copied().collect()
            };
            let outcome = (&self.inner.fd).write(&chunk);
            match outcome {
                Ok(0) => {
                    self.force_close(Some(Error::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write pipe transport write returned 0",
                    ))));
                    return;
                }
                Ok(n) => {
                    self.inner.write_buffer.borrow_mut().drain(..n);
                }
                Err(e) => {
                    let err = Error::Io(e);
                    if err.is_would_block() || err.is_interrupted() {
                        self.register_writer();
                        return;
                    }
                    self.force_close(Some(err));
                    return;
                }
            }
        }

        if self.inner.write_buffer.borrow().is_empty() && self.inner.write_eof_pending.get() {
            self.force_close(None);
        }
    }

    fn register_writer(&self) {
        if self.inner.writer_registered.replace(true) {
            return;
        }
        let fd = self.inner.fd.raw();
        let inner = self.inner.clone();
        let registered = self.inner.loop_handle.add_writer(
            fd,
            Rc::new(move |_ready: Ready| {
                inner.writer_registered.set(false);
                let _ = inner.loop_handle.remove_writer(fd);
                WritePipeTransport { inner: inner.clone() }.try_flush();
            }),
        );
        if let Err(e) = registered {
            warn!("failed to register writer for fd {fd}: {e}");
        }
    }

    fn force_close(&self, exc: Option<Error>) {
        if self.inner.lost_delivered.replace(true) {
            return;
        }
        let _ = self.inner.loop_handle.remove_writer(self.inner.fd.raw());
        let inner = self.inner.clone();
        self.inner.loop_handle.call_soon(Box::new(move || {
            if let Some(p) = inner.protocol.borrow_mut().as_mut() {
                p.connection_lost(exc);
            }
        }));
    }
}

impl TransportHandle for WritePipeTransport {
    fn write(&self, data: &[u8]) {
        WritePipeTransport::write(self, data)
    }

    fn write_eof(&self) {
        WritePipeTransport::write_eof(self)
    }

    fn can_write_eof(&self) -> bool {
        true
    }

    fn pause_writing(&self) {}

    fn resume_writing(&self) {}

    fn discard_output(&self) {
        self.inner.write_buffer.borrow_mut().clear();
    }

    fn get_extra_info_any(&self, name: &str) -> Option<Rc<dyn std::any::Any>> {
        self.inner.extra.get_any(name)
    }

    fn abort(self: Rc<Self>) {
        WritePipeTransport::abort(&self)
    }

    fn close(self: Rc<Self>) {
        WritePipeTransport::close(&self)
    }
}

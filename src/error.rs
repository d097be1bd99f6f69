//! Crate-wide error taxonomy.
//!
//! Mirrors the handful of failure kinds the event loop and its collaborators
//! can raise: invalid state transitions, cancellation, bad arguments, raw I/O
//! failures, aggregated multi-attempt failures, and runtime/signal errors.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A `Future` was asked to transition out of a state it isn't in: set a
    /// result twice, register two protocols on one transport, etc.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Delivered to `Task` coroutines that were cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Conflicting or malformed arguments (`host`+`sock`, mismatched address
    /// families, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Any kernel I/O failure.
    #[error("{0}")]
    Io(#[from] io::Error),

    /// All address candidates in a `create_connection` attempt failed.
    #[error("Multiple exceptions: {}", join_aggregate(.0))]
    Aggregate(Vec<Error>),

    /// Signal handling unsupported or the signal number is illegal.
    #[error("{0}")]
    Runtime(String),
}

fn join_aggregate(errs: &[Error]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    pub fn invalid_state(msg: &'static str) -> Error {
        Error::InvalidState(msg)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Error {
        Error::InvalidArgument(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Error {
        Error::Runtime(msg.into())
    }

    pub fn aggregate(errs: Vec<Error>) -> Error {
        debug_assert!(!errs.is_empty());
        if errs.len() == 1 {
            errs.into_iter().next().unwrap()
        } else {
            Error::Aggregate(errs)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// `true` for the non-blocking "try again" family: `EAGAIN`/`EWOULDBLOCK`
    /// and `EINTR`. Callers retry silently on these rather than treating them
    /// as fatal.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::Interrupted)
    }

    pub fn is_conn_reset(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::ConnectionReset)
    }

    pub fn is_conn_refused(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused)
    }
}

impl Clone for Error {
    fn clone(&self) -> Error {
        match self {
            Error::InvalidState(s) => Error::InvalidState(s),
            Error::Cancelled => Error::Cancelled,
            Error::InvalidArgument(s) => Error::InvalidArgument(s.clone()),
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::Aggregate(v) => Error::Aggregate(v.clone()),
            Error::Runtime(s) => Error::Runtime(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_one_collapses_to_the_single_error() {
        let err = Error::aggregate(vec![Error::runtime("err1")]);
        assert_eq!(err.to_string(), "err1");
    }

    #[test]
    fn aggregate_of_many_joins_with_the_spec_format() {
        let err = Error::aggregate(vec![Error::runtime("err1"), Error::runtime("err2")]);
        assert_eq!(err.to_string(), "Multiple exceptions: err1, err2");
    }

    #[test]
    fn io_kind_predicates_distinguish_transient_from_fatal() {
        let would_block = Error::Io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(would_block.is_would_block());
        assert!(!would_block.is_interrupted());

        let interrupted = Error::Io(io::Error::from(io::ErrorKind::Interrupted));
        assert!(interrupted.is_interrupted());
        assert!(!interrupted.is_would_block());

        let reset = Error::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_conn_reset());
        assert!(!reset.is_conn_refused());

        let refused = Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(refused.is_conn_refused());
        assert!(!refused.is_conn_reset());

        assert!(!Error::Cancelled.is_would_block());
    }
}

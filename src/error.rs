//! Error taxonomy
//!
//! Execution errors are never retried. They are classified so the verifier
//! can decide whether to surface them:
//!
//! - [`ErrorClass::NoActiveConnection`] / [`ErrorClass::SecureChannelClosed`]:
//!   benign churn from connection recycling in the middleware, skipped silently.
//! - [`ErrorClass::Unclassified`]: anything else, surfaced to the operator.
//!
//! Isolation violations are not errors; see [`crate::verifier::Outcome`].

use std::io::ErrorKind;
use thiserror::Error;

/// SQLSTATE class for connection exceptions (08000, 08003, 08006, ...)
const SQLSTATE_CONNECTION_EXCEPTION: &str = "08";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker {worker_id} failed to connect: {source}")]
    Connect {
        worker_id: usize,
        #[source]
        source: sqlx::Error,
    },
}

/// Classification of a failed round-trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The session has no live server connection behind it
    NoActiveConnection,
    /// The TLS channel was torn down underneath the session
    SecureChannelClosed,
    /// Any other execution failure
    Unclassified,
}

impl ErrorClass {
    /// Transient classes are expected noise and never reported
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorClass::NoActiveConnection | ErrorClass::SecureChannelClosed
        )
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::NoActiveConnection => write!(f, "no active connection"),
            ErrorClass::SecureChannelClosed => write!(f, "secure channel closed unexpectedly"),
            ErrorClass::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Classify an execution error by its structure rather than its wording.
///
/// `encrypted` says whether the session runs over TLS. `sqlx::Error::Tls`
/// is only raised by the handshake; once a TLS stream is up, a peer that
/// drops it without `close_notify` surfaces as an `UnexpectedEof` read, so
/// that kind is attributed to the secure channel on encrypted sessions.
pub fn classify(err: &sqlx::Error, encrypted: bool) -> ErrorClass {
    match err {
        sqlx::Error::Io(io) => match io.kind() {
            ErrorKind::UnexpectedEof if encrypted => ErrorClass::SecureChannelClosed,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => ErrorClass::NoActiveConnection,
            _ => ErrorClass::Unclassified,
        },
        sqlx::Error::Tls(_) => ErrorClass::SecureChannelClosed,
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => ErrorClass::NoActiveConnection,
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if code.starts_with(SQLSTATE_CONNECTION_EXCEPTION) => {
                ErrorClass::NoActiveConnection
            }
            _ => ErrorClass::Unclassified,
        },
        _ => ErrorClass::Unclassified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_disconnects_are_transient() {
        for kind in [
            ErrorKind::ConnectionReset,
            ErrorKind::ConnectionAborted,
            ErrorKind::BrokenPipe,
            ErrorKind::NotConnected,
            ErrorKind::UnexpectedEof,
        ] {
            let err = sqlx::Error::Io(io::Error::new(kind, "gone"));
            assert_eq!(classify(&err, false), ErrorClass::NoActiveConnection, "{:?}", kind);
            assert!(classify(&err, false).is_transient());
        }
    }

    #[test]
    fn test_tls_error_is_secure_channel_closed() {
        let err = sqlx::Error::Tls("handshake failed".into());
        assert_eq!(classify(&err, false), ErrorClass::SecureChannelClosed);
        assert!(classify(&err, false).is_transient());
    }

    #[test]
    fn test_eof_on_encrypted_session_is_secure_channel_closed() {
        let eof = || sqlx::Error::Io(io::Error::new(ErrorKind::UnexpectedEof, "eof"));
        assert_eq!(classify(&eof(), true), ErrorClass::SecureChannelClosed);
        assert_eq!(classify(&eof(), false), ErrorClass::NoActiveConnection);

        let reset = sqlx::Error::Io(io::Error::new(ErrorKind::ConnectionReset, "reset"));
        assert_eq!(classify(&reset, true), ErrorClass::NoActiveConnection);
    }

    #[test]
    fn test_pool_closed_is_transient() {
        assert!(classify(&sqlx::Error::PoolClosed, false).is_transient());
        assert!(classify(&sqlx::Error::WorkerCrashed, false).is_transient());
    }

    #[test]
    fn test_other_errors_are_unclassified() {
        let protocol = sqlx::Error::Protocol("unexpected message".to_string());
        assert_eq!(classify(&protocol, true), ErrorClass::Unclassified);
        assert!(!classify(&protocol, true).is_transient());

        let timeout = sqlx::Error::Io(io::Error::new(ErrorKind::TimedOut, "slow"));
        assert_eq!(classify(&timeout, true), ErrorClass::Unclassified);

        assert_eq!(classify(&sqlx::Error::RowNotFound, false), ErrorClass::Unclassified);
    }

    #[test]
    fn test_connect_error_display() {
        let err = ProbeError::Connect {
            worker_id: 7,
            source: sqlx::Error::PoolTimedOut,
        };
        assert!(err.to_string().starts_with("Worker 7 failed to connect"));
    }
}

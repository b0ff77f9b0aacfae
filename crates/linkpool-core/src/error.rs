//! Error types for linkpool

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error produced by a connection: while dialing, during an operation the
/// caller performed on it, or while closing it.
///
/// The health classifier inspects this type to decide whether a connection
/// that produced it can go back into the pool.
#[derive(Error, Debug)]
pub enum ConnError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A network timeout. `temporary` is false when the transport also
    /// reports the connection as permanently broken.
    #[error("network timeout (temporary: {temporary})")]
    Timeout { temporary: bool },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("{0}")]
    Other(String),
}

impl ConnError {
    /// Build an error from any displayable message.
    pub fn other(msg: impl Into<String>) -> Self {
        ConnError::Other(msg.into())
    }

    /// Returns `Some(temporary)` when this error is a network timeout.
    ///
    /// I/O errors of kind `TimedOut` or `WouldBlock` (what socket read/write
    /// deadlines surface as) count as temporary timeouts.
    pub fn timeout_kind(&self) -> Option<bool> {
        match self {
            ConnError::Timeout { temporary } => Some(*temporary),
            ConnError::Io(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Some(true)
            }
            _ => None,
        }
    }

    /// Check if this error is a cancellation or an elapsed deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ConnError::Cancelled | ConnError::DeadlineExceeded)
    }
}

impl From<tokio::time::error::Elapsed> for ConnError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ConnError::DeadlineExceeded
    }
}

/// Result type alias for connection operations
pub type ConnResult<T> = std::result::Result<T, ConnError>;

/// Error returned by pool operations
#[derive(Error, Debug)]
pub enum PoolError {
    /// The dialer failed to establish a new connection.
    #[error("failed to dial connection: {0}")]
    Dial(#[source] ConnError),

    /// No capacity became available before the acquire timeout elapsed or the
    /// caller cancelled.
    #[error("connection pool exhausted: {reason} after {waited:?}")]
    Exhausted { reason: ExhaustReason, waited: Duration },

    /// The pool has been shut down.
    #[error("connection pool is closed")]
    Closed,

    /// The callback passed to `with_connection` failed.
    #[error("operation failed: {0}")]
    Operation(#[from] ConnError),

    /// One or more connections failed to close during shutdown.
    #[error("failed to close {} connection(s)", .0.len())]
    Close(Vec<ConnError>),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Check if this error means the pool was saturated, as opposed to the
    /// remote being unreachable.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, PoolError::Exhausted { .. })
    }

    /// Check if this error came from the dialer.
    pub fn is_dial(&self) -> bool {
        matches!(self, PoolError::Dial(_))
    }
}

/// Why an acquire gave up waiting for capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustReason {
    /// The pool-acquire timeout elapsed.
    Timeout,
    /// The caller's cancellation token fired.
    Cancelled,
}

impl std::fmt::Display for ExhaustReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExhaustReason::Timeout => write!(f, "timed out"),
            ExhaustReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result type alias for pool operations
pub type PoolResult<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_kind() {
        assert_eq!(ConnError::Timeout { temporary: true }.timeout_kind(), Some(true));
        assert_eq!(ConnError::Timeout { temporary: false }.timeout_kind(), Some(false));

        let io_timeout = ConnError::from(io::Error::new(io::ErrorKind::TimedOut, "read"));
        assert_eq!(io_timeout.timeout_kind(), Some(true));

        let reset = ConnError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(reset.timeout_kind(), None);
        assert_eq!(ConnError::Cancelled.timeout_kind(), None);
    }

    #[test]
    fn test_is_cancellation() {
        assert!(ConnError::Cancelled.is_cancellation());
        assert!(ConnError::DeadlineExceeded.is_cancellation());
        assert!(!ConnError::other("boom").is_cancellation());
    }

    #[tokio::test]
    async fn test_elapsed_maps_to_deadline() {
        let elapsed = tokio::time::timeout(Duration::ZERO, std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(matches!(ConnError::from(elapsed), ConnError::DeadlineExceeded));
    }

    #[test]
    fn test_pool_error_kinds() {
        let exhausted = PoolError::Exhausted {
            reason: ExhaustReason::Timeout,
            waited: Duration::from_millis(50),
        };
        assert!(exhausted.is_exhausted());
        assert!(!exhausted.is_dial());
        assert!(exhausted.to_string().contains("timed out"));

        let dial = PoolError::Dial(ConnError::other("refused"));
        assert!(dial.is_dial());
        assert!(!dial.is_exhausted());

        let close = PoolError::Close(vec![ConnError::Cancelled, ConnError::DeadlineExceeded]);
        assert_eq!(close.to_string(), "failed to close 2 connection(s)");
    }
}

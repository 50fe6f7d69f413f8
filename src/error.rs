//! Unified error types for the charting core.

use thiserror::Error;

/// Top-level error.
///
/// All variants are `Clone` so a single connect outcome can be fanned out to
/// every caller waiting on the same in-flight attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    /// Connectivity problem — retried and failed over transparently, surfaced
    /// only once retries are exhausted.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Malformed or error-bearing response. Not retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Domain validation failure (zero price, empty history, ...).
    /// Never triggers failover.
    #[error("data error: {0}")]
    Data(String),

    /// All retry attempts consumed; carries the last underlying error.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: Box<RpcError>,
    },
}

/// Connection-layer errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// The transport did not signal readiness within the handshake timeout.
    #[error("handshake timed out")]
    Timeout,

    #[error("not connected")]
    NotConnected,

    /// A sent request got no matching response within the request timeout.
    #[error("request timed out")]
    RequestTimeout,

    #[error("connection closed: code={code:?} reason={reason}")]
    Closed { code: Option<u16>, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    /// Every endpoint in one full rotation failed to connect.
    #[error("all nodes failed")]
    AllNodesFailed,
}

impl RpcError {
    /// Whether this error is connection-class, i.e. eligible for
    /// retry/failover. Protocol and data errors are not.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, RpcError::Connection(_))
    }
}

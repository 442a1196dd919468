//! Error types for tungate
//!
//! Errors are categorized by subsystem: DNS transactions carry a
//! [`QueryStatus`], proxy dialing has its own hierarchy, and flow-engine
//! failures map onto the summary messages the embedder sees.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for tungate
#[derive(Debug, Error)]
pub enum TungateError {
    /// DNS transaction errors
    #[error("DNS error: {0}")]
    Dns(#[from] QueryError),

    /// Proxy registry and dialing errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Flow engine errors
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// State of a DNS transaction, carried in the summary and on errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    /// Transaction started
    #[default]
    Start,
    /// Transaction completed successfully
    Complete,
    /// Failed to send query
    SendFailed,
    /// Got no response
    NoResponse,
    /// Malformed input
    BadQuery,
    /// Response was invalid or oversize
    BadResponse,
    /// This should never happen
    InternalError,
    /// Transport has issues
    TransportError,
}

impl QueryStatus {
    /// Numeric code reported to the embedder.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Start => 0,
            Self::Complete => 1,
            Self::SendFailed => 2,
            Self::NoResponse => 3,
            Self::BadQuery => 4,
            Self::BadResponse => 5,
            Self::InternalError => 6,
            Self::TransportError => 7,
        }
    }
}

/// A failed (or partially failed) DNS transaction.
///
/// The ALG reports a *soft* error when it succeeded without rewriting
/// anything: `response` is attached and callers treat the error as success.
#[derive(Debug, Error)]
#[error("query failed ({status:?}): {reason}")]
pub struct QueryError {
    status: QueryStatus,
    reason: String,
    response: Option<Vec<u8>>,
}

impl QueryError {
    fn new(status: QueryStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            response: None,
        }
    }

    /// Malformed query wire.
    pub fn bad_query(reason: impl Into<String>) -> Self {
        Self::new(QueryStatus::BadQuery, reason)
    }

    /// Transport returned garbage or an oversize message.
    pub fn bad_response(reason: impl Into<String>) -> Self {
        Self::new(QueryStatus::BadResponse, reason)
    }

    /// Query could not be sent.
    pub fn send_failed(reason: impl Into<String>) -> Self {
        Self::new(QueryStatus::SendFailed, reason)
    }

    /// No response arrived.
    pub fn no_response(reason: impl Into<String>) -> Self {
        Self::new(QueryStatus::NoResponse, reason)
    }

    /// Invariant violation.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(QueryStatus::InternalError, reason)
    }

    /// Transport-level failure (missing transport, protocol error).
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::new(QueryStatus::TransportError, reason)
    }

    /// ALG soft error: the transaction succeeded but nothing was rewritten.
    /// The untouched answer rides along; callers treat this as success.
    pub fn alg_soft(reason: impl Into<String>, response: Vec<u8>) -> Self {
        Self {
            status: QueryStatus::Complete,
            reason: reason.into(),
            response: Some(response),
        }
    }

    /// Status of the failed transaction.
    #[must_use]
    pub const fn status(&self) -> QueryStatus {
        self.status
    }

    /// True when an answer is attached (the ALG soft-error contract).
    #[must_use]
    pub const fn is_alg_soft(&self) -> bool {
        self.response.is_some()
    }

    /// Take the attached answer, if any.
    pub fn take_response(&mut self) -> Option<Vec<u8>> {
        self.response.take()
    }

    /// Whether retrying the transaction could help.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self.status,
            QueryStatus::SendFailed | QueryStatus::NoResponse | QueryStatus::TransportError
        )
    }
}

/// Proxy registry and dialing errors
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No proxy registered under the requested id
    #[error("proxy not found: {id}")]
    NotFound { id: String },

    /// Dial through the proxy failed
    #[error("dial {addr} via {id} failed: {reason}")]
    DialFailed {
        id: String,
        addr: SocketAddr,
        reason: String,
    },

    /// The Block proxy refused the dial (sentinel)
    #[error("connection blocked")]
    Blocked,

    /// The proxy has been stopped
    #[error("proxy {id} stopped")]
    Stopped { id: String },

    /// The proxy returned a connection that is neither TCP nor UDP
    #[error("not a tcp/udp proxy conn")]
    NotProxyConn,

    /// I/O error while dialing
    #[error("proxy I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Create a dial failure for `id` to `addr`.
    pub fn dial(id: impl Into<String>, addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::DialFailed {
            id: id.into(),
            addr,
            reason: reason.into(),
        }
    }

    /// Whether retrying the dial (possibly at another address) could help.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::Blocked | Self::Stopped { .. } | Self::NotProxyConn => {
                false
            }
            Self::DialFailed { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Flow engine errors; their display strings are the summary messages.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Policy decision was BLOCK
    #[error("{proto}: firewalled")]
    Firewalled { proto: &'static str },

    /// Proxy dial failed or its conn could not be narrowed to TCP/UDP
    #[error("{proto}: could not create conn")]
    SetupFailed { proto: &'static str },

    /// Stack-side SYN-ACK could not complete
    #[error("tcp: handshake failed")]
    HandshakeFailed,

    /// Remote read failed
    #[error("udp: remote read fail")]
    ReadFailed,

    /// Global tunnel end flag observed
    #[error("{proto}: end")]
    Ended { proto: &'static str },

    /// No NAT entry for an egress datagram
    #[error("udp: no nat mapping")]
    NoNatMapping,

    /// I/O error during splicing
    #[error("flow I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FlowError {
    /// BLOCK decision for a TCP flow.
    #[must_use]
    pub const fn tcp_firewalled() -> Self {
        Self::Firewalled { proto: "tcp" }
    }

    /// BLOCK decision for a UDP flow.
    #[must_use]
    pub const fn udp_firewalled() -> Self {
        Self::Firewalled { proto: "udp" }
    }

    /// Whether the error is transient.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_status_codes() {
        assert_eq!(QueryStatus::Start.code(), 0);
        assert_eq!(QueryStatus::Complete.code(), 1);
        assert_eq!(QueryStatus::TransportError.code(), 7);
    }

    #[test]
    fn test_alg_soft_error() {
        let mut err = QueryError::alg_soft("no rewritable records", vec![1, 2, 3]);
        assert!(err.is_alg_soft());
        assert_eq!(err.status(), QueryStatus::Complete);
        assert_eq!(err.take_response(), Some(vec![1, 2, 3]));
        assert!(!err.is_alg_soft());
    }

    #[test]
    fn test_hard_query_errors_carry_no_response() {
        let err = QueryError::bad_query("truncated header");
        assert!(!err.is_alg_soft());
        assert_eq!(err.status(), QueryStatus::BadQuery);
        assert!(!err.is_recoverable());
        assert!(QueryError::send_failed("eperm").is_recoverable());
    }

    #[test]
    fn test_firewalled_messages() {
        assert_eq!(FlowError::tcp_firewalled().to_string(), "tcp: firewalled");
        assert_eq!(FlowError::udp_firewalled().to_string(), "udp: firewalled");
    }

    #[test]
    fn test_proxy_error_recovery() {
        let addr: SocketAddr = "93.184.216.34:443".parse().unwrap();
        assert!(ProxyError::dial("Base", addr, "timed out").is_recoverable());
        assert!(!ProxyError::Blocked.is_recoverable());
        assert!(!ProxyError::NotFound { id: "wg1".into() }.is_recoverable());
    }
}

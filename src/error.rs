//! Error taxonomy for the link core.
//!
//! [`TransportError`] is what a single serialized operation resolves with, [`RadioError`] is the
//! broader classification surfaced to callers, and [`ConnectError`] names the handshake step
//! that failed.

use thiserror::Error;

use crate::protobuf::routing;

/// Reliable write rejected by the link.
pub const STATUS_RELIABLE_WRITE_FAILED: i32 = 4403;
/// An operation's timer fired before the link reported completion.
pub const STATUS_TIMEOUT: i32 = 4404;
/// The start function refused to dispatch the operation.
pub const STATUS_DISPATCH_FAILED: i32 = 4405;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("link closing: {0}")]
    LinkClosing(String),
    #[error("transport status={0}")]
    Status(i32),
    #[error("operation '{0}' timed out")]
    Timeout(String),
    #[error("operation '{0}' could not be dispatched")]
    DispatchFailed(String),
    #[error("transport serializer closed")]
    Closed,
}

impl TransportError {
    /// Numeric status for the failure, using the reserved internal codes for local failures.
    pub fn status(&self) -> Option<i32> {
        match self {
            TransportError::Status(s) => Some(*s),
            TransportError::Timeout(_) => Some(STATUS_TIMEOUT),
            TransportError::DispatchFailed(_) => Some(STATUS_DISPATCH_FAILED),
            TransportError::LinkClosing(_) | TransportError::Closed => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// Dispatch or physical failure; the owner reconnects or fails all outstanding work.
    #[error("link error: {0}")]
    Link(String),
    #[error("timed out: {0}")]
    Timeout(String),
    /// Mesh-level nak for a packet we sent.
    #[error("routing error {name} ({code})")]
    Routing { code: i32, name: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("link core closed")]
    Closed,
}

impl RadioError {
    pub fn routing(code: i32) -> Self {
        let name = routing::Error::try_from(code)
            .map(|e| format!("{:?}", e))
            .unwrap_or_else(|_| "Unknown".to_string());
        RadioError::Routing { code, name }
    }
}

impl From<TransportError> for RadioError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(tag) => RadioError::Timeout(tag),
            TransportError::Closed => RadioError::Closed,
            other => RadioError::Link(other.to_string()),
        }
    }
}

/// Failure of one step of the connection handshake.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("request config failed: {0}")]
    RequestConfig(TransportError),
    #[error("no config_complete after {attempts} attempt(s)")]
    AwaitConfig { attempts: u32 },
    #[error("request node db failed: {0}")]
    RequestNodeDb(TransportError),
    #[error("no node db config_complete after {attempts} attempt(s)")]
    AwaitNodeDb { attempts: u32 },
    #[error("link lost during handshake")]
    LinkLost,
}

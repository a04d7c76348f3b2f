use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Id;

/// Top-level error type for the `fabric-api` crate.
///
/// Covers transport failures, wire faults raised by the remote peer, and
/// payload-shape problems. `fabric-core` classifies these at the reconciler
/// boundary via the `is_*` helpers below.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// The initial dial failed (connection refused, DNS failure, etc.)
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    /// An established connection broke underneath a call or stream.
    #[error("connection lost: {reason}")]
    Disconnected { reason: String },

    /// A call exceeded its deadline.
    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The peer failed the magic/version exchange.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// I/O error on an active socket.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error("wire codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// TLS configuration or negotiation failure.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Remote faults ───────────────────────────────────────────────
    /// A structured fault raised by the remote peer.
    #[error(transparent)]
    Fault(#[from] Fault),

    // ── Payload shape ───────────────────────────────────────────────
    /// The peer sent a frame that violates the protocol state machine.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A device answered, but the payload is unusable (empty report,
    /// missing leaf, wrong value type).
    #[error("invalid device payload: {0}")]
    InvalidPayload(String),

    /// An object is missing a required aspect.
    #[error("object {object} has no {aspect} aspect")]
    AspectMissing { object: Id, aspect: &'static str },

    /// An object carries the aspect, but it does not decode.
    #[error("object {object} has a malformed {aspect} aspect: {source}")]
    AspectInvalid {
        object: Id,
        aspect: &'static str,
        source: serde_json::Error,
    },

    /// A telemetry path string does not parse.
    #[error("malformed path {path:?}: {reason}")]
    BadPath { path: String, reason: &'static str },
}

impl Error {
    /// True for errors worth retrying on the next sweep.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect { .. }
            | Self::Disconnected { .. }
            | Self::Timeout { .. }
            | Self::Handshake(_)
            | Self::Io(_)
            | Self::Tls(_) => true,
            Self::Fault(fault) => fault.kind == FaultKind::Unavailable,
            _ => false,
        }
    }

    /// True if the remote reported the object as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Fault(f) if f.kind == FaultKind::NotFound)
    }

    /// True if a create collided with an existing object.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Fault(f) if f.kind == FaultKind::AlreadyExists)
    }
}

// ── Wire faults ─────────────────────────────────────────────────────

/// Classified failure carried over the wire in place of a response.
///
/// The kind is the contract; the message is for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Unavailable,
    Internal,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::InvalidArgument => "invalid argument",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl Fault {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self { kind: FaultKind::NotFound, message: message.into() }
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self { kind: FaultKind::AlreadyExists, message: message.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self { kind: FaultKind::InvalidArgument, message: message.into() }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self { kind: FaultKind::Unavailable, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self { kind: FaultKind::Internal, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_classification() {
        let err = Error::from(Fault::not_found("port spine1/3"));
        assert!(err.is_not_found());
        assert!(!err.is_transient());

        let err = Error::from(Fault::already_exists("link"));
        assert!(err.is_already_exists());

        let err = Error::from(Fault::unavailable("controller not ready yet"));
        assert!(err.is_transient());
    }

    #[test]
    fn transport_errors_are_transient() {
        let err = Error::Disconnected { reason: "peer closed".into() };
        assert!(err.is_transient());
        assert!(!err.is_not_found());

        let err = Error::Timeout { seconds: 30 };
        assert!(err.is_transient());
    }
}

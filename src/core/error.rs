//! Error types for IICP.

use crate::core::types::{CorrelationId, SessionId};
use thiserror::Error;

/// Result type alias for IICP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification, mirroring the protocol error taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedEnvelope,
    NoCapableAgent,
    Overloaded,
    DeadlineExceeded,
    AuthenticationFailed,
    TransportUnavailable,
    ReplayDetected,
    InvalidSessionState,
    Cancelled,
    Config,
    Serialization,
    Io,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::MalformedEnvelope => "malformed_envelope",
            ErrorKind::NoCapableAgent => "no_capable_agent",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::TransportUnavailable => "transport_unavailable",
            ErrorKind::ReplayDetected => "replay_detected",
            ErrorKind::InvalidSessionState => "invalid_session_state",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in IICP operations.
///
/// Protocol-level variants carry the correlation id of the envelope that
/// triggered them whenever it is known at the point of failure.
#[derive(Error, Debug)]
pub enum Error {
    // Codec errors
    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope {
        correlation_id: Option<CorrelationId>,
        reason: String,
    },

    // Resolution errors
    #[error("No capable agent found for intent {intent}")]
    NoCapableAgent {
        correlation_id: Option<CorrelationId>,
        intent: String,
    },

    // Admission errors
    #[error("QoS class {class} is overloaded")]
    Overloaded {
        correlation_id: Option<CorrelationId>,
        class: String,
    },

    #[error("Deadline exceeded in class {class}: {reason}")]
    DeadlineExceeded {
        correlation_id: Option<CorrelationId>,
        class: String,
        reason: String,
    },

    // Security errors
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed {
        correlation_id: Option<CorrelationId>,
        reason: String,
    },

    #[error("Replay detected in session {session} at sequence {sequence}")]
    ReplayDetected {
        correlation_id: Option<CorrelationId>,
        session: SessionId,
        sequence: u64,
    },

    #[error("Session {session} is {state}, expected established")]
    InvalidSessionState {
        correlation_id: Option<CorrelationId>,
        session: SessionId,
        state: String,
    },

    // Transport errors
    #[error("Transport unavailable: {reason}")]
    TransportUnavailable {
        correlation_id: Option<CorrelationId>,
        reason: String,
    },

    #[error("Send cancelled")]
    Cancelled { correlation_id: Option<CorrelationId> },

    // Ambient errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedEnvelope {
            correlation_id: None,
            reason: reason.into(),
        }
    }

    pub fn auth(reason: impl Into<String>) -> Self {
        Error::AuthenticationFailed {
            correlation_id: None,
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Error::TransportUnavailable {
            correlation_id: None,
            reason: reason.into(),
        }
    }

    /// Taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedEnvelope { .. } => ErrorKind::MalformedEnvelope,
            Error::NoCapableAgent { .. } => ErrorKind::NoCapableAgent,
            Error::Overloaded { .. } => ErrorKind::Overloaded,
            Error::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Error::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailed,
            Error::ReplayDetected { .. } => ErrorKind::ReplayDetected,
            Error::InvalidSessionState { .. } => ErrorKind::InvalidSessionState,
            Error::TransportUnavailable { .. } => ErrorKind::TransportUnavailable,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::Config(_) => ErrorKind::Config,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Correlation id of the originating envelope, if known.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Error::MalformedEnvelope { correlation_id, .. }
            | Error::NoCapableAgent { correlation_id, .. }
            | Error::Overloaded { correlation_id, .. }
            | Error::DeadlineExceeded { correlation_id, .. }
            | Error::AuthenticationFailed { correlation_id, .. }
            | Error::ReplayDetected { correlation_id, .. }
            | Error::InvalidSessionState { correlation_id, .. }
            | Error::TransportUnavailable { correlation_id, .. }
            | Error::Cancelled { correlation_id } => *correlation_id,
            _ => None,
        }
    }

    /// Attach a correlation id, keeping one that is already set.
    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        match &mut self {
            Error::MalformedEnvelope { correlation_id, .. }
            | Error::NoCapableAgent { correlation_id, .. }
            | Error::Overloaded { correlation_id, .. }
            | Error::DeadlineExceeded { correlation_id, .. }
            | Error::AuthenticationFailed { correlation_id, .. }
            | Error::ReplayDetected { correlation_id, .. }
            | Error::InvalidSessionState { correlation_id, .. }
            | Error::TransportUnavailable { correlation_id, .. }
            | Error::Cancelled { correlation_id } => {
                if correlation_id.is_none() {
                    *correlation_id = Some(id);
                }
            }
            _ => {}
        }
        self
    }

    /// Only transient transport failures are retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransportUnavailable { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        Error::auth("signature verification failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_correlation_sets_once() {
        let first = CorrelationId::new();
        let second = CorrelationId::new();
        let err = Error::malformed("truncated")
            .with_correlation(first)
            .with_correlation(second);
        assert_eq!(err.correlation_id(), Some(first));
        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
    }

    #[test]
    fn test_only_transport_errors_retry() {
        assert!(Error::unavailable("refused").is_retryable());
        assert!(!Error::auth("bad signature").is_retryable());
        assert!(!Error::malformed("bad type").is_retryable());
        let replay = Error::ReplayDetected {
            correlation_id: None,
            session: SessionId::new(),
            sequence: 4,
        };
        assert!(!replay.is_retryable());
    }

    #[test]
    fn test_ambient_errors_have_no_correlation() {
        let err = Error::Config("bad".into()).with_correlation(CorrelationId::new());
        assert_eq!(err.correlation_id(), None);
        assert_eq!(err.kind().to_string(), "config");
    }
}

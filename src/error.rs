//! Error taxonomy for the session engine

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason code carried by fatal and warning events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    DevicePermissionDenied,
    DeviceUnavailable,
    NegotiationFailed,
    NetworkUnreachable,
    IceGatheringTimeout,
    TrackReplacementFailed,
    BackendUnreachable,
    AiServiceTimeout,
    InvalidConfig,
    InvalidState,
    InvalidRating,
    Codec,
    /// Local user ended the call.
    LocalHangup,
    /// Remote peer sent `EndCall`.
    RemoteEnded,
}

/// Session engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    // Local media
    #[error("Device permission denied: {0}")]
    DevicePermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    // Connection
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("ICE gathering timed out after {0:?}")]
    IceGatheringTimeout(Duration),

    // Media control
    #[error("Track replacement failed: {0}")]
    TrackReplacementFailed(String),

    // Collaborators
    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("AI service timed out after {0:?}")]
    AiServiceTimeout(Duration),

    // Caller errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{op} is not valid in state {state}")]
    InvalidState { op: &'static str, state: String },

    #[error("Rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl SessionError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            SessionError::DevicePermissionDenied(_) => ReasonCode::DevicePermissionDenied,
            SessionError::DeviceUnavailable(_) => ReasonCode::DeviceUnavailable,
            SessionError::NegotiationFailed(_) => ReasonCode::NegotiationFailed,
            SessionError::NetworkUnreachable(_) => ReasonCode::NetworkUnreachable,
            SessionError::IceGatheringTimeout(_) => ReasonCode::IceGatheringTimeout,
            SessionError::TrackReplacementFailed(_) => ReasonCode::TrackReplacementFailed,
            SessionError::BackendUnreachable(_) => ReasonCode::BackendUnreachable,
            SessionError::AiServiceTimeout(_) => ReasonCode::AiServiceTimeout,
            SessionError::InvalidConfig(_) => ReasonCode::InvalidConfig,
            SessionError::InvalidState { .. } => ReasonCode::InvalidState,
            SessionError::InvalidRating(_) => ReasonCode::InvalidRating,
            SessionError::Codec(_) => ReasonCode::Codec,
        }
    }

    /// Whether this error fails the connection when it happens during
    /// setup. Backend and AI errors never are. Network errors go through
    /// the reconnection policy and only become fatal once it is exhausted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::DevicePermissionDenied(_)
                | SessionError::DeviceUnavailable(_)
                | SessionError::NegotiationFailed(_)
                | SessionError::IceGatheringTimeout(_)
        )
    }

    pub(crate) fn invalid_state(op: &'static str, state: impl std::fmt::Debug) -> Self {
        SessionError::InvalidState {
            op,
            state: format!("{:?}", state),
        }
    }
}

impl From<webrtc::Error> for SessionError {
    fn from(e: webrtc::Error) -> Self {
        SessionError::NegotiationFailed(e.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Codec(e.to_string())
    }
}

impl From<base64::DecodeError> for SessionError {
    fn from(e: base64::DecodeError) -> Self {
        SessionError::Codec(e.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Codec(e.to_string())
    }
}

/// Result type for session engine operations
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_errors_are_fatal() {
        assert!(SessionError::DevicePermissionDenied("camera".into()).is_fatal());
        assert!(SessionError::NegotiationFailed("sdp".into()).is_fatal());
        assert!(!SessionError::NetworkUnreachable("lost".into()).is_fatal());
        assert!(!SessionError::BackendUnreachable("503".into()).is_fatal());
    }

    #[test]
    fn test_collaborator_errors_are_not_fatal() {
        let err = SessionError::AiServiceTimeout(Duration::from_secs(15));
        assert!(!err.is_fatal());
        assert_eq!(err.reason_code(), ReasonCode::AiServiceTimeout);
    }

    #[test]
    fn test_reason_code_serializes_snake_case() {
        let json = serde_json::to_string(&ReasonCode::IceGatheringTimeout).unwrap();
        assert_eq!(json, "\"ice_gathering_timeout\"");
    }
}

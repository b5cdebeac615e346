use thiserror::Error;

/// Missing or invalid agent identity. Fatal to initialization.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("missing required agent field: {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to load config: {0}")]
    Load(String),
}

/// Registration/transport failure. Recoverable, retried by the registration manager.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("signaling transport is not registered")]
    NotRegistered,
    #[error("registration rejected: {status} {}", reason.as_deref().unwrap_or(""))]
    Rejected { status: u16, reason: Option<String> },
    #[error("transport unreachable: {0}")]
    Unreachable(String),
    #[error("no such dialog: {0}")]
    UnknownCall(String),
    #[error("signaling request failed: {0}")]
    Request(String),
}

impl TransportError {
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::NotRegistered => "not-registered",
            TransportError::Rejected { .. } => "registration-rejected",
            TransportError::Unreachable(_) => "transport-unreachable",
            TransportError::UnknownCall(_) => "unknown-call",
            TransportError::Request(_) => "signaling-failed",
        }
    }

    /// The raw signaling status, when the peer answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the failure means the transport itself is gone, as opposed to
    /// the registrar answering with a rejection.
    pub fn is_transport_loss(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MediaAcquisitionError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("no microphone found")]
    NoDevice,
    #[error("microphone unavailable: {0}")]
    Unknown(String),
}

impl MediaAcquisitionError {
    pub fn code(&self) -> &'static str {
        match self {
            MediaAcquisitionError::PermissionDenied => "permission-denied",
            MediaAcquisitionError::NoDevice => "no-device-found",
            MediaAcquisitionError::Unknown(_) => "unknown",
        }
    }

    pub fn user_text(&self) -> String {
        match self {
            MediaAcquisitionError::PermissionDenied => {
                "Microphone access was denied. Allow microphone access and try again.".to_string()
            }
            MediaAcquisitionError::NoDevice => {
                "No microphone found. Connect a headset or microphone.".to_string()
            }
            MediaAcquisitionError::Unknown(detail) => {
                format!("Could not open the microphone: {}", detail)
            }
        }
    }
}

/// Final negative answer from the remote side of a call attempt.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SignalingRejection {
    #[error("busy")]
    Busy,
    #[error("no answer")]
    NoAnswer,
    #[error("cancelled")]
    Cancelled,
    #[error("temporarily unavailable")]
    TemporarilyUnavailable,
    #[error("not found")]
    NotFound,
    #[error("call failed ({0})")]
    Generic(u16),
}

impl SignalingRejection {
    pub fn from_status(status: u16) -> Self {
        match status {
            486 | 600 | 603 => SignalingRejection::Busy,
            408 => SignalingRejection::NoAnswer,
            487 => SignalingRejection::Cancelled,
            480 => SignalingRejection::TemporarilyUnavailable,
            404 | 484 | 604 => SignalingRejection::NotFound,
            other => SignalingRejection::Generic(other),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SignalingRejection::Busy => "busy",
            SignalingRejection::NoAnswer => "no-answer",
            SignalingRejection::Cancelled => "cancelled",
            SignalingRejection::TemporarilyUnavailable => "temporarily-unavailable",
            SignalingRejection::NotFound => "not-found",
            SignalingRejection::Generic(_) => "generic",
        }
    }

    pub fn user_text(&self) -> String {
        self.to_string()
    }
}

/// Malformed or missing remote description, or a media stack failure while
/// committing one.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("remote description missing")]
    MissingRemoteDescription,
    #[error("malformed remote description: {0}")]
    MalformedRemoteDescription(String),
    #[error("media negotiation failed: {0}")]
    Negotiation(String),
    #[error("media connection failed")]
    MediaFailed,
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::MissingRemoteDescription => "missing-sdp",
            ProtocolError::MalformedRemoteDescription(_) => "malformed-sdp",
            ProtocolError::Negotiation(_) => "negotiation-failed",
            ProtocolError::MediaFailed => "media-failed",
        }
    }
}

/// Why a user command was refused without touching the current session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("a call is already in progress")]
    SessionActive,
    #[error("not registered with the PBX")]
    NotRegistered,
    #[error("enter a number to dial")]
    EmptyNumber,
    #[error("agent session is locked")]
    Locked,
    #[error("{op} is not valid in state {state}")]
    InvalidState { op: &'static str, state: String },
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::SessionActive => "session-active",
            CommandError::NotRegistered => "not-registered",
            CommandError::EmptyNumber => "empty-number",
            CommandError::Locked => "locked",
            CommandError::InvalidState { .. } => "invalid-state",
        }
    }
}

/// Terminal failure of one call attempt, as reported to the presentation layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CallFailure {
    #[error(transparent)]
    Media(#[from] MediaAcquisitionError),
    #[error(transparent)]
    Rejected(#[from] SignalingRejection),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CallFailure {
    pub fn code(&self) -> &'static str {
        match self {
            CallFailure::Media(e) => e.code(),
            CallFailure::Rejected(e) => e.code(),
            CallFailure::Protocol(e) => e.code(),
            CallFailure::Transport(e) => e.code(),
        }
    }

    pub fn user_text(&self) -> String {
        match self {
            CallFailure::Media(e) => e.user_text(),
            CallFailure::Rejected(e) => e.user_text(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_mapping() {
        assert_eq!(SignalingRejection::from_status(486), SignalingRejection::Busy);
        assert_eq!(SignalingRejection::from_status(603), SignalingRejection::Busy);
        assert_eq!(SignalingRejection::from_status(408), SignalingRejection::NoAnswer);
        assert_eq!(SignalingRejection::from_status(487), SignalingRejection::Cancelled);
        assert_eq!(
            SignalingRejection::from_status(480),
            SignalingRejection::TemporarilyUnavailable
        );
        assert_eq!(SignalingRejection::from_status(404), SignalingRejection::NotFound);
        assert_eq!(SignalingRejection::from_status(500), SignalingRejection::Generic(500));
    }

    #[test]
    fn test_failure_codes() {
        let busy: CallFailure = SignalingRejection::Busy.into();
        assert_eq!(busy.code(), "busy");
        assert_eq!(busy.user_text(), "busy");

        let denied: CallFailure = MediaAcquisitionError::PermissionDenied.into();
        assert_eq!(denied.code(), "permission-denied");

        let rejected = TransportError::Rejected {
            status: 403,
            reason: Some("Forbidden".to_string()),
        };
        assert_eq!(rejected.status(), Some(403));
        assert!(!rejected.is_transport_loss());
        assert!(TransportError::Unreachable("timeout".to_string()).is_transport_loss());
    }
}

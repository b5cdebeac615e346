use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod dispatcher;
pub mod registration;
#[allow(clippy::module_inception)]
pub mod useragent;

pub use dispatcher::{Dispatcher, RawSignal};
pub use registration::RegistrationManager;
pub use useragent::{SipUserAgent, SipUserAgentBuilder};

/// Signaling happenings normalized for the call engine. Every variant is
/// tagged with the engine's call id, never a library dialog id.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    IncomingInvite {
        call_id: String,
        peer_number: String,
        offer: Option<String>,
    },
    Provisional {
        call_id: String,
        code: u16,
    },
    Accepted {
        call_id: String,
        answer: Option<String>,
    },
    Rejected {
        call_id: String,
        code: u16,
        reason: Option<String>,
    },
    Cancelled {
        call_id: String,
    },
    Terminated {
        call_id: String,
    },
    Failed {
        call_id: String,
        reason: String,
    },
}

impl SignalingEvent {
    pub fn call_id(&self) -> &str {
        match self {
            SignalingEvent::IncomingInvite { call_id, .. }
            | SignalingEvent::Provisional { call_id, .. }
            | SignalingEvent::Accepted { call_id, .. }
            | SignalingEvent::Rejected { call_id, .. }
            | SignalingEvent::Cancelled { call_id }
            | SignalingEvent::Terminated { call_id }
            | SignalingEvent::Failed { call_id, .. } => call_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegistrationState::Disconnected => "disconnected",
            RegistrationState::Connecting => "connecting",
            RegistrationState::Connected => "connected",
            RegistrationState::Registered => "registered",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationStatus {
    pub state: RegistrationState,
    /// Raw status of the last registrar answer, if any.
    pub status_code: Option<u16>,
    pub error: Option<TransportError>,
}

impl RegistrationStatus {
    pub fn new(state: RegistrationState) -> Self {
        Self {
            state,
            status_code: None,
            error: None,
        }
    }
}

/// Outgoing half of the signaling collaborator. Results arrive later as
/// [`SignalingEvent`]s on the engine queue.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send_invite(&self, call_id: &str, target: &str, offer: String)
        -> Result<(), TransportError>;
    /// Final or provisional answer to an incoming invite. `answer` carries
    /// the local description for 2xx.
    async fn send_response(
        &self,
        call_id: &str,
        code: u16,
        answer: Option<String>,
    ) -> Result<(), TransportError>;
    async fn cancel(&self, call_id: &str) -> Result<(), TransportError>;
    async fn send_termination(&self, call_id: &str) -> Result<(), TransportError>;
}

/// Registration against the PBX.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    /// Returns the expiry granted by the registrar. `expires == 0` removes
    /// the binding.
    async fn register(&self, expires: u32) -> Result<u32, TransportError>;
}

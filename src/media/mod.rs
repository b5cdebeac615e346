use crate::error::ProtocolError;
use crate::event::EventQueue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod capture;
pub mod codecs;
pub mod device;
pub mod ice;
pub mod output;
pub mod rtc;
pub mod sdp;

pub use device::{DeviceAccess, LocalMediaStream, MicrophoneAcquisition};
pub use ice::{build_ice_config, IceConfig};
pub use output::{AudioOutput, AudioSink, RemoteTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Asynchronous media happenings posted to the engine queue.
#[derive(Debug)]
pub enum MediaEvent {
    Acquired {
        call_id: String,
        attempt: u64,
        result: MicrophoneAcquisition,
    },
    RemoteTrack {
        call_id: String,
        track: RemoteTrack,
    },
    ConnectionState {
        call_id: String,
        state: MediaConnectionState,
    },
}

/// One peer connection, owned by the call session that created it.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Create, commit and return the local description once candidate
    /// gathering has finished.
    async fn create_local_description(&self, kind: SdpKind) -> Result<String, ProtocolError>;
    async fn apply_remote_description(&self, sdp: &str, kind: SdpKind)
        -> Result<(), ProtocolError>;
    async fn stats(&self) -> anyhow::Result<ConnectionStats>;
    async fn close(&self);
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Remote tracks and connection state changes are posted to `events`
    /// tagged with `call_id`.
    async fn create_session(
        &self,
        call_id: &str,
        ice: &IceConfig,
        local: &LocalMediaStream,
        events: EventQueue,
    ) -> Result<Box<dyn MediaSession>, ProtocolError>;
}

use crate::call::{CallDirection, CallState};
use crate::media::{ConnectionStats, MediaEvent};
use crate::useragent::{RegistrationStatus, SignalingEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted toward the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum UiEvent {
    Status {
        text: String,
    },
    CallState {
        call_id: String,
        state: CallState,
        direction: CallDirection,
        peer: String,
    },
    Registration {
        state: String,
        status_code: Option<u16>,
    },
    IncomingCall {
        call_id: String,
        peer: String,
    },
    Alert {
        active: bool,
    },
    Ringback {
        active: bool,
    },
    Duration {
        call_id: String,
        seconds: u64,
    },
    RemoteAudio {
        call_id: String,
        tracks: usize,
    },
    /// Error notification with a short machine-readable reason code.
    Error {
        code: String,
        message: String,
    },
    Stats {
        call_id: String,
        stats: ConnectionStats,
    },
    Devices {
        devices: Vec<crate::media::device::DeviceDescriptor>,
    },
    Locked,
    Unlocked,
}

/// Type alias for the ui event sender
pub type EventSender = tokio::sync::broadcast::Sender<UiEvent>;

/// Type alias for the ui event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<UiEvent>;

pub fn create_event_sender() -> EventSender {
    let (tx, _) = tokio::sync::broadcast::channel(128);
    tx
}

/// User commands issued by the presentation layer or collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    PlaceCall { number: String },
    Accept,
    Reject,
    Hangup,
    SelectDevice { device_id: String },
    ListDevices,
    CollectStats,
    ForceLock,
    Unlock,
}

/// Everything the call engine reacts to, serialized onto one queue.
#[derive(Debug)]
pub enum EngineEvent {
    Command(Command),
    Signaling(SignalingEvent),
    Media(MediaEvent),
    Registration(RegistrationStatus),
    Tick { call_id: String },
}

pub type EventQueue = mpsc::UnboundedSender<EngineEvent>;
pub type EventQueueReceiver = mpsc::UnboundedReceiver<EngineEvent>;

impl From<Command> for EngineEvent {
    fn from(command: Command) -> Self {
        EngineEvent::Command(command)
    }
}

impl From<SignalingEvent> for EngineEvent {
    fn from(event: SignalingEvent) -> Self {
        EngineEvent::Signaling(event)
    }
}

impl From<MediaEvent> for EngineEvent {
    fn from(event: MediaEvent) -> Self {
        EngineEvent::Media(event)
    }
}

impl From<RegistrationStatus> for EngineEvent {
    fn from(status: RegistrationStatus) -> Self {
        EngineEvent::Registration(status)
    }
}

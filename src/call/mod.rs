use crate::error::CallFailure;
use crate::media::{AudioOutput, LocalMediaStream, MediaSession};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub mod engine;
pub mod testing;
#[cfg(test)]
mod tests;

pub use engine::CallEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallState {
    Idle,
    Dialing,
    RingingIn,
    Connecting,
    Established,
    Rejected,
    Failed,
    Terminated,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Rejected | CallState::Failed | CallState::Terminated
        )
    }

    /// The transition table. Every other move is refused.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Idle, Dialing)
                | (Idle, RingingIn)
                | (Dialing, Connecting)
                | (Dialing, Rejected)
                | (Dialing, Failed)
                | (Dialing, Terminated)
                | (RingingIn, Connecting)
                | (RingingIn, Rejected)
                | (RingingIn, Failed)
                | (RingingIn, Terminated)
                | (Connecting, Established)
                | (Connecting, Rejected)
                | (Connecting, Failed)
                | (Connecting, Terminated)
                | (Established, Terminated)
                | (Rejected, Terminated)
                | (Rejected, Idle)
                | (Failed, Idle)
                | (Terminated, Idle)
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::RingingIn => "ringingIn",
            CallState::Connecting => "connecting",
            CallState::Established => "established",
            CallState::Rejected => "rejected",
            CallState::Failed => "failed",
            CallState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// The single in-flight async operation of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOp {
    Acquiring(u64),
}

/// One call from creation to teardown. Owned by the engine's slot.
pub struct CallSession {
    pub id: String,
    pub direction: CallDirection,
    pub peer_number: String,
    pub started_at: Option<DateTime<Utc>>,
    state: CallState,
    history: Vec<CallState>,
    pub(crate) pending: Option<PendingOp>,
    pub(crate) invite_sent: bool,
    pub(crate) remote_offer: Option<String>,
    pub(crate) local_stream: Option<LocalMediaStream>,
    pub(crate) output: Option<AudioOutput>,
    pub(crate) media: Option<Box<dyn MediaSession>>,
    pub(crate) timer: Option<CancellationToken>,
    pub(crate) failure: Option<CallFailure>,
}

impl CallSession {
    pub(crate) fn new(id: String, direction: CallDirection, peer_number: String) -> Self {
        let state = match direction {
            CallDirection::Outbound => CallState::Dialing,
            CallDirection::Inbound => CallState::RingingIn,
        };
        Self {
            id,
            direction,
            peer_number,
            started_at: None,
            state,
            history: vec![CallState::Idle, state],
            pending: None,
            invite_sent: false,
            remote_offer: None,
            local_stream: None,
            output: None,
            media: None,
            timer: None,
            failure: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Every state this session has been in, in order.
    pub fn history(&self) -> &[CallState] {
        &self.history
    }

    pub fn failure(&self) -> Option<&CallFailure> {
        self.failure.as_ref()
    }

    pub fn remote_track_count(&self) -> usize {
        self.output.as_ref().map(|o| o.track_count()).unwrap_or(0)
    }

    /// Returns false and leaves the state alone when the table forbids it.
    pub(crate) fn transition(&mut self, next: CallState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.history.push(next);
        true
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}

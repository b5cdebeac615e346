use super::SignalingEvent;
use crate::event::EventQueue;
use tracing::{debug, warn};

/// What the signaling library hands us: either a numeric response status or
/// a named dialog state.
#[derive(Debug, Clone)]
pub enum RawSignal {
    Code {
        code: u16,
        reason: Option<String>,
        body: Option<String>,
    },
    Named {
        name: String,
        reason: Option<String>,
        body: Option<String>,
    },
}

fn non_empty(body: Option<String>) -> Option<String> {
    body.filter(|b| !b.trim().is_empty())
}

/// Map a raw signal onto the fixed event set. `None` means the signal carries
/// nothing the engine acts on.
pub fn normalize(call_id: &str, raw: RawSignal) -> Option<SignalingEvent> {
    let call_id = call_id.to_string();
    match raw {
        RawSignal::Code { code, reason, body } => match code {
            100 => None,
            101..=199 => Some(SignalingEvent::Provisional { call_id, code }),
            200..=299 => Some(SignalingEvent::Accepted {
                call_id,
                answer: non_empty(body),
            }),
            487 => Some(SignalingEvent::Cancelled { call_id }),
            300..=699 => Some(SignalingEvent::Rejected {
                call_id,
                code,
                reason,
            }),
            _ => {
                warn!(call_id, code, "ignoring out of range status");
                None
            }
        },
        RawSignal::Named { name, reason, body } => {
            match name.to_ascii_lowercase().as_str() {
                "trying" | "calling" => None,
                "ringing" | "early" | "progress" => {
                    Some(SignalingEvent::Provisional { call_id, code: 180 })
                }
                "confirmed" | "accepted" | "answered" => Some(SignalingEvent::Accepted {
                    call_id,
                    answer: non_empty(body),
                }),
                "terminated" | "bye" | "ended" => Some(SignalingEvent::Terminated { call_id }),
                "cancelled" | "canceled" => Some(SignalingEvent::Cancelled { call_id }),
                "busy" => Some(SignalingEvent::Rejected {
                    call_id,
                    code: 486,
                    reason,
                }),
                "declined" => Some(SignalingEvent::Rejected {
                    call_id,
                    code: 603,
                    reason,
                }),
                "failed" => Some(SignalingEvent::Failed {
                    call_id,
                    reason: reason.unwrap_or_else(|| "signaling failed".to_string()),
                }),
                other => {
                    debug!(call_id, state = other, "ignoring unknown dialog state");
                    None
                }
            }
        }
    }
}

/// Normalizes raw signals and posts them to the engine queue.
#[derive(Clone)]
pub struct Dispatcher {
    queue: EventQueue,
}

impl Dispatcher {
    pub fn new(queue: EventQueue) -> Self {
        Self { queue }
    }

    pub fn dispatch(&self, call_id: &str, raw: RawSignal) {
        if let Some(event) = normalize(call_id, raw) {
            self.post(event);
        }
    }

    pub fn post(&self, event: SignalingEvent) {
        if self.queue.send(event.into()).is_err() {
            warn!("engine queue closed, dropping signaling event");
        }
    }
}

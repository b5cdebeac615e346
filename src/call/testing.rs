//! In-memory collaborators for exercising [`CallEngine`] without a PBX,
//! a peer connection or a sound card.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use agentphone::call::testing::{MockStack, SignalCall};
//! use agentphone::event::Command;
//!
//! let mut stack = MockStack::new().await;
//! stack.command(Command::PlaceCall { number: "1002".into() }).await;
//! assert!(matches!(stack.signaling.calls()[0], SignalCall::Invite { .. }));
//! ```

use super::engine::CallEngine;
use super::CallState;
use crate::error::{ProtocolError, TransportError};
use crate::event::{
    create_event_sender, Command, EventQueue, EventQueueReceiver, EventReceiver,
    UiEvent,
};
use crate::media::device::{AudioBackend, CaptureTrack, DeviceDescriptor, DeviceError, OpenedInput};
use crate::media::ice::IceSettings;
use crate::media::output::NullSink;
use crate::media::{
    build_ice_config, ConnectionStats, DeviceAccess, IceConfig, LocalMediaStream, MediaSession, MediaTransport,
    SdpKind,
};
use crate::useragent::{RegistrationState, RegistrationStatus, SignalingEvent, SignalingTransport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Local description handed out by [`MockMediaSession`]. No rtcp-mux line.
pub const SAMPLE_SDP: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 8 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:0 PCMU/8000\r\n";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Signaling ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SignalCall {
    Invite {
        call_id: String,
        target: String,
        offer: String,
    },
    Response {
        call_id: String,
        code: u16,
        answer: Option<String>,
    },
    Cancel {
        call_id: String,
    },
    Termination {
        call_id: String,
    },
}

/// Records every outgoing signaling request.
#[derive(Default)]
pub struct MockSignaling {
    calls: Mutex<Vec<SignalCall>>,
    fail: AtomicBool,
}

impl MockSignaling {
    pub fn calls(&self) -> Vec<SignalCall> {
        lock(&self.calls).clone()
    }

    pub fn invites(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, SignalCall::Invite { .. }))
            .count()
    }

    pub fn responses(&self) -> Vec<u16> {
        self.calls()
            .iter()
            .filter_map(|c| match c {
                SignalCall::Response { code, .. } => Some(*code),
                _ => None,
            })
            .collect()
    }

    /// Make every following request fail as if the transport were gone.
    pub fn fail_requests(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: SignalCall) -> Result<(), TransportError> {
        lock(&self.calls).push(call);
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("mock transport down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingTransport for MockSignaling {
    async fn send_invite(
        &self,
        call_id: &str,
        target: &str,
        offer: String,
    ) -> Result<(), TransportError> {
        self.record(SignalCall::Invite {
            call_id: call_id.to_string(),
            target: target.to_string(),
            offer,
        })
    }

    async fn send_response(
        &self,
        call_id: &str,
        code: u16,
        answer: Option<String>,
    ) -> Result<(), TransportError> {
        self.record(SignalCall::Response {
            call_id: call_id.to_string(),
            code,
            answer,
        })
    }

    async fn cancel(&self, call_id: &str) -> Result<(), TransportError> {
        self.record(SignalCall::Cancel {
            call_id: call_id.to_string(),
        })
    }

    async fn send_termination(&self, call_id: &str) -> Result<(), TransportError> {
        self.record(SignalCall::Termination {
            call_id: call_id.to_string(),
        })
    }
}

// ── Media ───────────────────────────────────────────────────────────────────

/// Shared observation point for every session a [`MockMediaTransport`] creates.
#[derive(Default)]
pub struct MediaLog {
    pub sessions: AtomicUsize,
    pub closed: AtomicUsize,
    remotes: Mutex<Vec<(SdpKind, String)>>,
    fail_apply: AtomicBool,
}

impl MediaLog {
    /// Remote descriptions applied, in order, after any rewriting.
    pub fn remotes(&self) -> Vec<(SdpKind, String)> {
        lock(&self.remotes).clone()
    }

    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockMediaTransport {
    pub log: Arc<MediaLog>,
}

#[async_trait]
impl MediaTransport for MockMediaTransport {
    async fn create_session(
        &self,
        call_id: &str,
        _ice: &IceConfig,
        _local: &LocalMediaStream,
        _events: EventQueue,
    ) -> Result<Box<dyn MediaSession>, ProtocolError> {
        self.log.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockMediaSession {
            call_id: call_id.to_string(),
            log: self.log.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MockMediaSession {
    call_id: String,
    log: Arc<MediaLog>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaSession for MockMediaSession {
    async fn create_local_description(&self, _kind: SdpKind) -> Result<String, ProtocolError> {
        Ok(SAMPLE_SDP.to_string())
    }

    async fn apply_remote_description(
        &self,
        sdp: &str,
        kind: SdpKind,
    ) -> Result<(), ProtocolError> {
        if self.log.fail_apply.load(Ordering::SeqCst) {
            return Err(ProtocolError::Negotiation(format!(
                "mock refused remote description for {}",
                self.call_id
            )));
        }
        lock(&self.log.remotes).push((kind, sdp.to_string()));
        Ok(())
    }

    async fn stats(&self) -> anyhow::Result<ConnectionStats> {
        Ok(ConnectionStats {
            packets_sent: 50,
            packets_received: 48,
            bytes_sent: 8000,
            bytes_received: 7680,
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.log.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ── Audio input ─────────────────────────────────────────────────────────────

struct MockCaptureTrack {
    id: String,
}

impl CaptureTrack for MockCaptureTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {}
}

/// Audio backend with a fixed device list. Opening an unlisted id fails
/// with not-found; opening the default input always works unless denied.
#[derive(Default)]
pub struct MockAudioBackend {
    devices: Vec<DeviceDescriptor>,
    denied: AtomicBool,
    opens: Arc<Mutex<Vec<Option<String>>>>,
    next_track: AtomicUsize,
}

impl MockAudioBackend {
    pub fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices,
            ..Default::default()
        }
    }

    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    /// Every `open_input` argument, in call order.
    pub fn opens(&self) -> Arc<Mutex<Vec<Option<String>>>> {
        self.opens.clone()
    }
}

impl AudioBackend for MockAudioBackend {
    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        Ok(self.devices.clone())
    }

    fn open_input(&self, device_id: Option<&str>) -> Result<OpenedInput, DeviceError> {
        lock(&self.opens).push(device_id.map(str::to_string));
        if self.denied.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied);
        }
        let device = match device_id {
            Some(id) => self
                .devices
                .iter()
                .find(|d| d.id == id)
                .cloned()
                .ok_or_else(|| DeviceError::NotFound(id.to_string()))?,
            None => DeviceDescriptor {
                id: "default".to_string(),
                label: "Default".to_string(),
                is_default: true,
            },
        };
        let n = self.next_track.fetch_add(1, Ordering::SeqCst);
        let (_tx, frames) = mpsc::channel(1);
        Ok(OpenedInput {
            device,
            track: Box::new(MockCaptureTrack {
                id: format!("mock-track-{}", n),
            }),
            frames,
        })
    }
}

// ── Assembled stack ─────────────────────────────────────────────────────────

/// A [`CallEngine`] wired to mocks, driven step by step from the test.
pub struct MockStack {
    pub engine: CallEngine,
    pub signaling: Arc<MockSignaling>,
    pub media: Arc<MediaLog>,
    pub devices: DeviceAccess,
    pub sink: Arc<NullSink>,
    pub queue: EventQueue,
    receiver: EventQueueReceiver,
    ui: EventReceiver,
}

impl MockStack {
    /// A registered engine with one USB microphone available.
    pub async fn new() -> Self {
        Self::with_backend(MockAudioBackend::with_devices(vec![DeviceDescriptor {
            id: "mic-1".to_string(),
            label: "USB Headset".to_string(),
            is_default: false,
        }]))
        .await
    }

    pub async fn with_backend(backend: MockAudioBackend) -> Self {
        let signaling = Arc::new(MockSignaling::default());
        let transport = MockMediaTransport::default();
        let media = transport.log.clone();
        let devices = DeviceAccess::new(Box::new(backend), None);
        let sink = Arc::new(NullSink::default());
        let events = create_event_sender();
        let ui = events.subscribe();
        let (queue, receiver) = mpsc::unbounded_channel();
        let engine = CallEngine::new(
            signaling.clone(),
            Arc::new(transport),
            devices.clone(),
            sink.clone(),
            build_ice_config(&IceSettings::default(), None),
            events,
            queue.clone(),
        );
        let mut stack = Self {
            engine,
            signaling,
            media,
            devices,
            sink,
            queue,
            receiver,
            ui,
        };
        stack.register(RegistrationState::Registered).await;
        stack.ui_events();
        stack
    }

    pub async fn register(&mut self, state: RegistrationState) {
        self.queue
            .send(RegistrationStatus::new(state).into())
            .ok();
        self.settle().await;
    }

    /// Post a command and run the engine until it is quiet again.
    pub async fn command(&mut self, command: Command) {
        self.queue.send(command.into()).ok();
        self.settle().await;
    }

    pub async fn signal(&mut self, event: SignalingEvent) {
        self.queue.send(event.into()).ok();
        self.settle().await;
    }

    /// Handle queued events until nothing arrives for 50ms.
    pub async fn settle(&mut self) {
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), self.receiver.recv()).await
        {
            self.engine.handle(event).await;
        }
    }

    pub fn state(&self) -> CallState {
        self.engine.state()
    }

    pub fn call_id(&self) -> Option<String> {
        self.engine.session().map(|s| s.id.clone())
    }

    /// Drain every presentation event emitted so far.
    pub fn ui_events(&mut self) -> Vec<UiEvent> {
        let mut events = vec![];
        while let Ok(event) = self.ui.try_recv() {
            events.push(event);
        }
        events
    }

    /// Place an outbound call and take it to established.
    pub async fn establish_outbound(&mut self, number: &str) -> String {
        self.command(Command::PlaceCall {
            number: number.to_string(),
        })
        .await;
        let call_id = self.call_id().unwrap_or_default();
        self.signal(SignalingEvent::Provisional {
            call_id: call_id.clone(),
            code: 180,
        })
        .await;
        self.signal(SignalingEvent::Accepted {
            call_id: call_id.clone(),
            answer: Some(SAMPLE_SDP.to_string()),
        })
        .await;
        call_id
    }

    /// Deliver an incoming invite carrying [`SAMPLE_SDP`].
    pub async fn incoming(&mut self, call_id: &str, peer: &str) {
        self.signal(SignalingEvent::IncomingInvite {
            call_id: call_id.to_string(),
            peer_number: peer.to_string(),
            offer: Some(SAMPLE_SDP.to_string()),
        })
        .await;
    }
}

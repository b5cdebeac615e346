use super::{CallDirection, CallSession, CallState, PendingOp};
use crate::error::{
    CallFailure, CommandError, MediaAcquisitionError, ProtocolError, SignalingRejection,
    TransportError,
};
use crate::event::{Command, EngineEvent, EventQueue, EventQueueReceiver, EventSender, UiEvent};
use crate::media::sdp::{ensure_muxed_rtcp, validate_remote_description};
use crate::media::{
    AudioOutput, AudioSink, DeviceAccess, IceConfig, MediaConnectionState, MediaEvent,
    MediaTransport, MicrophoneAcquisition, RemoteTrack, SdpKind,
};
use crate::useragent::{RegistrationState, RegistrationStatus, SignalingEvent, SignalingTransport};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RINGING: u16 = 180;
const OK: u16 = 200;
const TEMPORARILY_UNAVAILABLE: u16 = 480;
const BUSY_HERE: u16 = 486;
const NOT_ACCEPTABLE_HERE: u16 = 488;

/// What is left of a session after teardown.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedCall {
    pub id: String,
    pub direction: CallDirection,
    pub history: Vec<CallState>,
    pub failure: Option<CallFailure>,
}

/// Owns the single call slot and reacts to every engine event in order.
pub struct CallEngine {
    signaling: Arc<dyn SignalingTransport>,
    media: Arc<dyn MediaTransport>,
    devices: DeviceAccess,
    sink: Arc<dyn AudioSink>,
    ice: IceConfig,
    events: EventSender,
    queue: EventQueue,
    session: Option<CallSession>,
    registration: RegistrationState,
    locked: bool,
    next_attempt: u64,
    last_call: Option<FinishedCall>,
}

impl CallEngine {
    pub fn new(
        signaling: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaTransport>,
        devices: DeviceAccess,
        sink: Arc<dyn AudioSink>,
        ice: IceConfig,
        events: EventSender,
        queue: EventQueue,
    ) -> Self {
        Self {
            signaling,
            media,
            devices,
            sink,
            ice,
            events,
            queue,
            session: None,
            registration: RegistrationState::Disconnected,
            locked: false,
            next_attempt: 0,
            last_call: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(CallState::Idle)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn last_call(&self) -> Option<&FinishedCall> {
        self.last_call.as_ref()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.registration
    }

    pub fn devices(&self) -> &DeviceAccess {
        &self.devices
    }

    /// Consume the queue until cancelled or every sender is gone.
    pub async fn serve(mut self, mut receiver: EventQueueReceiver, token: CancellationToken) {
        info!("call engine started");
        loop {
            select! {
                _ = token.cancelled() => break,
                event = receiver.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }
        self.stop_active_call().await;
        info!("call engine stopped");
    }

    pub async fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Command(command) => self.handle_command(command).await,
            EngineEvent::Signaling(event) => self.handle_signaling(event).await,
            EngineEvent::Media(event) => self.handle_media(event).await,
            EngineEvent::Registration(status) => self.handle_registration(status),
            EngineEvent::Tick { call_id } => self.handle_tick(&call_id),
        }
    }

    fn emit(&self, event: UiEvent) {
        // no subscribers is fine
        self.events.send(event).ok();
    }

    fn status(&self, text: impl Into<String>) {
        self.emit(UiEvent::Status { text: text.into() });
    }

    fn emit_state(&self, session: &CallSession, state: CallState) {
        self.emit(UiEvent::CallState {
            call_id: session.id.clone(),
            state,
            direction: session.direction,
            peer: session.peer_number.clone(),
        });
    }

    fn emit_failure(&self, failure: &CallFailure) {
        self.emit(UiEvent::Error {
            code: failure.code().to_string(),
            message: failure.user_text(),
        });
    }

    async fn handle_command(&mut self, command: Command) {
        debug!(?command, "command");
        let result = match command {
            Command::PlaceCall { number } => self.place_call(&number),
            Command::Accept => self.accept(),
            Command::Reject => self.reject().await,
            Command::Hangup => self.hangup().await,
            Command::SelectDevice { device_id } => {
                info!(device_id, "input device selected");
                self.status(format!("Using input {}", device_id));
                self.devices.remember_device(Some(device_id));
                Ok(())
            }
            Command::ListDevices => {
                self.emit(UiEvent::Devices {
                    devices: self.devices.list_input_devices(),
                });
                Ok(())
            }
            Command::CollectStats => {
                self.collect_stats().await;
                Ok(())
            }
            Command::ForceLock => {
                self.force_lock().await;
                Ok(())
            }
            Command::Unlock => {
                self.unlock();
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(code = e.code(), "command refused: {}", e);
            self.emit(UiEvent::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            });
        }
    }

    fn invalid_state(&self, op: &'static str) -> CommandError {
        CommandError::InvalidState {
            op,
            state: self.state().to_string(),
        }
    }

    /// Spawn one acquisition attempt. The result comes back on the queue.
    fn start_acquisition(&mut self, call_id: &str) -> u64 {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let devices = self.devices.clone();
        let queue = self.queue.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            let result = devices.acquire_stream(None).await;
            // a dropped result releases its stream
            queue
                .send(
                    MediaEvent::Acquired {
                        call_id,
                        attempt,
                        result,
                    }
                    .into(),
                )
                .ok();
        });
        attempt
    }

    pub fn place_call(&mut self, number: &str) -> Result<(), CommandError> {
        if self.locked {
            return Err(CommandError::Locked);
        }
        if self.session.is_some() {
            return Err(CommandError::SessionActive);
        }
        if self.registration != RegistrationState::Registered {
            return Err(CommandError::NotRegistered);
        }
        let number = number.trim();
        if number.is_empty() {
            return Err(CommandError::EmptyNumber);
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        let attempt = self.start_acquisition(&call_id);
        let mut session = CallSession::new(call_id.clone(), CallDirection::Outbound, number.into());
        session.pending = Some(PendingOp::Acquiring(attempt));
        info!(call_id, number, "placing call");
        self.emit_state(&session, CallState::Dialing);
        self.status(format!("Calling {}", number));
        self.session = Some(session);
        Ok(())
    }

    pub async fn receive_invite(&mut self, call_id: &str, peer_number: &str, offer: Option<String>) {
        if self.locked {
            info!(call_id, "agent locked, refusing incoming invite");
            self.respond(call_id, TEMPORARILY_UNAVAILABLE, None).await;
            return;
        }
        if self.registration != RegistrationState::Registered {
            info!(call_id, "not registered, refusing incoming invite");
            self.respond(call_id, TEMPORARILY_UNAVAILABLE, None).await;
            return;
        }
        if let Some(active) = self.session.as_ref() {
            info!(call_id, active_call = active.id, "busy, rejecting incoming invite");
            self.respond(call_id, BUSY_HERE, None).await;
            return;
        }
        let offer = offer.filter(|o| !o.trim().is_empty());
        if offer.is_none() {
            warn!(call_id, "incoming invite without offer");
            self.respond(call_id, NOT_ACCEPTABLE_HERE, None).await;
            return;
        }

        let mut session =
            CallSession::new(call_id.to_string(), CallDirection::Inbound, peer_number.into());
        session.remote_offer = offer;
        info!(call_id, peer_number, "incoming call");
        self.emit_state(&session, CallState::RingingIn);
        self.session = Some(session);
        self.respond(call_id, RINGING, None).await;
        self.emit(UiEvent::IncomingCall {
            call_id: call_id.to_string(),
            peer: peer_number.to_string(),
        });
        self.emit(UiEvent::Alert { active: true });
        self.status(format!("Incoming call from {}", peer_number));
    }

    pub fn accept(&mut self) -> Result<(), CommandError> {
        let call_id = match self.session.as_ref() {
            Some(s) if s.state() == CallState::RingingIn => {
                if s.pending.is_some() {
                    debug!(call_id = s.id, "accept already in flight");
                    return Ok(());
                }
                s.id.clone()
            }
            _ => return Err(self.invalid_state("accept")),
        };
        let attempt = self.start_acquisition(&call_id);
        if let Some(session) = self.session.as_mut() {
            session.pending = Some(PendingOp::Acquiring(attempt));
        }
        info!(call_id, "accepting call");
        self.emit(UiEvent::Alert { active: false });
        self.status("Connecting");
        Ok(())
    }

    pub async fn reject(&mut self) -> Result<(), CommandError> {
        let call_id = match self.session.as_ref() {
            Some(s) if s.state() == CallState::RingingIn => s.id.clone(),
            _ => return Err(self.invalid_state("reject")),
        };
        info!(call_id, "rejecting call");
        self.respond(&call_id, BUSY_HERE, None).await;
        self.finish(CallState::Rejected, None).await;
        self.status("Call rejected");
        Ok(())
    }

    pub async fn hangup(&mut self) -> Result<(), CommandError> {
        let (call_id, state, direction, invite_sent) = match self.session.as_ref() {
            Some(s) => (s.id.clone(), s.state(), s.direction, s.invite_sent),
            None => return Err(self.invalid_state("hangup")),
        };
        match (state, direction) {
            (CallState::RingingIn, _) => return self.reject().await,
            (CallState::Dialing | CallState::Connecting, CallDirection::Outbound) => {
                if invite_sent {
                    if let Err(e) = self.signaling.cancel(&call_id).await {
                        warn!(call_id, "failed to cancel invite: {}", e);
                    }
                }
            }
            (CallState::Connecting, CallDirection::Inbound) => {
                if let Err(e) = self.signaling.cancel(&call_id).await {
                    warn!(call_id, "failed to cancel incoming call: {}", e);
                }
            }
            (CallState::Established, _) => {
                if let Err(e) = self.signaling.send_termination(&call_id).await {
                    warn!(call_id, "failed to send termination: {}", e);
                }
            }
            _ => return Err(self.invalid_state("hangup")),
        }
        info!(call_id, %state, "hangup");
        self.finish(CallState::Terminated, None).await;
        self.status("Call ended");
        Ok(())
    }

    async fn respond(&self, call_id: &str, code: u16, answer: Option<String>) {
        if let Err(e) = self.signaling.send_response(call_id, code, answer).await {
            warn!(call_id, code, "failed to send response: {}", e);
        }
    }

    fn transition(&mut self, next: CallState) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let from = session.state();
        if !session.transition(next) {
            warn!(call_id = session.id, %from, to = %next, "refusing transition");
            return false;
        }
        info!(call_id = session.id, %from, to = %next, "call state changed");
        if let Some(session) = self.session.as_ref() {
            self.emit_state(session, next);
        }
        true
    }

    /// Leave the call in `terminal`, release everything it holds and clear
    /// the slot.
    async fn finish(&mut self, terminal: CallState, failure: Option<CallFailure>) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let from = session.state();
        if from != terminal {
            if session.transition(terminal) {
                self.emit_state(&session, terminal);
            } else if session.transition(CallState::Terminated) {
                self.emit_state(&session, CallState::Terminated);
            }
        }
        if let Some(failure) = failure {
            warn!(call_id = session.id, code = failure.code(), "call failed: {}", failure);
            self.emit_failure(&failure);
            self.status(failure.user_text());
            session.failure = Some(failure);
        }

        if let Some(timer) = session.timer.take() {
            timer.cancel();
        }
        match session.direction {
            CallDirection::Outbound => self.emit(UiEvent::Ringback { active: false }),
            CallDirection::Inbound => self.emit(UiEvent::Alert { active: false }),
        }
        if let Some(mut output) = session.output.take() {
            output.detach_all();
        }
        if let Some(media) = session.media.take() {
            media.close().await;
        }
        if let Some(stream) = session.local_stream.take() {
            stream.stop();
        }

        if session.state() == CallState::Rejected && session.transition(CallState::Terminated) {
            self.emit_state(&session, CallState::Terminated);
        }
        if session.transition(CallState::Idle) {
            self.emit_state(&session, CallState::Idle);
        }
        info!(
            call_id = session.id,
            history = ?session.history(),
            active_tracks = self.devices.active_track_count(),
            "call finished"
        );
        self.last_call = Some(FinishedCall {
            id: session.id.clone(),
            direction: session.direction,
            history: session.history().to_vec(),
            failure: session.failure.take(),
        });
    }

    fn establish(&mut self) {
        if !self.transition(CallState::Established) {
            return;
        }
        let token = CancellationToken::new();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.started_at = Some(Utc::now());
        session.timer = Some(token.clone());
        let call_id = session.id.clone();
        let peer = session.peer_number.clone();
        let direction = session.direction;

        let queue = self.queue.clone();
        let tick_call_id = call_id.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let tick = EngineEvent::Tick { call_id: tick_call_id.clone() };
                        if queue.send(tick).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        if direction == CallDirection::Outbound {
            self.emit(UiEvent::Ringback { active: false });
        }
        self.emit(UiEvent::Duration {
            call_id,
            seconds: 0,
        });
        self.status(format!("In call with {}", peer));
    }

    fn handle_tick(&self, call_id: &str) {
        if let Some(session) = self.session.as_ref() {
            if session.id == call_id && session.state() == CallState::Established {
                self.emit(UiEvent::Duration {
                    call_id: call_id.to_string(),
                    seconds: session.elapsed_secs(),
                });
            }
        }
    }

    async fn handle_media(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Acquired {
                call_id,
                attempt,
                result,
            } => self.on_acquired(&call_id, attempt, result).await,
            MediaEvent::RemoteTrack { call_id, track } => self.on_remote_track(&call_id, track),
            MediaEvent::ConnectionState { call_id, state } => {
                self.on_connection_state(&call_id, state).await
            }
        }
    }

    async fn on_acquired(&mut self, call_id: &str, attempt: u64, result: MicrophoneAcquisition) {
        let current = self.session.as_ref().is_some_and(|s| {
            s.id == call_id && s.pending == Some(PendingOp::Acquiring(attempt))
        });
        if !current {
            if let MicrophoneAcquisition::Granted(stream) = result {
                info!(call_id, attempt, "releasing stream of an abandoned attempt");
                stream.stop();
            }
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.pending = None;
        let direction = session.direction;
        match result.into_result() {
            Ok(stream) => {
                debug!(call_id, stream_id = stream.id(), "microphone granted");
                session.local_stream = Some(stream);
            }
            Err(e) => {
                if direction == CallDirection::Inbound {
                    self.respond(call_id, TEMPORARILY_UNAVAILABLE, None).await;
                }
                self.finish(CallState::Failed, Some(e.into())).await;
                return;
            }
        }

        let outcome = match direction {
            CallDirection::Outbound => self.start_outbound().await,
            CallDirection::Inbound => self.start_inbound().await,
        };
        if let Err(failure) = outcome {
            match direction {
                CallDirection::Inbound => {
                    let code = match failure {
                        CallFailure::Protocol(_) => NOT_ACCEPTABLE_HERE,
                        _ => TEMPORARILY_UNAVAILABLE,
                    };
                    self.respond(call_id, code, None).await;
                }
                CallDirection::Outbound => {
                    if self.session.as_ref().is_some_and(|s| s.invite_sent) {
                        self.signaling.cancel(call_id).await.ok();
                    }
                }
            }
            self.finish(CallState::Failed, Some(failure)).await;
        }
    }

    async fn open_media(&mut self) -> Result<(), CallFailure> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(stream) = session.local_stream.as_ref() else {
            return Err(MediaAcquisitionError::NoDevice.into());
        };
        let media = self
            .media
            .create_session(&session.id, &self.ice, stream, self.queue.clone())
            .await?;
        session.media = Some(media);
        session.output = Some(AudioOutput::new(self.sink.clone()));
        Ok(())
    }

    async fn start_outbound(&mut self) -> Result<(), CallFailure> {
        self.open_media().await?;
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(media) = session.media.as_ref() else {
            return Err(ProtocolError::MediaFailed.into());
        };
        let offer = media.create_local_description(SdpKind::Offer).await?;
        self.signaling
            .send_invite(&session.id, &session.peer_number, offer)
            .await?;
        session.invite_sent = true;
        info!(call_id = session.id, "invite sent");
        Ok(())
    }

    async fn start_inbound(&mut self) -> Result<(), CallFailure> {
        self.transition(CallState::Connecting);
        self.open_media().await?;
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        let offer = session
            .remote_offer
            .clone()
            .ok_or(ProtocolError::MissingRemoteDescription)?;
        validate_remote_description(&offer)?;
        let offer = ensure_muxed_rtcp(&offer);
        let Some(media) = session.media.as_ref() else {
            return Err(ProtocolError::MediaFailed.into());
        };
        media.apply_remote_description(&offer, SdpKind::Offer).await?;
        let answer = media.create_local_description(SdpKind::Answer).await?;
        self.signaling
            .send_response(&session.id, OK, Some(answer))
            .await?;
        self.establish();
        Ok(())
    }

    async fn apply_answer(&mut self, answer: Option<String>) -> Result<(), CallFailure> {
        let answer = answer.ok_or(ProtocolError::MissingRemoteDescription)?;
        validate_remote_description(&answer)?;
        let answer = ensure_muxed_rtcp(&answer);
        let media = self
            .session
            .as_ref()
            .and_then(|s| s.media.as_ref())
            .ok_or(ProtocolError::MediaFailed)?;
        media.apply_remote_description(&answer, SdpKind::Answer).await?;
        Ok(())
    }

    fn on_remote_track(&mut self, call_id: &str, track: RemoteTrack) {
        let Some(session) = self.session.as_mut().filter(|s| s.id == call_id) else {
            debug!(call_id, track_id = track.id, "remote track for unknown call");
            return;
        };
        if !matches!(
            session.state(),
            CallState::Dialing | CallState::Connecting | CallState::Established
        ) {
            debug!(call_id, state = %session.state(), "dropping remote track");
            return;
        }
        let Some(output) = session.output.as_mut() else {
            return;
        };
        if output.attach(track) {
            let tracks = output.track_count();
            self.emit(UiEvent::RemoteAudio {
                call_id: call_id.to_string(),
                tracks,
            });
        }
    }

    async fn on_connection_state(&mut self, call_id: &str, state: MediaConnectionState) {
        let Some(session) = self.session.as_ref().filter(|s| s.id == call_id) else {
            return;
        };
        match state {
            MediaConnectionState::Failed => {
                let call_state = session.state();
                let invite_sent = session.invite_sent;
                warn!(call_id, %call_state, "media connection failed");
                let failure = Some(ProtocolError::MediaFailed.into());
                if call_state == CallState::Established {
                    self.signaling.send_termination(call_id).await.ok();
                    self.finish(CallState::Terminated, failure).await;
                } else {
                    if invite_sent {
                        self.signaling.cancel(call_id).await.ok();
                    }
                    self.finish(CallState::Failed, failure).await;
                }
            }
            MediaConnectionState::Disconnected => {
                warn!(call_id, "media connection interrupted");
            }
            other => debug!(call_id, state = ?other, "media connection state"),
        }
    }

    async fn handle_signaling(&mut self, event: SignalingEvent) {
        if let SignalingEvent::IncomingInvite {
            call_id,
            peer_number,
            offer,
        } = event
        {
            self.receive_invite(&call_id, &peer_number, offer).await;
            return;
        }
        let Some(session) = self.session.as_ref().filter(|s| s.id == event.call_id()) else {
            debug!(call_id = event.call_id(), "signaling event for unknown call");
            return;
        };
        let direction = session.direction;
        let state = session.state();

        match event {
            SignalingEvent::Provisional { call_id, code } => {
                if direction == CallDirection::Outbound && state == CallState::Dialing {
                    info!(call_id, code, "remote is ringing");
                    self.transition(CallState::Connecting);
                    self.emit(UiEvent::Ringback { active: true });
                    self.status("Ringing");
                }
            }
            SignalingEvent::Accepted { call_id, answer } => {
                if direction != CallDirection::Outbound
                    || !matches!(state, CallState::Dialing | CallState::Connecting)
                {
                    debug!(call_id, %state, "ignoring accepted");
                    return;
                }
                if state == CallState::Dialing {
                    self.transition(CallState::Connecting);
                }
                match self.apply_answer(answer).await {
                    Ok(()) => self.establish(),
                    Err(failure) => {
                        self.signaling.send_termination(&call_id).await.ok();
                        self.finish(CallState::Failed, Some(failure)).await;
                    }
                }
            }
            SignalingEvent::Rejected { call_id, code, .. } => {
                let rejection = SignalingRejection::from_status(code);
                info!(call_id, code, reason = rejection.code(), "call rejected by remote");
                self.finish(CallState::Rejected, Some(rejection.into())).await;
            }
            SignalingEvent::Cancelled { call_id } => match direction {
                CallDirection::Inbound => {
                    info!(call_id, "caller cancelled");
                    self.finish(CallState::Terminated, None).await;
                    self.status("Missed call");
                }
                CallDirection::Outbound => {
                    let rejection = SignalingRejection::Cancelled;
                    self.finish(CallState::Rejected, Some(rejection.into())).await;
                }
            },
            SignalingEvent::Terminated { call_id } => {
                info!(call_id, "remote ended the call");
                self.finish(CallState::Terminated, None).await;
                self.status("Call ended");
            }
            SignalingEvent::Failed { call_id, reason } => {
                warn!(call_id, reason, "signaling failed");
                let failure = TransportError::Request(reason).into();
                self.finish(CallState::Failed, Some(failure)).await;
            }
            SignalingEvent::IncomingInvite { .. } => {}
        }
    }

    fn handle_registration(&mut self, status: RegistrationStatus) {
        let previous = self.registration;
        self.registration = status.state;
        if previous != status.state {
            info!(
                from = %previous,
                to = %status.state,
                status_code = ?status.status_code,
                "registration state changed"
            );
        }
        self.emit(UiEvent::Registration {
            state: status.state.to_string(),
            status_code: status.status_code,
        });
        let text = match (&status.error, status.state) {
            (Some(e), _) => format!("Registration problem: {}", e),
            (None, RegistrationState::Registered) => "Ready".to_string(),
            (None, RegistrationState::Connected) => "Connected, registering".to_string(),
            (None, RegistrationState::Connecting) => "Connecting".to_string(),
            (None, RegistrationState::Disconnected) => "Disconnected".to_string(),
        };
        self.status(text);
    }

    async fn collect_stats(&self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(media) = session.media.as_ref() else {
            return;
        };
        match media.stats().await {
            Ok(stats) => self.emit(UiEvent::Stats {
                call_id: session.id.clone(),
                stats,
            }),
            Err(e) => debug!(call_id = session.id, "stats unavailable: {}", e),
        }
    }

    /// End whatever call is in progress with the signaling action its state
    /// needs.
    async fn stop_active_call(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let call_id = session.id.clone();
        match (session.state(), session.direction) {
            (CallState::RingingIn, _) | (CallState::Connecting, CallDirection::Inbound) => {
                self.respond(&call_id, TEMPORARILY_UNAVAILABLE, None).await;
            }
            (CallState::Dialing | CallState::Connecting, CallDirection::Outbound) => {
                if session.invite_sent {
                    self.signaling.cancel(&call_id).await.ok();
                }
            }
            (CallState::Established, _) => {
                self.signaling.send_termination(&call_id).await.ok();
            }
            _ => {}
        }
        self.finish(CallState::Terminated, None).await;
    }

    async fn force_lock(&mut self) {
        if self.locked {
            return;
        }
        self.locked = true;
        info!("agent session force-locked");
        self.stop_active_call().await;
        self.emit(UiEvent::Locked);
        self.status("Agent session locked");
    }

    fn unlock(&mut self) {
        if !self.locked {
            return;
        }
        self.locked = false;
        info!("agent session unlocked");
        self.emit(UiEvent::Unlocked);
        self.status("Ready");
    }
}

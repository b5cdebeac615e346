use super::codecs::{create_decoder, create_encoder, downmix_to_mono, resample::resample_mono, CodecType};
use super::{
    ConnectionStats, IceConfig, LocalMediaStream, MediaConnectionState, MediaEvent, MediaSession,
    MediaTransport, RemoteTrack, SdpKind,
};
use crate::error::ProtocolError;
use crate::event::EventQueue;
use crate::PcmFrame;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMA, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const PTIME: Duration = Duration::from_millis(20);
const SAMPLES_PER_PACKET: usize = 160;

impl From<RTCPeerConnectionState> for MediaConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => MediaConnectionState::New,
            RTCPeerConnectionState::Connecting => MediaConnectionState::Connecting,
            RTCPeerConnectionState::Connected => MediaConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => MediaConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => MediaConnectionState::Failed,
            RTCPeerConnectionState::Closed => MediaConnectionState::Closed,
            RTCPeerConnectionState::Unspecified => MediaConnectionState::New,
        }
    }
}

fn codec_capability(codec: CodecType) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: match codec {
            CodecType::PCMA => MIME_TYPE_PCMA.to_string(),
            CodecType::PCMU => MIME_TYPE_PCMU.to_string(),
        },
        clock_rate: codec.clock_rate(),
        channels: 1,
        sdp_fmtp_line: "".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Creates webrtc peer connections carrying one G.711 audio track each way.
pub struct RtcMediaTransport {
    codec: CodecType,
}

impl Default for RtcMediaTransport {
    fn default() -> Self {
        Self::new(CodecType::PCMA)
    }
}

impl RtcMediaTransport {
    pub fn new(codec: CodecType) -> Self {
        Self { codec }
    }

    fn media_engine(&self) -> Result<MediaEngine> {
        let mut m = MediaEngine::default();
        // preferred codec first
        let others = [CodecType::PCMA, CodecType::PCMU]
            .into_iter()
            .filter(|c| *c != self.codec);
        for codec in std::iter::once(self.codec).chain(others) {
            m.register_codec(
                RTCRtpCodecParameters {
                    capability: codec_capability(codec),
                    payload_type: codec.payload_type(),
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )?;
        }
        Ok(m)
    }

    async fn build(
        &self,
        call_id: &str,
        ice: &IceConfig,
        local: &LocalMediaStream,
        events: EventQueue,
    ) -> Result<RtcMediaSession> {
        let mut m = self.media_engine()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;
        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let config: RTCConfiguration = ice.into();
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);
        let token = CancellationToken::new();

        let state_events = events.clone();
        let state_call_id = call_id.to_string();
        peer_connection.on_peer_connection_state_change(Box::new(move |s| {
            let state: MediaConnectionState = s.into();
            info!(call_id = state_call_id, ?state, "peer connection state changed");
            state_events
                .send(
                    MediaEvent::ConnectionState {
                        call_id: state_call_id.clone(),
                        state,
                    }
                    .into(),
                )
                .ok();
            Box::pin(async {})
        }));

        let track_events = events.clone();
        let track_call_id = call_id.to_string();
        let track_token = token.clone();
        peer_connection.on_track(Box::new(move |track, _, _| {
            let events = track_events.clone();
            let call_id = track_call_id.clone();
            let token = track_token.child_token();
            Box::pin(async move {
                spawn_remote_reader(call_id, track, events, token);
            })
        }));

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            codec_capability(self.codec),
            format!("audio-{}", uuid::Uuid::new_v4()),
            format!("agentphone-{}", call_id),
        ));
        let rtp_sender = peer_connection
            .add_track(audio_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        // drain rtcp so interceptors keep working
        let rtcp_token = token.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    _ = rtcp_token.cancelled() => break,
                    r = rtp_sender.read(&mut rtcp_buf) => if r.is_err() { break },
                }
            }
        });

        match local.take_frames() {
            Some(frames) => {
                spawn_uplink(
                    call_id.to_string(),
                    self.codec,
                    frames,
                    audio_track,
                    token.clone(),
                );
            }
            None => warn!(call_id, "local stream has no frames to send"),
        }

        Ok(RtcMediaSession {
            call_id: call_id.to_string(),
            peer_connection,
            token,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MediaTransport for RtcMediaTransport {
    async fn create_session(
        &self,
        call_id: &str,
        ice: &IceConfig,
        local: &LocalMediaStream,
        events: EventQueue,
    ) -> Result<Box<dyn MediaSession>, ProtocolError> {
        match self.build(call_id, ice, local, events).await {
            Ok(session) => Ok(Box::new(session)),
            Err(e) => Err(ProtocolError::Negotiation(e.to_string())),
        }
    }
}

fn spawn_uplink(
    call_id: String,
    codec: CodecType,
    mut frames: mpsc::Receiver<PcmFrame>,
    track: Arc<TrackLocalStaticSample>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut encoder = create_encoder(codec);
        let mut pending: Vec<i16> = Vec::with_capacity(SAMPLES_PER_PACKET * 4);
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let mono = downmix_to_mono(&frame.samples, frame.channels);
            pending.extend(resample_mono(&mono, frame.sample_rate, encoder.sample_rate()));
            while pending.len() >= SAMPLES_PER_PACKET {
                let chunk: Vec<i16> = pending.drain(..SAMPLES_PER_PACKET).collect();
                let payload = encoder.encode(&chunk);
                if let Err(e) = track
                    .write_sample(&webrtc::media::Sample {
                        data: Bytes::from(payload),
                        duration: PTIME,
                        ..Default::default()
                    })
                    .await
                {
                    debug!(call_id, "failed to write audio sample: {}", e);
                }
            }
        }
        debug!(call_id, "uplink stopped");
    });
}

fn spawn_remote_reader(
    call_id: String,
    track: Arc<TrackRemote>,
    events: EventQueue,
    token: CancellationToken,
) {
    let mime = track.codec().capability.mime_type;
    let Some(codec) = CodecType::from_mime_type(&mime) else {
        warn!(call_id, mime, "ignoring remote track with unsupported codec");
        return;
    };
    let track_id = track.id();
    let (frame_tx, frame_rx) = mpsc::channel(50);
    info!(call_id, track_id, ?codec, "remote audio track");
    events
        .send(
            MediaEvent::RemoteTrack {
                call_id: call_id.clone(),
                track: RemoteTrack {
                    id: track_id.clone(),
                    frames: frame_rx,
                },
            }
            .into(),
        )
        .ok();

    tokio::spawn(async move {
        let mut decoder = create_decoder(codec);
        loop {
            let packet = tokio::select! {
                _ = token.cancelled() => break,
                r = track.read_rtp() => match r {
                    Ok((packet, _)) => packet,
                    Err(e) => {
                        debug!(call_id, track_id, "remote track read ended: {}", e);
                        break;
                    }
                },
            };
            if packet.payload.is_empty() {
                continue;
            }
            let frame = PcmFrame {
                samples: decoder.decode(&packet.payload),
                sample_rate: decoder.sample_rate(),
                channels: 1,
            };
            if frame_tx.try_send(frame).is_err() && frame_tx.is_closed() {
                break;
            }
        }
    });
}

pub struct RtcMediaSession {
    call_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    token: CancellationToken,
    closed: AtomicBool,
}

#[async_trait]
impl MediaSession for RtcMediaSession {
    async fn create_local_description(&self, kind: SdpKind) -> Result<String, ProtocolError> {
        let pc = &self.peer_connection;
        let description = match kind {
            SdpKind::Offer => pc.create_offer(None).await,
            SdpKind::Answer => pc.create_answer(None).await,
        }
        .map_err(|e| ProtocolError::Negotiation(e.to_string()))?;

        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(description)
            .await
            .map_err(|e| ProtocolError::Negotiation(e.to_string()))?;
        let _ = gather_complete.recv().await;

        match pc.local_description().await {
            Some(local) => {
                debug!(call_id = self.call_id, ?kind, "local description ready");
                Ok(local.sdp)
            }
            None => Err(ProtocolError::Negotiation(
                "no local description after gathering".to_string(),
            )),
        }
    }

    async fn apply_remote_description(
        &self,
        sdp: &str,
        kind: SdpKind,
    ) -> Result<(), ProtocolError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| ProtocolError::MalformedRemoteDescription(e.to_string()))?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| ProtocolError::Negotiation(e.to_string()))
    }

    async fn stats(&self) -> Result<ConnectionStats> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("media session closed"));
        }
        let report = self.peer_connection.get_stats().await;
        let mut stats = ConnectionStats::default();
        for (_, entry) in report.reports.iter() {
            match entry {
                StatsReportType::OutboundRTP(outbound) => {
                    stats.packets_sent += outbound.packets_sent;
                    stats.bytes_sent += outbound.bytes_sent;
                }
                StatsReportType::InboundRTP(inbound) => {
                    stats.packets_received += inbound.packets_received;
                    stats.bytes_received += inbound.bytes_received;
                }
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        if let Err(e) = self.peer_connection.close().await {
            warn!(call_id = self.call_id, "failed to close peer connection: {}", e);
        }
        info!(call_id = self.call_id, "media session closed");
    }
}

impl Drop for RtcMediaSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

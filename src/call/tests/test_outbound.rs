use crate::call::testing::{MockAudioBackend, MockStack, SignalCall, SAMPLE_SDP};
use crate::call::CallState;
use crate::error::{CallFailure, MediaAcquisitionError, ProtocolError, SignalingRejection};
use crate::event::{Command, EngineEvent, UiEvent};
use crate::media::device::DeviceDescriptor;
use crate::media::{MediaConnectionState, MediaEvent, RemoteTrack, SdpKind};
use crate::useragent::{RegistrationState, RegistrationStatus, SignalingEvent};
use crate::PcmFrame;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn errors(events: &[UiEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            UiEvent::Error { code, message } => Some((code.clone(), message.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_outbound_call_lifecycle() {
    let mut stack = MockStack::new().await;
    stack
        .command(Command::PlaceCall {
            number: " 1002 ".to_string(),
        })
        .await;
    assert_eq!(stack.state(), CallState::Dialing);
    let call_id = stack.call_id().unwrap();
    assert_eq!(
        stack.signaling.calls(),
        vec![SignalCall::Invite {
            call_id: call_id.clone(),
            target: "1002".to_string(),
            offer: SAMPLE_SDP.to_string(),
        }]
    );
    assert_eq!(stack.devices.active_track_count(), 1);

    stack
        .signal(SignalingEvent::Provisional {
            call_id: call_id.clone(),
            code: 180,
        })
        .await;
    assert_eq!(stack.state(), CallState::Connecting);
    assert!(stack
        .ui_events()
        .contains(&UiEvent::Ringback { active: true }));

    stack
        .signal(SignalingEvent::Accepted {
            call_id: call_id.clone(),
            answer: Some(SAMPLE_SDP.to_string()),
        })
        .await;
    assert_eq!(stack.state(), CallState::Established);
    let events = stack.ui_events();
    assert!(events.contains(&UiEvent::Ringback { active: false }));
    assert!(events.contains(&UiEvent::Duration {
        call_id: call_id.clone(),
        seconds: 0
    }));
    assert!(stack.engine.session().unwrap().started_at.is_some());

    let remotes = stack.media.remotes();
    assert_eq!(remotes.len(), 1);
    assert_eq!(remotes[0].0, SdpKind::Answer);
    assert_eq!(remotes[0].1.matches("a=rtcp-mux").count(), 1);

    stack.command(Command::Hangup).await;
    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(
        stack.signaling.calls().last(),
        Some(&SignalCall::Termination { call_id })
    );
    assert_eq!(stack.devices.active_track_count(), 0);
    assert_eq!(stack.media.closed.load(Ordering::SeqCst), 1);

    let finished = stack.engine.last_call().unwrap();
    assert_eq!(
        finished.history,
        vec![
            CallState::Idle,
            CallState::Dialing,
            CallState::Connecting,
            CallState::Established,
            CallState::Terminated,
            CallState::Idle,
        ]
    );
    assert_eq!(finished.failure, None);
}

#[tokio::test]
async fn test_answer_without_provisional_passes_connecting() {
    let mut stack = MockStack::new().await;
    stack
        .command(Command::PlaceCall {
            number: "1002".to_string(),
        })
        .await;
    let call_id = stack.call_id().unwrap();
    stack
        .signal(SignalingEvent::Accepted {
            call_id,
            answer: Some(SAMPLE_SDP.to_string()),
        })
        .await;
    assert_eq!(stack.state(), CallState::Established);
    assert_eq!(
        stack.engine.session().unwrap().history(),
        &[
            CallState::Idle,
            CallState::Dialing,
            CallState::Connecting,
            CallState::Established,
        ]
    );
}

#[tokio::test]
async fn test_denied_microphone_never_sends_invite() {
    let backend = MockAudioBackend::with_devices(vec![DeviceDescriptor {
        id: "mic-1".to_string(),
        label: "USB Headset".to_string(),
        is_default: false,
    }]);
    backend.deny();
    let mut stack = MockStack::with_backend(backend).await;
    stack
        .command(Command::PlaceCall {
            number: "1002".to_string(),
        })
        .await;

    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(stack.signaling.invites(), 0);
    assert_eq!(stack.media.sessions.load(Ordering::SeqCst), 0);
    let finished = stack.engine.last_call().unwrap();
    assert_eq!(
        finished.failure,
        Some(CallFailure::Media(MediaAcquisitionError::PermissionDenied))
    );
    assert_eq!(
        finished.history,
        vec![
            CallState::Idle,
            CallState::Dialing,
            CallState::Failed,
            CallState::Idle
        ]
    );
    let errors = errors(&stack.ui_events());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "permission-denied");
}

#[tokio::test]
async fn test_busy_remote_reports_busy() {
    let mut stack = MockStack::new().await;
    stack
        .command(Command::PlaceCall {
            number: "1002".to_string(),
        })
        .await;
    let call_id = stack.call_id().unwrap();
    stack
        .signal(SignalingEvent::Provisional {
            call_id: call_id.clone(),
            code: 180,
        })
        .await;
    stack.ui_events();
    stack
        .signal(SignalingEvent::Rejected {
            call_id,
            code: 486,
            reason: Some("Busy Here".to_string()),
        })
        .await;

    assert_eq!(stack.state(), CallState::Idle);
    let events = stack.ui_events();
    assert_eq!(errors(&events), vec![("busy".to_string(), "busy".to_string())]);
    assert!(events.contains(&UiEvent::Ringback { active: false }));
    let finished = stack.engine.last_call().unwrap();
    assert_eq!(
        finished.failure,
        Some(CallFailure::Rejected(SignalingRejection::Busy))
    );
    assert_eq!(
        finished.history,
        vec![
            CallState::Idle,
            CallState::Dialing,
            CallState::Connecting,
            CallState::Rejected,
            CallState::Terminated,
            CallState::Idle,
        ]
    );
    assert_eq!(stack.devices.active_track_count(), 0);
}

#[tokio::test]
async fn test_place_call_preconditions() {
    let mut stack = MockStack::new().await;
    stack
        .command(Command::PlaceCall {
            number: "   ".to_string(),
        })
        .await;
    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(errors(&stack.ui_events())[0].0, "empty-number");

    stack
        .command(Command::PlaceCall {
            number: "1002".to_string(),
        })
        .await;
    let call_id = stack.call_id().unwrap();
    stack
        .command(Command::PlaceCall {
            number: "1003".to_string(),
        })
        .await;
    assert_eq!(stack.call_id().unwrap(), call_id);
    assert_eq!(stack.signaling.invites(), 1);
    assert!(errors(&stack.ui_events())
        .iter()
        .any(|(code, _)| code == "session-active"));

    stack.command(Command::Hangup).await;
    stack.register(RegistrationState::Connecting).await;
    stack
        .command(Command::PlaceCall {
            number: "1002".to_string(),
        })
        .await;
    assert_eq!(stack.state(), CallState::Idle);
    assert!(errors(&stack.ui_events())
        .iter()
        .any(|(code, _)| code == "not-registered"));
}

#[tokio::test]
async fn test_hangup_while_dialing_cancels_invite() {
    let mut stack = MockStack::new().await;
    stack
        .command(Command::PlaceCall {
            number: "1002".to_string(),
        })
        .await;
    let call_id = stack.call_id().unwrap();
    stack.command(Command::Hangup).await;
    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(
        stack.signaling.calls().last(),
        Some(&SignalCall::Cancel { call_id })
    );
    assert_eq!(stack.devices.active_track_count(), 0);
}

#[tokio::test]
async fn test_hangup_before_microphone_releases_late_stream() {
    let mut stack = MockStack::new().await;
    stack
        .engine
        .handle(
            Command::PlaceCall {
                number: "1002".to_string(),
            }
            .into(),
        )
        .await;
    stack.engine.handle(Command::Hangup.into()).await;
    assert_eq!(stack.state(), CallState::Idle);

    stack.settle().await;
    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(stack.signaling.calls(), vec![]);
    assert_eq!(stack.devices.active_track_count(), 0);
}

#[tokio::test]
async fn test_missing_answer_fails_and_hangs_up() {
    let mut stack = MockStack::new().await;
    stack
        .command(Command::PlaceCall {
            number: "1002".to_string(),
        })
        .await;
    let call_id = stack.call_id().unwrap();
    stack
        .signal(SignalingEvent::Accepted {
            call_id: call_id.clone(),
            answer: None,
        })
        .await;

    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(
        stack.signaling.calls().last(),
        Some(&SignalCall::Termination { call_id })
    );
    assert_eq!(
        stack.engine.last_call().unwrap().failure,
        Some(CallFailure::Protocol(ProtocolError::MissingRemoteDescription))
    );
    assert!(stack.media.remotes().is_empty());
}

#[tokio::test]
async fn test_media_failure_ends_established_call() {
    let mut stack = MockStack::new().await;
    let call_id = stack.establish_outbound("1002").await;
    stack.ui_events();
    stack
        .queue
        .send(
            MediaEvent::ConnectionState {
                call_id: call_id.clone(),
                state: MediaConnectionState::Failed,
            }
            .into(),
        )
        .unwrap();
    stack.settle().await;

    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(
        stack.signaling.calls().last(),
        Some(&SignalCall::Termination { call_id })
    );
    assert_eq!(errors(&stack.ui_events())[0].0, "media-failed");
    let history = &stack.engine.last_call().unwrap().history;
    assert_eq!(history[history.len() - 2], CallState::Terminated);
}

#[tokio::test]
async fn test_remote_tracks_reach_output() {
    let mut stack = MockStack::new().await;
    let call_id = stack.establish_outbound("1002").await;
    let (tx, frames) = tokio::sync::mpsc::channel(4);
    for _ in 0..2 {
        let (_, dup) = tokio::sync::mpsc::channel(1);
        let track = RemoteTrack {
            id: "remote-audio".to_string(),
            frames: dup,
        };
        stack
            .queue
            .send(
                MediaEvent::RemoteTrack {
                    call_id: call_id.clone(),
                    track,
                }
                .into(),
            )
            .unwrap();
    }
    stack
        .queue
        .send(
            MediaEvent::RemoteTrack {
                call_id: call_id.clone(),
                track: RemoteTrack {
                    id: "remote-audio-2".to_string(),
                    frames,
                },
            }
            .into(),
        )
        .unwrap();
    stack.settle().await;
    assert_eq!(stack.engine.session().unwrap().remote_track_count(), 2);

    tx.send(PcmFrame {
        samples: vec![0; 160],
        sample_rate: 8000,
        channels: 1,
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(stack.sink.samples_written(), 160);

    let tracks: Vec<_> = stack
        .ui_events()
        .into_iter()
        .filter_map(|e| match e {
            UiEvent::RemoteAudio { tracks, .. } => Some(tracks),
            _ => None,
        })
        .collect();
    assert_eq!(tracks, vec![1, 1, 2]);
}

#[tokio::test]
async fn test_stats_and_duration() {
    let mut stack = MockStack::new().await;
    let call_id = stack.establish_outbound("1002").await;
    stack.ui_events();

    stack.command(Command::CollectStats).await;
    stack
        .queue
        .send(EngineEvent::Tick {
            call_id: call_id.clone(),
        })
        .unwrap();
    stack.settle().await;
    let events = stack.ui_events();
    assert!(events.iter().any(|e| matches!(
        e,
        UiEvent::Stats { stats, .. } if stats.packets_sent == 50
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, UiEvent::Duration { call_id: id, .. } if *id == call_id)));
}

#[tokio::test]
async fn test_registration_loss_keeps_established_call() {
    let mut stack = MockStack::new().await;
    stack.establish_outbound("1002").await;
    stack
        .queue
        .send(
            RegistrationStatus {
                state: RegistrationState::Connected,
                status_code: Some(403),
                error: None,
            }
            .into(),
        )
        .unwrap();
    stack.settle().await;
    assert_eq!(stack.state(), CallState::Established);
    assert!(stack.ui_events().contains(&UiEvent::Registration {
        state: "connected".to_string(),
        status_code: Some(403),
    }));
}

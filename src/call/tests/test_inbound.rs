use crate::call::testing::{MockAudioBackend, MockStack, SignalCall, SAMPLE_SDP};
use crate::call::CallState;
use crate::error::{CallFailure, MediaAcquisitionError};
use crate::event::{Command, UiEvent};
use crate::media::SdpKind;
use crate::useragent::SignalingEvent;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_incoming_call_accepted() {
    let mut stack = MockStack::new().await;
    stack.incoming("in-1", "1001").await;
    assert_eq!(stack.state(), CallState::RingingIn);
    assert_eq!(stack.signaling.responses(), vec![180]);
    let events = stack.ui_events();
    assert!(events.contains(&UiEvent::IncomingCall {
        call_id: "in-1".to_string(),
        peer: "1001".to_string(),
    }));
    assert!(events.contains(&UiEvent::Alert { active: true }));

    stack.command(Command::Accept).await;
    assert_eq!(stack.state(), CallState::Established);
    assert_eq!(
        stack.signaling.calls().last(),
        Some(&SignalCall::Response {
            call_id: "in-1".to_string(),
            code: 200,
            answer: Some(SAMPLE_SDP.to_string()),
        })
    );
    let remotes = stack.media.remotes();
    assert_eq!(remotes.len(), 1);
    assert_eq!(remotes[0].0, SdpKind::Offer);
    assert_eq!(remotes[0].1.matches("a=rtcp-mux").count(), 1);
    assert!(stack.ui_events().contains(&UiEvent::Alert { active: false }));
    assert_eq!(
        stack.engine.session().unwrap().history(),
        &[
            CallState::Idle,
            CallState::RingingIn,
            CallState::Connecting,
            CallState::Established,
        ]
    );

    stack
        .signal(SignalingEvent::Terminated {
            call_id: "in-1".to_string(),
        })
        .await;
    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(stack.devices.active_track_count(), 0);
    assert_eq!(stack.media.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_incoming_while_established_is_busy() {
    let mut stack = MockStack::new().await;
    let call_id = stack.establish_outbound("1002").await;
    let before = stack.engine.session().unwrap().history().to_vec();

    stack.incoming("in-2", "1003").await;
    assert_eq!(stack.call_id(), Some(call_id));
    assert_eq!(stack.state(), CallState::Established);
    assert_eq!(stack.engine.session().unwrap().history(), &before[..]);
    assert_eq!(
        stack.signaling.calls().last(),
        Some(&SignalCall::Response {
            call_id: "in-2".to_string(),
            code: 486,
            answer: None,
        })
    );
    assert!(!stack
        .ui_events()
        .iter()
        .any(|e| matches!(e, UiEvent::IncomingCall { .. })));
}

#[tokio::test]
async fn test_accept_is_not_reentrant() {
    let mut stack = MockStack::new().await;
    stack.incoming("in-3", "1001").await;
    stack.engine.handle(Command::Accept.into()).await;
    stack.engine.handle(Command::Accept.into()).await;
    stack.settle().await;

    assert_eq!(stack.state(), CallState::Established);
    assert_eq!(stack.media.sessions.load(Ordering::SeqCst), 1);
    assert_eq!(stack.signaling.responses(), vec![180, 200]);
    assert_eq!(stack.devices.active_track_count(), 1);
}

#[tokio::test]
async fn test_reject_incoming() {
    let mut stack = MockStack::new().await;
    stack.incoming("in-4", "1001").await;
    stack.ui_events();
    stack.command(Command::Reject).await;

    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(stack.signaling.responses(), vec![180, 486]);
    assert!(stack.ui_events().contains(&UiEvent::Alert { active: false }));
    let finished = stack.engine.last_call().unwrap();
    assert_eq!(
        finished.history,
        vec![
            CallState::Idle,
            CallState::RingingIn,
            CallState::Rejected,
            CallState::Terminated,
            CallState::Idle,
        ]
    );
    assert_eq!(finished.failure, None);
}

#[tokio::test]
async fn test_caller_cancels_while_ringing() {
    let mut stack = MockStack::new().await;
    stack.incoming("in-5", "1001").await;
    stack
        .signal(SignalingEvent::Cancelled {
            call_id: "in-5".to_string(),
        })
        .await;
    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(stack.signaling.responses(), vec![180]);
    assert_eq!(
        stack.engine.last_call().unwrap().history,
        vec![
            CallState::Idle,
            CallState::RingingIn,
            CallState::Terminated,
            CallState::Idle,
        ]
    );
}

#[tokio::test]
async fn test_accept_with_denied_microphone() {
    let backend = MockAudioBackend::with_devices(vec![]);
    backend.deny();
    let mut stack = MockStack::with_backend(backend).await;
    stack.incoming("in-6", "1001").await;
    stack.command(Command::Accept).await;

    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(stack.signaling.responses(), vec![180, 480]);
    assert_eq!(stack.media.sessions.load(Ordering::SeqCst), 0);
    assert!(matches!(
        stack.engine.last_call().unwrap().failure,
        Some(CallFailure::Media(
            MediaAcquisitionError::PermissionDenied | MediaAcquisitionError::NoDevice
        ))
    ));
}

#[tokio::test]
async fn test_invite_without_offer_is_refused() {
    let mut stack = MockStack::new().await;
    stack
        .signal(SignalingEvent::IncomingInvite {
            call_id: "in-7".to_string(),
            peer_number: "1001".to_string(),
            offer: None,
        })
        .await;
    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(stack.signaling.responses(), vec![488]);
}

#[tokio::test]
async fn test_rejected_offer_fails_call() {
    let mut stack = MockStack::new().await;
    stack.media.fail_apply(true);
    stack.incoming("in-8", "1001").await;
    stack.command(Command::Accept).await;
    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(stack.signaling.responses(), vec![180, 488]);
    assert_eq!(stack.devices.active_track_count(), 0);
    assert_eq!(stack.media.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_force_lock_ends_call_and_refuses_new_ones() {
    let mut stack = MockStack::new().await;
    let call_id = stack.establish_outbound("1002").await;
    stack.command(Command::ForceLock).await;

    assert!(stack.engine.is_locked());
    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(
        stack.signaling.calls().last(),
        Some(&SignalCall::Termination { call_id })
    );
    assert!(stack.ui_events().contains(&UiEvent::Locked));

    stack.incoming("in-9", "1001").await;
    assert_eq!(stack.signaling.responses(), vec![480]);
    stack
        .command(Command::PlaceCall {
            number: "1002".to_string(),
        })
        .await;
    assert_eq!(stack.state(), CallState::Idle);
    assert!(stack
        .ui_events()
        .iter()
        .any(|e| matches!(e, UiEvent::Error { code, .. } if code == "locked")));

    stack.command(Command::Unlock).await;
    assert!(!stack.engine.is_locked());
    assert!(stack.ui_events().contains(&UiEvent::Unlocked));
    stack.incoming("in-10", "1001").await;
    assert_eq!(stack.state(), CallState::RingingIn);
}

#[tokio::test]
async fn test_device_listing_and_selection() {
    let mut stack = MockStack::new().await;
    stack.command(Command::ListDevices).await;
    let listed = stack.ui_events().into_iter().find_map(|e| match e {
        UiEvent::Devices { devices } => Some(devices),
        _ => None,
    });
    assert_eq!(listed.unwrap()[0].id, "input-0");

    stack
        .command(Command::SelectDevice {
            device_id: "mic-1".to_string(),
        })
        .await;
    assert_eq!(stack.devices.remembered_device(), Some("mic-1".to_string()));
}

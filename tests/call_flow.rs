use agentphone::call::testing::{MockStack, SignalCall, SAMPLE_SDP};
use agentphone::call::CallState;
use agentphone::event::{Command, UiEvent};
use agentphone::media::{MediaConnectionState, MediaEvent};
use agentphone::useragent::SignalingEvent;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

fn assert_follows_table(history: &[CallState]) {
    for pair in history.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "illegal transition {} -> {} in {:?}",
            pair[0],
            pair[1],
            history
        );
    }
    let inner = &history[1..history.len() - 1];
    let unique: HashSet<_> = inner.iter().collect();
    assert_eq!(unique.len(), inner.len(), "state revisited in {:?}", history);
}

#[tokio::test]
async fn test_place_call_to_hangup() {
    let mut stack = MockStack::new().await;
    stack
        .command(Command::PlaceCall {
            number: "5551234".to_string(),
        })
        .await;
    let call_id = stack.call_id().expect("session created");
    match &stack.signaling.calls()[0] {
        SignalCall::Invite { target, offer, .. } => {
            assert_eq!(target, "5551234");
            assert_eq!(offer, SAMPLE_SDP);
        }
        other => panic!("expected invite, got {:?}", other),
    }

    stack
        .signal(SignalingEvent::Accepted {
            call_id: call_id.clone(),
            answer: Some(SAMPLE_SDP.to_string()),
        })
        .await;
    assert_eq!(stack.state(), CallState::Established);

    stack.command(Command::Hangup).await;
    assert_eq!(stack.state(), CallState::Idle);
    assert_eq!(stack.devices.active_track_count(), 0);

    let states: Vec<_> = stack
        .ui_events()
        .into_iter()
        .filter_map(|e| match e {
            UiEvent::CallState { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(states.first(), Some(&CallState::Dialing));
    assert_eq!(states.last(), Some(&CallState::Idle));
    assert_follows_table(&stack.engine.last_call().unwrap().history);
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Place,
    Accept,
    Reject,
    Hangup,
    Ringing,
    Answer,
    Busy,
    RemoteBye,
    Incoming,
    MediaFailed,
}

const STEPS: [Step; 10] = [
    Step::Place,
    Step::Accept,
    Step::Reject,
    Step::Hangup,
    Step::Ringing,
    Step::Answer,
    Step::Busy,
    Step::RemoteBye,
    Step::Incoming,
    Step::MediaFailed,
];

#[tokio::test]
async fn test_random_sequences_follow_transition_table() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut stack = MockStack::new().await;
    let mut incoming = 0;

    for _ in 0..60 {
        let step = STEPS[rng.random_range(0..STEPS.len())];
        let call_id = stack.call_id().unwrap_or_else(|| "none".to_string());
        match step {
            Step::Place => {
                stack
                    .command(Command::PlaceCall {
                        number: "5551234".to_string(),
                    })
                    .await
            }
            Step::Accept => stack.command(Command::Accept).await,
            Step::Reject => stack.command(Command::Reject).await,
            Step::Hangup => stack.command(Command::Hangup).await,
            Step::Ringing => {
                stack
                    .signal(SignalingEvent::Provisional { call_id, code: 180 })
                    .await
            }
            Step::Answer => {
                stack
                    .signal(SignalingEvent::Accepted {
                        call_id,
                        answer: Some(SAMPLE_SDP.to_string()),
                    })
                    .await
            }
            Step::Busy => {
                stack
                    .signal(SignalingEvent::Rejected {
                        call_id,
                        code: 486,
                        reason: None,
                    })
                    .await
            }
            Step::RemoteBye => stack.signal(SignalingEvent::Terminated { call_id }).await,
            Step::Incoming => {
                incoming += 1;
                stack.incoming(&format!("in-{}", incoming), "1001").await
            }
            Step::MediaFailed => {
                stack
                    .queue
                    .send(
                        MediaEvent::ConnectionState {
                            call_id,
                            state: MediaConnectionState::Failed,
                        }
                        .into(),
                    )
                    .ok();
                stack.settle().await;
            }
        }

        if let Some(session) = stack.engine.session() {
            let history = session.history().to_vec();
            for pair in history.windows(2) {
                assert!(pair[0].can_transition_to(pair[1]), "{:?}", history);
            }
        } else {
            assert_eq!(stack.devices.active_track_count(), 0, "after {:?}", step);
        }
        if let Some(finished) = stack.engine.last_call() {
            assert_follows_table(&finished.history);
            assert_eq!(finished.history.last(), Some(&CallState::Idle));
        }
    }
}

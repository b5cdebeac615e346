use crate::call::{CallDirection, CallSession, CallState};

const ALL: [CallState; 8] = [
    CallState::Idle,
    CallState::Dialing,
    CallState::RingingIn,
    CallState::Connecting,
    CallState::Established,
    CallState::Rejected,
    CallState::Failed,
    CallState::Terminated,
];

#[test]
fn test_idle_only_leads_to_dialing_or_ringing() {
    let reachable: Vec<_> = ALL
        .iter()
        .filter(|s| CallState::Idle.can_transition_to(**s))
        .collect();
    assert_eq!(reachable, vec![&CallState::Dialing, &CallState::RingingIn]);
}

#[test]
fn test_terminal_states_only_return_to_idle() {
    for state in ALL.iter().filter(|s| s.is_terminal()) {
        for next in ALL {
            let allowed = state.can_transition_to(next);
            match (state, next) {
                (_, CallState::Idle) => assert!(allowed, "{} -> idle", state),
                (CallState::Rejected, CallState::Terminated) => assert!(allowed),
                _ => assert!(!allowed, "{} -> {}", state, next),
            }
        }
    }
}

#[test]
fn test_established_cannot_fail_or_reject() {
    assert!(!CallState::Established.can_transition_to(CallState::Failed));
    assert!(!CallState::Established.can_transition_to(CallState::Rejected));
    assert!(!CallState::Established.can_transition_to(CallState::Connecting));
    assert!(CallState::Established.can_transition_to(CallState::Terminated));
}

#[test]
fn test_session_refuses_table_violations() {
    let mut session = CallSession::new("c1".into(), CallDirection::Outbound, "1002".into());
    assert_eq!(session.state(), CallState::Dialing);
    assert!(!session.transition(CallState::Established));
    assert!(!session.transition(CallState::Idle));
    assert!(session.transition(CallState::Connecting));
    assert!(session.transition(CallState::Established));
    assert!(!session.transition(CallState::Connecting));
    assert!(session.transition(CallState::Terminated));
    assert!(session.transition(CallState::Idle));
    assert_eq!(
        session.history(),
        &[
            CallState::Idle,
            CallState::Dialing,
            CallState::Connecting,
            CallState::Established,
            CallState::Terminated,
            CallState::Idle,
        ]
    );
}

#[test]
fn test_inbound_session_starts_ringing() {
    let session = CallSession::new("c2".into(), CallDirection::Inbound, "1001".into());
    assert_eq!(session.state(), CallState::RingingIn);
    assert_eq!(session.elapsed_secs(), 0);
    assert_eq!(session.remote_track_count(), 0);
    assert_eq!(serde_json::to_string(&session.state()).unwrap(), "\"ringingIn\"");
}

use super::*;
use chrono::TimeZone;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("timestamp")
}

fn offer() -> SessionDescription {
    SessionDescription::offer("v=0 test-offer")
}

fn answer() -> SessionDescription {
    SessionDescription::answer("v=0 test-answer")
}

fn alice() -> UserId {
    UserId::new("alice")
}

fn bob() -> UserId {
    UserId::new("bob")
}

#[test]
fn second_start_call_is_rejected_without_touching_the_session() {
    let mut machine = CallMachine::new();
    let call_id = machine
        .start_call(&alice(), bob(), offer(), at(0))
        .expect("first call");

    let err = machine
        .start_call(&alice(), UserId::new("carol"), offer(), at(1))
        .expect_err("second call must be rejected");
    assert_eq!(err, CallError::Busy(bob()));

    let session = machine.session().expect("session");
    assert_eq!(session.call_id, call_id);
    assert_eq!(session.remote_user, bob());
    assert_eq!(session.state, CallState::Calling);
}

#[test]
fn hangup_before_answer_logs_a_zero_duration_call() {
    // A calls B, B never answers, A hangs up.
    let mut machine = CallMachine::new();
    machine
        .start_call(&alice(), bob(), offer(), at(0))
        .expect("start");
    assert_eq!(machine.state(), CallState::Calling);

    let end = machine
        .end_call(EndReason::LocalHangup, at(5))
        .expect("end summary");
    assert_eq!(end.duration_ms, 0);
    assert!(!end.was_connected);
    assert!(end.log_entry);
    assert!(end.notify_remote);
    assert_eq!(machine.state(), CallState::Idle);
}

#[test]
fn full_handshake_connects_both_sides_and_ends_once_each() {
    // A calls B, B accepts, the link connects, B hangs up.
    let mut caller = CallMachine::new();
    let mut callee = CallMachine::new();

    let caller_id = caller
        .start_call(&alice(), bob(), offer(), at(0))
        .expect("start");

    let disposition = callee.on_call_request(alice(), Some(caller_id.clone()), true, &bob(), at(1));
    assert_eq!(
        disposition,
        IncomingDisposition::Surface {
            caller: alice(),
            call_id: caller_id.clone(),
        }
    );
    assert_eq!(callee.state(), CallState::RingingIncoming);

    assert_eq!(callee.begin_accept().expect("begin accept"), alice());
    callee
        .complete_accept(offer(), answer())
        .expect("complete accept");
    assert_eq!(callee.state(), CallState::Negotiating);

    caller.on_answer(answer()).expect("answer applied");
    assert_eq!(caller.state(), CallState::Negotiating);

    let connect_time = at(10);
    assert!(caller.on_link_connected(connect_time).is_some());
    assert!(callee.on_link_connected(connect_time).is_some());
    assert_eq!(caller.state(), CallState::Connected);
    assert_eq!(callee.state(), CallState::Connected);

    let callee_end = callee
        .end_call(EndReason::LocalHangup, at(40))
        .expect("callee end");
    assert_eq!(callee_end.duration_ms, 30_000);
    assert!(callee_end.log_entry);
    assert!(callee_end.was_connected);

    let caller_end = caller
        .end_call(EndReason::RemoteEnded, at(40))
        .expect("caller end");
    assert_eq!(caller_end.duration_ms, 30_000);
    assert!(caller_end.log_entry);
    assert!(!caller_end.notify_remote);

    // Both machines are back to Idle; a second teardown is a no-op.
    assert!(caller.end_call(EndReason::RemoteEnded, at(41)).is_none());
    assert!(callee.end_call(EndReason::LocalHangup, at(41)).is_none());
}

#[test]
fn racing_local_hangup_and_remote_end_log_exactly_once() {
    let mut machine = CallMachine::new();
    machine
        .start_call(&alice(), bob(), offer(), at(0))
        .expect("start");
    machine.on_answer(answer()).expect("answer");
    machine.on_link_connected(at(2));

    let first = machine.end_call(EndReason::LocalHangup, at(10));
    let second = machine.end_call(EndReason::RemoteEnded, at(10));

    assert!(first.expect("first end").log_entry);
    assert!(second.is_none());
}

#[test]
fn inbound_request_while_active_is_ignored() {
    let mut machine = CallMachine::new();
    machine
        .start_call(&alice(), bob(), offer(), at(0))
        .expect("start");

    let disposition = machine.on_call_request(UserId::new("carol"), None, true, &alice(), at(1));
    assert_eq!(disposition, IncomingDisposition::IgnoredBusy);
    assert_eq!(
        machine.session().expect("session").remote_user,
        bob(),
        "active session must be untouched"
    );
}

#[test]
fn offerless_request_is_not_surfaced() {
    let mut machine = CallMachine::new();
    let disposition = machine.on_call_request(alice(), None, false, &bob(), at(0));
    assert_eq!(disposition, IncomingDisposition::AwaitOffer);
    assert_eq!(machine.state(), CallState::Idle);
}

#[test]
fn callee_generates_a_call_id_when_none_is_supplied() {
    let mut machine = CallMachine::new();
    match machine.on_call_request(alice(), None, true, &bob(), at(0)) {
        IncomingDisposition::Surface { call_id, .. } => {
            assert!(call_id.as_str().starts_with("alice_bob_"));
        }
        other => panic!("unexpected disposition: {other:?}"),
    }
}

#[test]
fn middleware_issued_call_id_is_authoritative() {
    let mut machine = CallMachine::new();
    machine
        .start_call(&alice(), bob(), offer(), at(0))
        .expect("start");
    machine.adopt_call_id(CallId::new("middleware-42"));
    assert_eq!(
        machine.session().expect("session").call_id,
        CallId::new("middleware-42")
    );
}

#[test]
fn reject_requires_a_ringing_call() {
    let mut machine = CallMachine::new();
    assert_eq!(machine.reject(), Err(CallError::NotRinging));

    machine.on_call_request(alice(), None, true, &bob(), at(0));
    assert_eq!(machine.reject(), Ok(alice()));
    assert_eq!(machine.state(), CallState::Idle);
}

#[test]
fn link_connected_is_only_honored_while_negotiating() {
    let mut machine = CallMachine::new();
    machine
        .start_call(&alice(), bob(), offer(), at(0))
        .expect("start");
    assert!(machine.on_link_connected(at(1)).is_none());

    machine.on_answer(answer()).expect("answer");
    assert!(machine.on_link_connected(at(2)).is_some());
    // Repeat reports are idempotent.
    assert!(machine.on_link_connected(at(3)).is_none());
    assert_eq!(
        machine.session().expect("session").connected_at,
        Some(at(2))
    );
}

#[test]
fn answer_in_wrong_state_is_an_error() {
    let mut machine = CallMachine::new();
    assert_eq!(machine.on_answer(answer()), Err(CallError::NotCalling));

    machine.on_call_request(alice(), None, true, &bob(), at(0));
    assert_eq!(machine.on_answer(answer()), Err(CallError::NotCalling));
}

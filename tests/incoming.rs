//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Tests of the callee role, driven through the router and the
//! simulation collaborators.

#[macro_use]
extern crate log;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ringline::common::{CallDirection, CallId, CallRecordKind, CallState};
use ringline::core::call::Call;
use ringline::core::call_manager::CallManager;
use ringline::core::router::CallMessageRouter;
use ringline::core::signaling::DataChannelMessage;
use ringline::error::CallError;
use ringline::sim::sim_platform::{SimCallObserver, SimPlatform};

#[macro_use]
mod common;
use common::{test_init, TestContext};

const CALLER: &str = "+15559876543";
const CALL_ID: u64 = 42;

fn router(cm: CallManager<SimPlatform>) -> CallMessageRouter<SimPlatform> {
    CallMessageRouter::new(cm)
}

// Receive an inbound offer and synchronize.
//
// - receive offer
// - check the call exists in Answering
// - check engine creation, answer sent, background guarantee held
//
// Now in the Answering state with the connect wait running.
fn start_inbound_call(context: &TestContext) -> Call {
    let cm = context.cm();

    router(cm.clone())
        .received_offer(CALLER, CALL_ID, "CALLER-OFFER".to_string())
        .expect(error_line!());
    cm.synchronize().expect(error_line!());

    let call = cm.active_call().expect(error_line!());
    assert_eq!(call.call_id(), CallId::new(CALL_ID));
    assert_eq!(call.direction(), CallDirection::Incoming);
    assert_eq!(call.state().expect(error_line!()), CallState::Answering);

    assert_eq!(context.platform().answers_sent(), 1);
    assert_eq!(context.platform().engines_created(), 1);
    assert_eq!(context.platform().background_begun(), 1);
    assert_eq!(context.platform().background_ended(), 0);

    let engine = context.platform().engine().expect(error_line!());
    assert_eq!(engine.remote_descriptions().len(), 1);
    assert_eq!(engine.remote_descriptions()[0].sdp, "CALLER-OFFER");

    call
}

#[test]
fn inbound_offer_is_answered() {
    test_init();

    let context = TestContext::new();
    let _ = start_inbound_call(&context);
}

#[test]
fn inbound_connectivity_rings_once() {
    test_init();

    let context = TestContext::new();
    let cm = context.cm();
    let call = start_inbound_call(&context);

    cm.connectivity_established(call.call_id())
        .expect(error_line!());
    cm.synchronize().expect(error_line!());
    assert_eq!(call.state().expect(error_line!()), CallState::LocalRinging);
    assert_eq!(context.ui().incoming_reported(), 1);

    // A repeated notification must not re-fire the user-visible event.
    cm.connectivity_established(call.call_id())
        .expect(error_line!());
    cm.synchronize().expect(error_line!());
    assert_eq!(call.state().expect(error_line!()), CallState::LocalRinging);
    assert_eq!(context.ui().incoming_reported(), 1);
}

#[test]
fn local_answer_connects_and_tells_the_peer() {
    test_init();

    let context = TestContext::new();
    let cm = context.cm();
    let call = start_inbound_call(&context);

    cm.connectivity_established(call.call_id())
        .expect(error_line!());
    cm.synchronize().expect(error_line!());

    cm.answer_call(call.local_id()).expect(error_line!());
    cm.synchronize().expect(error_line!());

    assert_eq!(call.state().expect(error_line!()), CallState::Connected);
    assert_eq!(context.ui().answered(), 1);
    assert_eq!(
        context.platform().call_records(),
        vec![(CallRecordKind::Incoming, CALLER.into())]
    );

    // The peer was told explicitly over the data channel.
    let engine = context.platform().engine().expect(error_line!());
    let sent = engine.data_channel_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        DataChannelMessage::decode(&sent[0]).expect(error_line!()),
        DataChannelMessage::for_connected(call.call_id())
    );
    assert!(engine.audio_enabled());

    // The connect wait settled; the background guarantee is released.
    assert_eq!(context.platform().background_begun(), 1);
    assert_eq!(context.platform().background_ended(), 1);
}

#[test]
fn in_band_connected_before_timeout_connects() {
    test_init();

    let context = TestContext::with_connect_timeout(Duration::from_millis(300));
    let cm = context.cm();
    let call = start_inbound_call(&context);

    let bytes = DataChannelMessage::for_connected(call.call_id())
        .encode()
        .expect(error_line!());
    cm.received_data_channel_message(call.call_id(), bytes)
        .expect(error_line!());
    cm.synchronize().expect(error_line!());

    assert_eq!(call.state().expect(error_line!()), CallState::Connected);
    assert_eq!(context.platform().background_ended(), 1);

    // The connect timer still fires, and finds nothing to do.
    thread::sleep(Duration::from_millis(700));
    cm.synchronize().expect(error_line!());
    assert_eq!(call.state().expect(error_line!()), CallState::Connected);
    assert!(cm.active_call().is_ok());
}

#[test]
fn connect_timeout_fails_call() {
    test_init();

    let context = TestContext::with_connect_timeout(Duration::from_millis(50));
    let cm = context.cm();
    let call = start_inbound_call(&context);

    thread::sleep(Duration::from_millis(300));
    cm.synchronize().expect(error_line!());

    assert_eq!(call.state().expect(error_line!()), CallState::LocalFailure);
    let error = call.error().expect(error_line!()).expect(error_line!());
    assert!(matches!(*error, CallError::Timeout(_)));
    assert!(cm.active_call().is_err());
    assert_eq!(context.ui().ended(), 1);

    // Released exactly once, on the timeout path.
    assert_eq!(context.platform().background_begun(), 1);
    assert_eq!(context.platform().background_ended(), 1);
}

#[test]
fn second_offer_gets_busy_and_missed_call() {
    test_init();

    let context = TestContext::new();
    let cm = context.cm();
    let call = start_inbound_call(&context);

    router(cm.clone())
        .received_offer("+15551112222", 7, "OTHER-OFFER".to_string())
        .expect(error_line!());
    cm.synchronize().expect(error_line!());

    assert_eq!(context.platform().busys_sent(), 1);
    assert_eq!(context.ui().missed_reported(), 1);
    assert_eq!(
        context.platform().call_records(),
        vec![(CallRecordKind::Missed, "+15551112222".into())]
    );

    // The active call is never disturbed.
    let active = cm.active_call().expect(error_line!());
    assert_eq!(active.call_id(), call.call_id());
    assert_eq!(active.state().expect(error_line!()), CallState::Answering);
    assert_eq!(context.platform().engines_created(), 1);
}

#[test]
fn remote_hangup_before_connect_is_missed() {
    test_init();

    let context = TestContext::new();
    let cm = context.cm();
    let call = start_inbound_call(&context);

    cm.connectivity_established(call.call_id())
        .expect(error_line!());
    cm.synchronize().expect(error_line!());

    router(cm.clone())
        .received_hangup(CALLER, CALL_ID)
        .expect(error_line!());
    cm.synchronize().expect(error_line!());

    assert_eq!(call.state().expect(error_line!()), CallState::RemoteHangup);
    assert_eq!(context.ui().missed_reported(), 1);
    assert_eq!(
        context.platform().call_records(),
        vec![(CallRecordKind::Missed, CALLER.into())]
    );
    assert_eq!(context.ui().ended(), 1);
    assert!(cm.active_call().is_err());
    assert_eq!(context.platform().background_ended(), 1);
}

#[test]
fn in_band_hangup_after_connect_is_not_missed() {
    test_init();

    let context = TestContext::new();
    let cm = context.cm();
    let call = start_inbound_call(&context);

    cm.answer_call(call.local_id()).expect(error_line!());
    cm.synchronize().expect(error_line!());
    assert_eq!(call.state().expect(error_line!()), CallState::Connected);

    let bytes = DataChannelMessage::for_hangup(call.call_id())
        .encode()
        .expect(error_line!());
    cm.received_data_channel_message(call.call_id(), bytes)
        .expect(error_line!());
    cm.synchronize().expect(error_line!());

    assert_eq!(call.state().expect(error_line!()), CallState::RemoteHangup);
    assert_eq!(context.ui().missed_reported(), 0);
    assert_eq!(
        context.platform().call_records(),
        vec![(CallRecordKind::Incoming, CALLER.into())]
    );
}

#[test]
fn decline_is_a_local_hangup() {
    test_init();

    let context = TestContext::new();
    let cm = context.cm();
    let call = start_inbound_call(&context);

    cm.decline_call(call.local_id()).expect(error_line!());
    cm.synchronize().expect(error_line!());

    assert_eq!(call.state().expect(error_line!()), CallState::LocalHangup);
    assert_eq!(context.platform().hangups_sent(), 1);
    assert!(cm.active_call().is_err());
    assert_eq!(context.platform().background_ended(), 1);
}

#[test]
fn in_band_message_with_mismatched_id_fails_call() {
    test_init();

    let context = TestContext::new();
    let cm = context.cm();
    let call = start_inbound_call(&context);

    let bytes = DataChannelMessage::for_connected(CallId::new(99))
        .encode()
        .expect(error_line!());
    cm.received_data_channel_message(call.call_id(), bytes)
        .expect(error_line!());
    cm.synchronize().expect(error_line!());

    assert_eq!(call.state().expect(error_line!()), CallState::LocalFailure);
    let error = call.error().expect(error_line!()).expect(error_line!());
    assert!(matches!(*error, CallError::AssertionViolation(_)));
}

#[test]
fn data_channel_event_for_stale_call_is_ignored() {
    test_init();

    let context = TestContext::new();
    let cm = context.cm();
    let call = start_inbound_call(&context);

    let bytes = DataChannelMessage::for_connected(CallId::new(77))
        .encode()
        .expect(error_line!());
    cm.received_data_channel_message(CallId::new(77), bytes)
        .expect(error_line!());
    cm.synchronize().expect(error_line!());

    assert_eq!(call.state().expect(error_line!()), CallState::Answering);
}

#[test]
fn undecodable_data_channel_bytes_are_ignored() {
    test_init();

    let context = TestContext::new();
    let cm = context.cm();
    let call = start_inbound_call(&context);

    cm.received_data_channel_message(call.call_id(), vec![0xff, 0xff, 0xff])
        .expect(error_line!());
    cm.synchronize().expect(error_line!());

    assert_eq!(call.state().expect(error_line!()), CallState::Answering);
    assert!(cm.active_call().is_ok());
}

#[test]
fn remote_video_status_reaches_observers() {
    test_init();

    let context = TestContext::new();
    let cm = context.cm();
    let call = start_inbound_call(&context);

    let observer = SimCallObserver::new();
    call.subscribe(Arc::new(observer.clone()))
        .expect(error_line!());

    cm.answer_call(call.local_id()).expect(error_line!());
    let bytes = DataChannelMessage::for_video_streaming_status(call.call_id(), true)
        .encode()
        .expect(error_line!());
    cm.received_data_channel_message(call.call_id(), bytes)
        .expect(error_line!());
    cm.synchronize().expect(error_line!());

    assert!(call.remote_video_enabled());
    assert_eq!(observer.video_status(), vec![true]);
}

#[test]
fn engine_creation_failure_fails_call() {
    test_init();

    let context = TestContext::new();
    let cm = context.cm();

    // Pre-arm the failure; the engine is created during offer handling.
    context.platform().should_fail_engine(true);
    router(cm.clone())
        .received_offer(CALLER, CALL_ID, "CALLER-OFFER".to_string())
        .expect(error_line!());
    cm.synchronize().expect(error_line!());

    assert!(cm.active_call().is_err());
    assert_eq!(context.platform().answers_sent(), 0);
    // The failed handshake still balances its background guarantee.
    assert_eq!(context.platform().background_begun(), 1);
    assert_eq!(context.platform().background_ended(), 1);
}

//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Simulation implementations of the calling collaborators.
//!
//! Everything counts what it was asked to do and can be told to fail, so
//! the integration tests can drive the call manager without a network or
//! a media stack.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::common::{CallId, CallRecordKind, CallState, RemotePeerId, Result};
use crate::core::call::{CallInfo, CallObserver};
use crate::core::platform::{BackgroundTaskId, CallUiAdaptee, MediaEngine, Platform};
use crate::core::signaling::{
    IceCandidate, IceServerConfig, MediaConstraints, SessionDescription,
};

/// Simulation error codes.
#[derive(thiserror::Error, Debug)]
pub enum SimError {
    #[error("sim: ice server fetch failed")]
    IceServerFetchError,
    #[error("sim: media engine creation failed")]
    MediaEngineError,
    #[error("sim: negotiate failed")]
    NegotiateError,
    #[error("sim: message send failed")]
    SendError,
}

#[derive(Default)]
struct SimMediaEngineState {
    should_fail_negotiate: AtomicBool,
    data_channel_available: AtomicBool,
    offers_created: AtomicUsize,
    local_descriptions_set: AtomicUsize,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    added_candidates: Mutex<Vec<IceCandidate>>,
    data_channel_sent: Mutex<Vec<Vec<u8>>>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    closed: AtomicBool,
}

/// Simulation media engine for one call.
#[derive(Clone)]
pub struct SimMediaEngine {
    call_id: CallId,
    state: Arc<SimMediaEngineState>,
}

impl SimMediaEngine {
    fn new(call_id: CallId) -> Self {
        let state = SimMediaEngineState {
            data_channel_available: AtomicBool::new(true),
            ..Default::default()
        };
        Self {
            call_id,
            state: Arc::new(state),
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn should_fail_negotiate(&self, enable: bool) {
        self.state
            .should_fail_negotiate
            .store(enable, Ordering::Release);
    }

    pub fn set_data_channel_available(&self, available: bool) {
        self.state
            .data_channel_available
            .store(available, Ordering::Release);
    }

    pub fn offers_created(&self) -> usize {
        self.state.offers_created.load(Ordering::Acquire)
    }

    pub fn local_descriptions_set(&self) -> usize {
        self.state.local_descriptions_set.load(Ordering::Acquire)
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.remote_descriptions.lock().unwrap().clone()
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.state.added_candidates.lock().unwrap().clone()
    }

    pub fn data_channel_sent(&self) -> Vec<Vec<u8>> {
        self.state.data_channel_sent.lock().unwrap().clone()
    }

    pub fn audio_enabled(&self) -> bool {
        self.state.audio_enabled.load(Ordering::Acquire)
    }

    pub fn video_enabled(&self) -> bool {
        self.state.video_enabled.load(Ordering::Acquire)
    }

    pub fn closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

impl MediaEngine for SimMediaEngine {
    fn create_offer(&self) -> Result<SessionDescription> {
        let _ = self.state.offers_created.fetch_add(1, Ordering::AcqRel);
        Ok(SessionDescription::new(format!("OFFER-{}", self.call_id)))
    }

    fn negotiate(
        &self,
        remote_offer: &SessionDescription,
        _constraints: &MediaConstraints,
    ) -> Result<SessionDescription> {
        if self.state.should_fail_negotiate.load(Ordering::Acquire) {
            return Err(SimError::NegotiateError.into());
        }
        self.state
            .remote_descriptions
            .lock()
            .unwrap()
            .push(remote_offer.clone());
        Ok(SessionDescription::new(format!("ANSWER-{}", self.call_id)))
    }

    fn set_local_description(&self, _description: &SessionDescription) -> Result<()> {
        let _ = self
            .state
            .local_descriptions_set
            .fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        self.state
            .remote_descriptions
            .lock()
            .unwrap()
            .push(description.clone());
        Ok(())
    }

    fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.state
            .added_candidates
            .lock()
            .unwrap()
            .push(candidate.clone());
        Ok(())
    }

    fn send_data_channel_message(&self, bytes: &[u8]) -> bool {
        if !self.state.data_channel_available.load(Ordering::Acquire) {
            return false;
        }
        self.state
            .data_channel_sent
            .lock()
            .unwrap()
            .push(bytes.to_vec());
        true
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.state.audio_enabled.store(enabled, Ordering::Release);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.state.video_enabled.store(enabled, Ordering::Release);
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct SimPlatformState {
    should_fail_ice_servers: AtomicBool,
    should_fail_engine: AtomicBool,
    should_fail_sends: AtomicBool,
    offers_sent: AtomicUsize,
    answers_sent: AtomicUsize,
    ice_messages_sent: AtomicUsize,
    ice_candidates_sent: AtomicUsize,
    ice_batch_sizes: Mutex<Vec<usize>>,
    hangups_sent: AtomicUsize,
    busys_sent: AtomicUsize,
    engines_created: AtomicUsize,
    engine: Mutex<Option<SimMediaEngine>>,
    call_records: Mutex<Vec<(CallRecordKind, RemotePeerId)>>,
    background_task_id: AtomicU64,
    background_begun: AtomicUsize,
    background_ended: AtomicUsize,
}

/// Simulation implementation of [`Platform`].
#[derive(Clone, Default)]
pub struct SimPlatform {
    state: Arc<SimPlatformState>,
}

impl fmt::Display for SimPlatform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SimPlatform")
    }
}

impl fmt::Debug for SimPlatform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl SimPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_fail_ice_servers(&self, enable: bool) {
        self.state
            .should_fail_ice_servers
            .store(enable, Ordering::Release);
    }

    pub fn should_fail_engine(&self, enable: bool) {
        self.state.should_fail_engine.store(enable, Ordering::Release);
    }

    pub fn should_fail_sends(&self, enable: bool) {
        self.state.should_fail_sends.store(enable, Ordering::Release);
    }

    pub fn offers_sent(&self) -> usize {
        self.state.offers_sent.load(Ordering::Acquire)
    }

    pub fn answers_sent(&self) -> usize {
        self.state.answers_sent.load(Ordering::Acquire)
    }

    pub fn ice_messages_sent(&self) -> usize {
        self.state.ice_messages_sent.load(Ordering::Acquire)
    }

    pub fn ice_candidates_sent(&self) -> usize {
        self.state.ice_candidates_sent.load(Ordering::Acquire)
    }

    pub fn ice_batch_sizes(&self) -> Vec<usize> {
        self.state.ice_batch_sizes.lock().unwrap().clone()
    }

    pub fn hangups_sent(&self) -> usize {
        self.state.hangups_sent.load(Ordering::Acquire)
    }

    pub fn busys_sent(&self) -> usize {
        self.state.busys_sent.load(Ordering::Acquire)
    }

    pub fn engines_created(&self) -> usize {
        self.state.engines_created.load(Ordering::Acquire)
    }

    /// The most recently created media engine.
    pub fn engine(&self) -> Option<SimMediaEngine> {
        self.state.engine.lock().unwrap().clone()
    }

    pub fn call_records(&self) -> Vec<(CallRecordKind, RemotePeerId)> {
        self.state.call_records.lock().unwrap().clone()
    }

    pub fn background_begun(&self) -> usize {
        self.state.background_begun.load(Ordering::Acquire)
    }

    pub fn background_ended(&self) -> usize {
        self.state.background_ended.load(Ordering::Acquire)
    }
}

impl Platform for SimPlatform {
    type MediaEngine = SimMediaEngine;

    fn get_ice_servers(&self) -> Result<Vec<IceServerConfig>> {
        if self.state.should_fail_ice_servers.load(Ordering::Acquire) {
            return Err(SimError::IceServerFetchError.into());
        }
        Ok(vec![IceServerConfig {
            urls: vec!["stun:sim.invalid:19302".to_string()],
            username: String::new(),
            password: String::new(),
        }])
    }

    fn create_media_engine(
        &mut self,
        call_id: CallId,
        _ice_servers: Vec<IceServerConfig>,
    ) -> Result<Self::MediaEngine> {
        if self.state.should_fail_engine.load(Ordering::Acquire) {
            return Err(SimError::MediaEngineError.into());
        }
        let _ = self.state.engines_created.fetch_add(1, Ordering::AcqRel);
        let engine = SimMediaEngine::new(call_id);
        *self.state.engine.lock().unwrap() = Some(engine.clone());
        Ok(engine)
    }

    fn on_send_offer(&self, remote_peer: &RemotePeerId, offer: crate::core::signaling::Offer) -> Result<()> {
        info!(
            "sim: send offer: remote: {}, call_id: {}",
            remote_peer, offer.call_id
        );
        if self.state.should_fail_sends.load(Ordering::Acquire) {
            return Err(SimError::SendError.into());
        }
        let _ = self.state.offers_sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn on_send_answer(
        &self,
        remote_peer: &RemotePeerId,
        answer: crate::core::signaling::Answer,
    ) -> Result<()> {
        info!(
            "sim: send answer: remote: {}, call_id: {}",
            remote_peer, answer.call_id
        );
        if self.state.should_fail_sends.load(Ordering::Acquire) {
            return Err(SimError::SendError.into());
        }
        let _ = self.state.answers_sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn on_send_ice(&self, remote_peer: &RemotePeerId, ice: crate::core::signaling::Ice) -> Result<()> {
        info!(
            "sim: send ice: remote: {}, call_id: {}, candidates: {}",
            remote_peer,
            ice.call_id,
            ice.candidates.len()
        );
        if self.state.should_fail_sends.load(Ordering::Acquire) {
            return Err(SimError::SendError.into());
        }
        let _ = self.state.ice_messages_sent.fetch_add(1, Ordering::AcqRel);
        let _ = self
            .state
            .ice_candidates_sent
            .fetch_add(ice.candidates.len(), Ordering::AcqRel);
        self.state
            .ice_batch_sizes
            .lock()
            .unwrap()
            .push(ice.candidates.len());
        Ok(())
    }

    fn on_send_hangup(
        &self,
        remote_peer: &RemotePeerId,
        hangup: crate::core::signaling::Hangup,
    ) -> Result<()> {
        info!(
            "sim: send hangup: remote: {}, call_id: {}",
            remote_peer, hangup.call_id
        );
        if self.state.should_fail_sends.load(Ordering::Acquire) {
            return Err(SimError::SendError.into());
        }
        let _ = self.state.hangups_sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn on_send_busy(&self, remote_peer: &RemotePeerId, busy: crate::core::signaling::Busy) -> Result<()> {
        info!(
            "sim: send busy: remote: {}, call_id: {}",
            remote_peer, busy.call_id
        );
        if self.state.should_fail_sends.load(Ordering::Acquire) {
            return Err(SimError::SendError.into());
        }
        let _ = self.state.busys_sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn record_call(
        &self,
        kind: CallRecordKind,
        remote_peer: &RemotePeerId,
        _timestamp: SystemTime,
    ) -> Result<()> {
        info!("sim: record call: {} {}", kind, remote_peer);
        self.state
            .call_records
            .lock()
            .unwrap()
            .push((kind, remote_peer.clone()));
        Ok(())
    }

    fn begin_background_task(&self, reason: &str) -> Result<BackgroundTaskId> {
        let id = self.state.background_task_id.fetch_add(1, Ordering::AcqRel);
        let _ = self.state.background_begun.fetch_add(1, Ordering::AcqRel);
        info!("sim: begin background task bg-{}: {}", id, reason);
        Ok(BackgroundTaskId(id))
    }

    fn end_background_task(&self, task: BackgroundTaskId) {
        let _ = self.state.background_ended.fetch_add(1, Ordering::AcqRel);
        info!("sim: end background task {}", task);
    }
}

#[derive(Default)]
struct SimCallUiState {
    outgoing_started: AtomicUsize,
    incoming_reported: AtomicUsize,
    missed_reported: AtomicUsize,
    answered: AtomicUsize,
    ended: AtomicUsize,
}

/// Simulation call UI surface, usable as the in-app adaptee.
#[derive(Clone, Default)]
pub struct SimCallUi {
    state: Arc<SimCallUiState>,
}

impl SimCallUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outgoing_started(&self) -> usize {
        self.state.outgoing_started.load(Ordering::Acquire)
    }

    pub fn incoming_reported(&self) -> usize {
        self.state.incoming_reported.load(Ordering::Acquire)
    }

    pub fn missed_reported(&self) -> usize {
        self.state.missed_reported.load(Ordering::Acquire)
    }

    pub fn answered(&self) -> usize {
        self.state.answered.load(Ordering::Acquire)
    }

    pub fn ended(&self) -> usize {
        self.state.ended.load(Ordering::Acquire)
    }
}

impl CallUiAdaptee for SimCallUi {
    fn start_outgoing_call(&self, call: &CallInfo) {
        info!("sim ui: start outgoing call: {}", call);
        let _ = self.state.outgoing_started.fetch_add(1, Ordering::AcqRel);
    }

    fn report_incoming_call(&self, call: &CallInfo) {
        info!("sim ui: report incoming call: {}", call);
        let _ = self.state.incoming_reported.fetch_add(1, Ordering::AcqRel);
    }

    fn report_missed_call(&self, call: &CallInfo) {
        info!("sim ui: report missed call: {}", call);
        let _ = self.state.missed_reported.fetch_add(1, Ordering::AcqRel);
    }

    fn answer_call(&self, call: &CallInfo) {
        info!("sim ui: answer call: {}", call);
        let _ = self.state.answered.fetch_add(1, Ordering::AcqRel);
    }

    fn end_call(&self, call: &CallInfo) {
        info!("sim ui: end call: {}", call);
        let _ = self.state.ended.fetch_add(1, Ordering::AcqRel);
    }
}

/// Records the state transitions one call goes through.
#[derive(Clone, Default)]
pub struct SimCallObserver {
    states: Arc<Mutex<Vec<CallState>>>,
    video_status: Arc<Mutex<Vec<bool>>>,
}

impl SimCallObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Vec<CallState> {
        self.states.lock().unwrap().clone()
    }

    pub fn video_status(&self) -> Vec<bool> {
        self.video_status.lock().unwrap().clone()
    }
}

impl CallObserver for SimCallObserver {
    fn on_state_changed(&self, _call: &CallInfo, state: CallState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_remote_video_status(&self, _call: &CallInfo, enabled: bool) {
        self.video_status.lock().unwrap().push(enabled);
    }
}

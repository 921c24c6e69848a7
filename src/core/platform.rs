//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Traits describing the collaborators an application must supply for
//! calling: the platform plumbing (media engine construction, signaling
//! sends, history, background execution) and the call UI surface.

use std::fmt;
use std::time::SystemTime;

use crate::common::{CallId, CallRecordKind, RemotePeerId, Result};
use crate::core::call::CallInfo;
use crate::core::signaling;

/// Opaque token for a platform background-execution guarantee, held while
/// an inbound call handshake must survive process suspension.  Issued by
/// [`Platform::begin_background_task`] and returned, explicitly, through
/// [`Platform::end_background_task`] on every settle path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackgroundTaskId(pub u64);

impl fmt::Display for BackgroundTaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bg-{}", self.0)
    }
}

/// A trait describing the interface an application platform must
/// implement for calling.
///
/// Media engine callbacks (connectivity changes, locally generated ICE
/// candidates, inbound data-channel bytes) do not flow through this trait;
/// the application glue delivers them by calling the corresponding
/// `CallManager` notification methods, which re-dispatch onto the
/// signaling worker.
pub trait Platform: fmt::Debug + fmt::Display + Send + Sized + 'static {
    /// Media engine type created per call.
    type MediaEngine: MediaEngine;

    /// Fetch the ICE server configuration to create a media engine with.
    fn get_ice_servers(&self) -> Result<Vec<signaling::IceServerConfig>>;

    /// Create the media engine for one call attempt.
    fn create_media_engine(
        &mut self,
        call_id: CallId,
        ice_servers: Vec<signaling::IceServerConfig>,
    ) -> Result<Self::MediaEngine>;

    /// Send an offer to a remote peer using the signaling channel.
    fn on_send_offer(&self, remote_peer: &RemotePeerId, offer: signaling::Offer) -> Result<()>;

    /// Send an answer to a remote peer using the signaling channel.
    fn on_send_answer(&self, remote_peer: &RemotePeerId, answer: signaling::Answer) -> Result<()>;

    /// Send one or more ICE candidates to a remote peer using the
    /// signaling channel.
    fn on_send_ice(&self, remote_peer: &RemotePeerId, ice: signaling::Ice) -> Result<()>;

    /// Send a hangup message to a remote peer using the signaling channel.
    fn on_send_hangup(&self, remote_peer: &RemotePeerId, hangup: signaling::Hangup) -> Result<()>;

    /// Send a busy message to a remote peer using the signaling channel.
    fn on_send_busy(&self, remote_peer: &RemotePeerId, busy: signaling::Busy) -> Result<()>;

    /// Record a call in the call history.
    fn record_call(
        &self,
        kind: CallRecordKind,
        remote_peer: &RemotePeerId,
        timestamp: SystemTime,
    ) -> Result<()>;

    /// Acquire a background-execution guarantee so the process is not
    /// suspended in the middle of a handshake wait.
    fn begin_background_task(&self, reason: &str) -> Result<BackgroundTaskId>;

    /// Release a previously acquired background-execution guarantee.
    fn end_background_task(&self, task: BackgroundTaskId);
}

/// A trait describing the per-call media engine: the component that owns
/// session description negotiation, the actual audio/video pipes, and the
/// data channel.
pub trait MediaEngine: Send + 'static {
    /// Create the local offer session description.
    fn create_offer(&self) -> Result<signaling::SessionDescription>;

    /// Given a remote offer, negotiate a compatible local description.
    fn negotiate(
        &self,
        remote_offer: &signaling::SessionDescription,
        constraints: &signaling::MediaConstraints,
    ) -> Result<signaling::SessionDescription>;

    fn set_local_description(&self, description: &signaling::SessionDescription) -> Result<()>;

    fn set_remote_description(&self, description: &signaling::SessionDescription) -> Result<()>;

    fn add_ice_candidate(&self, candidate: &signaling::IceCandidate) -> Result<()>;

    /// Send bytes over the data channel.  Returns false when the channel
    /// is not up; callers treat that as best-effort.
    fn send_data_channel_message(&self, bytes: &[u8]) -> bool;

    fn set_audio_enabled(&self, enabled: bool);

    fn set_video_enabled(&self, enabled: bool);

    /// Tear the engine down.  Called exactly once, at call termination.
    fn close(&self);
}

/// The capability interface for call-related UI.  Implementations exist
/// for the in-app presentation and for system telephony surfaces; the one
/// to use is chosen when the adapter is constructed.
pub trait CallUiAdaptee: Send + Sync + 'static {
    fn start_outgoing_call(&self, call: &CallInfo);
    fn report_incoming_call(&self, call: &CallInfo);
    fn report_missed_call(&self, call: &CallInfo);
    fn answer_call(&self, call: &CallInfo);
    fn end_call(&self, call: &CallInfo);
}

/// Thin forwarding wrapper around the chosen [`CallUiAdaptee`].
pub struct CallUiAdapter {
    adaptee: Box<dyn CallUiAdaptee>,
}

impl CallUiAdapter {
    pub fn new(adaptee: Box<dyn CallUiAdaptee>) -> Self {
        Self { adaptee }
    }

    pub fn start_outgoing_call(&self, call: &CallInfo) {
        self.adaptee.start_outgoing_call(call)
    }

    pub fn report_incoming_call(&self, call: &CallInfo) {
        self.adaptee.report_incoming_call(call)
    }

    pub fn report_missed_call(&self, call: &CallInfo) {
        self.adaptee.report_missed_call(call)
    }

    pub fn answer_call(&self, call: &CallInfo) {
        self.adaptee.answer_call(call)
    }

    pub fn end_call(&self, call: &CallInfo) {
        self.adaptee.end_call(call)
    }
}

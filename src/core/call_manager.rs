//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The main Call Manager object definitions.
//!
//! The `CallManager` owns the single active call, the ICE candidate
//! buffer, and the media engine handle, and drives the whole
//! offer/answer/ICE handshake.  Every mutating operation, whether it
//! originates from the network, the local user, or a media engine
//! callback, is enqueued as a [`Request`] and executed by one signaling
//! worker thread.  That total serialization is the only locking
//! discipline the call invariants rely on.
//!
//! # Asynchronous inputs
//!
//! ## Control requests from the client application
//!
//! - StartOutgoingCall
//! - AnswerCall / DeclineCall / LocalHangup
//! - ToggleMute / SetVideoEnabled
//!
//! ## Signaling requests from the remote peer
//!
//! - ReceivedOffer / ReceivedAnswer / ReceivedIce
//! - ReceivedHangup / ReceivedBusy
//!
//! ## From the media engine
//!
//! - ConnectivityEstablished / ConnectivityFailed
//! - LocalIceCandidate
//! - DataChannelMessage
//!
//! ## From the internal runtime
//!
//! - ConnectTimeout
//! - Synchronize
//! - Shutdown

use std::fmt;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use crate::common::{
    CallDirection, CallFlow, CallId, CallRecordKind, CallState, RemotePeerId, Result,
};
use crate::core::call::Call;
use crate::core::call_mutex::CallMutex;
use crate::core::ice_buffer::IceCandidateBuffer;
use crate::core::platform::{BackgroundTaskId, CallUiAdapter, MediaEngine, Platform};
use crate::core::signaling::{self, DataChannelMessage, MediaConstraints};
use crate::core::util::{EventStream, FutureResult};
use crate::error::CallError;

/// How long an accepted inbound offer may wait for the in-band connected
/// signal before the call is failed with a timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// The different requests the signaling worker consumes.
enum Request {
    /// Start an outgoing call; the allocated call is handed back through
    /// the response slot as soon as it is observable in `Dialing`.
    StartOutgoingCall {
        remote_peer: RemotePeerId,
        has_video: bool,
        rsp: FutureResult<Option<Result<Call>>>,
    },
    /// Received an offer signaling message from a remote peer.
    ReceivedOffer {
        remote_peer: RemotePeerId,
        offer: signaling::Offer,
    },
    /// Received an answer signaling message from a remote peer.
    ReceivedAnswer {
        remote_peer: RemotePeerId,
        answer: signaling::Answer,
    },
    /// Received ICE candidates from a remote peer.
    ReceivedIce {
        remote_peer: RemotePeerId,
        ice: signaling::Ice,
    },
    /// Received a hangup signaling message from a remote peer.
    ReceivedHangup {
        remote_peer: RemotePeerId,
        hangup: signaling::Hangup,
    },
    /// Received a busy signaling message from a remote peer.
    ReceivedBusy {
        remote_peer: RemotePeerId,
        busy: signaling::Busy,
    },
    /// The local user accepted the incoming call.
    AnswerCall { local_id: Uuid },
    /// The local user declined the incoming call.
    DeclineCall { local_id: Uuid },
    /// The local user hung up.
    LocalHangup { local_id: Uuid },
    /// The local user toggled the microphone.
    ToggleMute { local_id: Uuid, muted: bool },
    /// The local user toggled the camera.
    SetVideoEnabled { local_id: Uuid, enabled: bool },
    /// The media transport established connectivity.
    ConnectivityEstablished { call_id: CallId },
    /// The media transport lost connectivity.
    ConnectivityFailed { call_id: CallId },
    /// The media engine generated a local ICE candidate.
    LocalIceCandidate {
        call_id: CallId,
        candidate: signaling::IceCandidate,
    },
    /// The media engine received bytes on the data channel.
    DataChannelMessage { call_id: CallId, bytes: Vec<u8> },
    /// The bounded connect wait expired.
    ConnectTimeout { call_id: CallId },
    /// Quiesce the worker: set the flag and wake the waiter once every
    /// previously queued request has been handled.
    Synchronize(Arc<(Mutex<bool>, Condvar)>),
    /// Stop the worker.
    Shutdown,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            Request::StartOutgoingCall { remote_peer, .. } => {
                format!("StartOutgoingCall, remote: {}", remote_peer)
            }
            Request::ReceivedOffer { offer, .. } => format!("ReceivedOffer, call_id: {}", offer.call_id),
            Request::ReceivedAnswer { answer, .. } => {
                format!("ReceivedAnswer, call_id: {}", answer.call_id)
            }
            Request::ReceivedIce { ice, .. } => format!(
                "ReceivedIce, call_id: {}, candidates: {}",
                ice.call_id,
                ice.candidates.len()
            ),
            Request::ReceivedHangup { hangup, .. } => {
                format!("ReceivedHangup, call_id: {}", hangup.call_id)
            }
            Request::ReceivedBusy { busy, .. } => format!("ReceivedBusy, call_id: {}", busy.call_id),
            Request::AnswerCall { local_id } => format!("AnswerCall, local_id: {}", local_id),
            Request::DeclineCall { local_id } => format!("DeclineCall, local_id: {}", local_id),
            Request::LocalHangup { local_id } => format!("LocalHangup, local_id: {}", local_id),
            Request::ToggleMute { muted, .. } => format!("ToggleMute, muted: {}", muted),
            Request::SetVideoEnabled { enabled, .. } => {
                format!("SetVideoEnabled, enabled: {}", enabled)
            }
            Request::ConnectivityEstablished { call_id } => {
                format!("ConnectivityEstablished, call_id: {}", call_id)
            }
            Request::ConnectivityFailed { call_id } => {
                format!("ConnectivityFailed, call_id: {}", call_id)
            }
            Request::LocalIceCandidate { call_id, .. } => {
                format!("LocalIceCandidate, call_id: {}", call_id)
            }
            Request::DataChannelMessage { call_id, bytes } => format!(
                "DataChannelMessage, call_id: {}, {} bytes",
                call_id,
                bytes.len()
            ),
            Request::ConnectTimeout { call_id } => format!("ConnectTimeout, call_id: {}", call_id),
            Request::Synchronize(_) => "Synchronize".to_string(),
            Request::Shutdown => "Shutdown".to_string(),
        };
        write!(f, "({})", display)
    }
}

/// The call signaling orchestrator.
///
/// Cheap to clone; clones share the same state and worker.  The public
/// methods may be called from any thread *except* the signaling worker
/// itself (observer and UI callbacks run there and must hand off before
/// calling back in), since [`CallManager::call`] and
/// [`CallManager::synchronize`] block on the worker.
pub struct CallManager<T>
where
    T: Platform,
{
    /// Interface to platform specific methods.
    platform: Arc<CallMutex<T>>,
    /// The call UI surface.
    ui: Arc<CallUiAdapter>,
    /// The single active call, if any.
    active_call: Arc<CallMutex<Option<Call>>>,
    /// The identity of the remote party of the active call.
    active_remote: Arc<CallMutex<Option<RemotePeerId>>>,
    /// The media engine of the active call.
    media_engine: Arc<CallMutex<Option<T::MediaEngine>>>,
    /// Buffer for locally generated ICE candidates.
    ice_buffer: Arc<CallMutex<IceCandidateBuffer>>,
    /// Background-execution guarantee held during the connect wait.
    background_task: Arc<CallMutex<Option<BackgroundTaskId>>>,
    /// Bounded wait applied to an accepted inbound offer.
    connect_timeout: Duration,
    /// Injects requests into the signaling worker.
    sender: Sender<Request>,
    /// The signaling worker thread.
    worker: Arc<CallMutex<Option<JoinHandle<()>>>>,
}

impl<T> fmt::Display for CallManager<T>
where
    T: Platform,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let active_call = match self.active_call.lock() {
            Ok(v) => match v.as_ref() {
                Some(call) => format!("{}", call),
                None => "None".to_string(),
            },
            Err(_) => "unavailable".to_string(),
        };
        write!(f, "active_call: ({})", active_call)
    }
}

impl<T> fmt::Debug for CallManager<T>
where
    T: Platform,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl<T> Clone for CallManager<T>
where
    T: Platform,
{
    fn clone(&self) -> Self {
        Self {
            platform: Arc::clone(&self.platform),
            ui: Arc::clone(&self.ui),
            active_call: Arc::clone(&self.active_call),
            active_remote: Arc::clone(&self.active_remote),
            media_engine: Arc::clone(&self.media_engine),
            ice_buffer: Arc::clone(&self.ice_buffer),
            background_task: Arc::clone(&self.background_task),
            connect_timeout: self.connect_timeout,
            sender: self.sender.clone(),
            worker: Arc::clone(&self.worker),
        }
    }
}

impl<T> CallManager<T>
where
    T: Platform,
{
    /// Create a new CallManager with the default connect timeout.
    pub fn new(platform: T, ui: CallUiAdapter) -> Result<Self> {
        Self::with_connect_timeout(platform, ui, CONNECT_TIMEOUT)
    }

    /// Create a new CallManager with an explicit connect timeout.
    pub fn with_connect_timeout(
        platform: T,
        ui: CallUiAdapter,
        connect_timeout: Duration,
    ) -> Result<Self> {
        info!("call manager: new()");

        let (sender, receiver) = mpsc::channel();

        let manager = Self {
            platform: Arc::new(CallMutex::new(platform, "platform")),
            ui: Arc::new(ui),
            active_call: Arc::new(CallMutex::new(None, "active_call")),
            active_remote: Arc::new(CallMutex::new(None, "active_remote")),
            media_engine: Arc::new(CallMutex::new(None, "media_engine")),
            ice_buffer: Arc::new(CallMutex::new(IceCandidateBuffer::new(), "ice_buffer")),
            background_task: Arc::new(CallMutex::new(None, "background_task")),
            connect_timeout,
            sender,
            worker: Arc::new(CallMutex::new(None, "worker")),
        };

        let worker_manager = manager.clone();
        let handle = thread::Builder::new()
            .name("signaling-worker".to_string())
            .spawn(move || worker_manager.worker_loop(EventStream::from(receiver)))?;
        *manager.worker.lock()? = Some(handle);

        Ok(manager)
    }

    // ------------------------------------------------------------
    // Public API.  Each operation is marshaled onto the worker.

    /// Initiate an outgoing call.  Blocks only until the worker has
    /// allocated the call, so the returned call is observable in
    /// `Dialing` while the offer exchange continues asynchronously.
    pub fn call(&self, remote_peer: RemotePeerId, has_video: bool) -> Result<Call> {
        info!("API: call(): remote: {}", remote_peer);

        let rsp: FutureResult<Option<Result<Call>>> =
            Arc::new((Mutex::new((false, None)), Condvar::new()));
        self.send_request(Request::StartOutgoingCall {
            remote_peer,
            has_video,
            rsp: rsp.clone(),
        })?;

        let (mutex, condvar) = &*rsp;
        let mut guard = mutex
            .lock()
            .map_err(|_| CallError::MutexPoisoned("start outgoing call response".to_string()))?;
        while !guard.0 {
            guard = condvar
                .wait(guard)
                .map_err(|_| CallError::MutexPoisoned("start outgoing call response".to_string()))?;
        }
        guard
            .1
            .take()
            .unwrap_or_else(|| Err(CallError::WorkerGone.into()))
    }

    /// An offer arrived over the signaling channel.
    pub fn received_offer(&self, remote_peer: RemotePeerId, offer: signaling::Offer) -> Result<()> {
        info!("API: received_offer(): call_id: {}", offer.call_id);
        self.send_request(Request::ReceivedOffer { remote_peer, offer })
    }

    /// An answer arrived over the signaling channel.
    pub fn received_answer(
        &self,
        remote_peer: RemotePeerId,
        answer: signaling::Answer,
    ) -> Result<()> {
        info!("API: received_answer(): call_id: {}", answer.call_id);
        self.send_request(Request::ReceivedAnswer {
            remote_peer,
            answer,
        })
    }

    /// ICE candidates arrived over the signaling channel.
    pub fn received_ice(&self, remote_peer: RemotePeerId, ice: signaling::Ice) -> Result<()> {
        info!(
            "API: received_ice(): call_id: {}, candidates: {}",
            ice.call_id,
            ice.candidates.len()
        );
        self.send_request(Request::ReceivedIce { remote_peer, ice })
    }

    /// A hangup arrived over the signaling channel.
    pub fn received_hangup(
        &self,
        remote_peer: RemotePeerId,
        hangup: signaling::Hangup,
    ) -> Result<()> {
        info!("API: received_hangup(): call_id: {}", hangup.call_id);
        self.send_request(Request::ReceivedHangup {
            remote_peer,
            hangup,
        })
    }

    /// A busy arrived over the signaling channel.
    pub fn received_busy(&self, remote_peer: RemotePeerId, busy: signaling::Busy) -> Result<()> {
        info!("API: received_busy(): call_id: {}", busy.call_id);
        self.send_request(Request::ReceivedBusy { remote_peer, busy })
    }

    /// The local user accepted the call identified by `local_id`.
    pub fn answer_call(&self, local_id: Uuid) -> Result<()> {
        info!("API: answer_call():");
        self.send_request(Request::AnswerCall { local_id })
    }

    /// The local user declined the call identified by `local_id`.
    pub fn decline_call(&self, local_id: Uuid) -> Result<()> {
        info!("API: decline_call():");
        self.send_request(Request::DeclineCall { local_id })
    }

    /// The local user hung up the call identified by `local_id`.
    pub fn hangup(&self, local_id: Uuid) -> Result<()> {
        info!("API: hangup():");
        self.send_request(Request::LocalHangup { local_id })
    }

    /// The local user muted or unmuted the microphone.
    pub fn toggle_mute(&self, local_id: Uuid, muted: bool) -> Result<()> {
        info!("API: toggle_mute(): muted: {}", muted);
        self.send_request(Request::ToggleMute { local_id, muted })
    }

    /// The local user started or stopped sending video.
    pub fn set_video_enabled(&self, local_id: Uuid, enabled: bool) -> Result<()> {
        info!("API: set_video_enabled(): enabled: {}", enabled);
        self.send_request(Request::SetVideoEnabled { local_id, enabled })
    }

    /// The media transport for `call_id` established connectivity.
    pub fn connectivity_established(&self, call_id: CallId) -> Result<()> {
        info!("API: connectivity_established(): call_id: {}", call_id);
        self.send_request(Request::ConnectivityEstablished { call_id })
    }

    /// The media transport for `call_id` failed.
    pub fn connectivity_failed(&self, call_id: CallId) -> Result<()> {
        info!("API: connectivity_failed(): call_id: {}", call_id);
        self.send_request(Request::ConnectivityFailed { call_id })
    }

    /// The media engine for `call_id` generated a local ICE candidate.
    pub fn local_ice_candidate(
        &self,
        call_id: CallId,
        candidate: signaling::IceCandidate,
    ) -> Result<()> {
        debug!("API: local_ice_candidate(): call_id: {}", call_id);
        self.send_request(Request::LocalIceCandidate { call_id, candidate })
    }

    /// The media engine for `call_id` received data channel bytes.
    pub fn received_data_channel_message(&self, call_id: CallId, bytes: Vec<u8>) -> Result<()> {
        debug!(
            "API: received_data_channel_message(): call_id: {}, {} bytes",
            call_id,
            bytes.len()
        );
        self.send_request(Request::DataChannelMessage { call_id, bytes })
    }

    /// Return the active call, if any.
    pub fn active_call(&self) -> Result<Call> {
        match self.active_call.lock()?.as_ref() {
            Some(call) => Ok(call.clone()),
            None => Err(CallError::NoActiveCall.into()),
        }
    }

    /// Block until the worker has drained every request queued before
    /// this one.  Test and shutdown support.
    pub fn synchronize(&self) -> Result<()> {
        let sync = Arc::new((Mutex::new(false), Condvar::new()));
        self.send_request(Request::Synchronize(sync.clone()))?;

        let (mutex, condvar) = &*sync;
        let mut guard = mutex
            .lock()
            .map_err(|_| CallError::MutexPoisoned("synchronize".to_string()))?;
        while !*guard {
            guard = condvar
                .wait(guard)
                .map_err(|_| CallError::MutexPoisoned("synchronize".to_string()))?;
        }
        Ok(())
    }

    /// Hang up any active call and stop the signaling worker.
    pub fn close(&self) -> Result<()> {
        info!("API: close():");
        let _ = self.sender.send(Request::Shutdown);
        if let Some(handle) = self.worker.lock()?.take() {
            if handle.join().is_err() {
                error!("signaling worker panicked");
            }
        }
        Ok(())
    }

    fn send_request(&self, request: Request) -> Result<()> {
        self.sender
            .send(request)
            .map_err(|_| CallError::WorkerGone)?;
        Ok(())
    }

    // ------------------------------------------------------------
    // Worker side.  Everything below runs on the signaling worker.

    fn worker_loop(&self, mut requests: EventStream<Request>) {
        info!("worker: starting");
        while let Some(request) = requests.recv() {
            if let Request::Shutdown = request {
                info!("worker: shutdown");
                let active = match self.active_call.lock() {
                    Ok(guard) => guard.clone(),
                    Err(_) => None,
                };
                if let Some(call) = active {
                    if let Err(error) = self.handle_local_hangup_call(call) {
                        error!("hangup on shutdown failed: {}", error);
                    }
                }
                break;
            }
            debug!("worker: {}", request);
            if let Err(error) = self.handle_request(request) {
                self.internal_request_error(error);
            }
        }
        info!("worker: stopped");
    }

    fn handle_request(&self, request: Request) -> Result<()> {
        match request {
            Request::StartOutgoingCall {
                remote_peer,
                has_video,
                rsp,
            } => self.handle_start_outgoing_call(remote_peer, has_video, rsp),
            Request::ReceivedOffer { remote_peer, offer } => {
                self.handle_received_offer(remote_peer, offer)
            }
            Request::ReceivedAnswer {
                remote_peer,
                answer,
            } => self.handle_received_answer(remote_peer, answer),
            Request::ReceivedIce { remote_peer, ice } => self.handle_received_ice(remote_peer, ice),
            Request::ReceivedHangup {
                remote_peer,
                hangup,
            } => self.handle_received_hangup(remote_peer, hangup),
            Request::ReceivedBusy { remote_peer, busy } => {
                self.handle_received_busy(remote_peer, busy)
            }
            Request::AnswerCall { local_id } => self.handle_answer_call(local_id),
            Request::DeclineCall { local_id } => self.handle_decline_call(local_id),
            Request::LocalHangup { local_id } => self.handle_local_hangup(local_id),
            Request::ToggleMute { local_id, muted } => self.handle_toggle_mute(local_id, muted),
            Request::SetVideoEnabled { local_id, enabled } => {
                self.handle_set_video_enabled(local_id, enabled)
            }
            Request::ConnectivityEstablished { call_id } => {
                self.handle_connectivity_established(call_id)
            }
            Request::ConnectivityFailed { call_id } => self.handle_connectivity_failed(call_id),
            Request::LocalIceCandidate { call_id, candidate } => {
                self.handle_local_ice_candidate(call_id, candidate)
            }
            Request::DataChannelMessage { call_id, bytes } => {
                self.handle_data_channel_message(call_id, bytes)
            }
            Request::ConnectTimeout { call_id } => self.handle_connect_timeout(call_id),
            Request::Synchronize(sync) => {
                let (mutex, condvar) = &*sync;
                match mutex.lock() {
                    Ok(mut guard) => {
                        *guard = true;
                        condvar.notify_all();
                    }
                    Err(_) => error!("synchronize waiter poisoned"),
                }
                Ok(())
            }
            Request::Shutdown => Ok(()),
        }
    }

    /// Every handler failure lands here and is funneled through the one
    /// failure path.
    fn internal_request_error(&self, error: anyhow::Error) {
        error!("request failed: {}", error);
        if let Err(error) = self.handle_failed_call(CallError::from_external(error)) {
            error!("failure path failed: {}", error);
        }
    }

    fn handle_start_outgoing_call(
        &self,
        remote_peer: RemotePeerId,
        has_video: bool,
        rsp: FutureResult<Option<Result<Call>>>,
    ) -> Result<()> {
        // Allocate and expose the call before anything slow happens, so
        // the API caller observes `Dialing`.
        {
            let mut active = self.active_call.lock()?;
            if let Some(active_call) = active.as_ref() {
                let error = CallError::CallAlreadyInProgress(active_call.call_id());
                warn!("call(): {}", error);
                Self::fulfill(&rsp, Err(error.into()));
                return Ok(());
            }
            let call = Call::new(
                CallId::random(),
                remote_peer.clone(),
                CallDirection::Outgoing,
                CallState::Dialing,
                has_video,
            );
            *active = Some(call.clone());
            drop(active);
            *self.active_remote.lock()? = Some(remote_peer.clone());
            self.ice_buffer.lock()?.reset();
            Self::fulfill(&rsp, Ok(call));
        }

        let call = self.active_call()?;
        callflow!(
            CallFlow::Application,
            CallFlow::CallManager,
            format!("call({})", call.call_id())
        );

        self.platform
            .lock()?
            .record_call(CallRecordKind::Outgoing, &remote_peer, SystemTime::now())?;

        if self.media_engine.lock()?.is_some() {
            return Err(CallError::AssertionViolation(
                "media engine unexpectedly already exists".to_string(),
            )
            .into());
        }

        self.ui.start_outgoing_call(&call.info());

        let ice_servers = self.platform.lock()?.get_ice_servers()?;
        let engine = self
            .platform
            .lock()?
            .create_media_engine(call.call_id(), ice_servers)?;
        let offer_description = engine.create_offer()?;
        engine.set_local_description(&offer_description)?;
        *self.media_engine.lock()? = Some(engine);

        callflow!(
            CallFlow::CallManager,
            CallFlow::Network,
            format!("offer({})", call.call_id())
        );
        self.platform.lock()?.on_send_offer(
            &remote_peer,
            signaling::Offer {
                call_id: call.call_id(),
                session_description: offer_description,
            },
        )?;

        Ok(())
    }

    fn handle_received_offer(
        &self,
        remote_peer: RemotePeerId,
        offer: signaling::Offer,
    ) -> Result<()> {
        callflow!(
            CallFlow::Network,
            CallFlow::CallManager,
            format!("offer({})", offer.call_id)
        );

        if let Some(active_call) = self.active_call.lock()?.clone() {
            // The active call is never disturbed; decline the newcomer
            // and leave a missed-call trace for it.  A failure to do
            // either must not damage the call we are protecting.
            info!(
                "received offer {} while call {} is active; replying busy",
                offer.call_id,
                active_call.call_id()
            );
            let rejected = Call::new(
                offer.call_id,
                remote_peer.clone(),
                CallDirection::Incoming,
                CallState::Answering,
                false,
            );
            callflow!(
                CallFlow::CallManager,
                CallFlow::Network,
                format!("busy({})", offer.call_id)
            );
            if let Err(error) = self
                .platform
                .lock()?
                .on_send_busy(&remote_peer, signaling::Busy { call_id: offer.call_id })
            {
                warn!("failed to send busy: {}", error);
            }
            if let Err(error) = self.handle_missed_call(&rejected) {
                warn!("failed to record missed call: {}", error);
            }
            return Ok(());
        }

        let call = Call::new(
            offer.call_id,
            remote_peer.clone(),
            CallDirection::Incoming,
            CallState::Answering,
            false,
        );
        *self.active_call.lock()? = Some(call.clone());
        *self.active_remote.lock()? = Some(remote_peer.clone());
        self.ice_buffer.lock()?.reset();

        // Hold a background-execution guarantee for the whole connect
        // wait; released on every settle path via terminate or the
        // connected transition.
        let task = self
            .platform
            .lock()?
            .begin_background_task("incoming call connect wait")?;
        *self.background_task.lock()? = Some(task);

        let ice_servers = self.platform.lock()?.get_ice_servers()?;
        let engine = self
            .platform
            .lock()?
            .create_media_engine(call.call_id(), ice_servers)?;
        let answer_description =
            engine.negotiate(&offer.session_description, &MediaConstraints::default())?;
        *self.media_engine.lock()? = Some(engine);

        callflow!(
            CallFlow::CallManager,
            CallFlow::Network,
            format!("answer({})", call.call_id())
        );
        self.platform.lock()?.on_send_answer(
            &remote_peer,
            signaling::Answer {
                call_id: call.call_id(),
                session_description: answer_description,
            },
        )?;

        // The remote party demonstrated willingness by offering; local
        // candidates flow as soon as our answer is out.
        let batch = self.ice_buffer.lock()?.release();
        self.send_ice_candidates(&remote_peer, call.call_id(), batch)?;

        self.start_connect_timer(call.call_id())?;

        Ok(())
    }

    fn handle_received_answer(
        &self,
        remote_peer: RemotePeerId,
        answer: signaling::Answer,
    ) -> Result<()> {
        callflow!(
            CallFlow::Network,
            CallFlow::CallManager,
            format!("answer({})", answer.call_id)
        );

        let call = self.active_call.lock()?.clone().ok_or_else(|| {
            CallError::AssertionViolation(format!(
                "answer received for call {} with no current call",
                answer.call_id
            ))
        })?;
        if call.call_id() != answer.call_id {
            return Err(CallError::AssertionViolation(format!(
                "answer received for call {} but current call is {}",
                answer.call_id,
                call.call_id()
            ))
            .into());
        }

        // The recipient trusts our offer now; queued candidates can go
        // out, all at once.
        let batch = self.ice_buffer.lock()?.release();
        self.send_ice_candidates(&remote_peer, call.call_id(), batch)?;

        let engine_guard = self.media_engine.lock()?;
        let engine = engine_guard.as_ref().ok_or_else(|| {
            CallError::AssertionViolation("answer received but no media engine exists".to_string())
        })?;
        engine.set_remote_description(&answer.session_description)?;

        Ok(())
    }

    fn handle_received_ice(&self, remote_peer: RemotePeerId, ice: signaling::Ice) -> Result<()> {
        callflow!(
            CallFlow::Network,
            CallFlow::CallManager,
            format!("ice({}, {} candidates)", ice.call_id, ice.candidates.len())
        );

        let current_remote = self.active_remote.lock()?.clone().ok_or_else(|| {
            CallError::AssertionViolation(format!(
                "ice update from {} with no current remote identity",
                remote_peer
            ))
        })?;
        if current_remote != remote_peer {
            return Err(CallError::AssertionViolation(format!(
                "ice update from {} but current remote is {}",
                remote_peer, current_remote
            ))
            .into());
        }

        let call = self.active_call.lock()?.clone().ok_or_else(|| {
            CallError::AssertionViolation(format!(
                "ice update for call {} with no current call",
                ice.call_id
            ))
        })?;
        if call.call_id() != ice.call_id {
            return Err(CallError::AssertionViolation(format!(
                "ice update for call {} but current call is {}",
                ice.call_id,
                call.call_id()
            ))
            .into());
        }

        let engine_guard = self.media_engine.lock()?;
        let engine = engine_guard.as_ref().ok_or_else(|| {
            CallError::AssertionViolation("ice update received but no media engine exists".to_string())
        })?;
        for candidate in &ice.candidates {
            engine.add_ice_candidate(candidate)?;
        }

        Ok(())
    }

    fn handle_received_hangup(
        &self,
        remote_peer: RemotePeerId,
        hangup: signaling::Hangup,
    ) -> Result<()> {
        callflow!(
            CallFlow::Network,
            CallFlow::CallManager,
            format!("hangup({})", hangup.call_id)
        );

        // A slow hangup from a superseded call must not kill a new one.
        match self.active_remote.lock()?.as_ref() {
            Some(current) if *current == remote_peer => {}
            _ => {
                info!(
                    "ignoring hangup from {}: not the current remote",
                    remote_peer
                );
                return Ok(());
            }
        }

        let call = self.active_call.lock()?.clone().ok_or_else(|| {
            CallError::AssertionViolation("hangup received with no current call".to_string())
        })?;

        let state = call.state()?;
        if state.is_terminal() {
            info!("ignoring hangup for terminated call {}", call.call_id());
            return Ok(());
        }
        if state != CallState::Connected {
            self.handle_missed_call(&call)?;
        }

        call.set_state(CallState::RemoteHangup)?;
        self.ui.end_call(&call.info());
        self.terminate()
    }

    fn handle_received_busy(&self, remote_peer: RemotePeerId, busy: signaling::Busy) -> Result<()> {
        callflow!(
            CallFlow::Network,
            CallFlow::CallManager,
            format!("busy({})", busy.call_id)
        );

        match self.active_remote.lock()?.as_ref() {
            Some(current) if *current == remote_peer => {}
            _ => {
                info!("ignoring busy from {}: not the current remote", remote_peer);
                return Ok(());
            }
        }

        let call = self.active_call.lock()?.clone().ok_or_else(|| {
            CallError::AssertionViolation("busy received with no current call".to_string())
        })?;
        if call.state()?.is_terminal() {
            info!("ignoring busy for terminated call {}", call.call_id());
            return Ok(());
        }

        call.set_state(CallState::RemoteBusy)?;
        self.ui.end_call(&call.info());
        self.terminate()
    }

    fn handle_answer_call(&self, local_id: Uuid) -> Result<()> {
        callflow!(CallFlow::Application, CallFlow::CallManager, "answer()");

        let call = match self.current_call_for_local_id(local_id)? {
            Some(call) => call,
            None => return Ok(()),
        };
        match call.state()? {
            CallState::LocalRinging | CallState::Answering => {}
            state => {
                info!("ignoring answer for call {} in state {}", call.call_id(), state);
                return Ok(());
            }
        }

        self.platform.lock()?.record_call(
            CallRecordKind::Incoming,
            call.remote_peer(),
            SystemTime::now(),
        )?;
        self.ui.answer_call(&call.info());

        // Tell the peer explicitly; it should not have to infer
        // connection state from transport signals alone.
        self.send_data_channel(&call, DataChannelMessage::for_connected(call.call_id()))?;

        self.handle_connected_call(&call)
    }

    fn handle_decline_call(&self, local_id: Uuid) -> Result<()> {
        callflow!(CallFlow::Application, CallFlow::CallManager, "decline()");

        // Declining is handled as a local hangup.
        match self.current_call_for_local_id(local_id)? {
            Some(call) => self.handle_local_hangup_call(call),
            None => Ok(()),
        }
    }

    fn handle_local_hangup(&self, local_id: Uuid) -> Result<()> {
        callflow!(CallFlow::Application, CallFlow::CallManager, "hangup()");

        match self.current_call_for_local_id(local_id)? {
            Some(call) => self.handle_local_hangup_call(call),
            None => Ok(()),
        }
    }

    fn handle_local_hangup_call(&self, call: Call) -> Result<()> {
        if call.state()?.is_terminal() {
            info!("ignoring hangup for terminated call {}", call.call_id());
            return Ok(());
        }

        // If the call is connected the data channel can carry the
        // hangup; best effort.
        self.send_data_channel(&call, DataChannelMessage::for_hangup(call.call_id()))?;

        call.set_state(CallState::LocalHangup)?;
        self.ui.end_call(&call.info());

        // The signaling-channel hangup always goes out, covering the
        // not-yet-connected case.
        callflow!(
            CallFlow::CallManager,
            CallFlow::Network,
            format!("hangup({})", call.call_id())
        );
        if let Err(error) = self.platform.lock()?.on_send_hangup(
            call.remote_peer(),
            signaling::Hangup {
                call_id: call.call_id(),
            },
        ) {
            error!("failed to send hangup message: {}", error);
        }

        self.terminate()
    }

    fn handle_toggle_mute(&self, local_id: Uuid, muted: bool) -> Result<()> {
        let _call = match self.current_call_for_local_id(local_id)? {
            Some(call) => call,
            None => return Ok(()),
        };
        match self.media_engine.lock()?.as_ref() {
            Some(engine) => engine.set_audio_enabled(!muted),
            None => warn!("toggle_mute: no media engine"),
        }
        Ok(())
    }

    fn handle_set_video_enabled(&self, local_id: Uuid, enabled: bool) -> Result<()> {
        let call = match self.current_call_for_local_id(local_id)? {
            Some(call) => call,
            None => return Ok(()),
        };
        match self.media_engine.lock()?.as_ref() {
            Some(engine) => engine.set_video_enabled(enabled),
            None => warn!("set_video_enabled: no media engine"),
        }
        self.send_data_channel(
            &call,
            DataChannelMessage::for_video_streaming_status(call.call_id(), enabled),
        )
    }

    fn handle_connectivity_established(&self, call_id: CallId) -> Result<()> {
        callflow!(
            CallFlow::Media,
            CallFlow::CallManager,
            format!("connectivity established({})", call_id)
        );

        let call = match self.current_call_matching(call_id)? {
            Some(call) => call,
            None => return Ok(()),
        };

        match call.state()? {
            CallState::Dialing => call.set_state(CallState::RemoteRinging)?,
            CallState::Answering => {
                call.set_state(CallState::LocalRinging)?;
                self.ui.report_incoming_call(&call.info());
            }
            CallState::RemoteRinging => {
                // Repeated notifications from the transport are expected.
                info!("call {} already ringing, ignoring", call.call_id());
            }
            state => {
                debug!(
                    "unexpected call state for connectivity notification: {}",
                    state
                );
            }
        }
        Ok(())
    }

    fn handle_connectivity_failed(&self, call_id: CallId) -> Result<()> {
        callflow!(
            CallFlow::Media,
            CallFlow::CallManager,
            format!("connectivity failed({})", call_id)
        );

        match self.current_call_matching(call_id)? {
            Some(_call) => Err(CallError::Disconnected.into()),
            None => Ok(()),
        }
    }

    fn handle_local_ice_candidate(
        &self,
        call_id: CallId,
        candidate: signaling::IceCandidate,
    ) -> Result<()> {
        let call = match self.current_call_matching(call_id)? {
            Some(call) => call,
            None => return Ok(()),
        };
        if call.state()?.is_terminal() {
            info!(
                "ignoring local candidate for terminated call {}",
                call.call_id()
            );
            return Ok(());
        }

        if let Some(candidate) = self.ice_buffer.lock()?.push(candidate) {
            self.send_ice_candidates(call.remote_peer(), call.call_id(), vec![candidate])?;
        }
        Ok(())
    }

    fn handle_data_channel_message(&self, call_id: CallId, bytes: Vec<u8>) -> Result<()> {
        let call = match self.current_call_matching(call_id)? {
            Some(call) => call,
            None => return Ok(()),
        };

        let message = match DataChannelMessage::decode(&bytes) {
            Ok(message) => message,
            Err(error) => {
                error!("failed to decode data channel message: {}", error);
                return Ok(());
            }
        };
        callflow!(
            CallFlow::Media,
            CallFlow::CallManager,
            format!("{}", message)
        );

        if message.call_id() != call.call_id() {
            return Err(CallError::AssertionViolation(format!(
                "data channel message for call {} but current call is {}",
                message.call_id(),
                call.call_id()
            ))
            .into());
        }

        match message {
            DataChannelMessage::Connected { .. } => self.handle_connected_call(&call),
            DataChannelMessage::Hangup { .. } => {
                let remote_peer = call.remote_peer().clone();
                self.handle_received_hangup(
                    remote_peer,
                    signaling::Hangup {
                        call_id: call.call_id(),
                    },
                )
            }
            DataChannelMessage::VideoStreamingStatus { enabled, .. } => {
                call.set_remote_video_enabled(enabled)
            }
        }
    }

    fn handle_connected_call(&self, call: &Call) -> Result<()> {
        if call.state()? == CallState::Connected {
            info!("call {} already connected", call.call_id());
            return Ok(());
        }

        call.set_state(CallState::Connected)?;

        {
            let engine_guard = self.media_engine.lock()?;
            let engine = engine_guard.as_ref().ok_or_else(|| {
                CallError::AssertionViolation(
                    "connected with no media engine".to_string(),
                )
            })?;
            // No media is transmitted until the remote client has
            // admitted to being connected.
            engine.set_audio_enabled(true);
            engine.set_video_enabled(call.has_video());
        }

        // The connect wait, if one was pending, has settled.
        self.end_background_task()
    }

    fn handle_connect_timeout(&self, call_id: CallId) -> Result<()> {
        let call = match self.current_call_matching(call_id)? {
            Some(call) => call,
            None => return Ok(()),
        };
        let state = call.state()?;
        if state == CallState::Connected || state.is_terminal() {
            debug!("connect timer for call {} expired in state {}", call_id, state);
            return Ok(());
        }

        Err(CallError::Timeout("timed out waiting for call to connect".to_string()).into())
    }

    fn handle_missed_call(&self, call: &Call) -> Result<()> {
        self.platform.lock()?.record_call(
            CallRecordKind::Missed,
            call.remote_peer(),
            SystemTime::now(),
        )?;
        self.ui.report_missed_call(&call.info());
        Ok(())
    }

    /// The one failure path: record the error, move the call to
    /// `LocalFailure`, and terminate.
    fn handle_failed_call(&self, error: CallError) -> Result<()> {
        let active = self.active_call.lock()?.clone();
        match active {
            Some(call) => {
                error!(
                    "call {} failed in state {}: {}",
                    call.call_id(),
                    call.state()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|_| "unavailable".to_string()),
                    error
                );
                if !call.state()?.is_terminal() {
                    call.set_terminal_error(error)?;
                    call.set_state(CallState::LocalFailure)?;
                    self.ui.end_call(&call.info());
                }
            }
            None => error!("failure with no current call: {}", error),
        }
        self.terminate()
    }

    /// The single exit point.  Idempotent: everything it releases is
    /// taken out of its slot, so a second pass finds nothing to do.
    /// Runs only after the call's state is already terminal.
    fn terminate(&self) -> Result<()> {
        info!("terminate():");

        self.end_background_task()?;

        if let Some(engine) = self.media_engine.lock()?.take() {
            engine.close();
        }

        if let Some(call) = self.active_call.lock()?.take() {
            match call.state() {
                Ok(state) if state.is_terminal() => {}
                Ok(state) => warn!(
                    "terminating call {} still in state {}",
                    call.call_id(),
                    state
                ),
                Err(_) => {}
            }
        }
        self.active_remote.lock()?.take();
        self.ice_buffer.lock()?.reset();

        Ok(())
    }

    // ------------------------------------------------------------
    // Worker-side helpers.

    fn fulfill(rsp: &FutureResult<Option<Result<Call>>>, value: Result<Call>) {
        let (mutex, condvar) = &**rsp;
        match mutex.lock() {
            Ok(mut guard) => {
                *guard = (true, Some(value));
                condvar.notify_one();
            }
            Err(_) => error!("start outgoing call response slot poisoned"),
        }
    }

    /// The current call, when `call_id` still names it; stale events
    /// resolve to `None` with a log line.
    fn current_call_matching(&self, call_id: CallId) -> Result<Option<Call>> {
        let active = self.active_call.lock()?.clone();
        match active {
            Some(call) if call.call_id() == call_id => Ok(Some(call)),
            Some(call) => {
                info!(
                    "ignoring event for call {}: current call is {}",
                    call_id,
                    call.call_id()
                );
                Ok(None)
            }
            None => {
                info!("ignoring event for call {}: no current call", call_id);
                Ok(None)
            }
        }
    }

    /// The current call, when `local_id` still names it; UI races on an
    /// already-ended call resolve to `None` with a log line.
    fn current_call_for_local_id(&self, local_id: Uuid) -> Result<Option<Call>> {
        let active = self.active_call.lock()?.clone();
        match active {
            Some(call) if call.local_id() == local_id => Ok(Some(call)),
            Some(call) => {
                info!(
                    "ignoring action for local id {}: current call is {}",
                    local_id,
                    call.call_id()
                );
                Ok(None)
            }
            None => {
                info!("ignoring action for local id {}: no current call", local_id);
                Ok(None)
            }
        }
    }

    fn send_ice_candidates(
        &self,
        remote_peer: &RemotePeerId,
        call_id: CallId,
        candidates: Vec<signaling::IceCandidate>,
    ) -> Result<()> {
        if candidates.is_empty() {
            return Ok(());
        }
        callflow!(
            CallFlow::CallManager,
            CallFlow::Network,
            format!("ice({}, {} candidates)", call_id, candidates.len())
        );
        self.platform.lock()?.on_send_ice(
            remote_peer,
            signaling::Ice {
                call_id,
                candidates,
            },
        )?;
        Ok(())
    }

    fn send_data_channel(&self, call: &Call, message: DataChannelMessage) -> Result<()> {
        let bytes = message.encode()?;
        match self.media_engine.lock()?.as_ref() {
            Some(engine) => {
                callflow!(CallFlow::CallManager, CallFlow::Media, format!("{}", message));
                if !engine.send_data_channel_message(&bytes) {
                    warn!("data channel send refused: {}", message);
                }
            }
            None => warn!("no media engine; dropping data channel message: {}", message),
        }
        Ok(())
    }

    fn end_background_task(&self) -> Result<()> {
        if let Some(task) = self.background_task.lock()?.take() {
            self.platform.lock()?.end_background_task(task);
        }
        Ok(())
    }

    fn start_connect_timer(&self, call_id: CallId) -> Result<()> {
        let sender = self.sender.clone();
        let timeout = self.connect_timeout;
        thread::Builder::new()
            .name("connect-timeout".to_string())
            .spawn(move || {
                thread::sleep(timeout);
                // The worker rechecks; a call that connected or ended in
                // the meantime ignores this.
                let _ = sender.send(Request::ConnectTimeout { call_id });
            })?;
        Ok(())
    }
}

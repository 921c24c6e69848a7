//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The Call entity: the mutable state holder for one call attempt.
//!
//! A `Call` has no protocol behavior of its own; it enforces the
//! transition invariants and notifies subscribed observers.  Driving the
//! state machine is the call manager's job.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::common::{CallDirection, CallId, CallState, RemotePeerId, Result};
use crate::core::call_mutex::CallMutex;
use crate::error::CallError;

/// Observer of one call's user-visible changes.  Notified synchronously
/// on the signaling worker; implementations must hand off to their own
/// context before doing real work.
pub trait CallObserver: Send + Sync + 'static {
    /// The call moved to a new state.
    fn on_state_changed(&self, call: &CallInfo, state: CallState);

    /// The remote side started or stopped sending video.
    fn on_remote_video_status(&self, _call: &CallInfo, _enabled: bool) {}
}

/// Immutable snapshot of a call's identity, handed to observers and to
/// the UI adapter.
#[derive(Clone, Debug)]
pub struct CallInfo {
    pub call_id: CallId,
    pub local_id: Uuid,
    pub remote_peer: RemotePeerId,
    pub direction: CallDirection,
    pub has_video: bool,
}

impl fmt::Display for CallInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "call_id: {}, direction: {}, remote: {}",
            self.call_id, self.direction, self.remote_peer
        )
    }
}

/// One call attempt between the local party and one remote identity.
pub struct Call {
    /// Unique 64-bit number identifying the call on the wire.
    call_id: CallId,
    /// Process-local identifier, used to correlate UI actions.  Never
    /// transmitted.
    local_id: Uuid,
    /// The remote party.
    remote_peer: RemotePeerId,
    /// The call direction, inbound or outbound.
    direction: CallDirection,
    /// The current state of the call.
    state: Arc<CallMutex<CallState>>,
    /// Whether this call carries video.
    has_video: Arc<AtomicBool>,
    /// Whether the remote side is currently streaming video.
    remote_video_enabled: Arc<AtomicBool>,
    /// The error that moved the call to `LocalFailure`, if any.
    error: Arc<CallMutex<Option<Arc<CallError>>>>,
    /// Subscribed observers.
    observers: Arc<CallMutex<Vec<Arc<dyn CallObserver>>>>,
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match self.state() {
            Ok(v) => format!("{}", v),
            Err(_) => "unavailable".to_string(),
        };
        write!(
            f,
            "call_id: {}, direction: {}, state: {}",
            self.call_id, self.direction, state
        )
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Clone for Call {
    fn clone(&self) -> Self {
        Self {
            call_id: self.call_id,
            local_id: self.local_id,
            remote_peer: self.remote_peer.clone(),
            direction: self.direction,
            state: Arc::clone(&self.state),
            has_video: Arc::clone(&self.has_video),
            remote_video_enabled: Arc::clone(&self.remote_video_enabled),
            error: Arc::clone(&self.error),
            observers: Arc::clone(&self.observers),
        }
    }
}

impl Call {
    /// Create a new Call in its initial state.
    pub fn new(
        call_id: CallId,
        remote_peer: RemotePeerId,
        direction: CallDirection,
        state: CallState,
        has_video: bool,
    ) -> Self {
        info!("call: new(): call_id: {}, direction: {}", call_id, direction);

        Self {
            call_id,
            local_id: Uuid::new_v4(),
            remote_peer,
            direction,
            state: Arc::new(CallMutex::new(state, "call state")),
            has_video: Arc::new(AtomicBool::new(has_video)),
            remote_video_enabled: Arc::new(AtomicBool::new(false)),
            error: Arc::new(CallMutex::new(None, "call error")),
            observers: Arc::new(CallMutex::new(Vec::new(), "call observers")),
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn remote_peer(&self) -> &RemotePeerId {
        &self.remote_peer
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn has_video(&self) -> bool {
        self.has_video.load(Ordering::Acquire)
    }

    pub fn remote_video_enabled(&self) -> bool {
        self.remote_video_enabled.load(Ordering::Acquire)
    }

    /// Return the current Call state.
    pub fn state(&self) -> Result<CallState> {
        let state = self.state.lock()?;
        Ok(*state)
    }

    /// Immutable identity snapshot for observers and the UI.
    pub fn info(&self) -> CallInfo {
        CallInfo {
            call_id: self.call_id,
            local_id: self.local_id,
            remote_peer: self.remote_peer.clone(),
            direction: self.direction,
            has_video: self.has_video(),
        }
    }

    /// Subscribe an observer to this call's changes.
    pub fn subscribe(&self, observer: Arc<dyn CallObserver>) -> Result<()> {
        self.observers.lock()?.push(observer);
        Ok(())
    }

    /// Update the current Call state and synchronously notify observers
    /// before returning.
    ///
    /// Refuses to move out of a terminal state.
    pub fn set_state(&self, new_state: CallState) -> Result<()> {
        {
            let mut state = self.state.lock()?;
            if state.is_terminal() {
                return Err(CallError::AssertionViolation(format!(
                    "call {}: transition {} -> {} out of a terminal state",
                    self.call_id, *state, new_state
                ))
                .into());
            }
            info!(
                "call: state changed: call_id: {}, {} -> {}",
                self.call_id, *state, new_state
            );
            *state = new_state;
        }

        let info = self.info();
        for observer in self.observers.lock()?.iter() {
            observer.on_state_changed(&info, new_state);
        }
        Ok(())
    }

    /// Update the remote video flag and notify observers on change.
    pub fn set_remote_video_enabled(&self, enabled: bool) -> Result<()> {
        let previous = self.remote_video_enabled.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            let info = self.info();
            for observer in self.observers.lock()?.iter() {
                observer.on_remote_video_status(&info, enabled);
            }
        }
        Ok(())
    }

    /// Record the error that is moving this call to `LocalFailure`.
    /// Only the first error is kept.
    pub fn set_terminal_error(&self, error: CallError) -> Result<()> {
        let mut slot = self.error.lock()?;
        if slot.is_none() {
            *slot = Some(Arc::new(error));
        }
        Ok(())
    }

    /// The terminal error, if the call failed.
    pub fn error(&self) -> Result<Option<Arc<CallError>>> {
        Ok(self.error.lock()?.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct CountingObserver {
        changes: AtomicUsize,
        video_changes: AtomicUsize,
    }

    impl CallObserver for CountingObserver {
        fn on_state_changed(&self, _call: &CallInfo, _state: CallState) {
            self.changes.fetch_add(1, Ordering::AcqRel);
        }

        fn on_remote_video_status(&self, _call: &CallInfo, _enabled: bool) {
            self.video_changes.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn test_call() -> Call {
        Call::new(
            CallId::new(1),
            RemotePeerId::from("+15551234567"),
            CallDirection::Outgoing,
            CallState::Dialing,
            false,
        )
    }

    #[test]
    fn observers_notified_synchronously() {
        let call = test_call();
        let observer = Arc::new(CountingObserver {
            changes: AtomicUsize::new(0),
            video_changes: AtomicUsize::new(0),
        });
        call.subscribe(observer.clone()).unwrap();

        call.set_state(CallState::RemoteRinging).unwrap();
        assert_eq!(observer.changes.load(Ordering::Acquire), 1);
        assert_eq!(call.state().unwrap(), CallState::RemoteRinging);

        call.set_remote_video_enabled(true).unwrap();
        call.set_remote_video_enabled(true).unwrap();
        assert_eq!(observer.video_changes.load(Ordering::Acquire), 1);
    }

    #[test]
    fn no_transition_out_of_terminal() {
        let call = test_call();
        call.set_state(CallState::LocalHangup).unwrap();
        assert!(call.set_state(CallState::Connected).is_err());
        assert_eq!(call.state().unwrap(), CallState::LocalHangup);
    }

    #[test]
    fn first_terminal_error_wins() {
        let call = test_call();
        call.set_terminal_error(CallError::Disconnected).unwrap();
        call.set_terminal_error(CallError::Timeout("later".to_string()))
            .unwrap();
        let kept = call.error().unwrap().unwrap();
        assert!(matches!(*kept, CallError::Disconnected));
    }

    #[test]
    fn clones_share_state() {
        let call = test_call();
        let clone = call.clone();
        call.set_state(CallState::RemoteRinging).unwrap();
        assert_eq!(clone.state().unwrap(), CallState::RemoteRinging);
        assert_eq!(clone.local_id(), call.local_id());
    }
}

//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common types used throughout the library.

use std::fmt;

/// Common Result type, using `anyhow::Error` for errors.
pub type Result<T> = anyhow::Result<T>;

/// Unique call identification number, shared with the remote peer over
/// the signaling channel.  Generated by whichever side sends the offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallId {
    id: u64,
}

impl CallId {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn random() -> Self {
        Self::new(rand::random())
    }

    pub fn as_u64(self) -> u64 {
        self.id
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.id)
    }
}

impl From<u64> for CallId {
    fn from(item: u64) -> Self {
        CallId::new(item)
    }
}

impl From<CallId> for u64 {
    fn from(item: CallId) -> Self {
        item.id
    }
}

/// Opaque identity of the remote party (phone number, account id, ...).
/// The engine never interprets it beyond equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemotePeerId(String);

impl RemotePeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RemotePeerId {
    fn from(item: &str) -> Self {
        Self(item.to_string())
    }
}

impl From<String> for RemotePeerId {
    fn from(item: String) -> Self {
        Self(item)
    }
}

impl fmt::Display for RemotePeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tracks the state of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    /// No call in progress.
    Idle,

    /// Outgoing, offer sent or being sent, no answer yet.
    Dialing,

    /// Incoming, offer accepted for processing, answer being sent.
    Answering,

    /// Outgoing, transport connectivity established, remote side ringing.
    RemoteRinging,

    /// Incoming, transport connectivity established, this side ringing.
    LocalRinging,

    /// Both sides accepted, media is flowing.
    Connected,

    /// Terminal: the call failed locally (assertion, transport, timeout).
    LocalFailure,

    /// Terminal: the local user hung up.
    LocalHangup,

    /// Terminal: the remote user hung up.
    RemoteHangup,

    /// Terminal: the remote side was busy.
    RemoteBusy,
}

impl CallState {
    /// No transition out of a terminal state is ever permitted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::LocalFailure
                | CallState::LocalHangup
                | CallState::RemoteHangup
                | CallState::RemoteBusy
        )
    }

    /// True for every state a live call can be observed in.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != CallState::Idle
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The call direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallDirection {
    /// Incoming call.
    Incoming,

    /// Outgoing call.
    Outgoing,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What kind of entry a call leaves in the call history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallRecordKind {
    /// An outgoing call was dialed.
    Outgoing,

    /// An incoming call was answered.
    Incoming,

    /// An incoming call was never answered here.
    Missed,
}

impl fmt::Display for CallRecordKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// Call-flow trace component list.
pub enum CallFlow {
    Application,
    CallManager,
    Media,
    Network,
}

impl fmt::Display for CallFlow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                CallFlow::Application => "app",
                CallFlow::CallManager => "cm",
                CallFlow::Media => "media",
                CallFlow::Network => "net",
            }
        )
    }
}

/// Logs one line of signaling flow, `source -> destination: operation`,
/// stamped with milliseconds since the epoch so traces from both peers
/// can be interleaved.
#[macro_export]
macro_rules! callflow {
    ($source:expr, $destination:expr, $operation:expr) => {
        info!(
            "ringline!\t{}\t{} -> {}: {}",
            match std::time::SystemTime::now().duration_since(std::time::SystemTime::UNIX_EPOCH) {
                Ok(v) => v.as_millis(),
                Err(_) => 0,
            },
            $source,
            $destination,
            $operation
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        for state in [
            CallState::LocalFailure,
            CallState::LocalHangup,
            CallState::RemoteHangup,
            CallState::RemoteBusy,
        ] {
            assert!(state.is_terminal());
            assert!(!state.is_active());
        }
        for state in [
            CallState::Dialing,
            CallState::Answering,
            CallState::RemoteRinging,
            CallState::LocalRinging,
            CallState::Connected,
        ] {
            assert!(!state.is_terminal());
            assert!(state.is_active());
        }
        assert!(!CallState::Idle.is_active());
    }

    #[test]
    fn call_id_format() {
        assert_eq!(format!("{}", CallId::new(0x2a)), "0x2a");
        assert_eq!(u64::from(CallId::from(7u64)), 7);
    }
}

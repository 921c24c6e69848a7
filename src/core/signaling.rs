//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The messages exchanged over the signaling channel to establish a call,
//! and the small in-band control protocol carried by the data channel once
//! the media path exists.
//!
//! The out-of-band structs are handed to the delivery collaborator as
//! typed values; their wire encoding belongs to the application.  The
//! in-band messages are the one place this crate owns an encoding.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::{CallId, Result};

/// An SDP session description, as produced and consumed by the media
/// engine.  Displayed by length only; SDP bodies carry addresses and
/// credentials and never belong in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp: String) -> Self {
        Self { sdp }
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sdp: {} bytes", self.sdp.len())
    }
}

impl fmt::Debug for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// One ICE candidate, local or remote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceCandidate {
    pub sdp: String,
    pub sdp_mline_index: i32,
    pub sdp_mid: String,
}

impl IceCandidate {
    pub fn new(sdp: String, sdp_mline_index: i32, sdp_mid: String) -> Self {
        Self {
            sdp,
            sdp_mline_index,
            sdp_mid,
        }
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "candidate: mid {} mline {} ({} bytes)",
            self.sdp_mid,
            self.sdp_mline_index,
            self.sdp.len()
        )
    }
}

/// Configuration for one STUN/TURN server, fetched from the service
/// before the media engine is created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub password: String,
}

/// Constraints applied while negotiating a session description
/// compatible with a remote offer.
#[derive(Clone, Debug, Default)]
pub struct MediaConstraints {
    pub mandatory: Vec<(String, String)>,
    pub optional: Vec<(String, String)>,
}

/// An enum representing the different messages that flow over the
/// signaling channel.
#[derive(Clone)]
pub enum Message {
    Offer(Offer),
    Answer(Answer),
    Ice(Ice),
    Hangup(Hangup),
    Busy(Busy),
}

impl Message {
    pub fn typ(&self) -> MessageType {
        match self {
            Self::Offer(_) => MessageType::Offer,
            Self::Answer(_) => MessageType::Answer,
            Self::Ice(_) => MessageType::Ice,
            Self::Hangup(_) => MessageType::Hangup,
            Self::Busy(_) => MessageType::Busy,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            Self::Offer(offer) => format!("Offer({}, {})", offer.call_id, offer.session_description),
            Self::Answer(answer) => {
                format!("Answer({}, {})", answer.call_id, answer.session_description)
            }
            Self::Ice(ice) => format!("Ice({}, {} candidates)", ice.call_id, ice.candidates.len()),
            Self::Hangup(hangup) => format!("Hangup({})", hangup.call_id),
            Self::Busy(busy) => format!("Busy({})", busy.call_id),
        };
        write!(f, "({})", display)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

// It's convenient to know the type of a message without having an entire
// message, so we have the related MessageType enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Offer,
    Answer,
    Ice,
    Hangup,
    Busy,
}

/// The caller sends this to a callee to initiate the call.
#[derive(Clone)]
pub struct Offer {
    pub call_id: CallId,
    pub session_description: SessionDescription,
}

/// The callee sends this in response to an Offer.
#[derive(Clone)]
pub struct Answer {
    pub call_id: CallId,
    pub session_description: SessionDescription,
}

/// Either side sends this, individually or batched, to update the other
/// with a network path proposal.
#[derive(Clone)]
pub struct Ice {
    pub call_id: CallId,
    pub candidates: Vec<IceCandidate>,
}

/// Either side sends this to end the call.
#[derive(Clone)]
pub struct Hangup {
    pub call_id: CallId,
}

/// The callee sends this when it cannot take the call.
#[derive(Clone)]
pub struct Busy {
    pub call_id: CallId,
}

/// The in-band control protocol carried over the data channel once the
/// media path is established.  Only meaningful after connection, and only
/// honored when the inner call id matches the active call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataChannelMessage {
    Connected { call_id: u64 },
    Hangup { call_id: u64 },
    VideoStreamingStatus { call_id: u64, enabled: bool },
}

impl DataChannelMessage {
    pub fn for_connected(call_id: CallId) -> Self {
        Self::Connected {
            call_id: call_id.as_u64(),
        }
    }

    pub fn for_hangup(call_id: CallId) -> Self {
        Self::Hangup {
            call_id: call_id.as_u64(),
        }
    }

    pub fn for_video_streaming_status(call_id: CallId, enabled: bool) -> Self {
        Self::VideoStreamingStatus {
            call_id: call_id.as_u64(),
            enabled,
        }
    }

    /// The call id the message claims to belong to.
    pub fn call_id(&self) -> CallId {
        match self {
            Self::Connected { call_id }
            | Self::Hangup { call_id }
            | Self::VideoStreamingStatus { call_id, .. } => CallId::new(*call_id),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl fmt::Display for DataChannelMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Connected { call_id } => write!(f, "Connected(0x{:x})", call_id),
            Self::Hangup { call_id } => write!(f, "Hangup(0x{:x})", call_id),
            Self::VideoStreamingStatus { call_id, enabled } => {
                write!(f, "VideoStreamingStatus(0x{:x}, {})", call_id, enabled)
            }
        }
    }
}

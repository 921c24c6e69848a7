//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Routing of inbound signaling messages to the call manager.
//!
//! The router is a stateless translation layer: it resolves the sender
//! identity into the conversation context (`RemotePeerId`) and marshals
//! each wire message into the corresponding call manager operation, which
//! enqueues it onto the signaling worker.  All protocol-level validation
//! happens in the call manager.

use crate::common::{CallId, Result};
use crate::core::call_manager::CallManager;
use crate::core::platform::Platform;
use crate::core::signaling;

pub struct CallMessageRouter<T>
where
    T: Platform,
{
    call_manager: CallManager<T>,
}

impl<T> CallMessageRouter<T>
where
    T: Platform,
{
    pub fn new(call_manager: CallManager<T>) -> Self {
        Self { call_manager }
    }

    /// Handle an offer message from `sender`.
    pub fn received_offer(
        &self,
        sender: &str,
        call_id: u64,
        session_description: String,
    ) -> Result<()> {
        debug!("router: offer from {}", sender);
        self.call_manager.received_offer(
            sender.into(),
            signaling::Offer {
                call_id: CallId::new(call_id),
                session_description: signaling::SessionDescription::new(session_description),
            },
        )
    }

    /// Handle an answer message from `sender`.
    pub fn received_answer(
        &self,
        sender: &str,
        call_id: u64,
        session_description: String,
    ) -> Result<()> {
        debug!("router: answer from {}", sender);
        self.call_manager.received_answer(
            sender.into(),
            signaling::Answer {
                call_id: CallId::new(call_id),
                session_description: signaling::SessionDescription::new(session_description),
            },
        )
    }

    /// Handle a single ICE update message from `sender`.
    pub fn received_ice_update(
        &self,
        sender: &str,
        call_id: u64,
        sdp: String,
        sdp_mline_index: i32,
        sdp_mid: String,
    ) -> Result<()> {
        debug!("router: ice update from {}", sender);
        self.call_manager.received_ice(
            sender.into(),
            signaling::Ice {
                call_id: CallId::new(call_id),
                candidates: vec![signaling::IceCandidate::new(sdp, sdp_mline_index, sdp_mid)],
            },
        )
    }

    /// Handle a batched ICE update message from `sender`.
    pub fn received_ice_updates(
        &self,
        sender: &str,
        call_id: u64,
        candidates: Vec<signaling::IceCandidate>,
    ) -> Result<()> {
        debug!("router: {} ice updates from {}", candidates.len(), sender);
        self.call_manager.received_ice(
            sender.into(),
            signaling::Ice {
                call_id: CallId::new(call_id),
                candidates,
            },
        )
    }

    /// Handle a hangup message from `sender`.
    pub fn received_hangup(&self, sender: &str, call_id: u64) -> Result<()> {
        debug!("router: hangup from {}", sender);
        self.call_manager.received_hangup(
            sender.into(),
            signaling::Hangup {
                call_id: CallId::new(call_id),
            },
        )
    }

    /// Handle a busy message from `sender`.
    pub fn received_busy(&self, sender: &str, call_id: u64) -> Result<()> {
        debug!("router: busy from {}", sender);
        self.call_manager.received_busy(
            sender.into(),
            signaling::Busy {
                call_id: CallId::new(call_id),
            },
        )
    }

    /// Handle an already-typed message envelope from `sender`.
    pub fn received_message(&self, sender: &str, message: signaling::Message) -> Result<()> {
        debug!("router: {} from {}", message, sender);
        match message {
            signaling::Message::Offer(offer) => self.call_manager.received_offer(sender.into(), offer),
            signaling::Message::Answer(answer) => {
                self.call_manager.received_answer(sender.into(), answer)
            }
            signaling::Message::Ice(ice) => self.call_manager.received_ice(sender.into(), ice),
            signaling::Message::Hangup(hangup) => {
                self.call_manager.received_hangup(sender.into(), hangup)
            }
            signaling::Message::Busy(busy) => self.call_manager.received_busy(sender.into(), busy),
        }
    }
}

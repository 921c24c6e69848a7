//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! # Ringline -- A 1:1 Call Signaling Engine
//!
//! This crate drives the offer/answer/ICE handshake for a single
//! peer-to-peer voice/video call over an out-of-band message transport,
//! while an external media engine owns the actual audio/video plumbing.
//! The heart of it is [`core::call_manager::CallManager`], a state
//! machine confined to one serialized signaling worker.

#[macro_use]
extern crate log;

#[macro_use]
pub mod common;

pub mod error;

/// Core, platform independent functionality.
pub mod core {
    pub mod call;
    pub mod call_manager;
    pub mod call_mutex;
    pub mod ice_buffer;
    pub mod platform;
    pub mod router;
    pub mod signaling;
    pub mod util;
}

/// Simulation collaborators, used by the integration tests.
pub mod sim {
    pub mod sim_platform;
}

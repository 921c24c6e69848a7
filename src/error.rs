//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common error codes.

use crate::common::CallId;

/// Platform independent error conditions.
#[derive(thiserror::Error, Debug)]
pub enum CallError {
    /// An invariant the signaling protocol relies on was broken, e.g. an
    /// answer arrived for a call that is not the current call.
    #[error("call protocol assertion failed: {0}")]
    AssertionViolation(String),

    /// The underlying media transport lost connectivity.
    #[error("media transport disconnected")]
    Disconnected,

    /// A collaborator (message delivery, ICE-server fetch, media engine)
    /// reported a failure.
    #[error("collaborator failure: {0}")]
    External(anyhow::Error),

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    // Internal error codes.
    #[error("mutex poisoned: {0}")]
    MutexPoisoned(String),
    #[error("call already in progress, id: {0}")]
    CallAlreadyInProgress(CallId),
    #[error("no active call")]
    NoActiveCall,
    #[error("signaling worker is gone")]
    WorkerGone,
}

impl CallError {
    /// Wraps a collaborator failure, without double-wrapping errors that
    /// already carry a call-level classification.
    pub fn from_external(error: anyhow::Error) -> Self {
        match error.downcast::<CallError>() {
            Ok(call_error) => call_error,
            Err(other) => CallError::External(other),
        }
    }
}

//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Buffering of locally generated ICE candidates.
//!
//! Candidates produced before the remote party has demonstrated that it
//! accepts the call are held back; sending them earlier would flood an
//! unwilling recipient with undecodable signaling traffic.  Once it is
//! safe, the whole backlog goes out as one batch and the policy flips to
//! immediate sending for the rest of the call.

use std::fmt;

use crate::core::signaling::IceCandidate;

/// Whether locally generated candidates are queued or sent at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferingPolicy {
    /// Queue candidates; nothing is sent.  The default.
    Hold,
    /// Send each candidate immediately as it is generated.
    SendImmediately,
}

impl fmt::Display for BufferingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Ordered queue of not-yet-sendable local ICE candidates.
pub struct IceCandidateBuffer {
    policy: BufferingPolicy,
    pending: Vec<IceCandidate>,
}

impl Default for IceCandidateBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self {
            policy: BufferingPolicy::Hold,
            pending: Vec::new(),
        }
    }

    pub fn policy(&self) -> BufferingPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Accept one locally generated candidate.  Returns the candidate
    /// back when the policy says it should be sent right away, `None`
    /// when it was queued.
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        match self.policy {
            BufferingPolicy::Hold => {
                self.pending.push(candidate);
                None
            }
            BufferingPolicy::SendImmediately => Some(candidate),
        }
    }

    /// Flip the policy to `SendImmediately` for the remainder of the call
    /// and drain the backlog.  The flip is permanent until [`reset`];
    /// calling this again yields an empty batch.
    ///
    /// [`reset`]: IceCandidateBuffer::reset
    pub fn release(&mut self) -> Vec<IceCandidate> {
        self.policy = BufferingPolicy::SendImmediately;
        std::mem::take(&mut self.pending)
    }

    /// Drop any queued candidates and restore the default `Hold` policy.
    /// Called at call termination, regardless of flush state.
    pub fn reset(&mut self) {
        self.policy = BufferingPolicy::Hold;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: i32) -> IceCandidate {
        IceCandidate::new(format!("candidate-{}", n), n, "audio".to_string())
    }

    #[test]
    fn holds_until_released() {
        let mut buffer = IceCandidateBuffer::new();
        assert_eq!(buffer.policy(), BufferingPolicy::Hold);

        assert!(buffer.push(candidate(0)).is_none());
        assert!(buffer.push(candidate(1)).is_none());
        assert_eq!(buffer.len(), 2);

        let batch = buffer.release();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].sdp_mline_index, 0);
        assert_eq!(batch[1].sdp_mline_index, 1);
        assert_eq!(buffer.policy(), BufferingPolicy::SendImmediately);
    }

    #[test]
    fn release_is_exactly_once() {
        let mut buffer = IceCandidateBuffer::new();
        buffer.push(candidate(0));
        assert_eq!(buffer.release().len(), 1);
        assert!(buffer.release().is_empty());
    }

    #[test]
    fn sends_immediately_after_release() {
        let mut buffer = IceCandidateBuffer::new();
        buffer.release();
        assert_eq!(buffer.push(candidate(7)), Some(candidate(7)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn reset_restores_hold_and_clears() {
        let mut buffer = IceCandidateBuffer::new();
        buffer.release();
        buffer.push(candidate(1));
        buffer.reset();
        assert_eq!(buffer.policy(), BufferingPolicy::Hold);
        assert!(buffer.is_empty());
        assert!(buffer.push(candidate(2)).is_none());
    }
}

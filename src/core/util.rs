//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Utility helpers for the serialized signaling worker.

use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex};

/// Generic Mutex/Condvar pair for signaling completion of a request that
/// was handed to the signaling worker.
pub type FutureResult<T> = Arc<(Mutex<(bool, T)>, Condvar)>;

/// A wrapper around [`std::sync::mpsc::Receiver`] that drains already-sent
/// requests on closing.
///
/// Note that in the current implementation there is a **race** between the
/// "drain" and "close" steps due to how the std channel is implemented.
/// This is acceptable *only* because nothing depends on explicit error
/// handling for requests sent after the stream is closed.
pub enum EventStream<T> {
    Active(Receiver<T>),
    Ended(VecDeque<T>),
}

impl<T> EventStream<T> {
    pub fn recv(&mut self) -> Option<T> {
        match self {
            Self::Active(receiver) => receiver.recv().ok(),
            Self::Ended(remaining) => remaining.pop_front(),
        }
    }

    pub fn close(&mut self) {
        match self {
            Self::Active(receiver) => *self = Self::Ended(receiver.try_iter().collect()),
            Self::Ended(_remaining) => {
                warn!("close() called twice on EventStream")
            }
        }
    }
}

impl<T> From<Receiver<T>> for EventStream<T> {
    fn from(receiver: Receiver<T>) -> Self {
        Self::Active(receiver)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn drains_pending_on_close() {
        let (sender, receiver) = mpsc::channel();
        let mut stream = EventStream::from(receiver);
        sender.send(1).unwrap();
        sender.send(2).unwrap();
        stream.close();
        drop(sender);
        assert_eq!(stream.recv(), Some(1));
        assert_eq!(stream.recv(), Some(2));
        assert_eq!(stream.recv(), None);
    }
}

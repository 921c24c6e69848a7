//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Call Mutex
//!
//! Wrapper around `std::sync::Mutex` that on `lock()` error consumes the
//! poison and returns a labeled error code instead of a panic.

use std::sync::{Mutex, MutexGuard};

use crate::common::Result;
use crate::error::CallError;

pub struct CallMutex<T: ?Sized> {
    /// Human readable label for the mutex
    label: &'static str,
    /// The actual mutex
    mutex: Mutex<T>,
}

impl<T> CallMutex<T> {
    pub fn new(t: T, label: &'static str) -> CallMutex<T> {
        CallMutex {
            mutex: Mutex::new(t),
            label,
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        match self.mutex.lock() {
            Ok(v) => Ok(v),
            Err(_) => Err(CallError::MutexPoisoned(self.label.to_string()).into()),
        }
    }
}

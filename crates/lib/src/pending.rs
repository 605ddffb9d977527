//! Keyed registry of in-flight calls.
//!
//! At most one call per key is live. Beginning a call for a key cancels the
//! previous call's token, so the older call can no longer resolve or deliver.
//! Each call removes its own entry (never a newer one) when its guard drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

struct Entry {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct PendingCalls {
    active: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new call for `key`, superseding any call already registered.
    pub fn begin(&self, key: &str) -> PendingCall<'_> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let previous = self.active().insert(
            key.to_string(),
            Entry {
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            log::debug!("call for {} superseded", key);
            previous.cancel.cancel();
        }
        PendingCall {
            calls: self,
            key: key.to_string(),
            generation,
            cancel,
        }
    }

    /// Cancel the live call for `key`, if any.
    pub fn cancel(&self, key: &str) -> bool {
        match self.active().remove(key) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, entry) in self.active().drain() {
            entry.cancel.cancel();
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn finish(&self, key: &str, generation: u64) {
        let mut active = self.active();
        if active.get(key).is_some_and(|e| e.generation == generation) {
            active.remove(key);
        }
    }
}

/// A live call. Dropping it cancels the call's token and unregisters it.
pub struct PendingCall<'a> {
    calls: &'a PendingCalls,
    key: String,
    generation: u64,
    cancel: CancellationToken,
}

impl PendingCall<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// False once superseded or cancelled.
    pub fn is_current(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.calls.finish(&self.key, self.generation);
    }
}

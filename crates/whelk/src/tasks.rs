//! Per-session-key tracking of in-flight executions.
//!
//! Each invocation is scoped to a session key. Starting a new run for a key
//! cancels any still-running previous one for that key, so two executions
//! never compete to write the same state blob. Cancellation is cooperative:
//! the engine observes the flag through its progress hook and aborts cleanly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A shared cancellation flag observed by a running engine.
///
/// Cloning produces another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a new, uncancelled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the run observing this flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn same_flag(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Registry of in-flight executions keyed by session key.
///
/// Holds at most one flag per key. The registry does not serialize runs for a
/// key; it only guarantees that beginning a new run revokes the previous one.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    inner: Mutex<HashMap<String, CancelFlag>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a run for `key`, cancelling any previous run still registered
    /// under the same key. Returns the flag the new run should observe.
    pub fn begin(&self, key: &str) -> CancelFlag {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = inner.get(key) {
            previous.cancel();
        }
        let flag = CancelFlag::new();
        inner.insert(key.to_string(), flag.clone());
        flag
    }

    /// Cancel the in-flight run for `key`, if any. Returns whether a run was
    /// registered for the key.
    pub fn cancel(&self, key: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.get(key) {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }

    /// Mark a run as finished. The entry is removed only if `flag` is still
    /// the registered one, so a newer run for the same key is left alone.
    ///
    /// Returns whether `flag` was still the current run for `key`. A revoked
    /// run gets `false` and must not publish its results: the newer run owns
    /// the key now.
    pub fn finish(&self, key: &str, flag: &CancelFlag) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.get(key).is_some_and(|current| current.same_flag(flag)) {
            inner.remove(key);
            true
        } else {
            false
        }
    }
}

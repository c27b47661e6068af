//! Concurrency-safe session table with background expiry sweeping.
//!
//! The store is the only mutable shared in-memory resource in the bridge.
//! It owns every [`Session`] and its per-session rate limit state; other
//! components talk to it by handle and receive session data by value.
//!
//! All table operations run under one mutex held only for the in-memory
//! mutation - never across an await point or any I/O. The sweep collects
//! expired handles under the same lock, so a handle can never be both
//! removed by the sweep and returned by a concurrent `get` after the
//! sweep's removal point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::limiter::{AcquireDecision, RateLimitState, TokenBucket};

use super::session::{Credential, Session};

struct Entry {
    session: Session,
    rate: RateLimitState,
}

pub struct SessionStore {
    bucket: TokenBucket,
    table: Mutex<HashMap<String, Entry>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStore {
    pub fn new(bucket: TokenBucket) -> Self {
        Self {
            bucket,
            table: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // Poisoning means a panic mid-mutation; the table can no longer
        // be trusted, so aborting is the only safe option.
        self.table.lock().expect("session table poisoned")
    }

    /// Insert a freshly created session.
    ///
    /// A handle collision is a broken-invariant condition (handles carry
    /// 128 bits of randomness), not a user error, and aborts the process.
    pub fn put(&self, session: Session) {
        let mut table = self.lock();
        let handle = session.handle.clone();
        let entry = Entry {
            session,
            rate: self.bucket.new_state(Instant::now()),
        };
        if table.insert(handle.clone(), entry).is_some() {
            panic!("session handle collision for '{handle}'");
        }
        debug!(handle = %truncated(&handle), total = table.len(), "session registered");
    }

    /// Fetch a session by value. Does not update `last_used_at`.
    pub fn get(&self, handle: &str) -> Result<Session> {
        self.lock()
            .get(handle)
            .map(|e| e.session.clone())
            .ok_or_else(|| BridgeError::SessionNotFound(truncated(handle)))
    }

    /// Mark the session as used, keeping it warm for status reporting.
    pub fn touch(&self, handle: &str) -> Result<()> {
        let mut table = self.lock();
        match table.get_mut(handle) {
            Some(entry) => {
                entry.session.last_used_at = Utc::now();
                Ok(())
            }
            None => Err(BridgeError::SessionNotFound(truncated(handle))),
        }
    }

    /// Remove a session. Returns whether it was live. Idempotent.
    pub fn remove(&self, handle: &str) -> bool {
        let removed = self.lock().remove(handle).is_some();
        if removed {
            debug!(handle = %truncated(handle), "session removed");
        }
        removed
    }

    /// Install a refreshed credential and extend the expiry deadline.
    pub fn renew(&self, handle: &str, credential: Credential, ttl: Duration) -> Result<()> {
        let mut table = self.lock();
        match table.get_mut(handle) {
            Some(entry) => {
                entry.session.renew(credential, ttl);
                Ok(())
            }
            None => Err(BridgeError::SessionNotFound(truncated(handle))),
        }
    }

    /// Spend one rate limit token for this session.
    ///
    /// Never blocks: an empty bucket surfaces [`BridgeError::RateLimited`]
    /// with the time until a token becomes available, and the caller
    /// decides whether to wait or fail fast.
    pub fn try_acquire(&self, handle: &str) -> Result<()> {
        let mut table = self.lock();
        let entry = table
            .get_mut(handle)
            .ok_or_else(|| BridgeError::SessionNotFound(truncated(handle)))?;
        match self.bucket.try_acquire(&mut entry.rate, Instant::now()) {
            AcquireDecision::Allowed { .. } => Ok(()),
            AcquireDecision::Denied {
                remaining,
                retry_after,
            } => Err(BridgeError::RateLimited {
                remaining,
                retry_after,
            }),
        }
    }

    /// Remove every session whose deadline has passed. Returns the number
    /// of evicted sessions. Cached tokens on disk are untouched; a swept
    /// session can be rebuilt from the vault.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut table = self.lock();
        let expired: Vec<String> = table
            .iter()
            .filter(|(_, e)| e.session.is_expired(now))
            .map(|(h, _)| h.clone())
            .collect();
        for handle in &expired {
            table.remove(handle);
            debug!(handle = %truncated(handle), "expired session swept");
        }
        if !expired.is_empty() {
            info!(evicted = expired.len(), remaining = table.len(), "session sweep completed");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Start the background sweep task. Runs for the life of the process
    /// unless [`shutdown`](Self::shutdown) is called.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let store = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.sweep(Utc::now());
            }
        });
        let mut slot = self.sweeper.lock().expect("sweeper slot poisoned");
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    /// Stop the sweep task. Safe to call more than once.
    pub fn shutdown(&self) {
        if let Some(task) = self.sweeper.lock().expect("sweeper slot poisoned").take() {
            task.abort();
            debug!("session sweeper stopped");
        }
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// First 8 characters of a handle, for logs and error messages.
fn truncated(handle: &str) -> String {
    handle.chars().take(8).collect()
}

//! Re-entrant mutual exclusion across processes.
//!
//! Lock records live in a shared store and map the lock key to the owner
//! token of the handle holding it. Each handle also keeps a local hold
//! count so that nested acquisitions by the same handle never touch the
//! store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::error::{CoordkitError, Result};
use crate::store::LockStore;

/// Default deadline for one store call.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Hands out lock handles bound to one store.
pub struct LockClient<S: LockStore> {
    store: Arc<S>,
    timeout: Duration,
}

impl<S: LockStore> Clone for LockClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            timeout: self.timeout,
        }
    }
}

impl<S: LockStore> LockClient<S> {
    /// Create a client over `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the deadline for each store call made by handles from this client.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create a handle for `key` with a fresh owner token.
    ///
    /// Performs no I/O.
    pub fn obtain(&self, key: impl Into<String>) -> LockHandle<S> {
        LockHandle {
            store: self.store.clone(),
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            timeout: self.timeout,
            state: Mutex::new(HoldState::Unheld),
        }
    }
}

/// Hold state of one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldState {
    Unheld,
    /// Store record owned, acquired this many times
    Held(u32),
}

/// A re-entrant lock on one key, owned by one token.
///
/// Share a handle (e.g. behind an `Arc`) to re-enter it; separate handles
/// for the same key exclude each other.
pub struct LockHandle<S: LockStore> {
    store: Arc<S>,
    key: String,
    token: String,
    timeout: Duration,
    state: Mutex<HoldState>,
}

impl<S: LockStore> std::fmt::Debug for LockHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl<S: LockStore> LockHandle<S> {
    /// Try to acquire the lock, holding the store record for `ttl`.
    ///
    /// Re-entering a lock this handle already holds succeeds without a store
    /// round trip and leaves the record's TTL untouched. Returns `Ok(false)`
    /// when another owner holds the lock.
    pub async fn try_lock(&self, ttl: Duration) -> Result<bool> {
        let ttl_ms = ttl_millis(ttl)?;
        let mut state = self.state.lock().await;

        if let HoldState::Held(count) = *state {
            *state = HoldState::Held(count + 1);
            trace!(key = %self.key, count = count + 1, "Re-entered lock");
            return Ok(true);
        }

        match self.call(self.store.acquire(&self.key, &self.token, ttl_ms)).await {
            Ok(true) => {
                *state = HoldState::Held(1);
                debug!(key = %self.key, ttl_ms = ttl_ms, "Acquired lock");
                Ok(true)
            }
            Ok(false) => {
                trace!(key = %self.key, "Lock held by another owner");
                Ok(false)
            }
            Err(e) => {
                error!(key = %self.key, error = %e, "Error on acquiring lock");
                Err(e)
            }
        }
    }

    /// Release one acquisition.
    ///
    /// Returns `Ok(true)` while nested acquisitions remain. The last release
    /// deletes the store record only if it still carries this handle's
    /// token and reports whether it did. Releasing a handle that holds
    /// nothing returns `Ok(false)` without touching the store. If the store
    /// call fails the handle stays held so the release can be retried.
    pub async fn unlock(&self) -> Result<bool> {
        let mut state = self.state.lock().await;

        match *state {
            HoldState::Unheld => {
                debug!(key = %self.key, "Unlock on a handle that holds nothing");
                Ok(false)
            }
            HoldState::Held(count) if count > 1 => {
                *state = HoldState::Held(count - 1);
                trace!(key = %self.key, count = count - 1, "Left nested lock");
                Ok(true)
            }
            HoldState::Held(_) => {
                let released = self.call(self.store.release(&self.key, &self.token)).await?;
                *state = HoldState::Unheld;
                if released {
                    debug!(key = %self.key, "Released lock");
                } else {
                    warn!(key = %self.key, "Lock record expired or taken over before release");
                }
                Ok(released)
            }
        }
    }

    /// Number of outstanding acquisitions on this handle.
    pub async fn hold_count(&self) -> u32 {
        match *self.state.lock().await {
            HoldState::Unheld => 0,
            HoldState::Held(count) => count,
        }
    }

    /// The lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The owner token written to the store while held.
    pub fn token(&self) -> &str {
        &self.token
    }

    async fn call<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| CoordkitError::StoreTimeout(self.timeout))?
    }
}

impl<S: LockStore> Drop for LockHandle<S> {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_lock() {
            if let HoldState::Held(count) = *state {
                warn!(
                    key = %self.key,
                    count = count,
                    "Lock handle dropped while held, record stays until its TTL"
                );
            }
        }
    }
}

fn ttl_millis(ttl: Duration) -> Result<u64> {
    let millis = ttl.as_millis();
    if millis == 0 {
        return Err(CoordkitError::InvalidArgument(format!(
            "invalid lock ttl: {:?}",
            ttl
        )));
    }
    Ok(u64::try_from(millis).unwrap_or(u64::MAX))
}

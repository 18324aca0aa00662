//! Distributed period limiter backed by a shared key-value store.
//!
//! Counting happens entirely inside one scripted store operation, so any
//! number of processes can share a quota without client-side races.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::{PeriodLimiter, PermitState};
use super::window::Window;
use crate::error::{CoordkitError, Result};
use crate::store::QuotaStore;

/// Default deadline for one store call.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// A period limiter whose windows live in a shared store.
pub struct DistributedPeriodLimiter<S: QuotaStore> {
    store: Arc<S>,
    window: Window,
    quota: u64,
    key_prefix: String,
    timeout: Duration,
}

impl<S: QuotaStore> std::fmt::Debug for DistributedPeriodLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedPeriodLimiter")
            .field("window", &self.window)
            .field("quota", &self.quota)
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<S: QuotaStore> DistributedPeriodLimiter<S> {
    /// Create a limiter allowing `quota` takes per window, with counters
    /// stored under `key_prefix`.
    pub fn new(store: Arc<S>, window: Window, quota: u64, key_prefix: impl Into<String>) -> Result<Self> {
        if quota == 0 {
            return Err(CoordkitError::InvalidArgument(
                "quota must be at least one".into(),
            ));
        }
        Ok(Self {
            store,
            window,
            quota,
            key_prefix: key_prefix.into(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Set the deadline for each store call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Take one permit for `key`.
    ///
    /// Store failures, timeouts and unexpected script results are returned
    /// as errors; callers must treat them as rejections.
    pub async fn take(&self, key: &str) -> Result<PermitState> {
        let store_key = self.store_key(key);
        let expire_secs = self.window.expire_secs();

        trace!(
            key = %store_key,
            quota = self.quota,
            expire_secs = expire_secs,
            "Checking distributed quota"
        );

        let call = self.store.incr_and_check(&store_key, self.quota, expire_secs);
        let code = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                warn!(key = %store_key, error = %e, "Quota store call failed");
                return Err(e);
            }
            Err(_) => {
                warn!(key = %store_key, timeout = ?self.timeout, "Quota store call timed out");
                return Err(CoordkitError::StoreTimeout(self.timeout));
            }
        };

        let state = PermitState::from_code(code)?;
        if state == PermitState::OverQuota {
            debug!(key = %store_key, quota = self.quota, "Distributed quota exceeded");
        }
        Ok(state)
    }

    /// Get the key the counter for `key` is stored under.
    pub fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Get the quota per window.
    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Get the window definition.
    pub fn window(&self) -> Window {
        self.window
    }
}

#[async_trait]
impl<S: QuotaStore> PeriodLimiter for DistributedPeriodLimiter<S> {
    async fn take(&self, key: &str) -> Result<PermitState> {
        DistributedPeriodLimiter::take(self, key).await
    }
}

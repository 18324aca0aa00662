//! Single-process period limiter.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::{PeriodLimiter, PermitState};
use super::window::Window;
use crate::clock::deadline_after;
use crate::error::{CoordkitError, Result};

/// Count for one key within its current window.
#[derive(Debug, Clone, Copy)]
struct QuotaWindow {
    count: u64,
    reset_at: Instant,
}

/// A period limiter that keeps its windows in process memory.
///
/// All keys share one mutex. This struct is thread-safe and can be shared
/// across multiple tasks.
#[derive(Debug)]
pub struct LocalPeriodLimiter {
    window: Window,
    quota: u64,
    windows: Mutex<HashMap<String, QuotaWindow>>,
}

impl LocalPeriodLimiter {
    /// Create a limiter allowing `quota` takes per `period_secs` rolling window.
    pub fn new(period_secs: u64, quota: u64) -> Result<Self> {
        Self::with_window(Window::new(period_secs)?, quota)
    }

    /// Create a limiter over an explicit window.
    pub fn with_window(window: Window, quota: u64) -> Result<Self> {
        if quota == 0 {
            return Err(CoordkitError::InvalidArgument(
                "quota must be at least one".into(),
            ));
        }
        Ok(Self {
            window,
            quota,
            windows: Mutex::new(HashMap::new()),
        })
    }

    /// Take one permit for `key`.
    ///
    /// The first take of a window is always allowed and opens the window.
    pub fn take(&self, key: &str) -> PermitState {
        let now = Instant::now();
        let mut windows = self.windows.lock();

        let state = windows.entry(key.to_string()).or_insert(QuotaWindow {
            count: 0,
            reset_at: now,
        });

        if state.reset_at <= now {
            state.count = 1;
            state.reset_at = deadline_after(now, Duration::from_secs(self.window.expire_secs()));
            trace!(key = %key, "Opened new quota window");
            return PermitState::Allowed;
        }

        state.count += 1;
        let permit = if state.count < self.quota {
            PermitState::Allowed
        } else if state.count == self.quota {
            PermitState::HitQuota
        } else {
            PermitState::OverQuota
        };

        if permit == PermitState::OverQuota {
            debug!(key = %key, count = state.count, quota = self.quota, "Local quota exceeded");
        }
        permit
    }

    /// Drop windows that have already elapsed.
    ///
    /// Returns the number of windows removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| w.reset_at > now);
        before - windows.len()
    }

    /// Get the current count for `key`, `None` outside any live window.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let windows = self.windows.lock();
        windows
            .get(key)
            .filter(|w| w.reset_at > now)
            .map(|w| w.count)
    }

    /// Get the number of tracked keys.
    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.windows.lock().is_empty()
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
impl PeriodLimiter for LocalPeriodLimiter {
    async fn take(&self, key: &str) -> Result<PermitState> {
        Ok(LocalPeriodLimiter::take(self, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_construction() {
        assert!(LocalPeriodLimiter::new(0, 3).is_err());
        assert!(LocalPeriodLimiter::new(5, 0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_sequence_within_window() {
        let limiter = LocalPeriodLimiter::new(5, 3).unwrap();

        let states: Vec<PermitState> = (0..5).map(|_| limiter.take("ip1")).collect();
        assert_eq!(
            states,
            vec![
                PermitState::Allowed,
                PermitState::Allowed,
                PermitState::HitQuota,
                PermitState::OverQuota,
                PermitState::OverQuota,
            ]
        );
        assert_eq!(limiter.current_count("ip1"), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_period() {
        let limiter = LocalPeriodLimiter::new(5, 3).unwrap();
        for _ in 0..4 {
            limiter.take("ip1");
        }

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(limiter.take("ip1"), PermitState::OverQuota);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.take("ip1"), PermitState::Allowed);
        assert_eq!(limiter.current_count("ip1"), Some(1));
        assert_eq!(limiter.take("ip1"), PermitState::Allowed);
        assert_eq!(limiter.take("ip1"), PermitState::HitQuota);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_of_one() {
        let limiter = LocalPeriodLimiter::new(1, 1).unwrap();
        assert_eq!(limiter.take("k"), PermitState::Allowed);
        assert_eq!(limiter.take("k"), PermitState::OverQuota);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = LocalPeriodLimiter::new(60, 2).unwrap();

        assert_eq!(limiter.take("a"), PermitState::Allowed);
        assert_eq!(limiter.take("a"), PermitState::HitQuota);
        assert_eq!(limiter.take("b"), PermitState::Allowed);
        assert_eq!(limiter.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_expired() {
        let limiter = LocalPeriodLimiter::new(5, 10).unwrap();
        limiter.take("old");
        tokio::time::advance(Duration::from_secs(3)).await;
        limiter.take("new");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.remove_expired(), 1);
        assert_eq!(limiter.len(), 1);
        assert_eq!(limiter.current_count("old"), None);
        assert_eq!(limiter.current_count("new"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_period_does_not_overflow() {
        let limiter = LocalPeriodLimiter::new(u64::MAX, 3).unwrap();
        assert_eq!(limiter.take("k"), PermitState::Allowed);
        assert_eq!(limiter.take("k"), PermitState::Allowed);
        assert_eq!(limiter.take("k"), PermitState::HitQuota);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(limiter.take("k"), PermitState::OverQuota);
        assert_eq!(limiter.remove_expired(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_takes_count_exactly() {
        let limiter = std::sync::Arc::new(LocalPeriodLimiter::new(3600, 50).unwrap());

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { PeriodLimiter::take(&*limiter, "shared").await })
            })
            .collect();

        let mut admitted = 0;
        let mut hit = 0;
        for handle in handles {
            let state = handle.await.unwrap().unwrap();
            if state.is_admitted() {
                admitted += 1;
            }
            if state == PermitState::HitQuota {
                hit += 1;
            }
        }

        assert_eq!(admitted, 50);
        assert_eq!(hit, 1);
        assert_eq!(limiter.current_count("shared"), Some(100));
    }
}

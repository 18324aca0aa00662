//! Fail-closed admission control on top of a period limiter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::backend::{PeriodLimiter, PermitState};
use super::distributed::DistributedPeriodLimiter;
use super::local::LocalPeriodLimiter;
use super::window::Window;
use crate::config::{CoordkitConfig, PeriodLimitConfig};
use crate::error::Result;
use crate::store::{QuotaStore, RedisStore};
use crate::task::PeriodicTask;

/// Admission decision point for request handlers.
///
/// A limiter error never lets a request through: it is logged and reported
/// as [`PermitState::Unknown`], which is not admitted.
#[derive(Clone)]
pub struct Throttle {
    limiter: Option<Arc<dyn PeriodLimiter>>,
    /// Drops elapsed local windows; stops with the last clone.
    housekeeping: Option<Arc<PeriodicTask>>,
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Throttle {
    /// Throttle through an existing limiter.
    pub fn new(limiter: Arc<dyn PeriodLimiter>) -> Self {
        Self {
            limiter: Some(limiter),
            housekeeping: None,
        }
    }

    /// Throttle through an in-process limiter, dropping its elapsed windows
    /// once per period.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_housekeeping(limiter: Arc<LocalPeriodLimiter>) -> Self {
        let swept = limiter.clone();
        let task = PeriodicTask::spawn("quota-sweep", limiter.window().duration(), move || {
            let swept = swept.clone();
            async move {
                let removed = swept.remove_expired();
                if removed > 0 {
                    debug!(removed = removed, "Dropped elapsed quota windows");
                } else {
                    trace!("No elapsed quota windows");
                }
            }
        });

        let limiter: Arc<dyn PeriodLimiter> = limiter;
        Self {
            limiter: Some(limiter),
            housekeeping: Some(Arc::new(task)),
        }
    }

    /// A throttle that admits every request.
    pub fn disabled() -> Self {
        Self {
            limiter: None,
            housekeeping: None,
        }
    }

    /// Build the throttle described by `config`, connecting to the shared
    /// store when distributed counting is enabled.
    pub async fn from_config(config: &CoordkitConfig) -> Result<Self> {
        let limit = &config.period_limit;
        if !limit.enable {
            info!("Period limit disabled");
            return Ok(Self::disabled());
        }
        if limit.distributed {
            let store = Arc::new(RedisStore::connect(&config.store).await?);
            return Self::distributed(limit, store, config.store.timeout());
        }
        Self::local(limit)
    }

    /// Build an in-process throttle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn local(config: &PeriodLimitConfig) -> Result<Self> {
        let window = Window::new(config.period)?.aligned(config.align);
        let limiter = LocalPeriodLimiter::with_window(window, config.quota)?;
        info!(
            period = config.period,
            quota = config.quota,
            align = config.align,
            "Local period limit initialized"
        );
        Ok(Self::with_housekeeping(Arc::new(limiter)))
    }

    /// Build a throttle counting in `store`.
    pub fn distributed<S: QuotaStore + 'static>(
        config: &PeriodLimitConfig,
        store: Arc<S>,
        timeout: Duration,
    ) -> Result<Self> {
        let window = Window::new(config.period)?.aligned(config.align);
        let limiter =
            DistributedPeriodLimiter::new(store, window, config.quota, config.key_prefix.clone())?
                .with_timeout(timeout);
        info!(
            period = config.period,
            quota = config.quota,
            align = config.align,
            key_prefix = %config.key_prefix,
            "Distributed period limit initialized"
        );
        Ok(Self::new(Arc::new(limiter)))
    }

    /// Whether requests are being counted at all.
    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Decide on one request identified by `key`.
    pub async fn check(&self, key: &str) -> PermitState {
        let Some(limiter) = &self.limiter else {
            return PermitState::Allowed;
        };

        match limiter.take(key).await {
            Ok(PermitState::OverQuota) => {
                warn!(key = %key, "Resource limited");
                PermitState::OverQuota
            }
            Ok(state) => state,
            Err(e) => {
                error!(key = %key, error = %e, "Period limit check failed, rejecting");
                PermitState::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limit_config(distributed: bool) -> PeriodLimitConfig {
        PeriodLimitConfig {
            enable: true,
            distributed,
            period: 5,
            quota: 2,
            ..PeriodLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_admits_everything() {
        let throttle = Throttle::from_config(&CoordkitConfig::default()).await.unwrap();
        assert!(!throttle.is_enabled());
        for _ in 0..1000 {
            assert_eq!(throttle.check("k").await, PermitState::Allowed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_from_config() {
        let mut config = CoordkitConfig::default();
        config.period_limit = limit_config(false);
        let throttle = Throttle::from_config(&config).await.unwrap();

        assert!(throttle.is_enabled());
        assert_eq!(throttle.check("/a").await, PermitState::Allowed);
        assert_eq!(throttle.check("/a").await, PermitState::HitQuota);
        let state = throttle.check("/a").await;
        assert_eq!(state, PermitState::OverQuota);
        assert!(!state.is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distributed_uses_key_prefix() {
        let store = Arc::new(MemoryStore::new());
        let throttle =
            Throttle::distributed(&limit_config(true), store.clone(), Duration::from_secs(1)).unwrap();

        assert!(throttle.check("/login").await.is_admitted());
        assert_eq!(store.get("REST_PERIOD_LIMIT/login").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let throttle =
            Throttle::distributed(&limit_config(true), store, Duration::from_secs(1)).unwrap();

        let state = throttle.check("/login").await;
        assert_eq!(state, PermitState::Unknown);
        assert!(!state.is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_windows_are_swept() {
        let limiter = Arc::new(LocalPeriodLimiter::new(1, 5).unwrap());
        let throttle = Throttle::with_housekeeping(limiter.clone());

        for i in 0..1000 {
            assert!(throttle.check(&format!("/item/{}", i)).await.is_admitted());
        }
        assert_eq!(limiter.len(), 1000);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(limiter.is_empty());

        assert!(throttle.check("/item/0").await.is_admitted());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(limiter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_stops_with_last_clone() {
        let limiter = Arc::new(LocalPeriodLimiter::new(1, 5).unwrap());
        let throttle = Throttle::with_housekeeping(limiter.clone());
        let copy = throttle.clone();
        assert_eq!(Arc::strong_count(&limiter), 3);

        drop(throttle);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(Arc::strong_count(&limiter), 3);

        drop(copy);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(Arc::strong_count(&limiter), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = limit_config(false);
        config.quota = 0;
        assert!(Throttle::local(&config).is_err());
    }
}

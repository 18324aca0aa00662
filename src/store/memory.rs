//! In-process store with the same atomic semantics as the redis scripts.
//!
//! Useful for single-node deployments and tests. Every operation runs
//! under one mutex, which stands in for the server-side script execution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::{LockStore, QuotaStore, CODE_ALLOWED, CODE_HIT_QUOTA, CODE_OVER_QUOTA};
use crate::clock::deadline_after;
use crate::error::{CoordkitError, Result};

#[derive(Debug, Clone)]
struct Record {
    value: String,
    expire_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expire_at.map_or(true, |at| at > now)
    }
}

/// A single-process key-value store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Record>>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every subsequent operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Number of store operations attempted so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Read the live value at `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let records = self.records.lock();
        records
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| r.value.clone())
    }

    /// Remaining time to live of `key`, `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let records = self.records.lock();
        records
            .get(key)
            .filter(|r| r.is_live(now))
            .and_then(|r| r.expire_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Write a value directly, bypassing the scripted operations.
    ///
    /// Simulates another process or an operator touching the key.
    pub fn insert_raw(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let expire_at = ttl.map(|ttl| deadline_after(Instant::now(), ttl));
        self.records.lock().insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                expire_at,
            },
        );
    }

    async fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordkitError::Store("memory store unavailable".into()));
        }
        Ok(())
    }

    fn live_record<'a>(
        records: &'a mut HashMap<String, Record>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Record> {
        if records.get(key).is_some_and(|r| !r.is_live(now)) {
            records.remove(key);
        }
        records.get_mut(key)
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn incr_and_check(&self, key: &str, quota: u64, expire_secs: u64) -> Result<i64> {
        self.enter().await?;

        let now = Instant::now();
        let mut records = self.records.lock();
        let current = match Self::live_record(&mut records, key, now) {
            Some(record) => {
                let value: i64 = record.value.parse().map_err(|_| {
                    CoordkitError::Store(format!("value at {} is not an integer", key))
                })?;
                let current = value + 1;
                record.value = current.to_string();
                current
            }
            None => {
                records.insert(
                    key.to_string(),
                    Record {
                        value: "1".to_string(),
                        expire_at: Some(deadline_after(now, Duration::from_secs(expire_secs))),
                    },
                );
                1
            }
        };

        trace!(key = %key, current = current, quota = quota, "Incremented quota counter");

        let quota = quota as i64;
        let code = if current == 1 || current < quota {
            CODE_ALLOWED
        } else if current == quota {
            CODE_HIT_QUOTA
        } else {
            CODE_OVER_QUOTA
        };
        Ok(code)
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn acquire(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool> {
        self.enter().await?;

        let now = Instant::now();
        let expire_at = Some(deadline_after(now, Duration::from_millis(ttl_ms)));
        let mut records = self.records.lock();
        match Self::live_record(&mut records, key, now) {
            Some(record) if record.value == token => {
                record.expire_at = expire_at;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                records.insert(
                    key.to_string(),
                    Record {
                        value: token.to_string(),
                        expire_at,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        self.enter().await?;

        let now = Instant::now();
        let mut records = self.records.lock();
        let owned = Self::live_record(&mut records, key, now).is_some_and(|r| r.value == token);
        if owned {
            records.remove(key);
        }
        Ok(owned)
    }
}

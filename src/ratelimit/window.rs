//! Quota window length and expiration arithmetic.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local};

use crate::error::{CoordkitError, Result};

/// Time window for period limiting.
///
/// A rolling window lasts `period` from the first request in it. An aligned
/// window ends on the next multiple of `period` in local time, so a one-day
/// period resets at local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    period_secs: u64,
    align: bool,
}

impl Window {
    /// Create a rolling window of `period_secs` seconds.
    pub fn new(period_secs: u64) -> Result<Self> {
        if period_secs == 0 {
            return Err(CoordkitError::InvalidArgument(
                "period must be at least one second".into(),
            ));
        }
        Ok(Self {
            period_secs,
            align: false,
        })
    }

    /// Align the window end to local-time multiples of the period.
    pub fn aligned(mut self, align: bool) -> Self {
        self.align = align;
        self
    }

    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// Whether windows are aligned to local time.
    pub fn is_aligned(&self) -> bool {
        self.align
    }

    /// Seconds until a window opened now should expire.
    pub fn expire_secs(&self) -> u64 {
        self.expire_secs_at(Local::now().fixed_offset())
    }

    /// Seconds until a window opened at `now` should expire.
    ///
    /// Always in `1..=period`.
    pub fn expire_secs_at(&self, now: DateTime<FixedOffset>) -> u64 {
        if !self.align {
            return self.period_secs;
        }
        let local = now.timestamp() + i64::from(now.offset().local_minus_utc());
        let into_window = local.rem_euclid(self.period_secs as i64) as u64;
        self.period_secs - into_window
    }
}

//! Deadline arithmetic on the tokio clock.

use std::time::Duration;

use tokio::time::Instant;

use crate::cache::PERMANENT_TTL;

/// The instant `ttl` after `now`.
///
/// Lifetimes longer than [`PERMANENT_TTL`] are capped to it, so any
/// configured period or TTL yields a representable deadline.
pub(crate) fn deadline_after(now: Instant, ttl: Duration) -> Instant {
    now + ttl.min(PERMANENT_TTL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_short_ttl_is_exact() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_ttl_is_capped() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::MAX), now + PERMANENT_TTL);
        assert_eq!(
            deadline_after(now, Duration::from_secs(u64::MAX)),
            now + PERMANENT_TTL
        );
    }
}

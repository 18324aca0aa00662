//! Period limiter trait for abstracting local and distributed implementations.

use std::fmt;

use async_trait::async_trait;

use crate::error::{CoordkitError, Result};
use crate::store::{CODE_ALLOWED, CODE_HIT_QUOTA, CODE_OVER_QUOTA};

/// Outcome of taking a permit from a period limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermitState {
    /// No verdict could be reached; treated as rejected
    Unknown,
    /// Within quota
    Allowed,
    /// Exactly at quota; this request is still allowed
    HitQuota,
    /// Past quota
    OverQuota,
}

impl PermitState {
    /// Whether the request carrying this permit may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, PermitState::Allowed | PermitState::HitQuota)
    }

    /// Map a script result code to a permit state.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            CODE_ALLOWED => Ok(PermitState::Allowed),
            CODE_HIT_QUOTA => Ok(PermitState::HitQuota),
            CODE_OVER_QUOTA => Ok(PermitState::OverQuota),
            other => Err(CoordkitError::UnknownCode(other)),
        }
    }
}

impl fmt::Display for PermitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PermitState::Unknown => "unknown",
            PermitState::Allowed => "allowed",
            PermitState::HitQuota => "hit-quota",
            PermitState::OverQuota => "over-quota",
        };
        f.write_str(name)
    }
}

/// Trait for period limiter implementations.
///
/// This trait abstracts over both the `LocalPeriodLimiter` and the
/// `DistributedPeriodLimiter` so admission control can work with either.
#[async_trait]
pub trait PeriodLimiter: Send + Sync {
    /// Take one permit for `key`.
    async fn take(&self, key: &str) -> Result<PermitState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code() {
        assert_eq!(PermitState::from_code(1).unwrap(), PermitState::Allowed);
        assert_eq!(PermitState::from_code(2).unwrap(), PermitState::HitQuota);
        assert_eq!(PermitState::from_code(3).unwrap(), PermitState::OverQuota);
        assert!(matches!(
            PermitState::from_code(0),
            Err(CoordkitError::UnknownCode(0))
        ));
    }

    #[test]
    fn test_admission() {
        assert!(PermitState::Allowed.is_admitted());
        assert!(PermitState::HitQuota.is_admitted());
        assert!(!PermitState::OverQuota.is_admitted());
        assert!(!PermitState::Unknown.is_admitted());
    }
}

//! Retry and lease policies.
//!
//! There is no backoff: a failed message is eligible again on the next sweep of
//! any worker. The sweep interval is the only spacing between attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::ConfigError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Bounds delivery attempts per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        Ok(Self { max_attempts })
    }

    /// `failed_attempts >= max_attempts`.
    pub fn is_exhausted(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Claim expiry.
///
/// `expires_after = None` keeps claims forever: a crashed worker's messages stay
/// with its identity until it restarts or an operator releases them.
/// With `Some(d)`, a claim older than `d` is treated as unowned by `claim_unowned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeasePolicy {
    pub expires_after: Option<Duration>,
}

impl LeasePolicy {
    pub fn never_expires() -> Self {
        Self { expires_after: None }
    }

    pub fn expires_after(timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::ZeroLeaseTimeout);
        }
        Ok(Self {
            expires_after: Some(timeout),
        })
    }

    /// Claims taken strictly before the returned instant are stale.
    pub fn stale_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let timeout = chrono::Duration::from_std(self.expires_after?).ok()?;
        now.checked_sub_signed(timeout)
    }
}

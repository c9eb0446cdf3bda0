// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff and retirement bounds for queued deliveries.
//!
//! - Delay after the n-th failure: `base_delay * 2^n`, capped at `max_delay`
//!   (1s base: 2s, 4s, 8s, ... up to 5 minutes)
//! - An entry still inside its first `fast_attempts` failures holds back the
//!   entries queued after it; past that it is skipped over while it waits.
//! - An entry is dead-lettered after `max_attempts` failures or once it is
//!   older than `max_age`.

use crate::config::ConfigError;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub fast_attempts: u32,
    pub max_attempts: u32,
    pub max_age: Duration,
}

impl RetryPolicy {
    pub const DEFAULT: Self = Self {
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(300),
        fast_attempts: 3,
        max_attempts: 100,
        max_age: Duration::from_secs(72 * 60 * 60),
    };

    /// Delay before the next attempt of an entry that has failed
    /// `attempt_count` times.
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        // Saturates for large attempt counts; the cap applies afterwards
        let factor = 1u64.checked_shl(attempt_count.min(63)).unwrap_or(u64::MAX);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_ms.saturating_mul(factor));
        delay.min(self.max_delay)
    }

    /// Whether an entry with this many failures still blocks later entries.
    pub fn blocks_head_of_line(&self, attempt_count: u32) -> bool {
        attempt_count > 0 && attempt_count <= self.fast_attempts
    }

    /// Whether an entry should leave the active rotation.
    pub fn is_exhausted(&self, attempt_count: u32, age: Duration) -> bool {
        attempt_count >= self.max_attempts || age >= self.max_age
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::Invalid(
                "RETRY_BASE_MS must be greater than 0".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::Invalid(
                "RETRY_MAX_MS must not be smaller than RETRY_BASE_MS".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "RETRY_MAX_ATTEMPTS must be greater than 0".to_string(),
            ));
        }
        if self.max_age.is_zero() {
            return Err(ConfigError::Invalid(
                "RETRY_MAX_AGE_SECS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_delays_double_until_cap() {
        let policy = RetryPolicy::DEFAULT;
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(256));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(300));
    }

    #[test]
    fn test_head_of_line_window() {
        let policy = RetryPolicy::DEFAULT;
        assert!(!policy.blocks_head_of_line(0));
        assert!(policy.blocks_head_of_line(1));
        assert!(policy.blocks_head_of_line(3));
        assert!(!policy.blocks_head_of_line(4));
    }

    #[test]
    fn test_exhaustion_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            max_age: Duration::from_secs(60),
            ..RetryPolicy::DEFAULT
        };
        assert!(!policy.is_exhausted(4, Duration::from_secs(59)));
        assert!(policy.is_exhausted(5, Duration::ZERO));
        assert!(policy.is_exhausted(0, Duration::from_secs(60)));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::DEFAULT.validate().is_ok());
        let policy = RetryPolicy {
            base_delay: Duration::ZERO,
            ..RetryPolicy::DEFAULT
        };
        assert!(policy.validate().is_err());
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(10),
            base_delay: Duration::from_millis(20),
            ..RetryPolicy::DEFAULT
        };
        assert!(policy.validate().is_err());
    }

    proptest! {
        #[test]
        fn delays_are_monotonic_and_bounded(
            base_ms in 1u64..10_000,
            extra_ms in 0u64..1_000_000,
            attempts in 0u32..200,
        ) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(base_ms + extra_ms),
                ..RetryPolicy::DEFAULT
            };
            let mut previous = Duration::ZERO;
            for attempt in 0..attempts {
                let delay = policy.delay_for_attempt(attempt);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }
    }
}

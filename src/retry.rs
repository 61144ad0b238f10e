//! Per-item retry policies: backoff schedules and jitter.
//!
//! A [`RetryOptions`] record describes how many times a failing item
//! operation is retried and how long to wait between attempts. The engine
//! applies it inside transform, aggregate, and sink item loops when the
//! node's execution strategy permits.
//!
//! **Counting scheme.** `max_item_retries` counts *retries*, not calls: the
//! initial invocation is free, attempt `0` is the first retry. A value of
//! `1` therefore allows up to two invocations per item. Node restart
//! budgets ([`RestartOptions`](crate::graph::RestartOptions)) follow the
//! same convention. Configurations that cannot be interpreted this way are
//! rejected by [`RetryOptions::validate`].
//!
//! Backoff sleeps are cancellation-aware: a canceled run aborts the sleep
//! immediately with [`PipelineError::Canceled`].

use crate::error::{PipelineError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How the nominal delay grows across attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// `base_delay` for every attempt.
    Fixed,
    /// `base_delay * (attempt + 1)`.
    Linear,
    /// `base_delay * 2^attempt`, capped at `max_delay`.
    #[default]
    Exponential,
}

/// How the nominal delay is randomized to avoid thundering herds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JitterStrategy {
    /// Use the nominal delay as-is.
    None,
    /// Uniform over `[0, nominal]`.
    Full,
    /// `nominal / 2` plus uniform over `[0, nominal / 2]`.
    #[default]
    Equal,
    /// AWS-style decorrelated jitter: uniform over
    /// `[base_delay, 3 * previous_delay]`, capped at `max_delay`.
    Decorrelated,
}

/// Retry policy for failing item operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Retries permitted per item (the initial call is not counted).
    pub max_item_retries: u32,
    /// Backoff schedule.
    pub backoff: BackoffStrategy,
    /// Jitter applied on top of the schedule.
    pub jitter: JitterStrategy,
    /// First-attempt delay and the decorrelated-jitter floor.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_item_retries: 0,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Equal,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryOptions {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_item_retries: 0,
            ..Self::default()
        }
    }

    /// `retries` attempts with a constant delay and no jitter.
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            max_item_retries: retries,
            backoff: BackoffStrategy::Fixed,
            jitter: JitterStrategy::None,
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// `retries` attempts with the default exponential/equal-jitter curve.
    pub fn exponential(retries: u32) -> Self {
        Self {
            max_item_retries: retries,
            ..Self::default()
        }
    }

    /// Reject configurations the canonical counting scheme cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.max_item_retries > 0 && self.base_delay > self.max_delay {
            return Err(PipelineError::GraphValidation(format!(
                "retry base_delay ({:?}) exceeds max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        if self.jitter == JitterStrategy::Decorrelated && self.base_delay.is_zero() {
            return Err(PipelineError::GraphValidation(
                "decorrelated jitter requires a non-zero base_delay".into(),
            ));
        }
        Ok(())
    }

    /// Nominal (un-jittered) delay for retry `attempt` (0-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let nominal = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt + 1),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        nominal.min(self.max_delay)
    }

    /// Jittered delay for retry `attempt`. `previous` is the delay actually
    /// slept on the prior attempt (used by decorrelated jitter).
    pub fn delay_for(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if nominal.is_zero() && self.jitter != JitterStrategy::Decorrelated {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        let jittered = match self.jitter {
            JitterStrategy::None => nominal,
            JitterStrategy::Full => {
                Duration::from_nanos(rng.gen_range(0..=nominal.as_nanos() as u64))
            }
            JitterStrategy::Equal => {
                let half = nominal / 2;
                half + Duration::from_nanos(rng.gen_range(0..=half.as_nanos() as u64))
            }
            JitterStrategy::Decorrelated => {
                let floor = self.base_delay.as_nanos() as u64;
                let prev = previous.unwrap_or(self.base_delay).as_nanos() as u64;
                let ceil = prev.saturating_mul(3).max(floor);
                Duration::from_nanos(rng.gen_range(floor..=ceil))
            }
        };
        jittered.min(self.max_delay)
    }

    /// Sleep before retry `attempt`, aborting immediately on cancellation.
    ///
    /// Returns the delay actually slept so callers can feed it back as
    /// `previous` for decorrelated jitter.
    pub async fn backoff_sleep(
        &self,
        attempt: u32,
        previous: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Duration> {
        let delay = self.delay_for(attempt, previous);
        if delay.is_zero() {
            return Ok(delay);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Canceled),
            _ = tokio::time::sleep(delay) => Ok(delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_curve_caps_at_max() {
        let opts = RetryOptions {
            max_item_retries: 10,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(opts.nominal_delay(0), Duration::from_millis(100));
        assert_eq!(opts.nominal_delay(1), Duration::from_millis(200));
        assert_eq!(opts.nominal_delay(2), Duration::from_millis(350));
        assert_eq!(opts.nominal_delay(31), Duration::from_millis(350));
    }

    #[test]
    fn linear_curve_grows_by_base() {
        let opts = RetryOptions {
            backoff: BackoffStrategy::Linear,
            jitter: JitterStrategy::None,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            max_item_retries: 3,
        };
        assert_eq!(opts.delay_for(0, None), Duration::from_millis(10));
        assert_eq!(opts.delay_for(2, None), Duration::from_millis(30));
    }

    #[test]
    fn full_jitter_stays_within_nominal() {
        let opts = RetryOptions {
            jitter: JitterStrategy::Full,
            backoff: BackoffStrategy::Fixed,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            max_item_retries: 1,
        };
        for _ in 0..100 {
            assert!(opts.delay_for(0, None) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn equal_jitter_keeps_half_floor() {
        let opts = RetryOptions {
            jitter: JitterStrategy::Equal,
            backoff: BackoffStrategy::Fixed,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            max_item_retries: 1,
        };
        for _ in 0..100 {
            let d = opts.delay_for(0, None);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }

    #[test]
    fn decorrelated_jitter_respects_bounds() {
        let opts = RetryOptions {
            jitter: JitterStrategy::Decorrelated,
            backoff: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            max_item_retries: 5,
        };
        let mut prev = None;
        for attempt in 0..20 {
            let d = opts.delay_for(attempt, prev);
            assert!(d >= Duration::from_millis(10));
            assert!(d <= Duration::from_millis(200));
            prev = Some(d);
        }
    }

    #[test]
    fn validation_rejects_inverted_bounds() {
        let opts = RetryOptions {
            max_item_retries: 1,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..RetryOptions::default()
        };
        assert!(opts.validate().is_err());
    }

    #[tokio::test]
    async fn backoff_sleep_aborts_on_cancellation() {
        let opts = RetryOptions::fixed(1, Duration::from_secs(30));
        let token = CancellationToken::new();
        token.cancel();
        let err = opts.backoff_sleep(0, None, &token).await.unwrap_err();
        assert!(err.is_cancellation());
    }
}

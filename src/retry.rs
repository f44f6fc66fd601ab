//! Retry policy for reconnect attempts.
//!
//! The supervisor asks a [`Backoff`] for the idle delay after every attempt.
//! The default policy waits a fixed 3 seconds forever, with no jitter and no
//! retry cap.

use rand::Rng;
use std::time::Duration;

/// Default idle delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// How the idle delay grows with consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed {
        /// The delay.
        delay: Duration,
    },
    /// `initial * multiplier^(failures - 1)`, capped at `max`.
    Exponential {
        /// Delay after the first failure (and after any success).
        initial: Duration,
        /// Upper bound on the delay.
        max: Duration,
        /// Growth factor per consecutive failure.
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Fixed {
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Retry policy injected into every supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Delay growth.
    pub strategy: BackoffStrategy,
    /// Random spread applied to each delay, as a fraction in `0.0..=1.0`.
    /// A delay `d` becomes a value in `d * (1 - jitter) ..= d`.
    pub jitter: f64,
    /// Give up after this many consecutive failed attempts.
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    /// Fixed delay, no jitter, no cap.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed { delay },
            ..Self::default()
        }
    }

    /// Doubling delay from `initial` up to `max`, no jitter, no cap.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential {
                initial,
                max,
                multiplier: 2.0,
            },
            ..Self::default()
        }
    }

    /// Set the jitter fraction. Values outside `0.0..=1.0` are clamped.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_nan() {
            0.0
        } else {
            jitter.clamp(0.0, 1.0)
        };
        self
    }

    /// Set the consecutive failure cap.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Delay before the next attempt after `failures` consecutive failures,
    /// without jitter. `failures == 0` means the last attempt connected.
    pub fn base_delay(&self, failures: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed { delay } => delay,
            BackoffStrategy::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
                let factor = multiplier.max(1.0).powi(exponent);
                let secs = initial.as_secs_f64() * factor;
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs).min(max)
                }
            }
        }
    }

    /// Apply jitter to `delay` using `sample`, a value in `0.0..1.0`.
    pub fn jittered(&self, delay: Duration, sample: f64) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let reduction = self.jitter * sample.clamp(0.0, 1.0);
        delay.mul_f64(1.0 - reduction)
    }
}

/// Per-supervisor retry bookkeeping.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    /// Start with no failures recorded.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Number of consecutive failed attempts.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record an attempt that reached the connected state.
    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Record an attempt that never connected.
    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// Check whether the retry cap has been reached.
    pub fn exhausted(&self) -> bool {
        self.policy
            .max_retries
            .is_some_and(|max| self.failures >= max)
    }

    /// Idle delay to wait before the next attempt.
    pub fn next_delay(&self) -> Duration {
        let delay = self.policy.base_delay(self.failures);
        if self.policy.jitter > 0.0 {
            self.policy.jittered(delay, random_unit())
        } else {
            delay
        }
    }
}

/// Uniform sample in `0.0..1.0`.
fn random_unit() -> f64 {
    rand::thread_rng().gen_range(0.0..1.0)
}

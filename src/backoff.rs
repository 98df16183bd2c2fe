//! Retry backoff policies.
//!
//! A backoff policy is a pure function from the current consecutive-failure count
//! (1-based) to the delay before the next attempt. The connection state machine
//! never computes delays itself; it asks the injected [`BackoffPolicy`] and clamps
//! the answer with [`effective_delay`] so a delay is never zero.
//!
//! Any `Fn(u32) -> Duration` is a policy, which keeps tests and one-off hosts simple:
//!
//! ```
//! use std::time::Duration;
//! use aquarium_stream::backoff::{effective_delay, BackoffPolicy};
//!
//! let linear = |n: u32| Duration::from_millis(250 * u64::from(n));
//! assert_eq!(linear.delay(2), Duration::from_millis(500));
//! assert_eq!(effective_delay(&|_n: u32| Duration::ZERO, 1), Duration::from_millis(10));
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lower bound applied to every retry delay.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Maps a consecutive-failure count to the delay before the next retry.
pub trait BackoffPolicy: Send + Sync {
    /// Delay before the retry that follows the `failure_count`-th consecutive failure.
    fn delay(&self, failure_count: u32) -> Duration;
}

impl<F> BackoffPolicy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, failure_count: u32) -> Duration {
        self(failure_count)
    }
}

/// Delay from `policy`, clamped to at least [`MIN_RETRY_DELAY`].
pub fn effective_delay(policy: &dyn BackoffPolicy, failure_count: u32) -> Duration {
    policy.delay(failure_count).max(MIN_RETRY_DELAY)
}

/// Built-in backoff curves, selectable from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `initial * multiplier^(n-1)`, capped at `max`, with optional jitter.
    Exponential {
        /// Delay after the first failure, in milliseconds.
        initial_ms: u64,
        /// Upper bound, in milliseconds.
        max_ms: u64,
        /// Growth factor per failure (e.g. 2.0 for doubling).
        multiplier: f64,
        /// Add up to 25% random jitter below the cap.
        #[serde(default)]
        jitter: bool,
    },
    /// `step * n`, capped at `max`.
    FixedStep {
        /// Increment per failure, in milliseconds.
        step_ms: u64,
        /// Upper bound, in milliseconds.
        max_ms: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 1_000,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl Backoff {
    /// Check the curve parameters.
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            Self::Exponential {
                initial_ms,
                max_ms,
                multiplier,
                ..
            } => {
                if initial_ms == 0 {
                    return Err("backoff initial_ms must be greater than 0".into());
                }
                if max_ms < initial_ms {
                    return Err(format!(
                        "backoff max_ms ({max_ms}) must be >= initial_ms ({initial_ms})"
                    ));
                }
                if !multiplier.is_finite() || multiplier < 1.0 {
                    return Err(format!("backoff multiplier {multiplier} must be >= 1.0"));
                }
            }
            Self::FixedStep { step_ms, max_ms } => {
                if step_ms == 0 {
                    return Err("backoff step_ms must be greater than 0".into());
                }
                if max_ms < step_ms {
                    return Err(format!(
                        "backoff max_ms ({max_ms}) must be >= step_ms ({step_ms})"
                    ));
                }
            }
        }
        Ok(())
    }
}

impl BackoffPolicy for Backoff {
    fn delay(&self, failure_count: u32) -> Duration {
        let n = failure_count.max(1);
        match *self {
            Self::Exponential {
                initial_ms,
                max_ms,
                multiplier,
                jitter,
            } => {
                let exponent = i32::try_from(n - 1).unwrap_or(i32::MAX);
                let base = initial_ms as f64 * multiplier.powi(exponent);
                let capped = base.min(max_ms as f64);
                let with_jitter = if jitter {
                    let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
                    (capped * factor).min(max_ms as f64)
                } else {
                    capped
                };
                Duration::from_micros((with_jitter * 1_000.0).round() as u64)
            }
            Self::FixedStep { step_ms, max_ms } => {
                Duration::from_millis(step_ms.saturating_mul(u64::from(n)).min(max_ms))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            initial_ms: 1_000,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(5), Duration::from_secs(16));
        assert_eq!(backoff.delay(6), Duration::from_secs(30)); // Capped
        assert_eq!(backoff.delay(60), Duration::from_secs(30)); // Still capped
    }

    #[test]
    fn fixed_step_grows_linearly_and_caps() {
        let backoff = Backoff::FixedStep {
            step_ms: 500,
            max_ms: 2_000,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(3), Duration::from_millis(1_500));
        assert_eq!(backoff.delay(9), Duration::from_millis(2_000));
    }

    #[test]
    fn delays_are_monotone_and_positive() {
        for backoff in [
            Backoff::default(),
            Backoff::FixedStep {
                step_ms: 100,
                max_ms: 1_000,
            },
        ] {
            let mut previous = Duration::ZERO;
            for n in 0..40 {
                let d = effective_delay(&backoff, n);
                assert!(d >= MIN_RETRY_DELAY);
                assert!(d >= previous, "delay shrank at failure {n}");
                previous = d;
            }
        }
    }

    #[test]
    fn jitter_stays_under_cap() {
        let backoff = Backoff::Exponential {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter: true,
        };
        for n in 1..20 {
            let d = backoff.delay(n);
            assert!(d <= Duration::from_millis(1_000));
            assert!(d >= Duration::from_millis(100));
        }
    }

    #[test]
    fn closure_policy_is_clamped() {
        let zero = |_n: u32| Duration::ZERO;
        assert_eq!(effective_delay(&zero, 1), MIN_RETRY_DELAY);
    }

    #[test]
    fn validate_rejects_degenerate_curves() {
        assert!(Backoff::default().validate().is_ok());
        assert!(Backoff::FixedStep {
            step_ms: 0,
            max_ms: 10
        }
        .validate()
        .is_err());
        assert!(Backoff::Exponential {
            initial_ms: 500,
            max_ms: 100,
            multiplier: 2.0,
            jitter: false
        }
        .validate()
        .is_err());
        assert!(Backoff::Exponential {
            initial_ms: 500,
            max_ms: 1_000,
            multiplier: 0.5,
            jitter: false
        }
        .validate()
        .is_err());
    }

    #[test]
    fn deserializes_from_tagged_toml() {
        use figment::providers::{Format, Toml};

        let backoff: Backoff = figment::Figment::new()
            .merge(Toml::string(
                "kind = \"fixed_step\"\nstep_ms = 250\nmax_ms = 1000\n",
            ))
            .extract()
            .unwrap();
        assert_eq!(
            backoff,
            Backoff::FixedStep {
                step_ms: 250,
                max_ms: 1_000
            }
        );
    }
}

//! Retry policy: exponential backoff with full jitter and per-stage budgets.
//!
//! Retryable failures (see [`ErrorClass::is_retryable`]) reschedule the work
//! item with a delay sampled uniformly from `[0, ceiling]`, where the ceiling
//! grows exponentially with the attempt number and is capped at
//! `max_delay`. An upstream `Retry-After` hint raises the effective delay,
//! bounded by [`RetryPolicy::retry_after_cap`]. Delays are recomputed per
//! attempt.
//!
//! The attempt budget is **per stage**: exhausting the `llm` budget does not
//! consume the `fetch` budget, and work completed in an earlier stage is
//! preserved.
//!
//! [`ErrorClass::is_retryable`]: crate::error::ErrorClass::is_retryable

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised when parsing an unknown stage label.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown pipeline stage: {value}")]
pub struct UnknownStage {
    /// The label that failed to parse.
    pub value: String,
}

/// Pipeline stage of a work item.
///
/// Stages execute in order `fetch → llm → notify` within one job. Each stage
/// carries its own attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Expand the changelist into changed files and diffs.
    Fetch,
    /// Submit the diff to the review model.
    Llm,
    /// Deliver outbox notifications to recipients.
    Notify,
}

impl Stage {
    /// Returns the persisted label for this stage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Llm => "llm",
            Self::Notify => "notify",
        }
    }

    /// Parses a persisted label back into a stage.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownStage`] for labels outside the pipeline.
    pub fn parse(value: &str) -> Result<Self, UnknownStage> {
        match value {
            "fetch" => Ok(Self::Fetch),
            "llm" => Ok(Self::Llm),
            "notify" => Ok(Self::Notify),
            other => Err(UnknownStage {
                value: other.to_string(),
            }),
        }
    }

    /// The stage that follows this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Fetch => Some(Self::Llm),
            Self::Llm => Some(Self::Notify),
            Self::Notify => None,
        }
    }

    /// All stages in execution order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Fetch, Self::Llm, Self::Notify]
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Ceiling for the first attempt's delay.
    #[serde(default = "default_initial_delay")]
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound on the ceiling regardless of attempt number.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Ceiling multiplier per attempt (default: 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

const fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

impl BackoffConfig {
    /// Deterministic ceiling for a given attempt number (1-based):
    /// `min(max_delay, initial_delay * multiplier^(attempt-1))`.
    #[must_use]
    pub fn ceiling_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        #[allow(clippy::cast_possible_wrap)] // bounded to 63 above
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
        if !raw.is_finite() {
            return self.max_delay;
        }
        Duration::from_secs_f64(raw.max(0.0)).min(self.max_delay)
    }
}

/// Retry policy: backoff plus the per-stage attempt budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff configuration for retryable classes.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Attempts allowed per stage, inclusive of the first attempt.
    #[serde(default = "default_max_attempts_per_stage")]
    pub max_attempts_per_stage: u32,

    /// Hard cap on the effective delay when honoring `Retry-After`.
    #[serde(default = "default_retry_after_cap")]
    #[serde(with = "humantime_serde")]
    pub retry_after_cap: Duration,
}

const fn default_max_attempts_per_stage() -> u32 {
    5
}

const fn default_retry_after_cap() -> Duration {
    Duration::from_secs(300)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_attempts_per_stage: default_max_attempts_per_stage(),
            retry_after_cap: default_retry_after_cap(),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts_so_far` attempts
    /// of one stage have already run.
    #[must_use]
    pub const fn has_budget(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts_per_stage
    }

    /// Samples the delay before the next attempt with full jitter:
    /// `rand(0, ceiling)`, raised to any `Retry-After` hint and capped at
    /// [`retry_after_cap`](Self::retry_after_cap).
    ///
    /// `attempt` is the 1-based number of the attempt that just failed.
    #[must_use]
    pub fn next_delay<R: rand::Rng>(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        let ceiling = self.backoff.ceiling_for_attempt(attempt);
        let jittered = if ceiling.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX)))
        };
        match retry_after {
            Some(hint) => jittered.max(hint).min(self.retry_after_cap),
            None => jittered,
        }
    }

    /// [`next_delay`](Self::next_delay) with the thread-local RNG.
    #[must_use]
    pub fn sample_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        self.next_delay(attempt, retry_after, &mut rand::thread_rng())
    }
}



mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

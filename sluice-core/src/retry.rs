// Copyright 2025 Sluice Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Retry policy and explicit retry state.
//!
//! Publishing retries are modelled as a small state machine instead of nested
//! callbacks. A [`RetryState`] is threaded through the publish loop; each
//! failure is fed to [`RetryState::on_failure`], which returns a
//! [`RetryDecision`]: wait and retry, or give up. The transition function is
//! pure (the jitter sample is an argument), so backoff growth, jitter bounds
//! and exhaustion are testable without timers.
//!
//! Backoff is exponential, `initial * 2^(attempt-1)` capped at `max`, with
//! jitter of `±(base * jitter / 2)` so that partitions throttled at the same
//! moment do not retry in lockstep.

use crate::pipeline::ConfigError;
use crate::publisher::PublishError;
use std::time::Duration;

/// Bounded exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Delay after the first failure.
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    pub max_backoff: Duration,

    /// Jitter factor in `[0.0, 1.0]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `max_attempts` is zero,
    /// `initial_backoff` is zero or exceeds `max_backoff`, or `jitter` is
    /// outside `[0.0, 1.0]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }

        if self.initial_backoff.is_zero() {
            return Err(ConfigError::invalid("initial_backoff", "must be greater than 0"));
        }

        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::invalid(
                "initial_backoff",
                format!(
                    "({:?}) must be <= max_backoff ({:?})",
                    self.initial_backoff, self.max_backoff
                ),
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid(
                "backoff_jitter",
                format!("({}) must be between 0.0 and 1.0", self.jitter),
            ));
        }

        Ok(())
    }

    /// Backoff after the `attempt`-th failure (1-based).
    ///
    /// `jitter_sample` is a uniform sample from `[0.0, 1.0)`; it is mapped to
    /// an offset in `[-base * jitter / 2, +base * jitter / 2)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let initial_ms = u64::try_from(self.initial_backoff.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_backoff.as_millis()).unwrap_or(u64::MAX);

        let factor = 2_u64
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let base_ms = initial_ms.saturating_mul(factor).min(max_ms);

        if self.jitter > 0.0 {
            let jitter_range = (base_ms as f64) * self.jitter;
            let offset = (jitter_sample.clamp(0.0, 1.0) * jitter_range) - (jitter_range / 2.0);
            let final_ms = ((base_ms as f64) + offset).max(0.0) as u64;
            Duration::from_millis(final_ms)
        } else {
            Duration::from_millis(base_ms)
        }
    }
}

/// Outcome of feeding a failure into a [`RetryState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then try again.
    Retry {
        /// How long to wait
        delay: Duration,
    },
    /// Stop retrying; `attempts` were made in total.
    GiveUp {
        /// Attempts made, including the first
        attempts: u32,
    },
}

/// Attempt counter and next delay for one record.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
    next_delay: Option<Duration>,
}

impl RetryState {
    /// Creates a fresh state with no attempts made.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            next_delay: None,
        }
    }

    /// Marks the start of an attempt and returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.next_delay = None;
        self.attempt
    }

    /// Attempts made so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay chosen by the last [`RetryDecision::Retry`], if any.
    #[must_use]
    pub const fn next_delay(&self) -> Option<Duration> {
        self.next_delay
    }

    /// Transition after a failed attempt.
    ///
    /// Terminal failures give up immediately. Retryable failures retry until
    /// `max_attempts` attempts have been made. A destination `retry_after`
    /// hint lengthens the delay, bounded by `max_backoff`.
    pub fn on_failure(
        &mut self,
        retryable: bool,
        retry_after: Option<Duration>,
        jitter_sample: f64,
    ) -> RetryDecision {
        if !retryable || self.attempt >= self.policy.max_attempts {
            self.next_delay = None;
            return RetryDecision::GiveUp {
                attempts: self.attempt,
            };
        }

        let mut delay = self.policy.backoff(self.attempt, jitter_sample);
        if let Some(hint) = retry_after {
            delay = delay.max(hint.min(self.policy.max_backoff));
        }

        self.next_delay = Some(delay);
        RetryDecision::Retry { delay }
    }

    /// [`RetryState::on_failure`] for a publish error, with a random jitter
    /// sample.
    pub fn on_publish_error(&mut self, err: &PublishError) -> RetryDecision {
        self.on_failure(err.is_retryable(), err.retry_after(), rand::random::<f64>())
    }
}

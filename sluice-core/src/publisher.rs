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

//! Event Publisher trait and error types.
//!
//! The [`Publisher`] trait is the seam between the pipeline and the downstream
//! event bus. The pipeline hands it one [`PublishedEvent`] at a time and waits
//! for an [`Ack`] before treating the record as delivered.
//!
//! # Failure classification
//!
//! Every failure is a [`PublishError`] that says whether retrying can help:
//!
//! | Variant | Retryable |
//! |---|---|
//! | [`PublishError::Throttled`] | yes, honouring `retry_after` when given |
//! | [`PublishError::Unavailable`] | yes |
//! | [`PublishError::Timeout`] | yes, the outcome is unknown so the event is resent |
//! | [`PublishError::Rejected`] | no |
//! | [`PublishError::Unauthorized`] | no |
//! | [`PublishError::InvalidDestination`] | no |
//! | [`PublishError::Serialization`] | no |
//! | [`PublishError::Other`] | per instance |
//!
//! Publishing is at-least-once. A timed-out publish may have been delivered,
//! and the retry resends an identical event. Downstream consumers dedup on
//! [`PublishedEvent::dedup_key`].
//!
//! # Implementing a Publisher
//!
//! ```rust
//! use sluice_core::event::PublishedEvent;
//! use sluice_core::publisher::{Ack, PublishError, Publisher};
//! use async_trait::async_trait;
//!
//! /// Writes events to stdout as JSON lines.
//! struct StdoutPublisher;
//!
//! #[async_trait]
//! impl Publisher for StdoutPublisher {
//!     async fn publish(&self, event: &PublishedEvent) -> Result<Ack, PublishError> {
//!         let bytes = event
//!             .to_wire_bytes()
//!             .map_err(|e| PublishError::serialization(e, "failed to encode event"))?;
//!         println!("{}", String::from_utf8_lossy(&bytes));
//!         Ok(Ack::new())
//!     }
//! }
//! ```
//!
//! `publish` takes `&self`: one publisher instance is shared by every
//! partition worker and must tolerate concurrent calls.

use crate::event::PublishedEvent;
use crate::record::SequenceNumber;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when publishing an event.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The destination asked the caller to slow down.
    #[error("Throttled: {message}")]
    Throttled {
        /// Human-readable error message
        message: String,
        /// Suggested wait time before retry
        retry_after: Option<Duration>,
    },

    /// The destination is temporarily unreachable or failing.
    #[error("Destination unavailable: {message}")]
    Unavailable {
        /// Human-readable error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No confirmation arrived within the deadline.
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    /// The destination permanently refused the event.
    #[error("Rejected: {message}")]
    Rejected {
        /// Human-readable error message
        message: String,
        /// Protocol status code, if any
        status: Option<u16>,
    },

    /// Credentials were missing or refused.
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Human-readable error message
        message: String,
    },

    /// The configured destination does not exist or is malformed.
    #[error("Invalid destination: {message}")]
    InvalidDestination {
        /// Human-readable error message
        message: String,
    },

    /// The event could not be encoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Human-readable error message
        message: String,
        /// The underlying serialization error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Anything else.
    #[error("Publish error: {message}")]
    Other {
        /// Human-readable error message
        message: String,
        /// Whether this error is retryable
        retryable: bool,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl PublishError {
    /// Creates a throttling error.
    #[must_use]
    pub fn throttled(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Throttled {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates an unavailability error from any error type.
    #[must_use]
    pub fn unavailable(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Unavailable {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an unavailability error with a custom message.
    #[must_use]
    pub fn unavailable_msg(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a permanent rejection.
    #[must_use]
    pub fn rejected(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Rejected {
            message: message.into(),
            status,
        }
    }

    /// Creates an authorization failure.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Creates an invalid-destination error.
    #[must_use]
    pub fn invalid_destination(message: impl Into<String>) -> Self {
        Self::InvalidDestination {
            message: message.into(),
        }
    }

    /// Creates a serialization error from any error type.
    #[must_use]
    pub fn serialization(
        source: impl std::error::Error + Send + Sync + 'static,
        message: impl Into<String>,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a generic error.
    #[must_use]
    pub fn other(message: impl Into<String>, retryable: bool) -> Self {
        Self::Other {
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Returns whether retrying the same event may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Throttled { .. } | Self::Unavailable { .. } | Self::Timeout(_) => true,
            Self::Rejected { .. }
            | Self::Unauthorized { .. }
            | Self::InvalidDestination { .. }
            | Self::Serialization { .. } => false,
            Self::Other { retryable, .. } => *retryable,
        }
    }

    /// Returns the destination's suggested wait time before retry, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short label used for logs and metric labels.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Throttled { .. } => "throttled",
            Self::Unavailable { .. } => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::Rejected { .. } => "rejected",
            Self::Unauthorized { .. } => "unauthorized",
            Self::InvalidDestination { .. } => "invalid_destination",
            Self::Serialization { .. } => "serialization",
            Self::Other { .. } => "other",
        }
    }
}

/// Confirmation that the destination durably received an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    /// Destination-assigned message id, if the destination returns one.
    pub message_id: Option<String>,
}

impl Ack {
    /// Creates an acknowledgement without a message id.
    #[must_use]
    pub const fn new() -> Self {
        Self { message_id: None }
    }

    /// Sets the destination-assigned message id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// Metadata about a publisher's capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherMetadata {
    /// Human-readable publisher name (e.g., "HTTP", "Mock")
    pub name: String,

    /// Publisher type identifier (e.g., "http", "mock")
    pub publisher_type: String,

    /// Whether the destination deduplicates on an idempotency key
    pub supports_idempotency_key: bool,

    /// Largest accepted payload, if known
    pub max_event_bytes: Option<usize>,

    /// Additional publisher-specific metadata
    pub properties: HashMap<String, String>,
}

impl PublisherMetadata {
    /// Creates new metadata with required fields.
    #[must_use]
    pub fn new(name: impl Into<String>, publisher_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            publisher_type: publisher_type.into(),
            supports_idempotency_key: false,
            max_event_bytes: None,
            properties: HashMap::new(),
        }
    }

    /// Sets idempotency-key support.
    #[must_use]
    pub const fn with_idempotency_key(mut self, supports: bool) -> Self {
        self.supports_idempotency_key = supports;
        self
    }

    /// Sets the payload ceiling.
    #[must_use]
    pub const fn with_max_event_bytes(mut self, bytes: usize) -> Self {
        self.max_event_bytes = Some(bytes);
        self
    }

    /// Adds a custom property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Delivers sanitized events to the destination bus.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes one event and waits for the destination's confirmation.
    ///
    /// # Errors
    ///
    /// Returns a [`PublishError`] classified as retryable or terminal.
    async fn publish(&self, event: &PublishedEvent) -> Result<Ack, PublishError>;

    /// Releases connections and other resources. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if resources cannot be released cleanly.
    async fn close(&self) -> Result<(), PublishError> {
        Ok(())
    }

    /// Returns metadata about this publisher's capabilities.
    fn metadata(&self) -> PublisherMetadata {
        PublisherMetadata::new("Unknown", "unknown")
    }
}

/// A scripted response for [`MockPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// Acknowledge the event.
    Ack,
    /// Fail with [`PublishError::Throttled`].
    Throttled(Option<Duration>),
    /// Fail with [`PublishError::Unavailable`].
    Unavailable,
    /// Fail with [`PublishError::Rejected`].
    Rejected,
    /// Fail with [`PublishError::Unauthorized`].
    Unauthorized,
    /// Sleep, then acknowledge. Used to trip publish timeouts.
    Delay(Duration),
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<MockResponse>,
    per_sequence: HashMap<SequenceNumber, VecDeque<MockResponse>>,
    fallback: Option<MockResponse>,
    attempts: Vec<PublishedEvent>,
    published: Vec<PublishedEvent>,
    close_count: usize,
}

/// A mock publisher for testing.
///
/// Responses are taken, in order, from the per-sequence script for the
/// event's sequence number, then from the global script, then from the
/// fallback response (default [`MockResponse::Ack`]). Every attempt and every
/// acknowledged event is recorded.
///
/// Clones share state, so a test can keep a handle after moving one into a
/// pipeline.
///
/// # Examples
///
/// ```rust
/// use sluice_core::publisher::{MockPublisher, MockResponse, Publisher};
/// use sluice_core::event::PublishedEvent;
///
/// # async fn example() {
/// let publisher = MockPublisher::new()
///     .with_responses([MockResponse::Throttled(None), MockResponse::Ack]);
///
/// let event = PublishedEvent::health_probe("probe-1", chrono::Utc::now());
/// assert!(publisher.publish(&event).await.is_err());
/// assert!(publisher.publish(&event).await.is_ok());
/// assert_eq!(publisher.attempt_count(), 2);
/// assert_eq!(publisher.published_count(), 1);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockPublisher {
    state: Arc<Mutex<MockState>>,
}

impl MockPublisher {
    /// Creates a mock that acknowledges everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends responses to the global script.
    #[must_use]
    pub fn with_responses(self, responses: impl IntoIterator<Item = MockResponse>) -> Self {
        self.lock().script.extend(responses);
        self
    }

    /// Appends responses used only for events with the given sequence number.
    #[must_use]
    pub fn with_responses_for(
        self,
        sequence: impl Into<SequenceNumber>,
        responses: impl IntoIterator<Item = MockResponse>,
    ) -> Self {
        self.lock()
            .per_sequence
            .entry(sequence.into())
            .or_default()
            .extend(responses);
        self
    }

    /// Sets the response used once all scripts are exhausted.
    #[must_use]
    pub fn with_fallback(self, response: MockResponse) -> Self {
        self.lock().fallback = Some(response);
        self
    }

    /// Returns every event passed to `publish`, including failed attempts.
    #[must_use]
    pub fn attempts(&self) -> Vec<PublishedEvent> {
        self.lock().attempts.clone()
    }

    /// Returns every acknowledged event.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedEvent> {
        self.lock().published.clone()
    }

    /// Number of `publish` calls.
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.lock().attempts.len()
    }

    /// Number of acknowledged events.
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.lock().published.len()
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    /// Clears recorded events and counters. Scripts are kept.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.attempts.clear();
        state.published.clear();
        state.close_count = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_response(&self, event: &PublishedEvent) -> MockResponse {
        let mut state = self.lock();
        state.attempts.push(event.clone());

        let scripted = state
            .per_sequence
            .get_mut(&event.sequence_number)
            .and_then(VecDeque::pop_front);

        scripted
            .or_else(|| state.script.pop_front())
            .or_else(|| state.fallback.clone())
            .unwrap_or(MockResponse::Ack)
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, event: &PublishedEvent) -> Result<Ack, PublishError> {
        match self.next_response(event) {
            MockResponse::Ack => {}
            MockResponse::Delay(delay) => tokio::time::sleep(delay).await,
            MockResponse::Throttled(retry_after) => {
                return Err(PublishError::throttled("Simulated throttling", retry_after))
            }
            MockResponse::Unavailable => {
                return Err(PublishError::unavailable_msg("Simulated outage"))
            }
            MockResponse::Rejected => {
                return Err(PublishError::rejected("Simulated rejection", Some(400)))
            }
            MockResponse::Unauthorized => {
                return Err(PublishError::unauthorized("Simulated auth failure"))
            }
        }

        self.lock().published.push(event.clone());
        Ok(Ack::new())
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.lock().close_count += 1;
        Ok(())
    }

    fn metadata(&self) -> PublisherMetadata {
        PublisherMetadata::new("MockPublisher", "mock")
    }
}

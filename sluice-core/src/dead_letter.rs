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

//! Dead-Letter Handler
//!
//! Records that cannot be published end here: parse failures, tables without
//! a rule, deterministic transformation failures, and publishes that were
//! rejected or exhausted their retries. A dead-lettered record has reached a
//! terminal outcome, so the partition checkpoint still advances past it.
//!
//! Persistence sits behind the [`DeadLetterStore`] trait. The
//! [`DeadLetterHandler`] wraps a store, builds the [`DeadLetterEntry`],
//! bounds the write with a timeout, logs the capture and counts it per
//! [`ErrorCode`]. If the entry cannot be persisted the record has *not*
//! reached a terminal outcome and the caller must not checkpoint past it.
//!
//! Entries serialize as:
//!
//! ```json
//! {
//!   "partitionId": "shard-0",
//!   "sequenceNumber": "42",
//!   "originalEvent": { "table": "users", "...": "..." },
//!   "error": { "code": "TRANSFORMATION_ERROR", "message": "..." },
//!   "attempts": 3,
//!   "lastAttempt": "2024-01-15T10:35:00Z"
//! }
//! ```
//!
//! Replaying entries is an operator action and is not automated.

use crate::metrics;
use crate::record::{ChangeRecord, PartitionId, RawRecord, SequenceNumber};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Default bound on a single dead-letter write.
pub const DEFAULT_DEAD_LETTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Classification of a dead-lettered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The raw payload could not be decoded.
    ParseError,
    /// The record is well-formed but not acceptable, e.g. unknown table.
    ValidationError,
    /// The rule could not be applied.
    TransformationError,
    /// The event bus rejected the event or retries ran out.
    PublishError,
}

impl ErrorCode {
    /// All codes, in a fixed order.
    pub const ALL: [Self; 4] = [
        Self::ParseError,
        Self::ValidationError,
        Self::TransformationError,
        Self::PublishError,
    ];

    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::TransformationError => "TRANSFORMATION_ERROR",
            Self::PublishError => "PUBLISH_ERROR",
        }
    }

    /// Returns true for codes that indicate a deployment problem needing
    /// immediate attention.
    #[must_use]
    pub const fn is_alertable(&self) -> bool {
        matches!(self, Self::ValidationError)
    }

    const fn index(self) -> usize {
        match self {
            Self::ParseError => 0,
            Self::ValidationError => 1,
            Self::TransformationError => 2,
            Self::PublishError => 3,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure stored with an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Error classification
    pub code: ErrorCode,
    /// Human-readable description
    pub message: String,
}

/// A record that reached the dead-letter terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    /// Partition the record was read from.
    pub partition_id: PartitionId,

    /// Stream position of the record.
    pub sequence_number: SequenceNumber,

    /// The validated record, or the raw payload if it never parsed.
    pub original_event: serde_json::Value,

    /// Why the record was dead-lettered.
    pub error: FailureInfo,

    /// Processing attempts made. Parse and validation failures count one.
    pub attempts: u32,

    /// When the last attempt finished.
    pub last_attempt: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Returns the error code.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        self.error.code
    }

    /// Serializes the entry as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the original event cannot be represented as JSON.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, DeadLetterError> {
        serde_json::to_vec(self).map_err(|e| DeadLetterError::Serialization(e.to_string()))
    }
}

/// The record handed to [`DeadLetterHandler::capture`].
#[derive(Debug, Clone, Copy)]
pub enum OriginalRecord<'a> {
    /// A record that failed before or during parsing.
    Raw(&'a RawRecord),
    /// A record that parsed successfully.
    Parsed(&'a ChangeRecord),
}

impl OriginalRecord<'_> {
    /// Stream position of the record.
    #[must_use]
    pub fn sequence(&self) -> SequenceNumber {
        match self {
            Self::Raw(raw) => raw.sequence,
            Self::Parsed(record) => record.sequence_number,
        }
    }

    fn to_value(self) -> Result<serde_json::Value, DeadLetterError> {
        match self {
            Self::Raw(raw) => Ok(raw.payload_value()),
            Self::Parsed(record) => serde_json::to_value(record)
                .map_err(|e| DeadLetterError::Serialization(e.to_string())),
        }
    }
}

/// Errors that can occur during dead-letter store operations.
#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// The backend refused or failed the write
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The write did not complete within its deadline
    #[error("dead-letter write timed out after {0:?}")]
    Timeout(Duration),

    /// Other errors
    #[error("Dead-letter store error: {0}")]
    Other(String),
}

/// Trait for dead-letter storage backends.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Durably stores one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be persisted.
    async fn store(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError>;

    /// Lists stored entries, optionally only those of one partition, oldest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    async fn list(
        &self,
        partition: Option<&PartitionId>,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError>;

    /// Closes the store, releasing any resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be closed cleanly.
    async fn close(&self) -> Result<(), DeadLetterError> {
        Ok(())
    }
}

/// Dead-letter counts per error code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadLetterCounts {
    /// PARSE_ERROR entries
    pub parse_error: u64,
    /// VALIDATION_ERROR entries
    pub validation_error: u64,
    /// TRANSFORMATION_ERROR entries
    pub transformation_error: u64,
    /// PUBLISH_ERROR entries
    pub publish_error: u64,
}

impl DeadLetterCounts {
    /// Count for one code.
    #[must_use]
    pub const fn get(&self, code: ErrorCode) -> u64 {
        match code {
            ErrorCode::ParseError => self.parse_error,
            ErrorCode::ValidationError => self.validation_error,
            ErrorCode::TransformationError => self.transformation_error,
            ErrorCode::PublishError => self.publish_error,
        }
    }

    /// Sum over all codes.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.parse_error + self.validation_error + self.transformation_error + self.publish_error
    }
}

/// Builds, persists and counts dead-letter entries.
pub struct DeadLetterHandler<D: DeadLetterStore> {
    store: Arc<D>,
    timeout: Duration,
    counts: [AtomicU64; 4],
}

impl<D: DeadLetterStore> DeadLetterHandler<D> {
    /// Creates a handler over `store` with the default write timeout.
    pub fn new(store: Arc<D>) -> Self {
        Self {
            store,
            timeout: DEFAULT_DEAD_LETTER_TIMEOUT,
            counts: Default::default(),
        }
    }

    /// Overrides the write timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<D> {
        &self.store
    }

    /// Persists a dead-letter entry for `record`.
    ///
    /// On success the per-code counters are incremented and the capture is
    /// logged, at `error` level for alertable codes.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be serialized or persisted
    /// within the timeout. The record must then be treated as unresolved.
    pub async fn capture(
        &self,
        partition: &PartitionId,
        record: OriginalRecord<'_>,
        code: ErrorCode,
        message: impl Into<String>,
        attempts: u32,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        let entry = DeadLetterEntry {
            partition_id: partition.clone(),
            sequence_number: record.sequence(),
            original_event: record.to_value()?,
            error: FailureInfo {
                code,
                message: message.into(),
            },
            attempts,
            last_attempt: Utc::now(),
        };

        tokio::time::timeout(self.timeout, self.store.store(&entry))
            .await
            .map_err(|_| DeadLetterError::Timeout(self.timeout))??;

        self.counts[code.index()].fetch_add(1, Ordering::Relaxed);
        metrics::increment_dead_letters(code);

        if code.is_alertable() {
            error!(
                partition = %partition,
                sequence = %entry.sequence_number,
                error_code = %code,
                attempts,
                message = %entry.error.message,
                "Record dead-lettered"
            );
        } else {
            warn!(
                partition = %partition,
                sequence = %entry.sequence_number,
                error_code = %code,
                attempts,
                message = %entry.error.message,
                "Record dead-lettered"
            );
        }

        Ok(entry)
    }

    /// Snapshot of dead-letter counts captured by this handler.
    #[must_use]
    pub fn counts(&self) -> DeadLetterCounts {
        let load = |code: ErrorCode| self.counts[code.index()].load(Ordering::Relaxed);
        DeadLetterCounts {
            parse_error: load(ErrorCode::ParseError),
            validation_error: load(ErrorCode::ValidationError),
            transformation_error: load(ErrorCode::TransformationError),
            publish_error: load(ErrorCode::PublishError),
        }
    }
}

impl<D: DeadLetterStore> fmt::Debug for DeadLetterHandler<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterHandler")
            .field("timeout", &self.timeout)
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

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

//! Metrics instrumentation for pipeline observability.
//!
//! Metrics go through the `metrics` facade, so any exporter (Prometheus,
//! StatsD, ...) can be installed by the application. Without an installed
//! recorder every call is a no-op.
//!
//! # Naming Conventions
//!
//! - Prefix `sluice_`
//! - Counters end with `_total`
//! - Durations end with `_seconds`
//!
//! # Labels
//!
//! - **table**: source table name (low cardinality)
//! - **operation**: INSERT, UPDATE or DELETE
//! - **error\_code**: dead-letter classification, four values
//! - **error\_type**: publish failure category
//! - **reason**: why a partition worker failed
//!
//! Partition ids, keys and sequence numbers are never used as labels.
//!
//! # Health signal
//!
//! `sluice_dead_letters_total{error_code}` is the primary operational signal.
//! A sustained non-zero rate for any single code warrants investigation, and
//! `sluice_validation_alerts_total{table}` names tables that arrive without a
//! configured rule.
//!
//! # Examples
//!
//! ```rust
//! use sluice_core::dead_letter::ErrorCode;
//! use sluice_core::metrics;
//!
//! metrics::increment_records_received("users");
//! metrics::increment_dead_letters(ErrorCode::ValidationError);
//! metrics::set_active_partitions(4);
//! ```

use crate::dead_letter::ErrorCode;
use crate::rules::RuleRegistry;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric name prefix for all pipeline metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "sluice";

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Records pulled from the input stream.
///
/// Type: Counter
/// Labels: table (`unparsed` when the payload could not be parsed,
/// `unregistered` when no rule exists for it)
#[doc(hidden)]
pub const RECORDS_RECEIVED_TOTAL: &str = "sluice_records_received_total";

/// Events acknowledged by the publisher.
///
/// Type: Counter
/// Labels: table, operation
#[doc(hidden)]
pub const RECORDS_PUBLISHED_TOTAL: &str = "sluice_records_published_total";

/// Records that ended in the dead-letter store.
///
/// Type: Counter
/// Labels: error_code
#[doc(hidden)]
pub const DEAD_LETTERS_TOTAL: &str = "sluice_dead_letters_total";

/// Records whose table has no configured rule.
///
/// Type: Counter
/// Labels: table (always `unregistered` when fed through [`table_label`])
const VALIDATION_ALERTS_TOTAL: &str = "sluice_validation_alerts_total";

/// Publish attempts that were retried.
///
/// Type: Counter
/// Labels: error_type
const PUBLISH_RETRIES_TOTAL: &str = "sluice_publish_retries_total";

/// Duration of a single publish call.
///
/// Type: Histogram
/// Labels: publisher_type
/// Unit: seconds
const PUBLISH_DURATION_SECONDS: &str = "sluice_publish_duration_seconds";

/// Successful checkpoint advances.
///
/// Type: Counter
const CHECKPOINT_ADVANCES_TOTAL: &str = "sluice_checkpoint_advances_total";

/// Advances rejected because the stored checkpoint was already ahead.
///
/// Type: Counter
const CHECKPOINT_CONFLICTS_TOTAL: &str = "sluice_checkpoint_conflicts_total";

/// Partition worker restarts performed by the supervisor.
///
/// Type: Counter
const WORKER_RESTARTS_TOTAL: &str = "sluice_worker_restarts_total";

/// Partition workers that entered the FAILED state.
///
/// Type: Counter
/// Labels: reason
const WORKER_FAILURES_TOTAL: &str = "sluice_worker_failures_total";

/// Records per fetched batch.
///
/// Type: Histogram
/// Unit: records
const BATCH_SIZE: &str = "sluice_batch_size";

/// Time from fetch to checkpoint for one batch.
///
/// Type: Histogram
/// Unit: seconds
#[doc(hidden)]
pub const BATCH_DURATION_SECONDS: &str = "sluice_batch_duration_seconds";

/// Partition workers currently running.
///
/// Type: Gauge
const ACTIVE_PARTITIONS: &str = "sluice_active_partitions";

/// Current pipeline status (0=stopped, 1=running, 2=error).
///
/// Type: Gauge
const PIPELINE_STATUS: &str = "sluice_pipeline_status";

// ============================================================================
// Initialization
// ============================================================================

/// Registers metric descriptions with the installed recorder.
///
/// Call once at startup, after installing an exporter.
pub fn init_metrics() {
    describe_counter!(
        RECORDS_RECEIVED_TOTAL,
        "Total number of change records pulled from the input stream"
    );

    describe_counter!(
        RECORDS_PUBLISHED_TOTAL,
        "Total number of events acknowledged by the event bus"
    );

    describe_counter!(
        DEAD_LETTERS_TOTAL,
        "Total number of records dead-lettered, by error code"
    );

    describe_counter!(
        VALIDATION_ALERTS_TOTAL,
        "Total number of records for tables without a transform rule"
    );

    describe_counter!(
        PUBLISH_RETRIES_TOTAL,
        "Total number of publish retries, by failure category"
    );

    describe_counter!(
        CHECKPOINT_ADVANCES_TOTAL,
        "Total number of successful checkpoint advances"
    );

    describe_counter!(
        CHECKPOINT_CONFLICTS_TOTAL,
        "Total number of checkpoint advances rejected as stale"
    );

    describe_counter!(
        WORKER_RESTARTS_TOTAL,
        "Total number of partition worker restarts"
    );

    describe_counter!(
        WORKER_FAILURES_TOTAL,
        "Total number of partition worker failures, by reason"
    );

    describe_histogram!(
        PUBLISH_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Duration of individual publish calls"
    );

    describe_histogram!(
        BATCH_SIZE,
        metrics::Unit::Count,
        "Number of records per fetched batch"
    );

    describe_histogram!(
        BATCH_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time from batch fetch to checkpoint"
    );

    describe_gauge!(
        ACTIVE_PARTITIONS,
        metrics::Unit::Count,
        "Number of partition workers currently running"
    );

    describe_gauge!(
        PIPELINE_STATUS,
        "Current pipeline status: 0=stopped, 1=running, 2=error"
    );
}

/// `table` label for records whose payload could not be parsed.
pub const UNPARSED_TABLE: &str = "unparsed";

/// `table` label for records naming a table without a rule.
pub const UNREGISTERED_TABLE: &str = "unregistered";

/// Returns the `table` label for a record.
///
/// Table names come from the stream, so only tables with a configured rule
/// are used as label values; anything else shares [`UNREGISTERED_TABLE`].
///
/// # Examples
///
/// ```rust
/// use sluice_core::metrics::{table_label, UNREGISTERED_TABLE};
/// use sluice_core::rules::{RuleRegistry, TransformRule};
///
/// let registry = RuleRegistry::new([("users", TransformRule::new("user.changed"))]).unwrap();
/// assert_eq!(table_label(&registry, "users"), "users");
/// assert_eq!(table_label(&registry, "users_tmp_8812"), UNREGISTERED_TABLE);
/// ```
#[must_use]
pub fn table_label<'a>(registry: &RuleRegistry, table: &'a str) -> &'a str {
    if registry.contains(table) {
        table
    } else {
        UNREGISTERED_TABLE
    }
}

// ============================================================================
// Counter Metrics
// ============================================================================

/// Increments the count of records pulled from the stream.
pub fn increment_records_received(table: &str) {
    counter!(RECORDS_RECEIVED_TOTAL, "table" => table.to_string()).increment(1);
}

/// Increments the count of acknowledged events.
///
/// # Examples
///
/// ```rust
/// use sluice_core::metrics;
///
/// metrics::increment_records_published("users", "UPDATE");
/// ```
pub fn increment_records_published(table: &str, operation: &str) {
    counter!(RECORDS_PUBLISHED_TOTAL, "table" => table.to_string(), "operation" => operation.to_string())
        .increment(1);
}

/// Increments the dead-letter count for `code`.
pub fn increment_dead_letters(code: ErrorCode) {
    counter!(DEAD_LETTERS_TOTAL, "error_code" => code.as_str()).increment(1);
}

/// Increments the missing-rule alert counter for `table`.
pub fn increment_validation_alerts(table: &str) {
    counter!(VALIDATION_ALERTS_TOTAL, "table" => table.to_string()).increment(1);
}

/// Increments the publish retry counter.
///
/// `error_type` should be a fixed category such as
/// [`PublishError::category`](crate::publisher::PublishError::category).
pub fn increment_publish_retries(error_type: &'static str) {
    counter!(PUBLISH_RETRIES_TOTAL, "error_type" => error_type).increment(1);
}

/// Increments the checkpoint advance counter.
pub fn increment_checkpoint_advances() {
    counter!(CHECKPOINT_ADVANCES_TOTAL).increment(1);
}

/// Increments the checkpoint conflict counter.
pub fn increment_checkpoint_conflicts() {
    counter!(CHECKPOINT_CONFLICTS_TOTAL).increment(1);
}

/// Increments the worker restart counter.
pub fn increment_worker_restarts() {
    counter!(WORKER_RESTARTS_TOTAL).increment(1);
}

/// Increments the worker failure counter.
///
/// # Examples
///
/// ```rust
/// use sluice_core::metrics::{self, FailureReason};
///
/// metrics::increment_worker_failures(FailureReason::CheckpointUnavailable);
/// ```
pub fn increment_worker_failures(reason: FailureReason) {
    counter!(WORKER_FAILURES_TOTAL, "reason" => reason.as_str()).increment(1);
}

// ============================================================================
// Histogram Metrics
// ============================================================================

/// Records the duration of one publish call.
pub fn record_publish_duration(duration: Duration, publisher_type: &str) {
    histogram!(PUBLISH_DURATION_SECONDS, "publisher_type" => publisher_type.to_string())
        .record(duration.as_secs_f64());
}

/// Records the size of a fetched batch.
pub fn record_batch_size(size: usize) {
    histogram!(BATCH_SIZE).record(size as f64);
}

/// Records the time from fetch to checkpoint for one batch.
///
/// # Examples
///
/// ```rust
/// use sluice_core::metrics;
/// use std::time::Instant;
///
/// let start = Instant::now();
/// // ... process batch ...
/// metrics::record_batch_duration(start.elapsed());
/// ```
pub fn record_batch_duration(duration: Duration) {
    histogram!(BATCH_DURATION_SECONDS).record(duration.as_secs_f64());
}

// ============================================================================
// Gauge Metrics
// ============================================================================

/// Sets the number of running partition workers.
pub fn set_active_partitions(count: usize) {
    gauge!(ACTIVE_PARTITIONS).set(count as f64);
}

/// Decrements the number of running partition workers.
pub fn decrement_active_partitions() {
    gauge!(ACTIVE_PARTITIONS).decrement(1.0);
}

/// Sets the pipeline status.
///
/// # Examples
///
/// ```rust
/// use sluice_core::metrics::{self, PipelineStatus};
///
/// metrics::set_pipeline_status(PipelineStatus::Running);
/// ```
pub fn set_pipeline_status(status: PipelineStatus) {
    gauge!(PIPELINE_STATUS).set(f64::from(status as u8));
}

/// Pipeline status for the `pipeline_status` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineStatus {
    /// Pipeline is stopped.
    Stopped = 0,
    /// Pipeline is running normally.
    Running = 1,
    /// At least one partition worker gave up.
    Error = 2,
}

/// Reasons a partition worker enters the FAILED state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The checkpoint store failed or timed out.
    CheckpointUnavailable,
    /// A dead-letter entry could not be persisted.
    DeadLetterUnavailable,
    /// The input stream returned a non-retryable error.
    SourceFailed,
    /// The worker task panicked.
    Panicked,
}

impl FailureReason {
    /// Returns the reason as a static string for metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CheckpointUnavailable => "checkpoint_unavailable",
            Self::DeadLetterUnavailable => "dead_letter_unavailable",
            Self::SourceFailed => "source_failed",
            Self::Panicked => "panicked",
        }
    }
}

// ============================================================================
// Metric Helper Utilities
// ============================================================================

/// Records the elapsed time through a callback when dropped.
///
/// # Examples
///
/// ```rust
/// use sluice_core::metrics::Timer;
///
/// {
///     let _timer = Timer::new("http", |duration, publisher_type| {
///         sluice_core::metrics::record_publish_duration(duration, publisher_type);
///     });
///     // ... operation to time ...
/// }
/// ```
pub struct Timer<F>
where
    F: FnOnce(Duration, &str),
{
    start: std::time::Instant,
    label: String,
    record_fn: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(Duration, &str),
{
    /// Creates a new timer that will record the duration when dropped.
    pub fn new(label: impl Into<String>, record_fn: F) -> Self {
        Self {
            start: std::time::Instant::now(),
            label: label.into(),
            record_fn: Some(record_fn),
        }
    }
}

impl<F> Drop for Timer<F>
where
    F: FnOnce(Duration, &str),
{
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        if let Some(record_fn) = self.record_fn.take() {
            record_fn(duration, &self.label);
        }
    }
}

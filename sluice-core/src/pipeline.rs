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

//! Stream Consumer / Orchestrator
//!
//! The [`Pipeline`] pulls batches from a [`ChangeSource`] per partition and
//! drives every record through Parse, Transform and Publish, then advances
//! the partition checkpoint. It owns batching, retry and backoff, timeouts,
//! supervision and graceful shutdown.
//!
//! # Worker state machine
//!
//! Each partition is served by one worker:
//!
//! ```text
//! STARTING -> RESUMING -> POLLING -> PROCESSING -> CHECKPOINTING -> POLLING ...
//!                 |                                     |
//!                 +------------> FAILED <---------------+
//!
//! any state --(shutdown)--> SHUTTING_DOWN -> STOPPED
//! ```
//!
//! A worker fails only when it can no longer record progress safely: the
//! checkpoint store is unreachable or times out, a dead-letter entry cannot be
//! persisted, or the stream returns a non-retryable error. The supervisor
//! restarts a failed worker after `restart_backoff`, up to
//! `max_worker_restarts` times; a restarted worker re-reads its checkpoint.
//!
//! # Record loop
//!
//! Records are processed strictly in sequence order, one at a time. Each one
//! ends in exactly one terminal outcome:
//!
//! - **published**: the publisher acknowledged the event, or
//! - **dead-lettered**: parse failure, unknown table, transformation failure,
//!   rejected publish, or publish retries exhausted.
//!
//! Records at or below the worker's cursor are stream redeliveries and are
//! skipped. With [`CheckpointMode::PerBatch`] (the default) the checkpoint is
//! advanced once per batch to the highest completed sequence; a crash
//! replays at most one batch. [`CheckpointMode::PerRecord`] advances after
//! every record, trading store write volume for a one-record replay window.
//!
//! # Shutdown
//!
//! [`Pipeline::stop`] stops fetching immediately. A worker that is mid-batch
//! finishes its in-flight record (including its publish retries), checkpoints
//! everything completed so far and exits.
//!
//! # Example
//!
//! ```rust,no_run
//! use sluice_core::pipeline::{Pipeline, PipelineConfig};
//! use sluice_core::publisher::MockPublisher;
//! use sluice_core::rules::RuleRegistry;
//! use sluice_core::source::MemoryChangeSource;
//! use std::sync::Arc;
//! use std::time::Duration;
//! # use sluice_core::checkpoint::CheckpointStore;
//! # use sluice_core::dead_letter::DeadLetterStore;
//!
//! # async fn example(
//! #     checkpoints: impl CheckpointStore + 'static,
//! #     dead_letters: impl DeadLetterStore + 'static,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::builder()
//!     .partitions(["shard-0", "shard-1"])
//!     .batch_size(100)
//!     .poll_interval(Duration::from_millis(500))
//!     .max_attempts(3)
//!     .build()?;
//!
//! let registry = Arc::new(RuleRegistry::load("rules.yaml")?);
//!
//! let mut pipeline = Pipeline::new(
//!     config,
//!     registry,
//!     MemoryChangeSource::new(),
//!     checkpoints,
//!     MockPublisher::new(),
//!     dead_letters,
//! );
//!
//! pipeline.start().await?;
//! // ...
//! pipeline.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::dead_letter::{
    DeadLetterCounts, DeadLetterError, DeadLetterHandler, DeadLetterStore, ErrorCode,
    OriginalRecord,
};
use crate::metrics::{self, FailureReason, PipelineStatus, Timer};
use crate::parser;
use crate::publisher::{PublishError, Publisher};
use crate::record::{ChangeRecord, PartitionId, RawRecord, SequenceNumber};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::rules::RuleRegistry;
use crate::source::{ChangeSource, SourceError};
use crate::transform::{Transformer, DEFAULT_MAX_EVENT_BYTES};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required value was not provided.
    #[error("{field} is required")]
    Missing {
        /// Field name
        field: &'static str,
    },

    /// A value is out of range or inconsistent with another.
    #[error("invalid {field}: {message}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// What is wrong with it
        message: String,
    },
}

impl ConfigError {
    /// Builds a [`ConfigError::InvalidValue`].
    #[must_use]
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

/// When the consumer advances partition checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Once per batch, to the batch's highest completed sequence.
    #[default]
    PerBatch,
    /// After every record's terminal outcome.
    PerRecord,
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Partitions to consume (empty = every partition the source reports)
    pub partitions: Vec<PartitionId>,

    /// Maximum number of records fetched per batch
    pub batch_size: usize,

    /// Wait between fetches when a partition is caught up
    pub poll_interval: Duration,

    /// Publish retry policy
    pub retry: RetryPolicy,

    /// Bound on a single stream fetch
    pub fetch_timeout: Duration,

    /// Bound on a single checkpoint read or write
    pub checkpoint_timeout: Duration,

    /// Bound on a single publish call
    pub publish_timeout: Duration,

    /// Bound on a single dead-letter write
    pub dead_letter_timeout: Duration,

    /// Restarts allowed per partition worker before giving up
    pub max_worker_restarts: u32,

    /// Wait before restarting a failed worker
    pub restart_backoff: Duration,

    /// Checkpoint granularity
    pub checkpoint_mode: CheckpointMode,

    /// Largest serialized event accepted by the transformer
    pub max_event_bytes: usize,
}

impl PipelineConfig {
    /// Creates a new builder for `PipelineConfig`.
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }
}

/// Builder for `PipelineConfig`.
///
/// Zero durations and sizes fall back to their defaults.
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    partitions: Vec<PartitionId>,
    batch_size: usize,
    poll_interval: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_jitter: Option<f64>,
    fetch_timeout: Duration,
    checkpoint_timeout: Duration,
    publish_timeout: Duration,
    dead_letter_timeout: Duration,
    max_worker_restarts: Option<u32>,
    restart_backoff: Duration,
    checkpoint_mode: CheckpointMode,
    max_event_bytes: usize,
}

impl PipelineConfigBuilder {
    /// Sets the partitions to consume.
    #[must_use]
    pub fn partitions<I, P>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PartitionId>,
    {
        self.partitions = partitions.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the idle poll interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the total publish attempts per record.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the first retry delay.
    #[must_use]
    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Sets the maximum retry delay.
    #[must_use]
    pub fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Sets the backoff jitter factor (0.0 to 1.0).
    #[must_use]
    pub fn backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = Some(jitter);
        self
    }

    /// Sets the stream fetch timeout.
    #[must_use]
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the checkpoint store timeout.
    #[must_use]
    pub fn checkpoint_timeout(mut self, timeout: Duration) -> Self {
        self.checkpoint_timeout = timeout;
        self
    }

    /// Sets the publish timeout.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Sets the dead-letter write timeout.
    #[must_use]
    pub fn dead_letter_timeout(mut self, timeout: Duration) -> Self {
        self.dead_letter_timeout = timeout;
        self
    }

    /// Sets how many times a failed worker is restarted. Zero disables
    /// restarts.
    #[must_use]
    pub fn max_worker_restarts(mut self, restarts: u32) -> Self {
        self.max_worker_restarts = Some(restarts);
        self
    }

    /// Sets the wait before restarting a failed worker.
    #[must_use]
    pub fn restart_backoff(mut self, delay: Duration) -> Self {
        self.restart_backoff = delay;
        self
    }

    /// Sets the checkpoint granularity.
    #[must_use]
    pub fn checkpoint_mode(mut self, mode: CheckpointMode) -> Self {
        self.checkpoint_mode = mode;
        self
    }

    /// Sets the serialized event size limit.
    #[must_use]
    pub fn max_event_bytes(mut self, bytes: usize) -> Self {
        self.max_event_bytes = bytes;
        self
    }

    /// Builds the `PipelineConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the retry policy is
    /// inconsistent (jitter outside `[0, 1]`, initial backoff above the
    /// maximum).
    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: or_default(self.max_attempts, defaults.max_attempts),
            initial_backoff: or_default_duration(self.initial_backoff, defaults.initial_backoff),
            max_backoff: or_default_duration(self.max_backoff, defaults.max_backoff),
            jitter: self.backoff_jitter.unwrap_or(defaults.jitter),
        };
        retry.validate()?;

        Ok(PipelineConfig {
            partitions: self.partitions,
            batch_size: if self.batch_size > 0 {
                self.batch_size
            } else {
                100
            },
            poll_interval: or_default_duration(self.poll_interval, Duration::from_secs(1)),
            retry,
            fetch_timeout: or_default_duration(self.fetch_timeout, Duration::from_secs(10)),
            checkpoint_timeout: or_default_duration(
                self.checkpoint_timeout,
                Duration::from_secs(5),
            ),
            publish_timeout: or_default_duration(self.publish_timeout, Duration::from_secs(10)),
            dead_letter_timeout: or_default_duration(
                self.dead_letter_timeout,
                Duration::from_secs(5),
            ),
            max_worker_restarts: self.max_worker_restarts.unwrap_or(5),
            restart_backoff: or_default_duration(self.restart_backoff, Duration::from_secs(1)),
            checkpoint_mode: self.checkpoint_mode,
            max_event_bytes: if self.max_event_bytes > 0 {
                self.max_event_bytes
            } else {
                DEFAULT_MAX_EVENT_BYTES
            },
        })
    }
}

fn or_default(value: u32, default: u32) -> u32 {
    if value > 0 {
        value
    } else {
        default
    }
}

fn or_default_duration(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}

/// Lifecycle state of a partition worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Worker task spawned.
    Starting,
    /// Reading the partition checkpoint.
    Resuming,
    /// Fetching the next batch, or waiting for new records.
    Polling,
    /// Driving records through the record loop.
    Processing,
    /// Advancing the partition checkpoint.
    Checkpointing,
    /// Shutdown requested; finishing in-flight work.
    ShuttingDown,
    /// Cannot make progress safely; awaiting restart or abandoned.
    Failed,
    /// Exited after shutdown.
    Stopped,
}

impl WorkerState {
    /// Returns the upper-case state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Resuming => "RESUMING",
            Self::Polling => "POLLING",
            Self::Processing => "PROCESSING",
            Self::Checkpointing => "CHECKPOINTING",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Records pulled from the stream and processed (duplicates excluded)
    pub records_received: u64,

    /// Events acknowledged by the publisher
    pub records_published: u64,

    /// Records dead-lettered
    pub records_dead_lettered: u64,

    /// Dead-lettered records by error code
    pub dead_letters: DeadLetterCounts,

    /// Publish retries
    pub publish_retries: u64,

    /// Non-empty batches fully processed
    pub batches_processed: u64,

    /// Successful checkpoint advances
    pub checkpoints_advanced: u64,

    /// Stale checkpoint advances
    pub checkpoint_conflicts: u64,

    /// Redelivered records skipped
    pub duplicates_skipped: u64,

    /// Worker failures
    pub worker_failures: u64,

    /// Worker restarts
    pub worker_restarts: u64,
}

/// Pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Pipeline is already running
    #[error("Pipeline is already running")]
    AlreadyRunning,

    /// No partitions to consume
    #[error("No partitions configured or reported by the source")]
    NoPartitions,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Input stream error
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Checkpoint store error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Dead-letter store error
    #[error("Dead-letter error: {0}")]
    DeadLetter(#[from] DeadLetterError),

    /// Publisher error
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Other errors
    #[error("Pipeline error: {0}")]
    Other(String),
}

impl PipelineError {
    /// Metric label for a worker that stopped with this error.
    #[must_use]
    pub const fn failure_reason(&self) -> FailureReason {
        match self {
            Self::Checkpoint(_) => FailureReason::CheckpointUnavailable,
            Self::DeadLetter(_) => FailureReason::DeadLetterUnavailable,
            _ => FailureReason::SourceFailed,
        }
    }
}

/// Terminal outcome of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Published,
    DeadLettered,
}

/// State shared by the pipeline handle and every worker.
struct Shared<Src, C, P, D>
where
    D: DeadLetterStore,
{
    config: PipelineConfig,
    transformer: Transformer,
    source: Arc<Src>,
    checkpoints: Arc<C>,
    publisher: Arc<P>,
    publisher_type: String,
    dead_letters: DeadLetterHandler<D>,
    stats: RwLock<PipelineStats>,
}

/// Type alias for supervisor task handles.
type WorkerHandle = JoinHandle<()>;

/// Pipeline orchestrator that connects a change stream to the event bus.
pub struct Pipeline<Src, C, P, D>
where
    D: DeadLetterStore,
{
    /// Components and statistics shared with workers
    shared: Arc<Shared<Src, C, P, D>>,

    /// Shutdown sender (present while running)
    shutdown_tx: Option<watch::Sender<bool>>,

    /// Supervisor task handles
    workers: Arc<RwLock<Vec<WorkerHandle>>>,

    /// Observed state per partition
    states: Arc<RwLock<BTreeMap<PartitionId, watch::Receiver<WorkerState>>>>,

    /// Running flag
    running: Arc<RwLock<bool>>,
}

impl<Src, C, P, D> Pipeline<Src, C, P, D>
where
    Src: ChangeSource + 'static,
    C: CheckpointStore + 'static,
    P: Publisher + 'static,
    D: DeadLetterStore + 'static,
{
    /// Creates a new pipeline instance.
    pub fn new(
        config: PipelineConfig,
        registry: Arc<RuleRegistry>,
        source: Src,
        checkpoints: C,
        publisher: P,
        dead_letters: D,
    ) -> Self {
        info!(
            partitions = ?config.partitions,
            batch_size = config.batch_size,
            max_attempts = config.retry.max_attempts,
            checkpoint_mode = ?config.checkpoint_mode,
            tables = registry.len(),
            "Creating pipeline"
        );

        let transformer = Transformer::new(registry).with_max_event_bytes(config.max_event_bytes);
        let publisher_type = publisher.metadata().publisher_type;
        let dead_letters =
            DeadLetterHandler::new(Arc::new(dead_letters)).with_timeout(config.dead_letter_timeout);

        Self {
            shared: Arc::new(Shared {
                config,
                transformer,
                source: Arc::new(source),
                checkpoints: Arc::new(checkpoints),
                publisher: Arc::new(publisher),
                publisher_type,
                dead_letters,
                stats: RwLock::new(PipelineStats::default()),
            }),
            shutdown_tx: None,
            workers: Arc::new(RwLock::new(Vec::new())),
            states: Arc::new(RwLock::new(BTreeMap::new())),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Starts the pipeline, spawning a supervised worker per partition.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The pipeline is already running
    /// - The source cannot list its partitions
    /// - There are no partitions to consume
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        let mut running = self.running.write().await;
        if *running {
            return Err(PipelineError::AlreadyRunning);
        }

        info!("Starting pipeline");

        let config = &self.shared.config;
        let partitions = if config.partitions.is_empty() {
            timeout(config.fetch_timeout, self.shared.source.partitions())
                .await
                .map_err(|_| SourceError::Timeout(config.fetch_timeout))??
        } else {
            config.partitions.clone()
        };

        if partitions.is_empty() {
            return Err(PipelineError::NoPartitions);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let mut workers = self.workers.write().await;
        let mut states = self.states.write().await;
        states.clear();

        for partition in partitions {
            let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
            states.insert(partition.clone(), state_rx);

            let shared = Arc::clone(&self.shared);
            let shutdown_rx = shutdown_rx.clone();
            workers.push(tokio::spawn(async move {
                shared.supervise(partition, state_tx, shutdown_rx).await;
            }));
        }

        metrics::set_active_partitions(workers.len());
        metrics::set_pipeline_status(PipelineStatus::Running);

        *running = true;
        info!(workers = workers.len(), "Pipeline started");

        Ok(())
    }

    /// Stops the pipeline gracefully.
    ///
    /// This will:
    /// 1. Signal every worker to stop fetching
    /// 2. Wait for in-flight records to finish and be checkpointed
    /// 3. Close the publisher and the stores
    ///
    /// # Errors
    ///
    /// Returns an error if a component fails to close.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<(), PipelineError> {
        info!("Stopping pipeline");

        let mut running = self.running.write().await;
        if !*running {
            warn!("Pipeline is not running");
            return Ok(());
        }

        if let Some(tx) = self.shutdown_tx.take() {
            tx.send_replace(true);
        }

        let mut workers = self.workers.write().await;
        for worker in workers.drain(..) {
            if let Err(e) = worker.await {
                error!(?e, "Supervisor task panicked");
            }
        }

        // Every component is closed even if an earlier one fails; the first
        // error is returned.
        let closed = [
            self.shared.publisher.close().await.map_err(PipelineError::from),
            self.shared.checkpoints.close().await.map_err(PipelineError::from),
            self.shared
                .dead_letters
                .store()
                .close()
                .await
                .map_err(PipelineError::from),
        ];

        *running = false;
        metrics::set_active_partitions(0);
        metrics::set_pipeline_status(PipelineStatus::Stopped);

        let mut first_error = None;
        for result in closed {
            if let Err(e) = result {
                error!(error = %e, "Failed to close pipeline component");
                first_error.get_or_insert(e);
            }
        }

        let stats = self.stats().await;
        info!(
            records_received = stats.records_received,
            records_published = stats.records_published,
            records_dead_lettered = stats.records_dead_lettered,
            publish_retries = stats.publish_retries,
            worker_restarts = stats.worker_restarts,
            "Pipeline stopped"
        );

        first_error.map_or(Ok(()), Err)
    }

    /// Returns the current pipeline statistics.
    pub async fn stats(&self) -> PipelineStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.dead_letters = self.shared.dead_letters.counts();
        stats.records_dead_lettered = stats.dead_letters.total();
        stats
    }

    /// Returns the current state of every partition worker.
    pub async fn worker_states(&self) -> BTreeMap<PartitionId, WorkerState> {
        self.states
            .read()
            .await
            .iter()
            .map(|(partition, rx)| (partition.clone(), *rx.borrow()))
            .collect()
    }

    /// Checks if the pipeline is currently running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

fn shutdown_requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

impl<Src, C, P, D> Shared<Src, C, P, D>
where
    Src: ChangeSource + 'static,
    C: CheckpointStore + 'static,
    P: Publisher + 'static,
    D: DeadLetterStore + 'static,
{
    /// Runs a partition worker, restarting it when it fails.
    async fn supervise(
        &self,
        partition: PartitionId,
        state_tx: watch::Sender<WorkerState>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut restarts = 0_u32;

        loop {
            state_tx.send_replace(WorkerState::Starting);

            let run = AssertUnwindSafe(self.run_partition(
                &partition,
                &state_tx,
                shutdown_rx.clone(),
            ))
            .catch_unwind()
            .await;

            let reason = match run {
                Ok(Ok(())) => {
                    state_tx.send_replace(WorkerState::Stopped);
                    info!(partition = %partition, "Partition worker stopped");
                    break;
                }
                Ok(Err(e)) => {
                    error!(partition = %partition, error = %e, "Partition worker failed");
                    e.failure_reason()
                }
                Err(_) => {
                    error!(partition = %partition, "Partition worker panicked");
                    FailureReason::Panicked
                }
            };

            state_tx.send_replace(WorkerState::Failed);
            metrics::increment_worker_failures(reason);
            self.stats.write().await.worker_failures += 1;

            if shutdown_requested(&shutdown_rx) {
                break;
            }

            if restarts >= self.config.max_worker_restarts {
                error!(
                    partition = %partition,
                    restarts,
                    "Partition worker exceeded restart limit, giving up"
                );
                metrics::set_pipeline_status(PipelineStatus::Error);
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                () = tokio::time::sleep(self.config.restart_backoff) => {}
            }

            restarts += 1;
            metrics::increment_worker_restarts();
            self.stats.write().await.worker_restarts += 1;
            warn!(partition = %partition, restarts, "Restarting partition worker");
        }

        metrics::decrement_active_partitions();
    }

    fn transition(partition: &PartitionId, state_tx: &watch::Sender<WorkerState>, to: WorkerState) {
        let from = state_tx.send_replace(to);
        if from != to {
            debug!(partition = %partition, from = %from, to = %to, "Worker state transition");
        }
    }

    /// One run of a partition worker, from checkpoint read to shutdown.
    #[instrument(skip(self, partition, state_tx, shutdown_rx), fields(partition = %partition))]
    async fn run_partition(
        &self,
        partition: &PartitionId,
        state_tx: &watch::Sender<WorkerState>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let config = &self.config;

        Self::transition(partition, state_tx, WorkerState::Resuming);
        let checkpoint = timeout(config.checkpoint_timeout, self.checkpoints.get(partition))
            .await
            .map_err(|_| CheckpointError::Timeout(config.checkpoint_timeout))??;

        let mut committed = checkpoint.map(|c| c.last_processed_sequence);
        let mut cursor = committed;

        match committed {
            Some(sequence) => info!(sequence = %sequence, "Resuming after checkpoint"),
            None => info!("No checkpoint found, starting from the beginning of the stream"),
        }

        let mut fetch_failures = 0_u32;

        loop {
            if shutdown_requested(&shutdown_rx) {
                break;
            }

            Self::transition(partition, state_tx, WorkerState::Polling);

            let fetched = tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = timeout(
                    config.fetch_timeout,
                    self.source.fetch(partition, cursor, config.batch_size),
                ) => result.unwrap_or(Err(SourceError::Timeout(config.fetch_timeout))),
            };

            let batch = match fetched {
                Ok(batch) => {
                    fetch_failures = 0;
                    batch
                }
                Err(e) if e.is_retryable() => {
                    fetch_failures = fetch_failures.saturating_add(1);
                    let delay = config.retry.backoff(fetch_failures, rand::random::<f64>());
                    warn!(
                        error = %e,
                        attempt = fetch_failures,
                        delay_ms = delay.as_millis(),
                        "Fetch failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    () = tokio::time::sleep(config.poll_interval) => {}
                }
                continue;
            }

            Self::transition(partition, state_tx, WorkerState::Processing);
            let batch_start = Instant::now();
            let batch_cursor = cursor;
            let batch_len = batch.len();
            metrics::record_batch_size(batch_len);
            debug!(batch_size = batch_len, "Processing batch");

            for raw in &batch {
                if shutdown_requested(&shutdown_rx) {
                    Self::transition(partition, state_tx, WorkerState::ShuttingDown);
                    info!("Shutdown requested mid-batch, stopping after in-flight record");
                    break;
                }

                if cursor.is_some_and(|c| raw.sequence <= c) {
                    debug!(sequence = %raw.sequence, "Skipping already processed record");
                    self.stats.write().await.duplicates_skipped += 1;
                    continue;
                }

                let outcome = self.process_record(partition, raw).await?;
                debug!(sequence = %raw.sequence, ?outcome, "Record resolved");
                cursor = Some(raw.sequence);

                if config.checkpoint_mode == CheckpointMode::PerRecord {
                    Self::transition(partition, state_tx, WorkerState::Checkpointing);
                    cursor = self.commit(partition, cursor, &mut committed).await?;
                    Self::transition(partition, state_tx, WorkerState::Processing);
                }
            }

            if cursor > committed {
                Self::transition(partition, state_tx, WorkerState::Checkpointing);
                cursor = self.commit(partition, cursor, &mut committed).await?;
            }

            self.stats.write().await.batches_processed += 1;
            metrics::record_batch_duration(batch_start.elapsed());

            // A batch of redeliveries only; wait instead of refetching at once.
            if cursor == batch_cursor {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    () = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }

        Self::transition(partition, state_tx, WorkerState::ShuttingDown);
        Ok(())
    }

    /// Advances the checkpoint to `cursor` and returns the cursor to continue
    /// from.
    ///
    /// A conflict means the stored checkpoint is already at or beyond
    /// `cursor`; the worker continues from the stored position.
    async fn commit(
        &self,
        partition: &PartitionId,
        cursor: Option<SequenceNumber>,
        committed: &mut Option<SequenceNumber>,
    ) -> Result<Option<SequenceNumber>, PipelineError> {
        let Some(sequence) = cursor else {
            return Ok(cursor);
        };
        if *committed >= cursor {
            return Ok(cursor);
        }

        let timeout_after = self.config.checkpoint_timeout;
        let result = timeout(timeout_after, self.checkpoints.advance(partition, sequence))
            .await
            .map_err(|_| CheckpointError::Timeout(timeout_after))?;

        match result {
            Ok(_) => {
                *committed = Some(sequence);
                metrics::increment_checkpoint_advances();
                self.stats.write().await.checkpoints_advanced += 1;
                debug!(sequence = %sequence, "Checkpoint advanced");
                Ok(cursor)
            }
            Err(CheckpointError::Conflict { current, .. }) => {
                let effective = sequence.max(current);
                *committed = Some(effective);
                metrics::increment_checkpoint_conflicts();
                self.stats.write().await.checkpoint_conflicts += 1;
                warn!(
                    attempted = %sequence,
                    stored = %current,
                    "Checkpoint already at or beyond attempted position"
                );
                Ok(Some(effective))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drives one record to its terminal outcome.
    ///
    /// Only a dead-letter persistence failure is returned as an error; every
    /// other failure resolves to a dead-letter entry.
    async fn process_record(
        &self,
        partition: &PartitionId,
        raw: &RawRecord,
    ) -> Result<Outcome, PipelineError> {
        self.stats.write().await.records_received += 1;

        let record = match parser::parse(raw) {
            Ok(record) => record,
            Err(e) => {
                metrics::increment_records_received(metrics::UNPARSED_TABLE);
                self.dead_letters
                    .capture(partition, OriginalRecord::Raw(raw), e.error_code(), e.to_string(), 1)
                    .await?;
                return Ok(Outcome::DeadLettered);
            }
        };

        let table_label = metrics::table_label(self.transformer.registry(), &record.table);
        metrics::increment_records_received(table_label);

        let event = match self.transformer.apply(&record) {
            Ok(event) => event,
            Err(e) => {
                let code = e.error_code();
                if code == ErrorCode::ValidationError {
                    metrics::increment_validation_alerts(table_label);
                }
                self.dead_letters
                    .capture(partition, OriginalRecord::Parsed(&record), code, e.to_string(), 1)
                    .await?;
                return Ok(Outcome::DeadLettered);
            }
        };

        self.publish_with_retry(partition, &record, &event).await
    }

    /// Publishes with bounded exponential backoff. Exhausted or terminal
    /// failures are dead-lettered.
    #[instrument(
        skip(self, partition, record, event),
        fields(table = %record.table, sequence = %record.sequence_number)
    )]
    async fn publish_with_retry(
        &self,
        partition: &PartitionId,
        record: &ChangeRecord,
        event: &crate::event::PublishedEvent,
    ) -> Result<Outcome, PipelineError> {
        let publish_timeout = self.config.publish_timeout;
        let mut retry = RetryState::new(self.config.retry);

        loop {
            let attempt = retry.begin_attempt();

            let result = {
                let _timer = Timer::new(
                    self.publisher_type.as_str(),
                    metrics::record_publish_duration,
                );
                timeout(publish_timeout, self.publisher.publish(event))
                    .await
                    .unwrap_or(Err(PublishError::Timeout(publish_timeout)))
            };

            let err = match result {
                Ok(_ack) => {
                    if attempt > 1 {
                        info!(attempts = attempt, "Publish succeeded after retries");
                    }
                    metrics::increment_records_published(&record.table, record.operation.as_str());
                    self.stats.write().await.records_published += 1;
                    return Ok(Outcome::Published);
                }
                Err(e) => e,
            };

            match retry.on_publish_error(&err) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        attempt,
                        max_attempts = self.config.retry.max_attempts,
                        retry_delay_ms = delay.as_millis(),
                        error = %err,
                        "Publish failed, retrying"
                    );
                    metrics::increment_publish_retries(err.category());
                    self.stats.write().await.publish_retries += 1;
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp { attempts } => {
                    let message = if err.is_retryable() {
                        format!("retries exhausted after {attempts} attempts: {err}")
                    } else {
                        err.to_string()
                    };
                    self.dead_letters
                        .capture(
                            partition,
                            OriginalRecord::Parsed(record),
                            ErrorCode::PublishError,
                            message,
                            attempts,
                        )
                        .await?;
                    return Ok(Outcome::DeadLettered);
                }
            }
        }
    }
}

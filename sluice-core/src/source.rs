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

//! Input stream abstraction.
//!
//! The ordered change stream is an external collaborator. [`ChangeSource`]
//! is the seam the consumer pulls from: it lists partitions and returns
//! batches of [`RawRecord`]s strictly after a given position, in ascending
//! sequence order.
//!
//! [`MemoryChangeSource`] keeps records in process and is used by tests and
//! demos.

use crate::record::{PartitionId, RawRecord, SequenceNumber};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::trace;

/// Errors returned by a [`ChangeSource`].
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The stream is temporarily unreachable.
    #[error("Stream unavailable: {0}")]
    Unavailable(String),

    /// The fetch did not complete within its deadline.
    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The partition does not exist.
    #[error("Unknown partition: {0}")]
    UnknownPartition(PartitionId),

    /// Anything else.
    #[error("Stream error: {message}")]
    Other {
        /// Human-readable error message
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },
}

impl SourceError {
    /// Returns whether fetching again may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => true,
            Self::UnknownPartition(_) => false,
            Self::Other { retryable, .. } => *retryable,
        }
    }
}

/// An ordered, partitioned change stream.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Lists the partitions of the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be reached.
    async fn partitions(&self) -> Result<Vec<PartitionId>, SourceError>;

    /// Returns up to `max` records of `partition` with a sequence number
    /// strictly greater than `after` (or from the start when `after` is
    /// `None`), in ascending order. An empty result means the partition is
    /// caught up.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be reached or the partition is
    /// unknown.
    async fn fetch(
        &self,
        partition: &PartitionId,
        after: Option<SequenceNumber>,
        max: usize,
    ) -> Result<Vec<RawRecord>, SourceError>;
}

/// In-memory change stream.
///
/// Clones share state, so a test can keep appending records after handing a
/// clone to a pipeline.
///
/// # Examples
///
/// ```rust
/// use sluice_core::source::{ChangeSource, MemoryChangeSource};
/// use sluice_core::record::PartitionId;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = MemoryChangeSource::new();
/// source.push_json("shard-0", serde_json::json!({"table": "users"})).await;
///
/// let batch = source.fetch(&PartitionId::new("shard-0"), None, 10).await?;
/// assert_eq!(batch.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryChangeSource {
    partitions: Arc<RwLock<BTreeMap<PartitionId, Vec<RawRecord>>>>,
    fetch_failures: Arc<AtomicUsize>,
    fetch_count: Arc<AtomicUsize>,
}

impl MemoryChangeSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a partition with no records.
    pub async fn add_partition(&self, partition: impl Into<PartitionId>) {
        self.partitions
            .write()
            .await
            .entry(partition.into())
            .or_default();
    }

    /// Appends a raw payload at the next sequence number (starting at 1) and
    /// returns that sequence number.
    pub async fn push(
        &self,
        partition: impl Into<PartitionId>,
        data: impl Into<Vec<u8>>,
    ) -> SequenceNumber {
        let partition = partition.into();
        let mut partitions = self.partitions.write().await;
        let records = partitions.entry(partition.clone()).or_default();
        let sequence = records
            .last()
            .map_or(SequenceNumber::new(1), |last| last.sequence.next());
        records.push(RawRecord::new(partition, sequence, data));
        sequence
    }

    /// Appends a JSON payload at the next sequence number.
    pub async fn push_json(
        &self,
        partition: impl Into<PartitionId>,
        payload: serde_json::Value,
    ) -> SequenceNumber {
        self.push(partition, payload.to_string().into_bytes()).await
    }

    /// Inserts a record at an explicit position, keeping the partition
    /// sorted.
    pub async fn insert(&self, record: RawRecord) {
        let mut partitions = self.partitions.write().await;
        let records = partitions.entry(record.partition.clone()).or_default();
        let index = records.partition_point(|r| r.sequence <= record.sequence);
        records.insert(index, record);
    }

    /// Makes the next `count` fetches fail with a retryable error.
    pub fn fail_next_fetches(&self, count: usize) {
        self.fetch_failures.store(count, Ordering::SeqCst);
    }

    /// Number of `fetch` calls served so far, including failed ones.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Number of records stored for `partition`.
    pub async fn len(&self, partition: &PartitionId) -> usize {
        self.partitions
            .read()
            .await
            .get(partition)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn partitions(&self) -> Result<Vec<PartitionId>, SourceError> {
        Ok(self.partitions.read().await.keys().cloned().collect())
    }

    async fn fetch(
        &self,
        partition: &PartitionId,
        after: Option<SequenceNumber>,
        max: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .fetch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SourceError::Unavailable("Simulated stream outage".into()));
        }

        let partitions = self.partitions.read().await;
        let records = partitions
            .get(partition)
            .ok_or_else(|| SourceError::UnknownPartition(partition.clone()))?;

        let batch: Vec<RawRecord> = records
            .iter()
            .filter(|r| after.map_or(true, |a| r.sequence > a))
            .take(max)
            .cloned()
            .collect();

        trace!(partition = %partition, after = ?after, returned = batch.len(), "Served fetch");
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_push_assigns_increasing_sequences() {
        let source = MemoryChangeSource::new();
        assert_eq!(source.push("p", b"a".to_vec()).await, SequenceNumber::new(1));
        assert_eq!(source.push("p", b"b".to_vec()).await, SequenceNumber::new(2));
        assert_eq!(source.len(&PartitionId::new("p")).await, 2);
    }

    #[tokio::test]
    async fn test_fetch_after_and_max() {
        let source = MemoryChangeSource::new();
        for i in 0..5 {
            source.push_json("p", json!({ "n": i })).await;
        }
        let partition = PartitionId::new("p");

        let first = source.fetch(&partition, None, 2).await.unwrap();
        assert_eq!(
            first.iter().map(|r| r.sequence.value()).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let rest = source
            .fetch(&partition, Some(SequenceNumber::new(2)), 10)
            .await
            .unwrap();
        assert_eq!(
            rest.iter().map(|r| r.sequence.value()).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );

        let caught_up = source
            .fetch(&partition, Some(SequenceNumber::new(5)), 10)
            .await
            .unwrap();
        assert!(caught_up.is_empty());
    }

    #[tokio::test]
    async fn test_insert_keeps_order() {
        let source = MemoryChangeSource::new();
        source
            .insert(RawRecord::new("p", SequenceNumber::new(20), b"b".to_vec()))
            .await;
        source
            .insert(RawRecord::new("p", SequenceNumber::new(10), b"a".to_vec()))
            .await;
        let batch = source.fetch(&PartitionId::new("p"), None, 10).await.unwrap();
        assert_eq!(batch[0].sequence, SequenceNumber::new(10));
        assert_eq!(batch[1].sequence, SequenceNumber::new(20));
    }

    #[tokio::test]
    async fn test_unknown_partition_is_fatal() {
        let source = MemoryChangeSource::new();
        let err = source
            .fetch(&PartitionId::new("missing"), None, 1)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_injected_failures_are_retryable() {
        let source = MemoryChangeSource::new();
        source.add_partition("p").await;
        source.fail_next_fetches(2);
        let partition = PartitionId::new("p");

        assert!(source.fetch(&partition, None, 1).await.unwrap_err().is_retryable());
        assert!(source.fetch(&partition, None, 1).await.is_err());
        assert!(source.fetch(&partition, None, 1).await.is_ok());
        assert_eq!(source.fetch_count(), 3);
    }
}

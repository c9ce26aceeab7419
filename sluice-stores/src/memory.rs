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


//! In-memory checkpoint and dead-letter stores.
//!
//! # Use Cases
//!
//! The in-memory stores are suitable for:
//!
//! - **Local development and testing** - No external dependencies required
//! - **Single-instance deployments** - Where durability across restarts isn't needed
//! - **Prototyping** - Quick setup without infrastructure
//!
//! # Limitations
//!
//! - **No persistence** - Checkpoints and dead letters are lost on process restart
//! - **Single process only** - Cannot be shared across multiple instances
//!
//! For production deployments use the Redis stores (`redis-store` feature).
//!
//! # Example
//!
//! ```rust
//! use sluice_stores::memory::MemoryCheckpointStore;
//! use sluice_core::checkpoint::CheckpointStore;
//! use sluice_core::record::{PartitionId, SequenceNumber};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryCheckpointStore::new();
//! let partition = PartitionId::new("shard-0");
//!
//! store.advance(&partition, SequenceNumber::new(10)).await?;
//!
//! // Checkpoints never move backwards
//! let err = store.advance(&partition, SequenceNumber::new(5)).await.unwrap_err();
//! assert!(err.is_conflict());
//!
//! let checkpoint = store.get(&partition).await?.unwrap();
//! assert_eq!(checkpoint.last_processed_sequence, SequenceNumber::new(10));
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! Both stores use [`Arc`] and [`RwLock`] internally. Clones share the same
//! underlying storage, so a test can keep a handle after moving a clone into
//! a pipeline.

use async_trait::async_trait;
use sluice_core::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use sluice_core::dead_letter::{DeadLetterEntry, DeadLetterError, DeadLetterStore, ErrorCode};
use sluice_core::record::{PartitionId, SequenceNumber};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

/// In-memory checkpoint store.
///
/// `advance` is atomic: the compare and the write happen under one write
/// lock.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<PartitionId, Checkpoint>>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating new in-memory checkpoint store");
        Self::default()
    }

    /// Creates a store with pre-populated checkpoints.
    ///
    /// Useful to simulate a restart after a crash.
    #[must_use]
    pub fn with_checkpoints<I, P>(checkpoints: I) -> Self
    where
        I: IntoIterator<Item = (P, SequenceNumber)>,
        P: Into<PartitionId>,
    {
        let map: HashMap<PartitionId, Checkpoint> = checkpoints
            .into_iter()
            .map(|(partition, sequence)| {
                let partition = partition.into();
                (partition.clone(), Checkpoint::new(partition, sequence))
            })
            .collect();

        debug!(
            checkpoint_count = map.len(),
            "Creating in-memory checkpoint store with initial checkpoints"
        );

        Self {
            checkpoints: Arc::new(RwLock::new(map)),
        }
    }

    /// Returns the number of partitions with a checkpoint.
    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    /// Returns `true` if no checkpoint is stored.
    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }

    /// Returns the stored sequence for a partition, if any.
    pub async fn sequence(&self, partition: &PartitionId) -> Option<SequenceNumber> {
        self.checkpoints
            .read()
            .await
            .get(partition)
            .map(|c| c.last_processed_sequence)
    }

    /// Clears all stored checkpoints.
    pub async fn clear(&self) {
        let mut checkpoints = self.checkpoints.write().await;
        let count = checkpoints.len();
        checkpoints.clear();
        debug!(cleared_count = count, "Cleared all checkpoints from memory store");
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, partition: &PartitionId) -> Result<Option<Checkpoint>, CheckpointError> {
        trace!(partition = %partition, "Retrieving checkpoint from memory");
        Ok(self.checkpoints.read().await.get(partition).cloned())
    }

    async fn advance(
        &self,
        partition: &PartitionId,
        sequence: SequenceNumber,
    ) -> Result<Checkpoint, CheckpointError> {
        let mut checkpoints = self.checkpoints.write().await;

        if let Some(current) = checkpoints.get(partition) {
            if current.last_processed_sequence >= sequence {
                return Err(CheckpointError::conflict(
                    partition,
                    current.last_processed_sequence,
                    sequence,
                ));
            }
        }

        let checkpoint = Checkpoint::new(partition.clone(), sequence);
        checkpoints.insert(partition.clone(), checkpoint.clone());

        debug!(partition = %partition, sequence = %sequence, "Advanced checkpoint in memory");
        Ok(checkpoint)
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut checkpoints: Vec<Checkpoint> =
            self.checkpoints.read().await.values().cloned().collect();
        checkpoints.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(checkpoints)
    }

    async fn delete(&self, partition: &PartitionId) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.write().await;
        if checkpoints.remove(partition).is_some() {
            debug!(partition = %partition, "Deleted checkpoint from memory");
        } else {
            warn!(partition = %partition, "Attempted to delete non-existent checkpoint");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        debug!("Closing in-memory checkpoint store (no-op)");
        Ok(())
    }
}

/// In-memory dead-letter store.
///
/// Entries are kept in capture order.
#[derive(Debug, Clone, Default)]
pub struct MemoryDeadLetterStore {
    entries: Arc<RwLock<Vec<DeadLetterEntry>>>,
}

impl MemoryDeadLetterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating new in-memory dead-letter store");
        Self::default()
    }

    /// Returns the number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns `true` if no entry is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Returns a snapshot of every entry.
    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.read().await.clone()
    }

    /// Returns the number of entries with the given error code.
    pub async fn count(&self, code: ErrorCode) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.error_code() == code)
            .count()
    }

    /// Clears all stored entries.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn store(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
        let mut entries = self.entries.write().await;
        entries.push(entry.clone());
        trace!(
            partition = %entry.partition_id,
            sequence = %entry.sequence_number,
            total_entries = entries.len(),
            "Stored dead-letter entry in memory"
        );
        Ok(())
    }

    async fn list(
        &self,
        partition: Option<&PartitionId>,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| partition.map_or(true, |p| &e.partition_id == p))
            .cloned()
            .collect())
    }
}

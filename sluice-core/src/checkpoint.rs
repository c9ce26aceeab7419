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

//! Durable per-partition progress markers.
//!
//! The [`CheckpointStore`] trait persists, for each partition, the highest
//! sequence number whose record reached a terminal outcome (published or
//! dead-lettered). A restarted worker resumes strictly after that position.
//!
//! [`CheckpointStore::advance`] is conditional: it only succeeds when the new
//! sequence is strictly greater than the stored one. A duplicate or stale
//! advance, for example after a crash-and-retry or during a brief overlap
//! between two workers, returns [`CheckpointError::Conflict`] and leaves the
//! stored value untouched, so the checkpoint never moves backwards.
//!
//! # Example
//!
//! ```rust
//! use sluice_core::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
//! use sluice_core::record::{PartitionId, SequenceNumber};
//! use std::collections::HashMap;
//!
//! #[derive(Default)]
//! struct TinyStore {
//!     inner: tokio::sync::Mutex<HashMap<PartitionId, Checkpoint>>,
//! }
//!
//! #[async_trait::async_trait]
//! impl CheckpointStore for TinyStore {
//!     async fn get(&self, partition: &PartitionId) -> Result<Option<Checkpoint>, CheckpointError> {
//!         Ok(self.inner.lock().await.get(partition).cloned())
//!     }
//!
//!     async fn advance(
//!         &self,
//!         partition: &PartitionId,
//!         sequence: SequenceNumber,
//!     ) -> Result<Checkpoint, CheckpointError> {
//!         let mut inner = self.inner.lock().await;
//!         if let Some(current) = inner.get(partition) {
//!             if sequence <= current.last_processed_sequence {
//!                 return Err(CheckpointError::conflict(partition, current.last_processed_sequence, sequence));
//!             }
//!         }
//!         let checkpoint = Checkpoint::new(partition.clone(), sequence);
//!         inner.insert(partition.clone(), checkpoint.clone());
//!         Ok(checkpoint)
//!     }
//!
//!     async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
//!         Ok(self.inner.lock().await.values().cloned().collect())
//!     }
//!
//!     async fn delete(&self, partition: &PartitionId) -> Result<(), CheckpointError> {
//!         self.inner.lock().await.remove(partition);
//!         Ok(())
//!     }
//!
//!     async fn close(&self) -> Result<(), CheckpointError> {
//!         Ok(())
//!     }
//! }
//! ```

use crate::record::{PartitionId, SequenceNumber};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress marker for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Partition this checkpoint belongs to.
    pub partition_id: PartitionId,

    /// Highest sequence number that reached a terminal outcome.
    pub last_processed_sequence: SequenceNumber,

    /// When the checkpoint was last advanced.
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Creates a checkpoint stamped with the current time.
    #[must_use]
    pub fn new(partition_id: PartitionId, last_processed_sequence: SequenceNumber) -> Self {
        Self {
            partition_id,
            last_processed_sequence,
            updated_at: Utc::now(),
        }
    }
}

/// Trait for checkpoint storage backends.
///
/// Implementations must persist checkpoints durably and make `advance`
/// atomic with respect to concurrent callers on the same partition.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns the checkpoint for a partition, or `None` for a fresh
    /// partition (meaning "start from the beginning of the stream").
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn get(&self, partition: &PartitionId) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Advances the checkpoint to `sequence` if it is strictly greater than
    /// the stored value.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Conflict`] if `sequence` is not greater
    /// than the stored value, or another error if the store cannot be
    /// reached.
    async fn advance(
        &self,
        partition: &PartitionId,
        sequence: SequenceNumber,
    ) -> Result<Checkpoint, CheckpointError>;

    /// Lists all stored checkpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Removes the checkpoint of a partition. The next worker for it starts
    /// from the beginning of the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn delete(&self, partition: &PartitionId) -> Result<(), CheckpointError>;

    /// Closes the store, releasing any resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be closed cleanly.
    async fn close(&self) -> Result<(), CheckpointError>;
}

/// Errors that can occur during checkpoint store operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The stored checkpoint is already at or beyond the attempted position.
    #[error("checkpoint conflict on partition {partition}: stored {current}, attempted {attempted}")]
    Conflict {
        /// Partition
        partition: PartitionId,
        /// Currently stored sequence
        current: SequenceNumber,
        /// Sequence the caller tried to store
        attempted: SequenceNumber,
    },

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The call did not complete within its deadline.
    #[error("checkpoint operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Other errors
    #[error("Checkpoint store error: {0}")]
    Other(String),
}

impl CheckpointError {
    /// Builds a [`CheckpointError::Conflict`].
    #[must_use]
    pub fn conflict(
        partition: &PartitionId,
        current: SequenceNumber,
        attempted: SequenceNumber,
    ) -> Self {
        Self::Conflict {
            partition: partition.clone(),
            current,
            attempted,
        }
    }

    /// Returns true for a conditional-advance rejection.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

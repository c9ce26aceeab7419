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


//! Checkpoint and dead-letter store backends for sluice.
//!
//! This crate provides implementations of the
//! [`CheckpointStore`](sluice_core::checkpoint::CheckpointStore) and
//! [`DeadLetterStore`](sluice_core::dead_letter::DeadLetterStore) traits.
//!
//! # Available Stores
//!
//! - **Memory** (always available): process-local stores for tests,
//!   single-instance deployments and demos
//! - **Redis** (`redis-store` feature): durable, shared stores with an
//!   atomic compare-and-set checkpoint advance
//!
//! # Feature Flags
//!
//! - `redis-store`: Enables the Redis-backed stores (requires a Redis server)
//!
//! # Example: Redis Stores
//!
//! ```rust,ignore
//! use sluice_stores::redis::{RedisCheckpointStore, RedisConfig, RedisDeadLetterStore};
//! use sluice_core::checkpoint::CheckpointStore;
//! use sluice_core::record::{PartitionId, SequenceNumber};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisConfig::builder()
//!     .url("redis://localhost:6379")
//!     .pool_size(10)
//!     .build()?;
//!
//! let checkpoints = RedisCheckpointStore::new(config.clone()).await?;
//! let dead_letters = RedisDeadLetterStore::new(config).await?;
//!
//! let partition = PartitionId::new("shard-0");
//! checkpoints.advance(&partition, SequenceNumber::new(42)).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod memory;

#[cfg(feature = "redis-store")]
pub mod redis;

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


//! S3 dead-letter archive.
//!
//! [`S3DeadLetterStore`] implements
//! [`DeadLetterStore`](sluice_core::dead_letter::DeadLetterStore) by writing
//! each entry as its own JSON object. Objects are written synchronously with
//! the capture, so a record is only checkpointed past once its entry is in
//! the bucket.
//!
//! # Features
//!
//! - **Compression**: gzip, zstd (with feature gates)
//! - **Key layouts**: by error code, by hour, by partition, flat
//! - **Collision-free keys**: partition ids are escaped, never merged
//! - **One entry per record**: listings report the latest capture of each record
//! - **S3-compatible storage**: AWS S3, MinIO, LocalStack
//!
//! # Using LocalStack for testing
//!
//! ```rust,ignore
//! use sluice_destinations::s3::{S3DeadLetterConfig, S3DeadLetterStore};
//!
//! let config = S3DeadLetterConfig::builder()
//!     .bucket("test-bucket")
//!     .region("us-east-1")
//!     .endpoint_url("http://localhost:4566")
//!     .force_path_style(true)
//!     .build()?;
//!
//! let dead_letters = S3DeadLetterStore::new(config).await?;
//! ```

pub mod config;
pub mod key_gen;
mod store;

pub use config::{Compression, S3DeadLetterConfig, S3DeadLetterConfigBuilder};
pub use key_gen::KeyGenerationStrategy;
pub use store::S3DeadLetterStore;

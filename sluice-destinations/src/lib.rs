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


//! Sluice Destinations - Event-Bus Publishers and Dead-Letter Archives
//!
//! This crate provides production backends for the two outbound seams of a
//! sluice pipeline:
//!
//! - **[`http`]**: a [`Publisher`](sluice_core::publisher::Publisher) that
//!   POSTs wire envelopes to an HTTP event-bus ingestion endpoint
//! - **[`s3`]**: a [`DeadLetterStore`](sluice_core::dead_letter::DeadLetterStore)
//!   that archives dead-letter entries in AWS S3 (or MinIO / LocalStack)
//!
//! # Features
//!
//! - `http` - HTTP event-bus publisher (default)
//! - `s3` - S3 dead-letter archive
//! - `gzip` - Gzip compression of archived entries
//! - `zstandard` - Zstandard compression of archived entries
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use sluice_destinations::http::{HttpPublisher, HttpPublisherConfig};
//!
//! let config = HttpPublisherConfig::builder()
//!     .endpoint("https://bus.internal/events")
//!     .bearer_token(std::env::var("BUS_TOKEN")?)
//!     .build()?;
//!
//! let publisher = HttpPublisher::new(config)?;
//! // Pipeline::new(config, registry, source, checkpoints, publisher, dead_letters)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "s3")]
pub mod s3;

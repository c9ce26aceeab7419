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


//! HTTP event-bus publisher.
//!
//! [`HttpPublisher`] implements [`Publisher`](sluice_core::publisher::Publisher)
//! for event buses that ingest JSON over HTTP. Each event is one POST whose
//! body is the wire envelope; the event's dedup key travels in an
//! idempotency header so buses that support it can drop redeliveries.
//!
//! # Example
//!
//! ```rust,no_run
//! use sluice_destinations::http::{HttpPublisher, HttpPublisherConfig};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HttpPublisherConfig::builder()
//!     .endpoint("https://bus.internal/v1/events")
//!     .timeout(Duration::from_secs(5))
//!     .bearer_token("token")
//!     .max_event_bytes(256 * 1024)
//!     .build()?;
//!
//! let publisher = HttpPublisher::new(config)?;
//! # let _ = publisher;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod publisher;

pub use config::{HttpPublisherConfig, HttpPublisherConfigBuilder};
pub use publisher::{classify_status, parse_retry_after, HttpPublisher, MESSAGE_ID_HEADER};

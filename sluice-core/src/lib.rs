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


//! Sluice Core - Change-Data-Capture Processing Core
//!
//! This crate consumes an ordered stream of database mutation records,
//! applies per-table redaction rules, publishes normalized events to a
//! downstream event bus, and checkpoints progress so every mutation reaches
//! exactly one terminal outcome: published or dead-lettered.
//!
//! # Key Components
//!
//! - **Records**: [`record`] defines raw stream records and parsed change records
//! - **Parser**: [`parser`] validates raw payloads into [`record::ChangeRecord`]s
//! - **Rules**: [`rules`] holds the immutable per-table [`rules::RuleRegistry`]
//! - **Transform**: [`transform`] applies redaction and builds [`event::PublishedEvent`]s
//! - **Publisher**: [`publisher`] is the event-bus seam with retry classification
//! - **Checkpoints**: [`checkpoint`] defines the monotonic per-partition cursor store
//! - **Dead letters**: [`dead_letter`] captures records that cannot be published
//! - **Pipeline**: [`pipeline`] orchestrates supervised per-partition workers
//!
//! # Example
//!
//! ```rust
//! use sluice_core::parser::parse;
//! use sluice_core::record::{Operation, RawRecord, SequenceNumber};
//! use sluice_core::rules::{RuleRegistry, TransformRule};
//! use sluice_core::transform::transform;
//!
//! let raw = RawRecord::new(
//!     "shard-0",
//!     SequenceNumber::from(7_u64),
//!     br#"{"table":"users","operation":"INSERT","keys":{"id":"u1"},
//!         "after":{"id":"u1","email":"a@example.com"}}"#.to_vec(),
//! );
//!
//! let record = parse(&raw).unwrap();
//! assert_eq!(record.operation, Operation::Insert);
//!
//! let rule = TransformRule::new("UserCreated").with_redact_fields(["email"]);
//! let event = transform(&record, &rule).unwrap();
//! assert!(!event.after.unwrap().contains_key("email"));
//! ```

pub mod checkpoint;
pub mod dead_letter;
pub mod event;
pub mod metrics;
pub mod parser;
pub mod pipeline;
pub mod publisher;
pub mod record;
pub mod retry;
pub mod rules;
pub mod source;
pub mod transform;

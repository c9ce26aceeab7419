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


//! In-Memory Pipeline Example
//!
//! Runs the full Parse -> Transform -> Publish -> Checkpoint loop against
//! in-memory components, with no external services.
//!
//! # Running the Example
//!
//! ```bash
//! RUST_LOG=info,sluice_core=debug cargo run -p sluice-core --example memory_pipeline
//! ```
//!
//! The demo feeds one partition with a mix of records:
//! - valid `users` and `orders` mutations (published, PII redacted)
//! - a malformed payload (dead-lettered as `PARSE_ERROR`)
//! - a table with no rule (dead-lettered as `VALIDATION_ERROR`)
//! - an event the mock bus throttles until retries run out (`PUBLISH_ERROR`)

use serde_json::json;
use sluice_core::checkpoint::CheckpointStore;
use sluice_core::dead_letter::DeadLetterStore;
use sluice_core::pipeline::{Pipeline, PipelineConfig};
use sluice_core::publisher::{MockPublisher, MockResponse};
use sluice_core::record::{PartitionId, SequenceNumber};
use sluice_core::rules::RuleRegistry;
use sluice_core::source::MemoryChangeSource;
use sluice_stores::memory::{MemoryCheckpointStore, MemoryDeadLetterStore};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const RULES: &str = r"
tables:
  users:
    eventType: user.changed
    redactFields: [ssn, email]
    includeFields: [id, name, status]
  orders:
    eventType: order.changed
    redactFields: [card_number]
";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let registry = Arc::new(RuleRegistry::from_yaml_str(RULES)?);
    let partition = PartitionId::new("shard-0");

    let source = MemoryChangeSource::new();
    source
        .push_json(
            partition.clone(),
            json!({
                "table": "users",
                "operation": "INSERT",
                "keys": { "id": 1 },
                "after": { "id": 1, "name": "Ada", "ssn": "123-45-6789", "email": "ada@example.com", "status": "active" },
                "metadata": { "transactionId": "txn-1" }
            }),
        )
        .await;
    source.push(partition.clone(), b"{\"table\": ".to_vec()).await;
    source
        .push_json(
            partition.clone(),
            json!({
                "table": "audit_log",
                "operation": "INSERT",
                "keys": { "id": 7 },
                "after": { "id": 7, "actor": "root" }
            }),
        )
        .await;
    let throttled = source
        .push_json(
            partition.clone(),
            json!({
                "table": "orders",
                "operation": "UPDATE",
                "keys": { "id": 42 },
                "before": { "id": 42, "status": "pending", "card_number": "4111" },
                "after": { "id": 42, "status": "paid", "card_number": "4111" }
            }),
        )
        .await;
    let last = source
        .push_json(
            partition.clone(),
            json!({
                "table": "users",
                "operation": "DELETE",
                "keys": { "id": 1 },
                "before": { "id": 1, "name": "Ada", "status": "active" }
            }),
        )
        .await;

    let publisher = MockPublisher::new().with_fallback(MockResponse::Ack);
    let publisher = publisher.with_responses_for(
        throttled,
        [
            MockResponse::Throttled(Some(Duration::from_millis(20))),
            MockResponse::Throttled(None),
            MockResponse::Throttled(None),
        ],
    );
    let checkpoints = MemoryCheckpointStore::new();
    let dead_letters = MemoryDeadLetterStore::new();

    let config = PipelineConfig::builder()
        .partitions([partition.clone()])
        .poll_interval(Duration::from_millis(50))
        .initial_backoff(Duration::from_millis(10))
        .build()?;

    let mut pipeline = Pipeline::new(
        config,
        registry,
        source,
        checkpoints.clone(),
        publisher.clone(),
        dead_letters.clone(),
    );

    pipeline.start().await?;

    while checkpoints.sequence(&partition).await < Some(last) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    pipeline.stop().await?;

    for event in publisher.published() {
        info!(wire = %String::from_utf8_lossy(&event.to_wire_bytes()?), "Published");
    }
    for entry in dead_letters.list(None).await? {
        info!(
            sequence = %entry.sequence_number,
            code = %entry.error.code,
            attempts = entry.attempts,
            message = %entry.error.message,
            "Dead letter"
        );
    }

    let checkpoint = checkpoints.get(&partition).await?;
    let stats = pipeline.stats().await;
    info!(
        checkpoint = %checkpoint.map_or(SequenceNumber::ZERO, |c| c.last_processed_sequence),
        published = stats.records_published,
        dead_lettered = stats.records_dead_lettered,
        retries = stats.publish_retries,
        "Done"
    );

    Ok(())
}

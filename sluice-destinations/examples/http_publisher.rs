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


//! HTTP Publisher Example
//!
//! Runs an in-memory change stream through the pipeline and publishes to a
//! real HTTP ingestion endpoint.
//!
//! # Running the Example
//!
//! Start anything that accepts `POST /events`, e.g. a local echo server:
//!
//! ```bash
//! python3 -m http.server 8080   # answers 501, which the publisher treats as retryable
//! ```
//!
//! ```bash
//! SLUICE_BUS_URL=http://localhost:8080/events \
//! SLUICE_BUS_TOKEN=dev-token \
//! RUST_LOG=info,sluice_core=debug \
//! cargo run -p sluice-destinations --example http_publisher
//! ```

use serde_json::json;
use sluice_core::dead_letter::DeadLetterStore;
use sluice_core::pipeline::{Pipeline, PipelineConfig};
use sluice_core::publisher::Publisher;
use sluice_core::record::PartitionId;
use sluice_core::rules::RuleRegistry;
use sluice_core::source::MemoryChangeSource;
use sluice_destinations::http::{HttpPublisher, HttpPublisherConfig};
use sluice_stores::memory::{MemoryCheckpointStore, MemoryDeadLetterStore};
use std::env;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let endpoint =
        env::var("SLUICE_BUS_URL").unwrap_or_else(|_| "http://localhost:8080/events".to_string());

    let mut builder = HttpPublisherConfig::builder()
        .endpoint(endpoint)
        .timeout(Duration::from_secs(3))
        .header("X-Source", "sluice-example")
        .max_event_bytes(256 * 1024);
    if let Ok(token) = env::var("SLUICE_BUS_TOKEN") {
        builder = builder.bearer_token(token);
    }
    let publisher = HttpPublisher::new(builder.build()?)?;
    info!(metadata = ?publisher.metadata(), "Publisher ready");

    let registry = RuleRegistry::from_yaml_str(
        r"
tables:
  customers:
    eventType: customer.changed
    redactFields: [tax_id, phone]
",
    )?;

    let source = MemoryChangeSource::new();
    let mut last = None;
    for id in 1..=5_u64 {
        last = Some(
            source
                .push_json(
                    "customers-0",
                    json!({
                        "table": "customers",
                        "operation": "INSERT",
                        "keys": { "id": id },
                        "after": { "id": id, "name": format!("customer-{id}"), "tax_id": "X-1", "phone": "555" }
                    }),
                )
                .await,
        );
    }

    let checkpoints = MemoryCheckpointStore::new();
    let dead_letters = MemoryDeadLetterStore::new();
    let config = PipelineConfig::builder()
        .partitions(["customers-0"])
        .max_attempts(4)
        .initial_backoff(Duration::from_millis(200))
        .build()?;

    let mut pipeline = Pipeline::new(
        config,
        Arc::new(registry),
        source,
        checkpoints.clone(),
        publisher,
        dead_letters.clone(),
    );
    pipeline.start().await?;

    let partition = PartitionId::new("customers-0");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    while checkpoints.sequence(&partition).await < last {
        if tokio::time::Instant::now() > deadline {
            warn!("Gave up waiting for the checkpoint");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    pipeline.stop().await?;

    for entry in dead_letters.list(None).await? {
        warn!(
            sequence = %entry.sequence_number,
            code = %entry.error.code,
            attempts = entry.attempts,
            message = %entry.error.message,
            "Dead letter"
        );
    }

    let stats = pipeline.stats().await;
    info!(
        published = stats.records_published,
        dead_lettered = stats.records_dead_lettered,
        retries = stats.publish_retries,
        "Done"
    );
    Ok(())
}

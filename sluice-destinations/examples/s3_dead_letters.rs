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


//! S3 Dead-Letter Archive Example
//!
//! Sends a stream containing malformed and unroutable records through the
//! pipeline, archives the resulting dead letters in S3 as gzip-compressed
//! JSON, and lists them back.
//!
//! # Prerequisites
//!
//! ```bash
//! docker run -d -p 4566:4566 localstack/localstack
//! aws --endpoint-url http://localhost:4566 s3 mb s3://sluice-dead-letters
//! ```
//!
//! # Running the Example
//!
//! ```bash
//! cargo run -p sluice-destinations --example s3_dead_letters --features s3,gzip
//! ```

use serde_json::json;
use sluice_core::dead_letter::DeadLetterStore;
use sluice_core::pipeline::{Pipeline, PipelineConfig};
use sluice_core::publisher::MockPublisher;
use sluice_core::record::PartitionId;
use sluice_core::rules::{RuleRegistry, TransformRule};
use sluice_core::source::MemoryChangeSource;
use sluice_destinations::s3::{
    Compression, KeyGenerationStrategy, S3DeadLetterConfig, S3DeadLetterStore,
};
use sluice_stores::memory::MemoryCheckpointStore;
use std::env;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = S3DeadLetterConfig::builder()
        .bucket(env::var("SLUICE_DLQ_BUCKET").unwrap_or_else(|_| "sluice-dead-letters".into()))
        .region("us-east-1")
        .prefix("examples/orders")
        .key_strategy(KeyGenerationStrategy::ByErrorCode)
        .compression(Compression::Gzip)
        .endpoint_url(
            env::var("LOCALSTACK_ENDPOINT").unwrap_or_else(|_| "http://localhost:4566".into()),
        )
        .force_path_style(true)
        .build()?;
    let archive = S3DeadLetterStore::new(config).await?;

    let partition = PartitionId::new("orders-0");
    let source = MemoryChangeSource::new();
    source.push(partition.clone(), b"\x00\x01 binary garbage".to_vec()).await;
    source
        .push_json(
            partition.clone(),
            json!({ "table": "refunds", "operation": "INSERT", "keys": { "id": 1 }, "after": { "id": 1 } }),
        )
        .await;
    let last = source
        .push_json(
            partition.clone(),
            json!({ "table": "orders", "operation": "DELETE", "keys": { "id": 2 } }),
        )
        .await;

    let registry = RuleRegistry::new([("orders", TransformRule::new("order.changed"))])?;
    let checkpoints = MemoryCheckpointStore::new();

    let mut pipeline = Pipeline::new(
        PipelineConfig::builder()
            .partitions([partition.clone()])
            .poll_interval(Duration::from_millis(100))
            .build()?,
        Arc::new(registry),
        source,
        checkpoints.clone(),
        MockPublisher::new(),
        archive.clone(),
    );
    pipeline.start().await?;
    while checkpoints.sequence(&partition).await < Some(last) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    pipeline.stop().await?;

    for entry in archive.list(Some(&partition)).await? {
        info!(
            key = %archive.key_for(&entry),
            code = %entry.error.code,
            message = %entry.error.message,
            "Archived dead letter"
        );
    }

    Ok(())
}

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


//! Prometheus Metrics Exporter Example
//!
//! Exposes sluice pipeline metrics to Prometheus while a synthetic producer
//! keeps feeding two partitions.
//!
//! # Running the Example
//!
//! ```bash
//! cargo run -p sluice-core --example metrics_prometheus
//! ```
//!
//! # Viewing Metrics
//!
//! While the pipeline is running, metrics are exposed at
//! `http://localhost:9000/metrics`:
//! ```bash
//! curl -s http://localhost:9000/metrics | grep sluice_
//! ```
//!
//! # Prometheus Configuration
//!
//! ```yaml
//! scrape_configs:
//!   - job_name: 'sluice'
//!     static_configs:
//!       - targets: ['localhost:9000']
//! ```
//!
//! # Useful Queries
//!
//! ```promql
//! # Published events per second, by table
//! sum by (table) (rate(sluice_records_published_total[1m]))
//!
//! # Dead letters per error code
//! sum by (code) (increase(sluice_dead_letters_total[5m]))
//!
//! # p99 publish latency
//! histogram_quantile(0.99, rate(sluice_publish_duration_seconds_bucket[5m]))
//!
//! # Workers restarted by the supervisor
//! increase(sluice_worker_restarts_total[15m])
//! ```

use metrics_exporter_prometheus::PrometheusBuilder;
use rand::Rng;
use serde_json::json;
use sluice_core::metrics;
use sluice_core::pipeline::{Pipeline, PipelineConfig};
use sluice_core::publisher::{MockPublisher, MockResponse};
use sluice_core::rules::{RuleRegistry, TransformRule};
use sluice_core::source::MemoryChangeSource;
use sluice_stores::memory::{MemoryCheckpointStore, MemoryDeadLetterStore};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

const PARTITIONS: [&str; 2] = ["shard-0", "shard-1"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    metrics::init_metrics();

    let prometheus_addr: SocketAddr = ([0, 0, 0, 0], 9000).into();
    PrometheusBuilder::new()
        .with_http_listener(prometheus_addr)
        .install()?;
    info!(addr = %prometheus_addr, "Prometheus exporter listening");

    let registry = RuleRegistry::new([
        (
            "users",
            TransformRule::new("user.changed").with_redact_fields(["email"]),
        ),
        ("orders", TransformRule::new("order.changed")),
    ])?;

    let source = MemoryChangeSource::new();
    for partition in PARTITIONS {
        source.add_partition(partition).await;
    }

    // Every tenth attempt is rejected by the bus as unavailable.
    let mut script = Vec::new();
    for i in 0..1_000 {
        script.push(if i % 10 == 9 {
            MockResponse::Unavailable
        } else {
            MockResponse::Delay(Duration::from_millis(5))
        });
    }
    let publisher = MockPublisher::new()
        .with_responses(script)
        .with_fallback(MockResponse::Ack);

    let config = PipelineConfig::builder()
        .partitions(PARTITIONS)
        .batch_size(50)
        .poll_interval(Duration::from_millis(100))
        .build()?;

    let mut pipeline = Pipeline::new(
        config,
        Arc::new(registry),
        source.clone(),
        MemoryCheckpointStore::new(),
        publisher,
        MemoryDeadLetterStore::new(),
    );

    let producer = tokio::spawn(produce(source));

    pipeline.start().await?;
    info!("Pipeline running, press Ctrl+C to stop");

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    producer.abort();
    pipeline.stop().await?;

    let stats = pipeline.stats().await;
    info!(
        received = stats.records_received,
        published = stats.records_published,
        dead_lettered = stats.records_dead_lettered,
        retries = stats.publish_retries,
        checkpoints = stats.checkpoints_advanced,
        "Pipeline stopped"
    );

    Ok(())
}

/// Pushes a mix of valid, unroutable and malformed records forever.
async fn produce(source: MemoryChangeSource) {
    let mut id: u64 = 0;
    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    loop {
        ticker.tick().await;
        id += 1;

        let (partition, roll) = {
            let mut rng = rand::thread_rng();
            (PARTITIONS[rng.gen_range(0..PARTITIONS.len())], rng.gen_range(0..100))
        };

        match roll {
            0 => {
                source.push(partition, b"not json".to_vec()).await;
            }
            1..=2 => {
                source
                    .push_json(
                        partition,
                        json!({
                            "table": "sessions",
                            "operation": "INSERT",
                            "keys": { "id": id },
                            "after": { "id": id }
                        }),
                    )
                    .await;
            }
            3..=40 => {
                source
                    .push_json(
                        partition,
                        json!({
                            "table": "orders",
                            "operation": "UPDATE",
                            "keys": { "id": id },
                            "before": { "id": id, "status": "pending" },
                            "after": { "id": id, "status": "paid" }
                        }),
                    )
                    .await;
            }
            _ => {
                source
                    .push_json(
                        partition,
                        json!({
                            "table": "users",
                            "operation": "INSERT",
                            "keys": { "id": id },
                            "after": { "id": id, "email": format!("user{id}@example.com") }
                        }),
                    )
                    .await;
            }
        }
    }
}

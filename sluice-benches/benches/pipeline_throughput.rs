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


//! Pipeline Throughput Benchmarks
//!
//! End-to-end throughput of one pipeline run over a pre-filled in-memory
//! stream: fetch, parse, transform, publish, checkpoint. Publishing goes to a
//! counting publisher so the numbers reflect pipeline overhead.
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench --package sluice-benches --bench pipeline_throughput
//! ```

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use sluice_core::checkpoint::CheckpointStore;
use sluice_core::event::PublishedEvent;
use sluice_core::pipeline::{CheckpointMode, Pipeline, PipelineConfig};
use sluice_core::publisher::{Ack, PublishError, Publisher, PublisherMetadata};
use sluice_core::record::{PartitionId, SequenceNumber};
use sluice_core::rules::{RuleRegistry, TransformRule};
use sluice_core::source::MemoryChangeSource;
use sluice_stores::memory::{MemoryCheckpointStore, MemoryDeadLetterStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Publisher that only counts, with an optional simulated round trip.
#[derive(Clone)]
struct CountingPublisher {
    published: Arc<AtomicUsize>,
    latency: Duration,
}

impl CountingPublisher {
    fn new(latency: Duration) -> Self {
        Self {
            published: Arc::new(AtomicUsize::new(0)),
            latency,
        }
    }
}

#[async_trait]
impl Publisher for CountingPublisher {
    async fn publish(&self, _event: &PublishedEvent) -> Result<Ack, PublishError> {
        if self.latency > Duration::ZERO {
            tokio::time::sleep(self.latency).await;
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(Ack::new())
    }

    fn metadata(&self) -> PublisherMetadata {
        PublisherMetadata::new("Counting", "counting")
    }
}

fn registry() -> Arc<RuleRegistry> {
    Arc::new(
        RuleRegistry::new([(
            "orders",
            TransformRule::new("order.changed").with_redact_fields(["card_number"]),
        )])
        .expect("valid rules"),
    )
}

async fn fill_source(partitions: &[PartitionId], per_partition: usize) -> MemoryChangeSource {
    let source = MemoryChangeSource::new();
    for partition in partitions {
        for i in 0..per_partition {
            source
                .push_json(
                    partition.clone(),
                    json!({
                        "table": "orders",
                        "operation": "INSERT",
                        "keys": { "id": i },
                        "after": { "id": i, "total": i * 3, "card_number": "4111111111111111" }
                    }),
                )
                .await;
        }
    }
    source
}

/// Runs one pipeline until every partition has checkpointed its last record.
async fn run_to_completion(
    partitions: &[PartitionId],
    per_partition: usize,
    batch_size: usize,
    mode: CheckpointMode,
    latency: Duration,
) -> usize {
    let source = fill_source(partitions, per_partition).await;
    let checkpoints = MemoryCheckpointStore::new();
    let publisher = CountingPublisher::new(latency);

    let config = PipelineConfig::builder()
        .partitions(partitions.iter().cloned())
        .batch_size(batch_size)
        .poll_interval(Duration::from_millis(1))
        .checkpoint_mode(mode)
        .build()
        .expect("valid config");

    let mut pipeline = Pipeline::new(
        config,
        registry(),
        source,
        checkpoints.clone(),
        publisher.clone(),
        MemoryDeadLetterStore::new(),
    );
    pipeline.start().await.expect("pipeline starts");

    let last = Some(SequenceNumber::new(per_partition as u128));
    loop {
        let mut done = true;
        for partition in partitions {
            if checkpoints.sequence(partition).await < last {
                done = false;
                break;
            }
        }
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    pipeline.stop().await.expect("pipeline stops");
    publisher.published.load(Ordering::Relaxed)
}

fn partitions(count: usize) -> Vec<PartitionId> {
    (0..count)
        .map(|i| PartitionId::new(format!("bench-{i}")))
        .collect()
}

/// Benchmark: Batch size against a single partition
fn bench_batch_size(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("pipeline_batch_size");
    group.sample_size(20);

    let partitions = partitions(1);
    for batch_size in [10, 100, 500] {
        group.throughput(Throughput::Elements(2000));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.to_async(&runtime).iter(|| {
                    let partitions = &partitions;
                    async move {
                        black_box(
                            run_to_completion(
                                partitions,
                                2000,
                                batch_size,
                                CheckpointMode::PerBatch,
                                Duration::ZERO,
                            )
                            .await,
                        )
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: Per-batch vs. per-record checkpointing
fn bench_checkpoint_mode(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("pipeline_checkpoint_mode");
    group.sample_size(20);
    group.throughput(Throughput::Elements(1000));

    let partitions = partitions(1);
    for (label, mode) in [
        ("per_batch", CheckpointMode::PerBatch),
        ("per_record", CheckpointMode::PerRecord),
    ] {
        group.bench_function(label, |b| {
            b.to_async(&runtime).iter(|| {
                let partitions = &partitions;
                async move {
                    black_box(run_to_completion(partitions, 1000, 100, mode, Duration::ZERO).await)
                }
            });
        });
    }

    group.finish();
}

/// Benchmark: Partition fan-out with a slow publisher
fn bench_partition_parallelism(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("pipeline_partitions");
    group.sample_size(10);

    for count in [1, 4, 16] {
        let partitions = partitions(count);
        group.throughput(Throughput::Elements((count * 50) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &partitions, |b, p| {
            b.to_async(&runtime).iter(|| async move {
                black_box(
                    run_to_completion(
                        p,
                        50,
                        50,
                        CheckpointMode::PerBatch,
                        Duration::from_micros(200),
                    )
                    .await,
                )
            });
        });
    }

    group.finish();
}

/// Benchmark: Conditional checkpoint advance on the in-memory store
fn bench_checkpoint_advance(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("checkpoint_store");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("memory_advance", |b| {
        b.to_async(&runtime).iter(|| async {
            let store = MemoryCheckpointStore::new();
            let partition = PartitionId::new("bench-0");
            for seq in 1..=1000_u64 {
                store
                    .advance(&partition, SequenceNumber::from(seq))
                    .await
                    .expect("monotonic advance");
            }
            black_box(store.len().await)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_batch_size,
    bench_checkpoint_mode,
    bench_partition_parallelism,
    bench_checkpoint_advance
);
criterion_main!(benches);

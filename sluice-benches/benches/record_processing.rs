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


//! Record Processing Benchmarks
//!
//! Measures the per-record CPU path of the pipeline:
//! - parsing raw payloads into change records
//! - applying redaction and inclusion rules
//! - rendering the wire envelope and dedup key
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench --package sluice-benches --bench record_processing
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use sluice_core::parser::parse;
use sluice_core::record::{ChangeRecord, RawRecord, SequenceNumber};
use sluice_core::rules::{RuleRegistry, TransformRule};
use sluice_core::transform::Transformer;
use std::sync::Arc;

/// Raw `users` UPDATE records with `width` columns per image.
fn create_raw_records(count: usize, width: usize) -> Vec<RawRecord> {
    (0..count)
        .map(|i| {
            let mut image = serde_json::Map::new();
            image.insert("id".to_string(), json!(i));
            image.insert("email".to_string(), json!(format!("user{i}@example.com")));
            image.insert("ssn".to_string(), json!("123-45-6789"));
            for col in 0..width {
                image.insert(format!("col_{col}"), json!(format!("value_{i}_{col}")));
            }
            let payload = json!({
                "table": "users",
                "operation": "UPDATE",
                "keys": { "id": i },
                "before": image,
                "after": image,
                "metadata": { "transactionId": format!("txn-{}", i / 10) }
            });
            RawRecord::new(
                "bench-0",
                SequenceNumber::new(i as u128 + 1),
                payload.to_string().into_bytes(),
            )
        })
        .collect()
}

fn parse_all(raw: &[RawRecord]) -> Vec<ChangeRecord> {
    raw.iter().filter_map(|r| parse(r).ok()).collect()
}

fn transformer(include: bool) -> Transformer {
    let mut rule = TransformRule::new("user.changed").with_redact_fields(["email", "ssn"]);
    if include {
        rule = rule.with_include_fields(["id", "col_0", "col_1"]);
    }
    let registry = RuleRegistry::new([("users", rule)]).expect("valid rules");
    Transformer::new(Arc::new(registry))
}

/// Benchmark: Parsing raw payloads of increasing width
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");

    for width in [4, 32, 256] {
        let raw = create_raw_records(1000, width);
        group.throughput(Throughput::Elements(raw.len() as u64));
        group.bench_with_input(BenchmarkId::new("columns", width), &raw, |b, raw| {
            b.iter(|| {
                for record in raw {
                    black_box(parse(record).ok());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark: Rejecting malformed payloads
fn bench_parse_errors(c: &mut Criterion) {
    let raw: Vec<RawRecord> = (0..1000_u64)
        .map(|i| {
            let data = match i % 3 {
                0 => b"not json".to_vec(),
                1 => br#"{"table":"users","operation":"TRUNCATE","keys":{"id":1}}"#.to_vec(),
                _ => br#"{"table":"users","operation":"INSERT","keys":{}}"#.to_vec(),
            };
            RawRecord::new("bench-0", SequenceNumber::from(i + 1), data)
        })
        .collect();

    let mut group = c.benchmark_group("parse_errors");
    group.throughput(Throughput::Elements(raw.len() as u64));
    group.bench_function("mixed", |b| {
        b.iter(|| {
            for record in &raw {
                black_box(parse(record).err());
            }
        });
    });
    group.finish();
}

/// Benchmark: Redaction only vs. redaction plus inclusion
fn bench_transform(c: &mut Criterion) {
    let mut group = c.benchmark_group("transform");

    for width in [4, 32, 256] {
        let records = parse_all(&create_raw_records(1000, width));
        group.throughput(Throughput::Elements(records.len() as u64));

        for (label, include) in [("redact", false), ("redact_include", true)] {
            let transformer = transformer(include);
            group.bench_with_input(BenchmarkId::new(label, width), &records, |b, records| {
                b.iter(|| {
                    for record in records {
                        black_box(transformer.apply(record).ok());
                    }
                });
            });
        }
    }

    group.finish();
}

/// Benchmark: Wire envelope rendering and dedup key
fn bench_wire(c: &mut Criterion) {
    let transformer = transformer(false);
    let events: Vec<_> = parse_all(&create_raw_records(1000, 32))
        .iter()
        .filter_map(|r| transformer.apply(r).ok())
        .collect();

    let mut group = c.benchmark_group("wire");
    group.throughput(Throughput::Elements(events.len() as u64));
    group.bench_function("to_wire_bytes", |b| {
        b.iter(|| {
            for event in &events {
                black_box(event.to_wire_bytes().ok());
            }
        });
    });
    group.bench_function("dedup_key", |b| {
        b.iter(|| {
            for event in &events {
                black_box(event.dedup_key());
            }
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_parse,
    bench_parse_errors,
    bench_transform,
    bench_wire
);
criterion_main!(benches);

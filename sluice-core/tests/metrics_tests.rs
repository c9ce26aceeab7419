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


//! Tests for metrics instrumentation module.

use metrics_exporter_prometheus::PrometheusBuilder;
use sluice_core::dead_letter::ErrorCode;
use sluice_core::metrics::{
    self, FailureReason, PipelineStatus, Timer, BATCH_DURATION_SECONDS, DEAD_LETTERS_TOTAL,
    METRIC_PREFIX, RECORDS_PUBLISHED_TOTAL, RECORDS_RECEIVED_TOTAL, UNREGISTERED_TABLE,
};
use sluice_core::rules::{RuleRegistry, TransformRule};

#[test]
fn test_metric_names() {
    for name in [RECORDS_RECEIVED_TOTAL, RECORDS_PUBLISHED_TOTAL, DEAD_LETTERS_TOTAL] {
        assert!(name.starts_with(METRIC_PREFIX));
        assert!(name.ends_with("_total"));
    }
    assert!(BATCH_DURATION_SECONDS.ends_with("_seconds"));
}

#[test]
fn test_pipeline_status_values() {
    assert_eq!(PipelineStatus::Stopped as u8, 0);
    assert_eq!(PipelineStatus::Running as u8, 1);
    assert_eq!(PipelineStatus::Error as u8, 2);
}

#[test]
fn test_timer() {
    use std::thread;
    use std::time::Duration;

    let recorded = std::sync::Arc::new(std::sync::Mutex::new(None));
    let recorded_clone = recorded.clone();

    {
        let _timer = Timer::new("http", move |duration, label: &str| {
            *recorded_clone.lock().unwrap() = Some((duration, label.to_string()));
        });
        thread::sleep(Duration::from_millis(10));
    }

    let (duration, label) = recorded.lock().unwrap().clone().unwrap();
    assert!(duration.as_millis() >= 10);
    assert_eq!(label, "http");
}

#[test]
fn test_counters_render_with_labels() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    ::metrics::with_local_recorder(&recorder, || {
        metrics::init_metrics();
        metrics::increment_records_published("users", "INSERT");
        metrics::increment_records_published("users", "INSERT");
        metrics::increment_dead_letters(ErrorCode::ValidationError);
        metrics::increment_worker_failures(FailureReason::CheckpointUnavailable);
        metrics::set_pipeline_status(PipelineStatus::Running);
    });

    let rendered = handle.render();
    let line = |name: &str| {
        rendered
            .lines()
            .find(|l| l.starts_with(name) && !l.starts_with('#'))
            .unwrap_or_else(|| panic!("{name} not rendered:\n{rendered}"))
            .to_string()
    };

    let published = line("sluice_records_published_total{");
    assert!(published.contains(r#"table="users""#));
    assert!(published.contains(r#"operation="INSERT""#));
    assert!(published.ends_with(" 2"));

    let dead_letters = line("sluice_dead_letters_total{");
    assert!(dead_letters.contains(r#"error_code="VALIDATION_ERROR""#));
    assert!(dead_letters.ends_with(" 1"));

    let failures = line("sluice_worker_failures_total{");
    assert!(failures.contains(r#"reason="checkpoint_unavailable""#));

    assert!(rendered.contains("sluice_pipeline_status"));
}

#[test]
fn test_unregistered_tables_share_one_label() {
    let registry =
        RuleRegistry::new([("users", TransformRule::new("user.changed"))]).expect("valid rules");
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    ::metrics::with_local_recorder(&recorder, || {
        for table in ["users", "tmp_001", "tmp_002", "tmp_003"] {
            let label = metrics::table_label(&registry, table);
            metrics::increment_records_received(label);
            if label == UNREGISTERED_TABLE {
                metrics::increment_validation_alerts(label);
            }
        }
    });

    let rendered = handle.render();
    assert!(!rendered.contains("tmp_00"), "{rendered}");

    let received: Vec<&str> = rendered
        .lines()
        .filter(|l| l.starts_with("sluice_records_received_total{"))
        .collect();
    assert_eq!(received.len(), 2, "{rendered}");
    assert!(received
        .iter()
        .any(|l| l.contains(r#"table="users""#) && l.ends_with(" 1")));
    assert!(received
        .iter()
        .any(|l| l.contains(r#"table="unregistered""#) && l.ends_with(" 3")));

    let alerts = rendered
        .lines()
        .find(|l| l.starts_with("sluice_validation_alerts_total{"))
        .expect("alerts rendered");
    assert!(alerts.ends_with(" 3"));
}

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


#![cfg(feature = "redis-store")]

use chrono::Utc;
use sluice_core::checkpoint::{CheckpointError, CheckpointStore};
use sluice_core::dead_letter::{DeadLetterEntry, DeadLetterStore, ErrorCode, FailureInfo};
use sluice_core::record::{PartitionId, SequenceNumber};
use sluice_stores::redis::{RedisCheckpointStore, RedisConfig, RedisDeadLetterStore};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::Redis;

/// Starts a Redis container and returns it with its connection config.
async fn start_redis() -> (ContainerAsync<Redis>, RedisConfig) {
    let container = Redis::default()
        .start()
        .await
        .expect("failed to start Redis container");

    let host_port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("failed to get port");

    let config = RedisConfig::builder()
        .url(format!("redis://127.0.0.1:{host_port}"))
        .pool_size(5)
        .build()
        .expect("valid config");

    (container, config)
}

fn entry(partition: &str, sequence: u64, code: ErrorCode) -> DeadLetterEntry {
    DeadLetterEntry {
        partition_id: PartitionId::new(partition),
        sequence_number: SequenceNumber::from(sequence),
        original_event: serde_json::json!({ "table": "users", "keys": { "id": "u1" } }),
        error: FailureInfo {
            code,
            message: "downstream rejected the event".to_string(),
        },
        attempts: 3,
        last_attempt: Utc::now(),
    }
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_redis_advance_and_get() {
    let (_container, config) = start_redis().await;
    let store = RedisCheckpointStore::new(config).await.expect("store");
    let partition = PartitionId::new("shard-0");

    assert!(store.get(&partition).await.unwrap().is_none());

    store
        .advance(&partition, SequenceNumber::new(41))
        .await
        .expect("advance");
    store
        .advance(&partition, SequenceNumber::new(42))
        .await
        .expect("advance");

    let checkpoint = store.get(&partition).await.unwrap().expect("checkpoint");
    assert_eq!(checkpoint.last_processed_sequence, SequenceNumber::new(42));

    store.close().await.expect("close");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_redis_advance_rejects_stale_sequence() {
    let (_container, config) = start_redis().await;
    let store = RedisCheckpointStore::new(config).await.expect("store");
    let partition = PartitionId::new("shard-0");

    store.advance(&partition, SequenceNumber::new(100)).await.unwrap();

    // 99 would sort after 100 as an unpadded string
    let err = store
        .advance(&partition, SequenceNumber::new(99))
        .await
        .unwrap_err();
    match err {
        CheckpointError::Conflict { current, .. } => {
            assert_eq!(current, SequenceNumber::new(100));
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    assert!(store
        .advance(&partition, SequenceNumber::new(100))
        .await
        .unwrap_err()
        .is_conflict());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_redis_concurrent_advances_keep_maximum() {
    let (_container, config) = start_redis().await;
    let store = RedisCheckpointStore::new(config).await.expect("store");
    let partition = PartitionId::new("shard-0");

    let mut handles = vec![];
    for i in 1..=40_u64 {
        let store = store.clone();
        let partition = partition.clone();
        handles.push(tokio::spawn(async move {
            let _ = store.advance(&partition, SequenceNumber::from(i)).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let checkpoint = store.get(&partition).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_processed_sequence, SequenceNumber::new(40));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_redis_list_and_delete_checkpoints() {
    let (_container, config) = start_redis().await;
    let store = RedisCheckpointStore::new(config).await.expect("store");

    for (partition, seq) in [("a", 1_u64), ("b", 2), ("c", 3)] {
        store
            .advance(&PartitionId::new(partition), SequenceNumber::from(seq))
            .await
            .unwrap();
    }

    let listed = store.list().await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|c| c.partition_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    store.delete(&PartitionId::new("b")).await.unwrap();
    assert_eq!(store.list().await.unwrap().len(), 2);
    assert!(store.get(&PartitionId::new("b")).await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_redis_dead_letter_store_and_counts() {
    let (_container, config) = start_redis().await;
    let store = RedisDeadLetterStore::new(config).await.expect("store");

    store.store(&entry("a", 1, ErrorCode::ParseError)).await.unwrap();
    store.store(&entry("a", 2, ErrorCode::PublishError)).await.unwrap();
    store.store(&entry("b", 7, ErrorCode::PublishError)).await.unwrap();

    let only_a = store.list(Some(&PartitionId::new("a"))).await.unwrap();
    assert_eq!(only_a.len(), 2);
    assert_eq!(only_a[0].sequence_number, SequenceNumber::new(1));
    assert_eq!(only_a[1].error.code, ErrorCode::PublishError);

    assert_eq!(store.list(None).await.unwrap().len(), 3);

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.parse_error, 1);
    assert_eq!(counts.publish_error, 2);
    assert_eq!(counts.total(), 3);

    store.close().await.unwrap();
}

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


//! HTTP publisher tests against an in-process HTTP/1.1 server.
//!
//! The server answers each connection with the next scripted response and
//! records what it received, so status classification, headers and the
//! pipeline's retry loop can be checked without external services.

#![cfg(feature = "http")]

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use sluice_core::event::PublishedEvent;
use sluice_core::pipeline::{Pipeline, PipelineConfig};
use sluice_core::publisher::{PublishError, Publisher};
use sluice_core::record::{Fields, Operation, PartitionId, SequenceNumber};
use sluice_core::rules::{RuleRegistry, TransformRule};
use sluice_core::source::MemoryChangeSource;
use sluice_destinations::http::{HttpPublisher, HttpPublisherConfig};
use sluice_stores::memory::{MemoryCheckpointStore, MemoryDeadLetterStore};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
struct CapturedRequest {
    request_line: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl CapturedRequest {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl TestServer {
    /// Serves `responses` in order, one per connection; once exhausted every
    /// further request gets 200.
    async fn start(responses: Vec<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let captured = requests.clone();

        tokio::spawn(async move {
            let mut script = responses.into_iter();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let response = script.next().unwrap_or_else(|| ok(None));
                let captured = captured.clone();
                tokio::spawn(async move {
                    handle(stream, response, captured).await;
                });
            }
        });

        Self { addr, requests }
    }

    fn endpoint(&self) -> String {
        format!("http://{}/v1/events", self.addr)
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn handle(
    mut stream: TcpStream,
    response: String,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default().to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    captured.lock().unwrap().push(CapturedRequest {
        request_line,
        headers,
        body: buf[header_end..].to_vec(),
    });

    if response.is_empty() {
        // Hold the connection open without answering.
        tokio::time::sleep(Duration::from_secs(30)).await;
        return;
    }
    stream.write_all(response.as_bytes()).await.unwrap();
    let _ = stream.shutdown().await;
}

fn reply(status: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!("HTTP/1.1 {status}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    ));
    out
}

fn ok(message_id: Option<&str>) -> String {
    match message_id {
        Some(id) => reply("200 OK", &[("X-Message-Id", id)], ""),
        None => reply("200 OK", &[], ""),
    }
}

fn event(sequence: u128) -> PublishedEvent {
    let mut keys = Fields::new();
    keys.insert("id".to_string(), json!(42));
    let mut after = Fields::new();
    after.insert("id".to_string(), json!(42));
    after.insert("status".to_string(), json!("paid"));

    PublishedEvent {
        event_type: "order.changed".to_string(),
        table: "orders".to_string(),
        operation: Operation::Update,
        keys,
        before: None,
        after: Some(after),
        sequence_number: SequenceNumber::new(sequence),
        transaction_id: Some("txn-9".to_string()),
        emitted_at: Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap(),
    }
}

fn publisher(server: &TestServer) -> HttpPublisher {
    let config = HttpPublisherConfig::builder()
        .endpoint(server.endpoint())
        .timeout(Duration::from_millis(500))
        .header("X-Source", "sluice-test")
        .bearer_token("s3cr3t")
        .build()
        .unwrap();
    HttpPublisher::new(config).unwrap()
}

#[tokio::test]
async fn test_posts_wire_envelope_with_headers() {
    let server = TestServer::start(vec![ok(Some("msg-1"))]).await;
    let publisher = publisher(&server);
    let event = event(7);

    let ack = publisher.publish(&event).await.unwrap();
    assert_eq!(ack.message_id.as_deref(), Some("msg-1"));

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.request_line, "POST /v1/events HTTP/1.1");
    assert_eq!(request.headers["content-type"], "application/json");
    assert_eq!(request.headers["authorization"], "Bearer s3cr3t");
    assert_eq!(request.headers["x-source"], "sluice-test");
    assert_eq!(request.headers["idempotency-key"], event.dedup_key());
    assert!(request.headers["user-agent"].starts_with("sluice/"));
    assert_eq!(request.json(), event.to_wire_value().unwrap());
}

#[tokio::test]
async fn test_throttling_carries_retry_after() {
    let server = TestServer::start(vec![reply(
        "429 Too Many Requests",
        &[("Retry-After", "3")],
        "slow down",
    )])
    .await;

    let err = publisher(&server).publish(&event(1)).await.unwrap_err();
    assert!(matches!(err, PublishError::Throttled { .. }));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_status_classification() {
    let server = TestServer::start(vec![
        reply("500 Internal Server Error", &[], ""),
        reply("401 Unauthorized", &[], ""),
        reply("404 Not Found", &[], ""),
        reply("400 Bad Request", &[], "{\"error\":\"bad envelope\"}"),
    ])
    .await;
    let publisher = publisher(&server);

    let categories: Vec<&str> = {
        let mut out = Vec::new();
        for seq in 1..=4 {
            out.push(publisher.publish(&event(seq)).await.unwrap_err().category());
        }
        out
    };

    assert_eq!(
        categories,
        vec!["unavailable", "unauthorized", "invalid_destination", "rejected"]
    );
}

#[tokio::test]
async fn test_no_response_is_timeout() {
    let server = TestServer::start(vec![String::new()]).await;

    let err = publisher(&server).publish(&event(1)).await.unwrap_err();
    assert!(matches!(err, PublishError::Timeout(_)), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_connection_refused_is_retryable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = HttpPublisherConfig::builder()
        .endpoint(format!("http://{addr}/events"))
        .build()
        .unwrap();
    let err = HttpPublisher::new(config)
        .unwrap()
        .publish(&event(1))
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Unavailable { .. }), "{err:?}");
}

#[tokio::test]
async fn test_oversized_event_rejected_locally() {
    let server = TestServer::start(vec![]).await;
    let config = HttpPublisherConfig::builder()
        .endpoint(server.endpoint())
        .max_event_bytes(16)
        .build()
        .unwrap();

    let err = HttpPublisher::new(config)
        .unwrap()
        .publish(&event(1))
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Rejected { status: Some(413), .. }));
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn test_pipeline_retries_through_http_throttling() {
    let server = TestServer::start(vec![
        reply("429 Too Many Requests", &[("Retry-After", "0")], ""),
        reply("503 Service Unavailable", &[], ""),
    ])
    .await;

    let registry = RuleRegistry::new([(
        "users",
        TransformRule::new("user.changed").with_redact_fields(["email"]),
    )])
    .unwrap();

    let partition = PartitionId::new("shard-0");
    let source = MemoryChangeSource::new();
    let last = source
        .push_json(
            partition.clone(),
            json!({
                "table": "users",
                "operation": "INSERT",
                "keys": { "id": 1 },
                "after": { "id": 1, "email": "ada@example.com" }
            }),
        )
        .await;

    let checkpoints = MemoryCheckpointStore::new();
    let dead_letters = MemoryDeadLetterStore::new();
    let config = PipelineConfig::builder()
        .partitions([partition.clone()])
        .poll_interval(Duration::from_millis(10))
        .initial_backoff(Duration::from_millis(1))
        .backoff_jitter(0.0)
        .build()
        .unwrap();

    let mut pipeline = Pipeline::new(
        config,
        Arc::new(registry),
        source,
        checkpoints.clone(),
        publisher(&server),
        dead_letters.clone(),
    );
    pipeline.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while checkpoints.sequence(&partition).await < Some(last) {
        assert!(tokio::time::Instant::now() < deadline, "checkpoint never advanced");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pipeline.stop().await.unwrap();

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.windows(2).all(|w| w[0].body == w[1].body
        && w[0].headers["idempotency-key"] == w[1].headers["idempotency-key"]));
    let after = &requests[2].json()["detail"]["after"];
    assert_eq!(after["id"], 1);
    assert!(after.get("email").is_none());

    let stats = pipeline.stats().await;
    assert_eq!(stats.records_published, 1);
    assert_eq!(stats.publish_retries, 2);
    assert!(dead_letters.is_empty().await);
}

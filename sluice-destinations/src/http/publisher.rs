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


//! HTTP publisher implementation.

use crate::http::config::HttpPublisherConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use sluice_core::event::PublishedEvent;
use sluice_core::publisher::{Ack, PublishError, Publisher, PublisherMetadata};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Response header carrying the bus-assigned message id.
pub const MESSAGE_ID_HEADER: &str = "x-message-id";

/// Longest response body excerpt kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Publishes events by POSTing their wire envelope to an HTTP endpoint.
///
/// One instance is shared by every partition worker; the underlying
/// [`reqwest::Client`] pools connections.
///
/// # Response classification
///
/// | Response | Outcome |
/// |---|---|
/// | 2xx | `Ack` |
/// | 429 | `Throttled`, honouring `Retry-After` |
/// | 503 with `Retry-After` | `Throttled` |
/// | 408, 5xx, connect failure | `Unavailable` (retryable) |
/// | no response in time | `Timeout` (retryable) |
/// | 401, 403 | `Unauthorized` |
/// | 404 | `InvalidDestination` |
/// | other 4xx | `Rejected` |
#[derive(Debug, Clone)]
pub struct HttpPublisher {
    client: Client,
    config: HttpPublisherConfig,
}

impl HttpPublisher {
    /// Creates a publisher.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::InvalidDestination`] if the HTTP client cannot
    /// be built from the configuration.
    pub fn new(config: HttpPublisherConfig) -> Result<Self, PublishError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PublishError::invalid_destination(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| PublishError::invalid_destination(e.to_string()))?;
            headers.insert(name, value);
        }
        if let Some(token) = &config.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| PublishError::invalid_destination(e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| PublishError::invalid_destination(e.to_string()))?;

        info!(
            endpoint = %redacted_endpoint(&config.endpoint),
            timeout = ?config.timeout,
            "HTTP publisher initialized"
        );

        Ok(Self { client, config })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &HttpPublisherConfig {
        &self.config
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, event: &PublishedEvent) -> Result<Ack, PublishError> {
        let body = event
            .to_wire_bytes()
            .map_err(|e| PublishError::serialization(e, "failed to encode wire envelope"))?;

        if let Some(max) = self.config.max_event_bytes {
            if body.len() > max {
                return Err(PublishError::rejected(
                    format!("event is {} bytes, endpoint accepts {max}", body.len()),
                    Some(StatusCode::PAYLOAD_TOO_LARGE.as_u16()),
                ));
            }
        }

        let mut request = self
            .client
            .post(self.config.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(name) = &self.config.idempotency_header {
            request = request.header(name.as_str(), idempotency_value(&event.dedup_key()));
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport_error(e, self.config.timeout))?;

        let status = response.status();
        if status.is_success() {
            let message_id = response
                .headers()
                .get(MESSAGE_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            debug!(
                table = %event.table,
                sequence = %event.sequence_number,
                status = status.as_u16(),
                "Event accepted"
            );
            return Ok(match message_id {
                Some(id) => Ack::new().with_message_id(id),
                None => Ack::new(),
            });
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        let text = response.text().await.unwrap_or_default();

        let error = classify_status(status, retry_after, &text);
        warn!(
            table = %event.table,
            sequence = %event.sequence_number,
            status = status.as_u16(),
            retryable = error.is_retryable(),
            "Event not accepted"
        );
        Err(error)
    }

    fn metadata(&self) -> PublisherMetadata {
        let metadata = PublisherMetadata::new("HTTP", "http")
            .with_idempotency_key(self.config.idempotency_header.is_some())
            .with_property("endpoint", redacted_endpoint(&self.config.endpoint));
        match self.config.max_event_bytes {
            Some(bytes) => metadata.with_max_event_bytes(bytes),
            None => metadata,
        }
    }
}

/// Classifies a non-success response.
#[must_use]
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> PublishError {
    let message = if body.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", truncate(body.trim(), MAX_ERROR_BODY))
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => PublishError::throttled(message, retry_after),
        StatusCode::SERVICE_UNAVAILABLE if retry_after.is_some() => {
            PublishError::throttled(message, retry_after)
        }
        StatusCode::REQUEST_TIMEOUT => PublishError::unavailable_msg(message),
        s if s.is_server_error() => PublishError::unavailable_msg(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PublishError::unauthorized(message),
        StatusCode::NOT_FOUND => PublishError::invalid_destination(message),
        s if s.is_client_error() => PublishError::rejected(message, Some(s.as_u16())),
        _ => PublishError::other(message, false),
    }
}

/// Parses a `Retry-After` value: delay-seconds or an HTTP-date.
///
/// Dates in the past yield a zero delay.
#[must_use]
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        date.with_timezone(&Utc)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

fn classify_transport_error(error: reqwest::Error, timeout: Duration) -> PublishError {
    if error.is_timeout() {
        PublishError::Timeout(timeout)
    } else if error.is_builder() {
        PublishError::invalid_destination(error.to_string())
    } else {
        // Covers connect failures and connections dropped mid-response: the
        // bus may or may not have received the event.
        PublishError::unavailable(error)
    }
}

/// Percent-encodes bytes that are not visible ASCII so any dedup key is a
/// valid header value.
fn idempotency_value(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if (0x20..0x7f).contains(&byte) && byte != b'%' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn redacted_endpoint(url: &reqwest::Url) -> String {
    format!(
        "{}://{}{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.port().map(|p| format!(":{p}")).unwrap_or_default()
    ) + url.path()
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_throttling_statuses() {
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(2)),
            "slow down",
        );
        assert!(matches!(err, PublishError::Throttled { .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert!(err.to_string().contains("slow down"));

        let err = classify_status(
            StatusCode::SERVICE_UNAVAILABLE,
            Some(Duration::from_secs(5)),
            "",
        );
        assert!(matches!(err, PublishError::Throttled { .. }));
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            let err = classify_status(status, None, "");
            assert!(
                matches!(err, PublishError::Unavailable { .. }),
                "{status}: {err:?}"
            );
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn test_terminal_statuses() {
        let cases = [
            (StatusCode::UNAUTHORIZED, "unauthorized"),
            (StatusCode::FORBIDDEN, "unauthorized"),
            (StatusCode::NOT_FOUND, "invalid_destination"),
            (StatusCode::BAD_REQUEST, "rejected"),
            (StatusCode::PAYLOAD_TOO_LARGE, "rejected"),
            (StatusCode::UNPROCESSABLE_ENTITY, "rejected"),
        ];
        for (status, category) in cases {
            let err = classify_status(status, None, "{\"error\":\"nope\"}");
            assert_eq!(err.category(), category, "{status}");
            assert!(!err.is_retryable(), "{status}");
        }

        match classify_status(StatusCode::BAD_REQUEST, None, "") {
            PublishError::Rejected { status, .. } => assert_eq!(status, Some(400)),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn test_error_body_truncated() {
        let body = "é".repeat(MAX_ERROR_BODY);
        let err = classify_status(StatusCode::BAD_REQUEST, None, &body);
        assert!(err.to_string().len() < body.len());
    }

    #[test]
    fn test_parse_retry_after() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();

        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 0 ", now), Some(Duration::ZERO));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_idempotency_value_is_header_safe() {
        let value = idempotency_value("users|{\"id\":\"zoë\"}|42");
        assert_eq!(value, "users|{\"id\":\"zo%C3%AB\"}|42");
        assert!(HeaderValue::from_str(&value).is_ok());
        assert_eq!(idempotency_value("a%b\n"), "a%25b%0A");
    }

    #[test]
    fn test_redacted_endpoint_drops_credentials_and_query() {
        let url = reqwest::Url::parse("https://user:pw@bus.internal:8443/v1/events?token=x")
            .unwrap();
        assert_eq!(redacted_endpoint(&url), "https://bus.internal:8443/v1/events");
    }
}

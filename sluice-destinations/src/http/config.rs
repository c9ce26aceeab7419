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


//! HTTP publisher configuration.

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use sluice_core::pipeline::ConfigError;
use std::fmt;
use std::time::Duration;

/// Default bound on one request, including reading the response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Header carrying [`PublishedEvent::dedup_key`](sluice_core::event::PublishedEvent::dedup_key).
pub const DEFAULT_IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Configuration for [`HttpPublisher`](crate::http::HttpPublisher).
///
/// # Examples
///
/// ```rust
/// use sluice_destinations::http::HttpPublisherConfig;
/// use std::time::Duration;
///
/// let config = HttpPublisherConfig::builder()
///     .endpoint("https://bus.internal/v1/events")
///     .timeout(Duration::from_secs(3))
///     .header("X-Source", "sluice")
///     .bearer_token("secret")
///     .build()
///     .unwrap();
///
/// assert_eq!(config.idempotency_header.as_deref(), Some("Idempotency-Key"));
/// assert!(!format!("{config:?}").contains("secret"));
/// ```
#[derive(Clone)]
pub struct HttpPublisherConfig {
    /// Ingestion endpoint; every event is POSTed here.
    pub endpoint: Url,

    /// Per-request timeout.
    pub timeout: Duration,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Static headers sent with every request.
    pub headers: Vec<(String, String)>,

    /// Bearer token for the `Authorization` header.
    pub bearer_token: Option<String>,

    /// Header the dedup key is sent in; `None` disables it.
    pub idempotency_header: Option<String>,

    /// Largest payload the endpoint accepts, if it enforces one.
    pub max_event_bytes: Option<usize>,

    /// `User-Agent` header value.
    pub user_agent: String,
}

impl fmt::Debug for HttpPublisherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpPublisherConfig")
            .field("endpoint", &self.endpoint.as_str())
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("headers", &self.headers)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "***"))
            .field("idempotency_header", &self.idempotency_header)
            .field("max_event_bytes", &self.max_event_bytes)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl HttpPublisherConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> HttpPublisherConfigBuilder {
        HttpPublisherConfigBuilder::default()
    }
}

/// Builder for [`HttpPublisherConfig`].
#[derive(Debug, Default)]
pub struct HttpPublisherConfigBuilder {
    endpoint: Option<String>,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    headers: Vec<(String, String)>,
    bearer_token: Option<String>,
    idempotency_header: Option<Option<String>>,
    max_event_bytes: Option<usize>,
    user_agent: Option<String>,
}

impl HttpPublisherConfigBuilder {
    /// Sets the ingestion endpoint (required, `http` or `https`).
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the per-request timeout. Zero keeps the default.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the connection timeout. Zero keeps the default.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Adds a static header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Sets the idempotency header name, or disables it with `None`.
    #[must_use]
    pub fn idempotency_header(mut self, name: Option<&str>) -> Self {
        self.idempotency_header = Some(name.map(str::to_string));
        self
    }

    /// Sets the endpoint's payload ceiling.
    #[must_use]
    pub fn max_event_bytes(mut self, bytes: usize) -> Self {
        self.max_event_bytes = Some(bytes);
        self
    }

    /// Overrides the `User-Agent` header.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// - `endpoint` is required and must be an absolute `http(s)` URL
    /// - header names and values must be valid HTTP tokens
    /// - `bearer_token` must not be empty
    /// - `max_event_bytes` must be greater than 0
    pub fn build(self) -> Result<HttpPublisherConfig, ConfigError> {
        let raw = self
            .endpoint
            .ok_or(ConfigError::Missing { field: "endpoint" })?;
        let endpoint =
            Url::parse(&raw).map_err(|e| ConfigError::invalid("endpoint", e.to_string()))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "endpoint",
                format!("unsupported scheme '{}'", endpoint.scheme()),
            ));
        }

        for (name, value) in &self.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::invalid("headers", format!("invalid name '{name}'")))?;
            HeaderValue::from_str(value)
                .map_err(|_| ConfigError::invalid("headers", format!("invalid value for '{name}'")))?;
        }

        if let Some(token) = &self.bearer_token {
            if token.trim().is_empty() {
                return Err(ConfigError::invalid("bearer_token", "must not be empty"));
            }
        }

        let idempotency_header = self
            .idempotency_header
            .unwrap_or_else(|| Some(DEFAULT_IDEMPOTENCY_HEADER.to_string()));
        if let Some(name) = &idempotency_header {
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                ConfigError::invalid("idempotency_header", format!("invalid name '{name}'"))
            })?;
        }

        if self.max_event_bytes == Some(0) {
            return Err(ConfigError::invalid(
                "max_event_bytes",
                "must be greater than 0",
            ));
        }

        Ok(HttpPublisherConfig {
            endpoint,
            timeout: non_zero_or(self.timeout, DEFAULT_TIMEOUT),
            connect_timeout: non_zero_or(self.connect_timeout, DEFAULT_CONNECT_TIMEOUT),
            headers: self.headers,
            bearer_token: self.bearer_token,
            idempotency_header,
            max_event_bytes: self.max_event_bytes,
            user_agent: self
                .user_agent
                .unwrap_or_else(|| format!("sluice/{}", env!("CARGO_PKG_VERSION"))),
        })
    }
}

fn non_zero_or(value: Option<Duration>, default: Duration) -> Duration {
    match value {
        Some(d) if !d.is_zero() => d,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HttpPublisherConfig::builder()
            .endpoint("http://localhost:8080/events")
            .timeout(Duration::ZERO)
            .build()
            .unwrap();

        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(
            config.idempotency_header.as_deref(),
            Some(DEFAULT_IDEMPOTENCY_HEADER)
        );
        assert!(config.user_agent.starts_with("sluice/"));
        assert!(config.bearer_token.is_none());
    }

    #[test]
    fn test_missing_endpoint() {
        let err = HttpPublisherConfig::builder().build().unwrap_err();
        assert_eq!(err, ConfigError::Missing { field: "endpoint" });
    }

    #[test]
    fn test_rejects_non_http_endpoint() {
        for endpoint in ["ftp://bus/events", "not a url"] {
            let err = HttpPublisherConfig::builder()
                .endpoint(endpoint)
                .build()
                .unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { field: "endpoint", .. }),
                "{endpoint}: {err:?}"
            );
        }
    }

    #[test]
    fn test_rejects_bad_header() {
        let err = HttpPublisherConfig::builder()
            .endpoint("https://bus/events")
            .header("bad header", "x")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "headers", .. }));

        let err = HttpPublisherConfig::builder()
            .endpoint("https://bus/events")
            .header("X-Ok", "line\nbreak")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "headers", .. }));
    }

    #[test]
    fn test_idempotency_header_disabled() {
        let config = HttpPublisherConfig::builder()
            .endpoint("https://bus/events")
            .idempotency_header(None)
            .build()
            .unwrap();
        assert!(config.idempotency_header.is_none());
    }

    #[test]
    fn test_empty_token_and_zero_ceiling_rejected() {
        assert!(HttpPublisherConfig::builder()
            .endpoint("https://bus/events")
            .bearer_token(" ")
            .build()
            .is_err());
        assert!(HttpPublisherConfig::builder()
            .endpoint("https://bus/events")
            .max_event_bytes(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = HttpPublisherConfig::builder()
            .endpoint("https://bus/events")
            .bearer_token("hunter2")
            .build()
            .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }
}

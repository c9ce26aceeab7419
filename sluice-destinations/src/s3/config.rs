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


//! S3 dead-letter archive configuration.

use crate::s3::key_gen::KeyGenerationStrategy;
use sluice_core::pipeline::ConfigError;

/// Default key prefix for archived entries.
pub const DEFAULT_PREFIX: &str = "dead-letters";

/// Compression algorithm for archived entries.
///
/// Dead-letter entries carry the full original record, so large payloads
/// compress well. Compression is applied per object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression.
    #[default]
    None,

    /// Gzip compression (RFC 1952), level 6.
    ///
    /// File extension: `.gz`
    #[cfg(feature = "gzip")]
    Gzip,

    /// Zstandard compression, level 3.
    ///
    /// File extension: `.zst`
    #[cfg(feature = "zstandard")]
    Zstd,
}

impl Compression {
    /// Returns the file extension suffix for this compression (with the dot).
    ///
    /// Appended to `.json`, e.g. `00000000000000000000000000000000000000042.json.gz`.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            #[cfg(feature = "gzip")]
            Self::Gzip => ".gz",
            #[cfg(feature = "zstandard")]
            Self::Zstd => ".zst",
        }
    }

    /// Returns the Content-Encoding header value.
    #[must_use]
    pub const fn encoding(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            #[cfg(feature = "gzip")]
            Self::Gzip => Some("gzip"),
            #[cfg(feature = "zstandard")]
            Self::Zstd => Some("zstd"),
        }
    }

    /// Infers the compression of an archived object from its key.
    ///
    /// Returns `None` for suffixes whose feature is not compiled in.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        if key.ends_with(".json") {
            return Some(Self::None);
        }
        #[cfg(feature = "gzip")]
        if key.ends_with(".json.gz") {
            return Some(Self::Gzip);
        }
        #[cfg(feature = "zstandard")]
        if key.ends_with(".json.zst") {
            return Some(Self::Zstd);
        }
        None
    }

    /// Short name used in logs and publisher metadata.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            #[cfg(feature = "gzip")]
            Self::Gzip => "gzip",
            #[cfg(feature = "zstandard")]
            Self::Zstd => "zstd",
        }
    }
}

/// Configuration for [`S3DeadLetterStore`](crate::s3::S3DeadLetterStore).
///
/// # Examples
///
/// ```rust
/// use sluice_destinations::s3::{KeyGenerationStrategy, S3DeadLetterConfig};
///
/// let config = S3DeadLetterConfig::builder()
///     .bucket("ops-dead-letters")
///     .region("eu-west-1")
///     .prefix("cdc/orders")
///     .key_strategy(KeyGenerationStrategy::ByPartition)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.prefix, "cdc/orders");
/// ```
#[derive(Debug, Clone)]
pub struct S3DeadLetterConfig {
    /// S3 bucket name (required).
    pub bucket: String,

    /// AWS region (required).
    pub region: String,

    /// Key prefix (default: `dead-letters`). Leading and trailing slashes are
    /// stripped.
    pub prefix: String,

    /// Compression algorithm (default: None).
    pub compression: Compression,

    /// Key layout (default: [`KeyGenerationStrategy::ByErrorCode`]).
    pub key_strategy: KeyGenerationStrategy,

    /// Maximum attempts for each S3 operation, handled by the SDK (default: 3).
    pub max_retries: u32,

    /// Custom endpoint URL for S3-compatible storage (MinIO, LocalStack).
    pub endpoint_url: Option<String>,

    /// Whether to use path-style addressing (required for LocalStack, MinIO).
    pub force_path_style: bool,
}

impl S3DeadLetterConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> S3DeadLetterConfigBuilder {
        S3DeadLetterConfigBuilder::default()
    }
}

/// Builder for [`S3DeadLetterConfig`].
#[derive(Debug, Default)]
pub struct S3DeadLetterConfigBuilder {
    bucket: Option<String>,
    region: Option<String>,
    prefix: Option<String>,
    compression: Option<Compression>,
    key_strategy: Option<KeyGenerationStrategy>,
    max_retries: Option<u32>,
    endpoint_url: Option<String>,
    force_path_style: Option<bool>,
}

impl S3DeadLetterConfigBuilder {
    /// Sets the S3 bucket name (required).
    #[must_use]
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Sets the AWS region (required).
    #[must_use]
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Sets the key prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Sets the compression algorithm.
    #[must_use]
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    /// Sets the key layout.
    #[must_use]
    pub fn key_strategy(mut self, strategy: KeyGenerationStrategy) -> Self {
        self.key_strategy = Some(strategy);
        self
    }

    /// Sets the maximum attempts per S3 operation.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets a custom S3 endpoint URL.
    ///
    /// ```rust,ignore
    /// // LocalStack
    /// builder.endpoint_url("http://localhost:4566")
    /// ```
    #[must_use]
    pub fn endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Forces path-style addressing.
    #[must_use]
    pub fn force_path_style(mut self, force: bool) -> Self {
        self.force_path_style = Some(force);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// - `bucket` is required and must not be empty
    /// - `region` is required and must not be empty
    /// - `max_retries` must be at least 1
    pub fn build(self) -> Result<S3DeadLetterConfig, ConfigError> {
        let bucket = self.bucket.ok_or(ConfigError::Missing { field: "bucket" })?;
        if bucket.trim().is_empty() {
            return Err(ConfigError::invalid("bucket", "must not be empty"));
        }

        let region = self.region.ok_or(ConfigError::Missing { field: "region" })?;
        if region.trim().is_empty() {
            return Err(ConfigError::invalid("region", "must not be empty"));
        }

        let max_retries = self.max_retries.unwrap_or(3);
        if max_retries == 0 {
            return Err(ConfigError::invalid("max_retries", "must be at least 1"));
        }

        let prefix = self
            .prefix
            .as_deref()
            .unwrap_or(DEFAULT_PREFIX)
            .trim_matches('/')
            .to_string();

        Ok(S3DeadLetterConfig {
            bucket,
            region,
            prefix,
            compression: self.compression.unwrap_or_default(),
            key_strategy: self.key_strategy.unwrap_or_default(),
            max_retries,
            endpoint_url: self.endpoint_url,
            force_path_style: self.force_path_style.unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = S3DeadLetterConfig::builder()
            .bucket("dlq")
            .region("us-east-1")
            .build()
            .unwrap();

        assert_eq!(config.prefix, DEFAULT_PREFIX);
        assert_eq!(config.compression, Compression::None);
        assert_eq!(config.key_strategy, KeyGenerationStrategy::ByErrorCode);
        assert_eq!(config.max_retries, 3);
        assert!(config.endpoint_url.is_none());
        assert!(!config.force_path_style);
    }

    #[test]
    fn test_prefix_slashes_trimmed() {
        let config = S3DeadLetterConfig::builder()
            .bucket("dlq")
            .region("us-east-1")
            .prefix("/cdc/orders/")
            .build()
            .unwrap();

        assert_eq!(config.prefix, "cdc/orders");
    }

    #[test]
    fn test_missing_bucket() {
        let err = S3DeadLetterConfig::builder()
            .region("us-east-1")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing { field: "bucket" });
    }

    #[test]
    fn test_empty_region() {
        let err = S3DeadLetterConfig::builder()
            .bucket("dlq")
            .region("  ")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "region", .. }));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let err = S3DeadLetterConfig::builder()
            .bucket("dlq")
            .region("us-east-1")
            .max_retries(0)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "max_retries",
                ..
            }
        ));
    }

    #[test]
    fn test_compression_from_key() {
        assert_eq!(Compression::from_key("a/b/1.json"), Some(Compression::None));
        assert_eq!(Compression::from_key("a/b/1.txt"), None);
        #[cfg(feature = "gzip")]
        assert_eq!(Compression::from_key("a/1.json.gz"), Some(Compression::Gzip));
        #[cfg(feature = "zstandard")]
        assert_eq!(Compression::from_key("a/1.json.zst"), Some(Compression::Zstd));
    }
}

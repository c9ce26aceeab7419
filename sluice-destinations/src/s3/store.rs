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


//! S3 dead-letter store implementation.

use crate::s3::config::{Compression, S3DeadLetterConfig};
use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use sluice_core::dead_letter::{DeadLetterEntry, DeadLetterError, DeadLetterStore};
use sluice_core::record::{PartitionId, SequenceNumber};
use std::collections::HashMap;
#[cfg(feature = "gzip")]
use std::io::{Read, Write};
use tracing::{debug, error, info, warn};

/// Archives dead-letter entries as one JSON object per entry.
///
/// Writes are unbuffered: [`store`](DeadLetterStore::store) returns only after
/// S3 has accepted the object, so the pipeline can checkpoint past the record.
///
/// # Examples
///
/// ```rust,ignore
/// use sluice_destinations::s3::{S3DeadLetterConfig, S3DeadLetterStore};
///
/// let config = S3DeadLetterConfig::builder()
///     .bucket("ops-dead-letters")
///     .region("us-east-1")
///     .build()?;
///
/// let dead_letters = S3DeadLetterStore::new(config).await?;
/// ```
#[derive(Debug, Clone)]
pub struct S3DeadLetterStore {
    client: S3Client,
    config: S3DeadLetterConfig,
}

impl S3DeadLetterStore {
    /// Creates a store using the default AWS credential chain.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible so credential checks can be added
    /// without an API change.
    pub async fn new(config: S3DeadLetterConfig) -> Result<Self, DeadLetterError> {
        info!(
            bucket = %config.bucket,
            region = %config.region,
            prefix = %config.prefix,
            compression = config.compression.as_str(),
            "Initializing S3 dead-letter store"
        );

        let mut aws_config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(endpoint_url) = &config.endpoint_url {
            debug!(endpoint = %endpoint_url, "Using custom S3 endpoint");
            aws_config_builder = aws_config_builder.endpoint_url(endpoint_url);
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config).retry_config(
            aws_sdk_s3::config::retry::RetryConfig::standard()
                .with_max_attempts(config.max_retries),
        );

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        Ok(Self { client, config })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &S3DeadLetterConfig {
        &self.config
    }

    /// Returns the object key an entry is archived under.
    #[must_use]
    pub fn key_for(&self, entry: &DeadLetterEntry) -> String {
        self.config.key_strategy.generate_key(
            &self.config.prefix,
            &entry.partition_id,
            entry.sequence_number,
            entry.error_code(),
            &entry.last_attempt,
            self.config.compression.extension(),
        )
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, DeadLetterError> {
        let mut keys = Vec::new();
        let mut continuation = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation)
                .send()
                .await
                .map_err(|e| classify_sdk_error("list", e))?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(str::to_string),
            );

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn read_entry(&self, key: &str) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        let Some(compression) = Compression::from_key(key) else {
            warn!(key, "Skipping object with unsupported extension");
            return Ok(None);
        };

        let object = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("get", e))?;

        let body = object
            .body
            .collect()
            .await
            .map_err(|e| DeadLetterError::Connection(format!("reading s3 object {key}: {e}")))?
            .into_bytes();

        let json = decompress(compression, &body)?;
        serde_json::from_slice(&json)
            .map(Some)
            .map_err(|e| DeadLetterError::Serialization(format!("s3 object {key}: {e}")))
    }
}

#[async_trait]
impl DeadLetterStore for S3DeadLetterStore {
    async fn store(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
        let serialized = entry.to_json_bytes()?;
        let uncompressed_size = serialized.len();
        let data = compress(self.config.compression, &serialized)?;
        let key = self.key_for(entry);

        debug!(
            bucket = %self.config.bucket,
            key = %key,
            size = uncompressed_size,
            compressed = data.len(),
            "Archiving dead-letter entry"
        );

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(ByteStream::from(data))
            .content_type("application/json")
            .set_content_encoding(self.config.compression.encoding().map(str::to_string))
            .metadata("error-code", entry.error_code().as_str())
            .send()
            .await
            .map_err(|e| {
                let e = classify_sdk_error("put", e);
                error!(key = %key, error = %e, "Failed to archive dead-letter entry");
                e
            })?;

        Ok(())
    }

    async fn list(
        &self,
        partition: Option<&PartitionId>,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let prefix = self
            .config
            .key_strategy
            .list_prefix(&self.config.prefix, partition);

        let mut entries = Vec::new();
        for key in self.list_keys(&prefix).await? {
            if let Some(entry) = self.read_entry(&key).await? {
                if partition.map_or(true, |p| &entry.partition_id == p) {
                    entries.push(entry);
                }
            }
        }

        Ok(latest_per_record(entries))
    }
}

/// Keeps the most recent capture of each `(partition, sequence)` and orders
/// the result by last attempt.
///
/// Date-based layouts write a new object each time a record is captured on a
/// different day or hour; the archive keeps them all, listings do not.
fn latest_per_record(entries: Vec<DeadLetterEntry>) -> Vec<DeadLetterEntry> {
    let mut latest: HashMap<(PartitionId, SequenceNumber), DeadLetterEntry> = HashMap::new();
    for entry in entries {
        let key = (entry.partition_id.clone(), entry.sequence_number);
        match latest.get(&key) {
            Some(existing) if existing.last_attempt >= entry.last_attempt => {}
            _ => {
                latest.insert(key, entry);
            }
        }
    }

    let mut entries: Vec<_> = latest.into_values().collect();
    entries.sort_by(|a, b| {
        a.last_attempt
            .cmp(&b.last_attempt)
            .then_with(|| a.partition_id.cmp(&b.partition_id))
            .then_with(|| a.sequence_number.cmp(&b.sequence_number))
    });
    entries
}

/// Maps SDK failures onto the store error taxonomy.
fn classify_sdk_error<E, R>(operation: &str, error: SdkError<E, R>) -> DeadLetterError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = format!("s3 {operation}: {}", DisplayErrorContext(&error));
    match error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            DeadLetterError::Connection(message)
        }
        SdkError::ServiceError(_) => DeadLetterError::Storage(message),
        _ => DeadLetterError::Other(message),
    }
}

fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>, DeadLetterError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        #[cfg(feature = "gzip")]
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| DeadLetterError::Serialization(format!("gzip: {e}")))?;
            encoder
                .finish()
                .map_err(|e| DeadLetterError::Serialization(format!("gzip: {e}")))
        }
        #[cfg(feature = "zstandard")]
        Compression::Zstd => zstd::encode_all(data, 3)
            .map_err(|e| DeadLetterError::Serialization(format!("zstd: {e}"))),
    }
}

fn decompress(compression: Compression, data: &[u8]) -> Result<Vec<u8>, DeadLetterError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        #[cfg(feature = "gzip")]
        Compression::Gzip => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| DeadLetterError::Serialization(format!("gunzip: {e}")))?;
            Ok(out)
        }
        #[cfg(feature = "zstandard")]
        Compression::Zstd => zstd::decode_all(data)
            .map_err(|e| DeadLetterError::Serialization(format!("zstd: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use sluice_core::dead_letter::{ErrorCode, FailureInfo};

    fn entry(partition: &str, sequence: u64, minute: u32) -> DeadLetterEntry {
        DeadLetterEntry {
            partition_id: PartitionId::new(partition),
            sequence_number: SequenceNumber::from(sequence),
            original_event: serde_json::json!({ "raw": "not json" }),
            error: FailureInfo {
                code: ErrorCode::PublishError,
                message: "retries exhausted".to_string(),
            },
            attempts: 3,
            last_attempt: Utc.with_ymd_and_hms(2025, 1, 15, 23, minute, 0).unwrap(),
        }
    }

    #[test]
    fn test_recaptured_record_listed_once() {
        let first = entry("shard-0", 5, 58);
        let mut again = first.clone();
        again.last_attempt = first.last_attempt + ChronoDuration::hours(2);
        again.attempts = 6;
        let other = entry("shard-1", 5, 59);

        let listed = latest_per_record(vec![again.clone(), first, other.clone()]);
        assert_eq!(listed, vec![other, again]);
    }

    #[test]
    fn test_same_sequence_on_distinct_partitions_kept() {
        let a = entry("a/b", 7, 1);
        let b = entry("a:b", 7, 2);
        let listed = latest_per_record(vec![b.clone(), a.clone()]);
        assert_eq!(listed, vec![a, b]);
    }

    const PAYLOAD: &[u8] = br#"{"partitionId":"shard-0","attempts":3}"#;

    #[test]
    fn test_no_compression_passthrough() {
        let packed = compress(Compression::None, PAYLOAD).unwrap();
        assert_eq!(packed, PAYLOAD);
        assert_eq!(decompress(Compression::None, &packed).unwrap(), PAYLOAD);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn test_gzip_restores_payload() {
        let packed = compress(Compression::Gzip, PAYLOAD).unwrap();
        assert_eq!(&packed[..2], &[0x1f, 0x8b]);
        assert_eq!(decompress(Compression::Gzip, &packed).unwrap(), PAYLOAD);
    }

    #[cfg(feature = "zstandard")]
    #[test]
    fn test_zstd_restores_payload() {
        let packed = compress(Compression::Zstd, PAYLOAD).unwrap();
        assert_eq!(&packed[..4], &[0x28, 0xb5, 0x2f, 0xfd]);
        assert_eq!(decompress(Compression::Zstd, &packed).unwrap(), PAYLOAD);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn test_corrupt_gzip_is_serialization_error() {
        let err = decompress(Compression::Gzip, b"not gzip").unwrap_err();
        assert!(matches!(err, DeadLetterError::Serialization(_)));
    }
}

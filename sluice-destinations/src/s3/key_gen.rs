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


//! S3 key layouts for archived dead-letter entries.
//!
//! Every key ends in `{partition}/{sequence}.json{compression}` or a flat
//! variant of it, with the sequence number zero-padded so keys sort in stream
//! order. Partition ids are escaped so distinct partitions never share a key.
//!
//! [`ByPartition`](KeyGenerationStrategy::ByPartition) and
//! [`Flat`](KeyGenerationStrategy::Flat) keys depend only on the partition
//! and sequence, so a record captured again after a worker restart overwrites
//! its earlier entry. The date-based layouts embed the capture time and keep
//! one object per capture.
//!
//! # Examples
//!
//! ```rust
//! use sluice_destinations::s3::KeyGenerationStrategy;
//! use chrono::{TimeZone, Utc};
//! use sluice_core::dead_letter::ErrorCode;
//! use sluice_core::record::{PartitionId, SequenceNumber};
//!
//! let key = KeyGenerationStrategy::ByPartition.generate_key(
//!     "dead-letters",
//!     &PartitionId::new("shard-0"),
//!     SequenceNumber::new(42),
//!     ErrorCode::PublishError,
//!     &Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap(),
//!     "",
//! );
//! assert_eq!(
//!     key,
//!     "dead-letters/shard-0/000000000000000000000000000000000000042.json"
//! );
//! ```

use chrono::{DateTime, Utc};
use sluice_core::dead_letter::ErrorCode;
use sluice_core::record::{PartitionId, SequenceNumber};

/// Key layout for archived entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyGenerationStrategy {
    /// Grouped by error code, then capture date.
    ///
    /// Pattern: `{prefix}/{CODE}/{YYYY}/{MM}/{DD}/{partition}/{sequence}.json`
    ///
    /// Best for triage: all `PARSE_ERROR` entries of a day sit together.
    #[default]
    ByErrorCode,

    /// Grouped by capture hour.
    ///
    /// Pattern: `{prefix}/{YYYY}/{MM}/{DD}/{HH}/{partition}/{sequence}.json`
    DateHourPartitioned,

    /// Grouped by partition only.
    ///
    /// Pattern: `{prefix}/{partition}/{sequence}.json`
    ///
    /// Listing a single partition reads only that partition's objects.
    ByPartition,

    /// No directory structure.
    ///
    /// Pattern: `{prefix}/{partition}_{sequence}.json`
    Flat,
}

impl KeyGenerationStrategy {
    /// Generates the object key for one entry.
    ///
    /// `timestamp` is the entry's last attempt time, so keys do not depend on
    /// when the upload happens. Only the date-based layouts use it.
    #[must_use]
    pub fn generate_key(
        &self,
        prefix: &str,
        partition: &PartitionId,
        sequence: SequenceNumber,
        code: ErrorCode,
        timestamp: &DateTime<Utc>,
        compression_ext: &str,
    ) -> String {
        let prefix_part = prefix_part(prefix);
        let partition = escape_partition(partition.as_str());
        let sequence = sequence.to_padded();

        match self {
            Self::ByErrorCode => format!(
                "{}{}/{}/{}/{}.json{}",
                prefix_part,
                code.as_str(),
                timestamp.format("%Y/%m/%d"),
                partition,
                sequence,
                compression_ext
            ),
            Self::DateHourPartitioned => format!(
                "{}{}/{}/{}.json{}",
                prefix_part,
                timestamp.format("%Y/%m/%d/%H"),
                partition,
                sequence,
                compression_ext
            ),
            Self::ByPartition => format!(
                "{}{}/{}.json{}",
                prefix_part, partition, sequence, compression_ext
            ),
            Self::Flat => format!(
                "{}{}_{}.json{}",
                prefix_part, partition, sequence, compression_ext
            ),
        }
    }

    /// Returns the narrowest listing prefix that covers every entry of
    /// `partition` (or every entry at all).
    ///
    /// Only [`ByPartition`](Self::ByPartition) and [`Flat`](Self::Flat) can
    /// narrow by partition; other layouts list the whole archive and filter
    /// after reading.
    #[must_use]
    pub fn list_prefix(&self, prefix: &str, partition: Option<&PartitionId>) -> String {
        let prefix_part = prefix_part(prefix);
        match (self, partition) {
            (Self::ByPartition, Some(p)) => format!("{}{}/", prefix_part, escape_partition(p.as_str())),
            (Self::Flat, Some(p)) => format!("{}{}_", prefix_part, escape_partition(p.as_str())),
            _ => prefix_part,
        }
    }

    /// Returns a description of the key pattern.
    #[must_use]
    pub const fn pattern_description(&self) -> &'static str {
        match self {
            Self::ByErrorCode => "{prefix}/{CODE}/{YYYY}/{MM}/{DD}/{partition}/{sequence}.json",
            Self::DateHourPartitioned => {
                "{prefix}/{YYYY}/{MM}/{DD}/{HH}/{partition}/{sequence}.json"
            }
            Self::ByPartition => "{prefix}/{partition}/{sequence}.json",
            Self::Flat => "{prefix}/{partition}_{sequence}.json",
        }
    }
}

fn prefix_part(prefix: &str) -> String {
    if prefix.is_empty() {
        String::new()
    } else {
        format!("{prefix}/")
    }
}

/// Escapes a partition id into a single key segment.
///
/// ASCII alphanumerics and `-.=` pass through; every other byte becomes
/// `_XX` (uppercase hex). `_` itself is escaped, so the mapping is injective.
fn escape_partition(partition: &str) -> String {
    let mut escaped = String::with_capacity(partition.len());
    for byte in partition.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'=') {
            escaped.push(char::from(byte));
        } else {
            escaped.push_str(&format!("_{byte:02X}"));
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 45).unwrap()
    }

    fn key(strategy: KeyGenerationStrategy, prefix: &str, partition: &str) -> String {
        strategy.generate_key(
            prefix,
            &PartitionId::new(partition),
            SequenceNumber::new(7),
            ErrorCode::ParseError,
            &ts(),
            ".gz",
        )
    }

    const SEQ: &str = "000000000000000000000000000000000000007";

    #[test]
    fn test_by_error_code() {
        assert_eq!(
            key(KeyGenerationStrategy::ByErrorCode, "dlq", "shard-0"),
            format!("dlq/PARSE_ERROR/2025/01/15/shard-0/{SEQ}.json.gz")
        );
    }

    #[test]
    fn test_date_hour() {
        assert_eq!(
            key(KeyGenerationStrategy::DateHourPartitioned, "dlq", "shard-0"),
            format!("dlq/2025/01/15/10/shard-0/{SEQ}.json.gz")
        );
    }

    #[test]
    fn test_by_partition_and_flat() {
        assert_eq!(
            key(KeyGenerationStrategy::ByPartition, "dlq", "shard-0"),
            format!("dlq/shard-0/{SEQ}.json.gz")
        );
        assert_eq!(
            key(KeyGenerationStrategy::Flat, "", "shard-0"),
            format!("shard-0_{SEQ}.json.gz")
        );
    }

    #[test]
    fn test_partition_escaped() {
        assert_eq!(
            key(KeyGenerationStrategy::ByPartition, "dlq", "db/users#3"),
            format!("dlq/db_2Fusers_233/{SEQ}.json.gz")
        );
        assert_eq!(escape_partition("shard_0"), "shard_5F0");
        assert_eq!(escape_partition("é"), "_C3_A9");
    }

    #[test]
    fn test_distinct_partitions_never_share_a_key() {
        let partitions = ["a/b", "a:b", "a_b", "a_2Fb", "a b"];
        for strategy in [
            KeyGenerationStrategy::ByErrorCode,
            KeyGenerationStrategy::DateHourPartitioned,
            KeyGenerationStrategy::ByPartition,
            KeyGenerationStrategy::Flat,
        ] {
            let keys: std::collections::HashSet<String> =
                partitions.iter().map(|p| key(strategy, "dlq", p)).collect();
            assert_eq!(keys.len(), partitions.len(), "{strategy:?}");
        }
    }

    #[test]
    fn test_recapture_key_stability() {
        let later = Utc.with_ymd_and_hms(2025, 1, 16, 3, 0, 0).unwrap();
        let at = |strategy: KeyGenerationStrategy, when: &DateTime<Utc>| {
            strategy.generate_key(
                "dlq",
                &PartitionId::new("shard-0"),
                SequenceNumber::new(7),
                ErrorCode::PublishError,
                when,
                "",
            )
        };

        for strategy in [KeyGenerationStrategy::ByPartition, KeyGenerationStrategy::Flat] {
            assert_eq!(at(strategy, &ts()), at(strategy, &later));
        }
        for strategy in [
            KeyGenerationStrategy::ByErrorCode,
            KeyGenerationStrategy::DateHourPartitioned,
        ] {
            assert_ne!(at(strategy, &ts()), at(strategy, &later));
        }
    }

    #[test]
    fn test_keys_sort_in_stream_order() {
        let partition = PartitionId::new("p");
        let make = |seq: u128| {
            KeyGenerationStrategy::ByPartition.generate_key(
                "dlq",
                &partition,
                SequenceNumber::new(seq),
                ErrorCode::PublishError,
                &ts(),
                "",
            )
        };
        assert!(make(9) < make(10));
        assert!(make(99) < make(100));
    }

    #[test]
    fn test_list_prefix() {
        let p = PartitionId::new("shard-1");
        assert_eq!(
            KeyGenerationStrategy::ByPartition.list_prefix("dlq", Some(&p)),
            "dlq/shard-1/"
        );
        assert_eq!(
            KeyGenerationStrategy::Flat.list_prefix("dlq", Some(&p)),
            "dlq/shard-1_"
        );
        assert_eq!(
            KeyGenerationStrategy::ByErrorCode.list_prefix("dlq", Some(&p)),
            "dlq/"
        );
        assert_eq!(KeyGenerationStrategy::ByPartition.list_prefix("", None), "");
    }
}

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

//! Captured database mutations as they enter the pipeline.
//!
//! Two representations exist for every mutation:
//!
//! - [`RawRecord`]: the undecoded bytes delivered by the input stream together
//!   with the stream position ([`SequenceNumber`]) and partition. The position
//!   is always known, even when the payload is garbage, which is what lets the
//!   consumer checkpoint past records that fail to parse.
//! - [`ChangeRecord`]: the validated, typed mutation produced by
//!   [`parser::parse`](crate::parser::parse).
//!
//! Field maps use [`BTreeMap`] so that iteration and serialization order is
//! deterministic. Transformations rely on this to produce byte-identical
//! output across retries.
//!
//! # Examples
//!
//! ```rust
//! use sluice_core::record::{ChangeRecord, Operation, SequenceNumber};
//! use serde_json::json;
//! use std::collections::BTreeMap;
//!
//! let mut keys = BTreeMap::new();
//! keys.insert("id".to_string(), json!("user-123"));
//!
//! let mut after = BTreeMap::new();
//! after.insert("status".to_string(), json!("inactive"));
//!
//! let record = ChangeRecord {
//!     table: "users".to_string(),
//!     operation: Operation::Update,
//!     before: None,
//!     after: Some(after),
//!     keys,
//!     sequence_number: SequenceNumber::new(42),
//!     transaction_id: Some("txn-456".to_string()),
//!     received_at: chrono::Utc::now(),
//! };
//!
//! assert!(record.operation.is_update());
//! assert_eq!(record.sequence_number.to_string(), "42");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Column name to value mapping for one row image or key.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Number of decimal digits in `u128::MAX`.
const SEQUENCE_WIDTH: usize = 39;

/// Position of a record within its partition.
///
/// Totally ordered and strictly increasing within a partition. Source systems
/// emit sequence numbers that overflow `u64` in practice (DynamoDB and Kinesis
/// style positions are up to 38 digits), so the value is held as a `u128` and
/// travels on the wire as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "SequenceRepr", into = "String")]
pub struct SequenceNumber(u128);

impl SequenceNumber {
    /// The lowest possible sequence number.
    pub const ZERO: Self = Self(0);

    /// Creates a sequence number from its integer value.
    #[must_use]
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// Returns the integer value.
    #[must_use]
    pub const fn value(self) -> u128 {
        self.0
    }

    /// Returns the next sequence number, saturating at the maximum.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Renders the sequence as a fixed-width, zero-padded decimal string.
    ///
    /// Lexicographic order of padded strings equals numeric order, which lets
    /// string-only stores (Redis scripts, object keys) compare positions.
    #[must_use]
    pub fn to_padded(self) -> String {
        format!("{:0width$}", self.0, width = SEQUENCE_WIDTH)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SequenceNumber {
    type Err = InvalidSequence;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidSequence(s.to_string()));
        }
        trimmed
            .parse::<u128>()
            .map(Self)
            .map_err(|_| InvalidSequence(s.to_string()))
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(u128::from(value))
    }
}

impl From<SequenceNumber> for String {
    fn from(seq: SequenceNumber) -> Self {
        seq.to_string()
    }
}

/// A value that could not be interpreted as a sequence number.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sequence number: {0:?}")]
pub struct InvalidSequence(pub String);

/// Wire forms accepted for a sequence number.
#[derive(Deserialize)]
#[serde(untagged)]
enum SequenceRepr {
    Text(String),
    Number(u64),
}

impl TryFrom<SequenceRepr> for SequenceNumber {
    type Error = InvalidSequence;

    fn try_from(repr: SequenceRepr) -> Result<Self, Self::Error> {
        match repr {
            SequenceRepr::Text(s) => s.parse(),
            SequenceRepr::Number(n) => Ok(Self::from(n)),
        }
    }
}

/// Identity of an independently ordered slice of the input stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    /// Creates a partition id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PartitionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of row mutation captured from the source database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// A row was inserted. Only the `after` image is present.
    Insert,

    /// A row was modified. `before` is optional, `after` is present.
    Update,

    /// A row was removed. Only the `before` image is present.
    Delete,
}

impl Operation {
    /// Returns the canonical upper-case wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Returns true for [`Operation::Insert`].
    #[inline]
    #[must_use]
    pub fn is_insert(&self) -> bool {
        *self == Self::Insert
    }

    /// Returns true for [`Operation::Update`].
    #[inline]
    #[must_use]
    pub fn is_update(&self) -> bool {
        *self == Self::Update
    }

    /// Returns true for [`Operation::Delete`].
    #[inline]
    #[must_use]
    pub fn is_delete(&self) -> bool {
        *self == Self::Delete
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(s.to_string()),
        }
    }
}

/// An undecoded record as delivered by the input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Partition the record was read from.
    pub partition: PartitionId,

    /// Stream position of the record within its partition.
    pub sequence: SequenceNumber,

    /// Raw payload, expected to be a JSON change record.
    pub data: Vec<u8>,

    /// Time the stream captured the mutation.
    pub received_at: DateTime<Utc>,
}

impl RawRecord {
    /// Creates a raw record stamped with the current time.
    pub fn new(
        partition: impl Into<PartitionId>,
        sequence: SequenceNumber,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            partition: partition.into(),
            sequence,
            data: data.into(),
            received_at: Utc::now(),
        }
    }

    /// Overrides the capture timestamp.
    #[must_use]
    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Returns the payload as JSON if it is valid JSON, otherwise as a
    /// lossily decoded string. Used to preserve unparseable payloads verbatim
    /// in dead-letter entries.
    #[must_use]
    pub fn payload_value(&self) -> serde_json::Value {
        serde_json::from_slice(&self.data).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&self.data).into_owned())
        })
    }
}

/// One validated change captured from the source database.
///
/// The consumer exclusively owns a `ChangeRecord` while it is in flight.
/// Records are never mutated after parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Source table identifier.
    pub table: String,

    /// Mutation kind.
    pub operation: Operation,

    /// Row image before the change. Absent on INSERT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Fields>,

    /// Row image after the change. Absent on DELETE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Fields>,

    /// Primary-key columns; the ordering and partition key.
    pub keys: Fields,

    /// Position within the partition, used for checkpointing and dedup.
    pub sequence_number: SequenceNumber,

    /// Source transaction correlation id. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    /// Capture timestamp.
    pub received_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Returns the row image the operation is required to carry:
    /// `after` for INSERT and UPDATE, `before` for DELETE.
    #[must_use]
    pub fn required_image(&self) -> Option<&Fields> {
        match self.operation {
            Operation::Insert | Operation::Update => self.after.as_ref(),
            Operation::Delete => self.before.as_ref(),
        }
    }

    /// Returns the name of the image the operation requires.
    #[must_use]
    pub const fn required_image_name(&self) -> &'static str {
        match self.operation {
            Operation::Insert | Operation::Update => "after",
            Operation::Delete => "before",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sequence_parses_large_decimal() {
        let seq: SequenceNumber = "12345678901234567890".parse().unwrap();
        assert_eq!(seq.value(), 12_345_678_901_234_567_890_u128);
        assert_eq!(seq.to_string(), "12345678901234567890");
    }

    #[test]
    fn test_sequence_rejects_non_digits() {
        assert!("".parse::<SequenceNumber>().is_err());
        assert!("-1".parse::<SequenceNumber>().is_err());
        assert!("12a".parse::<SequenceNumber>().is_err());
        assert!("1.5".parse::<SequenceNumber>().is_err());
    }

    #[test]
    fn test_sequence_serde_accepts_string_and_number() {
        let from_text: SequenceNumber = serde_json::from_value(json!("77")).unwrap();
        let from_number: SequenceNumber = serde_json::from_value(json!(77)).unwrap();
        assert_eq!(from_text, from_number);
        assert_eq!(serde_json::to_value(from_text).unwrap(), json!("77"));
    }

    #[test]
    fn test_padded_order_matches_numeric_order() {
        let small = SequenceNumber::new(9);
        let large = SequenceNumber::new(10);
        assert!(small.to_padded() < large.to_padded());
        assert_eq!(small.to_padded().len(), 39);
        assert_eq!(
            SequenceNumber::new(u128::MAX).to_padded(),
            u128::MAX.to_string()
        );
    }

    #[test]
    fn test_operation_from_str_is_case_insensitive() {
        assert_eq!("insert".parse::<Operation>(), Ok(Operation::Insert));
        assert_eq!("Update".parse::<Operation>(), Ok(Operation::Update));
        assert_eq!("DELETE".parse::<Operation>(), Ok(Operation::Delete));
        assert!("UPSERT".parse::<Operation>().is_err());
    }

    #[test]
    fn test_raw_payload_value_falls_back_to_string() {
        let valid = RawRecord::new("p-0", SequenceNumber::new(1), br#"{"a":1}"#.to_vec());
        assert_eq!(valid.payload_value(), json!({"a": 1}));

        let garbage = RawRecord::new("p-0", SequenceNumber::new(2), b"not json".to_vec());
        assert_eq!(garbage.payload_value(), json!("not json"));
    }
}

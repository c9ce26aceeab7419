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

//! Sanitized events emitted to the event bus.
//!
//! A [`PublishedEvent`] is created by the [`Transformer`](crate::transform::Transformer)
//! from exactly one [`ChangeRecord`](crate::record::ChangeRecord) and is
//! immutable afterwards. Its wire form is a versioned envelope:
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "eventType": "user.changed",
//!   "detail": {
//!     "table": "users",
//!     "operation": "UPDATE",
//!     "before": {},
//!     "after": { "status": "inactive" },
//!     "keys": { "id": "user-123" },
//!     "metadata": { "transactionId": "txn-456", "sequenceNumber": "12345678901234567890" }
//!   }
//! }
//! ```
//!
//! Serialization is deterministic: field maps are ordered and no wall-clock
//! value enters the envelope, so retrying a publish sends identical bytes.

use crate::record::{Fields, Operation, SequenceNumber};
use crate::rules::{is_health_probe, HEALTH_PROBE_EVENT_TYPE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope schema version.
pub const ENVELOPE_VERSION: &str = "1.0";

/// Table name carried by synthetic health-probe events.
pub const HEALTH_PROBE_TABLE: &str = "sluice.health";

/// The sanitized, emitted representation of one change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedEvent {
    /// Output event type label from the table's rule.
    pub event_type: String,

    /// Source table identifier.
    pub table: String,

    /// Mutation kind.
    pub operation: Operation,

    /// Primary-key columns, copied unchanged from the record.
    pub keys: Fields,

    /// Redacted and filtered before image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Fields>,

    /// Redacted and filtered after image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Fields>,

    /// Position of the originating record.
    pub sequence_number: SequenceNumber,

    /// Source transaction id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    /// Emission timestamp. Derived from the record's capture time so that the
    /// same record always yields the same event.
    pub emitted_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope<'a> {
    version: &'static str,
    event_type: &'a str,
    detail: WireDetail<'a>,
}

#[derive(Serialize)]
struct WireDetail<'a> {
    table: &'a str,
    operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<&'a Fields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<&'a Fields>,
    keys: &'a Fields,
    metadata: WireMetadata<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireMetadata<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_id: Option<&'a str>,
    sequence_number: SequenceNumber,
}

impl PublishedEvent {
    /// Builds a synthetic health-probe event.
    ///
    /// Probe events carry the reserved [`HEALTH_PROBE_EVENT_TYPE`], which no
    /// table rule may use, so real consumers can filter them by event type.
    #[must_use]
    pub fn health_probe(probe_id: impl Into<String>, emitted_at: DateTime<Utc>) -> Self {
        let mut keys = Fields::new();
        keys.insert("probeId".to_string(), serde_json::Value::String(probe_id.into()));

        Self {
            event_type: HEALTH_PROBE_EVENT_TYPE.to_string(),
            table: HEALTH_PROBE_TABLE.to_string(),
            operation: Operation::Insert,
            keys,
            before: None,
            after: Some(Fields::new()),
            sequence_number: SequenceNumber::ZERO,
            transaction_id: None,
            emitted_at,
        }
    }

    /// Returns true if this is a synthetic health-probe event.
    #[inline]
    #[must_use]
    pub fn is_health_probe(&self) -> bool {
        is_health_probe(&self.event_type)
    }

    /// Serializes the event into its wire envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if a field value cannot be represented as JSON.
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.wire())
    }

    /// Serializes the event into its wire envelope as a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if a field value cannot be represented as JSON.
    pub fn to_wire_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self.wire())
    }

    /// Returns the downstream deduplication key `(table, keys, sequenceNumber)`.
    ///
    /// Publishing is at-least-once, so consumers dedup on this key. HTTP
    /// publishers forward it as an idempotency header.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        let keys = serde_json::to_string(&self.keys).unwrap_or_default();
        format!("{}|{}|{}", self.table, keys, self.sequence_number)
    }

    fn wire(&self) -> WireEnvelope<'_> {
        WireEnvelope {
            version: ENVELOPE_VERSION,
            event_type: &self.event_type,
            detail: WireDetail {
                table: &self.table,
                operation: self.operation,
                before: self.before.as_ref(),
                after: self.after.as_ref(),
                keys: &self.keys,
                metadata: WireMetadata {
                    transaction_id: self.transaction_id.as_deref(),
                    sequence_number: self.sequence_number,
                },
            },
        }
    }
}

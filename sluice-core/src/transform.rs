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

//! Transformer / Redactor
//!
//! [`transform`] turns a validated [`ChangeRecord`] into a [`PublishedEvent`]
//! by applying the table's [`TransformRule`] to both row images:
//!
//! 1. every field listed in `redactFields` is removed;
//! 2. if the rule has a non-empty allow-list, only fields that are in the
//!    allow-list *and* survived step 1 are kept.
//!
//! Redaction runs first and inclusion can never bring a redacted field back.
//! Keys are copied unchanged; they identify the row downstream.
//!
//! The transform is pure. It reads no clock and no global state, and its
//! output is built from ordered maps, so the same input always serializes to
//! the same bytes. Publish retries depend on this.

use crate::dead_letter::ErrorCode;
use crate::event::PublishedEvent;
use crate::record::{ChangeRecord, Fields};
use crate::rules::{RegistryError, RuleRegistry, TransformRule};
use std::sync::Arc;
use thiserror::Error;

/// Default ceiling for a serialized event (256 KiB).
pub const DEFAULT_MAX_EVENT_BYTES: usize = 256 * 1024;

/// Reasons a record cannot be turned into an event.
#[derive(Debug, Error)]
pub enum TransformError {
    /// No rule exists for the record's table.
    #[error(transparent)]
    UnknownTable(#[from] RegistryError),

    /// The image the operation requires is absent.
    #[error("{operation} record for table `{table}` has no `{image}` image")]
    MissingImage {
        /// Table name
        table: String,
        /// Operation name
        operation: &'static str,
        /// Name of the missing image
        image: &'static str,
    },

    /// The serialized event exceeds the configured size limit.
    #[error("event for table `{table}` is {size} bytes, limit is {limit}")]
    EventTooLarge {
        /// Table name
        table: String,
        /// Serialized size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// The event could not be serialized.
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransformError {
    /// Dead-letter classification.
    ///
    /// A missing rule is a validation problem with the deployment; every
    /// other failure is a deterministic transformation failure.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnknownTable(_) => ErrorCode::ValidationError,
            Self::MissingImage { .. } | Self::EventTooLarge { .. } | Self::Serialization(_) => {
                ErrorCode::TransformationError
            }
        }
    }
}

/// Applies `rule` to `record`.
///
/// # Errors
///
/// Returns [`TransformError::MissingImage`] when an INSERT or UPDATE has no
/// `after` image or a DELETE has no `before` image.
pub fn transform(record: &ChangeRecord, rule: &TransformRule) -> Result<PublishedEvent, TransformError> {
    if record.required_image().is_none() {
        return Err(TransformError::MissingImage {
            table: record.table.clone(),
            operation: record.operation.as_str(),
            image: record.required_image_name(),
        });
    }

    Ok(PublishedEvent {
        event_type: rule.event_type().to_string(),
        table: record.table.clone(),
        operation: record.operation,
        keys: record.keys.clone(),
        before: record.before.as_ref().map(|image| sanitize(image, rule)),
        after: record.after.as_ref().map(|image| sanitize(image, rule)),
        sequence_number: record.sequence_number,
        transaction_id: record.transaction_id.clone(),
        emitted_at: record.received_at,
    })
}

/// Applies redaction then inclusion to one row image.
#[must_use]
pub fn sanitize(image: &Fields, rule: &TransformRule) -> Fields {
    let include = rule.include_fields();
    image
        .iter()
        .filter(|(field, _)| !rule.redact_fields().contains(field.as_str()))
        .filter(|(field, _)| include.map_or(true, |allowed| allowed.contains(field.as_str())))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}

/// Rule lookup plus transformation, with an injected registry.
#[derive(Debug, Clone)]
pub struct Transformer {
    registry: Arc<RuleRegistry>,
    max_event_bytes: usize,
}

impl Transformer {
    /// Creates a transformer over `registry` with the default size limit.
    #[must_use]
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self {
            registry,
            max_event_bytes: DEFAULT_MAX_EVENT_BYTES,
        }
    }

    /// Overrides the serialized event size limit.
    #[must_use]
    pub fn with_max_event_bytes(mut self, max_event_bytes: usize) -> Self {
        self.max_event_bytes = max_event_bytes;
        self
    }

    /// The registry rules are read from.
    #[must_use]
    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Looks up the record's rule and transforms it.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::UnknownTable`] if the table has no rule,
    /// [`TransformError::EventTooLarge`] if the event exceeds the size
    /// limit, and the errors of [`transform`].
    pub fn apply(&self, record: &ChangeRecord) -> Result<PublishedEvent, TransformError> {
        let rule = self.registry.lookup(&record.table)?;
        let event = transform(record, rule)?;

        let size = event.to_wire_bytes()?.len();
        if size > self.max_event_bytes {
            return Err(TransformError::EventTooLarge {
                table: record.table.clone(),
                size,
                limit: self.max_event_bytes,
            });
        }

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Operation, SequenceNumber};
    use chrono::Utc;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        serde_json::from_value(value).unwrap()
    }

    fn record(operation: Operation, before: Option<Fields>, after: Option<Fields>) -> ChangeRecord {
        ChangeRecord {
            table: "users".to_string(),
            operation,
            before,
            after,
            keys: fields(json!({"id": 1})),
            sequence_number: SequenceNumber::new(10),
            transaction_id: Some("txn-1".to_string()),
            received_at: Utc::now(),
        }
    }

    fn users_rule() -> TransformRule {
        TransformRule::new("user.changed")
            .with_redact_fields(["ssn", "email"])
            .with_include_fields(["id", "name", "status"])
    }

    #[test]
    fn test_redact_then_include() {
        let input = record(
            Operation::Insert,
            None,
            Some(fields(json!({"id": 1, "name": "A", "ssn": "123", "status": "active"}))),
        );
        let event = transform(&input, &users_rule()).unwrap();
        assert_eq!(
            event.after,
            Some(fields(json!({"id": 1, "name": "A", "status": "active"})))
        );
        assert_eq!(event.event_type, "user.changed");
        assert_eq!(event.sequence_number, SequenceNumber::new(10));
        assert_eq!(event.emitted_at, input.received_at);
    }

    #[test]
    fn test_redaction_wins_over_inclusion() {
        let rule = TransformRule::new("x")
            .with_redact_fields(["ssn"])
            .with_include_fields(["ssn", "name"]);
        let input = record(
            Operation::Update,
            Some(fields(json!({"ssn": "1", "name": "old"}))),
            Some(fields(json!({"ssn": "2", "name": "new"}))),
        );
        let event = transform(&input, &rule).unwrap();
        assert_eq!(event.before, Some(fields(json!({"name": "old"}))));
        assert_eq!(event.after, Some(fields(json!({"name": "new"}))));
    }

    #[test]
    fn test_no_include_list_keeps_everything_not_redacted() {
        let rule = TransformRule::new("x").with_redact_fields(["secret"]);
        let input = record(
            Operation::Delete,
            Some(fields(json!({"a": 1, "b": 2, "secret": 3}))),
            None,
        );
        let event = transform(&input, &rule).unwrap();
        assert_eq!(event.before, Some(fields(json!({"a": 1, "b": 2}))));
        assert!(event.after.is_none());
    }

    #[test]
    fn test_missing_required_image() {
        let rule = TransformRule::new("x");
        let insert = record(Operation::Insert, None, None);
        let err = transform(&insert, &rule).unwrap_err();
        assert!(matches!(err, TransformError::MissingImage { image: "after", .. }));
        assert_eq!(err.error_code(), ErrorCode::TransformationError);

        let delete = record(Operation::Delete, None, Some(Fields::new()));
        assert!(matches!(
            transform(&delete, &rule),
            Err(TransformError::MissingImage { image: "before", .. })
        ));
    }

    #[test]
    fn test_transform_is_byte_identical() {
        let input = record(
            Operation::Update,
            Some(fields(json!({"status": "active", "email": "a@b"}))),
            Some(fields(json!({"status": "inactive", "email": "a@b"}))),
        );
        let first = transform(&input, &users_rule()).unwrap().to_wire_bytes().unwrap();
        let second = transform(&input, &users_rule()).unwrap().to_wire_bytes().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_transformer_unknown_table_is_validation_error() {
        let transformer = Transformer::new(Arc::new(RuleRegistry::default()));
        let err = transformer
            .apply(&record(Operation::Insert, None, Some(Fields::new())))
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ValidationError);
    }

    #[test]
    fn test_transformer_enforces_size_limit() {
        let registry = RuleRegistry::new([("users", TransformRule::new("user.changed"))]).unwrap();
        let transformer = Transformer::new(Arc::new(registry)).with_max_event_bytes(64);
        let input = record(
            Operation::Insert,
            None,
            Some(fields(json!({"blob": "x".repeat(128)}))),
        );
        assert!(matches!(
            transformer.apply(&input),
            Err(TransformError::EventTooLarge { limit: 64, .. })
        ));
    }
}

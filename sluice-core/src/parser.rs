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

//! Record parser and validator.
//!
//! [`parse`] decodes the JSON payload of a [`RawRecord`] into a typed
//! [`ChangeRecord`]. It is a pure function: the same raw record always yields
//! the same result, and a failure is terminal for that record.
//!
//! Accepted input:
//!
//! ```json
//! {
//!   "table": "users",
//!   "operation": "UPDATE",
//!   "before": { "status": "active" },
//!   "after": { "status": "inactive" },
//!   "keys": { "id": "user-123" },
//!   "metadata": { "transactionId": "txn-456", "sequenceNumber": "12345678901234567890" }
//! }
//! ```
//!
//! `metadata` and both images are optional at this layer. The stream position
//! of the raw record is authoritative: if the payload also carries a
//! `sequenceNumber` it must agree with it.

use crate::dead_letter::ErrorCode;
use crate::record::{ChangeRecord, Fields, Operation, RawRecord, SequenceNumber};
use serde_json::{Map, Value};
use thiserror::Error;

/// Reasons a raw record is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The payload is not a JSON object.
    #[error("invalid JSON payload: {message}")]
    InvalidJson {
        /// Decoder message
        message: String,
    },

    /// A required field is absent or null.
    #[error("missing required field `{field}`")]
    MissingField {
        /// Field name
        field: &'static str,
    },

    /// A field is present but has the wrong shape.
    #[error("invalid field `{field}`: {message}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What was wrong with it
        message: String,
    },

    /// The operation is not one of INSERT, UPDATE, DELETE.
    #[error("unknown operation `{operation}`")]
    UnknownOperation {
        /// The value as received
        operation: String,
    },

    /// `metadata.sequenceNumber` is not a non-negative integer.
    #[error("invalid sequence number `{value}`")]
    InvalidSequence {
        /// The value as received
        value: String,
    },

    /// `metadata.sequenceNumber` disagrees with the stream position.
    #[error("sequence number {payload} does not match stream position {stream}")]
    SequenceMismatch {
        /// Position reported by the stream
        stream: SequenceNumber,
        /// Position found in the payload
        payload: SequenceNumber,
    },

    /// `keys` is an empty object.
    #[error("`keys` must contain at least one field")]
    EmptyKeys,
}

impl ParseError {
    /// Dead-letter classification for parse failures.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        ErrorCode::ParseError
    }
}

/// Decodes and validates a raw stream record.
///
/// # Errors
///
/// Returns a [`ParseError`] if the payload is not a JSON object, if `table`,
/// `operation` or `keys` are missing or malformed, if the operation is
/// unknown, or if the embedded sequence number is invalid or disagrees with
/// the stream position.
pub fn parse(raw: &RawRecord) -> Result<ChangeRecord, ParseError> {
    let value: Value = serde_json::from_slice(&raw.data).map_err(|e| ParseError::InvalidJson {
        message: e.to_string(),
    })?;

    let Value::Object(mut object) = value else {
        return Err(ParseError::InvalidJson {
            message: "payload is not a JSON object".to_string(),
        });
    };

    let table = match object.remove("table") {
        None | Some(Value::Null) => return Err(ParseError::MissingField { field: "table" }),
        Some(Value::String(s)) if s.trim().is_empty() => {
            return Err(ParseError::InvalidField {
                field: "table",
                message: "must not be empty".to_string(),
            })
        }
        Some(Value::String(s)) => s,
        Some(other) => {
            return Err(ParseError::InvalidField {
                field: "table",
                message: format!("expected string, found {}", kind(&other)),
            })
        }
    };

    let operation = match object.remove("operation") {
        None | Some(Value::Null) => return Err(ParseError::MissingField { field: "operation" }),
        Some(Value::String(s)) => s
            .parse::<Operation>()
            .map_err(|operation| ParseError::UnknownOperation { operation })?,
        Some(other) => {
            return Err(ParseError::UnknownOperation {
                operation: other.to_string(),
            })
        }
    };

    let keys = match object.remove("keys") {
        None | Some(Value::Null) => return Err(ParseError::MissingField { field: "keys" }),
        Some(Value::Object(map)) if map.is_empty() => return Err(ParseError::EmptyKeys),
        Some(Value::Object(map)) => into_fields(map),
        Some(other) => {
            return Err(ParseError::InvalidField {
                field: "keys",
                message: format!("expected object, found {}", kind(&other)),
            })
        }
    };

    let before = image(object.remove("before"), "before")?;
    let after = image(object.remove("after"), "after")?;

    let (transaction_id, sequence_number) = match object.remove("metadata") {
        None | Some(Value::Null) => (None, raw.sequence),
        Some(Value::Object(mut metadata)) => {
            let transaction_id = match metadata.remove("transactionId") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s),
                Some(other) => Some(other.to_string()),
            };
            let sequence = match metadata.remove("sequenceNumber") {
                None | Some(Value::Null) => raw.sequence,
                Some(value) => {
                    let payload = sequence_from(&value)?;
                    if payload != raw.sequence {
                        return Err(ParseError::SequenceMismatch {
                            stream: raw.sequence,
                            payload,
                        });
                    }
                    payload
                }
            };
            (transaction_id, sequence)
        }
        Some(other) => {
            return Err(ParseError::InvalidField {
                field: "metadata",
                message: format!("expected object, found {}", kind(&other)),
            })
        }
    };

    Ok(ChangeRecord {
        table,
        operation,
        before,
        after,
        keys,
        sequence_number,
        transaction_id,
        received_at: raw.received_at,
    })
}

fn image(value: Option<Value>, field: &'static str) -> Result<Option<Fields>, ParseError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(into_fields(map))),
        Some(other) => Err(ParseError::InvalidField {
            field,
            message: format!("expected object, found {}", kind(&other)),
        }),
    }
}

fn sequence_from(value: &Value) -> Result<SequenceNumber, ParseError> {
    let invalid = || ParseError::InvalidSequence {
        value: value.to_string(),
    };
    match value {
        Value::String(s) => s.parse().map_err(|_| invalid()),
        Value::Number(n) => n.as_u64().map(SequenceNumber::from).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

fn into_fields(map: Map<String, Value>) -> Fields {
    map.into_iter().collect()
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

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

//! Rule Registry
//!
//! The registry maps each source table to an immutable [`TransformRule`]. It is
//! loaded once at startup and never mutated afterwards, so it is shared across
//! partition workers behind an [`Arc`](std::sync::Arc) without any locking.
//!
//! Rules are usually loaded from a YAML or JSON document:
//!
//! ```yaml
//! tables:
//!   users:
//!     eventType: user.changed
//!     redactFields: [ssn, email]
//!     includeFields: [id, name, status]
//!   orders:
//!     eventType: order.changed
//! ```
//!
//! A table that has no rule is a configuration error surfaced at lookup time.
//! Records for it are dead-lettered as `VALIDATION_ERROR` rather than passed
//! through unredacted.
//!
//! # Health probes
//!
//! Event types starting with [`RESERVED_EVENT_TYPE_PREFIX`] belong to the
//! external health-probe collaborator. Rules may not use them, which keeps
//! synthetic probe events distinguishable from real ones.
//!
//! # Examples
//!
//! ```rust
//! use sluice_core::rules::RuleRegistry;
//!
//! let registry = RuleRegistry::from_yaml_str(r#"
//! tables:
//!   users:
//!     eventType: user.changed
//!     redactFields: [ssn]
//! "#).unwrap();
//!
//! let rule = registry.lookup("users").unwrap();
//! assert_eq!(rule.event_type(), "user.changed");
//! assert!(registry.lookup("unknown").is_err());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Event-type namespace reserved for synthetic health-probe events.
pub const RESERVED_EVENT_TYPE_PREFIX: &str = "sluice.health.";

/// Event type carried by health-probe events.
pub const HEALTH_PROBE_EVENT_TYPE: &str = "sluice.health.probe";

/// Returns true if `event_type` belongs to the health-probe namespace.
#[inline]
#[must_use]
pub fn is_health_probe(event_type: &str) -> bool {
    event_type.starts_with(RESERVED_EVENT_TYPE_PREFIX)
}

/// Errors raised while loading or querying the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No rule is configured for the table.
    #[error("no transform rule configured for table `{table}`")]
    NotFound {
        /// The table that was looked up
        table: String,
    },

    /// A rule is structurally invalid.
    #[error("invalid rule for table `{table}`: {message}")]
    InvalidRule {
        /// Table the rule belongs to
        table: String,
        /// What is wrong with it
        message: String,
    },

    /// The rules document could not be decoded.
    #[error("failed to parse rules document: {message}")]
    Parse {
        /// Decoder message
        message: String,
    },

    /// The rules file could not be read.
    #[error("failed to read rules file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Redaction and filtering policy for one table.
///
/// Once a rule is placed in a [`RuleRegistry`] it is only reachable through
/// shared references and can no longer change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRule {
    event_type: String,
    redact_fields: BTreeSet<String>,
    include_fields: Option<BTreeSet<String>>,
}

impl TransformRule {
    /// Creates a rule that emits `event_type` and keeps every field.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            redact_fields: BTreeSet::new(),
            include_fields: None,
        }
    }

    /// Sets the fields removed from every emitted image.
    #[must_use]
    pub fn with_redact_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redact_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the allow-list of fields kept after redaction.
    #[must_use]
    pub fn with_include_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Output event type label.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Fields that never appear in an emitted event.
    #[must_use]
    pub fn redact_fields(&self) -> &BTreeSet<String> {
        &self.redact_fields
    }

    /// Allow-list of surviving fields.
    ///
    /// `None` and an empty set both mean "no allow-list".
    #[must_use]
    pub fn include_fields(&self) -> Option<&BTreeSet<String>> {
        self.include_fields.as_ref().filter(|set| !set.is_empty())
    }

    fn validate(&self, table: &str) -> Result<(), RegistryError> {
        if self.event_type.trim().is_empty() {
            return Err(RegistryError::InvalidRule {
                table: table.to_string(),
                message: "eventType must not be empty".to_string(),
            });
        }
        if is_health_probe(&self.event_type) {
            return Err(RegistryError::InvalidRule {
                table: table.to_string(),
                message: format!(
                    "eventType `{}` uses the reserved prefix `{RESERVED_EVENT_TYPE_PREFIX}`",
                    self.event_type
                ),
            });
        }
        Ok(())
    }
}

/// Serialized form of one rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    /// Output event type label
    #[serde(alias = "event_type")]
    pub event_type: String,

    /// Fields to remove
    #[serde(default, alias = "redact_fields")]
    pub redact_fields: Vec<String>,

    /// Optional allow-list
    #[serde(default, alias = "include_fields")]
    pub include_fields: Option<Vec<String>>,
}

/// Serialized form of the whole registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Rules keyed by table name
    #[serde(default)]
    pub tables: HashMap<String, RuleConfig>,
}

impl From<RuleConfig> for TransformRule {
    fn from(config: RuleConfig) -> Self {
        let rule = Self::new(config.event_type).with_redact_fields(config.redact_fields);
        match config.include_fields {
            Some(include) => rule.with_include_fields(include),
            None => rule,
        }
    }
}

/// Immutable table-to-rule lookup.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: HashMap<String, TransformRule>,
}

impl RuleRegistry {
    /// Builds a registry from rules keyed by table.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidRule`] if any rule has an empty event
    /// type or uses the reserved health-probe namespace.
    pub fn new<I, S>(rules: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (S, TransformRule)>,
        S: Into<String>,
    {
        let mut map = HashMap::new();
        for (table, rule) in rules {
            let table = table.into();
            rule.validate(&table)?;

            if let Some(include) = rule.include_fields() {
                let overlap: Vec<&String> = include.intersection(rule.redact_fields()).collect();
                if !overlap.is_empty() {
                    warn!(
                        table = %table,
                        fields = ?overlap,
                        "Fields listed in both includeFields and redactFields will be redacted"
                    );
                }
            }

            debug!(table = %table, event_type = %rule.event_type(), "Registered transform rule");
            map.insert(table, rule);
        }

        info!(tables = map.len(), "Rule registry loaded");
        Ok(Self { rules: map })
    }

    /// Builds a registry from its serialized configuration.
    ///
    /// # Errors
    ///
    /// See [`RuleRegistry::new`].
    pub fn from_config(config: RulesConfig) -> Result<Self, RegistryError> {
        Self::new(
            config
                .tables
                .into_iter()
                .map(|(table, rule)| (table, TransformRule::from(rule))),
        )
    }

    /// Parses a YAML rules document.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Parse`] on malformed YAML, or any error of
    /// [`RuleRegistry::new`].
    pub fn from_yaml_str(source: &str) -> Result<Self, RegistryError> {
        let config: RulesConfig = serde_yaml::from_str(source).map_err(|e| RegistryError::Parse {
            message: e.to_string(),
        })?;
        Self::from_config(config)
    }

    /// Parses a JSON rules document.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Parse`] on malformed JSON, or any error of
    /// [`RuleRegistry::new`].
    pub fn from_json_str(source: &str) -> Result<Self, RegistryError> {
        let config: RulesConfig = serde_json::from_str(source).map_err(|e| RegistryError::Parse {
            message: e.to_string(),
        })?;
        Self::from_config(config)
    }

    /// Loads a rules file. Files ending in `.json` are parsed as JSON,
    /// everything else as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the file cannot be read, otherwise
    /// the errors of the matching `from_*_str` constructor.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&source)
        } else {
            Self::from_yaml_str(&source)
        }
    }

    /// Returns the rule for `table`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the table has no rule.
    pub fn lookup(&self, table: &str) -> Result<&TransformRule, RegistryError> {
        self.rules.get(table).ok_or_else(|| RegistryError::NotFound {
            table: table.to_string(),
        })
    }

    /// Returns true if a rule exists for `table`.
    #[must_use]
    pub fn contains(&self, table: &str) -> bool {
        self.rules.contains_key(table)
    }

    /// Returns the configured table names, sorted.
    #[must_use]
    pub fn tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        tables.sort_unstable();
        tables
    }

    /// Number of configured tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if no rules are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

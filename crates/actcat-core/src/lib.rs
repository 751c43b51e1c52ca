//! Core catalog model, confidence ladder, and run-report types for actcat.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "actcat-core";

/// Namespace every first-party action identifier lives under.
pub const PRIMARY_NAMESPACE: &str = "is.workflow.actions.";

/// Second vendor namespace accepted by validation.
pub const VENDOR_NAMESPACE: &str = "com.apple.";

/// Provenance tag stamped on records contributed by the discovery engine.
pub const DISCOVERY_SOURCE_TAG: &str = "discovery";

pub const CATALOG_VERSION: &str = "1.0";
pub const LEDGER_SCHEMA_VERSION: u32 = 1;

/// Trust ladder. Declaration order is ladder order, so `Ord` compares trust.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
    Authoritative,
}

impl Confidence {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "authoritative" => Some(Self::Authoritative),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Authoritative => "authoritative",
        }
    }

    /// One rung up, never past `High`. `Authoritative` is left as is.
    pub fn step_up_below_authoritative(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium | Self::High => Self::High,
            Self::Authoritative => Self::Authoritative,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    Enum,
    Variable,
    Dictionary,
    Array,
    Date,
    Duration,
    Location,
    Contact,
    File,
    Url,
    App,
    Shortcut,
    #[default]
    Any,
}

impl ParameterType {
    /// Lossy mapping from whatever label a source used. Unknown labels become `Any`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "string" | "text" | "str" => Self::String,
            "number" | "int" | "integer" | "float" | "double" | "decimal" => Self::Number,
            "boolean" | "bool" | "toggle" => Self::Boolean,
            "enum" | "enumeration" | "choice" => Self::Enum,
            "variable" | "magicvariable" => Self::Variable,
            "dictionary" | "dict" | "object" => Self::Dictionary,
            "array" | "list" => Self::Array,
            "date" | "datetime" => Self::Date,
            "duration" | "timeinterval" => Self::Duration,
            "location" | "place" => Self::Location,
            "contact" | "person" => Self::Contact,
            "file" | "document" => Self::File,
            "url" | "link" => Self::Url,
            "app" | "application" => Self::App,
            "shortcut" | "workflow" => Self::Shortcut,
            _ => Self::Any,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub key: String,
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<JsonValue>,
}

impl Parameter {
    /// Bare key form used when a source only lists parameter names.
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            param_type: ParameterType::String,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    #[serde(default)]
    pub types: BTreeSet<String>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_key: Option<String>,
}

impl InputSpec {
    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && !self.multiple && self.parameter_key.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSpec {
    #[serde(default)]
    pub types: BTreeSet<String>,
    #[serde(default)]
    pub multiple: bool,
}

impl OutputSpec {
    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && !self.multiple
    }
}

/// One canonical catalog entry, keyed by its dotted `identifier`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_class: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub input: InputSpec,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
    #[serde(default = "default_permissions")]
    pub permissions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub sources: BTreeSet<String>,
    #[serde(default)]
    pub usage_examples: BTreeSet<String>,
    #[serde(default)]
    pub related_actions: BTreeSet<String>,
    #[serde(default)]
    pub alternatives: BTreeSet<String>,
}

pub fn default_permissions() -> String {
    "none".to_string()
}

impl ActionRecord {
    pub fn parameter(&self, key: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.key == key)
    }

    pub fn is_authoritative(&self) -> bool {
        self.confidence == Confidence::Authoritative
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub source_tag: String,
    pub record_count: usize,
    pub priority_rank: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseMetadata {
    pub version: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default, alias = "sourceList")]
    pub sources: Vec<SourceSummary>,
    #[serde(default)]
    pub total_actions: usize,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDatabase {
    pub metadata: DatabaseMetadata,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionRecord>,
}

impl CanonicalDatabase {
    pub fn empty(generated_at: DateTime<Utc>) -> Self {
        Self {
            metadata: DatabaseMetadata {
                version: CATALOG_VERSION.to_string(),
                generated_at,
                sources: Vec::new(),
                total_actions: 0,
                categories: Vec::new(),
            },
            actions: BTreeMap::new(),
        }
    }

    /// Recompute the derived metadata fields from `actions`.
    pub fn refresh_metadata(&mut self, generated_at: DateTime<Utc>) {
        self.metadata.generated_at = generated_at;
        self.metadata.total_actions = self.actions.len();
        self.metadata.categories = self
            .actions
            .values()
            .map(|a| a.category.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
    }
}

/// Cross-run coordination state: when the last discovery update succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub last_update_timestamp: DateTime<Utc>,
    pub schema_version: u32,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            last_update_timestamp: DateTime::<Utc>::UNIX_EPOCH,
            schema_version: LEDGER_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiscoveryPhase {
    InstalledItemScan,
    FrameworkScan,
    ExternalResourceScan,
    Integration,
}

impl DiscoveryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstalledItemScan => "installedItemScan",
            Self::FrameworkScan => "frameworkScan",
            Self::ExternalResourceScan => "externalResourceScan",
            Self::Integration => "integration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PhaseStatus {
    Completed,
    Failed,
    TimedOut,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseReport {
    pub phase: DiscoveryPhase,
    pub status: PhaseStatus,
    pub identifiers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Persisted record of one successful discovery update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub actions_found: usize,
    pub new_actions: usize,
    pub updated_actions: usize,
    pub sources_touched: Vec<String>,
    pub phases: Vec<PhaseReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_sha256: Option<String>,
    pub success: bool,
}

/// Persisted record of a discovery update that failed at the top level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub phase: DiscoveryPhase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_ladder_orders_by_trust() {
        assert!(Confidence::Authoritative > Confidence::High);
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
        assert_eq!(
            [Confidence::Medium, Confidence::Authoritative, Confidence::Low]
                .into_iter()
                .max(),
            Some(Confidence::Authoritative)
        );
    }

    #[test]
    fn step_up_stops_below_authoritative() {
        assert_eq!(Confidence::Low.step_up_below_authoritative(), Confidence::Medium);
        assert_eq!(Confidence::Medium.step_up_below_authoritative(), Confidence::High);
        assert_eq!(Confidence::High.step_up_below_authoritative(), Confidence::High);
        assert_eq!(
            Confidence::Authoritative.step_up_below_authoritative(),
            Confidence::Authoritative
        );
    }

    #[test]
    fn parameter_type_labels_are_lossy() {
        assert_eq!(ParameterType::from_label("Text"), ParameterType::String);
        assert_eq!(ParameterType::from_label("integer"), ParameterType::Number);
        assert_eq!(ParameterType::from_label("WFDictionary"), ParameterType::Any);
    }

    #[test]
    fn ledger_defaults_to_epoch() {
        let ledger = Ledger::default();
        assert_eq!(ledger.last_update_timestamp.timestamp(), 0);
        assert_eq!(ledger.schema_version, LEDGER_SCHEMA_VERSION);
    }

    #[test]
    fn record_deserializes_with_defaults() {
        let record: ActionRecord =
            serde_json::from_str(r#"{"identifier":"is.workflow.actions.alert"}"#).unwrap();
        assert_eq!(record.permissions, "none");
        assert_eq!(record.confidence, Confidence::Low);
        assert!(record.parameters.is_empty());
        assert!(!record.deprecated);
    }

    #[test]
    fn metadata_accepts_source_list_alias() {
        let json = r#"{
            "metadata": {
                "version": "1.0",
                "generatedAt": "2026-01-01T00:00:00Z",
                "sourceList": [{"sourceTag": "official", "recordCount": 2, "priorityRank": 0}]
            },
            "actions": {}
        }"#;
        let db: CanonicalDatabase = serde_json::from_str(json).unwrap();
        assert_eq!(db.metadata.sources.len(), 1);
        assert_eq!(db.metadata.sources[0].source_tag, "official");
    }
}

//! Pipeline boundary: source files, raw-shape detection, normalization,
//! categorization, and environment probes.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use actcat_core::{
    default_permissions, ActionRecord, Confidence, InputSpec, OutputSpec, Parameter, ParameterType,
};
use actcat_storage::{BreakerError, CircuitBreaker, CircuitBreakerConfig};
use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "actcat-adapters";

// ---------------------------------------------------------------------------
// Source files
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source file {} not found", path.display())]
    Missing { path: PathBuf },
    #[error("reading source file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing source file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("source file {} is not a JSON object of actions", path.display())]
    Shape { path: PathBuf },
}

/// One merge input: either `{metadata?, actions: {...}}` or a bare identifier map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceDocument {
    pub metadata: Option<JsonValue>,
    pub actions: BTreeMap<String, JsonValue>,
}

impl SourceDocument {
    pub fn from_value(value: JsonValue) -> Option<Self> {
        let JsonValue::Object(mut top) = value else {
            return None;
        };
        if matches!(top.get("actions"), Some(JsonValue::Object(_))) {
            let metadata = top.remove("metadata");
            let Some(JsonValue::Object(actions)) = top.remove("actions") else {
                return None;
            };
            return Some(Self {
                metadata,
                actions: actions.into_iter().collect(),
            });
        }
        Some(Self {
            metadata: None,
            actions: top.into_iter().collect(),
        })
    }
}

pub fn load_source_file(path: impl AsRef<Path>) -> Result<SourceDocument, SourceError> {
    let path = path.as_ref();
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(SourceError::Missing {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(SourceError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let value: JsonValue = serde_json::from_str(&text).map_err(|source| SourceError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    SourceDocument::from_value(value).ok_or_else(|| SourceError::Shape {
        path: path.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Raw shapes + normalization
// ---------------------------------------------------------------------------

/// Shape of one raw record, resolved once before any typed logic runs.
#[derive(Debug, Clone, PartialEq)]
pub enum RawShape {
    /// `["Text", "Count"]`: bare parameter keys.
    ParameterKeys(Vec<String>),
    /// `[{"key": "Text", "type": "string"}, ...]`: structured parameters.
    ParameterObjects(Vec<JsonMap<String, JsonValue>>),
    /// `{"name": ..., "parameters": ...}`: a full record.
    Record(JsonMap<String, JsonValue>),
    /// Anything else; yields a minimally populated record.
    Opaque,
}

impl RawShape {
    pub fn detect(value: &JsonValue) -> Self {
        match value {
            JsonValue::Array(items) if items.iter().all(JsonValue::is_string) => Self::ParameterKeys(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect(),
            ),
            JsonValue::Array(items) => Self::ParameterObjects(
                items
                    .iter()
                    .filter_map(|item| match item {
                        JsonValue::Object(map) => Some(map.clone()),
                        JsonValue::String(key) => {
                            let mut map = JsonMap::new();
                            map.insert("key".into(), JsonValue::String(key.clone()));
                            map.insert("type".into(), JsonValue::String("string".into()));
                            Some(map)
                        }
                        _ => None,
                    })
                    .collect(),
            ),
            JsonValue::Object(map) => Self::Record(map.clone()),
            _ => Self::Opaque,
        }
    }
}

/// Detect the raw shape of `value` and normalize it.
pub fn normalize_value(identifier: &str, value: &JsonValue, default_confidence: Confidence) -> ActionRecord {
    normalize(identifier, RawShape::detect(value), default_confidence)
}

/// Build a canonical record from one raw record. Never fails.
pub fn normalize(identifier: &str, shape: RawShape, default_confidence: Confidence) -> ActionRecord {
    let mut record = inferred_record(identifier);
    record.confidence = default_confidence;

    match shape {
        RawShape::ParameterKeys(keys) => {
            record.parameters = dedupe_parameters(keys.into_iter().map(Parameter::keyed));
        }
        RawShape::ParameterObjects(objects) => {
            record.parameters =
                dedupe_parameters(objects.iter().filter_map(|obj| parameter_from_object(obj, None)));
        }
        RawShape::Record(map) => apply_record_fields(&mut record, &map),
        RawShape::Opaque => {}
    }
    record
}

/// Heuristic-only record for an identifier observed with no sample payload.
pub fn normalize_discovered(identifier: &str) -> ActionRecord {
    let mut record = inferred_record(identifier);
    record.confidence = Confidence::Low;
    record.keywords = trailing_words(identifier)
        .into_iter()
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1)
        .collect();
    record.permissions = infer_permissions(identifier).to_string();
    record
}

fn inferred_record(identifier: &str) -> ActionRecord {
    ActionRecord {
        identifier: identifier.to_string(),
        name: display_name_from_identifier(identifier),
        category: categorize(identifier).to_string(),
        permissions: default_permissions(),
        ..Default::default()
    }
}

fn apply_record_fields(record: &mut ActionRecord, map: &JsonMap<String, JsonValue>) {
    if let Some(name) = non_empty_str(map, &["name", "title"]) {
        record.name = name;
    }
    if let Some(description) = non_empty_str(map, &["description", "summary"]) {
        record.description = description;
    }
    if let Some(category) = non_empty_str(map, &["category"]) {
        record.category = category.to_lowercase();
    }
    record.action_class = non_empty_str(map, &["actionClass", "class"]);
    if let Some(value) = map.get("parameters") {
        record.parameters = parse_parameters(value);
    }
    if let Some(value) = map.get("input") {
        record.input = parse_input(value);
    }
    if let Some(value) = map.get("output") {
        let input = parse_input(value);
        record.output = OutputSpec {
            types: input.types,
            multiple: input.multiple,
        };
    }
    record.keywords = string_set(map.get("keywords"));
    if let Some(permissions) = non_empty_str(map, &["permissions"]) {
        record.permissions = permissions;
    }
    record.minimum_version = map
        .get("minimumVersion")
        .or_else(|| map.get("minVersion"))
        .and_then(scalar_to_string);
    record.deprecated = map.get("deprecated").and_then(JsonValue::as_bool).unwrap_or(false);
    if let Some(confidence) = map
        .get("confidence")
        .and_then(JsonValue::as_str)
        .and_then(Confidence::parse)
    {
        record.confidence = confidence;
    }
    record.sources = string_set(map.get("sources"));
    record.usage_examples = string_set(map.get("usageExamples"));
    record.related_actions = string_set(map.get("relatedActions"));
    record.alternatives = string_set(map.get("alternatives"));
}

fn non_empty_str(map: &JsonMap<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .filter_map(JsonValue::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// String arrays, scalar strings, or comma-separated strings into a set.
fn string_set(value: Option<&JsonValue>) -> BTreeSet<String> {
    match value {
        Some(JsonValue::Array(items)) => items.iter().filter_map(scalar_to_string).collect(),
        Some(JsonValue::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn parse_parameters(value: &JsonValue) -> Vec<Parameter> {
    match value {
        JsonValue::Object(map) => dedupe_parameters(map.iter().filter_map(|(key, spec)| match spec {
            JsonValue::Object(obj) => parameter_from_object(obj, Some(key)),
            JsonValue::String(label) => Some(Parameter {
                key: key.clone(),
                param_type: ParameterType::from_label(label),
                ..Default::default()
            }),
            _ => Some(Parameter::keyed(key.clone())),
        })),
        other => match RawShape::detect(other) {
            RawShape::ParameterKeys(keys) => dedupe_parameters(keys.into_iter().map(Parameter::keyed)),
            RawShape::ParameterObjects(objects) => {
                dedupe_parameters(objects.iter().filter_map(|obj| parameter_from_object(obj, None)))
            }
            RawShape::Record(_) | RawShape::Opaque => Vec::new(),
        },
    }
}

fn parameter_from_object(obj: &JsonMap<String, JsonValue>, fallback_key: Option<&String>) -> Option<Parameter> {
    let key = non_empty_str(obj, &["key", "name", "id"]).or_else(|| fallback_key.cloned())?;
    let options = obj.get("options").and_then(JsonValue::as_array).map(|items| {
        items
            .iter()
            .filter_map(scalar_to_string)
            .collect::<Vec<_>>()
    });
    Some(Parameter {
        key,
        param_type: obj
            .get("type")
            .and_then(JsonValue::as_str)
            .map(ParameterType::from_label)
            .unwrap_or_default(),
        label: non_empty_str(obj, &["label"]),
        description: non_empty_str(obj, &["description"]),
        required: obj.get("required").and_then(JsonValue::as_bool).unwrap_or(false),
        default_value: obj
            .get("defaultValue")
            .or_else(|| obj.get("default"))
            .filter(|v| !v.is_null())
            .cloned(),
        options,
        validation: obj.get("validation").filter(|v| !v.is_null()).cloned(),
    })
}

/// Keep the first parameter seen for each key, preserving order.
fn dedupe_parameters(params: impl IntoIterator<Item = Parameter>) -> Vec<Parameter> {
    let mut seen = BTreeSet::new();
    params
        .into_iter()
        .filter(|p| !p.key.is_empty() && seen.insert(p.key.clone()))
        .collect()
}

fn parse_input(value: &JsonValue) -> InputSpec {
    match value {
        JsonValue::Object(map) => InputSpec {
            types: string_set(map.get("types").or_else(|| map.get("type"))),
            multiple: map.get("multiple").and_then(JsonValue::as_bool).unwrap_or(false),
            parameter_key: non_empty_str(map, &["parameterKey"]),
        },
        JsonValue::Array(_) | JsonValue::String(_) => InputSpec {
            types: string_set(Some(value)),
            ..Default::default()
        },
        _ => InputSpec::default(),
    }
}

/// Human name from the trailing dot segment: `getURLContents` -> `Get URL Contents`.
pub fn display_name_from_identifier(identifier: &str) -> String {
    let mut name = trailing_words(identifier).join(" ");
    if let Some(first) = name.chars().next() {
        let upper = first.to_uppercase().collect::<String>();
        name.replace_range(..first.len_utf8(), &upper);
    }
    name
}

fn trailing_words(identifier: &str) -> Vec<String> {
    let segment = identifier.rsplit('.').next().unwrap_or(identifier);
    let chars: Vec<char> = segment.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();
    for (i, &ch) in chars.iter().enumerate() {
        if ch == '_' || ch == '-' || ch.is_whitespace() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if ch.is_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_is_lower) {
                words.push(std::mem::take(&mut current));
            }
        }
        current.push(ch);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

const PERMISSION_HINTS: &[(&str, &str)] = &[
    ("location", "location"),
    ("contact", "contacts"),
    ("photo", "photos"),
    ("health", "health"),
    ("calendar", "calendar"),
    ("reminder", "reminders"),
];

fn infer_permissions(identifier: &str) -> &'static str {
    let lower = identifier.to_lowercase();
    PERMISSION_HINTS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, tag)| *tag)
        .unwrap_or("none")
}

// ---------------------------------------------------------------------------
// Categorizer
// ---------------------------------------------------------------------------

pub const FALLBACK_CATEGORY: &str = "general";

/// Ordered (category, keywords) table. The first category with a matching
/// keyword wins, so table order is part of the contract.
pub const CATEGORY_TABLE: &[(&str, &[&str])] = &[
    (
        "scripting",
        &[
            "script", "variable", "dictionary", "repeat", "conditional", "choosefrom", "math",
            "calculate", "randomnumber", "count", "wait", "exit", "comment", "nothing", "getvalue",
            "setvalue",
        ],
    ),
    (
        "text",
        &["text", "string", "clipboard", "speak", "dictate", "translate", "markdown"],
    ),
    (
        "media",
        &["photo", "image", "video", "music", "audio", "camera", "playlist", "podcast", "gif", "media"],
    ),
    (
        "documents",
        &["file", "document", "pdf", "folder", "note", "archive", "zip", "print"],
    ),
    (
        "sharing",
        &["share", "airdrop", "email", "mail", "message", "sms", "tweet", "post"],
    ),
    (
        "web",
        &["url", "web", "safari", "http", "download", "rss", "article", "html"],
    ),
    (
        "location",
        &["location", "map", "address", "directions", "weather", "geo", "travel"],
    ),
    (
        "calendar",
        &["calendar", "event", "reminder", "alarm", "timer", "date", "schedule"],
    ),
    ("contacts", &["contact", "phone", "call", "facetime", "person"]),
    ("health", &["health", "workout", "fitness", "sleep", "heart", "step"]),
    (
        "device",
        &[
            "device", "battery", "wifi", "bluetooth", "brightness", "volume", "flashlight",
            "airplane", "screen", "orientation", "lowpower", "donotdisturb", "focus",
        ],
    ),
    (
        "apps",
        &["openapp", "launch", "application", "shortcut", "siri", "intent", "appstore"],
    ),
    (
        "notification",
        &["notification", "alert", "notify", "banner", "vibrate", "sound"],
    ),
];

/// Category for `identifier` by first keyword match in [`CATEGORY_TABLE`].
pub fn categorize(identifier: &str) -> &'static str {
    categorize_with(CATEGORY_TABLE, identifier)
}

pub fn categorize_with(table: &[(&'static str, &[&str])], identifier: &str) -> &'static str {
    let lower = identifier.to_lowercase();
    table
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or(FALLBACK_CATEGORY)
}

// ---------------------------------------------------------------------------
// Environment probes
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("spawning `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    NonZeroExit {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("inspection suspended after repeated failures")]
    Suspended,
    #[error("{0}")]
    Unavailable(String),
}

/// Read-only view of the runtime environment used by discovery.
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn enumerate_installed_items(&self) -> Result<Vec<String>, ProbeError>;

    async fn inspect_item(&self, name: &str) -> Result<String, ProbeError>;

    async fn scan_known_locations(&self) -> Result<Vec<String>, ProbeError>;
}

#[derive(Debug, Clone)]
pub struct ShellProbeConfig {
    pub list_command: Vec<String>,
    pub inspect_command: Vec<String>,
    pub known_locations: Vec<PathBuf>,
    pub min_string_len: usize,
    pub inspect_breaker: CircuitBreakerConfig,
}

impl Default for ShellProbeConfig {
    fn default() -> Self {
        Self {
            list_command: vec!["shortcuts".into(), "list".into()],
            inspect_command: vec!["shortcuts".into(), "view".into()],
            known_locations: vec![
                PathBuf::from("/System/Library/PrivateFrameworks/WorkflowKit.framework/WorkflowKit"),
                PathBuf::from("/System/Library/PrivateFrameworks/ActionKit.framework/ActionKit"),
                PathBuf::from("/System/Applications/Shortcuts.app/Contents/MacOS/Shortcuts"),
            ],
            min_string_len: 8,
            inspect_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(300),
            },
        }
    }
}

/// Probe backed by OS tooling. Child processes are killed if the caller's
/// time budget drops the future.
#[derive(Debug)]
pub struct ShellProbe {
    config: ShellProbeConfig,
    inspect_breaker: CircuitBreaker,
}

impl ShellProbe {
    pub fn new(config: ShellProbeConfig) -> Self {
        let inspect_breaker = CircuitBreaker::new(config.inspect_breaker);
        Self {
            config,
            inspect_breaker,
        }
    }

    async fn run_command(&self, argv: &[String], extra: Option<&str>) -> Result<String, ProbeError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ProbeError::Unavailable("empty command".into()));
        };
        let command_line = match extra {
            Some(arg) => format!("{} {arg}", argv.join(" ")),
            None => argv.join(" "),
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(arg) = extra {
            cmd.arg(arg);
        }
        let output = cmd.output().await.map_err(|source| ProbeError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(ProbeError::NonZeroExit {
                command: command_line,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl EnvironmentProbe for ShellProbe {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn enumerate_installed_items(&self) -> Result<Vec<String>, ProbeError> {
        let stdout = self.run_command(&self.config.list_command, None).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    async fn inspect_item(&self, name: &str) -> Result<String, ProbeError> {
        self.inspect_breaker
            .call(|| self.run_command(&self.config.inspect_command, Some(name)))
            .await
            .map_err(|err| match err {
                BreakerError::Open => ProbeError::Suspended,
                BreakerError::Inner(inner) => inner,
            })
    }

    async fn scan_known_locations(&self) -> Result<Vec<String>, ProbeError> {
        let mut blobs = Vec::new();
        for path in &self.config.known_locations {
            match tokio::fs::read(path).await {
                Ok(bytes) => blobs.push(printable_strings(&bytes, self.config.min_string_len).join("\n")),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "known location absent");
                }
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "known location unreadable");
                }
            }
        }
        Ok(blobs)
    }
}

/// Runs of printable ASCII at least `min_len` long, like `strings(1)`.
pub fn printable_strings(bytes: &[u8], min_len: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for &byte in bytes {
        if byte.is_ascii_graphic() || byte == b' ' {
            current.push(byte as char);
            continue;
        }
        if current.len() >= min_len {
            out.push(std::mem::take(&mut current));
        } else {
            current.clear();
        }
    }
    if current.len() >= min_len {
        out.push(current);
    }
    out
}

/// Scripted fake probe returning fixed strings; no processes are spawned.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProbe {
    pub installed: Vec<String>,
    pub contents: BTreeMap<String, String>,
    pub location_blobs: Vec<String>,
    pub fail_enumeration: bool,
    pub fail_locations: bool,
    pub delay: Option<Duration>,
}

impl ScriptedProbe {
    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl EnvironmentProbe for ScriptedProbe {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn enumerate_installed_items(&self) -> Result<Vec<String>, ProbeError> {
        self.pause().await;
        if self.fail_enumeration {
            return Err(ProbeError::Unavailable("scripted enumeration failure".into()));
        }
        Ok(self.installed.clone())
    }

    async fn inspect_item(&self, name: &str) -> Result<String, ProbeError> {
        self.contents
            .get(name)
            .cloned()
            .ok_or_else(|| ProbeError::Unavailable(format!("no scripted content for {name}")))
    }

    async fn scan_known_locations(&self) -> Result<Vec<String>, ProbeError> {
        self.pause().await;
        if self.fail_locations {
            return Err(ProbeError::Unavailable("scripted location failure".into()));
        }
        Ok(self.location_blobs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn categorize_uses_first_matching_category() {
        assert_eq!(categorize("is.workflow.actions.gettext"), "text");
        assert_eq!(categorize("is.workflow.actions.setclipboard"), "text");
        assert_eq!(categorize("is.workflow.actions.notification"), "notification");
        assert_eq!(categorize("is.workflow.actions.takephoto"), "media");
        assert_eq!(categorize("is.workflow.actions.count"), "scripting");
        assert_eq!(categorize("is.workflow.actions.newone"), FALLBACK_CATEGORY);
        assert_eq!(categorize("com.apple.mobiletimer.timer"), "calendar");
    }

    #[test]
    fn categorize_is_referentially_transparent() {
        let ids = ["is.workflow.actions.url", "com.apple.Health.log", "plain", "a.b.c"];
        for id in ids {
            let first = categorize(id);
            for _ in 0..5 {
                assert_eq!(categorize(id), first);
            }
        }
    }

    #[test]
    fn categorize_with_custom_table_respects_order() {
        let table: &[(&str, &[&str])] = &[("first", &["abc"]), ("second", &["abc", "xyz"])];
        assert_eq!(categorize_with(table, "x.ABC"), "first");
        assert_eq!(categorize_with(table, "x.xyz"), "second");
        assert_eq!(categorize_with(table, "x.q"), FALLBACK_CATEGORY);
    }

    #[test]
    fn display_name_splits_camel_case() {
        assert_eq!(display_name_from_identifier("is.workflow.actions.getClipboard"), "Get Clipboard");
        assert_eq!(display_name_from_identifier("is.workflow.actions.getURLContents"), "Get URL Contents");
        assert_eq!(display_name_from_identifier("is.workflow.actions.newone"), "Newone");
        assert_eq!(display_name_from_identifier("simpleid"), "Simpleid");
        assert_eq!(display_name_from_identifier("a.b.show_result"), "Show result");
    }

    #[test]
    fn detects_each_raw_shape() {
        assert!(matches!(RawShape::detect(&json!(["A", "B"])), RawShape::ParameterKeys(k) if k == ["A", "B"]));
        assert!(matches!(
            RawShape::detect(&json!([{"key": "A"}, "B", 3])),
            RawShape::ParameterObjects(objs) if objs.len() == 2
        ));
        assert!(matches!(RawShape::detect(&json!({"name": "x"})), RawShape::Record(_)));
        assert_eq!(RawShape::detect(&json!(null)), RawShape::Opaque);
    }

    #[test]
    fn bare_string_array_becomes_optional_string_parameters() {
        let record = normalize_value("is.workflow.actions.alert", &json!(["Title", "Body", "Title"]), Confidence::Medium);
        assert_eq!(record.parameters.len(), 2);
        assert!(record.parameters.iter().all(|p| !p.required && p.param_type == ParameterType::String));
        assert_eq!(record.name, "Alert");
        assert_eq!(record.category, "notification");
        assert_eq!(record.confidence, Confidence::Medium);
    }

    #[test]
    fn full_record_fields_are_normalized() {
        let raw = json!({
            "name": "Get Contents of URL",
            "description": "Fetches a URL.",
            "parameters": {
                "WFURL": {"type": "url", "required": true, "label": "URL"},
                "WFMethod": {"type": "enum", "options": ["GET", "POST"], "default": "GET"},
                "WFTimeout": "number"
            },
            "input": ["URL", "Text"],
            "output": {"types": "Dictionary", "multiple": true},
            "keywords": "fetch, http",
            "minimumVersion": 13,
            "confidence": "high",
            "sources": ["legacy"],
            "usageExamples": ["download json"]
        });
        let record = normalize_value("is.workflow.actions.downloadurl", &raw, Confidence::Medium);
        assert_eq!(record.name, "Get Contents of URL");
        assert_eq!(record.category, "web");
        assert_eq!(record.confidence, Confidence::High);
        let url = record.parameter("WFURL").unwrap();
        assert!(url.required);
        assert_eq!(url.param_type, ParameterType::Url);
        let method = record.parameter("WFMethod").unwrap();
        assert_eq!(method.options.as_deref(), Some(&["GET".to_string(), "POST".to_string()][..]));
        assert_eq!(method.default_value, Some(json!("GET")));
        assert_eq!(record.parameter("WFTimeout").unwrap().param_type, ParameterType::Number);
        assert_eq!(record.input.types.len(), 2);
        assert!(record.output.multiple);
        assert!(record.keywords.contains("http"));
        assert_eq!(record.minimum_version.as_deref(), Some("13"));
        assert!(record.sources.contains("legacy"));
        assert_eq!(record.permissions, "none");
    }

    #[test]
    fn opaque_input_yields_minimal_record() {
        let record = normalize_value("is.workflow.actions.wait", &json!(42), Confidence::Low);
        assert_eq!(record.name, "Wait");
        assert_eq!(record.category, "scripting");
        assert!(record.parameters.is_empty());
        assert!(record.description.is_empty());
    }

    #[test]
    fn discovered_records_use_identifier_heuristics_only() {
        let record = normalize_discovered("is.workflow.actions.getCurrentLocation");
        assert_eq!(record.confidence, Confidence::Low);
        assert_eq!(record.name, "Get Current Location");
        assert_eq!(record.category, "location");
        assert_eq!(record.permissions, "location");
        assert!(record.keywords.contains("current"));
        assert!(record.sources.is_empty());
    }

    #[test]
    fn source_files_resolve_to_distinct_outcomes() {
        let dir = tempdir().unwrap();
        let missing = load_source_file(dir.path().join("absent.json"));
        assert!(matches!(missing, Err(SourceError::Missing { .. })));

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ nope").unwrap();
        assert!(matches!(load_source_file(&broken), Err(SourceError::Parse { .. })));

        let scalar = dir.path().join("scalar.json");
        fs::write(&scalar, "[1,2]").unwrap();
        assert!(matches!(load_source_file(&scalar), Err(SourceError::Shape { .. })));

        let wrapped = dir.path().join("wrapped.json");
        fs::write(&wrapped, r#"{"metadata": {"v": 1}, "actions": {"a.b": {}}}"#).unwrap();
        let doc = load_source_file(&wrapped).unwrap();
        assert!(doc.metadata.is_some());
        assert_eq!(doc.actions.keys().collect::<Vec<_>>(), ["a.b"]);

        let bare = dir.path().join("bare.json");
        fs::write(&bare, r#"{"x.y": ["A"], "z": {}}"#).unwrap();
        let doc = load_source_file(&bare).unwrap();
        assert!(doc.metadata.is_none());
        assert_eq!(doc.actions.len(), 2);
    }

    #[test]
    fn printable_strings_skip_short_runs() {
        let bytes = b"\x00\x01is.workflow.actions.alert\x00ab\x00hello world\xff";
        assert_eq!(
            printable_strings(bytes, 5),
            vec!["is.workflow.actions.alert".to_string(), "hello world".to_string()]
        );
    }

    #[tokio::test]
    async fn scripted_probe_returns_fixed_strings() {
        let probe = ScriptedProbe {
            installed: vec!["Morning".into()],
            contents: BTreeMap::from([("Morning".into(), "is.workflow.actions.alert".into())]),
            ..Default::default()
        };
        assert_eq!(probe.enumerate_installed_items().await.unwrap(), ["Morning"]);
        assert!(probe.inspect_item("Morning").await.unwrap().contains("alert"));
        assert!(probe.inspect_item("Evening").await.is_err());
        assert!(probe.scan_known_locations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shell_probe_lists_lines_and_suspends_failing_inspection() {
        let probe = ShellProbe::new(ShellProbeConfig {
            list_command: vec!["sh".into(), "-c".into(), "printf 'Morning\\n\\nEvening\\n'".into()],
            inspect_command: vec!["false".into()],
            known_locations: vec![PathBuf::from("/definitely/not/here")],
            min_string_len: 4,
            inspect_breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(600),
            },
        });

        assert_eq!(probe.enumerate_installed_items().await.unwrap(), ["Morning", "Evening"]);
        assert!(matches!(probe.inspect_item("a").await, Err(ProbeError::NonZeroExit { .. })));
        assert!(matches!(probe.inspect_item("b").await, Err(ProbeError::NonZeroExit { .. })));
        assert!(matches!(probe.inspect_item("c").await, Err(ProbeError::Suspended)));
        assert!(probe.scan_known_locations().await.unwrap().is_empty());
    }
}

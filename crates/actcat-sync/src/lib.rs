//! Merge pipeline: ordered sources -> normalize -> resolve -> validate -> write.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use actcat_adapters::{load_source_file, normalize_value, SourceError};
use actcat_core::{
    ActionRecord, CanonicalDatabase, Confidence, Parameter, ParameterType, SourceSummary,
    PRIMARY_NAMESPACE, VENDOR_NAMESPACE,
};
use actcat_storage::CatalogStore;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "actcat-sync";

pub const DEFAULT_DIGEST_CATEGORY_CAP: usize = 50;
const DIGEST_PARAMETER_PREVIEW: usize = 3;

// ---------------------------------------------------------------------------
// Configuration + source registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub digest_category_cap: usize,
}

impl MergeConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: std::env::var("ACTCAT_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            data_dir: std::env::var("ACTCAT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            digest_category_cap: std::env::var("ACTCAT_DIGEST_CATEGORY_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DIGEST_CATEGORY_CAP),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Hand-maintained or extracted input; the registry tag is stamped on its records.
    #[default]
    Raw,
    /// A previously emitted catalog; records keep their embedded provenance.
    Canonical,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub tag: String,
    pub path: PathBuf,
    #[serde(default)]
    pub primary: bool,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub confidence: Option<Confidence>,
    #[serde(default)]
    pub kind: SourceKind,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceConfig {
    pub fn raw(tag: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            tag: tag.into(),
            path: path.into(),
            primary: false,
            enabled: true,
            confidence: None,
            kind: SourceKind::Raw,
        }
    }

    pub fn primary(tag: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            primary: true,
            ..Self::raw(tag, path)
        }
    }

    pub fn canonical(tag: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: SourceKind::Canonical,
            ..Self::raw(tag, path)
        }
    }

    /// Confidence for records that do not state one.
    pub fn default_confidence(&self) -> Confidence {
        self.confidence.unwrap_or(if self.primary {
            Confidence::Authoritative
        } else {
            Confidence::Medium
        })
    }
}

#[derive(Debug, Clone)]
pub struct RankedSource {
    pub rank: usize,
    pub config: SourceConfig,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    /// Enabled sources in processing order: the primary source first, then
    /// registry order.
    pub fn ordered(&self) -> Result<Vec<RankedSource>> {
        let enabled: Vec<&SourceConfig> = self.sources.iter().filter(|s| s.enabled).collect();
        let primaries = enabled.iter().filter(|s| s.primary).count();
        if primaries > 1 {
            bail!("source registry declares {primaries} primary sources; at most one is allowed");
        }
        if let Some(source) = enabled
            .iter()
            .find(|s| !s.primary && s.confidence == Some(Confidence::Authoritative))
        {
            bail!(
                "source `{}` declares authoritative confidence but is not the primary source",
                source.tag
            );
        }
        let mut seen = BTreeSet::new();
        for source in &enabled {
            if !seen.insert(source.tag.as_str()) {
                bail!("source tag `{}` is declared more than once", source.tag);
            }
        }
        Ok(enabled
            .iter()
            .filter(|s| s.primary)
            .chain(enabled.iter().filter(|s| !s.primary))
            .enumerate()
            .map(|(rank, config)| RankedSource {
                rank,
                config: (*config).clone(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Merge resolver
// ---------------------------------------------------------------------------

/// The source a record is being merged from.
#[derive(Debug, Clone)]
pub struct MergeSource {
    pub tag: String,
    pub authoritative: bool,
    pub stamp_provenance: bool,
}

impl MergeSource {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            tag: config.tag.clone(),
            authoritative: config.primary,
            stamp_provenance: config.kind == SourceKind::Raw,
        }
    }

    /// Confidence a record from this source may carry: only the primary
    /// source can vouch for `Authoritative`.
    pub fn admit(&self, confidence: Confidence) -> Confidence {
        if self.authoritative {
            confidence
        } else {
            confidence.min(Confidence::High)
        }
    }

    fn provenance(&self, incoming: &ActionRecord) -> BTreeSet<String> {
        let mut tags = incoming.sources.clone();
        if self.stamp_provenance {
            tags.insert(self.tag.clone());
        }
        tags
    }
}

/// Merge `incoming` into `existing`. Order-dependent: an authoritative record
/// only accumulates provenance and auxiliary data from non-authoritative sources.
pub fn merge(mut existing: ActionRecord, incoming: ActionRecord, source: &MergeSource) -> ActionRecord {
    existing.sources.extend(source.provenance(&incoming));
    existing.usage_examples.extend(incoming.usage_examples.iter().cloned());
    existing.related_actions.extend(incoming.related_actions.iter().cloned());

    if existing.is_authoritative() && !source.authoritative {
        return existing;
    }

    if existing.name.is_empty() {
        existing.name = incoming.name;
    }
    if existing.description.is_empty() {
        existing.description = incoming.description;
    }
    if existing.category.is_empty() {
        existing.category = incoming.category;
    }
    if existing.action_class.is_none() {
        existing.action_class = incoming.action_class;
    }
    existing.parameters = merge_parameters(existing.parameters, incoming.parameters);
    if existing.input.is_empty() {
        existing.input = incoming.input;
    }
    if existing.output.is_empty() {
        existing.output = incoming.output;
    }
    existing.keywords.extend(incoming.keywords);
    if existing.permissions.is_empty() || existing.permissions == "none" {
        existing.permissions = incoming.permissions;
    }
    if existing.minimum_version.is_none() {
        existing.minimum_version = incoming.minimum_version;
    }
    existing.alternatives.extend(incoming.alternatives);
    existing.confidence = existing.confidence.max(source.admit(incoming.confidence));
    existing
}

/// Union by key; the existing field wins unless it is empty.
fn merge_parameters(existing: Vec<Parameter>, incoming: Vec<Parameter>) -> Vec<Parameter> {
    let mut incoming_by_key: BTreeMap<String, Parameter> = BTreeMap::new();
    let mut incoming_order = Vec::new();
    for param in incoming {
        if !incoming_by_key.contains_key(&param.key) {
            incoming_order.push(param.key.clone());
            incoming_by_key.insert(param.key.clone(), param);
        }
    }

    let mut merged: Vec<Parameter> = existing
        .into_iter()
        .map(|mut param| {
            if let Some(other) = incoming_by_key.remove(&param.key) {
                if param.param_type == ParameterType::Any {
                    param.param_type = other.param_type;
                }
                param.label = param.label.or(other.label);
                param.description = param.description.or(other.description);
                param.required = param.required || other.required;
                param.default_value = param.default_value.or(other.default_value);
                param.options = param.options.or(other.options);
                param.validation = param.validation.or(other.validation);
            }
            param
        })
        .collect();

    merged.extend(
        incoming_order
            .into_iter()
            .filter_map(|key| incoming_by_key.remove(&key)),
    );
    merged
}

/// Accumulates records across sources, keyed by identifier.
#[derive(Debug, Default)]
pub struct MergeResolver {
    records: BTreeMap<String, ActionRecord>,
}

impl MergeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, incoming: ActionRecord, source: &MergeSource) {
        match self.records.remove(&incoming.identifier) {
            Some(existing) => {
                let merged = merge(existing, incoming, source);
                self.records.insert(merged.identifier.clone(), merged);
            }
            None => {
                let mut record = incoming;
                record.sources = source.provenance(&record);
                record.confidence = source.admit(record.confidence);
                self.records.insert(record.identifier.clone(), record);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> BTreeMap<String, ActionRecord> {
        self.records
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Rejection {
    UnrecognizedNamespace,
    Deprecated,
}

#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    pub primary_prefix: String,
    pub vendor_prefixes: Vec<String>,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            primary_prefix: PRIMARY_NAMESPACE.to_string(),
            vendor_prefixes: vec![VENDOR_NAMESPACE.to_string()],
        }
    }
}

impl ValidationPolicy {
    pub fn check(&self, identifier: &str, record: &ActionRecord) -> Result<(), Rejection> {
        if !identifier.contains('.') {
            return Ok(());
        }
        if !identifier.starts_with(&self.primary_prefix) {
            if self.vendor_prefixes.iter().any(|p| identifier.starts_with(p.as_str())) {
                return Ok(());
            }
            return Err(Rejection::UnrecognizedNamespace);
        }
        // TODO: revisit once it is settled whether deprecated authoritative entries belong in output.
        if record.deprecated && !record.is_authoritative() {
            return Err(Rejection::Deprecated);
        }
        Ok(())
    }

    pub fn is_valid(&self, identifier: &str, record: &ActionRecord) -> bool {
        self.check(identifier, record).is_ok()
    }
}

pub fn is_valid(identifier: &str, record: &ActionRecord) -> bool {
    ValidationPolicy::default().is_valid(identifier, record)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub accepted: usize,
    pub rejected: BTreeMap<Rejection, usize>,
}

impl ValidationSummary {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }
}

// ---------------------------------------------------------------------------
// Canonical writer
// ---------------------------------------------------------------------------

/// Filter merged records through `policy` and assemble the canonical database.
pub fn build_database(
    records: BTreeMap<String, ActionRecord>,
    sources: Vec<SourceSummary>,
    policy: &ValidationPolicy,
    generated_at: DateTime<Utc>,
) -> (CanonicalDatabase, ValidationSummary) {
    let mut summary = ValidationSummary::default();
    let mut db = CanonicalDatabase::empty(generated_at);
    for (identifier, record) in records {
        match policy.check(&identifier, &record) {
            Ok(()) => {
                summary.accepted += 1;
                db.actions.insert(identifier, record);
            }
            Err(reason) => *summary.rejected.entry(reason).or_default() += 1,
        }
    }
    db.metadata.sources = sources;
    db.refresh_metadata(generated_at);
    (db, summary)
}

/// Category-grouped Markdown digest, at most `category_cap` entries per category.
pub fn render_digest(db: &CanonicalDatabase, category_cap: usize) -> String {
    let mut by_category: BTreeMap<&str, Vec<&ActionRecord>> = BTreeMap::new();
    for record in db.actions.values() {
        by_category.entry(record.category.as_str()).or_default().push(record);
    }

    let mut lines = vec![
        "# Action Catalog Digest".to_string(),
        String::new(),
        format!("- Generated: {}", db.metadata.generated_at.to_rfc3339()),
        format!("- Total actions: {}", db.metadata.total_actions),
        format!("- Categories: {}", db.metadata.categories.len()),
        String::new(),
    ];

    for (category, records) in by_category {
        lines.push(format!("## {category}"));
        lines.push(String::new());
        for record in records.iter().take(category_cap) {
            lines.push(digest_entry(record));
        }
        if records.len() > category_cap {
            lines.push(format!("- ... and {} more", records.len() - category_cap));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

fn digest_entry(record: &ActionRecord) -> String {
    let mut line = format!("- **{}** (`{}`)", record.name, record.identifier);
    if !record.description.is_empty() {
        line.push_str(&format!(": {}", record.description));
    }
    if !record.parameters.is_empty() {
        let mut keys = record
            .parameters
            .iter()
            .take(DIGEST_PARAMETER_PREVIEW)
            .map(|p| format!("`{}`", p.key))
            .collect::<Vec<_>>();
        if record.parameters.len() > DIGEST_PARAMETER_PREVIEW {
            keys.push("...".to_string());
        }
        line.push_str(&format!(" | params: {}", keys.join(", ")));
    }
    line
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_loaded: usize,
    pub sources_missing: usize,
    pub sources_failed: usize,
    pub records_merged: usize,
    pub validation: ValidationSummary,
    pub catalog_path: String,
    pub digest_path: String,
    pub catalog_sha256: String,
}

pub struct MergePipeline {
    config: MergeConfig,
    store: CatalogStore,
    policy: ValidationPolicy,
}

impl MergePipeline {
    pub fn new(config: MergeConfig, store: CatalogStore) -> Self {
        Self {
            config,
            store,
            policy: ValidationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ValidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub async fn run_once(&self) -> Result<MergeRunSummary> {
        let registry = self.load_source_registry().await?;
        self.run_with_registry(&registry, Utc::now()).await
    }

    /// Merge `registry`'s sources, stamping the catalog with `generated_at`.
    pub async fn run_with_registry(
        &self,
        registry: &SourceRegistry,
        generated_at: DateTime<Utc>,
    ) -> Result<MergeRunSummary> {
        let run_id = Uuid::new_v4();
        self.merge_sources(run_id, registry, generated_at)
            .instrument(info_span!("merge_run", %run_id))
            .await
    }

    async fn merge_sources(
        &self,
        run_id: Uuid,
        registry: &SourceRegistry,
        generated_at: DateTime<Utc>,
    ) -> Result<MergeRunSummary> {
        let started_at = Utc::now();
        let ordered = registry.ordered()?;

        let mut resolver = MergeResolver::new();
        let mut summaries = Vec::new();
        let (mut loaded, mut missing, mut failed) = (0usize, 0usize, 0usize);

        for ranked in &ordered {
            let source = &ranked.config;
            let path = self.resolve_source_path(&source.path);
            let document = match load_source_file(&path) {
                Ok(document) => document,
                Err(SourceError::Missing { path }) => {
                    info!(source = %source.tag, path = %path.display(), "source file absent; skipping");
                    missing += 1;
                    continue;
                }
                Err(err) => {
                    warn!(source = %source.tag, error = %err, "source file unusable; skipping");
                    failed += 1;
                    continue;
                }
            };

            let merge_source = MergeSource::from_config(source);
            let default_confidence = source.default_confidence();
            let record_count = document.actions.len();
            for (identifier, raw) in &document.actions {
                resolver.absorb(normalize_value(identifier, raw, default_confidence), &merge_source);
            }
            info!(source = %source.tag, rank = ranked.rank, records = record_count, "source merged");
            loaded += 1;
            // Re-ingested catalogs are seeds, not inputs; keep them out of the source list.
            if source.kind == SourceKind::Raw {
                summaries.push(SourceSummary {
                    source_tag: source.tag.clone(),
                    record_count,
                    priority_rank: ranked.rank,
                });
            }
        }

        let records_merged = resolver.len();
        let (db, validation) =
            build_database(resolver.into_records(), summaries, &self.policy, generated_at);
        let stored = self.store.write_catalog(&db).await?;
        let digest = self
            .store
            .write_digest(&render_digest(&db, self.config.digest_category_cap))
            .await?;

        info!(
            records = records_merged,
            accepted = validation.accepted,
            rejected = validation.rejected_total(),
            "merge run complete"
        );

        Ok(MergeRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources_loaded: loaded,
            sources_missing: missing,
            sources_failed: failed,
            records_merged,
            validation,
            catalog_path: stored.path.display().to_string(),
            digest_path: digest.path.display().to_string(),
            catalog_sha256: stored.content_hash,
        })
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        SourceRegistry::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn resolve_source_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.workspace_root.join(path)
        }
    }
}

pub async fn run_merge_once_from_env() -> Result<MergeRunSummary> {
    let config = MergeConfig::from_env();
    let store = CatalogStore::open(config.data_dir.clone()).await?;
    let summary = MergePipeline::new(config, store.clone()).run_once().await?;
    store.close().await?;
    Ok(summary)
}

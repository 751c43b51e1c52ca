use std::path::{Path, PathBuf};

use actcat_core::Confidence;
use actcat_storage::CatalogStore;
use actcat_sync::{
    MergeConfig, MergePipeline, Rejection, SourceKind, SourceRegistry, DEFAULT_DIGEST_CATEGORY_CAP,
};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::tempdir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn generated_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
}

/// The checked-in registry, with the previous-catalog entry pointed into `data_dir`.
fn registry_for(data_dir: &Path) -> SourceRegistry {
    let text = std::fs::read_to_string(workspace_root().join("sources.yaml")).unwrap();
    let mut registry = SourceRegistry::from_yaml(&text).unwrap();
    for source in &mut registry.sources {
        if source.kind == SourceKind::Canonical {
            source.path = data_dir.join("catalog.json");
        }
    }
    registry
}

async fn pipeline(data_dir: &Path) -> MergePipeline {
    let config = MergeConfig {
        workspace_root: workspace_root(),
        data_dir: data_dir.to_path_buf(),
        digest_category_cap: DEFAULT_DIGEST_CATEGORY_CAP,
    };
    let store = CatalogStore::open(data_dir).await.unwrap();
    MergePipeline::new(config, store)
}

#[test]
fn checked_in_registry_orders_primary_first_and_skips_disabled() {
    let text = std::fs::read_to_string(workspace_root().join("sources.yaml")).unwrap();
    let registry = SourceRegistry::from_yaml(&text).unwrap();
    let tags: Vec<_> = registry
        .ordered()
        .unwrap()
        .into_iter()
        .map(|ranked| ranked.config.tag)
        .collect();
    assert_eq!(tags, vec!["official", "community", "extracted", "previous"]);
}

#[tokio::test]
async fn fixture_sources_merge_into_validated_catalog() {
    let dir = tempdir().unwrap();
    let pipeline = pipeline(dir.path()).await;
    let summary = pipeline
        .run_with_registry(&registry_for(dir.path()), generated_at())
        .await
        .unwrap();

    assert_eq!(summary.sources_loaded, 3);
    assert_eq!(summary.sources_missing, 1);
    assert_eq!(summary.sources_failed, 0);
    assert_eq!(summary.records_merged, 9);
    assert_eq!(summary.validation.accepted, 7);
    assert_eq!(summary.validation.rejected.get(&Rejection::Deprecated), Some(&1));
    assert_eq!(
        summary.validation.rejected.get(&Rejection::UnrecognizedNamespace),
        Some(&1)
    );

    let db = pipeline.store().load_catalog().await.unwrap().unwrap();
    assert_eq!(db.metadata.total_actions, 7);
    let ids: Vec<_> = db.actions.keys().cloned().collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
    assert!(db.actions.contains_key("com.apple.mobilenotes.SharingExtension"));
    assert!(!db.actions.contains_key("org.example.thirdparty.sync"));
    assert!(!db.actions.contains_key("is.workflow.actions.legacy.savetocameraroll"));

    let gettext = &db.actions["is.workflow.actions.gettext"];
    assert_eq!(gettext.confidence, Confidence::Authoritative);
    assert_eq!(gettext.description, "Passes the specified text to the next action.");
    assert!(gettext.sources.contains("official"));
    assert!(gettext.sources.contains("community"));
    assert!(gettext.usage_examples.contains("Compose a message body"));

    let openurl = &db.actions["is.workflow.actions.openurl"];
    assert_eq!(openurl.confidence, Confidence::Medium);
    assert!(openurl.parameter("WFInput").is_some());
    assert!(openurl.input.types.contains("NSURL"));
    assert!(openurl.sources.contains("extracted"));

    let clipboard = &db.actions["is.workflow.actions.getclipboard"];
    assert_eq!(clipboard.confidence, Confidence::Low);
    assert!(clipboard.parameters.is_empty());

    let digest = tokio::fs::read_to_string(pipeline.store().digest_path())
        .await
        .unwrap();
    assert!(digest.starts_with("# Action Catalog Digest"));
    assert!(digest.contains("Total actions: 7"));
}

#[tokio::test]
async fn remerging_with_previous_catalog_is_stable() {
    let dir = tempdir().unwrap();
    let pipeline = pipeline(dir.path()).await;
    let registry = registry_for(dir.path());

    pipeline
        .run_with_registry(&registry, generated_at())
        .await
        .unwrap();
    let first = std::fs::read(pipeline.store().catalog_path()).unwrap();
    let first_digest = std::fs::read(pipeline.store().digest_path()).unwrap();

    let summary = pipeline
        .run_with_registry(&registry, generated_at())
        .await
        .unwrap();
    assert_eq!(summary.sources_missing, 0);
    assert_eq!(summary.sources_loaded, 4);

    assert_eq!(first, std::fs::read(pipeline.store().catalog_path()).unwrap());
    assert_eq!(first_digest, std::fs::read(pipeline.store().digest_path()).unwrap());

    let db = pipeline.store().load_catalog().await.unwrap().unwrap();
    let tags: Vec<_> = db
        .metadata
        .sources
        .iter()
        .map(|s| s.source_tag.as_str())
        .collect();
    assert_eq!(tags, ["official", "community", "extracted"]);
}

//! Injected catalog store handle + resiliency primitives for actcat.
//!
//! Every persisted artifact (catalog, digest, ledger, run reports) goes through
//! [`CatalogStore`], and every write is a temp-file write followed by an atomic
//! rename, so readers never observe a half-written file.

use std::future::Future;
use std::path::{Path, PathBuf};

use actcat_core::{CanonicalDatabase, ErrorReport, Ledger, RunReport};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "actcat-storage";

const CATALOG_FILE: &str = "catalog.json";
const DIGEST_FILE: &str = "digest.md";
const LEDGER_FILE: &str = "ledger.json";
const REPORTS_DIR: &str = "reports";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
}

/// Handle over the persisted catalog snapshot and its companion files.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    root: PathBuf,
}

impl CatalogStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        let reports = root.join(REPORTS_DIR);
        fs::create_dir_all(&reports)
            .await
            .with_context(|| format!("creating store directory {}", reports.display()))?;
        debug!(root = %root.display(), "catalog store opened");
        Ok(Self { root })
    }

    /// Release the handle. Writes are already durable; this only marks the end of use.
    pub async fn close(self) -> anyhow::Result<()> {
        debug!(root = %self.root.display(), "catalog store closed");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_FILE)
    }

    pub fn digest_path(&self) -> PathBuf {
        self.root.join(DIGEST_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join(REPORTS_DIR)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Write bytes to `path` via a sibling temp file and an atomic rename.
    pub async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredArtifact {
            content_hash: Self::sha256_hex(bytes),
            path: path.to_path_buf(),
            byte_size: bytes.len(),
        })
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> anyhow::Result<StoredArtifact> {
        let mut bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {}", path.display()))?;
        bytes.push(b'\n');
        self.write_atomic(path, &bytes).await
    }

    /// Load the persisted catalog. `Ok(None)` when no catalog has been written yet.
    pub async fn load_catalog(&self) -> anyhow::Result<Option<CanonicalDatabase>> {
        let path = self.catalog_path();
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let db = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(db))
    }

    pub async fn write_catalog(&self, db: &CanonicalDatabase) -> anyhow::Result<StoredArtifact> {
        let stored = self.write_json(&self.catalog_path(), db).await?;
        info!(
            actions = db.actions.len(),
            sha256 = %stored.content_hash,
            "catalog written"
        );
        Ok(stored)
    }

    pub async fn write_digest(&self, markdown: &str) -> anyhow::Result<StoredArtifact> {
        self.write_atomic(&self.digest_path(), markdown.as_bytes()).await
    }

    /// Load the ledger, falling back to the epoch default when absent.
    pub async fn load_ledger(&self) -> anyhow::Result<Ledger> {
        let path = self.ledger_path();
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(Ledger::default());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        match serde_json::from_str(&text) {
            Ok(ledger) => Ok(ledger),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable ledger; treating update as overdue");
                Ok(Ledger::default())
            }
        }
    }

    pub async fn write_ledger(&self, ledger: &Ledger) -> anyhow::Result<StoredArtifact> {
        self.write_json(&self.ledger_path(), ledger).await
    }

    fn report_path(&self, kind: &str, timestamp: DateTime<Utc>, run_id: Uuid) -> PathBuf {
        let stamp = timestamp.format("%Y%m%d_%H%M%S").to_string();
        self.reports_dir().join(format!("{stamp}-{kind}-{run_id}.json"))
    }

    pub async fn write_run_report(&self, report: &RunReport) -> anyhow::Result<StoredArtifact> {
        let path = self.report_path("run", report.timestamp, report.run_id);
        self.write_json(&path, report).await
    }

    pub async fn write_error_report(&self, report: &ErrorReport) -> anyhow::Result<StoredArtifact> {
        let path = self.report_path("error", report.timestamp, report.run_id);
        self.write_json(&path, report).await
    }

    /// Most recent report file (run or error) by timestamped name.
    pub async fn latest_report(&self) -> anyhow::Result<Option<PathBuf>> {
        let dir = self.reports_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
        };
        let mut latest: Option<PathBuf> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let path = entry.path();
            let is_report = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_report {
                continue;
            }
            let newer = match &latest {
                Some(cur) => path.file_name() > cur.file_name(),
                None => true,
            };
            if newer {
                latest = Some(path);
            }
        }
        Ok(latest)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit open; call rejected")]
    Open,
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Three-state failure-threshold gate for calls to flaky external services.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Whether a call may proceed now. An expired open circuit admits one trial call.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    state.state = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    debug!("circuit half-open; admitting trial call");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    false
                } else {
                    state.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.trial_in_flight = false;
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.trial_in_flight = false;
        match state.state {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                warn!("trial call failed; circuit re-opened");
            }
            CircuitState::Closed | CircuitState::Open => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= self.config.failure_threshold
                    && state.state == CircuitState::Closed
                {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    warn!(
                        failures = state.consecutive_failures,
                        "failure threshold reached; circuit opened"
                    );
                }
            }
        }
    }

    /// Run `op` through the breaker, recording its outcome.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire().await {
            return Err(BreakerError::Open);
        }
        match op().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure().await;
                Err(BreakerError::Inner(err))
            }
        }
    }
}

//! Discovery scheduler: idle -> checking -> updating -> reporting -> idle.
//!
//! A tick source (cron job, CLI, or test) feeds [`Tick`]s to a
//! [`DiscoveryEngine`]. Scheduled ticks only run an update when the ledger says
//! the catalog is stale; forced ticks skip that check. One update runs at a
//! time per engine.

use std::collections::btree_map::Entry;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actcat_adapters::{normalize_discovered, EnvironmentProbe, ProbeError, ShellProbeConfig};
use actcat_core::{
    CanonicalDatabase, DiscoveryPhase, ErrorReport, Ledger, PhaseReport, PhaseStatus, RunReport,
    DISCOVERY_SOURCE_TAG, LEDGER_SCHEMA_VERSION, PRIMARY_NAMESPACE,
};
use actcat_storage::CatalogStore;
use actcat_sync::{render_digest, DEFAULT_DIGEST_CATEGORY_CAP};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "actcat-discovery";

pub const DEFAULT_TICK_CRON: &str = "0 0 * * * *";
pub const DEFAULT_UPDATE_INTERVAL_HOURS: i64 = 24;
pub const DEFAULT_PHASE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_INSPECT_SAMPLE: usize = 25;
const TICK_QUEUE: usize = 8;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub data_dir: PathBuf,
    pub tick_cron: String,
    pub update_interval: chrono::Duration,
    pub phase_timeout: Duration,
    /// Installed items inspected per run.
    pub inspect_sample: usize,
    pub digest_category_cap: usize,
    pub probe: ShellProbeConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            tick_cron: DEFAULT_TICK_CRON.to_string(),
            update_interval: chrono::Duration::hours(DEFAULT_UPDATE_INTERVAL_HOURS),
            phase_timeout: Duration::from_secs(DEFAULT_PHASE_TIMEOUT_SECS),
            inspect_sample: DEFAULT_INSPECT_SAMPLE,
            digest_category_cap: DEFAULT_DIGEST_CATEGORY_CAP,
            probe: ShellProbeConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut probe = defaults.probe;
        if let Some(list) = env_command("ACTCAT_LIST_COMMAND") {
            probe.list_command = list;
        }
        if let Some(inspect) = env_command("ACTCAT_INSPECT_COMMAND") {
            probe.inspect_command = inspect;
        }
        Self {
            data_dir: std::env::var("ACTCAT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            tick_cron: std::env::var("ACTCAT_SCHEDULER_CRON").unwrap_or(defaults.tick_cron),
            update_interval: env_parse::<i64>("ACTCAT_UPDATE_INTERVAL_HOURS")
                .and_then(chrono::Duration::try_hours)
                .unwrap_or(defaults.update_interval),
            phase_timeout: env_parse::<u64>("ACTCAT_PHASE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.phase_timeout),
            inspect_sample: env_parse("ACTCAT_INSPECT_SAMPLE").unwrap_or(defaults.inspect_sample),
            digest_category_cap: env_parse("ACTCAT_DIGEST_CATEGORY_CAP")
                .unwrap_or(defaults.digest_category_cap),
            probe,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_command(key: &str) -> Option<Vec<String>> {
    let argv: Vec<String> = std::env::var(key)
        .ok()?
        .split_whitespace()
        .map(ToString::to_string)
        .collect();
    (!argv.is_empty()).then_some(argv)
}

// ---------------------------------------------------------------------------
// Clock + hooks
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for simulations and tests. Millisecond resolution.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(at.timestamp_millis()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Third discovery phase: text from resources outside the local environment.
#[async_trait]
pub trait ExternalResourceScan: Send + Sync {
    fn enabled(&self) -> bool {
        true
    }

    async fn scan(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoExternalResources;

#[async_trait]
impl ExternalResourceScan for NoExternalResources {
    fn enabled(&self) -> bool {
        false
    }

    async fn scan(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Identifier extraction
// ---------------------------------------------------------------------------

/// Pattern for namespaced identifiers: the literal prefix followed by a run of
/// word characters. Dots end the match.
pub fn identifier_pattern(namespace: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"\b{}[A-Za-z0-9_]+", regex::escape(namespace)))
}

pub fn extract_identifiers(pattern: &Regex, text: &str) -> BTreeSet<String> {
    pattern
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Checking,
    Updating,
    Reporting,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Scheduled,
    Forced,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Catalog is fresh; nothing ran.
    NotDue { due_at: DateTime<Utc> },
    /// A scheduled tick arrived while another update was in flight.
    Coalesced,
    Completed(RunReport),
    Failed(ErrorReport),
    /// The update finished but its outcome could not be persisted.
    Unrecorded { run_id: Uuid, message: String },
}

struct PhaseOutcome {
    report: PhaseReport,
    identifiers: BTreeSet<String>,
}

impl PhaseOutcome {
    fn new(
        phase: DiscoveryPhase,
        status: PhaseStatus,
        identifiers: BTreeSet<String>,
        message: Option<String>,
    ) -> Self {
        Self {
            report: PhaseReport {
                phase,
                status,
                identifiers: identifiers.len(),
                message,
            },
            identifiers,
        }
    }
}

struct UpdateSummary {
    actions_found: usize,
    integration: Integration,
    phases: Vec<PhaseReport>,
}

struct UpdateFailure {
    phase: DiscoveryPhase,
    message: String,
}

struct Integration {
    new_actions: usize,
    updated_actions: usize,
    catalog_sha256: Option<String>,
}

pub struct DiscoveryEngine {
    store: CatalogStore,
    probe: Arc<dyn EnvironmentProbe>,
    external: Arc<dyn ExternalResourceScan>,
    clock: Arc<dyn Clock>,
    config: DiscoveryConfig,
    identifier_pattern: Regex,
    state: watch::Sender<SchedulerState>,
    // Held for the whole checking..reporting span; doubles as the run lock.
    ledger: Mutex<Ledger>,
    // Last persisted ledger, readable without touching the run lock.
    ledger_view: watch::Sender<Ledger>,
}

impl DiscoveryEngine {
    pub async fn open(
        store: CatalogStore,
        probe: Arc<dyn EnvironmentProbe>,
        config: DiscoveryConfig,
    ) -> Result<Self> {
        let ledger = store.load_ledger().await?;
        let identifier_pattern =
            identifier_pattern(PRIMARY_NAMESPACE).context("compiling identifier pattern")?;
        let (state, _) = watch::channel(SchedulerState::Idle);
        let (ledger_view, _) = watch::channel(ledger);
        info!(
            last_update = %ledger.last_update_timestamp,
            probe = probe.name(),
            "discovery engine idle"
        );
        Ok(Self {
            store,
            probe,
            external: Arc::new(NoExternalResources),
            clock: Arc::new(SystemClock),
            config,
            identifier_pattern,
            state,
            ledger: Mutex::new(ledger),
            ledger_view,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_external_scan(mut self, external: Arc<dyn ExternalResourceScan>) -> Self {
        self.external = external;
        self
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Last persisted update time. Does not wait for an in-flight update.
    pub fn last_update(&self) -> DateTime<Utc> {
        self.ledger_view.borrow().last_update_timestamp
    }

    fn transition(&self, next: SchedulerState) {
        let previous = self.state.send_replace(next);
        debug!(from = ?previous, to = ?next, "scheduler transition");
    }

    pub async fn tick(&self, tick: Tick) -> TickOutcome {
        let mut ledger = match tick {
            Tick::Scheduled => match self.ledger.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("update in flight; scheduled tick coalesced");
                    return TickOutcome::Coalesced;
                }
            },
            Tick::Forced => self.ledger.lock().await,
        };

        self.transition(SchedulerState::Checking);
        let now = self.clock.now();
        if tick == Tick::Scheduled {
            if let Some(due_at) = ledger
                .last_update_timestamp
                .checked_add_signed(self.config.update_interval)
            {
                if now < due_at {
                    debug!(%due_at, "catalog fresh; skipping update");
                    self.transition(SchedulerState::Idle);
                    return TickOutcome::NotDue { due_at };
                }
            }
        }

        self.transition(SchedulerState::Updating);
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let result = self
            .update(now)
            .instrument(info_span!("discovery_run", %run_id, ?tick))
            .await;
        let duration_seconds = started.elapsed().as_secs_f64();

        self.transition(SchedulerState::Reporting);
        let finished_at = self.clock.now();
        let outcome = match result {
            Ok(summary) => {
                self.report_success(&mut ledger, run_id, finished_at, duration_seconds, summary)
                    .await
            }
            Err(failure) => self.report_failure(run_id, finished_at, failure).await,
        };
        self.transition(SchedulerState::Idle);
        outcome
    }

    async fn update(&self, now: DateTime<Utc>) -> Result<UpdateSummary, UpdateFailure> {
        let (installed, framework) = tokio::join!(
            self.bounded(DiscoveryPhase::InstalledItemScan, self.scan_installed_items()),
            self.bounded(DiscoveryPhase::FrameworkScan, self.scan_frameworks()),
        );
        let external = if self.external.enabled() {
            self.bounded(DiscoveryPhase::ExternalResourceScan, self.scan_external())
                .await
        } else {
            PhaseOutcome::new(
                DiscoveryPhase::ExternalResourceScan,
                PhaseStatus::Skipped,
                BTreeSet::new(),
                None,
            )
        };

        let scans = [installed, framework, external];
        let found: BTreeSet<String> = scans
            .iter()
            .flat_map(|scan| scan.identifiers.iter().cloned())
            .collect();
        info!(found = found.len(), "scan phases finished");

        let integration = self
            .integrate(&found, now)
            .await
            .map_err(|err| UpdateFailure {
                phase: DiscoveryPhase::Integration,
                message: format!("{err:#}"),
            })?;

        let mut phases: Vec<PhaseReport> = scans.into_iter().map(|scan| scan.report).collect();
        phases.push(PhaseReport {
            phase: DiscoveryPhase::Integration,
            status: PhaseStatus::Completed,
            identifiers: integration.new_actions + integration.updated_actions,
            message: None,
        });
        Ok(UpdateSummary {
            actions_found: found.len(),
            integration,
            phases,
        })
    }

    /// Runs one scan phase under the phase time budget. Failures and timeouts
    /// contribute no identifiers.
    async fn bounded<F, E>(&self, phase: DiscoveryPhase, scan: F) -> PhaseOutcome
    where
        F: Future<Output = Result<BTreeSet<String>, E>>,
        E: Display,
    {
        match tokio::time::timeout(self.config.phase_timeout, scan).await {
            Ok(Ok(identifiers)) => {
                debug!(phase = phase.as_str(), count = identifiers.len(), "phase completed");
                PhaseOutcome::new(phase, PhaseStatus::Completed, identifiers, None)
            }
            Ok(Err(err)) => {
                warn!(phase = phase.as_str(), error = %err, "phase failed; contributing nothing");
                PhaseOutcome::new(phase, PhaseStatus::Failed, BTreeSet::new(), Some(err.to_string()))
            }
            Err(_) => {
                let secs = self.config.phase_timeout.as_secs();
                warn!(phase = phase.as_str(), timeout_secs = secs, "phase timed out");
                PhaseOutcome::new(
                    phase,
                    PhaseStatus::TimedOut,
                    BTreeSet::new(),
                    Some(format!("exceeded {secs}s budget")),
                )
            }
        }
    }

    async fn scan_installed_items(&self) -> Result<BTreeSet<String>, ProbeError> {
        let names = self.probe.enumerate_installed_items().await?;
        let mut found = BTreeSet::new();
        for name in names.iter().take(self.config.inspect_sample) {
            match self.probe.inspect_item(name).await {
                Ok(text) => found.extend(extract_identifiers(&self.identifier_pattern, &text)),
                Err(ProbeError::Suspended) => {
                    debug!("inspection suspended; ending sample early");
                    break;
                }
                Err(err) => debug!(item = %name, error = %err, "item inspection failed"),
            }
        }
        Ok(found)
    }

    async fn scan_frameworks(&self) -> Result<BTreeSet<String>, ProbeError> {
        let blobs = self.probe.scan_known_locations().await?;
        Ok(blobs
            .iter()
            .flat_map(|blob| extract_identifiers(&self.identifier_pattern, blob))
            .collect())
    }

    async fn scan_external(&self) -> Result<BTreeSet<String>> {
        let blobs = self.external.scan().await?;
        Ok(blobs
            .iter()
            .flat_map(|blob| extract_identifiers(&self.identifier_pattern, blob))
            .collect())
    }

    /// Folds discovered identifiers into the canonical catalog. New identifiers
    /// get heuristic low-confidence records; known ones gain the discovery tag
    /// and one confidence step, once.
    async fn integrate(&self, found: &BTreeSet<String>, now: DateTime<Utc>) -> Result<Integration> {
        let mut db = self
            .store
            .load_catalog()
            .await
            .context("loading catalog for integration")?
            .unwrap_or_else(|| CanonicalDatabase::empty(now));

        let mut new_actions = 0;
        let mut updated_actions = 0;
        for identifier in found {
            match db.actions.entry(identifier.clone()) {
                Entry::Vacant(slot) => {
                    let mut record = normalize_discovered(identifier);
                    record.sources.insert(DISCOVERY_SOURCE_TAG.to_string());
                    slot.insert(record);
                    new_actions += 1;
                }
                Entry::Occupied(mut slot) => {
                    let record = slot.get_mut();
                    if record.sources.insert(DISCOVERY_SOURCE_TAG.to_string()) {
                        record.confidence = record.confidence.step_up_below_authoritative();
                        updated_actions += 1;
                    }
                }
            }
        }

        if new_actions + updated_actions == 0 {
            debug!("no catalog changes from discovery");
            return Ok(Integration {
                new_actions,
                updated_actions,
                catalog_sha256: None,
            });
        }

        db.refresh_metadata(now);
        let stored = self
            .store
            .write_catalog(&db)
            .await
            .context("writing integrated catalog")?;
        self.store
            .write_digest(&render_digest(&db, self.config.digest_category_cap))
            .await
            .context("writing digest")?;
        Ok(Integration {
            new_actions,
            updated_actions,
            catalog_sha256: Some(stored.content_hash),
        })
    }

    async fn report_success(
        &self,
        ledger: &mut Ledger,
        run_id: Uuid,
        finished_at: DateTime<Utc>,
        duration_seconds: f64,
        summary: UpdateSummary,
    ) -> TickOutcome {
        let sources_touched = summary
            .phases
            .iter()
            .filter(|p| p.phase != DiscoveryPhase::Integration && p.identifiers > 0)
            .map(|p| p.phase.as_str().to_string())
            .collect();
        let report = RunReport {
            run_id,
            timestamp: finished_at,
            duration_seconds,
            actions_found: summary.actions_found,
            new_actions: summary.integration.new_actions,
            updated_actions: summary.integration.updated_actions,
            sources_touched,
            phases: summary.phases,
            catalog_sha256: summary.integration.catalog_sha256,
            success: true,
        };

        let next = Ledger {
            last_update_timestamp: finished_at,
            schema_version: LEDGER_SCHEMA_VERSION,
        };
        if let Err(err) = self.store.write_ledger(&next).await {
            return self.unrecorded(run_id, err);
        }
        *ledger = next;
        self.ledger_view.send_replace(next);
        if let Err(err) = self.store.write_run_report(&report).await {
            return self.unrecorded(run_id, err);
        }
        info!(
            %run_id,
            found = report.actions_found,
            new = report.new_actions,
            updated = report.updated_actions,
            "discovery update recorded"
        );
        TickOutcome::Completed(report)
    }

    async fn report_failure(
        &self,
        run_id: Uuid,
        finished_at: DateTime<Utc>,
        failure: UpdateFailure,
    ) -> TickOutcome {
        warn!(
            %run_id,
            phase = failure.phase.as_str(),
            error = %failure.message,
            "discovery update failed; ledger unchanged"
        );
        let report = ErrorReport {
            run_id,
            timestamp: finished_at,
            message: failure.message,
            phase: failure.phase,
        };
        match self.store.write_error_report(&report).await {
            Ok(_) => TickOutcome::Failed(report),
            Err(err) => self.unrecorded(run_id, err),
        }
    }

    fn unrecorded(&self, run_id: Uuid, err: anyhow::Error) -> TickOutcome {
        self.transition(SchedulerState::Error);
        let message = format!("{err:#}");
        error!(%run_id, error = %message, "persisting discovery outcome failed");
        TickOutcome::Unrecorded { run_id, message }
    }
}

// ---------------------------------------------------------------------------
// Tick delivery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DiscoveryHandle {
    ticks: mpsc::Sender<Tick>,
}

impl DiscoveryHandle {
    pub fn new(ticks: mpsc::Sender<Tick>) -> Self {
        Self { ticks }
    }

    pub async fn force_update(&self) -> Result<()> {
        self.ticks
            .send(Tick::Forced)
            .await
            .context("discovery driver stopped")
    }
}

/// Applies ticks until the channel closes or `shutdown` fires. Shutdown only
/// interrupts the wait between ticks; an in-flight update runs to the end.
pub async fn drive(
    engine: Arc<DiscoveryEngine>,
    mut ticks: mpsc::Receiver<Tick>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let tick = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("discovery driver shutting down");
                break;
            }
            tick = ticks.recv() => match tick {
                Some(tick) => tick,
                None => break,
            },
        };
        engine.tick(tick).await;
    }
}

pub struct RunningScheduler {
    scheduler: JobScheduler,
    handle: DiscoveryHandle,
    shutdown: oneshot::Sender<()>,
    driver: JoinHandle<()>,
}

impl RunningScheduler {
    pub fn handle(&self) -> DiscoveryHandle {
        self.handle.clone()
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .context("stopping scheduler")?;
        let _ = self.shutdown.send(());
        self.driver.await.context("joining discovery driver")?;
        Ok(())
    }
}

/// Registers the cron tick job and spawns the driver loop.
pub async fn start_scheduler(engine: Arc<DiscoveryEngine>) -> Result<RunningScheduler> {
    let cron = engine.config().tick_cron.clone();
    let (tx, rx) = mpsc::channel(TICK_QUEUE);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let mut scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let job_ticks = tx.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let ticks = job_ticks.clone();
        Box::pin(async move {
            if ticks.try_send(Tick::Scheduled).is_err() {
                debug!("tick queue full or closed; scheduled tick dropped");
            }
        })
    })
    .with_context(|| format!("creating discovery job for cron {cron}"))?;
    scheduler.add(job).await.context("adding discovery job")?;

    let driver = tokio::spawn(drive(engine, rx, shutdown_rx));
    scheduler.start().await.context("starting scheduler")?;
    // Check staleness at startup instead of waiting for the first cron fire.
    if tx.try_send(Tick::Scheduled).is_err() {
        debug!("startup tick dropped");
    }
    info!(%cron, "discovery scheduler started");

    Ok(RunningScheduler {
        scheduler,
        handle: DiscoveryHandle::new(tx),
        shutdown: shutdown_tx,
        driver,
    })
}

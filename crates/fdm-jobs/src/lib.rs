//! Reconciliation jobs, their configuration, and the cron scheduler that drives them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fdm_core::{
    JobName, PendingJourneyRecord, PortfolioRecord, ReconciliationRecord, RefreshMode, RunOutcome,
    RunSummary, UPSWING_PROVIDER,
};
use fdm_storage::{
    DatabaseConfig, PgPendingJourneyStore, PgPortfolioStore, ReconciliationStore, StorageError,
    MAX_UPSERT_BATCH,
};
use fdm_vendor::{
    pending_journey_not_found_code, UpswingClient, UpswingConfig, VendorError, VendorGateway,
    NET_WORTH_CLIENT_NOT_FOUND,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "fdm-jobs";
pub const DEFAULT_CONFIG_PATH: &str = "config/application.yaml";
pub const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationSettings {
    pub enabled: bool,
    pub provider: String,
    pub batch_size: usize,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: UPSWING_PROVIDER.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenRenewalSettings {
    pub enabled: bool,
}

impl Default for TokenRenewalSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub portfolio: ReconciliationSettings,
    pub pending_journey: ReconciliationSettings,
    pub token_renewal: TokenRenewalSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let pool = DatabaseConfig::default();
        Self {
            url: pool.url,
            max_connections: pool.max_connections,
            acquire_timeout_secs: pool.acquire_timeout.as_secs(),
        }
    }
}

impl DatabaseSettings {
    pub fn pool_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            url: self.url.clone(),
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub host: String,
    pub port: u16,
    /// Bearer token the vendor webhook must present; unchecked when unset.
    #[serde(skip_serializing)]
    pub webhook_token: Option<String>,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            webhook_token: None,
        }
    }
}

/// Application settings read from `config/application.yaml`, then overridden from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler_enabled: bool,
    /// Cron expressions keyed by [`JobName::cron_key`].
    pub crons: BTreeMap<String, String>,
    pub jobs: JobsConfig,
    pub vendor: UpswingConfig,
    pub database: DatabaseSettings,
    pub web: WebSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler_enabled: true,
            crons: BTreeMap::new(),
            jobs: JobsConfig::default(),
            vendor: UpswingConfig::default(),
            database: DatabaseSettings::default(),
            web: WebSettings::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl AppConfig {
    /// Reads `FDM_CONFIG` (default `config/application.yaml`), falling back to defaults when absent.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("FDM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = if path.exists() {
            Self::from_path(&path)?
        } else {
            warn!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()));
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Secrets and deployment knobs come from the environment only.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(port) = lookup("FDM_WEB_PORT").and_then(|v| v.trim().parse().ok()) {
            self.web.port = port;
        }
        if let Some(token) = lookup("FDM_WEBHOOK_TOKEN") {
            self.web.webhook_token = Some(token);
        }
        if let Some(flag) = lookup("FDM_SCHEDULER_ENABLED") {
            self.scheduler_enabled = parse_flag(&flag);
        }
        let creds = &mut self.vendor.credentials;
        if let Some(v) = lookup("UPSWING_CLIENT_ID") {
            creds.client_id = v;
        }
        if let Some(v) = lookup("UPSWING_CLIENT_SECRET") {
            creds.client_secret = v;
        }
        if let Some(v) = lookup("UPSWING_GRANT_TYPE") {
            creds.grant_type = v;
        }
        if let Some(v) = lookup("UPSWING_SCOPE") {
            creds.scope = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, settings) in [
            ("portfolio", &self.jobs.portfolio),
            ("pending_journey", &self.jobs.pending_journey),
        ] {
            if settings.provider.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "jobs.{name}.provider must not be empty"
                )));
            }
            if settings.batch_size > MAX_UPSERT_BATCH {
                return Err(ConfigError::Invalid(format!(
                    "jobs.{name}.batch_size {} exceeds {MAX_UPSERT_BATCH}",
                    settings.batch_size
                )));
            }
        }
        for key in self.crons.keys() {
            if !JobName::ALL.iter().any(|job| job.cron_key() == key) {
                warn!(cron_key = %key, "cron configured for an unknown job");
            }
        }
        Ok(())
    }

    pub fn cron_for(&self, job: JobName) -> Option<&str> {
        cron_for(&self.crons, job)
    }
}

fn cron_for(crons: &BTreeMap<String, String>, job: JobName) -> Option<&str> {
    crons
        .get(job.cron_key())
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True")
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{stage} failed: {source}")]
    Store {
        stage: &'static str,
        source: StorageError,
    },
    #[error("vendor gave no verdict for client {client_code}: {source}")]
    Unclassified {
        client_code: String,
        source: VendorError,
    },
    #[error(transparent)]
    Vendor(#[from] VendorError),
}

fn store_error(stage: &'static str) -> impl FnOnce(StorageError) -> JobError {
    move |source| JobError::Store { stage, source }
}

/// Ordered per-run record buffer, handed out in chunks of `batch_size`.
#[derive(Debug)]
pub struct BatchBuffer<R> {
    items: Vec<R>,
    batch_size: usize,
}

impl<R> BatchBuffer<R> {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            items: Vec::with_capacity(batch_size),
            batch_size,
        }
    }

    /// Returns the full batch once `batch_size` records are buffered.
    pub fn push(&mut self, record: R) -> Option<Vec<R>> {
        self.items.push(record);
        if self.items.len() >= self.batch_size {
            Some(std::mem::replace(
                &mut self.items,
                Vec::with_capacity(self.batch_size),
            ))
        } else {
            None
        }
    }

    pub fn take_remaining(&mut self) -> Option<Vec<R>> {
        if self.items.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.items))
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Entity-specific half of a reconciliation job.
#[async_trait]
pub trait Reconcilable: Send + Sync + 'static {
    type Record: ReconciliationRecord;

    fn job(&self) -> JobName;

    async fn fetch(
        &self,
        gateway: &dyn VendorGateway,
        client_code: &str,
        provider: &str,
    ) -> Result<Self::Record, VendorError>;

    /// True when the vendor authoritatively reports the client as unknown.
    fn is_client_not_found(&self, err: &VendorError, client_code: &str) -> bool;

    fn degraded(
        &self,
        client_code: &str,
        provider: &str,
        invalid_client: bool,
        api_error: Option<String>,
    ) -> Self::Record;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PortfolioReconciler;

#[async_trait]
impl Reconcilable for PortfolioReconciler {
    type Record = PortfolioRecord;

    fn job(&self) -> JobName {
        JobName::PortfolioUpdate
    }

    async fn fetch(
        &self,
        gateway: &dyn VendorGateway,
        client_code: &str,
        provider: &str,
    ) -> Result<PortfolioRecord, VendorError> {
        let snapshot = gateway.fetch_net_worth(client_code).await?;
        Ok(PortfolioRecord::from_net_worth(client_code, provider, &snapshot))
    }

    fn is_client_not_found(&self, err: &VendorError, _client_code: &str) -> bool {
        err.code() == Some(NET_WORTH_CLIENT_NOT_FOUND)
    }

    fn degraded(
        &self,
        client_code: &str,
        provider: &str,
        invalid_client: bool,
        api_error: Option<String>,
    ) -> PortfolioRecord {
        PortfolioRecord::degraded(client_code, provider, invalid_client, api_error)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PendingJourneyReconciler;

#[async_trait]
impl Reconcilable for PendingJourneyReconciler {
    type Record = PendingJourneyRecord;

    fn job(&self) -> JobName {
        JobName::PendingJourneyUpdate
    }

    async fn fetch(
        &self,
        gateway: &dyn VendorGateway,
        client_code: &str,
        provider: &str,
    ) -> Result<PendingJourneyRecord, VendorError> {
        let status = gateway.fetch_pending_journey(client_code).await?;
        Ok(PendingJourneyRecord::from_status(client_code, provider, status))
    }

    fn is_client_not_found(&self, err: &VendorError, client_code: &str) -> bool {
        err.code() == Some(pending_journey_not_found_code(client_code).as_str())
    }

    fn degraded(
        &self,
        client_code: &str,
        provider: &str,
        invalid_client: bool,
        api_error: Option<String>,
    ) -> PendingJourneyRecord {
        PendingJourneyRecord::degraded(client_code, provider, invalid_client, api_error)
    }
}

/// What the scheduler and the operator endpoints can trigger.
#[async_trait]
pub trait JobRunner: Send + Sync {
    fn job(&self) -> JobName;

    /// Scheduler entry point; a disabled job returns without touching the vendor or the store.
    async fn run(&self, mode: RefreshMode) -> RunSummary;

    /// Operator entry point; runs regardless of the enabled flag.
    async fn do_job(&self, mode: RefreshMode) -> RunSummary;
}

/// Fetch, buffer, flush, finalize, for one entity kind.
pub struct ReconciliationJob<K: Reconcilable> {
    kind: K,
    settings: ReconciliationSettings,
    gateway: Arc<dyn VendorGateway>,
    store: Arc<dyn ReconciliationStore<Record = K::Record>>,
    run_lock: Mutex<()>,
}

impl<K: Reconcilable> ReconciliationJob<K> {
    pub fn new(
        kind: K,
        settings: ReconciliationSettings,
        gateway: Arc<dyn VendorGateway>,
        store: Arc<dyn ReconciliationStore<Record = K::Record>>,
    ) -> Self {
        Self {
            kind,
            settings,
            gateway,
            store,
            run_lock: Mutex::new(()),
        }
    }

    async fn execute(&self, mode: RefreshMode, summary: &mut RunSummary) -> Result<(), JobError> {
        let provider = self.settings.provider.as_str();
        let clients = self
            .store
            .list_clients(provider, mode.is_instant())
            .await
            .map_err(store_error("list_clients"))?;
        summary.clients = clients.len();
        info!(clients = clients.len(), "fetched client list");

        let mut buffer = BatchBuffer::new(self.settings.batch_size);
        for client_code in &clients {
            let record = self.reconcile_client(client_code, provider, summary).await?;
            if let Some(batch) = buffer.push(record) {
                self.flush(&batch, summary).await?;
            }
        }
        if let Some(batch) = buffer.take_remaining() {
            self.flush(&batch, summary).await?;
        }

        if mode.is_instant() {
            let updated = self
                .store
                .mark_refreshed(provider, &clients)
                .await
                .map_err(store_error("mark_refreshed"))?;
            info!(updated, "cleared refresh flags");
        } else {
            let deleted = self
                .store
                .delete_stale()
                .await
                .map_err(store_error("delete_stale"))?;
            info!(deleted, "cleaned stale records");
        }
        Ok(())
    }

    async fn reconcile_client(
        &self,
        client_code: &str,
        provider: &str,
        summary: &mut RunSummary,
    ) -> Result<K::Record, JobError> {
        match self
            .kind
            .fetch(self.gateway.as_ref(), client_code, provider)
            .await
        {
            Ok(record) => Ok(record),
            Err(err) if err.aborts_run() => Err(JobError::Unclassified {
                client_code: client_code.to_string(),
                source: err,
            }),
            Err(err) => {
                let invalid_client = self.kind.is_client_not_found(&err, client_code);
                warn!(client_code, invalid_client, error = %err, "vendor call failed, recording degraded record");
                summary.degraded_records += 1;
                if invalid_client {
                    summary.invalid_clients += 1;
                }
                Ok(self
                    .kind
                    .degraded(client_code, provider, invalid_client, err.api_error()))
            }
        }
    }

    async fn flush(&self, batch: &[K::Record], summary: &mut RunSummary) -> Result<(), JobError> {
        self.store
            .upsert_batch(batch)
            .await
            .map_err(store_error("upsert_batch"))?;
        summary.batches_flushed += 1;
        summary.records_written += batch.len();
        debug!(batch = summary.batches_flushed, size = batch.len(), "flushed batch");
        Ok(())
    }
}

#[async_trait]
impl<K: Reconcilable> JobRunner for ReconciliationJob<K> {
    fn job(&self) -> JobName {
        self.kind.job()
    }

    async fn run(&self, mode: RefreshMode) -> RunSummary {
        if !self.settings.enabled {
            warn!(job = %self.kind.job(), "job is disabled in config, skipping its execution");
            return RunSummary::begin(self.kind.job(), mode, self.settings.provider.clone())
                .finish(RunOutcome::Disabled, None);
        }
        self.do_job(mode).await
    }

    async fn do_job(&self, mode: RefreshMode) -> RunSummary {
        let _running = self.run_lock.lock().await;
        let job = self.kind.job();
        let mut summary = RunSummary::begin(job, mode, self.settings.provider.clone());
        let span = info_span!(
            "reconciliation_run",
            job = %job,
            run_id = %summary.run_id,
            mode = %mode,
            provider = %summary.provider,
        );

        async move {
            info!("starting reconciliation run");
            let result = self.execute(mode, &mut summary).await;
            let summary = match result {
                Ok(()) => summary.finish(RunOutcome::Completed, None),
                Err(err) => {
                    error!(error = %err, "reconciliation run aborted");
                    summary.finish(RunOutcome::Aborted, Some(err.to_string()))
                }
            };
            info!(
                outcome = ?summary.outcome,
                clients = summary.clients,
                batches_flushed = summary.batches_flushed,
                records_written = summary.records_written,
                degraded_records = summary.degraded_records,
                invalid_clients = summary.invalid_clients,
                "reconciliation run finished"
            );
            summary
        }
        .instrument(span)
        .await
    }
}

/// Keeps the vendor access token fresh ahead of the reconciliation jobs.
pub struct TokenRenewalJob {
    settings: TokenRenewalSettings,
    gateway: Arc<dyn VendorGateway>,
}

impl TokenRenewalJob {
    pub fn new(settings: TokenRenewalSettings, gateway: Arc<dyn VendorGateway>) -> Self {
        Self { settings, gateway }
    }

    /// Failures are logged, never propagated.
    pub async fn run(&self) -> RunOutcome {
        if !self.settings.enabled {
            warn!(job = %JobName::TokenRenewal, "job is disabled in config, skipping its execution");
            return RunOutcome::Disabled;
        }
        async {
            info!("starting token renewal");
            match self.gateway.validate_token().await {
                Ok(()) => RunOutcome::Completed,
                Err(err) => {
                    error!(error = %err, "token renewal failed");
                    RunOutcome::Aborted
                }
            }
        }
        .instrument(info_span!("token_renewal"))
        .await
    }
}

#[derive(Clone)]
pub enum ScheduledJob {
    Reconciliation(Arc<dyn JobRunner>),
    TokenRenewal(Arc<TokenRenewalJob>),
}

impl ScheduledJob {
    pub fn name(&self) -> JobName {
        match self {
            Self::Reconciliation(job) => job.job(),
            Self::TokenRenewal(_) => JobName::TokenRenewal,
        }
    }

    pub async fn fire(&self) {
        match self {
            Self::Reconciliation(job) => {
                job.run(RefreshMode::Scheduled).await;
            }
            Self::TokenRenewal(job) => {
                job.run().await;
            }
        }
    }
}

/// The three production jobs, shared by the scheduler and the HTTP layer.
#[derive(Clone)]
pub struct JobSet {
    pub portfolio: Arc<dyn JobRunner>,
    pub pending_journey: Arc<dyn JobRunner>,
    pub token_renewal: Arc<TokenRenewalJob>,
}

impl JobSet {
    pub fn new(
        config: &JobsConfig,
        gateway: Arc<dyn VendorGateway>,
        portfolio_store: Arc<dyn ReconciliationStore<Record = PortfolioRecord>>,
        pending_journey_store: Arc<dyn ReconciliationStore<Record = PendingJourneyRecord>>,
    ) -> Self {
        Self {
            portfolio: Arc::new(ReconciliationJob::new(
                PortfolioReconciler,
                config.portfolio.clone(),
                gateway.clone(),
                portfolio_store,
            )),
            pending_journey: Arc::new(ReconciliationJob::new(
                PendingJourneyReconciler,
                config.pending_journey.clone(),
                gateway.clone(),
                pending_journey_store,
            )),
            token_renewal: Arc::new(TokenRenewalJob::new(
                config.token_renewal.clone(),
                gateway,
            )),
        }
    }

    /// Wires the Upswing client and the Postgres stores.
    pub fn connect(config: &AppConfig, pool: PgPool) -> Result<Self, JobError> {
        let gateway: Arc<dyn VendorGateway> = Arc::new(UpswingClient::new(config.vendor.clone())?);
        Ok(Self::new(
            &config.jobs,
            gateway,
            Arc::new(PgPortfolioStore::new(pool.clone())),
            Arc::new(PgPendingJourneyStore::new(pool)),
        ))
    }

    pub fn runner(&self, job: JobName) -> Option<Arc<dyn JobRunner>> {
        match job {
            JobName::PortfolioUpdate => Some(self.portfolio.clone()),
            JobName::PendingJourneyUpdate => Some(self.pending_journey.clone()),
            JobName::TokenRenewal => None,
        }
    }

    pub fn scheduled(&self) -> Vec<ScheduledJob> {
        vec![
            ScheduledJob::TokenRenewal(self.token_renewal.clone()),
            ScheduledJob::Reconciliation(self.portfolio.clone()),
            ScheduledJob::Reconciliation(self.pending_journey.clone()),
        ]
    }
}

pub struct SchedulerHandle {
    pub scheduler: JobScheduler,
    pub registered: Vec<JobName>,
}

/// Registers every job that has a cron expression; jobs without one are skipped with a warning.
pub async fn build_scheduler(
    crons: &BTreeMap<String, String>,
    jobs: Vec<ScheduledJob>,
) -> anyhow::Result<SchedulerHandle> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let mut registered = Vec::new();

    for job in jobs {
        let name = job.name();
        let Some(cron) = cron_for(crons, name) else {
            warn!(job = %name, cron_key = name.cron_key(), "no cron configured, job not scheduled");
            continue;
        };
        let task = Job::new_async(cron, move |_uuid, _l| {
            let job = job.clone();
            Box::pin(async move {
                job.fire().await;
            })
        })
        .with_context(|| format!("creating scheduler job {name} for cron {cron}"))?;
        sched
            .add(task)
            .await
            .with_context(|| format!("adding scheduler job {name}"))?;
        info!(job = %name, cron, "job scheduled");
        registered.push(name);
    }

    Ok(SchedulerHandle {
        scheduler: sched,
        registered,
    })
}

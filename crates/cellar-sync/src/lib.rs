//! Sheet-to-table sync, TypeScript export and git publishing, run as a
//! retrying task graph.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cellar_adapters::SheetAdapter;
use cellar_storage::{HttpClientConfig, HttpFetcher, SheetFetcher, SheetSource, SnapshotStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod export;
pub mod loader;
pub mod orchestrator;
pub mod publish;

pub use config::{load_mappings, resolve_catalog_repo, DatabaseConfig, MappingFile, PublishConfig, SyncConfig};
pub use error::PipelineError;
pub use export::{ExportReport, Exporter};
pub use loader::{
    InventoryStore, LoadError, LoadReport, MemoryInventoryStore, PgInventoryStore, DEFAULT_BATCH_SIZE,
    MAX_BATCH_SIZE,
};
pub use orchestrator::{
    Orchestrator, RetryPolicy, RunContext, RunReport, SkipRule, TaskGraph, TaskId, TaskNode,
    TaskRecord, TaskRunner, TaskState,
};
pub use publish::{
    detect_changes, CommitMessage, CommitOutcome, GitIdentity, GitRepo, PublishDecision,
    PublishError, VersionControl,
};

pub const CRATE_NAME: &str = "cellar-sync";

/// Outcome of the combined fetch, transform and load stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRun {
    pub fetched_at: DateTime<Utc>,
    pub source_url: String,
    pub snapshot: Option<PathBuf>,
    pub records: usize,
    pub dropped_rows: usize,
    pub load: LoadReport,
}

impl SyncRun {
    pub fn delta(&self) -> i64 {
        self.load.delta()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub succeeded: bool,
    pub tasks: Vec<TaskRecord>,
    pub sync: Option<SyncRun>,
    pub export: Option<ExportReport>,
    pub changed: Option<bool>,
    pub commit: Option<CommitOutcome>,
}

impl From<&RunReport> for RunSummary {
    fn from(report: &RunReport) -> Self {
        Self {
            run_id: report.context.run_id,
            succeeded: report.succeeded(),
            tasks: report.tasks.clone(),
            sync: report.context.sync.clone(),
            export: report.context.export.clone(),
            changed: report.context.decision.as_ref().map(|d| d.changed),
            commit: report.context.commit.clone(),
        }
    }
}

pub struct SyncPipeline {
    source: SheetSource,
    fetcher: Arc<dyn SheetFetcher>,
    adapter: SheetAdapter,
    store: Arc<dyn InventoryStore>,
    exporter: Exporter,
    vcs: Arc<dyn VersionControl>,
    artifact_relpath: PathBuf,
    snapshots: Option<SnapshotStore>,
    graph: TaskGraph,
    owner: String,
}

impl SyncPipeline {
    /// `artifact_relpath` is the exporter target relative to the checkout
    /// that `vcs` manages.
    pub fn new(
        source: SheetSource,
        fetcher: Arc<dyn SheetFetcher>,
        adapter: SheetAdapter,
        store: Arc<dyn InventoryStore>,
        exporter: Exporter,
        vcs: Arc<dyn VersionControl>,
        artifact_relpath: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            fetcher,
            adapter,
            store,
            exporter,
            vcs,
            artifact_relpath: artifact_relpath.into(),
            snapshots: None,
            graph: TaskGraph::standard(RetryPolicy::default()),
            owner: "cellar".to_string(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let mappings = load_mappings(config.mappings_path.as_deref())?;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let store = PgInventoryStore::connect_lazy(config.database.connect_options()?)
            .with_batch_size(config.batch_size);
        let adapter = SheetAdapter::new(mappings.source).context("building sheet adapter")?;
        let exporter = Exporter::new(mappings.export, config.publish.artifact_path())
            .context("building exporter")?;
        let vcs = GitRepo::new(&config.publish.repo_root, config.publish.identity.clone())
            .with_remote(&config.publish.remote, config.publish.branch.clone());

        Ok(Self::new(
            config.source.clone(),
            Arc::new(fetcher),
            adapter,
            Arc::new(store),
            exporter,
            Arc::new(vcs),
            &config.publish.data_file,
        )
        .with_retry_policy(config.retry)
        .with_snapshots(SnapshotStore::new(&config.artifacts_dir))
        .with_owner(&config.owner))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.graph = TaskGraph::standard(retry);
        self
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn InventoryStore> {
        &self.store
    }

    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }

    pub fn artifact_relpath(&self) -> &Path {
        &self.artifact_relpath
    }

    /// Runs the whole graph.
    pub async fn run_once(&self) -> RunReport {
        self.run_graph(&self.graph).await
    }

    /// Runs only `tasks`; skip rules still apply to what they leave out.
    pub async fn run_tasks(&self, tasks: &[TaskId]) -> RunReport {
        self.run_graph(&self.graph.subset(tasks)).await
    }

    async fn run_graph(&self, graph: &TaskGraph) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("pipeline_run", %run_id, owner = %self.owner);
        async {
            info!(tasks = graph.nodes().len(), "pipeline run started");
            let report = Orchestrator::new(graph)
                .run(self, RunContext::new(run_id))
                .await;
            if report.succeeded() {
                info!("pipeline run succeeded");
            } else {
                warn!("pipeline run failed");
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn sync(&self) -> Result<SyncRun, PipelineError> {
        let fetched = self.fetcher.fetch_sheet(&self.source).await?;

        let snapshot = match &self.snapshots {
            Some(store) => Some(
                store
                    .store_bytes(fetched.fetched_at, &self.source.label(), "csv", fetched.body.as_bytes())
                    .await
                    .map_err(PipelineError::Snapshot)?
                    .absolute_path,
            ),
            None => None,
        };

        let output = self.adapter.transform(&fetched.body)?;
        let load = self
            .store
            .replace_all(&output.records)
            .await
            .map_err(PipelineError::LoadFailed)?;

        let run = SyncRun {
            fetched_at: fetched.fetched_at,
            source_url: fetched.url,
            snapshot,
            records: output.records.len(),
            dropped_rows: output.dropped_rows,
            load,
        };
        info!(
            records = run.records,
            dropped_rows = run.dropped_rows,
            before = run.load.before,
            after = run.load.after,
            delta = run.delta(),
            "sync complete"
        );
        Ok(run)
    }

    async fn read_artifact(&self) -> Result<Vec<u8>, PublishError> {
        let path = self.exporter.target();
        tokio::fs::read(path)
            .await
            .map_err(|source| PublishError::ReadArtifact {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[async_trait]
impl TaskRunner for SyncPipeline {
    async fn run_task(&self, task: TaskId, ctx: &mut RunContext) -> Result<(), PipelineError> {
        match task {
            TaskId::Sync => {
                ctx.sync = Some(self.sync().await?);
            }
            TaskId::Export => {
                ctx.export = Some(self.exporter.export(self.store.as_ref()).await?);
            }
            TaskId::DetectChanges => {
                let content = self.read_artifact().await?;
                let decision =
                    detect_changes(self.vcs.as_ref(), &self.artifact_relpath, &content).await?;
                ctx.decision = Some(decision);
            }
            TaskId::Commit => {
                let message =
                    CommitMessage::for_run(Utc::now().date_naive(), ctx.sync.as_ref(), &self.owner);
                let outcome = self
                    .vcs
                    .commit(&self.artifact_relpath, &message.render())
                    .await?;
                ctx.commit = Some(outcome);
            }
            TaskId::Push => {
                self.vcs.push().await?;
            }
        }
        Ok(())
    }
}

pub async fn run_pipeline_from_env() -> Result<RunReport> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config)?;
    Ok(pipeline.run_once().await)
}

/// Builds a scheduler running the full pipeline on `config.sync_cron`, or
/// `None` when recurring runs are disabled.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let report = pipeline.run_once().await;
            if !report.succeeded() {
                warn!(run_id = %report.context.run_id, "scheduled pipeline run failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

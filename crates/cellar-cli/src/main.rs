mod logging;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cellar_sync::{
    maybe_build_scheduler, PgInventoryStore, RunReport, RunSummary, SyncConfig, SyncPipeline,
    TaskId, TaskState,
};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "cellar")]
#[command(about = "Sync the liquor inventory sheet into Postgres and publish it as TypeScript")]
struct Cli {
    /// Print the run summary as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true, env = "CELLAR_LOG_FORMAT", value_enum, default_value_t)]
    log_format: logging::LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full pipeline: sync, export, detect changes, commit, push.
    Run,
    /// Fetch the sheet and refresh the table.
    Sync,
    /// Regenerate the artifact from the table.
    Export,
    /// Compare the artifact on disk with the committed version.
    Detect,
    /// Create the liquor table.
    Migrate,
    /// Run the pipeline on SYNC_CRON until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init_logging(cli.log_format)?;

    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = SyncPipeline::from_config(&config)?;
            finish(&pipeline.run_once().await, cli.json)
        }
        Commands::Sync => run_subset(&config, &[TaskId::Sync], cli.json).await,
        Commands::Export => run_subset(&config, &[TaskId::Export], cli.json).await,
        Commands::Detect => run_subset(&config, &[TaskId::DetectChanges], cli.json).await,
        Commands::Migrate => {
            let store = PgInventoryStore::connect_lazy(config.database.connect_options()?);
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
            Ok(())
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(&config)?);
            let Some(mut sched) = maybe_build_scheduler(pipeline, &config).await? else {
                bail!("scheduler disabled; set CELLAR_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(())
        }
    }
}

async fn run_subset(config: &SyncConfig, tasks: &[TaskId], json: bool) -> Result<()> {
    let pipeline = SyncPipeline::from_config(config)?;
    finish(&pipeline.run_tasks(tasks).await, json)
}

fn finish(report: &RunReport, json: bool) -> Result<()> {
    let summary = RunSummary::from(report);
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serializing run summary")?
        );
    } else {
        print_summary(&summary);
    }

    if !summary.succeeded {
        bail!("pipeline run {} failed", summary.run_id);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("run_id={}", summary.run_id);
    for task in &summary.tasks {
        let state = match task.state {
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
            TaskState::UpstreamFailed => "upstream-failed",
            TaskState::Pending => "pending",
            TaskState::Running => "running",
        };
        match &task.error {
            Some(error) => println!(
                "  {:<15} {state} after {} attempt(s): {error}",
                task.id.as_str(),
                task.attempts
            ),
            None => println!("  {:<15} {state}", task.id.as_str()),
        }
    }
    if let Some(sync) = &summary.sync {
        println!(
            "sync: records={} dropped={} before={} after={} delta={:+}",
            sync.records,
            sync.dropped_rows,
            sync.load.before,
            sync.load.after,
            sync.delta()
        );
    }
    if let Some(export) = &summary.export {
        println!(
            "export: {} ({} records, sha256 {})",
            export.path.display(),
            export.records,
            export.content_hash
        );
    }
    if let Some(changed) = summary.changed {
        println!("changed: {changed}");
    }
}

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use cellar_core::{ExportMapping, SourceColumnMapping};
use cellar_storage::{SheetSource, DEFAULT_SHEETS_HOST};
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

use crate::loader::{DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};
use crate::orchestrator::RetryPolicy;
use crate::publish::GitIdentity;

pub const DEFAULT_SPREADSHEET_ID: &str = "1plsSjVwRABsIbpjZGsxBXWpLV4hAGPRTFFlJOV4guFk";
pub const CONTAINER_CATALOG_PATH: &str = "/opt/airflow/catalog-beta";
pub const RELATIVE_CATALOG_PATH: &str = "../catalog-beta";
pub const DEFAULT_DATA_FILE: &str = "src/data/whiskey-data.ts";

#[derive(Clone)]
pub struct DatabaseConfig {
    /// Takes precedence over the split options when set.
    pub url: Option<String>,
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        if let Some(url) = &self.url {
            return url
                .parse::<PgConnectOptions>()
                .context("parsing DATABASE_URL");
        }
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.name);
        if !self.password.is_empty() {
            options = options.password(&self.password);
        }
        Ok(options)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfig {
    pub repo_root: PathBuf,
    /// Artifact location relative to `repo_root`.
    pub data_file: PathBuf,
    pub identity: GitIdentity,
    pub remote: String,
    pub branch: Option<String>,
}

impl PublishConfig {
    pub fn artifact_path(&self) -> PathBuf {
        self.repo_root.join(&self.data_file)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub source: SheetSource,
    pub publish: PublishConfig,
    pub owner: String,
    pub retry: RetryPolicy,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub artifacts_dir: PathBuf,
    pub mappings_path: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub batch_size: usize,
}

/// Picks the explicit checkout if given, else the first candidate that
/// exists, else the relative sibling checkout.
pub fn resolve_catalog_repo(explicit: Option<PathBuf>, exists: impl Fn(&Path) -> bool) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    [CONTAINER_CATALOG_PATH, RELATIVE_CATALOG_PATH]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| exists(p))
        .unwrap_or_else(|| PathBuf::from(RELATIVE_CATALOG_PATH))
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            retries: parsed("CELLAR_TASK_RETRIES")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.retries),
            delay: parsed("CELLAR_RETRY_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.delay),
            timeout: parsed("CELLAR_TASK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        };

        let identity = GitIdentity {
            author_name: var("GIT_AUTHOR_NAME", "cellar"),
            author_email: var("GIT_AUTHOR_EMAIL", "cellar@localhost"),
            committer_name: var("GIT_COMMITTER_NAME", "cellar"),
            committer_email: var("GIT_COMMITTER_EMAIL", "cellar@localhost"),
        };

        Self {
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
                name: var("DB_NAME", "liquor_db"),
                user: var("DB_USER", "postgres"),
                password: var("DB_PASSWORD", ""),
                host: var("DB_HOST", "localhost"),
                port: parsed("DB_PORT")
                    .and_then(|p| u16::try_from(p).ok())
                    .unwrap_or(5432),
            },
            source: SheetSource {
                host: var("SHEETS_HOST", DEFAULT_SHEETS_HOST),
                spreadsheet_id: var("SPREADSHEET_ID", DEFAULT_SPREADSHEET_ID),
                sheet_id: var("SHEET_ID", "0"),
            },
            publish: PublishConfig {
                repo_root: resolve_catalog_repo(lookup("CATALOG_REPO_PATH").map(PathBuf::from), |p| {
                    p.exists()
                }),
                data_file: PathBuf::from(var("CATALOG_DATA_FILE", DEFAULT_DATA_FILE)),
                identity,
                remote: var("GIT_REMOTE", "origin"),
                branch: lookup("GIT_BRANCH").filter(|v| !v.trim().is_empty()),
            },
            owner: var("PIPELINE_OWNER", "cellar"),
            retry,
            http_timeout_secs: parsed("CELLAR_HTTP_TIMEOUT_SECS").unwrap_or(20),
            user_agent: var("CELLAR_USER_AGENT", "cellar-sync/0.1"),
            artifacts_dir: PathBuf::from(var("ARTIFACTS_DIR", "./artifacts")),
            mappings_path: lookup("CELLAR_MAPPINGS").map(PathBuf::from),
            scheduler_enabled: lookup("CELLAR_SCHEDULER_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            sync_cron: var("SYNC_CRON", "0 0 6 * * *"),
            batch_size: parsed("CELLAR_BATCH_SIZE")
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.source.spreadsheet_id.trim().is_empty(),
            "SPREADSHEET_ID must not be empty"
        );
        anyhow::ensure!(!self.source.sheet_id.trim().is_empty(), "SHEET_ID must not be empty");
        anyhow::ensure!(
            self.publish.data_file.is_relative(),
            "CATALOG_DATA_FILE must be relative to the catalog repository"
        );
        anyhow::ensure!(
            (1..=MAX_BATCH_SIZE).contains(&self.batch_size),
            "CELLAR_BATCH_SIZE must be between 1 and {MAX_BATCH_SIZE}, got {}",
            self.batch_size
        );
        Ok(())
    }
}

/// Optional overrides for both column mappings; omitted sections keep the
/// built-in production layout.
#[derive(Debug, Default, Deserialize)]
pub struct MappingFile {
    #[serde(default)]
    pub source: SourceColumnMapping,
    #[serde(default)]
    pub export: ExportMapping,
}

pub fn load_mappings(path: Option<&Path>) -> Result<MappingFile> {
    let Some(path) = path else {
        return Ok(MappingFile::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading mappings file {}", path.display()))?;
    let mappings: MappingFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing mappings file {}", path.display()))?;
    mappings
        .source
        .validate()
        .and_then(|_| mappings.export.validate())
        .with_context(|| format!("validating mappings file {}", path.display()))?;
    Ok(mappings)
}

//! Change detection and version-control publishing of the artifact.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use cellar_storage::sha256_hex;
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::SyncRun;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to execute git: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("git {args} exited with {status}: {stderr}")]
    Git {
        args: String,
        status: i32,
        stderr: String,
    },
    #[error("{0} is not a git working tree")]
    NotARepository(PathBuf),
    #[error("reading artifact {path}: {source}")]
    ReadArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum CommitOutcome {
    Committed { id: String },
    NothingToCommit,
}

/// Verdict of comparing a freshly generated artifact with the tracked one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishDecision {
    pub changed: bool,
    pub content_hash: String,
    pub content: Vec<u8>,
}

/// The checkout that receives the artifact. Paths are relative to its root.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Content of `relpath` at the current commit; `None` when untracked.
    async fn tracked_content(&self, relpath: &Path) -> Result<Option<Vec<u8>>, PublishError>;
    async fn commit(&self, relpath: &Path, message: &str) -> Result<CommitOutcome, PublishError>;
    async fn push(&self) -> Result<(), PublishError>;
}

/// Compares `content` with the tracked version of `relpath`. Read-only.
pub async fn detect_changes(
    vcs: &dyn VersionControl,
    relpath: &Path,
    content: &[u8],
) -> Result<PublishDecision, PublishError> {
    let tracked = vcs.tracked_content(relpath).await?;
    let changed = tracked.as_deref() != Some(content);
    let content_hash = sha256_hex(content);
    info!(path = %relpath.display(), changed, hash = %content_hash, "compared artifact with tracked version");
    Ok(PublishDecision {
        changed,
        content_hash,
        content: content.to_vec(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub author_name: String,
    pub author_email: String,
    pub committer_name: String,
    pub committer_email: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            author_name: "cellar".to_string(),
            author_email: "cellar@localhost".to_string(),
            committer_name: "cellar".to_string(),
            committer_email: "cellar@localhost".to_string(),
        }
    }
}

/// A local git checkout driven through the `git` binary.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
    identity: GitIdentity,
    remote: String,
    branch: Option<String>,
}

fn git_path(relpath: &Path) -> String {
    relpath.to_string_lossy().replace('\\', "/")
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>, identity: GitIdentity) -> Self {
        Self {
            root: root.into(),
            identity,
            remote: "origin".to_string(),
            branch: None,
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>, branch: Option<String>) -> Self {
        self.remote = remote.into();
        self.branch = branch;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git_command(&self, args: &[&str]) -> Result<Output, PublishError> {
        debug!(repo = %self.root.display(), ?args, "running git");
        Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .env("GIT_AUTHOR_NAME", &self.identity.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.identity.author_email)
            .env("GIT_COMMITTER_NAME", &self.identity.committer_name)
            .env("GIT_COMMITTER_EMAIL", &self.identity.committer_email)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(PublishError::Spawn)
    }

    async fn git_output(&self, args: &[&str]) -> Result<Vec<u8>, PublishError> {
        let output = self.git_command(args).await?;
        if !output.status.success() {
            return Err(PublishError::Git {
                args: args.join(" "),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn ensure_work_tree(&self) -> Result<(), PublishError> {
        let output = self
            .git_command(&["rev-parse", "--is-inside-work-tree"])
            .await?;
        if output.status.success() && output.stdout.starts_with(b"true") {
            Ok(())
        } else {
            Err(PublishError::NotARepository(self.root.clone()))
        }
    }
}

#[async_trait]
impl VersionControl for GitRepo {
    async fn tracked_content(&self, relpath: &Path) -> Result<Option<Vec<u8>>, PublishError> {
        self.ensure_work_tree().await?;
        let object = format!("HEAD:{}", git_path(relpath));
        // Fails for an untracked path and for a repository without commits.
        let exists = self.git_command(&["cat-file", "-e", &object]).await?;
        if !exists.status.success() {
            return Ok(None);
        }
        self.git_output(&["show", &object]).await.map(Some)
    }

    async fn commit(&self, relpath: &Path, message: &str) -> Result<CommitOutcome, PublishError> {
        self.ensure_work_tree().await?;
        let path = git_path(relpath);
        self.git_output(&["add", "--", &path]).await?;

        let staged = self
            .git_command(&["diff", "--cached", "--quiet", "--", &path])
            .await?;
        if staged.status.success() {
            info!(path = %path, "artifact already committed; nothing to do");
            return Ok(CommitOutcome::NothingToCommit);
        }

        // Pathspec keeps unrelated staged changes out of the sync commit.
        self.git_output(&["commit", "--quiet", "-m", message, "--", &path])
            .await?;
        let id = String::from_utf8_lossy(&self.git_output(&["rev-parse", "HEAD"]).await?)
            .trim()
            .to_string();
        info!(commit = %id, path = %path, "committed artifact");
        Ok(CommitOutcome::Committed { id })
    }

    async fn push(&self) -> Result<(), PublishError> {
        let refspec = self.branch.as_deref().unwrap_or("HEAD");
        self.git_output(&["push", &self.remote, refspec]).await?;
        info!(remote = %self.remote, refspec, "pushed artifact commit");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMessage {
    pub subject: String,
    pub body: Vec<String>,
}

impl CommitMessage {
    pub fn for_run(date: NaiveDate, run: Option<&SyncRun>, owner: &str) -> Self {
        let subject = format!(
            "chore: sync whiskey data from Google Sheets [{}]",
            date.format("%Y-%m-%d")
        );
        let mut body = Vec::new();
        if let Some(run) = run {
            body.push(format!("Records before: {}", run.load.before));
            body.push(format!("Records after: {}", run.load.after));
            body.push(format!("Delta: {:+}", run.delta()));
            body.push(format!("Dropped rows: {}", run.dropped_rows));
            body.push(String::new());
        }
        body.push(format!("Triggered-by: {owner}"));
        Self { subject, body }
    }

    pub fn render(&self) -> String {
        format!("{}\n\n{}\n", self.subject, self.body.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoadReport;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    struct Tracked(Mutex<Option<Vec<u8>>>);

    #[async_trait]
    impl VersionControl for Tracked {
        async fn tracked_content(&self, _: &Path) -> Result<Option<Vec<u8>>, PublishError> {
            Ok(self.0.lock().unwrap().clone())
        }
        async fn commit(&self, _: &Path, _: &str) -> Result<CommitOutcome, PublishError> {
            unreachable!("detection never commits")
        }
        async fn push(&self) -> Result<(), PublishError> {
            unreachable!("detection never pushes")
        }
    }

    #[tokio::test]
    async fn identical_content_is_unchanged() {
        let vcs = Tracked(Mutex::new(Some(b"same".to_vec())));
        let decision = detect_changes(&vcs, Path::new("a.ts"), b"same").await.unwrap();
        assert!(!decision.changed);
        assert_eq!(decision.content, b"same");
        assert_eq!(decision.content_hash, sha256_hex(b"same"));
    }

    #[tokio::test]
    async fn differing_or_untracked_content_is_changed() {
        let vcs = Tracked(Mutex::new(Some(b"old".to_vec())));
        assert!(detect_changes(&vcs, Path::new("a.ts"), b"new").await.unwrap().changed);

        let untracked = Tracked(Mutex::new(None));
        assert!(detect_changes(&untracked, Path::new("a.ts"), b"").await.unwrap().changed);
    }

    #[test]
    fn commit_message_lists_signed_delta() {
        let run = SyncRun {
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
            source_url: "https://example.invalid/export".to_string(),
            snapshot: None,
            records: 12,
            dropped_rows: 2,
            load: LoadReport {
                before: 10,
                after: 12,
                inserted: 12,
            },
        };
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let message = CommitMessage::for_run(date, Some(&run), "airflow");

        assert_eq!(
            message.render(),
            "chore: sync whiskey data from Google Sheets [2026-03-01]\n\n\
             Records before: 10\nRecords after: 12\nDelta: +2\nDropped rows: 2\n\n\
             Triggered-by: airflow\n"
        );
    }

    #[test]
    fn commit_message_without_sync_details() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let message = CommitMessage::for_run(date, None, "cellar");
        assert_eq!(message.body, vec!["Triggered-by: cellar".to_string()]);
    }

    #[test]
    fn git_paths_use_forward_slashes() {
        assert_eq!(git_path(Path::new("src/data/whiskey-data.ts")), "src/data/whiskey-data.ts");
    }
}

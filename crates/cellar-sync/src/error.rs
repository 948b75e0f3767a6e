use std::time::Duration;

use cellar_adapters::AdapterError;
use cellar_storage::FetchError;
use thiserror::Error;

use crate::loader::LoadError;
use crate::orchestrator::TaskId;
use crate::publish::PublishError;

/// Stage-fatal conditions escalated to the orchestrator.
///
/// Cell-level parse problems never show up here; they resolve to absent
/// fields or a dropped-row count inside the transformer.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(#[from] FetchError),
    #[error("sheet could not be transformed: {0}")]
    Transform(#[from] AdapterError),
    #[error("load failed: {0}")]
    LoadFailed(#[source] LoadError),
    #[error("reading inventory for export: {0}")]
    ExportRead(#[source] LoadError),
    #[error("writing export artifact: {0:#}")]
    ExportIo(anyhow::Error),
    #[error("storing source snapshot: {0:#}")]
    Snapshot(anyhow::Error),
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
    #[error("task `{task}` exceeded its timeout of {timeout:?}")]
    Timeout { task: TaskId, timeout: Duration },
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Configuration problems stay broken no matter how often they are retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PipelineError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configuration_errors_are_final() {
        assert!(!PipelineError::Config("missing id".into()).is_retryable());
        assert!(PipelineError::ExportIo(anyhow::anyhow!("disk full")).is_retryable());
        assert!(PipelineError::Timeout {
            task: TaskId::Push,
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
    }

    #[test]
    fn io_errors_render_their_context_chain() {
        let err = PipelineError::ExportIo(
            anyhow::anyhow!("permission denied").context("renaming whiskey-data.ts"),
        );
        assert_eq!(
            err.to_string(),
            "writing export artifact: renaming whiskey-data.ts: permission denied"
        );
    }
}

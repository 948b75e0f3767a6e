//! Task graph, per-node retry policy and skip gating.
//!
//! Nodes run strictly one after another in graph order. A node whose
//! upstream failed is never attempted; a node whose upstream was skipped is
//! skipped as well. Otherwise the node's [`SkipRule`] is checked against the
//! run context before the first attempt.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::export::ExportReport;
use crate::publish::{CommitOutcome, PublishDecision};
use crate::SyncRun;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskId {
    Sync,
    Export,
    DetectChanges,
    Commit,
    Push,
}

impl TaskId {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskId::Sync => "sync",
            TaskId::Export => "export",
            TaskId::DetectChanges => "detect-changes",
            TaskId::Commit => "commit",
            TaskId::Push => "push",
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    UpstreamFailed,
}

impl TaskState {
    pub fn is_failure(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::UpstreamFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one.
    pub retries: u32,
    pub delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            delay: Duration::from_secs(30),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Precondition checked before a node's first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipRule {
    Never,
    /// Skip unless change detection reported a changed artifact.
    UnlessChanged,
    /// Skip unless the commit step produced a new commit.
    UnlessCommitted,
}

impl SkipRule {
    fn should_skip(self, ctx: &RunContext) -> bool {
        match self {
            SkipRule::Never => false,
            SkipRule::UnlessChanged => !ctx.decision.as_ref().is_some_and(|d| d.changed),
            SkipRule::UnlessCommitted => {
                !matches!(ctx.commit, Some(CommitOutcome::Committed { .. }))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    pub id: TaskId,
    pub upstream: Vec<TaskId>,
    pub retry: RetryPolicy,
    pub skip: SkipRule,
}

impl TaskNode {
    pub fn new(id: TaskId, upstream: &[TaskId], retry: RetryPolicy) -> Self {
        Self {
            id,
            upstream: upstream.to_vec(),
            retry,
            skip: SkipRule::Never,
        }
    }

    pub fn skip_when(mut self, skip: SkipRule) -> Self {
        self.skip = skip;
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("task `{0}` appears more than once")]
    DuplicateTask(TaskId),
    #[error("task `{task}` depends on `{upstream}`, which does not precede it")]
    UnorderedDependency { task: TaskId, upstream: TaskId },
}

/// Nodes listed in dependency order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
}

impl TaskGraph {
    pub fn new(nodes: Vec<TaskNode>) -> Result<Self, GraphError> {
        let mut seen = HashSet::new();
        for node in &nodes {
            if let Some(upstream) = node.upstream.iter().find(|u| !seen.contains(*u)) {
                return Err(GraphError::UnorderedDependency {
                    task: node.id,
                    upstream: *upstream,
                });
            }
            if !seen.insert(node.id) {
                return Err(GraphError::DuplicateTask(node.id));
            }
        }
        Ok(Self { nodes })
    }

    /// sync -> export -> detect-changes -> commit -> push
    pub fn standard(retry: RetryPolicy) -> Self {
        Self {
            nodes: vec![
                TaskNode::new(TaskId::Sync, &[], retry),
                TaskNode::new(TaskId::Export, &[TaskId::Sync], retry),
                TaskNode::new(TaskId::DetectChanges, &[TaskId::Export], retry),
                TaskNode::new(TaskId::Commit, &[TaskId::DetectChanges], retry)
                    .skip_when(SkipRule::UnlessChanged),
                TaskNode::new(TaskId::Push, &[TaskId::Commit], retry)
                    .skip_when(SkipRule::UnlessCommitted),
            ],
        }
    }

    /// Keeps only `ids`, dropping edges to nodes that are left out.
    pub fn subset(&self, ids: &[TaskId]) -> Self {
        let nodes = self
            .nodes
            .iter()
            .filter(|n| ids.contains(&n.id))
            .map(|n| TaskNode {
                upstream: n
                    .upstream
                    .iter()
                    .copied()
                    .filter(|u| ids.contains(u))
                    .collect(),
                ..n.clone()
            })
            .collect();
        Self { nodes }
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }
}

/// Outputs handed from one task to the next within a single run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub sync: Option<SyncRun>,
    pub export: Option<ExportReport>,
    pub decision: Option<PublishDecision>,
    pub commit: Option<CommitOutcome>,
}

impl RunContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            sync: None,
            export: None,
            decision: None,
            commit: None,
        }
    }
}

/// Executes one attempt of a task.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, task: TaskId, ctx: &mut RunContext) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub state: TaskState,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub tasks: Vec<TaskRecord>,
    pub context: RunContext,
}

impl RunReport {
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.iter().find(|t| t.id == id).map(|t| t.state)
    }

    pub fn succeeded(&self) -> bool {
        self.tasks.iter().all(|t| !t.state.is_failure())
    }
}

pub struct Orchestrator<'g> {
    graph: &'g TaskGraph,
}

impl<'g> Orchestrator<'g> {
    pub fn new(graph: &'g TaskGraph) -> Self {
        Self { graph }
    }

    pub async fn run(&self, runner: &dyn TaskRunner, mut ctx: RunContext) -> RunReport {
        let mut states: BTreeMap<TaskId, TaskState> = self
            .graph
            .nodes
            .iter()
            .map(|n| (n.id, TaskState::Pending))
            .collect();
        let mut records = Vec::with_capacity(self.graph.nodes.len());

        for node in &self.graph.nodes {
            let upstream: Vec<TaskState> = node
                .upstream
                .iter()
                .filter_map(|u| states.get(u).copied())
                .collect();

            let record = if upstream.iter().any(|s| s.is_failure()) {
                warn!(task = %node.id, "upstream failed; task not attempted");
                TaskRecord {
                    id: node.id,
                    state: TaskState::UpstreamFailed,
                    attempts: 0,
                    error: None,
                }
            } else if upstream.contains(&TaskState::Skipped) || node.skip.should_skip(&ctx) {
                info!(task = %node.id, "task skipped");
                TaskRecord {
                    id: node.id,
                    state: TaskState::Skipped,
                    attempts: 0,
                    error: None,
                }
            } else {
                states.insert(node.id, TaskState::Running);
                self.run_with_retries(node, runner, &mut ctx).await
            };

            states.insert(node.id, record.state);
            records.push(record);
        }

        RunReport {
            tasks: records,
            context: ctx,
        }
    }

    async fn run_with_retries(
        &self,
        node: &TaskNode,
        runner: &dyn TaskRunner,
        ctx: &mut RunContext,
    ) -> TaskRecord {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            info!(task = %node.id, attempt = attempts, "task started");

            let outcome = tokio::time::timeout(node.retry.timeout, runner.run_task(node.id, ctx))
                .await
                .unwrap_or_else(|_| {
                    Err(PipelineError::Timeout {
                        task: node.id,
                        timeout: node.retry.timeout,
                    })
                });

            let err = match outcome {
                Ok(()) => {
                    info!(task = %node.id, attempt = attempts, "task succeeded");
                    return TaskRecord {
                        id: node.id,
                        state: TaskState::Succeeded,
                        attempts,
                        error: None,
                    };
                }
                Err(err) => err,
            };

            if !err.is_retryable() || attempts > node.retry.retries {
                error!(task = %node.id, attempts, error = %err, "task failed");
                return TaskRecord {
                    id: node.id,
                    state: TaskState::Failed,
                    attempts,
                    error: Some(err.to_string()),
                };
            }

            warn!(
                task = %node.id,
                attempt = attempts,
                error = %err,
                delay_secs = node.retry.delay.as_secs_f64(),
                "task attempt failed; retrying"
            );
            tokio::time::sleep(node.retry.delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::publish::PublishError;

    const FAST: RetryPolicy = RetryPolicy {
        retries: 2,
        delay: Duration::ZERO,
        timeout: Duration::from_secs(5),
    };

    /// Fails each task a scripted number of times, then succeeds.
    #[derive(Default)]
    struct ScriptedRunner {
        failures: HashMap<TaskId, u32>,
        changed: bool,
        calls: Mutex<Vec<TaskId>>,
    }

    impl ScriptedRunner {
        fn failing(mut self, task: TaskId, times: u32) -> Self {
            self.failures.insert(task, times);
            self
        }

        fn calls(&self) -> Vec<TaskId> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn run_task(&self, task: TaskId, ctx: &mut RunContext) -> Result<(), PipelineError> {
            let previous = {
                let mut calls = self.calls.lock().unwrap();
                let previous = calls.iter().filter(|t| **t == task).count() as u32;
                calls.push(task);
                previous
            };
            if previous < self.failures.get(&task).copied().unwrap_or(0) {
                return Err(PipelineError::Publish(PublishError::NotARepository(
                    "scripted".into(),
                )));
            }
            match task {
                TaskId::DetectChanges => {
                    ctx.decision = Some(PublishDecision {
                        changed: self.changed,
                        content_hash: String::new(),
                        content: Vec::new(),
                    })
                }
                TaskId::Commit => {
                    ctx.commit = Some(CommitOutcome::Committed {
                        id: "abc".to_string(),
                    })
                }
                _ => {}
            }
            Ok(())
        }
    }

    async fn run(runner: &ScriptedRunner) -> RunReport {
        let graph = TaskGraph::standard(FAST);
        Orchestrator::new(&graph)
            .run(runner, RunContext::new(Uuid::nil()))
            .await
    }

    #[tokio::test]
    async fn changed_artifact_runs_every_task() {
        let runner = ScriptedRunner {
            changed: true,
            ..Default::default()
        };
        let report = run(&runner).await;
        assert!(report.succeeded());
        assert_eq!(
            runner.calls(),
            vec![
                TaskId::Sync,
                TaskId::Export,
                TaskId::DetectChanges,
                TaskId::Commit,
                TaskId::Push
            ]
        );
    }

    #[tokio::test]
    async fn unchanged_artifact_skips_commit_and_push() {
        let runner = ScriptedRunner::default();
        let report = run(&runner).await;

        assert!(report.succeeded());
        assert_eq!(report.state(TaskId::DetectChanges), Some(TaskState::Succeeded));
        assert_eq!(report.state(TaskId::Commit), Some(TaskState::Skipped));
        assert_eq!(report.state(TaskId::Push), Some(TaskState::Skipped));
        assert!(!runner.calls().contains(&TaskId::Commit));
    }

    #[tokio::test]
    async fn transient_failure_is_retried_within_budget() {
        let runner = ScriptedRunner {
            changed: true,
            ..Default::default()
        }
        .failing(TaskId::Export, 2);
        let report = run(&runner).await;

        assert!(report.succeeded());
        let export = report.tasks.iter().find(|t| t.id == TaskId::Export).unwrap();
        assert_eq!(export.attempts, 3);
        assert_eq!(export.state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_dependents_upstream_failed() {
        let runner = ScriptedRunner::default().failing(TaskId::Sync, 3);
        let report = run(&runner).await;

        assert!(!report.succeeded());
        let sync = &report.tasks[0];
        assert_eq!(sync.state, TaskState::Failed);
        assert_eq!(sync.attempts, 3);
        assert!(sync.error.is_some());
        for id in [TaskId::Export, TaskId::DetectChanges, TaskId::Commit, TaskId::Push] {
            assert_eq!(report.state(id), Some(TaskState::UpstreamFailed));
        }
        assert_eq!(runner.calls(), vec![TaskId::Sync; 3]);
    }

    #[tokio::test]
    async fn failed_push_leaves_earlier_results_in_place() {
        let runner = ScriptedRunner {
            changed: true,
            ..Default::default()
        }
        .failing(TaskId::Push, 10);
        let report = run(&runner).await;

        assert_eq!(report.state(TaskId::Commit), Some(TaskState::Succeeded));
        assert_eq!(report.state(TaskId::Push), Some(TaskState::Failed));
        assert!(report.context.commit.is_some());
    }

    #[tokio::test]
    async fn configuration_errors_are_not_retried() {
        struct Misconfigured;

        #[async_trait]
        impl TaskRunner for Misconfigured {
            async fn run_task(&self, _: TaskId, _: &mut RunContext) -> Result<(), PipelineError> {
                Err(PipelineError::Config("no spreadsheet id".to_string()))
            }
        }

        let graph = TaskGraph::standard(FAST);
        let report = Orchestrator::new(&graph)
            .run(&Misconfigured, RunContext::new(Uuid::nil()))
            .await;
        assert_eq!(report.tasks[0].attempts, 1);
        assert_eq!(report.tasks[0].state, TaskState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_exceeding_the_timeout_fail() {
        struct Hangs;

        #[async_trait]
        impl TaskRunner for Hangs {
            async fn run_task(&self, _: TaskId, _: &mut RunContext) -> Result<(), PipelineError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let policy = RetryPolicy {
            retries: 1,
            delay: Duration::from_secs(30),
            timeout: Duration::from_secs(1),
        };
        let graph = TaskGraph::standard(policy).subset(&[TaskId::Sync]);
        let report = Orchestrator::new(&graph)
            .run(&Hangs, RunContext::new(Uuid::nil()))
            .await;

        let sync = &report.tasks[0];
        assert_eq!(sync.state, TaskState::Failed);
        assert_eq!(sync.attempts, 2);
        assert!(sync.error.as_deref().unwrap().contains("timeout"));
    }

    #[test]
    fn graph_rejects_out_of_order_dependencies() {
        let err = TaskGraph::new(vec![
            TaskNode::new(TaskId::Export, &[TaskId::Sync], FAST),
            TaskNode::new(TaskId::Sync, &[], FAST),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::UnorderedDependency {
                task: TaskId::Export,
                upstream: TaskId::Sync
            }
        );
    }

    #[test]
    fn subset_drops_edges_to_removed_nodes() {
        let graph = TaskGraph::standard(FAST).subset(&[TaskId::DetectChanges]);
        assert_eq!(graph.nodes().len(), 1);
        assert!(graph.nodes()[0].upstream.is_empty());
    }

    #[test]
    fn standard_graph_is_well_ordered() {
        let graph = TaskGraph::standard(FAST);
        TaskGraph::new(graph.nodes().to_vec()).expect("valid graph");
    }
}

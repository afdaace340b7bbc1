//! Run object, status state machine and run outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::data::Item;
use crate::error::{EngineError, ErrorKind};
use crate::runtime::store::RunDataSnapshot;
use crate::runtime::token::SuspensionToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Waiting,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    /// Pending -> Running -> {Success, Failed, Waiting, Canceled}; Waiting -> {Running, Canceled}
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Waiting)
                | (Running, Canceled)
                | (Waiting, Running)
                | (Waiting, Canceled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Waiting => "waiting",
            Self::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Why a run was started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Manual,
    Trigger,
    /// Nested run started by another workflow
    Integrated,
    /// Error-workflow run dispatched for a failed run
    Error,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Trigger => "trigger",
            Self::Integrated => "integrated",
            Self::Error => "error",
        }
    }
}

/// Identity and lifecycle of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_id: String,
    pub mode: RunMode,
    pub depth: usize,
    status: RunStatus,
    pub started_at: DateTime<Utc>,
}

impl Run {
    pub fn new(workflow_id: impl Into<String>, mode: RunMode, depth: usize) -> Self {
        Self {
            id: RunId::new(),
            workflow_id: workflow_id.into(),
            mode,
            depth,
            status: RunStatus::Pending,
            started_at: Utc::now(),
        }
    }

    /// A run being resumed from a token: same identity, `Waiting` status
    pub fn resumed(token: &SuspensionToken) -> Self {
        Self {
            id: token.run_id,
            workflow_id: token.workflow.id.clone(),
            mode: token.mode,
            depth: token.depth,
            status: RunStatus::Waiting,
            started_at: token.started_at,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(run_id = %self.id, "Run status {} -> {}", self.status, next);
        self.status = next;
        Ok(())
    }
}

/// The failure that ended a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    /// Failing node; `None` for engine-level failures
    pub node: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of the error workflow dispatched for a failed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorWorkflowRun {
    pub workflow_id: String,
    pub run_id: Option<RunId>,
    pub status: RunStatus,
}

/// Final report of a run that reached a terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub workflow_id: String,
    pub status: RunStatus,
    pub run_data: RunDataSnapshot,
    pub last_node_executed: Option<String>,
    /// Nodes skipped because their inputs never received items
    pub skipped: Vec<String>,
    pub error: Option<RunError>,
    pub error_workflow: Option<ErrorWorkflowRun>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Items emitted by the last node executed
    pub fn result_items(&self) -> Vec<Item> {
        self.last_node_executed
            .as_deref()
            .and_then(|node| self.run_data.latest(node))
            .map(|result| result.output.first_non_empty().to_vec())
            .unwrap_or_default()
    }

    /// Items emitted on output 0 by `node` in its latest invocation
    pub fn node_items(&self, node: &str) -> Vec<Item> {
        self.run_data.output_items(node)
    }

    pub fn run_count(&self, node: &str) -> usize {
        self.run_data.run_count(node)
    }
}

/// What `start_run` / `resume_run` hand back
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Completed(RunReport),
    Suspended(SuspensionToken),
}

impl ExecutionResult {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed(report) => report.status,
            Self::Suspended(_) => RunStatus::Waiting,
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Self::Completed(report) => report.run_id,
            Self::Suspended(token) => token.run_id,
        }
    }

    pub fn report(&self) -> Option<&RunReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Suspended(_) => None,
        }
    }

    pub fn into_report(self) -> Option<RunReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Suspended(_) => None,
        }
    }

    pub fn into_token(self) -> Option<SuspensionToken> {
        match self {
            Self::Suspended(token) => Some(token),
            Self::Completed(_) => None,
        }
    }
}

/// Per-run options for `start_run_with`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Start node name; defaults to the first node without inputs
    pub start_node: Option<String>,
    pub mode: RunMode,
    /// Caller-supplied cancellation; the engine also registers the run for `cancel(run_id)`
    pub cancellation: Option<CancellationToken>,
}

impl RunOptions {
    pub fn start_at(mut self, node: impl Into<String>) -> Self {
        self.start_node = Some(node.into());
        self
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine() {
        let mut run = Run::new("wf", RunMode::Manual, 0);
        assert_eq!(run.status(), RunStatus::Pending);
        assert!(run.transition(RunStatus::Success).is_err());

        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Waiting).unwrap();
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Success).unwrap();
        assert!(run.status().is_terminal());
        assert!(matches!(
            run.transition(RunStatus::Running),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn waiting_runs_can_be_canceled() {
        assert!(RunStatus::Waiting.can_transition_to(RunStatus::Canceled));
        assert!(!RunStatus::Success.can_transition_to(RunStatus::Canceled));
    }
}

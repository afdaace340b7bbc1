//! Suspension tokens: serializable capture of a paused run
//!
//! A token carries the workflow definition, the scheduler state and a deep
//! copy of the run data, so it can be stored anywhere and resumed in another
//! process without re-running completed nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::{Item, NodeOutput};
use crate::error::EngineError;
use crate::runtime::run::{RunId, RunMode};
use crate::runtime::state::RunState;
use crate::runtime::store::{RunDataSnapshot, SourceRef};
use crate::workflow::Workflow;

/// What a suspended node is waiting for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitRequest {
    /// Resume once the given time has passed
    Until { resume_at: DateTime<Utc> },
    /// Resume on an external event (webhook call, approval, callback)
    External {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    /// A nested run suspended; its token is resumed before this run continues
    SubWorkflow {
        workflow_id: String,
        token: Box<SuspensionToken>,
    },
}

/// The node invocation a run is parked on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedNode {
    pub node: String,
    pub run_index: usize,
    pub source: Vec<Vec<SourceRef>>,
    pub input: Vec<Vec<Item>>,
    pub wait: WaitRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionToken {
    /// Unique per suspension; a token can be consumed once
    pub id: Uuid,
    pub run_id: RunId,
    pub workflow: Workflow,
    pub mode: RunMode,
    /// Nesting depth of the run (0 for top-level runs)
    pub depth: usize,
    /// The run's initial input
    pub input: Vec<Item>,
    pub state: RunState,
    pub run_data: RunDataSnapshot,
    pub suspended: SuspendedNode,
    pub started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SuspensionToken {
    pub fn wait(&self) -> &WaitRequest {
        &self.suspended.wait
    }

    /// Earliest resume time for timed waits, following nested tokens
    pub fn resume_at(&self) -> Option<DateTime<Utc>> {
        match &self.suspended.wait {
            WaitRequest::Until { resume_at } => Some(*resume_at),
            WaitRequest::SubWorkflow { token, .. } => token.resume_at(),
            WaitRequest::External { .. } => None,
        }
    }

    /// Innermost suspended node, as `(workflow id, node name)`
    pub fn innermost(&self) -> (&str, &str) {
        match &self.suspended.wait {
            WaitRequest::SubWorkflow { token, .. } => token.innermost(),
            _ => (&self.workflow.id, &self.suspended.node),
        }
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Data handed back when resuming a suspended run
///
/// With no explicit output, the suspended node passes its input through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<NodeOutput>,
}

impl ResumePayload {
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Items on output 0
    pub fn items(items: Vec<Item>) -> Self {
        Self {
            output: Some(NodeOutput::single(items)),
        }
    }

    pub fn ports(output: NodeOutput) -> Self {
        Self { output: Some(output) }
    }

    /// The suspended node's result for this payload
    pub fn into_output(self, suspended: &SuspendedNode) -> NodeOutput {
        match self.output {
            Some(output) => output,
            None => NodeOutput::single(
                suspended
                    .input
                    .first()
                    .map(|items| {
                        items
                            .iter()
                            .enumerate()
                            .map(|(index, item)| item.clone().paired_to(index))
                            .collect()
                    })
                    .unwrap_or_default(),
            ),
        }
    }
}

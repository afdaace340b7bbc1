//! Runs another workflow as a nested run
//!
//! Expected params: `{ "workflow_id": "wf-child" }` (looked up in the workflow
//! registry) or `{ "workflow": { ...inline definition... } }`, plus an optional
//! `wait_for_completion` (default `true`).
//!
//! When waiting, the child's result items become this node's output and a
//! child suspension suspends the parent. Otherwise the child runs in the
//! background and the input passes through.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{bool_param, passthrough, NodeDescription, NodeOutcome, NodeType};
use crate::data::Item;
use crate::error::{EngineError, ErrorKind, NodeError};
use crate::runtime::context::NodeCallContext;
use crate::runtime::run::{ExecutionResult, RunReport, RunStatus};
use crate::runtime::token::WaitRequest;
use crate::workflow::Workflow;

pub struct ExecuteWorkflow;

#[async_trait]
impl NodeType for ExecuteWorkflow {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("execute_workflow", "Execute Workflow")
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        let workflow = target_workflow(ctx)?;
        let input: Vec<Item> = ctx.items().iter().map(child_input).collect();

        if !bool_param(ctx, "wait_for_completion", true) {
            let background = ctx.clone();
            let workflow_id = workflow.id.clone();
            tokio::spawn(async move {
                match background.run_workflow(workflow, input).await {
                    Ok(result) => {
                        tracing::info!("🔀 Background run of '{}' ended: {:?}", workflow_id, result.status())
                    }
                    Err(e) => tracing::warn!("⚠️ Background run of '{}' failed to start: {}", workflow_id, e),
                }
            });
            return Ok(NodeOutcome::items(passthrough(ctx.items())));
        }

        let workflow_id = workflow.id.clone();
        tracing::debug!("🔀 Node '{}' running sub-workflow '{}'", ctx.node_name(), workflow_id);
        match ctx.run_workflow(workflow, input).await {
            Ok(ExecutionResult::Completed(report)) if report.is_success() => {
                Ok(NodeOutcome::items(child_items(&report)))
            }
            Ok(ExecutionResult::Completed(report)) => Err(child_error(&workflow_id, &report)),
            Ok(ExecutionResult::Suspended(token)) => Ok(NodeOutcome::Suspend(WaitRequest::SubWorkflow {
                workflow_id,
                token: Box::new(token),
            })),
            Err(e) => Err(engine_error(&workflow_id, &e)),
        }
    }
}

fn target_workflow(ctx: &NodeCallContext) -> Result<Arc<Workflow>, NodeError> {
    if let Some(inline) = ctx.parameter("workflow").filter(|value| value.is_object()) {
        let workflow: Workflow = serde_json::from_value(inline.clone())
            .map_err(|e| NodeError::input(format!("invalid inline workflow in '{}': {}", ctx.node_name(), e)))?;
        return Ok(Arc::new(workflow));
    }

    let workflow_id = ctx
        .parameter("workflow_id")
        .and_then(Value::as_str)
        .ok_or_else(|| NodeError::input(format!("node '{}' needs 'workflow_id' or 'workflow'", ctx.node_name())))?;
    ctx.workflows()
        .get_workflow(workflow_id)
        .ok_or_else(|| NodeError::input(format!("workflow '{}' is not registered", workflow_id)))
}

/// Child runs start from clean items: no provenance or error from the parent
fn child_input(item: &Item) -> Item {
    let mut item = item.clone();
    item.paired_item.clear();
    item.error = None;
    item
}

/// Items a successful child run hands back to its parent
pub(crate) fn child_items(report: &RunReport) -> Vec<Item> {
    report
        .result_items()
        .into_iter()
        .map(|mut item| {
            item.paired_item.clear();
            item
        })
        .collect()
}

/// Failure of a completed child run as seen by the parent node
pub(crate) fn child_error(workflow_id: &str, report: &RunReport) -> NodeError {
    if report.status == RunStatus::Canceled {
        return NodeError::Cancelled;
    }
    let (kind, message) = match &report.error {
        Some(error) => (error.kind, error.message.clone()),
        None => (ErrorKind::Fatal, format!("run ended with status {:?}", report.status)),
    };
    NodeError::SubWorkflow {
        workflow_id: workflow_id.to_string(),
        kind,
        message,
    }
}

/// A child run that could not be started or resumed
pub(crate) fn engine_error(workflow_id: &str, error: &EngineError) -> NodeError {
    NodeError::SubWorkflow {
        workflow_id: workflow_id.to_string(),
        kind: error.kind(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::tests::contexts_for;
    use crate::workflow::Node;
    use serde_json::json;

    #[tokio::test]
    async fn unknown_workflow_is_an_input_error() {
        let node = Node::new("Child", "execute_workflow").parameters(json!({"workflow_id": "missing"}));
        let contexts = contexts_for(node, vec![Item::default()]);
        let result = ExecuteWorkflow.execute(&contexts[0]).await;
        assert!(matches!(result, Err(NodeError::Input(_))));
    }

    #[test]
    fn child_input_is_stripped() {
        let item = Item::new(json!({"a": 1})).paired_to(3);
        let stripped = child_input(&item);
        assert!(stripped.paired_item.is_empty());
        assert_eq!(stripped.get("a"), Some(&json!(1)));
    }

    #[test]
    fn engine_errors_keep_their_kind() {
        let error = engine_error("wf-child", &EngineError::DepthExceeded(17));
        match error {
            NodeError::SubWorkflow { workflow_id, kind, .. } => {
                assert_eq!(workflow_id, "wf-child");
                assert_eq!(kind, EngineError::DepthExceeded(17).kind());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}

//! Fails the run on purpose
//!
//! Expected params: `{ "message": "Order total missing", "kind": "input" }`.
//! `kind` is one of `input`, `operational` or `fatal`.

use async_trait::async_trait;
use serde_json::Value;

use super::{NodeDescription, NodeOutcome, NodeType};
use crate::error::NodeError;
use crate::runtime::context::NodeCallContext;

pub struct StopAndError;

#[async_trait]
impl NodeType for StopAndError {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("stop_and_error", "Stop and Error")
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        let message = ctx
            .parameter("message")
            .and_then(Value::as_str)
            .unwrap_or("Workflow stopped")
            .to_string();
        tracing::debug!("🛑 '{}' stopping the run: {}", ctx.node_name(), message);

        match ctx.parameter("kind").and_then(Value::as_str).unwrap_or("input") {
            "input" => Err(NodeError::Input(message)),
            "operational" => Err(NodeError::Operational(message)),
            "fatal" => Err(NodeError::Fatal(message)),
            other => Err(NodeError::input(format!("unknown error kind '{}': {}", other, message))),
        }
    }
}

//! Start node: emits the run's input items

use async_trait::async_trait;

use super::{NodeDescription, NodeOutcome, NodeType};
use crate::error::NodeError;
use crate::runtime::context::NodeCallContext;

pub struct Trigger;

#[async_trait]
impl NodeType for Trigger {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("trigger", "Manual Trigger").trigger()
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        tracing::debug!("🎯 Trigger '{}' emitting {} items", ctx.node_name(), ctx.execution().input.len());
        Ok(NodeOutcome::items(ctx.execution().input.clone()))
    }
}

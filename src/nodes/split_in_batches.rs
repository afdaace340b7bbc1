//! Feeds its input downstream in batches, one batch per iteration
//!
//! Expected params: `{ "batch_size": 10 }`. Output 0 (`done`) fires once every
//! batch went through output 1 (`loop`), and carries all input items.

use async_trait::async_trait;

use super::{passthrough, NodeDescription, NodeOutcome, NodeType};
use crate::data::NodeOutput;
use crate::error::NodeError;
use crate::runtime::context::NodeCallContext;

pub const DEFAULT_BATCH_SIZE: usize = 10;

pub struct SplitInBatches;

#[async_trait]
impl NodeType for SplitInBatches {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("split_in_batches", "Split In Batches")
            .outputs(&["done", "loop"])
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        let batch_size = match ctx.parameter("batch_size") {
            None => DEFAULT_BATCH_SIZE,
            Some(value) => value
                .as_u64()
                .filter(|&size| size > 0)
                .map(|size| size as usize)
                .ok_or_else(|| NodeError::input(format!("invalid batch_size {} in '{}'", value, ctx.node_name())))?,
        };

        let items = ctx.items();
        let start = ctx.iteration().saturating_mul(batch_size);
        if start < items.len() {
            let end = (start + batch_size).min(items.len());
            let batch = items[start..end]
                .iter()
                .enumerate()
                .map(|(offset, item)| item.clone().paired_to(start + offset))
                .collect();
            tracing::debug!(
                "🔁 '{}' batch {} ({}..{} of {})",
                ctx.node_name(),
                ctx.iteration(),
                start,
                end,
                items.len()
            );
            return Ok(NodeOutcome::Continue(NodeOutput::ports(vec![Vec::new(), batch])));
        }

        tracing::debug!("✅ '{}' done after {} batches", ctx.node_name(), ctx.iteration());
        Ok(NodeOutcome::Complete(NodeOutput::ports(vec![passthrough(items), Vec::new()])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Item, PairedItem};
    use crate::runtime::context::tests::contexts_with_run;
    use crate::workflow::Node;
    use serde_json::{json, Value};

    async fn iterate(iteration: usize, parameters: Value) -> Result<NodeOutcome, NodeError> {
        let items = Item::from_values(json!([{"n": 1}, {"n": 2}, {"n": 3}]));
        let node = Node::new("Batches", "split_in_batches").parameters(parameters);
        let contexts = contexts_with_run(node, items, 0, iteration);
        SplitInBatches.execute(&contexts[0]).await
    }

    #[tokio::test]
    async fn emits_batches_then_done() {
        let first = iterate(0, json!({"batch_size": 2})).await.unwrap();
        let NodeOutcome::Continue(output) = first else {
            panic!("expected a batch, got {first:?}");
        };
        assert!(output.port(0).is_empty());
        assert_eq!(output.port(1).len(), 2);

        let second = iterate(1, json!({"batch_size": 2})).await.unwrap();
        let NodeOutcome::Continue(output) = second else {
            panic!("expected a batch, got {second:?}");
        };
        assert_eq!(output.port(1).len(), 1);
        assert_eq!(output.port(1)[0].paired_item, vec![PairedItem::new(2)]);

        let done = iterate(2, json!({"batch_size": 2})).await.unwrap();
        let NodeOutcome::Complete(output) = done else {
            panic!("expected done, got {done:?}");
        };
        assert_eq!(output.port(0).len(), 3);
        assert!(output.port(1).is_empty());
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let result = iterate(0, json!({"batch_size": 0})).await;
        assert!(matches!(result, Err(NodeError::Input(_))));
    }
}

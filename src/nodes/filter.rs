//! Keeps the items whose `condition` parameter resolves truthy
//!
//! Expected params: `{ "condition": "={{ $json.n % 2 == 0 }}" }`

use async_trait::async_trait;

use super::{current_item, is_truthy, NodeDescription, NodeOutcome, NodeType};
use crate::error::NodeError;
use crate::runtime::context::NodeCallContext;

pub struct Filter;

#[async_trait]
impl NodeType for Filter {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("filter", "Filter").per_item()
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        let condition = ctx
            .parameter("condition")
            .ok_or_else(|| NodeError::input(format!("node '{}' missing 'condition' parameter", ctx.node_name())))?;

        let kept = if is_truthy(condition) {
            vec![current_item(ctx)?]
        } else {
            Vec::new()
        };
        Ok(NodeOutcome::items(kept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Item, PairedItem};
    use crate::runtime::context::tests::contexts_for;
    use crate::workflow::Node;
    use serde_json::json;

    #[tokio::test]
    async fn keeps_even_numbers() {
        let node = Node::new("Even", "filter").parameters(json!({"condition": "={{ $json.n % 2 == 0 }}"}));
        let contexts = contexts_for(node, Item::from_values(json!([{"n": 1}, {"n": 2}, {"n": 3}, {"n": 4}])));

        let mut kept = Vec::new();
        for ctx in &contexts {
            if let NodeOutcome::Complete(output) = Filter.execute(ctx).await.unwrap() {
                kept.extend(output.port(0).to_vec());
            }
        }
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].get("n"), Some(&json!(2)));
        assert_eq!(kept[1].paired_item, vec![PairedItem::new(3)]);
    }

    #[tokio::test]
    async fn missing_condition_is_an_input_error() {
        let contexts = contexts_for(Node::new("Even", "filter"), vec![Item::default()]);
        assert!(matches!(Filter.execute(&contexts[0]).await, Err(NodeError::Input(_))));
    }
}

//! Routes each item to the `true` or `false` output

use async_trait::async_trait;

use super::{current_item, is_truthy, NodeDescription, NodeOutcome, NodeType};
use crate::data::NodeOutput;
use crate::error::NodeError;
use crate::runtime::context::NodeCallContext;

pub struct If;

#[async_trait]
impl NodeType for If {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("if", "If")
            .outputs(&["true", "false"])
            .per_item()
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        let condition = ctx
            .parameter("condition")
            .ok_or_else(|| NodeError::input(format!("node '{}' missing 'condition' parameter", ctx.node_name())))?;
        let item = current_item(ctx)?;

        let ports = if is_truthy(condition) {
            vec![vec![item], Vec::new()]
        } else {
            vec![Vec::new(), vec![item]]
        };
        Ok(NodeOutcome::Complete(NodeOutput::ports(ports)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Item;
    use crate::runtime::context::tests::contexts_for;
    use crate::workflow::Node;
    use serde_json::json;

    #[tokio::test]
    async fn routes_by_condition() {
        let node = Node::new("Big?", "if").parameters(json!({"condition": "={{ $json.size > 10 }}"}));
        let contexts = contexts_for(node, Item::from_values(json!([{"size": 3}, {"size": 30}])));

        let NodeOutcome::Complete(small) = If.execute(&contexts[0]).await.unwrap() else {
            panic!("expected complete output");
        };
        assert!(small.port(0).is_empty());
        assert_eq!(small.port(1)[0].get("size"), Some(&json!(3)));

        let NodeOutcome::Complete(big) = If.execute(&contexts[1]).await.unwrap() else {
            panic!("expected complete output");
        };
        assert_eq!(big.port(0).len(), 1);
        assert!(big.port(1).is_empty());
    }
}

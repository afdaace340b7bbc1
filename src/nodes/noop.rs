//! Pass-through node

use async_trait::async_trait;

use super::{passthrough, NodeDescription, NodeOutcome, NodeType};
use crate::error::NodeError;
use crate::runtime::context::NodeCallContext;

pub struct NoOp;

#[async_trait]
impl NodeType for NoOp {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("noop", "No Operation")
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        Ok(NodeOutcome::items(passthrough(ctx.items())))
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
    async fn re_pairs_items_to_own_input() {
        let input = vec![Item::new(json!({"a": 1})).paired_to(5), Item::new(json!({"a": 2}))];
        let contexts = contexts_for(Node::new("Pass", "noop"), input);

        let NodeOutcome::Complete(output) = NoOp.execute(&contexts[0]).await.unwrap() else {
            panic!("expected complete output");
        };
        assert_eq!(output.port(0).len(), 2);
        assert_eq!(output.port(0)[0].paired_item, vec![PairedItem::new(0)]);
        assert_eq!(output.port(0)[1].get("a"), Some(&json!(2)));
    }
}

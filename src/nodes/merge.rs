//! Joins the items of two inputs
//!
//! Modes:
//! - `append` (default): input 1 items followed by input 2 items
//! - `combine_by_position`: merge item i of both inputs, extra items dropped
//! - `combine_by_field`: merge items whose `field` values are equal (inner join)
//! - `multiplex`: every combination of input 1 and input 2 items
//!
//! When both sides define a key, input 2 wins.

use async_trait::async_trait;
use serde_json::Value;

use super::{str_param, InputPort, NodeDescription, NodeOutcome, NodeType};
use crate::data::{Item, PairedItem};
use crate::error::NodeError;
use crate::runtime::context::NodeCallContext;

pub struct Merge;

#[async_trait]
impl NodeType for Merge {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("merge", "Merge")
            .inputs(vec![InputPort::required("input1"), InputPort::required("input2")])
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        let left = ctx.input(0);
        let right = ctx.input(1);
        let mode = ctx.parameter("mode").and_then(Value::as_str).unwrap_or("append");
        tracing::debug!("🔀 Merge '{}' ({}): {} + {} items", ctx.node_name(), mode, left.len(), right.len());

        let merged = match mode {
            "append" => {
                let first = left.iter().enumerate().map(|(i, item)| tag(item.clone(), &[(i, 0)]));
                let second = right.iter().enumerate().map(|(i, item)| tag(item.clone(), &[(i, 1)]));
                first.chain(second).collect()
            }
            "combine_by_position" => left
                .iter()
                .zip(right)
                .enumerate()
                .map(|(i, (l, r))| combine(l, r, i, i))
                .collect(),
            "combine_by_field" => {
                let field = str_param(ctx, "field")?;
                let mut merged = Vec::new();
                for (i, l) in left.iter().enumerate() {
                    let Some(key) = l.get(field).filter(|value| !value.is_null()) else {
                        continue;
                    };
                    if let Some((j, r)) = right.iter().enumerate().find(|(_, r)| r.get(field) == Some(key)) {
                        merged.push(combine(l, r, i, j));
                    }
                }
                merged
            }
            "multiplex" => left
                .iter()
                .enumerate()
                .flat_map(|(i, l)| right.iter().enumerate().map(move |(j, r)| combine(l, r, i, j)))
                .collect(),
            other => return Err(NodeError::input(format!("unknown merge mode '{}'", other))),
        };
        Ok(NodeOutcome::items(merged))
    }
}

fn tag(mut item: Item, links: &[(usize, usize)]) -> Item {
    item.paired_item = links
        .iter()
        .map(|&(item, input)| PairedItem::on_input(item, input))
        .collect();
    item
}

fn combine(left: &Item, right: &Item, i: usize, j: usize) -> Item {
    let mut merged = left.clone();
    merged.json.extend(right.json.clone());
    merged.binary.extend(right.binary.clone());
    tag(merged, &[(i, 0), (j, 1)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{ExecutionInfo, ExpressionResolver};
    use crate::nodes::NodeTypeRegistry;
    use crate::runtime::context::tests::services;
    use crate::runtime::context::ContextBuilder;
    use crate::runtime::state::NodeInputs;
    use crate::runtime::store::RunHistory;
    use crate::workflow::{CompiledWorkflow, Node, Workflow};
    use serde_json::json;
    use std::sync::Arc;

    async fn merge(mode: Value, left: Value, right: Value) -> Vec<Item> {
        let workflow = Workflow::new("wf", "Merge")
            .node(Node::new("Start", "trigger"))
            .node(Node::new("Join", "merge").parameters(mode))
            .connect_ports("Start", 0, "Join", 0)
            .connect_ports("Start", 0, "Join", 1);
        let compiled = CompiledWorkflow::compile(Arc::new(workflow), &NodeTypeRegistry::with_builtins()).unwrap();
        let history = RunHistory::new();
        let execution = Arc::new(ExecutionInfo::default());
        let services = services();
        let resolver = ExpressionResolver::default();
        let builder = ContextBuilder {
            compiled: &compiled,
            history: &history,
            execution: &execution,
            resolver: &resolver,
            services: &services,
        };
        let inputs = NodeInputs {
            items: vec![Item::from_values(left), Item::from_values(right)],
            source: vec![Vec::new(), Vec::new()],
        };
        let contexts = builder.build(1, &inputs, 0, 0).unwrap();
        match Merge.execute(&contexts[0]).await.unwrap() {
            NodeOutcome::Complete(output) => output.port(0).to_vec(),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn append_keeps_order_and_provenance() {
        let items = merge(json!({}), json!([{"a": 1}, {"a": 2}]), json!([{"b": 1}])).await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].paired_item, vec![PairedItem::on_input(0, 1)]);
    }

    #[tokio::test]
    async fn combine_modes() {
        let left = json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]);
        let right = json!([{"id": 2, "score": 9}, {"id": 3, "score": 4}]);

        let by_field = merge(json!({"mode": "combine_by_field", "field": "id"}), left.clone(), right.clone()).await;
        assert_eq!(by_field.len(), 1);
        assert_eq!(by_field[0].json_value(), json!({"id": 2, "name": "b", "score": 9}));

        let by_position = merge(json!({"mode": "combine_by_position"}), left.clone(), right.clone()).await;
        assert_eq!(by_position[0].get("score"), Some(&json!(9)));
        assert_eq!(by_position[0].get("id"), Some(&json!(2)));

        let product = merge(json!({"mode": "multiplex"}), left, right).await;
        assert_eq!(product.len(), 4);
    }
}

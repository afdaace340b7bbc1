//! Sets fields on every item
//!
//! Expected params: `{ "values": { "total": "={{ $json.price * $json.qty }}", "meta.source": "api" },
//! "keep_only_set": false }`. Dotted keys create nested objects.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{bool_param, current_item, NodeDescription, NodeOutcome, NodeType};
use crate::error::NodeError;
use crate::runtime::context::NodeCallContext;

pub struct Set;

#[async_trait]
impl NodeType for Set {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("set", "Set").per_item()
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        let values = ctx
            .parameter("values")
            .and_then(Value::as_object)
            .ok_or_else(|| NodeError::input(format!("node '{}' needs a 'values' object", ctx.node_name())))?;

        let mut item = current_item(ctx)?;
        if bool_param(ctx, "keep_only_set", false) {
            item.json.clear();
            item.binary.clear();
        }
        for (path, value) in values {
            set_path(&mut item.json, path, value.clone());
        }
        Ok(NodeOutcome::items(vec![item]))
    }
}

fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                set_path(map, rest, value);
            }
        }
    }
}

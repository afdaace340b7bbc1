//! Runs a Lua script over all input items
//!
//! Expected params: `{ "script": "local out = {} for i, item in ipairs(items) do ... end return out" }`
//!
//! The script sees `items` (the JSON of every input item, 1-based) and
//! `run_index`. It returns an array of items, a single object, or nothing.
//! When it returns as many items as it received, output item i is paired to
//! input item i.
//!
//! Scripts run on the blocking pool. An instruction hook stops them when the
//! run is cancelled or the node's timeout drops the pending call.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{str_param, NodeDescription, NodeOutcome, NodeType};
use crate::data::Item;
use crate::error::NodeError;
use crate::expression::{lua, DEFAULT_MEMORY_LIMIT};
use crate::runtime::context::NodeCallContext;

pub struct Code;

#[async_trait]
impl NodeType for Code {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("code", "Code")
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        let script = str_param(ctx, "script")?;
        tracing::debug!("🧠 Running script for '{}' over {} items", ctx.node_name(), ctx.items().len());

        let input: Vec<Value> = ctx.items().iter().map(Item::json_value).collect();
        let abandoned = StopOnDrop::default();
        let stop = Interrupt {
            abandoned: abandoned.0.clone(),
            cancellation: ctx.cancellation().clone(),
        };
        let script = script.to_string();
        let run_index = ctx.run_index();
        let outcome = tokio::task::spawn_blocking(move || {
            run_script(&script, input, run_index, stop).map_err(|e| {
                if lua::is_interrupted(&e) {
                    None
                } else {
                    Some(e.to_string())
                }
            })
        })
        .await
        .map_err(|e| NodeError::fatal(format!("script task for '{}' panicked: {}", ctx.node_name(), e)))?;
        drop(abandoned);

        let result = outcome.map_err(|failure| match failure {
            Some(message) => NodeError::input(format!("script in '{}' failed: {}", ctx.node_name(), message)),
            None => {
                tracing::debug!("Script in '{}' interrupted", ctx.node_name());
                NodeError::Cancelled
            }
        })?;

        let mut items = match result {
            Value::Null => Vec::new(),
            Value::Object(map) if map.is_empty() => Vec::new(),
            Value::Array(values) => values.into_iter().map(Item::new).collect(),
            other => vec![Item::new(other)],
        };
        if items.len() == ctx.items().len() {
            items = items
                .into_iter()
                .enumerate()
                .map(|(index, item)| item.paired_to(index))
                .collect();
        }
        Ok(NodeOutcome::items(items))
    }
}

/// Raises the stop flag when the awaiting future goes away
#[derive(Default)]
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

struct Interrupt {
    abandoned: Arc<AtomicBool>,
    cancellation: CancellationToken,
}

impl Interrupt {
    fn requested(&self) -> bool {
        self.abandoned.load(Ordering::Relaxed) || self.cancellation.is_cancelled()
    }
}

/// Evaluate the script in a fresh sandbox; the Lua state never outlives this call
fn run_script(script: &str, input: Vec<Value>, run_index: usize, stop: Interrupt) -> mlua::Result<Value> {
    let lua = lua::sandbox(DEFAULT_MEMORY_LIMIT)?;
    lua::interrupt_when(&lua, move || stop.requested())?;
    let globals = lua.globals();
    globals.set("items", lua::to_lua(&lua, &Value::Array(input))?)?;
    globals.set("run_index", run_index)?;

    let result: mlua::Value = lua.load(script).set_name("code").eval()?;
    lua::lua_to_json(result)
}

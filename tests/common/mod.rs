//! Shared fixtures for the engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use nodeflow::config::EngineConfig;
use nodeflow::error::NodeError;
use nodeflow::nodes::{NodeDescription, NodeOutcome, NodeType, NodeTypeRegistry};
use nodeflow::runtime::{ExecutionEngine, ExecutionResult, NodeCallContext, RunReport};
use nodeflow::workflow::WorkflowRegistry;
use nodeflow::Item;

/// Engine limits independent of the environment
pub fn config() -> EngineConfig {
    EngineConfig {
        max_parallel_nodes: 1,
        default_node_timeout_ms: None,
        max_workflow_depth: 8,
        max_loop_iterations: 100,
        expression_memory_limit: 8 * 1024 * 1024,
        expression_timeout_ms: 1_000,
    }
}

pub fn engine() -> ExecutionEngine {
    ExecutionEngine::new(config())
}

/// Engine with the built-ins plus extra test node types
pub fn engine_with(extra: Vec<Arc<dyn NodeType>>, workflows: Arc<WorkflowRegistry>) -> ExecutionEngine {
    let mut types = NodeTypeRegistry::with_builtins();
    for node_type in extra {
        types.register_arc(node_type);
    }
    ExecutionEngine::builder(config())
        .node_types(types)
        .workflows(workflows)
        .build()
}

/// `[{"n": 1}, {"n": 2}, ...]`
pub fn numbers(values: &[i64]) -> Vec<Item> {
    values.iter().map(|n| Item::new(serde_json::json!({ "n": n }))).collect()
}

/// Values of `field` across items, `Null` where missing
pub fn field(items: &[Item], name: &str) -> Vec<Value> {
    items
        .iter()
        .map(|item| item.get(name).cloned().unwrap_or(Value::Null))
        .collect()
}

pub fn completed(result: ExecutionResult) -> RunReport {
    match result {
        ExecutionResult::Completed(report) => report,
        ExecutionResult::Suspended(token) => panic!("run unexpectedly suspended at '{}'", token.suspended.node),
    }
}

fn passthrough(ctx: &NodeCallContext) -> NodeOutcome {
    let items = ctx
        .items()
        .iter()
        .enumerate()
        .map(|(index, item)| item.clone().paired_to(index))
        .collect();
    NodeOutcome::items(items)
}

/// Appends its node name to a shared log and passes items through (type `record`)
#[derive(Clone, Default)]
pub struct Record {
    pub log: Arc<Mutex<Vec<String>>>,
    pub seen: Arc<Mutex<Vec<Item>>>,
}

impl Record {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn seen(&self) -> Vec<Item> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl NodeType for Record {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("record", "Record")
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        self.log.lock().push(ctx.node_name().to_string());
        self.seen.lock().extend(ctx.items().iter().cloned());
        Ok(passthrough(ctx))
    }
}

/// Fails with an operational error until attempt `succeed_on` (type `flaky`)
pub struct Flaky {
    pub attempts: AtomicU32,
    pub succeed_on: u32,
}

impl Flaky {
    pub fn new(succeed_on: u32) -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicU32::new(0),
            succeed_on,
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeType for Flaky {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("flaky", "Flaky")
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < self.succeed_on {
            return Err(NodeError::operational(format!("upstream unavailable (attempt {attempt})")));
        }
        Ok(passthrough(ctx))
    }
}

/// Cancels the given token, then passes items through (type `cancel`)
pub struct Cancel(pub CancellationToken);

#[async_trait]
impl NodeType for Cancel {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("cancel", "Cancel")
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        self.0.cancel();
        Ok(passthrough(ctx))
    }
}

/// Signals `started`, then holds until `release` is notified (type `gate`)
#[derive(Default)]
pub struct Gate {
    pub started: Notify,
    pub release: Notify,
}

#[async_trait]
impl NodeType for Gate {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("gate", "Gate")
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(passthrough(ctx))
    }
}

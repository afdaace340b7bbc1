//! Node type contract and registry
//!
//! Every node type implements [`NodeType`]; the engine holds a registry from
//! type identifier to implementation and never branches on concrete types.
//! This module also ships the core logic nodes (no integrations).

use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

use crate::data::NodeOutput;
use crate::error::NodeError;
use crate::runtime::context::NodeCallContext;
use crate::runtime::token::WaitRequest;

pub mod code;
pub mod execute_workflow;
pub mod filter;
pub mod if_node;
pub mod merge;
pub mod noop;
pub mod set;
pub mod split_in_batches;
pub mod stop_and_error;
pub mod summarize;
pub mod trigger;
pub mod wait;

/// How the engine builds call contexts for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One context per item on input 0, parameters resolved against each item
    PerItem,
    /// One context for the whole invocation, parameters resolved against the first item
    PerBatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPort {
    pub name: String,
    /// A node is skipped when a required port ends up without items
    pub required: bool,
}

impl InputPort {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

/// Static capabilities of a node type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescription {
    pub type_name: String,
    pub display_name: String,
    pub inputs: Vec<InputPort>,
    /// Output port names; the index is the port number
    pub outputs: Vec<String>,
    pub execution_mode: ExecutionMode,
}

impl NodeDescription {
    /// One required input, one output, per-batch
    pub fn new(type_name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            display_name: display_name.into(),
            inputs: vec![InputPort::required("main")],
            outputs: vec!["main".to_string()],
            execution_mode: ExecutionMode::PerBatch,
        }
    }

    /// No inputs: the node can start a run
    pub fn trigger(mut self) -> Self {
        self.inputs.clear();
        self
    }

    pub fn inputs(mut self, inputs: Vec<InputPort>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn per_item(mut self) -> Self {
        self.execution_mode = ExecutionMode::PerItem;
        self
    }

    pub fn is_trigger(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// What a node invocation produced
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// Final output for this invocation
    Complete(NodeOutput),
    /// Output for this iteration; re-invoke the node once its downstream region settles
    Continue(NodeOutput),
    /// Pause the run until an external resume
    Suspend(WaitRequest),
}

impl NodeOutcome {
    pub fn items(items: Vec<crate::data::Item>) -> Self {
        Self::Complete(NodeOutput::single(items))
    }
}

/// Invocation contract every node type implements
#[async_trait]
pub trait NodeType: Send + Sync {
    fn description(&self) -> NodeDescription;

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError>;
}

/// A registered implementation together with its cached description
#[derive(Clone)]
pub struct RegisteredNodeType {
    pub description: NodeDescription,
    pub implementation: Arc<dyn NodeType>,
}

impl std::fmt::Debug for RegisteredNodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredNodeType")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Mapping from type identifier to implementation
#[derive(Debug, Clone, Default)]
pub struct NodeTypeRegistry {
    types: HashMap<String, RegisteredNodeType>,
}

impl NodeTypeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the core logic nodes
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register(trigger::Trigger)
            .register(noop::NoOp)
            .register(filter::Filter)
            .register(if_node::If)
            .register(set::Set)
            .register(summarize::Summarize)
            .register(merge::Merge)
            .register(code::Code)
            .register(wait::Wait)
            .register(execute_workflow::ExecuteWorkflow)
            .register(split_in_batches::SplitInBatches)
            .register(stop_and_error::StopAndError);
        registry
    }

    /// Register (or replace) an implementation under its description's type name
    pub fn register(&mut self, node_type: impl NodeType + 'static) -> &mut Self {
        self.register_arc(Arc::new(node_type))
    }

    pub fn register_arc(&mut self, implementation: Arc<dyn NodeType>) -> &mut Self {
        let description = implementation.description();
        let type_name = description.type_name.clone();
        if self.types.contains_key(&type_name) {
            tracing::warn!("Replacing registered node type: {}", type_name);
        }
        self.types.insert(
            type_name,
            RegisteredNodeType {
                description,
                implementation,
            },
        );
        self
    }

    pub fn get(&self, type_name: &str) -> Option<&RegisteredNodeType> {
        self.types.get(type_name)
    }

    pub fn description(&self, type_name: &str) -> Option<&NodeDescription> {
        self.types.get(type_name).map(|registered| &registered.description)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Registered type names, sorted
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Read a string parameter
pub(crate) fn str_param<'a>(ctx: &'a NodeCallContext, name: &str) -> Result<&'a str, NodeError> {
    ctx.parameter(name)
        .and_then(|value| value.as_str())
        .ok_or_else(|| NodeError::input(format!("node '{}' missing '{}' parameter", ctx.node_name(), name)))
}

pub(crate) fn bool_param(ctx: &NodeCallContext, name: &str, default: bool) -> bool {
    ctx.parameter(name).and_then(|value| value.as_bool()).unwrap_or(default)
}

/// The item a per-item context was built for, paired to its own index
pub(crate) fn current_item(ctx: &NodeCallContext) -> Result<crate::data::Item, NodeError> {
    let index = ctx
        .item_index()
        .ok_or_else(|| NodeError::fatal(format!("node '{}' expects per-item contexts", ctx.node_name())))?;
    ctx.item()
        .map(|item| item.clone().paired_to(index))
        .ok_or_else(|| NodeError::fatal(format!("node '{}' has no item {}", ctx.node_name(), index)))
}

/// Input items re-paired to their own positions
pub(crate) fn passthrough(items: &[crate::data::Item]) -> Vec<crate::data::Item> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| item.clone().paired_to(index))
        .collect()
}

/// Loose truthiness used by condition parameters
pub(crate) fn is_truthy(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

//! Core workflow type definitions
//!
//! Workflows are plain JSON documents: a list of nodes plus a list of
//! connections between node ports. They are immutable once handed to the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A complete workflow definition containing nodes and their connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-grading")
    pub id: String,
    /// Human-readable workflow name
    #[serde(default)]
    pub name: String,
    /// Nodes in declaration order
    pub nodes: Vec<Node>,
    /// Connections in declaration order; this order drives scheduling tie-breaks
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    /// Append a node (builder style)
    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Connect output 0 of `from` to input 0 of `to`
    pub fn connect(self, from: &str, to: &str) -> Self {
        self.connect_ports(from, 0, to, 0)
    }

    pub fn connect_ports(mut self, from: &str, from_output: usize, to: &str, to_input: usize) -> Self {
        self.connections.push(Connection {
            from: from.to_string(),
            from_output,
            to: to.to_string(),
            to_input,
        });
        self
    }

    pub fn error_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.settings.error_workflow = Some(workflow_id.into());
        self
    }

    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name == name)
    }
}

/// Workflow-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Registry id of the workflow to run when this one fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_workflow: Option<String>,
}

/// A single node in the workflow graph
///
/// The node's type selects the implementation in the node type registry;
/// parameters may contain `=`-prefixed expressions resolved at invocation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node name within the workflow (e.g., "Filter Even")
    pub name: String,
    /// Registered node type identifier (e.g., "filter")
    #[serde(rename = "type")]
    pub node_type: String,
    /// Node-specific configuration parameters as flexible JSON
    #[serde(default = "empty_object")]
    pub parameters: Value,
    /// Disabled nodes pass input 0 through to output 0 untouched
    #[serde(default)]
    pub disabled: bool,
    /// Credential type -> opaque credential id, resolved by the credential provider
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, String>,
    #[serde(default)]
    pub settings: NodeSettings,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl Node {
    pub fn new(name: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_type: node_type.into(),
            parameters: empty_object(),
            disabled: false,
            credentials: BTreeMap::new(),
            settings: NodeSettings::default(),
        }
    }

    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn settings(mut self, settings: NodeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn credential(mut self, credential_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.credentials.insert(credential_type.into(), id.into());
        self
    }
}

/// What happens to the run when a node's final attempt fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Abort the run
    #[default]
    StopWorkflow,
    /// Emit error-marked items on output 0
    ContinueRegularOutput,
    /// Route error-marked items to an extra trailing output port
    ContinueErrorOutput,
}

impl OnError {
    pub fn continues(&self) -> bool {
        !matches!(self, Self::StopWorkflow)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// Per-node execution settings: retries, timeouts and failure handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub retry_on_fail: bool,
    /// Total attempts including the first one
    pub max_tries: u32,
    pub wait_between_tries_ms: u64,
    pub backoff: Backoff,
    pub timeout_ms: Option<u64>,
    pub on_error: OnError,
    /// Emit one empty item when a successful invocation produced nothing
    pub always_output_data: bool,
    /// Only process the first item of input 0
    pub execute_once: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            retry_on_fail: false,
            max_tries: 3,
            wait_between_tries_ms: 1000,
            backoff: Backoff::Fixed,
            timeout_ms: None,
            on_error: OnError::StopWorkflow,
            always_output_data: false,
            execute_once: false,
        }
    }
}

impl NodeSettings {
    /// Retry on failure with `max_tries` attempts and no delay between them
    pub fn retrying(max_tries: u32) -> Self {
        Self {
            retry_on_fail: true,
            max_tries,
            wait_between_tries_ms: 0,
            ..Default::default()
        }
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Connection from a node's output port to another node's input port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Source node name
    pub from: String,
    #[serde(default)]
    pub from_output: usize,
    /// Target node name
    pub to: String,
    #[serde(default)]
    pub to_input: usize,
}

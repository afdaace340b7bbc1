//! nodeflow: node-based workflow execution engine
//!
//! Workflows are directed graphs of typed nodes. The engine validates a graph,
//! runs it node by node with items flowing along connections, records every
//! invocation in a per-run data store, and can suspend a run into a resumable
//! token.

// Engine limits and storage settings
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Items and node outputs
pub mod data;

// Workflow definitions, graph compilation, storage and registry
pub mod workflow;

// Parameter expressions (`={{ ... }}`) evaluated in a Lua sandbox
pub mod expression;

// Scheduler, run data store, retry policy and suspension tokens
pub mod runtime;

// Node type contract, registry and the built-in logic nodes
pub mod nodes;

// Credential and binary data seams
pub mod providers;

// Re-export commonly used types for external consumers
pub use config::{Config, EngineConfig};
pub use data::{Item, NodeOutput, PairedItem};
pub use error::{EngineError, ErrorKind, NodeError, ValidationError, ValidationErrors};
pub use nodes::{NodeDescription, NodeOutcome, NodeType, NodeTypeRegistry};
pub use runtime::{
    ExecutionEngine, ExecutionResult, NodeCallContext, ResumePayload, RunId, RunMode, RunOptions, RunReport,
    RunStatus, SuspensionToken,
};
pub use workflow::{Connection, Node, NodeSettings, OnError, Workflow, WorkflowRegistry};

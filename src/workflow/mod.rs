//! Workflow layer: graph model, validation, storage and registry

// Core workflow type definitions
pub mod types;

// Compiled petgraph topology and validation
pub mod graph;

// JSON-directory persistence for workflow definitions
pub mod storage;

// Hot-reload registry using ArcSwap
pub mod registry;

pub use graph::{validate, CompiledWorkflow};
pub use registry::WorkflowRegistry;
pub use storage::WorkflowStorage;
pub use types::{Backoff, Connection, Node, NodeSettings, OnError, Workflow, WorkflowSettings};

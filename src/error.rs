//! Error taxonomy for the execution engine
//!
//! Four kinds of failure exist, and every error the engine reports maps onto
//! exactly one of them:
//! - `Validation`: the workflow is rejected before any node runs
//! - `Input`: an expression or parameter cannot be resolved; never retried
//! - `Operational`: transient failure (network, timeout, rate limit); retriable
//! - `Fatal`: a bug in a node implementation or the engine; aborts the run

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::expression::ExpressionError;
use crate::providers::ProviderError;

/// Serializable classification of a failure, recorded in run data and reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Input,
    Operational,
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::Input => "input",
            Self::Operational => "operational",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// What the retry policy is allowed to do with a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retriable,
    Fatal,
    InputError,
}

/// A single structural problem found while validating a workflow
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("workflow has no nodes")]
    EmptyWorkflow,

    #[error("node at position {index} has an empty name")]
    EmptyNodeName { index: usize },

    #[error("node name '{name}' is used more than once")]
    DuplicateNodeName { name: String },

    #[error("node '{node}' has unknown type '{node_type}'")]
    UnknownNodeType { node: String, node_type: String },

    #[error("connection #{connection} references unknown node '{node}'")]
    UnknownConnectionNode { connection: usize, node: String },

    #[error("connection #{connection} uses output {port} of '{node}', which only has {available}")]
    OutputOutOfRange {
        connection: usize,
        node: String,
        port: usize,
        available: usize,
    },

    #[error("connection #{connection} uses input {port} of '{node}', which only has {available}")]
    InputOutOfRange {
        connection: usize,
        node: String,
        port: usize,
        available: usize,
    },

    #[error("connection #{connection} connects '{node}' to itself")]
    SelfConnection { connection: usize, node: String },

    #[error("connections form a cycle through '{node}'")]
    Cycle { node: String },

    #[error("workflow has no start node (a node without inputs)")]
    NoStartNode,

    #[error("requested start node '{node}' is missing or accepts inputs")]
    InvalidStartNode { node: String },
}

/// All validation problems found in one pass
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("workflow validation failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }
}

/// Misuse of the append-only run data store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("result for '{node}' run {run_index} is already recorded")]
    AlreadyRecorded { node: String, run_index: usize },

    #[error("result for '{node}' run {run_index} recorded out of order (next expected {expected})")]
    OutOfOrder {
        node: String,
        run_index: usize,
        expected: usize,
    },
}

/// Failure raised by a node invocation
#[derive(Debug, Error)]
pub enum NodeError {
    /// Malformed parameters or an unresolvable expression
    #[error("invalid input: {0}")]
    Input(String),

    /// Transient failure that may succeed on retry
    #[error("{0}")]
    Operational(String),

    #[error("node timed out after {0:?}")]
    Timeout(Duration),

    /// Programming error inside a node implementation
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("run was cancelled")]
    Cancelled,

    /// A nested run failed; only its classification and message cross the boundary
    #[error("sub-workflow '{workflow_id}' failed ({kind}): {message}")]
    SubWorkflow {
        workflow_id: String,
        kind: ErrorKind,
        message: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NodeError {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn operational(msg: impl Into<String>) -> Self {
        Self::Operational(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Serializable kind of this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Input(_) => ErrorKind::Input,
            Self::Operational(_) | Self::Timeout(_) | Self::Other(_) => ErrorKind::Operational,
            Self::Fatal(_) | Self::Cancelled => ErrorKind::Fatal,
            Self::SubWorkflow { kind, .. } => *kind,
        }
    }
}

impl From<ExpressionError> for NodeError {
    fn from(err: ExpressionError) -> Self {
        match err {
            ExpressionError::TimedOut { limit, .. } => Self::Timeout(limit),
            other => Self::Input(other.to_string()),
        }
    }
}

impl From<ProviderError> for NodeError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(_) => Self::Input(err.to_string()),
            ProviderError::Unavailable(_) => Self::Operational(err.to_string()),
        }
    }
}

/// Engine-level failure: the run could not be started, resumed or driven
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("workflow '{0}' is not registered")]
    UnknownWorkflow(String),

    #[error("node type '{0}' is not registered")]
    UnknownNodeType(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("suspension token {0} was already consumed")]
    TokenConsumed(Uuid),

    #[error("invalid resume payload: {0}")]
    InvalidResumePayload(String),

    #[error("workflow nesting depth {0} exceeds the configured maximum")]
    DepthExceeded(usize),

    #[error("illegal run status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("loop node '{node}' exceeded {limit} iterations")]
    LoopLimit { node: String, limit: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::UnknownWorkflow(_) | Self::InvalidResumePayload(_) => ErrorKind::Input,
            _ => ErrorKind::Fatal,
        }
    }
}

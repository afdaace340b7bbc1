//! Runtime Execution Engine
//!
//! This module drives workflow runs:
//! - Readiness, fan-in joins and empty-branch skipping (`state`)
//! - Append-only per-run result storage (`store`)
//! - Per-item / per-batch context building (`context`)
//! - Retries, timeouts and continue-on-fail (`policy`)
//! - Suspension tokens and resume payloads (`token`)

// Scheduler loop: start, resume, cancel
pub mod engine;

// Run identity and status state machine
pub mod run;

// Scheduler bookkeeping carried inside suspension tokens
pub mod state;

// Run data store
pub mod store;

// Execution context builder handed to node implementations
pub mod context;

// Error & retry policy
pub mod policy;

// Suspension tokens
pub mod token;

// Re-export main types
pub use context::{NodeCallContext, ParentRun, SubWorkflowRunner};
pub use engine::{EngineBuilder, ExecutionEngine};
pub use run::{ErrorWorkflowRun, ExecutionResult, RunError, RunId, RunMode, RunOptions, RunReport, RunStatus};
pub use store::{NodeRunResult, RunDataSnapshot, SourceRef};
pub use token::{ResumePayload, SuspendedNode, SuspensionToken, WaitRequest};

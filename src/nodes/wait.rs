//! Suspends the run until a time or an external resume
//!
//! Expected params (one of):
//! - `{ "resume_at": "2026-01-01T09:00:00Z" }`
//! - `{ "amount_ms": 60000 }`
//! - `{ "key": "approval-42" }` (external event, the key is optional)
//!
//! On resume the payload becomes the node's output; an empty payload passes
//! the input through.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use super::{NodeDescription, NodeOutcome, NodeType};
use crate::error::NodeError;
use crate::runtime::context::NodeCallContext;
use crate::runtime::token::WaitRequest;

pub struct Wait;

#[async_trait]
impl NodeType for Wait {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("wait", "Wait")
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        let wait = if let Some(at) = ctx.parameter("resume_at").and_then(Value::as_str) {
            let resume_at = DateTime::parse_from_rfc3339(at)
                .map_err(|e| NodeError::input(format!("invalid 'resume_at' '{}': {}", at, e)))?
                .with_timezone(&Utc);
            WaitRequest::Until { resume_at }
        } else if let Some(amount) = ctx.parameter("amount_ms") {
            WaitRequest::Until {
                resume_at: resume_after(amount)?,
            }
        } else {
            WaitRequest::External {
                key: ctx.parameter("key").and_then(Value::as_str).map(str::to_string),
            }
        };

        tracing::debug!("⏳ Node '{}' waiting: {:?}", ctx.node_name(), wait);
        Ok(NodeOutcome::Suspend(wait))
    }
}

/// `now + amount_ms`, rejecting amounts that are not integers or overflow the calendar
fn resume_after(amount: &Value) -> Result<DateTime<Utc>, NodeError> {
    let out_of_range = || NodeError::input(format!("'amount_ms' {} is out of range", amount));
    let millis = amount
        .as_i64()
        .ok_or_else(|| NodeError::input(format!("'amount_ms' must be an integer, got {}", amount)))?;
    let delay = Duration::try_milliseconds(millis).ok_or_else(out_of_range)?;
    Utc::now().checked_add_signed(delay).ok_or_else(out_of_range)
}

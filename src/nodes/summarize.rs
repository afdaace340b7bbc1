//! Aggregates one field over all input items into a single item
//!
//! Expected params: `{ "field": "amount", "operation": "sum", "output_field": "total" }`.
//! `output_field` defaults to the operation name. Sums of integers stay integers.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{str_param, NodeDescription, NodeOutcome, NodeType};
use crate::data::{Item, PairedItem};
use crate::error::NodeError;
use crate::runtime::context::NodeCallContext;

pub struct Summarize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Sum,
    Count,
    Min,
    Max,
    Average,
}

impl Operation {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "sum" => Some(Self::Sum),
            "count" => Some(Self::Count),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "average" => Some(Self::Average),
            _ => None,
        }
    }
}

#[async_trait]
impl NodeType for Summarize {
    fn description(&self) -> NodeDescription {
        NodeDescription::new("summarize", "Summarize")
    }

    async fn execute(&self, ctx: &NodeCallContext) -> Result<NodeOutcome, NodeError> {
        let operation_name = ctx.parameter("operation").and_then(Value::as_str).unwrap_or("sum");
        let operation = Operation::parse(operation_name)
            .ok_or_else(|| NodeError::input(format!("unknown summarize operation '{}'", operation_name)))?;
        let output_field = ctx
            .parameter("output_field")
            .and_then(Value::as_str)
            .unwrap_or(operation_name);

        let items = ctx.items();
        let result = if operation == Operation::Count && ctx.parameter("field").is_none() {
            json!(items.len())
        } else {
            let field = str_param(ctx, "field")?;
            let values: Vec<&Value> = items
                .iter()
                .filter_map(|item| item.get(field))
                .filter(|value| !value.is_null())
                .collect();
            aggregate(operation, field, &values)?
        };

        tracing::debug!("📊 Summarize '{}': {} over {} items", ctx.node_name(), operation_name, items.len());
        let mut summary = Item::new(json!({ output_field: result }));
        summary.paired_item = (0..items.len()).map(PairedItem::new).collect();
        Ok(NodeOutcome::items(vec![summary]))
    }
}

fn aggregate(operation: Operation, field: &str, values: &[&Value]) -> Result<Value, NodeError> {
    if operation == Operation::Count {
        return Ok(json!(values.len()));
    }

    let numbers = values
        .iter()
        .map(|value| {
            value
                .as_f64()
                .ok_or_else(|| NodeError::input(format!("field '{}' holds non-numeric value {}", field, value)))
        })
        .collect::<Result<Vec<f64>, _>>()?;
    let integers: Option<Vec<i64>> = values.iter().map(|value| value.as_i64()).collect();

    let result = match operation {
        Operation::Sum => match integers.and_then(|ints| ints.into_iter().try_fold(0i64, i64::checked_add)) {
            Some(total) => json!(total),
            None => json!(numbers.iter().sum::<f64>()),
        },
        Operation::Min | Operation::Max if numbers.is_empty() => Value::Null,
        Operation::Min => extreme(values, &numbers, |a, b| a < b),
        Operation::Max => extreme(values, &numbers, |a, b| a > b),
        Operation::Average if numbers.is_empty() => Value::Null,
        Operation::Average => json!(numbers.iter().sum::<f64>() / numbers.len() as f64),
        Operation::Count => json!(values.len()),
    };
    Ok(result)
}

/// The original value whose number wins under `better`, so integers stay integers
fn extreme(values: &[&Value], numbers: &[f64], better: impl Fn(f64, f64) -> bool) -> Value {
    let mut best = 0;
    for (index, number) in numbers.iter().enumerate() {
        if better(*number, numbers[best]) {
            best = index;
        }
    }
    values[best].clone()
}

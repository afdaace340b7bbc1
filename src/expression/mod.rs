//! Expression Resolver
//!
//! A parameter string starting with `=` is an expression. `={{ expr }}` yields
//! the expression's typed value; any other text mixes literal parts with
//! `{{ expr }}` segments and yields a string.
//!
//! Plain references (`$json.a.b`, `$node["X"].json.c`, `$("X").first().json`)
//! are selected natively with JSONPath. Everything else runs as a Lua
//! expression in a fresh sandbox (see [`lua`]).
//!
//! Resolution is pure: it reads the current item, the invocation's inputs and
//! the recorded run history, and never writes anywhere.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::data::Item;
use crate::runtime::store::{locate_source, RunHistory, SourceRef};

pub mod lua;
mod path;

use path::{PathRef, Root, Section};

/// Default Lua sandbox memory cap
pub const DEFAULT_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

/// Default wall-clock budget for one Lua expression
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(2);

/// Upper bound on provenance hops when resolving a paired item
const MAX_PAIRING_HOPS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("syntax error in expression '{expression}': {message}")]
    Syntax { expression: String, message: String },

    #[error("node '{0}' has not produced output")]
    NodeNotExecuted(String),

    #[error("expression '{expression}' failed: {message}")]
    Evaluation { expression: String, message: String },

    #[error("expression '{expression}' ran longer than {limit:?}")]
    TimedOut { expression: String, limit: Duration },
}

impl ExpressionError {
    pub(crate) fn with_expression(self, expr: &str) -> Self {
        match self {
            Self::Evaluation { expression, message } if expression.is_empty() => Self::Evaluation {
                expression: expr.to_string(),
                message,
            },
            other => other,
        }
    }
}

/// Run-level values visible to expressions as `$execution` and `$workflow`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub id: String,
    pub mode: String,
    pub workflow_id: String,
    pub workflow_name: String,
    /// The run's initial input items
    pub input: Vec<Item>,
}

/// Everything an expression can see for one item of one invocation
#[derive(Debug, Clone, Copy)]
pub struct ExpressionScope<'a> {
    /// Current item; `None` when the invocation has no input items
    pub item: Option<&'a Item>,
    pub item_index: usize,
    pub run_index: usize,
    /// Items on input 0 of the invocation
    pub inputs: &'a [Item],
    /// Source segments per input port of the invocation
    pub source: &'a [Vec<SourceRef>],
    pub history: &'a RunHistory,
    pub execution: &'a ExecutionInfo,
}

impl<'a> ExpressionScope<'a> {
    /// Scope with no current item
    pub fn new(history: &'a RunHistory, execution: &'a ExecutionInfo) -> Self {
        Self {
            item: None,
            item_index: 0,
            run_index: 0,
            inputs: &[],
            source: &[],
            history,
            execution,
        }
    }

    /// Point the scope at `inputs[index]`
    pub fn with_item(mut self, inputs: &'a [Item], index: usize) -> Self {
        self.inputs = inputs;
        self.item = inputs.get(index);
        self.item_index = index;
        self
    }

    pub fn with_source(mut self, source: &'a [Vec<SourceRef>]) -> Self {
        self.source = source;
        self
    }

    pub fn with_run_index(mut self, run_index: usize) -> Self {
        self.run_index = run_index;
        self
    }

    pub fn has_output(&self, node: &str) -> bool {
        self.history.get(node).is_some_and(|runs| !runs.is_empty())
    }

    /// Items of the node's latest invocation (first port that received any)
    pub fn node_items(&self, node: &str) -> &'a [Item] {
        self.history
            .get(node)
            .and_then(|runs| runs.last())
            .map(|result| result.output.first_non_empty())
            .unwrap_or(&[])
    }

    /// The item of `node` the current item derives from
    ///
    /// Walks the source segments and `paired_item` links backwards. Falls back
    /// to the first item of the node's latest output when the chain breaks.
    pub fn paired_item(&self, node: &str) -> Result<Option<&'a Item>, ExpressionError> {
        if !self.has_output(node) {
            return Err(ExpressionError::NodeNotExecuted(node.to_string()));
        }
        let fallback = self.node_items(node).first();
        if self.item.is_none() {
            return Ok(fallback);
        }

        let mut source = self.source;
        let mut input = 0;
        let mut index = self.item_index;
        for _ in 0..MAX_PAIRING_HOPS {
            let Some((segment, local)) = locate_source(source, input, index) else {
                break;
            };
            let Some(record) = self
                .history
                .get(&segment.node)
                .and_then(|runs| runs.get(segment.run_index))
            else {
                break;
            };
            let Some(produced) = record.output.port(segment.output).get(local) else {
                break;
            };
            if segment.node == node {
                return Ok(Some(produced));
            }
            let Some(pair) = produced.paired_item.first() else {
                break;
            };
            source = &record.source;
            input = pair.input;
            index = pair.item;
        }
        Ok(fallback)
    }

    fn select(&self, reference: &PathRef) -> Result<Value, ExpressionError> {
        let base = match &reference.root {
            Root::Item => self.item,
            Root::InputFirst => self.inputs.first(),
            Root::InputLast => self.inputs.last(),
            Root::NodePaired(node) => self.paired_item(node)?,
            Root::NodeFirst(node) => self.node_items(node).first(),
            Root::NodeLast(node) => self.node_items(node).last(),
        };
        let Some(item) = base else {
            return Ok(Value::Null);
        };
        let section = match reference.section {
            Section::Json => Value::Object(item.json.clone()),
            Section::Binary => serde_json::to_value(&item.binary).map_err(|e| ExpressionError::Evaluation {
                expression: reference.json_path.clone(),
                message: e.to_string(),
            })?,
        };
        path::select(&section, &reference.json_path)
    }
}

/// Node names referenced as `$("Name")` or `$node["Name"]`
pub fn referenced_nodes(expr: &str) -> Vec<String> {
    let mut names = Vec::new();
    for prefix in ["$(", "$node["] {
        let mut rest = expr;
        while let Some(start) = rest.find(prefix) {
            rest = &rest[start + prefix.len()..];
            let Some(quote) = rest.chars().next().filter(|c| *c == '"' || *c == '\'') else {
                continue;
            };
            if let Some(end) = rest[1..].find(quote) {
                let name = rest[1..1 + end].to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
                rest = &rest[1 + end..];
            }
        }
    }
    names
}

pub fn is_expression(value: &Value) -> bool {
    matches!(value, Value::String(text) if text.starts_with('='))
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Resolves expression strings and parameter bags
#[derive(Debug, Clone, Copy)]
pub struct ExpressionResolver {
    memory_limit: usize,
    time_limit: Duration,
}

impl Default for ExpressionResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_LIMIT)
    }
}

impl ExpressionResolver {
    pub fn new(memory_limit: usize) -> Self {
        Self {
            memory_limit,
            time_limit: DEFAULT_TIME_LIMIT,
        }
    }

    /// Wall-clock budget for each Lua evaluation
    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    /// Evaluate a single expression body (the text between `{{` and `}}`)
    pub fn evaluate(&self, expr: &str, scope: &ExpressionScope<'_>) -> Result<Value, ExpressionError> {
        let referenced = referenced_nodes(expr);
        if let Some(missing) = referenced.iter().find(|name| !scope.has_output(name)) {
            return Err(ExpressionError::NodeNotExecuted(missing.clone()));
        }

        if let Some(reference) = path::parse(expr) {
            tracing::trace!("Resolving '{}' natively as {}", expr, reference.json_path);
            return scope.select(&reference);
        }
        lua::evaluate(expr, scope, &referenced, self.memory_limit, self.time_limit)
    }

    /// Resolve a parameter string; text without a leading `=` is returned as-is
    pub fn resolve(&self, text: &str, scope: &ExpressionScope<'_>) -> Result<Value, ExpressionError> {
        let Some(body) = text.strip_prefix('=') else {
            return Ok(Value::String(text.to_string()));
        };

        let mut literal = Vec::new();
        let mut values = Vec::new();
        let mut rest = body;
        while let Some(open) = rest.find("{{") {
            let after = &rest[open + 2..];
            let close = after.find("}}").ok_or_else(|| ExpressionError::Syntax {
                expression: text.to_string(),
                message: "unterminated '{{'".to_string(),
            })?;
            literal.push(&rest[..open]);
            values.push(self.evaluate(after[..close].trim(), scope)?);
            rest = &after[close + 2..];
        }

        if values.is_empty() {
            return Ok(Value::String(body.to_string()));
        }
        if values.len() == 1 && literal[0].trim().is_empty() && rest.trim().is_empty() {
            return Ok(values.remove(0));
        }

        let mut out = String::new();
        for (text, value) in literal.iter().zip(&values) {
            out.push_str(text);
            out.push_str(&render(value));
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }

    /// Resolve every expression string inside a parameter bag
    pub fn resolve_parameters(&self, parameters: &Value, scope: &ExpressionScope<'_>) -> Result<Value, ExpressionError> {
        match parameters {
            Value::String(text) if text.starts_with('=') => self.resolve(text, scope),
            Value::Array(values) => values
                .iter()
                .map(|value| self.resolve_parameters(value, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    resolved.insert(key.clone(), self.resolve_parameters(value, scope)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }
}

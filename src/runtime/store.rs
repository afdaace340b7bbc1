//! Run Data Store: append-only record of every node invocation
//!
//! Results are keyed by node name and invocation index. Writes go through an
//! internal lock so sibling invocations can record concurrently; an attempt to
//! overwrite or skip an index is a programming error and is rejected.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::data::{ErrorRecord, Item, NodeOutput};
use crate::error::StoreError;

/// One contiguous slice of an input port's items and where it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub node: String,
    pub output: usize,
    pub run_index: usize,
    /// Number of items this source contributed to the port
    pub items: usize,
}

/// Final outcome of one node invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRunResult {
    /// Per input port, the sources its items were concatenated from
    #[serde(default)]
    pub source: Vec<Vec<SourceRef>>,
    pub output: NodeOutput,
    /// Set when the invocation failed (with or without continue-on-fail)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl NodeRunResult {
    pub fn success(source: Vec<Vec<SourceRef>>, output: NodeOutput) -> Self {
        Self {
            source,
            output,
            error: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Map an item on `input` port back to its source slice and local index
    pub fn locate_input(&self, input: usize, item: usize) -> Option<(&SourceRef, usize)> {
        locate_source(&self.source, input, item)
    }
}

/// Find which source segment of `input` holds `item`, and the item's index within it
pub fn locate_source(source: &[Vec<SourceRef>], input: usize, item: usize) -> Option<(&SourceRef, usize)> {
    let mut offset = 0;
    for segment in source.get(input)? {
        if item < offset + segment.items {
            return Some((segment, item - offset));
        }
        offset += segment.items;
    }
    None
}

/// Recorded results keyed by node name; the vector index is the invocation index
pub type RunHistory = BTreeMap<String, Vec<NodeRunResult>>;

/// Deep, self-contained copy of a store's contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunDataSnapshot(pub RunHistory);

impl RunDataSnapshot {
    pub fn get(&self, node: &str, run_index: usize) -> Option<&NodeRunResult> {
        self.0.get(node).and_then(|runs| runs.get(run_index))
    }

    pub fn run_count(&self, node: &str) -> usize {
        self.0.get(node).map(Vec::len).unwrap_or(0)
    }

    pub fn latest(&self, node: &str) -> Option<&NodeRunResult> {
        self.0.get(node).and_then(|runs| runs.last())
    }

    /// Items on output 0 of the node's latest run
    pub fn output_items(&self, node: &str) -> Vec<Item> {
        self.latest(node)
            .map(|result| result.output.port(0).to_vec())
            .unwrap_or_default()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.run_count(node) > 0
    }

    pub fn node_names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

/// Append-only working set of one run
#[derive(Debug, Default)]
pub struct RunDataStore {
    runs: RwLock<RunHistory>,
}

impl RunDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a snapshot; the snapshot is moved, not shared
    pub fn restore(snapshot: RunDataSnapshot) -> Self {
        Self {
            runs: RwLock::new(snapshot.0),
        }
    }

    /// Append the result for `(node, run_index)`; indices must be contiguous
    pub fn record(&self, node: &str, run_index: usize, result: NodeRunResult) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let entries = runs.entry(node.to_string()).or_default();
        let expected = entries.len();

        if run_index < expected {
            return Err(StoreError::AlreadyRecorded {
                node: node.to_string(),
                run_index,
            });
        }
        if run_index > expected {
            return Err(StoreError::OutOfOrder {
                node: node.to_string(),
                run_index,
                expected,
            });
        }

        entries.push(result);
        Ok(())
    }

    pub fn get(&self, node: &str, run_index: usize) -> Option<NodeRunResult> {
        self.runs.read().get(node).and_then(|runs| runs.get(run_index)).cloned()
    }

    /// Number of recorded invocations, which is also the next invocation index
    pub fn run_count(&self, node: &str) -> usize {
        self.runs.read().get(node).map(Vec::len).unwrap_or(0)
    }

    /// Read access without cloning
    pub fn with_runs<R>(&self, f: impl FnOnce(&RunHistory) -> R) -> R {
        f(&self.runs.read())
    }

    pub fn snapshot(&self) -> RunDataSnapshot {
        RunDataSnapshot(self.runs.read().clone())
    }
}

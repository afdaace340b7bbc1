//! Scheduler bookkeeping: connection settlement, readiness and loop frames
//!
//! Each connection is `Pending` until its source node settles, then either
//! `Delivered` (the source emitted items on that port) or `Empty`. A node is
//! considered once every incoming connection is settled; it runs when every
//! required input port has items and at least one port has items, otherwise it
//! is skipped and its own outgoing connections settle `Empty`.
//!
//! The state is plain data so it can travel inside a suspension token.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::data::{Item, NodeOutput};
use crate::error::EngineError;
use crate::runtime::store::{RunHistory, SourceRef};
use crate::workflow::CompiledWorkflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Pending,
    /// Source emitted `items` items on this port in invocation `run_index`
    Delivered { run_index: usize, items: usize },
    Empty,
}

impl ConnectionState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    fn items(&self) -> usize {
        match self {
            Self::Delivered { items, .. } => *items,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Unsettled,
    Executed,
    Skipped,
}

/// An open controlled iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopFrame {
    pub node: usize,
    /// Positions downstream of the loop node, reset on every rewind
    pub body: BTreeSet<usize>,
    /// Completed iterations so far
    pub iteration: usize,
}

/// Items and provenance gathered for one invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInputs {
    /// One item list per declared input port
    pub items: Vec<Vec<Item>>,
    pub source: Vec<Vec<SourceRef>>,
}

impl NodeInputs {
    pub fn port(&self, index: usize) -> &[Item] {
        self.items.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn item_count(&self) -> usize {
        self.items.iter().map(Vec::len).sum()
    }

    /// Keep only the first item of input 0 (`execute_once`)
    pub fn keep_first_item(&mut self) {
        let Some(port) = self.items.get_mut(0) else {
            return;
        };
        port.truncate(1);
        let kept = port.len();
        if let Some(source) = self.source.get_mut(0) {
            source.truncate(kept);
            if let Some(first) = source.first_mut() {
                first.items = kept;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub start: usize,
    pub connections: Vec<ConnectionState>,
    pub nodes: Vec<NodeState>,
    pub loops: Vec<LoopFrame>,
    pub last_node_executed: Option<usize>,
}

impl RunState {
    /// Fresh state; nodes unreachable from `start` are skipped up front
    pub fn new(compiled: &CompiledWorkflow, start: usize) -> Self {
        let mut state = Self {
            start,
            connections: vec![ConnectionState::Pending; compiled.connection_count()],
            nodes: vec![NodeState::Unsettled; compiled.node_count()],
            loops: Vec::new(),
            last_node_executed: None,
        };

        let reachable = compiled.reachable_from(start);
        for position in 0..compiled.node_count() {
            if !reachable.contains(&position) {
                state.skip(compiled, position);
            }
        }
        state
    }

    pub fn node_state(&self, position: usize) -> NodeState {
        self.nodes[position]
    }

    fn skip(&mut self, compiled: &CompiledWorkflow, position: usize) {
        self.nodes[position] = NodeState::Skipped;
        for &connection in compiled.outgoing(position) {
            self.connections[connection] = ConnectionState::Empty;
        }
    }

    /// Whether the node may be considered: unsettled, with every incoming connection settled
    fn is_decidable(&self, compiled: &CompiledWorkflow, position: usize) -> bool {
        self.nodes[position] == NodeState::Unsettled
            && compiled
                .incoming(position)
                .iter()
                .all(|&connection| self.connections[connection].is_settled())
    }

    /// Whether a decidable node should run (as opposed to being skipped)
    fn should_run(&self, compiled: &CompiledWorkflow, position: usize) -> bool {
        if position == self.start {
            return true;
        }
        let ports = &compiled.description(position).inputs;
        let mut per_port = vec![0usize; ports.len()];
        for &connection in compiled.incoming(position) {
            let port = compiled.connection(connection).to_input;
            if let Some(count) = per_port.get_mut(port) {
                *count += self.connections[connection].items();
            }
        }
        let required_met = ports
            .iter()
            .zip(&per_port)
            .all(|(port, count)| !port.required || *count > 0);
        required_met && per_port.iter().any(|count| *count > 0)
    }

    /// Skip every decidable node that cannot run, cascading; returns skipped positions
    pub fn settle_skips(&mut self, compiled: &CompiledWorkflow) -> Vec<usize> {
        let mut skipped = Vec::new();
        loop {
            let next = compiled
                .topological_order()
                .into_iter()
                .find(|&pos| self.is_decidable(compiled, pos) && !self.should_run(compiled, pos));
            match next {
                Some(position) => {
                    self.skip(compiled, position);
                    skipped.push(position);
                }
                None => return skipped,
            }
        }
    }

    /// Nodes ready to run, in tie-break order
    ///
    /// The start node comes first; other nodes are ordered by the declaration
    /// index of their earliest incoming connection, then by node position.
    pub fn ready(&self, compiled: &CompiledWorkflow) -> Vec<usize> {
        let mut ready: Vec<(Option<usize>, usize)> = (0..compiled.node_count())
            .filter(|&pos| self.is_decidable(compiled, pos) && self.should_run(compiled, pos))
            .map(|pos| {
                let key = if pos == self.start {
                    None
                } else {
                    compiled.incoming(pos).iter().min().copied()
                };
                (key, pos)
            })
            .collect();
        ready.sort();
        ready.into_iter().map(|(_, pos)| pos).collect()
    }

    /// Record a settled invocation and deliver its output downstream
    pub fn complete(&mut self, compiled: &CompiledWorkflow, position: usize, run_index: usize, output: &NodeOutput) {
        self.nodes[position] = NodeState::Executed;
        self.last_node_executed = Some(position);
        for &connection in compiled.outgoing(position) {
            let items = output.port(compiled.connection(connection).from_output).len();
            self.connections[connection] = if items > 0 {
                ConnectionState::Delivered { run_index, items }
            } else {
                ConnectionState::Empty
            };
        }
        if let Some(index) = self.loops.iter().position(|frame| frame.node == position) {
            self.loops.remove(index);
        }
    }

    /// Record one iteration of a looping node and open (or keep) its frame
    pub fn complete_iteration(
        &mut self,
        compiled: &CompiledWorkflow,
        position: usize,
        run_index: usize,
        output: &NodeOutput,
    ) {
        let frame = self.loops.iter().position(|frame| frame.node == position);
        let frame = frame.map(|index| self.loops.remove(index));
        self.complete(compiled, position, run_index, output);
        self.loops.push(frame.unwrap_or_else(|| LoopFrame {
            node: position,
            body: compiled.reachable_through_ports(position, &(0..compiled.output_count(position)).collect::<Vec<_>>()),
            iteration: 0,
        }));
    }

    /// Current iteration of a looping node (0 when no frame is open)
    pub fn iteration(&self, position: usize) -> usize {
        self.loops
            .iter()
            .find(|frame| frame.node == position)
            .map(|frame| frame.iteration)
            .unwrap_or(0)
    }

    /// Reset the innermost loop's region so its node runs again
    ///
    /// Returns the loop node position, or `None` when no loop is open.
    pub fn rewind(&mut self, compiled: &CompiledWorkflow, max_iterations: usize) -> Result<Option<usize>, EngineError> {
        let Some(frame) = self.loops.last_mut() else {
            return Ok(None);
        };
        frame.iteration += 1;
        if frame.iteration >= max_iterations {
            return Err(EngineError::LoopLimit {
                node: compiled.name(frame.node).to_string(),
                limit: max_iterations,
            });
        }

        let node = frame.node;
        let body = frame.body.clone();
        for &position in &body {
            self.nodes[position] = NodeState::Unsettled;
        }
        self.nodes[node] = NodeState::Unsettled;
        for connection in 0..compiled.connection_count() {
            let source = compiled.source_of(connection);
            if source == node || body.contains(&source) {
                self.connections[connection] = ConnectionState::Pending;
            }
        }
        Ok(Some(node))
    }

    /// Nodes skipped so far, by position
    pub fn skipped(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&pos| self.nodes[pos] == NodeState::Skipped)
            .collect()
    }

    /// Collect a node's input items per port, concatenated in connection order
    pub fn gather_inputs(&self, compiled: &CompiledWorkflow, history: &RunHistory, position: usize) -> NodeInputs {
        let port_count = compiled.description(position).inputs.len();
        let mut inputs = NodeInputs {
            items: vec![Vec::new(); port_count],
            source: vec![Vec::new(); port_count],
        };

        for &connection in compiled.incoming(position) {
            let ConnectionState::Delivered { run_index, .. } = self.connections[connection] else {
                continue;
            };
            let conn = compiled.connection(connection);
            let Some(result) = history.get(&conn.from).and_then(|runs| runs.get(run_index)) else {
                continue;
            };
            let items = result.output.port(conn.from_output);
            if items.is_empty() || conn.to_input >= port_count {
                continue;
            }
            inputs.items[conn.to_input].extend(items.iter().cloned());
            inputs.source[conn.to_input].push(SourceRef {
                node: conn.from.clone(),
                output: conn.from_output,
                run_index,
                items: items.len(),
            });
        }
        inputs
    }
}

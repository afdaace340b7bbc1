//! Compiled workflow topology and validation
//!
//! Converts a workflow definition into a petgraph DAG with per-node port
//! metadata from the node type registry. Invalid workflows are rejected here,
//! before any node runs.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::{ValidationError, ValidationErrors};
use crate::nodes::{NodeDescription, NodeTypeRegistry};
use crate::workflow::types::{Connection, Node, OnError, Workflow};

/// Execution-ready view of a validated workflow
///
/// Node positions (declaration indices) are the identity used everywhere in the
/// runtime; names are only used at the API and storage boundaries.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub workflow: Arc<Workflow>,
    /// Node weight: node position; edge weight: connection index
    graph: DiGraph<usize, usize>,
    node_indices: Vec<NodeIndex>,
    positions: HashMap<String, usize>,
    descriptions: Vec<NodeDescription>,
    /// Incoming / outgoing connection indices per node, in declaration order
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
}

/// Check a workflow against the registry without keeping the compiled form
pub fn validate(workflow: &Workflow, registry: &NodeTypeRegistry) -> Result<(), ValidationErrors> {
    CompiledWorkflow::compile(Arc::new(workflow.clone()), registry).map(|_| ())
}

impl CompiledWorkflow {
    /// Validate and compile; every problem found is reported, not just the first
    pub fn compile(workflow: Arc<Workflow>, registry: &NodeTypeRegistry) -> Result<Self, ValidationErrors> {
        tracing::debug!(
            "Building workflow graph for '{}' with {} nodes and {} connections",
            workflow.id,
            workflow.nodes.len(),
            workflow.connections.len()
        );

        let mut errors = Vec::new();
        if workflow.nodes.is_empty() {
            errors.push(ValidationError::EmptyWorkflow);
        }

        let mut positions = HashMap::new();
        let mut seen = HashSet::new();
        for (index, node) in workflow.nodes.iter().enumerate() {
            if node.name.trim().is_empty() {
                errors.push(ValidationError::EmptyNodeName { index });
                continue;
            }
            if !seen.insert(node.name.clone()) {
                errors.push(ValidationError::DuplicateNodeName {
                    name: node.name.clone(),
                });
                continue;
            }
            positions.insert(node.name.clone(), index);
        }

        let mut descriptions = Vec::with_capacity(workflow.nodes.len());
        for node in &workflow.nodes {
            match registry.description(&node.node_type) {
                Some(description) => descriptions.push(description.clone()),
                None => {
                    errors.push(ValidationError::UnknownNodeType {
                        node: node.name.clone(),
                        node_type: node.node_type.clone(),
                    });
                    // Placeholder so positions stay aligned; ports are not checked
                    descriptions.push(NodeDescription::new(node.node_type.clone(), node.name.clone()));
                }
            }
        }

        let mut graph = DiGraph::new();
        let node_indices: Vec<NodeIndex> = (0..workflow.nodes.len()).map(|pos| graph.add_node(pos)).collect();
        let mut incoming = vec![Vec::new(); workflow.nodes.len()];
        let mut outgoing = vec![Vec::new(); workflow.nodes.len()];

        for (index, connection) in workflow.connections.iter().enumerate() {
            let from = positions.get(&connection.from).copied();
            let to = positions.get(&connection.to).copied();
            let (from, to) = match (from, to) {
                (Some(from), Some(to)) => (from, to),
                (from, _) => {
                    let missing = if from.is_none() { &connection.from } else { &connection.to };
                    errors.push(ValidationError::UnknownConnectionNode {
                        connection: index,
                        node: missing.clone(),
                    });
                    continue;
                }
            };

            if from == to {
                errors.push(ValidationError::SelfConnection {
                    connection: index,
                    node: connection.from.clone(),
                });
                continue;
            }

            let known_types = registry.contains(&workflow.nodes[from].node_type)
                && registry.contains(&workflow.nodes[to].node_type);
            if known_types {
                let available = output_count(&workflow.nodes[from], &descriptions[from]);
                if connection.from_output >= available {
                    errors.push(ValidationError::OutputOutOfRange {
                        connection: index,
                        node: connection.from.clone(),
                        port: connection.from_output,
                        available,
                    });
                }
                let available = descriptions[to].inputs.len();
                if connection.to_input >= available {
                    errors.push(ValidationError::InputOutOfRange {
                        connection: index,
                        node: connection.to.clone(),
                        port: connection.to_input,
                        available,
                    });
                }
            }

            graph.add_edge(node_indices[from], node_indices[to], index);
            incoming[to].push(index);
            outgoing[from].push(index);
        }

        if let Err(cycle) = toposort(&graph, None) {
            let position = graph[cycle.node_id()];
            errors.push(ValidationError::Cycle {
                node: workflow.nodes[position].name.clone(),
            });
        }

        if !workflow.nodes.is_empty() && !descriptions.iter().any(NodeDescription::is_trigger) {
            errors.push(ValidationError::NoStartNode);
        }

        if !errors.is_empty() {
            tracing::warn!("Workflow '{}' failed validation with {} errors", workflow.id, errors.len());
            return Err(ValidationErrors(errors));
        }

        tracing::debug!("DAG validation successful for '{}'", workflow.id);
        Ok(Self {
            workflow,
            graph,
            node_indices,
            positions,
            descriptions,
            incoming,
            outgoing,
        })
    }

    pub fn id(&self) -> &str {
        &self.workflow.id
    }

    pub fn node_count(&self) -> usize {
        self.workflow.nodes.len()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn node(&self, position: usize) -> &Node {
        &self.workflow.nodes[position]
    }

    pub fn name(&self, position: usize) -> &str {
        &self.workflow.nodes[position].name
    }

    pub fn description(&self, position: usize) -> &NodeDescription {
        &self.descriptions[position]
    }

    pub fn connection(&self, index: usize) -> &Connection {
        &self.workflow.connections[index]
    }

    pub fn connection_count(&self) -> usize {
        self.workflow.connections.len()
    }

    pub fn incoming(&self, position: usize) -> &[usize] {
        &self.incoming[position]
    }

    pub fn outgoing(&self, position: usize) -> &[usize] {
        &self.outgoing[position]
    }

    /// Source position of a connection
    pub fn source_of(&self, connection: usize) -> usize {
        self.positions[&self.workflow.connections[connection].from]
    }

    /// Target position of a connection
    pub fn target_of(&self, connection: usize) -> usize {
        self.positions[&self.workflow.connections[connection].to]
    }

    /// Number of output ports including the error output when enabled
    pub fn output_count(&self, position: usize) -> usize {
        output_count(self.node(position), self.description(position))
    }

    /// Nodes that accept no inputs, in declaration order
    pub fn start_nodes(&self) -> Vec<usize> {
        (0..self.node_count())
            .filter(|&pos| self.descriptions[pos].is_trigger())
            .collect()
    }

    /// Deterministic topological order: Kahn's algorithm, lowest position first
    pub fn topological_order(&self) -> Vec<usize> {
        let mut indegree: Vec<usize> = self.incoming.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.node_count()).filter(|&pos| indegree[pos] == 0).collect();
        let mut order = Vec::with_capacity(self.node_count());

        while let Some(position) = ready.pop_first() {
            order.push(position);
            for &connection in &self.outgoing[position] {
                let target = self.target_of(connection);
                indegree[target] -= 1;
                if indegree[target] == 0 {
                    ready.insert(target);
                }
            }
        }
        order
    }

    /// All nodes reachable from `start` (inclusive) along any connection
    pub fn reachable_from(&self, start: usize) -> BTreeSet<usize> {
        let mut reachable = BTreeSet::new();
        let mut queue = VecDeque::new();
        reachable.insert(start);
        queue.push_back(self.node_indices[start]);

        while let Some(current) = queue.pop_front() {
            for target in self.graph.neighbors(current) {
                if reachable.insert(self.graph[target]) {
                    queue.push_back(target);
                }
            }
        }
        reachable
    }

    /// Nodes reachable through the given output ports of `source` (exclusive of `source`)
    pub fn reachable_through_ports(&self, source: usize, ports: &[usize]) -> BTreeSet<usize> {
        let mut region = BTreeSet::new();
        for &connection in &self.outgoing[source] {
            if ports.contains(&self.connection(connection).from_output) {
                region.extend(self.reachable_from(self.target_of(connection)));
            }
        }
        region.remove(&source);
        region
    }
}

fn output_count(node: &Node, description: &NodeDescription) -> usize {
    let extra = usize::from(node.settings.on_error == OnError::ContinueErrorOutput);
    description.outputs.len() + extra
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Node, NodeSettings};

    fn registry() -> NodeTypeRegistry {
        NodeTypeRegistry::with_builtins()
    }

    #[test]
    fn accepts_linear_workflow() {
        let workflow = Workflow::new("wf", "Linear")
            .node(Node::new("Start", "trigger"))
            .node(Node::new("A", "noop"))
            .node(Node::new("B", "noop"))
            .connect("Start", "A")
            .connect("A", "B");

        let compiled = CompiledWorkflow::compile(Arc::new(workflow), &registry()).unwrap();
        assert_eq!(compiled.start_nodes(), vec![0]);
        assert_eq!(compiled.topological_order(), vec![0, 1, 2]);
        assert_eq!(compiled.reachable_from(1), BTreeSet::from([1, 2]));
    }

    #[test]
    fn reports_every_problem() {
        let workflow = Workflow::new("wf", "Broken")
            .node(Node::new("Start", "trigger"))
            .node(Node::new("A", "noop"))
            .node(Node::new("A", "noop"))
            .node(Node::new("X", "does_not_exist"))
            .connect("Start", "Missing")
            .connect_ports("Start", 3, "A", 0)
            .connect_ports("Start", 0, "A", 2);

        let errors = validate(&workflow, &registry()).unwrap_err();
        let errors = errors.errors();
        assert!(errors.contains(&ValidationError::DuplicateNodeName { name: "A".into() }));
        assert!(errors.contains(&ValidationError::UnknownNodeType {
            node: "X".into(),
            node_type: "does_not_exist".into()
        }));
        assert!(errors.contains(&ValidationError::UnknownConnectionNode {
            connection: 0,
            node: "Missing".into()
        }));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::OutputOutOfRange { port: 3, .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InputOutOfRange { port: 2, .. })));
    }

    #[test]
    fn rejects_cycles() {
        let workflow = Workflow::new("wf", "Cyclic")
            .node(Node::new("Start", "trigger"))
            .node(Node::new("A", "noop"))
            .node(Node::new("B", "noop"))
            .connect("Start", "A")
            .connect("A", "B")
            .connect("B", "A");

        let errors = validate(&workflow, &registry()).unwrap_err();
        assert!(errors.errors().iter().any(|e| matches!(e, ValidationError::Cycle { .. })));
    }

    #[test]
    fn rejects_workflow_without_start_node() {
        let workflow = Workflow::new("wf", "Headless").node(Node::new("A", "noop"));
        let errors = validate(&workflow, &registry()).unwrap_err();
        assert_eq!(errors.errors(), &[ValidationError::NoStartNode]);
    }

    #[test]
    fn error_output_adds_a_port() {
        let workflow = Workflow::new("wf", "Error output")
            .node(Node::new("Start", "trigger"))
            .node(
                Node::new("A", "noop")
                    .settings(NodeSettings::default().on_error(crate::workflow::OnError::ContinueErrorOutput)),
            )
            .node(Node::new("Errors", "noop"))
            .connect("Start", "A")
            .connect_ports("A", 1, "Errors", 0);

        let compiled = CompiledWorkflow::compile(Arc::new(workflow), &registry()).unwrap();
        assert_eq!(compiled.output_count(1), 2);
    }
}

//! Execution Context Builder
//!
//! Builds the [`NodeCallContext`]s for one invocation: parameters resolved per
//! item for per-item nodes, once against the first item for per-batch nodes.
//! Building reads the run history and never mutates run state.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::data::Item;
use crate::error::{EngineError, NodeError};
use crate::expression::{ExecutionInfo, ExpressionError, ExpressionResolver, ExpressionScope};
use crate::nodes::ExecutionMode;
use crate::providers::{BinaryDataProvider, CredentialData, CredentialProvider};
use crate::runtime::run::{ExecutionResult, RunId};
use crate::runtime::state::NodeInputs;
use crate::runtime::store::{RunHistory, SourceRef};
use crate::workflow::{CompiledWorkflow, Node, Workflow, WorkflowRegistry};

/// Identity of the run starting a nested run
#[derive(Debug, Clone)]
pub struct ParentRun {
    pub run_id: RunId,
    pub depth: usize,
    pub cancellation: CancellationToken,
}

/// Starts nested runs on behalf of sub-workflow nodes
#[async_trait]
pub trait SubWorkflowRunner: Send + Sync {
    async fn run_workflow(
        &self,
        workflow: Arc<Workflow>,
        input: Vec<Item>,
        parent: ParentRun,
    ) -> Result<ExecutionResult, EngineError>;
}

/// Collaborators shared by every invocation of one run
#[derive(Clone)]
pub struct RunServices {
    pub run_id: RunId,
    pub depth: usize,
    pub credentials: Arc<dyn CredentialProvider>,
    pub binary: Arc<dyn BinaryDataProvider>,
    pub workflows: Arc<WorkflowRegistry>,
    pub sub_workflows: Arc<dyn SubWorkflowRunner>,
    pub cancellation: CancellationToken,
}

impl std::fmt::Debug for RunServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunServices")
            .field("run_id", &self.run_id)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

/// Everything one node invocation (or one item of it) can see
#[derive(Debug, Clone)]
pub struct NodeCallContext {
    workflow: Arc<Workflow>,
    position: usize,
    parameters: Value,
    inputs: Arc<Vec<Vec<Item>>>,
    source: Arc<Vec<Vec<SourceRef>>>,
    item_index: Option<usize>,
    run_index: usize,
    iteration: usize,
    execution: Arc<ExecutionInfo>,
    services: RunServices,
}

impl NodeCallContext {
    pub fn node(&self) -> &Node {
        &self.workflow.nodes[self.position]
    }

    pub fn node_name(&self) -> &str {
        &self.node().name
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Resolved parameter bag
    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Items on one input port
    pub fn input(&self, port: usize) -> &[Item] {
        self.inputs.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Items on input 0
    pub fn items(&self) -> &[Item] {
        self.input(0)
    }

    pub fn inputs(&self) -> &[Vec<Item>] {
        &self.inputs
    }

    pub fn source(&self) -> &[Vec<SourceRef>] {
        &self.source
    }

    /// The item this context was resolved for (per-item nodes only)
    pub fn item(&self) -> Option<&Item> {
        self.item_index.and_then(|index| self.items().get(index))
    }

    pub fn item_index(&self) -> Option<usize> {
        self.item_index
    }

    pub fn run_index(&self) -> usize {
        self.run_index
    }

    /// Iteration of a controlled loop this node drives (0 outside loops)
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn run_id(&self) -> RunId {
        self.services.run_id
    }

    pub fn execution(&self) -> &ExecutionInfo {
        &self.execution
    }

    pub fn depth(&self) -> usize {
        self.services.depth
    }

    /// Decrypted credential for a type declared on the node
    pub async fn credential(&self, credential_type: &str) -> Result<CredentialData, NodeError> {
        let id = self.node().credentials.get(credential_type).ok_or_else(|| {
            NodeError::input(format!(
                "node '{}' has no '{}' credential configured",
                self.node_name(),
                credential_type
            ))
        })?;
        Ok(self.services.credentials.get(id).await?)
    }

    pub fn binary(&self) -> &dyn BinaryDataProvider {
        self.services.binary.as_ref()
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.services.workflows
    }

    /// Start a nested run; it inherits this run's cancellation
    pub async fn run_workflow(&self, workflow: Arc<Workflow>, input: Vec<Item>) -> Result<ExecutionResult, EngineError> {
        let parent = ParentRun {
            run_id: self.services.run_id,
            depth: self.services.depth,
            cancellation: self.services.cancellation.clone(),
        };
        self.services.sub_workflows.run_workflow(workflow, input, parent).await
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.services.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.services.cancellation.is_cancelled()
    }
}

/// Builds call contexts for invocations of one run
pub struct ContextBuilder<'a> {
    pub compiled: &'a CompiledWorkflow,
    pub history: &'a RunHistory,
    pub execution: &'a Arc<ExecutionInfo>,
    pub resolver: &'a ExpressionResolver,
    pub services: &'a RunServices,
}

impl ContextBuilder<'_> {
    pub fn build(
        &self,
        position: usize,
        inputs: &NodeInputs,
        run_index: usize,
        iteration: usize,
    ) -> Result<Vec<NodeCallContext>, ExpressionError> {
        let node = self.compiled.node(position);
        let shared_inputs = Arc::new(inputs.items.clone());
        let shared_source = Arc::new(inputs.source.clone());
        let first_port = inputs.port(0);

        let scope = |index: usize| {
            ExpressionScope::new(self.history, self.execution)
                .with_item(first_port, index)
                .with_source(&inputs.source)
                .with_run_index(run_index)
        };
        let context = |parameters: Value, item_index: Option<usize>| NodeCallContext {
            workflow: self.compiled.workflow.clone(),
            position,
            parameters,
            inputs: shared_inputs.clone(),
            source: shared_source.clone(),
            item_index,
            run_index,
            iteration,
            execution: self.execution.clone(),
            services: self.services.clone(),
        };

        match self.compiled.description(position).execution_mode {
            ExecutionMode::PerItem => (0..first_port.len())
                .map(|index| {
                    let parameters = self.resolver.resolve_parameters(&node.parameters, &scope(index))?;
                    Ok(context(parameters, Some(index)))
                })
                .collect(),
            ExecutionMode::PerBatch => {
                let parameters = self.resolver.resolve_parameters(&node.parameters, &scope(0))?;
                Ok(vec![context(parameters, None)])
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::nodes::NodeTypeRegistry;
    use crate::providers::{MemoryBinaryStore, StaticCredentials};
    use crate::runtime::run::RunMode;
    use serde_json::json;

    struct NoSubWorkflows;

    #[async_trait]
    impl SubWorkflowRunner for NoSubWorkflows {
        async fn run_workflow(
            &self,
            workflow: Arc<Workflow>,
            _input: Vec<Item>,
            _parent: ParentRun,
        ) -> Result<ExecutionResult, EngineError> {
            Err(EngineError::UnknownWorkflow(workflow.id.clone()))
        }
    }

    pub(crate) fn services() -> RunServices {
        RunServices {
            run_id: RunId::new(),
            depth: 0,
            credentials: Arc::new(StaticCredentials::new().with("smtp-1", json!({"user": "mailer"}))),
            binary: Arc::new(MemoryBinaryStore::new()),
            workflows: Arc::new(WorkflowRegistry::new()),
            sub_workflows: Arc::new(NoSubWorkflows),
            cancellation: CancellationToken::new(),
        }
    }

    /// Contexts for node `name` of a single-node-after-trigger workflow
    pub(crate) fn contexts_for(node: Node, items: Vec<Item>) -> Vec<NodeCallContext> {
        contexts_with_run(node, items, 0, 0)
    }

    pub(crate) fn contexts_with_run(node: Node, items: Vec<Item>, run_index: usize, iteration: usize) -> Vec<NodeCallContext> {
        let name = node.name.clone();
        let workflow = Workflow::new("wf-test", "Test")
            .node(Node::new("Start", "trigger"))
            .node(node)
            .connect("Start", &name);
        let compiled = CompiledWorkflow::compile(Arc::new(workflow), &NodeTypeRegistry::with_builtins()).unwrap();
        let history = RunHistory::new();
        let execution = Arc::new(ExecutionInfo {
            id: "run-test".into(),
            mode: RunMode::Manual.as_str().into(),
            workflow_id: "wf-test".into(),
            workflow_name: "Test".into(),
            input: items.clone(),
        });
        let resolver = ExpressionResolver::default();
        let services = services();
        let builder = ContextBuilder {
            compiled: &compiled,
            history: &history,
            execution: &execution,
            resolver: &resolver,
            services: &services,
        };
        let port_count = compiled.description(1).inputs.len();
        let mut inputs = NodeInputs {
            items: vec![Vec::new(); port_count],
            source: vec![Vec::new(); port_count],
        };
        inputs.items[0] = items;
        builder.build(1, &inputs, run_index, iteration).unwrap()
    }

    #[test]
    fn per_item_nodes_get_one_context_per_item() {
        let node = Node::new("Keep", "filter").parameters(json!({"condition": "={{ $json.n > 1 }}"}));
        let contexts = contexts_for(node, Item::from_values(json!([{"n": 1}, {"n": 2}])));

        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0].parameter("condition"), Some(&json!(false)));
        assert_eq!(contexts[1].parameter("condition"), Some(&json!(true)));
        assert_eq!(contexts[1].item().unwrap().get("n"), Some(&json!(2)));
        assert_eq!(contexts[1].items().len(), 2);
    }

    #[test]
    fn per_batch_nodes_resolve_against_first_item() {
        let node = Node::new("Total", "summarize").parameters(json!({"field": "={{ $json.key }}"}));
        let contexts = contexts_for(node, Item::from_values(json!([{"key": "a"}, {"key": "b"}])));

        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].parameter("field"), Some(&json!("a")));
        assert_eq!(contexts[0].item_index(), None);
    }

    #[test]
    fn per_batch_nodes_without_items_use_empty_scope() {
        let node = Node::new("Total", "summarize").parameters(json!({"field": "={{ $json.key }}"}));
        let contexts = contexts_for(node, Vec::new());
        assert_eq!(contexts[0].parameter("field"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn credentials_are_resolved_by_type() {
        let node = Node::new("Mail", "noop").credential("smtp", "smtp-1");
        let contexts = contexts_for(node, vec![Item::default()]);
        let credential = contexts[0].credential("smtp").await.unwrap();
        assert_eq!(credential["user"], json!("mailer"));
        assert!(matches!(contexts[0].credential("imap").await, Err(NodeError::Input(_))));
    }
}

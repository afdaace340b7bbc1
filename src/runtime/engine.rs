//! Scheduler / execution engine
//!
//! Drives a run one readiness cycle at a time: settle skipped branches, pick
//! the ready nodes in tie-break order, invoke them through the retry policy,
//! record their final results and deliver them downstream. Runs end when
//! nothing is ready and no loop frame is open, or earlier on failure,
//! suspension or cancellation.

use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::data::{ErrorRecord, Item, NodeOutput, PairedItem};
use crate::error::{EngineError, ErrorKind, NodeError, ValidationError, ValidationErrors};
use crate::expression::{ExecutionInfo, ExpressionError, ExpressionResolver};
use crate::nodes::{execute_workflow, NodeOutcome, NodeType, NodeTypeRegistry};
use crate::providers::{BinaryDataProvider, CredentialProvider, MemoryBinaryStore, StaticCredentials};
use crate::runtime::context::{ContextBuilder, NodeCallContext, ParentRun, RunServices, SubWorkflowRunner};
use crate::runtime::policy::{self, AttemptResult};
use crate::runtime::run::{ErrorWorkflowRun, ExecutionResult, Run, RunError, RunId, RunMode, RunOptions, RunReport, RunStatus};
use crate::runtime::state::{NodeInputs, RunState};
use crate::runtime::store::{NodeRunResult, RunDataStore};
use crate::runtime::token::{ResumePayload, SuspendedNode, SuspensionToken, WaitRequest};
use crate::workflow::{CompiledWorkflow, Workflow, WorkflowRegistry};

/// Workflow execution engine
///
/// Cheap to clone; clones share the node type registry, providers and the
/// active-run table.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    node_types: NodeTypeRegistry,
    workflows: Arc<WorkflowRegistry>,
    credentials: Arc<dyn CredentialProvider>,
    binary: Arc<dyn BinaryDataProvider>,
    resolver: ExpressionResolver,
    /// Cancellation handles of runs currently being driven
    active: Mutex<HashMap<RunId, CancellationToken>>,
    /// Suspension tokens already resumed
    consumed: Mutex<ConsumedTokens>,
}

/// Resumed token ids remembered for the double-resume check
const CONSUMED_TOKEN_CAPACITY: usize = 10_000;

/// Ids of resumed suspension tokens; the oldest are forgotten past the capacity
#[derive(Debug)]
struct ConsumedTokens {
    capacity: usize,
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl ConsumedTokens {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    /// Record `id`; false when it was already recorded
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("config", &self.inner.config)
            .field("node_types", &self.inner.node_types.type_names())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ExecutionEngine`]; unset collaborators get in-memory defaults
pub struct EngineBuilder {
    config: EngineConfig,
    node_types: Option<NodeTypeRegistry>,
    workflows: Option<Arc<WorkflowRegistry>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    binary: Option<Arc<dyn BinaryDataProvider>>,
}

impl EngineBuilder {
    /// Node type catalog (default: the built-in nodes)
    pub fn node_types(mut self, node_types: NodeTypeRegistry) -> Self {
        self.node_types = Some(node_types);
        self
    }

    /// Registry used for sub-workflow and error-workflow lookups
    pub fn workflows(mut self, workflows: Arc<WorkflowRegistry>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn binary_store(mut self, binary: Arc<dyn BinaryDataProvider>) -> Self {
        self.binary = Some(binary);
        self
    }

    pub fn build(self) -> ExecutionEngine {
        let resolver = ExpressionResolver::new(self.config.expression_memory_limit)
            .with_time_limit(self.config.expression_timeout());
        ExecutionEngine {
            inner: Arc::new(EngineInner {
                node_types: self.node_types.unwrap_or_else(NodeTypeRegistry::with_builtins),
                workflows: self.workflows.unwrap_or_default(),
                credentials: self.credentials.unwrap_or_else(|| Arc::new(StaticCredentials::new())),
                binary: self.binary.unwrap_or_else(|| Arc::new(MemoryBinaryStore::new())),
                resolver,
                config: self.config,
                active: Mutex::new(HashMap::new()),
                consumed: Mutex::new(ConsumedTokens::with_capacity(CONSUMED_TOKEN_CAPACITY)),
            }),
        }
    }
}

/// Working set of one run while it is being driven
struct ActiveRun {
    run: Run,
    compiled: Arc<CompiledWorkflow>,
    state: RunState,
    store: RunDataStore,
    execution: Arc<ExecutionInfo>,
    services: RunServices,
}

/// A node invocation with its inputs gathered and contexts built
struct Prepared {
    position: usize,
    run_index: usize,
    inputs: NodeInputs,
    contexts: Result<Vec<NodeCallContext>, ExpressionError>,
}

/// Final outcome of one invocation, after retries and continue-on-fail
enum Invocation {
    /// `error` is set when continue-on-fail replaced a failure
    Complete {
        output: NodeOutput,
        error: Option<ErrorRecord>,
    },
    Continue(NodeOutput),
    Suspend(WaitRequest),
    Failed(NodeError),
}

struct Settled {
    position: usize,
    run_index: usize,
    inputs: NodeInputs,
    invocation: Invocation,
}

impl ExecutionEngine {
    /// Engine with built-in nodes and in-memory providers
    pub fn new(config: EngineConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            node_types: None,
            workflows: None,
            credentials: None,
            binary: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn node_types(&self) -> &NodeTypeRegistry {
        &self.inner.node_types
    }

    pub fn workflows(&self) -> &Arc<WorkflowRegistry> {
        &self.inner.workflows
    }

    /// Check a workflow against this engine's node types
    pub fn validate(&self, workflow: &Workflow) -> Result<(), ValidationErrors> {
        crate::workflow::validate(workflow, &self.inner.node_types)
    }

    /// Start a run from the workflow's first start node
    pub async fn start_run(&self, workflow: &Workflow, input: Vec<Item>) -> Result<ExecutionResult, EngineError> {
        self.start_run_with(workflow, input, RunOptions::default()).await
    }

    pub async fn start_run_with(
        &self,
        workflow: &Workflow,
        input: Vec<Item>,
        options: RunOptions,
    ) -> Result<ExecutionResult, EngineError> {
        self.start_at_depth(Arc::new(workflow.clone()), input, options, 0).await
    }

    /// Continue a suspended run; each token can be resumed once
    ///
    /// The once-only check is held in memory by this engine and remembers the
    /// most recent resumes only. Callers that store tokens durably must mark
    /// them used in that same store.
    pub async fn resume_run(&self, token: SuspensionToken, payload: ResumePayload) -> Result<ExecutionResult, EngineError> {
        self.resume_at_depth(token, payload, CancellationToken::new()).await
    }

    /// Request cancellation of a running run; returns whether the run was found
    ///
    /// Takes effect once the invocations in flight return.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.inner.active.lock().get(&run_id) {
            Some(token) => {
                tracing::info!(run_id = %run_id, "🛑 Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Runs currently being driven by this engine
    pub fn active_runs(&self) -> Vec<RunId> {
        let mut runs: Vec<RunId> = self.inner.active.lock().keys().copied().collect();
        runs.sort();
        runs
    }

    fn start_at_depth(
        &self,
        workflow: Arc<Workflow>,
        input: Vec<Item>,
        options: RunOptions,
        depth: usize,
    ) -> BoxFuture<'_, Result<ExecutionResult, EngineError>> {
        async move {
            if depth > self.inner.config.max_workflow_depth {
                return Err(EngineError::DepthExceeded(depth));
            }
            let compiled = Arc::new(CompiledWorkflow::compile(workflow, &self.inner.node_types)?);
            let start = start_position(&compiled, options.start_node.as_deref())?;

            let run = Run::new(compiled.id(), options.mode, depth);
            let input = if input.is_empty() { vec![Item::default()] } else { input };
            let state = RunState::new(&compiled, start);
            let cancellation = options.cancellation.unwrap_or_else(CancellationToken::new);
            let mut active = self.activate(run, compiled, state, RunDataStore::new(), input, cancellation);
            active.run.transition(RunStatus::Running)?;

            tracing::info!(
                run_id = %active.run.id,
                workflow = %active.compiled.id(),
                "🚀 Starting run from node '{}' ({} input items)",
                active.compiled.name(start),
                active.execution.input.len()
            );
            self.drive_registered(active, Vec::new()).await
        }
        .boxed()
    }

    fn resume_at_depth(
        &self,
        token: SuspensionToken,
        payload: ResumePayload,
        cancellation: CancellationToken,
    ) -> BoxFuture<'_, Result<ExecutionResult, EngineError>> {
        async move {
            if self.inner.consumed.lock().contains(&token.id) {
                return Err(EngineError::TokenConsumed(token.id));
            }
            let compiled = Arc::new(CompiledWorkflow::compile(
                Arc::new(token.workflow.clone()),
                &self.inner.node_types,
            )?);
            let position = compiled.position(&token.suspended.node).ok_or_else(|| {
                EngineError::InvalidResumePayload(format!(
                    "suspended node '{}' is not part of workflow '{}'",
                    token.suspended.node,
                    compiled.id()
                ))
            })?;
            if let (false, Some(output)) = (matches!(token.wait(), WaitRequest::SubWorkflow { .. }), &payload.output) {
                let available = compiled.output_count(position);
                if output.port_count() > available {
                    return Err(EngineError::InvalidResumePayload(format!(
                        "node '{}' has {} outputs but the payload has {}",
                        token.suspended.node,
                        available,
                        output.port_count()
                    )));
                }
            }
            if !self.inner.consumed.lock().insert(token.id) {
                return Err(EngineError::TokenConsumed(token.id));
            }

            let mut run = Run::resumed(&token);
            run.transition(RunStatus::Running)?;
            let SuspensionToken {
                input,
                state,
                run_data,
                suspended,
                ..
            } = token;
            let active = self.activate(run, compiled, state, RunDataStore::restore(run_data), input, cancellation);
            self.inner
                .active
                .lock()
                .insert(active.run.id, active.services.cancellation.clone());
            tracing::info!(run_id = %active.run.id, "▶️ Resuming run at node '{}'", suspended.node);

            let inputs = NodeInputs {
                items: suspended.input.clone(),
                source: suspended.source.clone(),
            };
            let invocation = match &suspended.wait {
                WaitRequest::SubWorkflow { workflow_id, token: child } => {
                    let child_cancellation = active.services.cancellation.child_token();
                    let outcome = self
                        .resume_at_depth(child.as_ref().clone(), payload, child_cancellation)
                        .await;
                    settle_child(&active.compiled, position, &inputs, workflow_id.clone(), outcome)
                }
                WaitRequest::Until { .. } | WaitRequest::External { .. } => {
                    complete(payload.into_output(&suspended), &active.compiled, position, &inputs)
                }
            };

            let settled = Settled {
                position,
                run_index: suspended.run_index,
                inputs,
                invocation,
            };
            self.drive_registered(active, vec![settled]).await
        }
        .boxed()
    }

    fn activate(
        &self,
        run: Run,
        compiled: Arc<CompiledWorkflow>,
        state: RunState,
        store: RunDataStore,
        input: Vec<Item>,
        cancellation: CancellationToken,
    ) -> ActiveRun {
        let execution = Arc::new(ExecutionInfo {
            id: run.id.to_string(),
            mode: run.mode.as_str().to_string(),
            workflow_id: compiled.id().to_string(),
            workflow_name: compiled.workflow.name.clone(),
            input,
        });
        let services = RunServices {
            run_id: run.id,
            depth: run.depth,
            credentials: self.inner.credentials.clone(),
            binary: self.inner.binary.clone(),
            workflows: self.inner.workflows.clone(),
            sub_workflows: Arc::new(self.clone()),
            cancellation,
        };
        ActiveRun {
            run,
            compiled,
            state,
            store,
            execution,
            services,
        }
    }

    /// Drive a run while it is listed in the active-run table
    async fn drive_registered(&self, active: ActiveRun, settled: Vec<Settled>) -> Result<ExecutionResult, EngineError> {
        let run_id = active.run.id;
        self.inner
            .active
            .lock()
            .insert(run_id, active.services.cancellation.clone());

        let span = tracing::info_span!(
            "run",
            run_id = %run_id,
            workflow = %active.compiled.id(),
            depth = active.run.depth
        );
        let result = self.drive(active, settled).instrument(span).await;

        self.inner.active.lock().remove(&run_id);
        result
    }

    async fn drive(&self, mut active: ActiveRun, mut settled: Vec<Settled>) -> Result<ExecutionResult, EngineError> {
        loop {
            let mut suspension = None;
            let mut failure = None;

            for Settled {
                position,
                run_index,
                inputs,
                invocation,
            } in std::mem::take(&mut settled)
            {
                let name = active.compiled.name(position).to_string();
                match invocation {
                    Invocation::Complete { output, error } => {
                        active.state.complete(&active.compiled, position, run_index, &output);
                        let result = NodeRunResult {
                            source: inputs.source,
                            output,
                            error,
                        };
                        active.store.record(&name, run_index, result)?;
                    }
                    Invocation::Continue(output) => {
                        active.state.complete_iteration(&active.compiled, position, run_index, &output);
                        active
                            .store
                            .record(&name, run_index, NodeRunResult::success(inputs.source, output))?;
                    }
                    Invocation::Suspend(wait) => {
                        if suspension.is_none() {
                            suspension = Some(SuspendedNode {
                                node: name,
                                run_index,
                                source: inputs.source,
                                input: inputs.items,
                                wait,
                            });
                        } else {
                            tracing::debug!(node = %name, "Second suspension in one cycle; node runs again after resume");
                        }
                    }
                    Invocation::Failed(NodeError::Cancelled) if active.services.cancellation.is_cancelled() => {
                        tracing::info!(node = %name, "Node stopped on cancellation");
                    }
                    Invocation::Failed(error) => {
                        let record = policy::error_record(&name, &error);
                        let result = NodeRunResult {
                            source: inputs.source,
                            output: NodeOutput::default(),
                            error: Some(record),
                        };
                        active.store.record(&name, run_index, result)?;
                        active.state.last_node_executed = Some(position);
                        if failure.is_none() {
                            failure = Some(RunError {
                                node: Some(name),
                                kind: error.kind(),
                                message: error.to_string(),
                            });
                        }
                    }
                }
            }

            // cancellation wins over failures that raced with it
            if active.services.cancellation.is_cancelled() {
                if let Some(error) = &failure {
                    tracing::debug!("Run cancelled; dropping concurrent failure: {}", error.message);
                }
                return self.finish(active, RunStatus::Canceled);
            }
            if let Some(error) = failure {
                return self.fail(active, error).await;
            }
            if let Some(suspended) = suspension {
                return self.suspend(active, suspended);
            }

            for position in active.state.settle_skips(&active.compiled) {
                tracing::debug!(node = %active.compiled.name(position), "⏭️ Skipping node: no items reached it");
            }

            let ready = active.state.ready(&active.compiled);
            if ready.is_empty() {
                match active.state.rewind(&active.compiled, self.inner.config.max_loop_iterations) {
                    Ok(Some(position)) => {
                        tracing::debug!(
                            node = %active.compiled.name(position),
                            "🔁 Starting loop iteration {}",
                            active.state.iteration(position)
                        );
                        continue;
                    }
                    Ok(None) => return self.finish(active, RunStatus::Success),
                    Err(error) => {
                        let node = active
                            .state
                            .loops
                            .last()
                            .map(|frame| active.compiled.name(frame.node).to_string());
                        let error = RunError {
                            node,
                            kind: ErrorKind::Fatal,
                            message: error.to_string(),
                        };
                        return self.fail(active, error).await;
                    }
                }
            }

            let width = self.inner.config.max_parallel_nodes.max(1);
            let batch: Vec<Prepared> = ready
                .into_iter()
                .take(width)
                .map(|position| self.prepare(&active, position))
                .collect();

            let active_ref = &active;
            settled = join_all(batch.into_iter().map(|prepared| self.invoke(active_ref, prepared))).await;
        }
    }

    fn prepare(&self, active: &ActiveRun, position: usize) -> Prepared {
        let compiled: &CompiledWorkflow = &active.compiled;
        let run_index = active.store.run_count(compiled.name(position));
        let iteration = active.state.iteration(position);

        active.store.with_runs(|history| {
            let mut inputs = active.state.gather_inputs(compiled, history, position);
            if compiled.node(position).settings.execute_once {
                inputs.keep_first_item();
            }
            let builder = ContextBuilder {
                compiled,
                history,
                execution: &active.execution,
                resolver: &self.inner.resolver,
                services: &active.services,
            };
            let contexts = builder.build(position, &inputs, run_index, iteration);
            Prepared {
                position,
                run_index,
                inputs,
                contexts,
            }
        })
    }

    async fn invoke(&self, active: &ActiveRun, prepared: Prepared) -> Settled {
        let Prepared {
            position,
            run_index,
            inputs,
            contexts,
        } = prepared;
        let compiled: &CompiledWorkflow = &active.compiled;
        let node = compiled.node(position);
        let output_count = compiled.output_count(position);

        if node.disabled {
            tracing::debug!(node = %node.name, "Node is disabled; passing input through");
            let items = inputs
                .port(0)
                .iter()
                .enumerate()
                .map(|(index, item)| item.clone().paired_to(index))
                .collect();
            let mut output = NodeOutput::single(items);
            output.pad_to(output_count);
            return Settled {
                position,
                run_index,
                inputs,
                invocation: Invocation::Complete { output, error: None },
            };
        }

        tracing::info!(node = %node.name, run_index, "▶️ Executing node '{}' ({})", node.name, node.node_type);
        let started = Instant::now();

        let AttemptResult { result, attempts } = match (contexts, self.inner.node_types.get(&node.node_type)) {
            (Err(error), _) => AttemptResult {
                result: Err(error.into()),
                attempts: 1,
            },
            (Ok(_), None) => AttemptResult {
                result: Err(NodeError::fatal(format!("node type '{}' is not registered", node.node_type))),
                attempts: 1,
            },
            (Ok(contexts), Some(registered)) => {
                let implementation = registered.implementation.as_ref();
                let contexts = contexts.as_slice();
                let default_timeout = self.inner.config.default_node_timeout();
                policy::run_attempts(&node.settings, default_timeout, &active.services.cancellation, |attempt| {
                    if attempt > 1 {
                        tracing::debug!(node = %node.name, attempt, "Retrying node");
                    }
                    execute_contexts(implementation, contexts, output_count)
                })
                .await
            }
        };

        let invocation = match result {
            Ok(NodeOutcome::Complete(output)) => complete(output, compiled, position, &inputs),
            Ok(NodeOutcome::Continue(output)) => Invocation::Continue(finish_output(output, compiled, position, &inputs)),
            Ok(NodeOutcome::Suspend(wait)) => Invocation::Suspend(wait),
            Err(error) => recover(compiled, position, &inputs, error),
        };

        let elapsed = started.elapsed();
        match &invocation {
            Invocation::Complete { output, error: None } | Invocation::Continue(output) => tracing::info!(
                node = %node.name,
                run_index,
                attempt = attempts,
                "✅ Node '{}' completed in {:?} with {} items",
                node.name,
                elapsed,
                output.item_count()
            ),
            Invocation::Complete { error: Some(_), .. } => {}
            Invocation::Suspend(_) => tracing::info!(node = %node.name, "⏸️ Node '{}' requested suspension", node.name),
            Invocation::Failed(error) => tracing::error!(
                node = %node.name,
                run_index,
                attempt = attempts,
                "❌ Node '{}' failed after {:?}: {}",
                node.name,
                elapsed,
                error
            ),
        }

        Settled {
            position,
            run_index,
            inputs,
            invocation,
        }
    }

    fn suspend(&self, mut active: ActiveRun, suspended: SuspendedNode) -> Result<ExecutionResult, EngineError> {
        active.run.transition(RunStatus::Waiting)?;
        let token = SuspensionToken {
            id: Uuid::new_v4(),
            run_id: active.run.id,
            workflow: active.compiled.workflow.as_ref().clone(),
            mode: active.run.mode,
            depth: active.run.depth,
            input: active.execution.input.clone(),
            run_data: active.store.snapshot(),
            state: active.state,
            suspended,
            started_at: active.run.started_at,
            created_at: Utc::now(),
        };
        tracing::info!(
            node = %token.suspended.node,
            "⏸️ Run suspended at node '{}' (token {})",
            token.suspended.node,
            token.id
        );
        Ok(ExecutionResult::Suspended(token))
    }

    fn finish(&self, mut active: ActiveRun, status: RunStatus) -> Result<ExecutionResult, EngineError> {
        active.run.transition(status)?;
        let report = build_report(&active, None, None);
        match status {
            RunStatus::Canceled => tracing::warn!("🛑 Run canceled after {} nodes", report.run_data.0.len()),
            _ => tracing::info!(
                "🎉 Run finished: {} ({} nodes executed, {} skipped)",
                status,
                report.run_data.0.len(),
                report.skipped.len()
            ),
        }
        Ok(ExecutionResult::Completed(report))
    }

    async fn fail(&self, mut active: ActiveRun, error: RunError) -> Result<ExecutionResult, EngineError> {
        active.run.transition(RunStatus::Failed)?;
        tracing::error!(node = ?error.node, kind = %error.kind, "❌ Run failed: {}", error.message);
        let error_workflow = self.dispatch_error_workflow(&active, &error).await;
        Ok(ExecutionResult::Completed(build_report(&active, Some(error), error_workflow)))
    }

    /// Run the workflow's error workflow with the failure context as its single item
    async fn dispatch_error_workflow(&self, active: &ActiveRun, error: &RunError) -> Option<ErrorWorkflowRun> {
        if active.run.mode == RunMode::Error {
            return None;
        }
        let workflow_id = active.compiled.workflow.settings.error_workflow.clone()?;
        let Some(workflow) = self.inner.workflows.get_workflow(&workflow_id) else {
            tracing::warn!("⚠️ Error workflow '{}' is not registered", workflow_id);
            return Some(ErrorWorkflowRun {
                workflow_id,
                run_id: None,
                status: RunStatus::Failed,
            });
        };

        let last_node_executed = active.state.last_node_executed.map(|pos| active.compiled.name(pos));
        let input = Item::new(json!({
            "execution": {
                "id": active.run.id.to_string(),
                "mode": active.run.mode.as_str(),
                "error": {
                    "node": error.node,
                    "kind": error.kind,
                    "message": error.message,
                },
                "last_node_executed": last_node_executed,
            },
            "workflow": {
                "id": active.compiled.id(),
                "name": active.compiled.workflow.name,
            },
        }));

        tracing::info!("🚨 Dispatching error workflow '{}'", workflow_id);
        let options = RunOptions::default().mode(RunMode::Error);
        match self.start_at_depth(workflow, vec![input], options, active.run.depth + 1).await {
            Ok(result) => Some(ErrorWorkflowRun {
                workflow_id,
                run_id: Some(result.run_id()),
                status: result.status(),
            }),
            Err(err) => {
                tracing::warn!("⚠️ Error workflow '{}' could not run: {}", workflow_id, err);
                Some(ErrorWorkflowRun {
                    workflow_id,
                    run_id: None,
                    status: RunStatus::Failed,
                })
            }
        }
    }
}

#[async_trait]
impl SubWorkflowRunner for ExecutionEngine {
    async fn run_workflow(
        &self,
        workflow: Arc<Workflow>,
        input: Vec<Item>,
        parent: ParentRun,
    ) -> Result<ExecutionResult, EngineError> {
        tracing::debug!(parent = %parent.run_id, "Starting nested run of '{}'", workflow.id);
        let options = RunOptions::default()
            .mode(RunMode::Integrated)
            .cancellation(parent.cancellation.child_token());
        self.start_at_depth(workflow, input, options, parent.depth + 1).await
    }
}

fn start_position(compiled: &CompiledWorkflow, requested: Option<&str>) -> Result<usize, EngineError> {
    let position = match requested {
        Some(name) => compiled
            .position(name)
            .filter(|&pos| compiled.description(pos).is_trigger())
            .ok_or_else(|| ValidationError::InvalidStartNode { node: name.to_string() }),
        None => compiled.start_nodes().first().copied().ok_or(ValidationError::NoStartNode),
    };
    position.map_err(|error| ValidationErrors(vec![error]).into())
}

/// Run every context of one invocation
///
/// Per-item outputs are concatenated in item order; items without pairing
/// are paired to the item they were produced for.
async fn execute_contexts(
    implementation: &dyn NodeType,
    contexts: &[NodeCallContext],
    output_count: usize,
) -> Result<NodeOutcome, NodeError> {
    match contexts {
        [] => Ok(NodeOutcome::Complete(NodeOutput::empty(output_count))),
        [batch] if batch.item_index().is_none() => implementation.execute(batch).await,
        per_item => {
            let mut merged = NodeOutput::empty(output_count);
            let mut continues = false;
            for ctx in per_item {
                let mut output = match implementation.execute(ctx).await? {
                    NodeOutcome::Complete(output) => output,
                    NodeOutcome::Continue(output) => {
                        continues = true;
                        output
                    }
                    suspend @ NodeOutcome::Suspend(_) => return Ok(suspend),
                };
                let index = ctx.item_index().unwrap_or(0);
                for item in output.0.iter_mut().flatten() {
                    if item.paired_item.is_empty() {
                        item.paired_item.push(PairedItem::new(index));
                    }
                }
                merged.extend(output);
            }
            Ok(if continues {
                NodeOutcome::Continue(merged)
            } else {
                NodeOutcome::Complete(merged)
            })
        }
    }
}

/// Pad ports and keep paired-item links inside the invocation's own input
fn finish_output(mut output: NodeOutput, compiled: &CompiledWorkflow, position: usize, inputs: &NodeInputs) -> NodeOutput {
    output.pad_to(compiled.output_count(position));
    let sole_item = inputs.item_count() == 1;
    let sole_port = inputs.items.iter().position(|port| !port.is_empty()).unwrap_or(0);

    for item in output.0.iter_mut().flatten() {
        item.paired_item
            .retain(|paired| paired.item < inputs.port(paired.input).len());
        if item.paired_item.is_empty() && sole_item {
            item.paired_item.push(PairedItem::on_input(0, sole_port));
        }
    }
    output
}

fn complete(output: NodeOutput, compiled: &CompiledWorkflow, position: usize, inputs: &NodeInputs) -> Invocation {
    let mut output = finish_output(output, compiled, position, inputs);
    if output.is_empty() && compiled.node(position).settings.always_output_data {
        output.0[0].push(Item::default());
    }
    Invocation::Complete { output, error: None }
}

/// Apply continue-on-fail to a final failure
fn recover(compiled: &CompiledWorkflow, position: usize, inputs: &NodeInputs, error: NodeError) -> Invocation {
    let node = compiled.node(position);
    if !policy::can_continue(&node.settings, &error) {
        return Invocation::Failed(error);
    }
    tracing::warn!(node = %node.name, "⚠️ Node '{}' failed, continuing: {}", node.name, error);
    let record = policy::error_record(&node.name, &error);
    let output = policy::continue_output(
        node.settings.on_error,
        &record,
        inputs.port(0),
        compiled.output_count(position),
    );
    Invocation::Complete {
        output,
        error: Some(record),
    }
}

/// Outcome of a resumed nested run, as seen by the node that started it
fn settle_child(
    compiled: &CompiledWorkflow,
    position: usize,
    inputs: &NodeInputs,
    workflow_id: String,
    outcome: Result<ExecutionResult, EngineError>,
) -> Invocation {
    let error = match outcome {
        Ok(ExecutionResult::Suspended(token)) => {
            return Invocation::Suspend(WaitRequest::SubWorkflow {
                workflow_id,
                token: Box::new(token),
            })
        }
        Ok(ExecutionResult::Completed(report)) if report.is_success() => {
            let items = execute_workflow::child_items(&report);
            return complete(NodeOutput::single(items), compiled, position, inputs);
        }
        Ok(ExecutionResult::Completed(report)) => execute_workflow::child_error(&workflow_id, &report),
        Err(error) => execute_workflow::engine_error(&workflow_id, &error),
    };
    recover(compiled, position, inputs, error)
}

fn build_report(active: &ActiveRun, error: Option<RunError>, error_workflow: Option<ErrorWorkflowRun>) -> RunReport {
    let compiled = &active.compiled;
    RunReport {
        run_id: active.run.id,
        workflow_id: active.run.workflow_id.clone(),
        status: active.run.status(),
        run_data: active.store.snapshot(),
        last_node_executed: active.state.last_node_executed.map(|pos| compiled.name(pos).to_string()),
        skipped: active
            .state
            .skipped()
            .into_iter()
            .map(|pos| compiled.name(pos).to_string())
            .collect(),
        error,
        error_workflow,
        started_at: active.run.started_at,
        finished_at: Utc::now(),
    }
}

//! Hot-reload workflow registry using ArcSwap
//!
//! Sub-workflow and error-workflow lookups go through this registry. Each
//! update swaps the whole map, so runs in flight keep the definitions they
//! started with while new lookups see the update.

use crate::workflow::{storage::WorkflowStorage, types::Workflow};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Lock-free workflow registry
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    /// Key: workflow_id
    workflows: ArcSwap<HashMap<String, Arc<Workflow>>>,
    /// Optional backing storage for reload operations
    storage: Option<WorkflowStorage>,
}

impl WorkflowRegistry {
    /// Empty in-memory registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry backed by a workflow directory
    pub fn with_storage(storage: WorkflowStorage) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            storage: Some(storage),
        }
    }

    /// Load every stored workflow, replacing the current contents
    pub async fn init_from_storage(&self) -> Result<()> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Workflow registry has no storage configured"))?;
        let stored = storage.load_all_workflows().await?;
        let loaded = stored.into_iter().map(|(id, wf)| (id, Arc::new(wf))).collect();

        self.workflows.store(Arc::new(loaded));
        tracing::info!("Initialized workflow registry with {} workflows", self.workflows.load().len());
        Ok(())
    }

    /// Re-read a single workflow from storage
    pub async fn reload_workflow(&self, workflow_id: &str) -> Result<()> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Workflow registry has no storage configured"))?;
        let workflow = storage
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Workflow not found: {}", workflow_id))?;

        self.register(workflow);
        tracing::info!("Hot-reloaded workflow: {}", workflow_id);
        Ok(())
    }

    /// Add or replace a workflow
    pub fn register(&self, workflow: Workflow) {
        let id = workflow.id.clone();
        self.workflows.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(id.clone(), Arc::new(workflow.clone()));
            next
        });
    }

    /// Get a workflow by ID (lock-free read)
    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.workflows.load().get(workflow_id).cloned()
    }

    /// List all registered workflow IDs, sorted
    pub fn list_workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove a workflow; returns whether it was present
    pub fn remove_workflow(&self, workflow_id: &str) -> bool {
        let mut removed = false;
        self.workflows.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(workflow_id).is_some();
            next
        });
        if removed {
            tracing::info!("Removed workflow from registry: {}", workflow_id);
        }
        removed
    }
}

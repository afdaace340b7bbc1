//! Directory-backed workflow storage
//!
//! Workflows are kept as one JSON document per file (`<id>.json`). This is the
//! bootstrap source for the workflow registry and the CLI; durable run records
//! are owned by whatever system embeds the engine.

use crate::workflow::types::Workflow;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// JSON-file workflow storage rooted at a directory
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    dir: PathBuf,
}

impl WorkflowStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the storage directory if needed
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create workflow directory {}", self.dir.display()))
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            anyhow::bail!("Invalid workflow id for storage: {:?}", id);
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// Store a new workflow or overwrite an existing one
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let path = self.path_for(&workflow.id)?;
        let definition_json = serde_json::to_vec_pretty(workflow)?;
        tokio::fs::write(&path, definition_json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Retrieve a workflow by ID
    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let workflow = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Invalid workflow definition in {}", path.display()))?;
                Ok(Some(workflow))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Load all workflows, keyed by the id inside each document
    pub async fn load_all_workflows(&self) -> Result<HashMap<String, Workflow>> {
        let mut workflows = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list {}", self.dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let workflow: Workflow = serde_json::from_slice(&bytes)
                .with_context(|| format!("Invalid workflow definition in {}", path.display()))?;
            tracing::debug!("Loaded workflow '{}' from {}", workflow.id, path.display());
            workflows.insert(workflow.id.clone(), workflow);
        }

        Ok(workflows)
    }

    /// Delete a workflow by ID
    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{registry::WorkflowRegistry, types::Node};

    #[tokio::test]
    async fn save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = WorkflowStorage::new(dir.path());
        storage.init().await.unwrap();

        let workflow = Workflow::new("wf-a", "A").node(Node::new("Start", "trigger"));
        storage.save_workflow(&workflow).await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();

        assert_eq!(storage.get_workflow("wf-a").await.unwrap(), Some(workflow));
        assert_eq!(storage.get_workflow("missing").await.unwrap(), None);
        assert_eq!(storage.load_all_workflows().await.unwrap().len(), 1);

        assert!(storage.delete_workflow("wf-a").await.unwrap());
        assert!(!storage.delete_workflow("wf-a").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let storage = WorkflowStorage::new(dir.path());
        assert!(storage.get_workflow("../etc").await.is_err());
    }

    #[tokio::test]
    async fn registry_loads_and_reloads_from_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = WorkflowStorage::new(dir.path());
        storage
            .save_workflow(&Workflow::new("wf", "Old").node(Node::new("Start", "trigger")))
            .await
            .unwrap();

        let registry = WorkflowRegistry::with_storage(storage.clone());
        registry.init_from_storage().await.unwrap();
        assert_eq!(registry.get_workflow("wf").unwrap().name, "Old");

        storage
            .save_workflow(&Workflow::new("wf", "New").node(Node::new("Start", "trigger")))
            .await
            .unwrap();
        registry.reload_workflow("wf").await.unwrap();
        assert_eq!(registry.get_workflow("wf").unwrap().name, "New");
    }
}

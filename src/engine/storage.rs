// Workflow persistence backends

//! # Workflow Storage
//!
//! Pluggable persistence for workflow definitions behind the
//! [`WorkflowStorage`] trait. Two backends ship with the engine:
//!
//! - [`InMemoryWorkflowStorage`]: a lock-guarded map, used by tests and
//!   embedded hosts that don't need durability
//! - [`FileWorkflowStorage`]: one JSON file per workflow in a directory,
//!   plus an `index.json` carrying lightweight metadata so listing does
//!   not deserialize every workflow
//!
//! Executions are never persisted; storage covers definitions only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::models::Workflow;
use crate::Result;

/// Lightweight workflow metadata, as returned by listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: String,
}

impl From<&Workflow> for WorkflowSummary {
    fn from(workflow: &Workflow) -> Self {
        Self {
            id: workflow.id.clone(),
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            created_at: workflow.created_at,
            updated_at: workflow.updated_at,
            version: workflow.version.clone(),
        }
    }
}

/// Storage interface for workflow definitions
#[async_trait]
pub trait WorkflowStorage: Send + Sync {
    /// Persist a workflow, refreshing its `updated_at` stamp
    ///
    /// Returns the workflow's ID.
    async fn save_workflow(&self, workflow: &mut Workflow) -> Result<String>;

    /// Load a workflow by ID; `None` if it does not exist
    async fn load_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>>;

    /// List metadata for all stored workflows
    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>>;

    /// Delete a workflow by ID
    ///
    /// Returns `true` if deleted, `false` if not found.
    async fn delete_workflow(&self, workflow_id: &str) -> Result<bool>;
}

/// In-memory workflow storage
#[derive(Default)]
pub struct InMemoryWorkflowStorage {
    workflows: RwLock<HashMap<String, Workflow>>,
}

impl InMemoryWorkflowStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStorage for InMemoryWorkflowStorage {
    async fn save_workflow(&self, workflow: &mut Workflow) -> Result<String> {
        workflow.touch();
        let mut workflows = self.workflows.write().await;
        workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(workflow.id.clone())
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        let workflows = self.workflows.read().await;
        Ok(workflows.get(workflow_id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        let workflows = self.workflows.read().await;
        let mut summaries: Vec<WorkflowSummary> =
            workflows.values().map(WorkflowSummary::from).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<bool> {
        let mut workflows = self.workflows.write().await;
        Ok(workflows.remove(workflow_id).is_some())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexDoc {
    workflows: Vec<WorkflowSummary>,
}

/// File-based workflow storage
///
/// Each workflow lives at `{dir}/{workflow_id}.json`; `{dir}/index.json`
/// holds the metadata index.
pub struct FileWorkflowStorage {
    storage_dir: PathBuf,
    index_path: PathBuf,
}

impl FileWorkflowStorage {
    /// Open (creating if needed) a storage directory
    pub async fn new<P: AsRef<Path>>(storage_dir: P) -> Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&storage_dir).await?;

        let index_path = storage_dir.join("index.json");
        if !tokio::fs::try_exists(&index_path).await? {
            let empty = serde_json::to_string_pretty(&IndexDoc::default())?;
            tokio::fs::write(&index_path, empty).await?;
        }

        Ok(Self {
            storage_dir,
            index_path,
        })
    }

    fn workflow_path(&self, workflow_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{}.json", workflow_id))
    }

    /// Read the index, tolerating a missing or corrupt file
    async fn read_index(&self) -> Result<IndexDoc> {
        let raw = match tokio::fs::read_to_string(&self.index_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(IndexDoc::default())
            }
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_str(&raw) {
            Ok(index) => Ok(index),
            Err(err) => {
                warn!(error = %err, "workflow index is corrupt, starting fresh");
                Ok(IndexDoc::default())
            }
        }
    }

    async fn write_index(&self, index: &IndexDoc) -> Result<()> {
        let raw = serde_json::to_string_pretty(index)?;
        tokio::fs::write(&self.index_path, raw).await?;
        Ok(())
    }

    async fn update_index(&self, workflow: &Workflow) -> Result<()> {
        let mut index = self.read_index().await?;
        let summary = WorkflowSummary::from(workflow);

        if let Some(entry) = index.workflows.iter_mut().find(|e| e.id == workflow.id) {
            *entry = summary;
        } else {
            index.workflows.push(summary);
        }
        self.write_index(&index).await
    }

    async fn remove_from_index(&self, workflow_id: &str) -> Result<()> {
        let mut index = self.read_index().await?;
        index.workflows.retain(|entry| entry.id != workflow_id);
        self.write_index(&index).await
    }
}

#[async_trait]
impl WorkflowStorage for FileWorkflowStorage {
    async fn save_workflow(&self, workflow: &mut Workflow) -> Result<String> {
        workflow.touch();

        let json = workflow.to_json(true)?;
        tokio::fs::write(self.workflow_path(&workflow.id), json).await?;

        self.update_index(workflow).await?;
        Ok(workflow.id.clone())
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        let path = self.workflow_path(workflow_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        Ok(Some(Workflow::from_json(&raw)?))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        Ok(self.read_index().await?.workflows)
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<bool> {
        let path = self.workflow_path(workflow_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.remove_from_index(workflow_id).await?;
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

// Multi-run execution manager

//! # Workflow Executor
//!
//! The [`WorkflowExecutor`] manages concurrent workflow runs. It validates
//! workflows before running them, keeps a registry of live and finished
//! executions, and exposes the start/status/cancel/continue/cleanup
//! lifecycle.
//!
//! Each execution's mutable state is private to that run behind an async
//! mutex; concurrency exists only at the run level. The executor shares
//! one event bus across all runs so a single subscriber observes
//! everything.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::engine::events::ExecutionEventBus;
use crate::engine::execution::{
    ExecutionStatus, NodeExecutionStatus, WorkflowExecution,
};
use crate::engine::routing::RouterClassifier;
use crate::models::{AgentRegistry, ToolRegistry, Workflow};
use crate::{AgentFlowError, Result};

/// What `execute_workflow` hands back
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The run was driven to termination; here are its results
    Completed(HashMap<String, serde_json::Value>),
    /// The run was started in the background; poll it by this ID
    Started(String),
}

/// Per-node slice of a status report
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatusReport {
    pub node_id: String,
    pub name: String,
    pub status: NodeExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Point-in-time snapshot of one execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatusReport {
    pub id: String,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub completed_nodes: usize,
    pub total_nodes: usize,
    pub results: HashMap<String, serde_json::Value>,
    pub node_statuses: HashMap<String, NodeStatusReport>,
}

/// Manager for executing workflows
///
/// Maintains a registry of executions keyed by execution ID and provides
/// methods to start, monitor, and control them.
pub struct WorkflowExecutor {
    agent_registry: Arc<AgentRegistry>,
    tool_registry: Arc<ToolRegistry>,
    executions: DashMap<String, Arc<Mutex<WorkflowExecution>>>,
    event_bus: ExecutionEventBus,
    classifier: Option<Arc<dyn RouterClassifier>>,
}

impl WorkflowExecutor {
    /// Create an executor over the given registries
    pub fn new(agent_registry: Arc<AgentRegistry>, tool_registry: Arc<ToolRegistry>) -> Self {
        Self {
            agent_registry,
            tool_registry,
            executions: DashMap::new(),
            event_bus: ExecutionEventBus::new(),
            classifier: None,
        }
    }

    /// Attach an AI router classifier used by all runs, builder-style
    pub fn with_classifier(mut self, classifier: Arc<dyn RouterClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// The event bus shared by every run this executor starts
    pub fn event_bus(&self) -> &ExecutionEventBus {
        &self.event_bus
    }

    /// Execute a workflow
    ///
    /// Validates the workflow first; structural errors abort before any
    /// state is created. With `wait` the run is driven to termination and
    /// the results returned; without it the execution ID is returned for
    /// later `continue_execution` / `get_execution_status` calls.
    pub async fn execute_workflow(
        &self,
        workflow: Workflow,
        input_data: HashMap<String, serde_json::Value>,
        wait: bool,
    ) -> Result<ExecutionOutcome> {
        let (valid, errors) = workflow.validate();
        if !valid {
            return Err(AgentFlowError::InvalidWorkflow(errors.join(", ")));
        }

        let mut execution = WorkflowExecution::new(
            workflow,
            self.agent_registry.clone(),
            self.tool_registry.clone(),
            input_data,
        )
        .with_event_bus(self.event_bus.clone());
        if let Some(classifier) = &self.classifier {
            execution = execution.with_classifier(classifier.clone());
        }

        let execution_id = execution.id.clone();
        execution.start(None)?;

        let handle = Arc::new(Mutex::new(execution));
        self.executions.insert(execution_id.clone(), handle.clone());
        info!(execution_id = %execution_id, "registered workflow execution");

        if wait {
            let mut execution = handle.lock().await;
            let results = execution.execute_all().await;
            Ok(ExecutionOutcome::Completed(results))
        } else {
            Ok(ExecutionOutcome::Started(execution_id))
        }
    }

    /// Get a handle to an execution by ID
    pub fn get_execution(&self, execution_id: &str) -> Option<Arc<Mutex<WorkflowExecution>>> {
        self.executions
            .get(execution_id)
            .map(|entry| entry.value().clone())
    }

    /// Snapshot the status of an execution
    pub async fn get_execution_status(&self, execution_id: &str) -> Result<ExecutionStatusReport> {
        let handle = self.get_execution(execution_id).ok_or_else(|| {
            AgentFlowError::ExecutionNotFound {
                id: execution_id.to_string(),
            }
        })?;

        let execution = handle.lock().await;
        Ok(snapshot(&execution))
    }

    /// Cancel an execution
    ///
    /// Returns `true` if canceled, `false` if not found or not running.
    pub async fn cancel_execution(&self, execution_id: &str) -> bool {
        let Some(handle) = self.get_execution(execution_id) else {
            return false;
        };

        let mut execution = handle.lock().await;
        if execution.status != ExecutionStatus::Running {
            return false;
        }
        execution.cancel();
        true
    }

    /// Continue a background execution for a bounded number of steps
    ///
    /// Returns `true` if the execution is still running afterward.
    pub async fn continue_execution(&self, execution_id: &str, max_steps: usize) -> bool {
        let Some(handle) = self.get_execution(execution_id) else {
            return false;
        };

        let mut execution = handle.lock().await;
        if execution.status != ExecutionStatus::Running {
            return false;
        }

        for _ in 0..max_steps {
            if !execution.execute_step().await {
                return false;
            }
        }
        execution.status == ExecutionStatus::Running
    }

    /// Drop finished executions older than `max_age_seconds`
    ///
    /// Running executions are never removed. Returns how many were
    /// dropped.
    pub async fn cleanup_old_executions(&self, max_age_seconds: i64) -> usize {
        let cutoff = Utc::now() - Duration::seconds(max_age_seconds);

        let handles: Vec<(String, Arc<Mutex<WorkflowExecution>>)> = self
            .executions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut to_remove = Vec::new();
        for (execution_id, handle) in handles {
            let execution = handle.lock().await;
            if execution.status == ExecutionStatus::Running {
                continue;
            }
            if let Some(end_time) = execution.end_time {
                if end_time < cutoff {
                    to_remove.push(execution_id);
                }
            }
        }

        let removed = to_remove.len();
        for execution_id in to_remove {
            self.executions.remove(&execution_id);
        }
        if removed > 0 {
            info!(removed, "cleaned up old workflow executions");
        }
        removed
    }

    /// Snapshot every known execution
    pub async fn get_all_executions(&self) -> Vec<ExecutionStatusReport> {
        let handles: Vec<Arc<Mutex<WorkflowExecution>>> = self
            .executions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            let execution = handle.lock().await;
            reports.push(snapshot(&execution));
        }
        reports
    }
}

fn snapshot(execution: &WorkflowExecution) -> ExecutionStatusReport {
    let node_statuses = execution
        .node_executions
        .iter()
        .map(|(node_id, node_execution)| {
            let name = execution
                .workflow
                .get_node(node_id)
                .map(|node| node.name.clone())
                .unwrap_or_default();
            (
                node_id.clone(),
                NodeStatusReport {
                    node_id: node_id.clone(),
                    name,
                    status: node_execution.status,
                    start_time: node_execution.start_time,
                    end_time: node_execution.end_time,
                    error_message: node_execution.error_message.clone(),
                },
            )
        })
        .collect();

    ExecutionStatusReport {
        id: execution.id.clone(),
        status: execution.status,
        start_time: execution.start_time,
        end_time: execution.end_time,
        error_message: execution.error_message.clone(),
        completed_nodes: execution.completed_count(),
        total_nodes: execution.workflow.nodes.len(),
        results: execution.results.clone(),
        node_statuses,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EdgeType, NodeConfig, NodeType, WorkflowNode};
    use serde_json::json;

    fn executor() -> WorkflowExecutor {
        WorkflowExecutor::new(
            Arc::new(AgentRegistry::new()),
            Arc::new(ToolRegistry::new()),
        )
    }

    fn passthrough_workflow() -> Workflow {
        let mut workflow = Workflow::new("passthrough");
        let in_id = workflow.add_node(
            WorkflowNode::new("in", NodeType::Input).with_config("default_value", json!("hi")),
        );
        let out_id = workflow.add_node(
            WorkflowNode::new("out", NodeType::Output).with_config("output_key", json!("result")),
        );
        workflow
            .add_edge(&in_id, &out_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        workflow
    }

    #[tokio::test]
    async fn test_execute_workflow_waits_for_results() {
        let executor = executor();
        let outcome = executor
            .execute_workflow(passthrough_workflow(), HashMap::new(), true)
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Completed(results) => {
                assert_eq!(results.get("result"), Some(&json!("hi")));
            }
            other => panic!("expected completed outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_workflow_is_rejected() {
        let executor = executor();
        let empty = Workflow::new("empty");
        let err = executor
            .execute_workflow(empty, HashMap::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentFlowError::InvalidWorkflow(_)));
    }

    #[tokio::test]
    async fn test_background_execution_lifecycle() {
        let executor = executor();
        let outcome = executor
            .execute_workflow(passthrough_workflow(), HashMap::new(), false)
            .await
            .unwrap();
        let execution_id = match outcome {
            ExecutionOutcome::Started(id) => id,
            other => panic!("expected started outcome, got {:?}", other),
        };

        let report = executor.get_execution_status(&execution_id).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Running);
        assert_eq!(report.total_nodes, 2);

        // Drive it manually; a two-node chain finishes well within ten
        // steps
        let still_running = executor.continue_execution(&execution_id, 10).await;
        assert!(!still_running);

        let report = executor.get_execution_status(&execution_id).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.results.get("result"), Some(&json!("hi")));
        assert!(report
            .node_statuses
            .values()
            .all(|n| n.status == NodeExecutionStatus::Completed));
    }

    #[tokio::test]
    async fn test_cancel_execution() {
        let executor = executor();
        let outcome = executor
            .execute_workflow(passthrough_workflow(), HashMap::new(), false)
            .await
            .unwrap();
        let execution_id = match outcome {
            ExecutionOutcome::Started(id) => id,
            _ => unreachable!(),
        };

        assert!(executor.cancel_execution(&execution_id).await);
        // Second cancel is a no-op
        assert!(!executor.cancel_execution(&execution_id).await);

        let report = executor.get_execution_status(&execution_id).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_status_of_unknown_execution() {
        let executor = executor();
        let err = executor.get_execution_status("ghost").await.unwrap_err();
        assert!(matches!(err, AgentFlowError::ExecutionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_drops_only_old_finished_runs() {
        let executor = executor();
        executor
            .execute_workflow(passthrough_workflow(), HashMap::new(), true)
            .await
            .unwrap();
        let outcome = executor
            .execute_workflow(passthrough_workflow(), HashMap::new(), false)
            .await
            .unwrap();
        let running_id = match outcome {
            ExecutionOutcome::Started(id) => id,
            _ => unreachable!(),
        };

        // Nothing is old enough yet
        assert_eq!(executor.cleanup_old_executions(3600).await, 0);

        // Age the finished run artificially
        for entry in executor.executions.iter() {
            let mut execution = entry.value().lock().await;
            if execution.status != ExecutionStatus::Running {
                execution.end_time = Some(Utc::now() - Duration::seconds(7200));
            }
        }

        assert_eq!(executor.cleanup_old_executions(3600).await, 1);
        assert_eq!(executor.get_all_executions().await.len(), 1);
        assert!(executor.get_execution(&running_id).is_some());
    }
}

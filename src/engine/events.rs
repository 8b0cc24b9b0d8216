// Event system for execution observability

//! # Execution Events
//!
//! This module provides the broadcast event bus that surfaces execution
//! progress to observers (UIs, logs, tests). It handles:
//! - Event emission from the scheduling loop and node handlers
//! - Event subscription via broadcast channels
//!
//! Events are observational only: the scheduler never reads them back,
//! and a bus with no subscribers is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// An event emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A run moved from PENDING to RUNNING
    ExecutionStarted {
        execution_id: String,
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A run completed with its final results
    ExecutionCompleted {
        execution_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A run failed; `error` carries the reason
    ExecutionFailed {
        execution_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A run was canceled by the caller
    ExecutionCanceled {
        execution_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A node began executing
    NodeStarted {
        execution_id: String,
        node_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A node finished successfully
    NodeCompleted {
        execution_id: String,
        node_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A node failed; `error` carries the reason
    NodeFailed {
        execution_id: String,
        node_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A node never became ready and was marked skipped at completion
    NodeSkipped {
        execution_id: String,
        node_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// Event bus for publishing and subscribing to execution events
pub struct ExecutionEventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl ExecutionEventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000); // Buffer up to 1000 events

        Self { sender }
    }

    /// Publish an event to all subscribers
    ///
    /// Send failures mean there are no subscribers, which is fine.
    pub fn publish(&self, event: ExecutionEvent) {
        tracing::debug!(?event, "execution event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Emit an execution started event
    pub fn emit_execution_started(&self, execution_id: &str, workflow_id: &str) {
        self.publish(ExecutionEvent::ExecutionStarted {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Emit an execution completed event
    pub fn emit_execution_completed(&self, execution_id: &str) {
        self.publish(ExecutionEvent::ExecutionCompleted {
            execution_id: execution_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Emit an execution failed event
    pub fn emit_execution_failed(&self, execution_id: &str, error: &str) {
        self.publish(ExecutionEvent::ExecutionFailed {
            execution_id: execution_id.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Emit an execution canceled event
    pub fn emit_execution_canceled(&self, execution_id: &str) {
        self.publish(ExecutionEvent::ExecutionCanceled {
            execution_id: execution_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Emit a node started event
    pub fn emit_node_started(&self, execution_id: &str, node_id: &str) {
        self.publish(ExecutionEvent::NodeStarted {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Emit a node completed event
    pub fn emit_node_completed(&self, execution_id: &str, node_id: &str) {
        self.publish(ExecutionEvent::NodeCompleted {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Emit a node failed event
    pub fn emit_node_failed(&self, execution_id: &str, node_id: &str, error: &str) {
        self.publish(ExecutionEvent::NodeFailed {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Emit a node skipped event
    pub fn emit_node_skipped(&self, execution_id: &str, node_id: &str) {
        self.publish(ExecutionEvent::NodeSkipped {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
        });
    }
}

impl Default for ExecutionEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ExecutionEventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = ExecutionEventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit_node_started("exec-1", "node-1");
        bus.emit_node_completed("exec-1", "node-1");

        match receiver.recv().await.unwrap() {
            ExecutionEvent::NodeStarted {
                execution_id,
                node_id,
                ..
            } => {
                assert_eq!(execution_id, "exec-1");
                assert_eq!(node_id, "node-1");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(matches!(
            receiver.recv().await.unwrap(),
            ExecutionEvent::NodeCompleted { .. }
        ));
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = ExecutionEventBus::new();
        // Should not panic or error with no receivers
        bus.emit_execution_started("exec-1", "wf-1");
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = ExecutionEvent::ExecutionFailed {
            execution_id: "exec-1".to_string(),
            error: "boom".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "execution_failed");
        assert_eq!(json["error"], "boom");
    }
}

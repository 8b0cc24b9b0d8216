// Single-run execution state and the scheduling loop

//! # Workflow Execution
//!
//! This module implements the per-run scheduler. A [`WorkflowExecution`]
//! owns everything mutable about one run: the FIFO queue of pending node
//! IDs, per-node execution state, the completed set, and the accumulated
//! results map.
//!
//! ## Scheduling Loop
//!
//! `execute_step` pops one node from the queue and:
//! 1. Skips it if it already finished (stale queue entries are no-ops)
//! 2. Re-queues it at the tail if any required input has not arrived yet;
//!    this is how join/barrier semantics fall out of a plain FIFO queue
//! 3. Dispatches it to the type-specific handler
//! 4. Fans the output out along every outgoing edge whose routing
//!    predicate accepts, delivering a copy keyed by edge ID
//!
//! Handler failures follow ERROR edges when the node has any; otherwise
//! the whole run fails. `execute_all` drives the loop under a global step
//! cap and a per-node execution cap so cyclic or misbehaving graphs
//! terminate.
//!
//! ## Delivery Ordering
//!
//! Every delivered message is stamped with a monotonic `delivery_seq`
//! metadata counter. Handlers that need "the first input" or "the latest
//! input" order by that counter (with the edge ID as a tiebreak), so input
//! selection is reproducible and never depends on wall-clock resolution
//! or map iteration order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::engine::conditions;
use crate::engine::events::ExecutionEventBus;
use crate::engine::routing::RouterClassifier;
use crate::models::{
    AgentRegistry, EdgeType, MessageValue, NodeConfig, NodeType, ToolRegistry, Workflow,
    WorkflowEdge, WorkflowNode,
};
use crate::{AgentFlowError, Result};

/// Global step cap for a single run
pub const MAX_STEPS: usize = 1000;

/// How many times a single node may execute before being force-completed
///
/// OUTPUT and ROUTER nodes get double this, since they legitimately
/// surface in the queue more often (collectors and fan-out points).
pub const MAX_NODE_EXECUTIONS: u32 = 5;

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

/// Status of a node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Terminal state assigned post-hoc to nodes left PENDING when the
    /// run completes (e.g. branches not taken)
    Skipped,
}

/// Execution state for a single node in the workflow
///
/// Tracks one node's inputs (keyed by the edge ID that delivered them),
/// its output, and its lifecycle within the run.
#[derive(Debug, Clone, Serialize)]
pub struct NodeExecution {
    /// ID of the node being executed
    pub node_id: String,

    /// Accumulated inputs, one slot per incoming edge that has delivered
    pub input_values: HashMap<String, MessageValue>,

    /// Output produced by the node, at most one
    pub output_value: Option<MessageValue>,

    /// Current execution status
    pub status: NodeExecutionStatus,

    /// When execution started
    pub start_time: Option<DateTime<Utc>>,

    /// When execution completed
    pub end_time: Option<DateTime<Utc>>,

    /// Error message if execution failed
    pub error_message: Option<String>,
}

impl NodeExecution {
    fn new(node_id: String) -> Self {
        Self {
            node_id,
            input_values: HashMap::new(),
            output_value: None,
            status: NodeExecutionStatus::Pending,
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }
}

/// Earliest-delivered input, by `delivery_seq` with edge ID tiebreak
pub(crate) fn first_delivered(
    inputs: &HashMap<String, MessageValue>,
) -> Option<&MessageValue> {
    inputs
        .iter()
        .min_by_key(|(edge_id, message)| {
            (
                message.metadata_as_i64("delivery_seq").unwrap_or(i64::MAX),
                (*edge_id).clone(),
            )
        })
        .map(|(_, message)| message)
}

/// Latest-delivered input, by `delivery_seq` with edge ID tiebreak
pub(crate) fn latest_delivered(
    inputs: &HashMap<String, MessageValue>,
) -> Option<&MessageValue> {
    inputs
        .iter()
        .max_by_key(|(edge_id, message)| {
            (
                message.metadata_as_i64("delivery_seq").unwrap_or(i64::MIN),
                (*edge_id).clone(),
            )
        })
        .map(|(_, message)| message)
}

/// Integer config value, tolerating string-encoded numbers
fn config_i64(config: &NodeConfig, key: &str) -> Option<i64> {
    match config.get(key)? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Execution state for a complete workflow run
///
/// One instance per run. The scheduler is sequential within a run, so
/// handler effects and message deliveries are totally ordered.
pub struct WorkflowExecution {
    /// Unique execution identifier
    pub id: String,

    /// The workflow being executed (static during the run)
    pub workflow: Workflow,

    pub(crate) agent_registry: Arc<AgentRegistry>,
    pub(crate) tool_registry: Arc<ToolRegistry>,

    /// Initial input payload, injected into start nodes
    pub input_data: HashMap<String, serde_json::Value>,

    /// Current run status
    pub status: ExecutionStatus,

    /// When the run started
    pub start_time: Option<DateTime<Utc>>,

    /// When the run finished
    pub end_time: Option<DateTime<Utc>>,

    /// Error message if the run failed
    pub error_message: Option<String>,

    /// Per-node execution state, created fresh at run start
    pub node_executions: HashMap<String, NodeExecution>,

    /// Accumulated workflow results
    pub results: HashMap<String, serde_json::Value>,

    /// FIFO queue of node IDs pending execution
    execution_queue: VecDeque<String>,

    /// Nodes that have finished successfully (or were force-completed)
    pub(crate) completed_nodes: HashSet<String>,

    event_bus: ExecutionEventBus,

    /// Classifier used by ROUTER nodes with the "ai" strategy
    pub(crate) classifier: Option<Arc<dyn RouterClassifier>>,

    /// Step cap for `execute_all`, defaults to [`MAX_STEPS`]
    pub max_steps: usize,

    /// Per-node execution cap, defaults to [`MAX_NODE_EXECUTIONS`]
    pub max_node_executions: u32,

    /// Monotonic counter stamped into delivered messages
    delivery_counter: u64,

    /// Per-node execution counts for loop detection
    node_execution_counts: HashMap<String, u32>,
}

impl WorkflowExecution {
    /// Create a new execution for a workflow
    pub fn new(
        workflow: Workflow,
        agent_registry: Arc<AgentRegistry>,
        tool_registry: Arc<ToolRegistry>,
        input_data: HashMap<String, serde_json::Value>,
    ) -> Self {
        let node_executions = workflow
            .nodes
            .keys()
            .map(|node_id| (node_id.clone(), NodeExecution::new(node_id.clone())))
            .collect();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow,
            agent_registry,
            tool_registry,
            input_data,
            status: ExecutionStatus::Pending,
            start_time: None,
            end_time: None,
            error_message: None,
            node_executions,
            results: HashMap::new(),
            execution_queue: VecDeque::new(),
            completed_nodes: HashSet::new(),
            event_bus: ExecutionEventBus::new(),
            classifier: None,
            max_steps: MAX_STEPS,
            max_node_executions: MAX_NODE_EXECUTIONS,
            delivery_counter: 0,
            node_execution_counts: HashMap::new(),
        }
    }

    /// Attach a shared event bus, builder-style
    pub fn with_event_bus(mut self, event_bus: ExecutionEventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Attach an AI router classifier, builder-style
    pub fn with_classifier(mut self, classifier: Arc<dyn RouterClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Number of nodes that have finished
    pub fn completed_count(&self) -> usize {
        self.completed_nodes.len()
    }

    fn next_delivery_seq(&mut self) -> u64 {
        self.delivery_counter += 1;
        self.delivery_counter
    }

    /// Start the workflow execution
    ///
    /// Resets all per-run state, seeds the queue with start nodes (sorted
    /// by ID for reproducible scheduling over the unordered node map), and
    /// injects the initial input payload into every start node under the
    /// reserved `"input"` slot.
    pub fn start(
        &mut self,
        input_data: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<()> {
        if let Some(input_data) = input_data {
            self.input_data = input_data;
        }

        self.status = ExecutionStatus::Running;
        self.start_time = Some(Utc::now());
        self.end_time = None;
        self.error_message = None;
        self.completed_nodes.clear();
        self.results.clear();
        self.delivery_counter = 0;
        self.node_executions = self
            .workflow
            .nodes
            .keys()
            .map(|node_id| (node_id.clone(), NodeExecution::new(node_id.clone())))
            .collect();

        let mut start_ids: Vec<String> = self
            .workflow
            .get_start_nodes()
            .iter()
            .map(|node| node.id.clone())
            .collect();
        if start_ids.is_empty() {
            self.status = ExecutionStatus::Failed;
            self.error_message = Some("Workflow has no start nodes".to_string());
            return Err(AgentFlowError::Execution(
                "Workflow has no start nodes".to_string(),
            ));
        }
        start_ids.sort();
        self.execution_queue = start_ids.iter().cloned().collect();

        if !self.input_data.is_empty() {
            let payload =
                serde_json::Value::Object(self.input_data.clone().into_iter().collect());
            for node_id in &start_ids {
                let seq = self.next_delivery_seq();
                let message = MessageValue::new(payload.clone(), "json", None)
                    .with_metadata("delivery_seq", json!(seq));
                if let Some(execution) = self.node_executions.get_mut(node_id) {
                    execution.input_values.insert("input".to_string(), message);
                }
            }
        }

        self.event_bus
            .emit_execution_started(&self.id, &self.workflow.id);
        info!(
            execution_id = %self.id,
            workflow = %self.workflow.name,
            "started workflow execution"
        );
        Ok(())
    }

    /// Execute the next step in the workflow
    ///
    /// Returns `true` if a step was taken (including no-op steps like
    /// re-queueing a not-yet-ready node), `false` if the run cannot make
    /// progress: it is not RUNNING, the queue is empty, or the step
    /// transitioned the run to a terminal state.
    pub async fn execute_step(&mut self) -> bool {
        if self.status != ExecutionStatus::Running {
            return false;
        }

        if self.execution_queue.is_empty() {
            // The run completes only when every node has finished; a
            // drained queue with untouched branches leaves it RUNNING and
            // the caller decides what to do.
            if self.completed_nodes.len() == self.workflow.nodes.len() {
                self.status = ExecutionStatus::Completed;
                self.end_time = Some(Utc::now());

                let mut named_outputs = Vec::new();
                for (node_id, node) in &self.workflow.nodes {
                    if node.node_type == NodeType::Output
                        && self.completed_nodes.contains(node_id)
                    {
                        if let Some(output) = self
                            .node_executions
                            .get(node_id)
                            .and_then(|execution| execution.output_value.as_ref())
                        {
                            named_outputs.push((node.name.clone(), output.content.clone()));
                        }
                    }
                }
                for (name, content) in named_outputs {
                    self.results.insert(name, content);
                }

                self.event_bus.emit_execution_completed(&self.id);
                info!(execution_id = %self.id, "workflow execution completed");
            }
            return false;
        }

        let Some(node_id) = self.execution_queue.pop_front() else {
            return false;
        };
        let node = match self.workflow.get_node(&node_id) {
            Some(node) => node.clone(),
            None => {
                warn!(node_id = %node_id, "queued node not found in workflow");
                return false;
            }
        };

        let node_status = self
            .node_executions
            .get(&node_id)
            .map(|execution| execution.status)
            .unwrap_or(NodeExecutionStatus::Pending);
        if matches!(
            node_status,
            NodeExecutionStatus::Completed | NodeExecutionStatus::Failed
        ) {
            // Stale queue entry
            return true;
        }

        // Join semantics: every required input edge must have delivered
        let required = self.required_inputs(&node);
        let available: HashSet<String> = self
            .node_executions
            .get(&node_id)
            .map(|execution| execution.input_values.keys().cloned().collect())
            .unwrap_or_default();
        if !required.is_subset(&available) {
            debug!(node = %node.name, "inputs not ready, re-queueing");
            self.execution_queue.push_back(node_id);
            return true;
        }

        if let Some(execution) = self.node_executions.get_mut(&node_id) {
            execution.status = NodeExecutionStatus::Running;
            execution.start_time = Some(Utc::now());
        }
        self.event_bus.emit_node_started(&self.id, &node_id);

        match self.dispatch_node(&node).await {
            Ok(()) => {
                if let Some(execution) = self.node_executions.get_mut(&node_id) {
                    execution.status = NodeExecutionStatus::Completed;
                    execution.end_time = Some(Utc::now());
                }
                self.completed_nodes.insert(node_id.clone());
                self.event_bus.emit_node_completed(&self.id, &node_id);
                info!(node = %node.name, node_id = %node_id, "node executed");

                let output = self
                    .node_executions
                    .get(&node_id)
                    .and_then(|execution| execution.output_value.clone());
                self.fan_out(&node, output);
                true
            }
            Err(err) => self.handle_node_failure(&node, err),
        }
    }

    /// Deliver a node's output along every eligible outgoing edge
    fn fan_out(&mut self, node: &WorkflowNode, output: Option<MessageValue>) {
        for edge_id in node.outgoing_edges.clone() {
            let edge = match self.workflow.get_edge(&edge_id) {
                Some(edge) => edge.clone(),
                None => continue,
            };
            if !self.should_follow_edge(&edge, output.as_ref()) {
                continue;
            }
            let Some(output) = output.as_ref() else {
                continue;
            };

            let target_id = edge.target_node_id.clone();
            let Some(target_type) = self.workflow.get_node(&target_id).map(|n| n.node_type)
            else {
                continue;
            };

            let seq = self.next_delivery_seq();

            if target_type == NodeType::Output {
                // OUTPUT nodes accumulate inputs across turns: deliver a
                // fresh copy, then queue the node even while other inputs
                // are still arriving
                let already_queued = self.execution_queue.contains(&target_id);
                let already_completed = self.completed_nodes.contains(&target_id);

                let Some(target_execution) = self.node_executions.get_mut(&target_id) else {
                    continue;
                };
                if target_execution.input_values.contains_key(&edge.id) {
                    warn!(edge_id = %edge.id, "duplicate delivery to output node, keeping first");
                    continue;
                }

                let mut copy = MessageValue::new(
                    output.content.clone(),
                    output.content_type.clone(),
                    Some(node.id.clone()),
                );
                copy.metadata = output.metadata.clone();
                copy.metadata
                    .insert("edge_arrival_time".to_string(), json!(Utc::now().to_rfc3339()));
                copy.metadata.insert("delivery_seq".to_string(), json!(seq));
                target_execution.input_values.insert(edge.id.clone(), copy);

                if !already_queued && !already_completed {
                    self.execution_queue.push_back(target_id);
                }
            } else if !self.completed_nodes.contains(&target_id) {
                if !self.execution_queue.contains(&target_id) {
                    self.execution_queue.push_back(target_id.clone());
                }

                let mut copy = MessageValue::new(
                    output.content.clone(),
                    output.content_type.clone(),
                    output.source_node_id.clone(),
                );
                copy.metadata = output.metadata.clone();
                copy.metadata.insert("delivery_seq".to_string(), json!(seq));

                let Some(target_execution) = self.node_executions.get_mut(&target_id) else {
                    continue;
                };
                // First delivery on an edge wins
                if target_execution.input_values.contains_key(&edge.id) {
                    warn!(edge_id = %edge.id, "duplicate delivery, keeping first");
                } else {
                    target_execution.input_values.insert(edge.id.clone(), copy);
                }
            } else {
                debug!(target_id = %target_id, "skipping delivery to completed node");
            }
        }
    }

    /// Handle a node dispatch failure: follow ERROR edges if the node has
    /// any, otherwise fail the whole run
    fn handle_node_failure(&mut self, node: &WorkflowNode, err: AgentFlowError) -> bool {
        let reason = err.to_string();

        if let Some(execution) = self.node_executions.get_mut(&node.id) {
            execution.status = NodeExecutionStatus::Failed;
            execution.end_time = Some(Utc::now());
            execution.error_message = Some(reason.clone());
        }
        self.event_bus.emit_node_failed(&self.id, &node.id, &reason);
        warn!(node = %node.name, error = %reason, "node execution failed");

        let mut has_error_edges = false;
        for edge_id in node.outgoing_edges.clone() {
            let edge = match self.workflow.get_edge(&edge_id) {
                Some(edge) => edge.clone(),
                None => continue,
            };
            if edge.edge_type != EdgeType::Error {
                continue;
            }
            has_error_edges = true;

            let target_id = edge.target_node_id.clone();
            if !self.completed_nodes.contains(&target_id)
                && !self.execution_queue.contains(&target_id)
            {
                self.execution_queue.push_back(target_id.clone());
            }

            let seq = self.next_delivery_seq();
            let message = MessageValue::text(reason.clone(), Some(node.id.clone()))
                .with_metadata("error", json!(true))
                .with_metadata("delivery_seq", json!(seq));
            if let Some(target_execution) = self.node_executions.get_mut(&target_id) {
                target_execution.input_values.insert(edge.id.clone(), message);
            }
        }

        if !has_error_edges {
            self.status = ExecutionStatus::Failed;
            self.error_message = Some(format!("Node {} failed: {}", node.name, reason));
            self.end_time = Some(Utc::now());
            self.event_bus.emit_execution_failed(
                &self.id,
                self.error_message.as_deref().unwrap_or(&reason),
            );
            return false;
        }
        true
    }

    /// Execute the workflow until completion or a cap is hit
    ///
    /// Runs the step loop under [`MAX_STEPS`] and the per-node execution
    /// cap, harvests OUTPUT-node values, and returns the results map
    /// (possibly partial if the run failed or stalled).
    pub async fn execute_all(&mut self) -> HashMap<String, serde_json::Value> {
        if self.status == ExecutionStatus::Pending {
            if let Err(err) = self.start(None) {
                warn!(error = %err, "failed to start workflow execution");
                return self.results.clone();
            }
        }

        let mut steps = 0usize;
        self.node_execution_counts = self
            .workflow
            .nodes
            .keys()
            .map(|node_id| (node_id.clone(), 0))
            .collect();

        while self.status == ExecutionStatus::Running && steps < self.max_steps {
            let next_node_id = self.execution_queue.front().cloned();

            if let Some(node_id) = &next_node_id {
                let node_type = self.workflow.get_node(node_id).map(|n| n.node_type);
                // Collectors and fan-out points legitimately re-enter the
                // queue more often
                let limit = match node_type {
                    Some(NodeType::Output) | Some(NodeType::Router) => {
                        self.max_node_executions * 2
                    }
                    _ => self.max_node_executions,
                };
                let count = self
                    .node_execution_counts
                    .get(node_id)
                    .copied()
                    .unwrap_or(0);
                if count >= limit {
                    warn!(
                        node_id = %node_id,
                        limit,
                        "per-node execution cap reached, force-completing to break loop"
                    );
                    self.completed_nodes.insert(node_id.clone());
                    let node_id = node_id.clone();
                    self.execution_queue.retain(|id| id != &node_id);
                    continue;
                }
            }

            if !self.execute_step().await {
                break;
            }

            if let Some(node_id) = next_node_id {
                *self.node_execution_counts.entry(node_id).or_insert(0) += 1;
            }
            steps += 1;
        }

        // Harvest OUTPUT values even when the run terminated early
        self.harvest_final_outputs();

        if steps >= self.max_steps && self.status == ExecutionStatus::Running {
            self.status = ExecutionStatus::Failed;
            self.error_message = Some("Exceeded maximum execution steps".to_string());
            self.end_time = Some(Utc::now());
            self.event_bus
                .emit_execution_failed(&self.id, "Exceeded maximum execution steps");
        } else if self.status == ExecutionStatus::Completed {
            let pending: Vec<String> = self
                .node_executions
                .iter()
                .filter(|(_, execution)| execution.status == NodeExecutionStatus::Pending)
                .map(|(node_id, _)| node_id.clone())
                .collect();
            for node_id in pending {
                if let Some(execution) = self.node_executions.get_mut(&node_id) {
                    execution.status = NodeExecutionStatus::Skipped;
                }
                self.event_bus.emit_node_skipped(&self.id, &node_id);
            }
        }

        self.results.clone()
    }

    /// Collect results from every OUTPUT node
    ///
    /// A node that produced an output contributes its content under its
    /// `output_key`; one that only accumulated inputs (the loop ended
    /// before its turn) contributes its earliest input as a fallback.
    fn harvest_final_outputs(&mut self) {
        let output_nodes: Vec<(String, String)> = self
            .workflow
            .nodes
            .values()
            .filter(|node| node.node_type == NodeType::Output)
            .map(|node| {
                let output_key = node
                    .config
                    .get("output_key")
                    .and_then(|v| v.as_str())
                    .unwrap_or("output")
                    .to_string();
                (node.id.clone(), output_key)
            })
            .collect();

        for (node_id, output_key) in output_nodes {
            let Some(execution) = self.node_executions.get(&node_id) else {
                continue;
            };

            if let Some(output) = &execution.output_value {
                self.results.insert(output_key, output.content.clone());
            } else if let Some(message) = first_delivered(&execution.input_values) {
                let mut content = message.content.clone();
                if let serde_json::Value::Object(map) = &content {
                    if let Some(inner) = map.get("content") {
                        content = inner.clone();
                    } else if let Some(text) = map.get("text") {
                        content = text.clone();
                    }
                }
                self.results.insert(output_key, content);
            }
        }
    }

    /// Cancel the workflow execution
    pub fn cancel(&mut self) {
        if self.status == ExecutionStatus::Running {
            self.status = ExecutionStatus::Canceled;
            self.end_time = Some(Utc::now());
            self.event_bus.emit_execution_canceled(&self.id);
            info!(execution_id = %self.id, "workflow execution canceled");
        }
    }

    /// Required input edge IDs for a node
    ///
    /// All incoming edges by default; CONDITIONAL nodes may narrow this
    /// via a `required_inputs` config list.
    fn required_inputs(&self, node: &WorkflowNode) -> HashSet<String> {
        let mut required: HashSet<String> = node.incoming_edges.iter().cloned().collect();

        if node.node_type == NodeType::Conditional {
            if let Some(ids) = node.config.get("required_inputs").and_then(|v| v.as_array()) {
                let wanted: HashSet<&str> = ids.iter().filter_map(|v| v.as_str()).collect();
                if !wanted.is_empty() {
                    required.retain(|edge_id| wanted.contains(edge_id.as_str()));
                }
            }
        }

        required
    }

    /// Decide whether an outgoing edge should be followed
    ///
    /// Pure routing predicate over the edge and the source node's output:
    /// - DATA / SUCCESS: always
    /// - ERROR: never (failures are routed separately)
    /// - CONDITION_TRUE / CONDITION_FALSE: evaluate the edge condition
    ///   against the output, negated for the FALSE edge; no output means
    ///   no match
    /// - ROUTE_OUTPUT: exact match between the edge's `port_number` and
    ///   the `selected_port` the router stamped into metadata; anything
    ///   missing or malformed fails closed
    pub fn should_follow_edge(
        &self,
        edge: &WorkflowEdge,
        output: Option<&MessageValue>,
    ) -> bool {
        match edge.edge_type {
            EdgeType::Data | EdgeType::Success => true,
            EdgeType::Error => false,
            EdgeType::ConditionTrue | EdgeType::ConditionFalse => {
                let Some(output) = output else {
                    return false;
                };
                let result = evaluate_edge_condition(&edge.config, output);
                if edge.edge_type == EdgeType::ConditionTrue {
                    result
                } else {
                    !result
                }
            }
            EdgeType::RouteOutput => {
                let Some(output) = output else {
                    warn!(edge_id = %edge.id, "route edge has no output value");
                    return false;
                };

                let edge_port = config_i64(&edge.config, "port_number").unwrap_or(-1);
                if edge_port < 0 {
                    warn!(edge_id = %edge.id, "route edge has no valid port_number");
                    return false;
                }

                let selected_port = output.metadata_as_i64("selected_port").unwrap_or(-1);
                if selected_port < 0 {
                    warn!(edge_id = %edge.id, "no valid selected_port in metadata");
                    return false;
                }

                let is_match = edge_port == selected_port;
                debug!(
                    edge_id = %edge.id,
                    edge_port,
                    selected_port,
                    is_match,
                    "route edge check"
                );
                is_match
            }
        }
    }
}

/// Evaluate an edge condition config against a message
///
/// Config: `type` (default "contains") and `target` (default ""). Errors
/// (bad regex, unknown type) fail closed.
fn evaluate_edge_condition(config: &NodeConfig, message: &MessageValue) -> bool {
    let condition_type = config
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("contains");
    let target = config.get("target").and_then(|v| v.as_str()).unwrap_or("");
    let text = message.content_as_text();

    match conditions::matches_condition(condition_type, target, &text) {
        Ok(result) => result,
        Err(err) => {
            warn!(error = %err, "edge condition failed, not following");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::ExecutionEvent;
    use crate::models::{AgentDefinition, ToolDefinition};
    use serde_json::json;

    fn registries() -> (Arc<AgentRegistry>, Arc<ToolRegistry>) {
        (
            Arc::new(AgentRegistry::new()),
            Arc::new(ToolRegistry::new()),
        )
    }

    fn node(name: &str, node_type: NodeType) -> WorkflowNode {
        WorkflowNode::new(name, node_type)
    }

    #[tokio::test]
    async fn test_linear_extract_flow() {
        let mut workflow = Workflow::new("extract");
        let in_id = workflow.add_node(node("in", NodeType::Input));
        let transform_id = workflow.add_node(
            node("pick", NodeType::Transform)
                .with_config("transform_type", json!("extract"))
                .with_config("transform_config", json!({"field_path": "value"})),
        );
        let out_id = workflow.add_node(
            node("out", NodeType::Output).with_config("output_key", json!("result")),
        );
        workflow
            .add_edge(&in_id, &transform_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        workflow
            .add_edge(&transform_id, &out_id, EdgeType::Data, NodeConfig::new())
            .unwrap();

        let (agents, tools) = registries();
        let mut input = HashMap::new();
        input.insert("value".to_string(), json!(42));

        let mut execution = WorkflowExecution::new(workflow, agents, tools, input);
        let results = execution.execute_all().await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(results.get("result"), Some(&json!(42)));
        // Completion also records the output under the node's name
        assert_eq!(results.get("out"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_join_waits_for_all_inputs() {
        // a --> c(OUTPUT) and b --> d(TRANSFORM) --> c: with ids sorted,
        // c is popped before d has delivered and must be re-queued
        let mut workflow = Workflow::new("diamond");
        let a = workflow.add_node(
            node("a", NodeType::Input)
                .with_id("a")
                .with_config("default_value", json!("a")),
        );
        let b = workflow.add_node(
            node("b", NodeType::Input)
                .with_id("b")
                .with_config("default_value", json!("b")),
        );
        let c = workflow.add_node(
            node("c", NodeType::Output)
                .with_id("c")
                .with_config("output_key", json!("result")),
        );
        let d = workflow.add_node(
            node("d", NodeType::Transform)
                .with_id("d")
                .with_config("transform_type", json!("template"))
                .with_config("transform_config", json!({"template": "D:${input}"})),
        );
        workflow.add_edge(&a, &c, EdgeType::Data, NodeConfig::new()).unwrap();
        workflow.add_edge(&b, &d, EdgeType::Data, NodeConfig::new()).unwrap();
        workflow.add_edge(&d, &c, EdgeType::Data, NodeConfig::new()).unwrap();

        let (agents, tools) = registries();
        let mut execution = WorkflowExecution::new(workflow, agents, tools, HashMap::new());
        let results = execution.execute_all().await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        // The output node picks the latest-delivered input, which is the
        // transformed one
        assert_eq!(results.get("result"), Some(&json!("D:b")));
        let c_execution = &execution.node_executions["c"];
        assert_eq!(c_execution.status, NodeExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_conditional_branch_exclusivity() {
        let mut workflow = Workflow::new("branch");
        let in_id = workflow.add_node(
            node("in", NodeType::Input).with_config("default_value", json!("urgent: fix now")),
        );
        let cond_id = workflow.add_node(
            node("check", NodeType::Conditional)
                .with_config("condition_type", json!("contains"))
                .with_config("condition_value", json!("urgent")),
        );
        let out_true = workflow.add_node(
            node("out_true", NodeType::Output).with_config("output_key", json!("true_path")),
        );
        let out_false = workflow.add_node(
            node("out_false", NodeType::Output).with_config("output_key", json!("false_path")),
        );
        workflow
            .add_edge(&in_id, &cond_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        let mut edge_config = NodeConfig::new();
        edge_config.insert("type".to_string(), json!("contains"));
        edge_config.insert("target".to_string(), json!("true"));
        workflow
            .add_edge(&cond_id, &out_true, EdgeType::ConditionTrue, edge_config.clone())
            .unwrap();
        workflow
            .add_edge(&cond_id, &out_false, EdgeType::ConditionFalse, edge_config)
            .unwrap();

        let (agents, tools) = registries();
        let mut execution = WorkflowExecution::new(workflow, agents, tools, HashMap::new());
        let results = execution.execute_all().await;

        assert_eq!(results.get("true_path"), Some(&json!(true)));
        assert!(!results.contains_key("false_path"));
        // The untaken branch never became ready, so the run stays open
        assert_eq!(execution.status, ExecutionStatus::Running);
        let skipped: Vec<_> = execution
            .node_executions
            .values()
            .filter(|e| e.status == NodeExecutionStatus::Pending)
            .collect();
        assert_eq!(skipped.len(), 1);
    }

    #[tokio::test]
    async fn test_conditional_required_inputs_narrowing() {
        // "check" has two incoming edges but only names the one from "in"
        // as required, so it must dispatch before "late" ever delivers
        let mut workflow = Workflow::new("narrowed-join");
        let in_id = workflow.add_node(
            node("in", NodeType::Input).with_config("default_value", json!("go")),
        );
        let check_id = workflow.add_node(
            node("check", NodeType::Conditional).with_config("condition_type", json!("always")),
        );
        let late_id = workflow.add_node(node("late", NodeType::Transform));
        let out_id = workflow.add_node(
            node("out", NodeType::Output).with_config("output_key", json!("verdict")),
        );
        let required_edge = workflow
            .add_edge(&in_id, &check_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        // Back-edge from downstream: without narrowing, "check" would
        // starve waiting on a delivery that needs "check" to run first
        workflow
            .add_edge(&check_id, &late_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        workflow
            .add_edge(&late_id, &check_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        let mut edge_config = NodeConfig::new();
        edge_config.insert("type".to_string(), json!("contains"));
        edge_config.insert("target".to_string(), json!("true"));
        workflow
            .add_edge(&check_id, &out_id, EdgeType::ConditionTrue, edge_config)
            .unwrap();

        let check = workflow.nodes.get_mut(&check_id).unwrap();
        check
            .config
            .insert("required_inputs".to_string(), json!([required_edge]));

        let (agents, tools) = registries();
        let mut execution = WorkflowExecution::new(workflow, agents, tools, HashMap::new());
        let results = execution.execute_all().await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(results.get("verdict"), Some(&json!(true)));
        // Narrowing let the conditional actually run, not get
        // force-completed by the loop guard
        let check_execution = &execution.node_executions[&check_id];
        assert_eq!(check_execution.status, NodeExecutionStatus::Completed);
        assert_eq!(
            check_execution.output_value.as_ref().unwrap().content,
            json!(true)
        );
    }

    #[tokio::test]
    async fn test_router_port_exclusivity() {
        let mut workflow = Workflow::new("routed");
        let in_id = workflow.add_node(
            node("in", NodeType::Input).with_config("default_value", json!("please bill me")),
        );
        let router_id = workflow.add_node(
            node("router", NodeType::Router)
                .with_config("routingStrategy", json!("keyword"))
                .with_config("outputPorts", json!(2))
                .with_config(
                    "keywordPatterns",
                    json!([{"keyword": "bill", "port": 1}]),
                ),
        );
        let out_billing = workflow.add_node(
            node("billing", NodeType::Output).with_config("output_key", json!("billing")),
        );
        let out_other = workflow.add_node(
            node("other", NodeType::Output).with_config("output_key", json!("other")),
        );
        workflow
            .add_edge(&in_id, &router_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        let mut port0 = NodeConfig::new();
        port0.insert("port_number".to_string(), json!(0));
        let mut port1 = NodeConfig::new();
        port1.insert("port_number".to_string(), json!(1));
        workflow
            .add_edge(&router_id, &out_other, EdgeType::RouteOutput, port0)
            .unwrap();
        workflow
            .add_edge(&router_id, &out_billing, EdgeType::RouteOutput, port1)
            .unwrap();

        let (agents, tools) = registries();
        let mut execution = WorkflowExecution::new(workflow, agents, tools, HashMap::new());
        let results = execution.execute_all().await;

        assert_eq!(results.get("billing"), Some(&json!("please bill me")));
        assert!(!results.contains_key("other"));

        let router_output = execution.node_executions[&router_id]
            .output_value
            .as_ref()
            .unwrap();
        assert_eq!(router_output.metadata_as_i64("selected_port"), Some(1));
    }

    #[tokio::test]
    async fn test_error_edge_absorbs_failure() {
        let (agents, tools) = registries();
        tools
            .register(
                ToolDefinition::custom("explode", |_| {
                    Err(AgentFlowError::Tool("boom".to_string()))
                })
                .with_id("explode"),
            )
            .await;

        let mut workflow = Workflow::new("error-handled");
        let in_id = workflow.add_node(
            node("in", NodeType::Input).with_config("default_value", json!("go")),
        );
        let tool_id = workflow.add_node(
            node("risky", NodeType::Tool).with_config("tool_id", json!("explode")),
        );
        let out_id = workflow.add_node(
            node("report", NodeType::Output).with_config("output_key", json!("error_report")),
        );
        workflow
            .add_edge(&in_id, &tool_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        workflow
            .add_edge(&tool_id, &out_id, EdgeType::Error, NodeConfig::new())
            .unwrap();

        let mut execution = WorkflowExecution::new(workflow, agents, tools, HashMap::new());
        let results = execution.execute_all().await;

        // The failure was absorbed by the error edge, not the run
        assert_ne!(execution.status, ExecutionStatus::Failed);
        let report = results.get("error_report").and_then(|v| v.as_str()).unwrap();
        assert!(report.contains("boom"));
        assert_eq!(
            execution.node_executions[&tool_id].status,
            NodeExecutionStatus::Failed
        );
        let delivered = execution.node_executions[&out_id]
            .output_value
            .as_ref()
            .unwrap();
        assert_eq!(delivered.metadata.get("is_final_output"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_failure_without_error_edges_fails_run() {
        let (agents, tools) = registries();
        tools
            .register(
                ToolDefinition::custom("explode", |_| {
                    Err(AgentFlowError::Tool("boom".to_string()))
                })
                .with_id("explode"),
            )
            .await;

        let mut workflow = Workflow::new("unhandled");
        let in_id = workflow.add_node(
            node("in", NodeType::Input).with_config("default_value", json!("go")),
        );
        let tool_id = workflow.add_node(
            node("risky", NodeType::Tool).with_config("tool_id", json!("explode")),
        );
        workflow
            .add_edge(&in_id, &tool_id, EdgeType::Data, NodeConfig::new())
            .unwrap();

        let mut execution = WorkflowExecution::new(workflow, agents, tools, HashMap::new());
        execution.execute_all().await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        let message = execution.error_message.unwrap();
        assert!(message.contains("risky"));
        assert!(message.contains("boom"));
    }

    #[tokio::test]
    async fn test_agent_node_end_to_end() {
        let (agents, tools) = registries();
        agents
            .register(
                AgentDefinition::custom("shout", |text| Ok(text.to_uppercase()))
                    .with_id("shout"),
            )
            .await;

        let mut workflow = Workflow::new("agent-flow");
        let in_id = workflow.add_node(
            node("in", NodeType::Input).with_config("default_value", json!("hello")),
        );
        let agent_id = workflow.add_node(
            node("ask", NodeType::Agent).with_config("agent_id", json!("shout")),
        );
        let out_id = workflow.add_node(
            node("out", NodeType::Output).with_config("output_key", json!("reply")),
        );
        workflow
            .add_edge(&in_id, &agent_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        workflow
            .add_edge(&agent_id, &out_id, EdgeType::Data, NodeConfig::new())
            .unwrap();

        let mut execution = WorkflowExecution::new(workflow, agents, tools, HashMap::new());
        let results = execution.execute_all().await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(results.get("reply"), Some(&json!("HELLO")));
        assert_eq!(results.get("out"), Some(&json!("HELLO")));
    }

    #[tokio::test]
    async fn test_per_node_cap_breaks_starved_join() {
        // "join" needs an input from a node that will never deliver, so
        // it re-queues until the per-node cap force-completes it
        let mut workflow = Workflow::new("starved");
        let in_id = workflow.add_node(
            node("in", NodeType::Input)
                .with_id("in")
                .with_config("default_value", json!("x")),
        );
        let join_id = workflow.add_node(node("join", NodeType::Transform).with_id("join"));
        workflow
            .add_edge(&in_id, &join_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        // Second incoming edge from a node that never runs (cycle back
        // from the join's own downstream)
        let sink_id = workflow.add_node(node("sink", NodeType::Transform).with_id("sink"));
        workflow
            .add_edge(&join_id, &sink_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        workflow
            .add_edge(&sink_id, &join_id, EdgeType::Data, NodeConfig::new())
            .unwrap();

        let (agents, tools) = registries();
        let mut execution = WorkflowExecution::new(workflow, agents, tools, HashMap::new());
        execution.execute_all().await;

        // Terminated well under the global cap, with the starved node
        // force-completed but never actually executed
        assert!(execution.completed_nodes.contains("join"));
        assert_eq!(
            execution.node_executions["join"].status,
            NodeExecutionStatus::Pending
        );
        assert_ne!(execution.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_force_completed_node_marked_skipped_on_completion() {
        // A self-loop starves "t" until the per-node cap force-completes
        // it; with every node then accounted for, the run completes and
        // the never-executed node is marked skipped after the fact
        let mut workflow = Workflow::new("self-starved");
        let in_id = workflow.add_node(
            node("in", NodeType::Input)
                .with_id("in")
                .with_config("default_value", json!("x")),
        );
        let loop_id = workflow.add_node(node("t", NodeType::Transform).with_id("t"));
        workflow
            .add_edge(&in_id, &loop_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        workflow
            .add_edge(&loop_id, &loop_id, EdgeType::Data, NodeConfig::new())
            .unwrap();

        let event_bus = ExecutionEventBus::new();
        let mut events = event_bus.subscribe();

        let (agents, tools) = registries();
        let mut execution = WorkflowExecution::new(workflow, agents, tools, HashMap::new())
            .with_event_bus(event_bus);
        execution.execute_all().await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(
            execution.node_executions["t"].status,
            NodeExecutionStatus::Skipped
        );

        let mut saw_skip = false;
        while let Ok(event) = events.try_recv() {
            if let ExecutionEvent::NodeSkipped { node_id, .. } = event {
                assert_eq!(node_id, "t");
                saw_skip = true;
            }
        }
        assert!(saw_skip);
    }

    #[tokio::test]
    async fn test_step_cap_fails_run() {
        // Same starved-join shape, but with the step budget tightened
        // below the per-node cap so the global guard fires first
        let mut workflow = Workflow::new("budgeted");
        let in_id = workflow.add_node(
            node("in", NodeType::Input)
                .with_id("in")
                .with_config("default_value", json!("x")),
        );
        let join_id = workflow.add_node(node("join", NodeType::Transform).with_id("join"));
        let sink_id = workflow.add_node(node("sink", NodeType::Transform).with_id("sink"));
        workflow
            .add_edge(&in_id, &join_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        workflow
            .add_edge(&join_id, &sink_id, EdgeType::Data, NodeConfig::new())
            .unwrap();
        workflow
            .add_edge(&sink_id, &join_id, EdgeType::Data, NodeConfig::new())
            .unwrap();

        let (agents, tools) = registries();
        let mut execution = WorkflowExecution::new(workflow, agents, tools, HashMap::new());
        execution.max_steps = 3;
        execution.execute_all().await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            execution.error_message.as_deref(),
            Some("Exceeded maximum execution steps")
        );
        assert!(execution.end_time.is_some());
    }

    #[tokio::test]
    async fn test_first_delivery_on_edge_wins() {
        let mut workflow = Workflow::new("idempotent");
        let in_id = workflow.add_node(
            node("in", NodeType::Input).with_config("default_value", json!("new")),
        );
        let transform_id = workflow.add_node(node("t", NodeType::Transform));
        let edge_id = workflow
            .add_edge(&in_id, &transform_id, EdgeType::Data, NodeConfig::new())
            .unwrap();

        let (agents, tools) = registries();
        let mut execution = WorkflowExecution::new(workflow, agents, tools, HashMap::new());
        execution.start(None).unwrap();

        // Pretend the edge already delivered once
        execution
            .node_executions
            .get_mut(&transform_id)
            .unwrap()
            .input_values
            .insert(
                edge_id.clone(),
                MessageValue::text("original", None).with_metadata("delivery_seq", json!(1)),
            );

        // Runs "in", whose fan-out must not overwrite the existing slot
        assert!(execution.execute_step().await);
        let stored = &execution.node_executions[&transform_id].input_values[&edge_id];
        assert_eq!(stored.content, json!("original"));
    }

    #[tokio::test]
    async fn test_cancel_stops_stepping() {
        let mut workflow = Workflow::new("cancelable");
        workflow.add_node(
            node("in", NodeType::Input).with_config("default_value", json!("x")),
        );

        let (agents, tools) = registries();
        let mut execution = WorkflowExecution::new(workflow, agents, tools, HashMap::new());
        execution.start(None).unwrap();
        execution.cancel();

        assert_eq!(execution.status, ExecutionStatus::Canceled);
        assert!(!execution.execute_step().await);
        assert!(execution.end_time.is_some());
    }

    #[tokio::test]
    async fn test_start_requires_start_nodes() {
        let mut workflow = Workflow::new("loop-only");
        let a = workflow.add_node(node("a", NodeType::Transform));
        let b = workflow.add_node(node("b", NodeType::Transform));
        workflow.add_edge(&a, &b, EdgeType::Data, NodeConfig::new()).unwrap();
        workflow.add_edge(&b, &a, EdgeType::Data, NodeConfig::new()).unwrap();

        let (agents, tools) = registries();
        let mut execution = WorkflowExecution::new(workflow, agents, tools, HashMap::new());
        assert!(execution.start(None).is_err());
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_first_and_latest_delivered_ordering() {
        let mut inputs = HashMap::new();
        inputs.insert(
            "edge-b".to_string(),
            MessageValue::text("second", None).with_metadata("delivery_seq", json!(7)),
        );
        inputs.insert(
            "edge-a".to_string(),
            MessageValue::text("first", None).with_metadata("delivery_seq", json!(3)),
        );

        assert_eq!(first_delivered(&inputs).unwrap().content, json!("first"));
        assert_eq!(latest_delivered(&inputs).unwrap().content, json!("second"));
    }
}

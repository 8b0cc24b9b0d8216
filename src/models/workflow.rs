// Workflow graph definitions - nodes, edges, and structural validation

//! # Workflow Models
//!
//! This module defines the static structure of a workflow: a directed graph
//! of typed nodes connected by typed edges. A `Workflow` describes:
//! - All units of work (agents, tools, transforms, routers, I/O boundaries)
//! - How data flows between them (data, conditional, error, router edges)
//! - Structural validation rules (acyclicity, orphan detection)
//!
//! ## Graph Model
//!
//! The workflow is a **DAG by contract**: cycles are rejected by
//! `validate()`, though validation is advisory - a workflow under
//! construction in a visual editor may be saved in an incomplete or even
//! invalid state, and the engine carries its own runaway guards.
//!
//! Nodes and edges live in canonical maps keyed by ID. Each node also
//! carries cached lists of incoming/outgoing **edge IDs**. These caches are
//! a derived index maintained by `add_edge`/`remove_edge`/`remove_node`,
//! not authoritative storage, and are rebuilt on deserialization.
//!
//! ## Rust Learning Notes:
//!
//! This file demonstrates several core Rust concepts:
//! - Enums with serde renaming for wire-format stability
//! - Graph algorithms (cycle detection via DFS with a recursion stack)
//! - Hash maps and hash sets for efficient lookups
//! - Custom serialization through an intermediate document type

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

/// Free-form configuration mapping attached to nodes and edges
///
/// Semantics depend on the node/edge type: an AGENT node reads `agent_id`,
/// a ROUTE_OUTPUT edge reads `port_number`, and so on.
pub type NodeConfig = HashMap<String, serde_json::Value>;

/// Types of nodes in a workflow
///
/// Each variant selects a different execution handler in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    /// Sends its input to an A2A agent and emits the response
    Agent,
    /// Executes a tool with parameters merged from config and inputs
    Tool,
    /// Entry boundary - resolves a value from the run's external input
    Input,
    /// Exit boundary - collects a value into the run's results
    Output,
    /// Evaluates a condition and emits a boolean
    Conditional,
    /// Reshapes its input (extract, template, JSON coercion, passthrough)
    Transform,
    /// Selects exactly one numbered output port per execution
    Router,
}

/// Types of connections between nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    /// Regular data flow - always followed
    Data,
    /// Execute on success - always followed (errors take the ERROR path)
    Success,
    /// Execute on error - only activated from the scheduler's failure branch
    Error,
    /// Conditional branch taken when the edge condition holds
    ConditionTrue,
    /// Conditional branch taken when the edge condition does not hold
    ConditionFalse,
    /// Router output - followed when the edge's `port_number` matches the
    /// router's selected port
    RouteOutput,
}

/// 2D position for visual display - presentation only, never read by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

/// A single node in a workflow
///
/// A node can be an agent, a tool, an input/output boundary, or a
/// conditional/transform/router node that shapes the flow of data.
///
/// ## Rust Learning Notes:
///
/// ### Derived Index Fields
/// `incoming_edges` / `outgoing_edges` hold edge **IDs**, not edge copies.
/// They are marked `#[serde(skip)]` because they can always be rebuilt from
/// the workflow's canonical edge map - serializing them would just invite
/// inconsistency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique identifier for the node
    pub id: String,

    /// Human-readable name for the node
    pub name: String,

    /// Type of the node (selects the execution handler)
    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Configuration parameters for the node
    #[serde(default)]
    pub config: NodeConfig,

    /// {x, y} position for visual display
    #[serde(default)]
    pub position: Position,

    /// IDs of edges arriving at this node (derived index)
    #[serde(skip)]
    pub incoming_edges: Vec<String>,

    /// IDs of edges leaving this node (derived index)
    #[serde(skip)]
    pub outgoing_edges: Vec<String>,
}

impl WorkflowNode {
    /// Create a new node with a generated ID and empty configuration
    pub fn new<N: Into<String>>(name: N, node_type: NodeType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            node_type,
            config: NodeConfig::new(),
            position: Position::default(),
            incoming_edges: Vec::new(),
            outgoing_edges: Vec::new(),
        }
    }

    /// Set a configuration value, builder-style
    pub fn with_config<K: Into<String>>(mut self, key: K, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Set the node ID, builder-style (useful for tests and deserialization)
    pub fn with_id<I: Into<String>>(mut self, id: I) -> Self {
        self.id = id.into();
        self
    }
}

/// A connection between two nodes in a workflow
///
/// An edge defines how data flows from one node to another, and can
/// represent regular data flow, conditional branches, error handling, or a
/// router output port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    /// Unique identifier for the edge
    pub id: String,

    /// ID of the source node
    #[serde(rename = "source")]
    pub source_node_id: String,

    /// ID of the target node
    #[serde(rename = "target")]
    pub target_node_id: String,

    /// Type of the connection
    #[serde(rename = "type")]
    pub edge_type: EdgeType,

    /// Configuration parameters for the edge
    /// Examples: `port_number` for ROUTE_OUTPUT, condition settings for CONDITION_*
    #[serde(default)]
    pub config: NodeConfig,
}

impl WorkflowEdge {
    /// Create a new edge with a generated ID
    pub fn new<S: Into<String>, T: Into<String>>(
        source_node_id: S,
        target_node_id: T,
        edge_type: EdgeType,
        config: NodeConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_node_id: source_node_id.into(),
            target_node_id: target_node_id.into(),
            edge_type,
            config,
        }
    }
}

/// Serialized form of a workflow - the persisted JSON representation
///
/// Nodes and edges are stored as arrays here, while the in-memory
/// `Workflow` keeps them in maps for O(1) lookup.
#[derive(Serialize, Deserialize)]
struct WorkflowDoc {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    metadata: NodeConfig,
    #[serde(default)]
    nodes: Vec<WorkflowNode>,
    #[serde(default)]
    edges: Vec<WorkflowEdge>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// A complete workflow: a directed graph of typed nodes and typed edges
///
/// A workflow defines a network of connected agents, tools, and control
/// nodes that process data and execute tasks. It is a static definition;
/// per-run state lives in the engine's `WorkflowExecution`.
#[derive(Debug, Clone)]
pub struct Workflow {
    /// Unique identifier for the workflow
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Description of the workflow's purpose
    pub description: String,

    /// When this workflow was first created
    pub created_at: DateTime<Utc>,

    /// When this workflow was last modified
    pub updated_at: DateTime<Utc>,

    /// Version string of the workflow definition
    pub version: String,

    /// Additional metadata - also carries the validation escape hatches
    /// `force_validate` and `ignore_orphaned`
    pub metadata: NodeConfig,

    /// All nodes, keyed by node ID
    pub nodes: HashMap<String, WorkflowNode>,

    /// All edges, keyed by edge ID
    pub edges: HashMap<String, WorkflowEdge>,
}

impl Workflow {
    /// Create a new empty workflow with a generated ID
    pub fn new<N: Into<String>>(name: N) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            created_at: now,
            updated_at: now,
            version: "1.0".to_string(),
            metadata: NodeConfig::new(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
        }
    }

    /// Add a node to the workflow, returning its ID
    ///
    /// Insertion is unconditional: adding a node with an existing ID
    /// silently replaces the previous one (last-write-wins).
    pub fn add_node(&mut self, node: WorkflowNode) -> String {
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        self.touch();
        id
    }

    /// Get a node by ID
    pub fn get_node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(node_id)
    }

    /// Get a mutable node by ID
    pub fn get_node_mut(&mut self, node_id: &str) -> Option<&mut WorkflowNode> {
        self.nodes.get_mut(node_id)
    }

    /// Remove a node from the workflow
    ///
    /// Cascades: every edge touching the node (either direction) is removed
    /// first, including its registration in the other endpoint's cache.
    ///
    /// Returns `true` if the node was removed, `false` if it wasn't found.
    pub fn remove_node(&mut self, node_id: &str) -> bool {
        if !self.nodes.contains_key(node_id) {
            return false;
        }

        // Collect edges touching this node in either direction
        let incident: Vec<String> = self
            .edges
            .values()
            .filter(|edge| edge.source_node_id == node_id || edge.target_node_id == node_id)
            .map(|edge| edge.id.clone())
            .collect();

        for edge_id in incident {
            self.remove_edge(&edge_id);
        }

        self.nodes.remove(node_id);
        self.touch();
        true
    }

    /// Add an edge connecting two nodes
    ///
    /// Fails (returns `None`) if either endpoint is missing. On success the
    /// edge is registered in both endpoint nodes' edge-ID caches and stored
    /// in the workflow's edge map; the new edge's ID is returned.
    pub fn add_edge<S: AsRef<str>, T: AsRef<str>>(
        &mut self,
        source_node_id: S,
        target_node_id: T,
        edge_type: EdgeType,
        config: NodeConfig,
    ) -> Option<String> {
        let source_id = source_node_id.as_ref();
        let target_id = target_node_id.as_ref();

        if !self.nodes.contains_key(source_id) || !self.nodes.contains_key(target_id) {
            return None;
        }

        let edge = WorkflowEdge::new(source_id, target_id, edge_type, config);
        let edge_id = edge.id.clone();

        // Both lookups are guarded above; the unwraps here cannot fail
        if let Some(source) = self.nodes.get_mut(source_id) {
            source.outgoing_edges.push(edge_id.clone());
        }
        if let Some(target) = self.nodes.get_mut(target_id) {
            target.incoming_edges.push(edge_id.clone());
        }

        self.edges.insert(edge_id.clone(), edge);
        self.touch();
        Some(edge_id)
    }

    /// Get an edge by ID
    pub fn get_edge(&self, edge_id: &str) -> Option<&WorkflowEdge> {
        self.edges.get(edge_id)
    }

    /// Remove an edge from the workflow
    ///
    /// Returns `true` if the edge was removed, `false` if it wasn't found.
    pub fn remove_edge(&mut self, edge_id: &str) -> bool {
        let edge = match self.edges.remove(edge_id) {
            Some(edge) => edge,
            None => return false,
        };

        // Unregister from the endpoint caches
        if let Some(source) = self.nodes.get_mut(&edge.source_node_id) {
            source.outgoing_edges.retain(|id| id != edge_id);
        }
        if let Some(target) = self.nodes.get_mut(&edge.target_node_id) {
            target.incoming_edges.retain(|id| id != edge_id);
        }

        self.touch();
        true
    }

    /// Get all nodes that have no incoming edges (start nodes)
    ///
    /// Used by the engine to seed the execution queue.
    pub fn get_start_nodes(&self) -> Vec<&WorkflowNode> {
        self.nodes
            .values()
            .filter(|node| node.incoming_edges.is_empty())
            .collect()
    }

    /// Get all nodes that have no outgoing edges (end nodes)
    pub fn get_end_nodes(&self) -> Vec<&WorkflowNode> {
        self.nodes
            .values()
            .filter(|node| node.outgoing_edges.is_empty())
            .collect()
    }

    /// Check a boolean flag in the workflow metadata
    fn metadata_flag(&self, key: &str) -> bool {
        matches!(self.metadata.get(key), Some(serde_json::Value::Bool(true)))
    }

    /// Validate the workflow for correctness
    ///
    /// Returns `(is_valid, errors)`. Validation is **advisory**: errors are
    /// human-readable strings and callers may choose to proceed anyway
    /// (e.g. saving a workflow still under construction).
    ///
    /// Checks performed:
    /// - The graph has at least one node
    /// - No orphaned nodes (no incident edges at all), except ROUTER, INPUT
    ///   and OUTPUT nodes, or when the metadata carries `force_validate` or
    ///   `ignore_orphaned`
    /// - The graph is acyclic (first cycle found aborts detection)
    pub fn validate(&self) -> (bool, Vec<String>) {
        let mut errors = Vec::new();

        // Check for empty workflow
        if self.nodes.is_empty() {
            errors.push("Workflow has no nodes".to_string());
            return (false, errors);
        }

        // Check for orphaned nodes (no connections at all).
        // ROUTER nodes are valid even before they are wired up, and
        // INPUT/OUTPUT nodes can exist unconnected during construction.
        let mut orphaned: Vec<&str> = self
            .nodes
            .values()
            .filter(|node| {
                node.incoming_edges.is_empty()
                    && node.outgoing_edges.is_empty()
                    && node.node_type != NodeType::Router
                    && node.node_type != NodeType::Input
                    && node.node_type != NodeType::Output
            })
            .map(|node| node.id.as_str())
            .collect();
        orphaned.sort_unstable();

        if !orphaned.is_empty() && !self.metadata_flag("force_validate") {
            if self.metadata_flag("ignore_orphaned") {
                // Support in-progress workflows: log it but don't reject
                tracing::warn!(
                    workflow_id = %self.id,
                    "Ignoring orphaned nodes: {}",
                    orphaned.join(", ")
                );
            } else {
                errors.push(format!("Orphaned nodes found: {}", orphaned.join(", ")));
            }
        }

        // Check for cycles
        if let Some(node_id) = self.find_cycle() {
            errors.push(format!("Cycle detected involving node {}", node_id));
        }

        (errors.is_empty(), errors)
    }

    /// Detect a cycle in the workflow graph
    ///
    /// DFS with a recursion-stack set: a node found already on the current
    /// DFS path signals a cycle. Returns the offending node's ID, or `None`
    /// if the graph is acyclic. Only the first cycle found is reported.
    fn find_cycle(&self) -> Option<String> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut path: HashSet<&str> = HashSet::new();

        // Iterative DFS so deep graphs can't blow the call stack.
        // The stack holds (node_id, entering) pairs: `entering` pushes the
        // node onto the current path, the paired false entry pops it.
        let mut node_ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        node_ids.sort_unstable();

        for start in node_ids {
            if visited.contains(start) {
                continue;
            }

            let mut stack: Vec<(&str, bool)> = vec![(start, true)];
            while let Some((node_id, entering)) = stack.pop() {
                if !entering {
                    path.remove(node_id);
                    continue;
                }
                if path.contains(node_id) {
                    return Some(node_id.to_string());
                }
                if visited.contains(node_id) {
                    continue;
                }

                visited.insert(node_id);
                path.insert(node_id);
                stack.push((node_id, false));

                if let Some(node) = self.nodes.get(node_id) {
                    for edge_id in &node.outgoing_edges {
                        if let Some(edge) = self.edges.get(edge_id) {
                            let target = edge.target_node_id.as_str();
                            if path.contains(target) {
                                return Some(target.to_string());
                            }
                            if !visited.contains(target) {
                                stack.push((target, true));
                            }
                        }
                    }
                }
            }
        }

        None
    }

    /// Update the modification timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Serialize the workflow to a JSON string
    pub fn to_json(&self, pretty: bool) -> Result<String> {
        let json = if pretty {
            serde_json::to_string_pretty(self)?
        } else {
            serde_json::to_string(self)?
        };
        Ok(json)
    }

    /// Deserialize a workflow from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn to_doc(&self) -> WorkflowDoc {
        // Emit nodes/edges in a stable order so serialized output is
        // reproducible across runs
        let mut nodes: Vec<WorkflowNode> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut edges: Vec<WorkflowEdge> = self.edges.values().cloned().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));

        WorkflowDoc {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version.clone(),
            metadata: self.metadata.clone(),
            nodes,
            edges,
        }
    }

    fn from_doc(doc: WorkflowDoc) -> Self {
        let mut workflow = Self {
            id: doc.id,
            name: doc.name,
            description: doc.description,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
            version: doc.version,
            metadata: doc.metadata,
            nodes: HashMap::new(),
            edges: HashMap::new(),
        };

        for node in doc.nodes {
            workflow.nodes.insert(node.id.clone(), node);
        }

        // Rebuild the per-node edge-ID caches while inserting edges.
        // Edges with dangling endpoints are kept in the map (the document
        // is authoritative) but simply not registered on missing nodes.
        for edge in doc.edges {
            if let Some(source) = workflow.nodes.get_mut(&edge.source_node_id) {
                source.outgoing_edges.push(edge.id.clone());
            }
            if let Some(target) = workflow.nodes.get_mut(&edge.target_node_id) {
                target.incoming_edges.push(edge.id.clone());
            }
            workflow.edges.insert(edge.id.clone(), edge);
        }

        workflow
    }
}

impl Serialize for Workflow {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_doc().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Workflow {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let doc = WorkflowDoc::deserialize(deserializer)?;
        Ok(Workflow::from_doc(doc))
    }
}

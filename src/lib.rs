// Agent Flow - Rust Edition
// A graph-based workflow execution engine for agent-to-agent messaging

//! # Agent Flow Library
//!
//! This is the main library crate for Agent Flow, a workflow engine that
//! executes directed graphs of typed nodes (agents, tools, transforms,
//! routers) and propagates typed messages along typed edges. This file
//! serves as the **library root** and defines the public API that external
//! crates can use.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`Workflow`]: Directed graph of nodes and edges with validation
//! - [`WorkflowNode`] / [`WorkflowEdge`]: Typed graph elements
//! - [`MessageValue`]: The unit of data flowing along edges
//! - [`AgentDefinition`] / [`AgentRegistry`]: A2A agent collaborators
//! - [`ToolDefinition`] / [`ToolRegistry`]: Tool server collaborators
//!
//! ### Execution Engine
//!
//! #### [`WorkflowExecution`] - Single-Run Scheduler
//!
//! One instance per run. Owns a FIFO queue of pending node IDs, per-node
//! execution state, and the accumulated results map. Repeatedly pops a
//! node, checks input readiness (join semantics), dispatches to a
//! type-specific handler, and fans the output out along every eligible
//! outgoing edge.
//!
//! **Key Features:**
//! - Join/barrier semantics via re-queueing on missing inputs
//! - Conditional, error, and router-port edge routing
//! - Error-edge absorption of node failures
//! - Step cap and per-node execution cap against runaway graphs
//!
//! #### [`WorkflowExecutor`] - Execution Manager
//!
//! Keyed registry of concurrent executions with a start/cancel/continue/
//! cleanup lifecycle. Each execution's mutable state is private to that
//! run; concurrency exists only at the run level.
//!
//! ### Storage Layer
//! Abstracts workflow persistence with pluggable backends (in-memory,
//! JSON files on disk).
//!
//! ## Rust Learning Notes:
//!
//! ### Module System
//! Rust organizes code into modules. Each `mod` declaration tells Rust to
//! include code from either a `.rs` file or a directory with a `mod.rs`
//! file.
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the
//! internal module structure. Instead of `use agent_flow::models::workflow::Workflow`,
//! users can write `use agent_flow::Workflow`.

// Core domain models (graph, messages, collaborators)
pub mod models;

// Engine implementations (scheduler, handlers, executor, storage)
pub mod engine;

// Re-export core domain types for easy access
// This creates a "flat" API - users can import directly from the crate root
pub use models::{
    AgentDefinition,  // An A2A agent usable from AGENT nodes
    AgentRegistry,    // Lookup registry for agents
    AgentSource,      // Where an agent lives (remote, custom, ...)
    AgentStatus,      // Connection state of an agent
    EdgeType,         // DATA, SUCCESS, ERROR, CONDITION_*, ROUTE_OUTPUT
    MessageValue,     // The message envelope flowing on edges
    NodeType,         // AGENT, TOOL, INPUT, OUTPUT, CONDITIONAL, TRANSFORM, ROUTER
    ToolDefinition,   // A tool usable from TOOL nodes
    ToolParameter,    // Declared parameter of a tool
    ToolRegistry,     // Lookup registry for tools
    ToolSource,       // Where a tool lives
    ToolStatus,       // Availability state of a tool
    Workflow,         // The workflow graph
    WorkflowEdge,     // A typed directed connection
    WorkflowNode,     // A typed unit of work
};

// Re-export engine types for convenience
pub use engine::{
    events::{ExecutionEvent, ExecutionEventBus},
    execution::{ExecutionStatus, NodeExecution, NodeExecutionStatus, WorkflowExecution},
    executor::{ExecutionOutcome, ExecutionStatusReport, WorkflowExecutor},
    routing::{HttpRouterClassifier, RouterClassifier},
    storage::{FileWorkflowStorage, InMemoryWorkflowStorage, WorkflowStorage, WorkflowSummary},
};

// Core error types
// Using the `thiserror` crate to make error handling easier
use thiserror::Error;

/// Custom error types for Agent Flow operations
///
/// ## Rust Learning Notes:
///
/// ### Error Handling in Rust
/// Rust doesn't have exceptions. Instead, it uses `Result<T, E>` types where:
/// - `Ok(value)` represents success
/// - `Err(error)` represents failure
///
/// ### The `thiserror` Crate
/// This crate provides macros to make error types easier to write:
/// - `#[derive(Error)]` implements the `std::error::Error` trait
/// - `#[error("...")]` provides human-readable error messages
/// - `#[from]` enables automatic conversion from other error types
#[derive(Error, Debug)]
pub enum AgentFlowError {
    /// Error when a workflow fails structural validation
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Error when a node references missing or malformed configuration
    #[error("Node configuration error: {0}")]
    NodeConfig(String),

    /// Error when a node is dispatched without its required input
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// Error when a workflow cannot be found
    #[error("Workflow not found: {id}")]
    WorkflowNotFound { id: String },

    /// Error when an execution cannot be found
    #[error("Execution not found: {id}")]
    ExecutionNotFound { id: String },

    /// Error when an agent collaborator is missing or unreachable
    #[error("Agent error: {0}")]
    Agent(String),

    /// Error when a tool collaborator is missing, unavailable, or fails
    #[error("Tool error: {0}")]
    Tool(String),

    /// Error when a condition expression cannot be parsed or evaluated
    #[error("Expression error: {0}")]
    Expression(String),

    /// Error when an execution cannot start or step
    #[error("Execution error: {0}")]
    Execution(String),

    /// Storage-related errors
    /// Using anyhow::Error for flexible error handling across backends
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    /// Also uses `#[from]` for automatic conversion
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport errors from remote agents and tool servers
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<std::io::Error> for AgentFlowError {
    fn from(err: std::io::Error) -> Self {
        AgentFlowError::Storage(err.into())
    }
}

/// Type alias for Results that use our custom error type
///
/// ## Rust Learning Notes:
///
/// ### Type Aliases
/// This creates a shorthand for a commonly-used type. Instead of writing
/// `std::result::Result<Workflow, AgentFlowError>` everywhere, we can
/// just write `Result<Workflow>`.
pub type Result<T> = std::result::Result<T, AgentFlowError>;

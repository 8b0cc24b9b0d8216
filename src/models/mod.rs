// Core domain models for Agent Flow
// These are pure data structures with no engine or transport dependencies

//! # Domain Models Module
//!
//! This module contains the core domain models for the Agent Flow workflow
//! system. These models represent the fundamental concepts:
//!
//! - **Workflow graph**: Typed nodes connected by typed edges
//! - **Messages**: The envelopes that flow along edges during execution
//! - **Agents**: A2A agent collaborators reachable from AGENT nodes
//! - **Tools**: Tool server collaborators reachable from TOOL nodes
//!
//! ## Design Philosophy
//!
//! The models are **engine-agnostic**: a `Workflow` is a static description
//! that can be validated, serialized, stored, and edited without ever being
//! executed. All mutable per-run state lives in the engine module, never
//! here.
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! This is a common Rust pattern for organizing large modules:
//! 1. Create a directory with the module name (`models/`)
//! 2. Add a `mod.rs` file as the module root
//! 3. Declare submodules in `mod.rs`
//! 4. Re-export important types for a clean API

/// Workflow graph definitions (nodes, edges, validation)
pub mod workflow;

/// Message envelope flowing along edges
pub mod message;

/// Agent definitions and registry
pub mod agent;

/// Tool definitions and registry
pub mod tool;

// Re-export the main model types for clean API access
pub use agent::{AgentDefinition, AgentRegistry, AgentSource, AgentStatus};
pub use message::{MessageMetadata, MessageValue};
pub use tool::{ToolDefinition, ToolParameter, ToolRegistry, ToolSource, ToolStatus};
pub use workflow::{
    EdgeType, NodeConfig, NodeType, Position, Workflow, WorkflowEdge, WorkflowNode,
};

// Execution engine for Agent Flow
// Scheduler, node handlers, edge routing, and the execution manager

//! # Engine Module
//!
//! This module contains everything that *runs* workflows:
//!
//! - [`execution`]: the single-run scheduler ([`WorkflowExecution`]) with
//!   its FIFO queue, join semantics, and fan-out rules
//! - [`handlers`]: the type-specific node handlers (INPUT, OUTPUT, AGENT,
//!   TOOL, CONDITIONAL, TRANSFORM, ROUTER)
//! - [`conditions`]: edge condition matching and the safe expression
//!   evaluator used by CONDITIONAL nodes
//! - [`routing`]: router strategies and the AI classifier trait
//! - [`executor`]: the multi-run manager ([`WorkflowExecutor`])
//! - [`events`]: the broadcast event bus for execution observability
//! - [`storage`]: pluggable workflow persistence backends
//!
//! ## Design Philosophy
//!
//! The scheduler is deliberately sequential within a run: one node
//! dispatches at a time, so handler effects and message deliveries are
//! totally ordered and runs are reproducible. Concurrency exists only at
//! the run level, managed by the executor.

/// Edge conditions and the safe expression evaluator
pub mod conditions;

/// Execution event definitions and broadcast bus
pub mod events;

/// Single-run execution state and scheduling loop
pub mod execution;

/// Multi-run execution manager
pub mod executor;

/// Node-type dispatch handlers
pub mod handlers;

/// Router strategies and AI classification
pub mod routing;

/// Workflow persistence backends
pub mod storage;

pub use events::{ExecutionEvent, ExecutionEventBus};
pub use execution::{ExecutionStatus, NodeExecution, NodeExecutionStatus, WorkflowExecution};
pub use executor::{ExecutionOutcome, ExecutionStatusReport, WorkflowExecutor};
pub use routing::{HttpRouterClassifier, RouterClassifier};
pub use storage::{FileWorkflowStorage, InMemoryWorkflowStorage, WorkflowStorage, WorkflowSummary};

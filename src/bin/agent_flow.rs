//! Agent Flow CLI
//!
//! Command-line tool for managing and running workflows stored on disk.
//! Workflows live as JSON files in a storage directory; runs execute in
//! process with whatever agents and tools the workflow can reach.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use agent_flow::{
    AgentRegistry, ExecutionOutcome, FileWorkflowStorage, ToolRegistry, Workflow, WorkflowExecutor,
    WorkflowStorage,
};
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::error;

#[derive(Parser)]
#[command(name = "agent-flow")]
#[command(about = "Agent Flow CLI - Manage and run agent workflows")]
#[command(version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding workflow JSON files
    #[arg(long, env = "AGENT_FLOW_STORAGE", default_value = "workflows")]
    storage_dir: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List all stored workflows
    List,

    /// Show a workflow's nodes and edges
    Show {
        /// ID of the workflow to show
        id: String,
    },

    /// Create a workflow, from a JSON file or empty
    Create {
        /// Path to a workflow JSON file
        #[arg(long)]
        file: Option<String>,

        /// Workflow name (overrides the file's name)
        #[arg(long)]
        name: Option<String>,

        /// Workflow description (overrides the file's description)
        #[arg(long)]
        description: Option<String>,
    },

    /// Delete a stored workflow
    Delete {
        /// ID of the workflow to delete
        id: String,
    },

    /// Run a stored workflow to completion
    Run {
        /// ID of the workflow to run
        id: String,

        /// Input data as a JSON object, or a path to a JSON file
        #[arg(long)]
        input: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let storage = FileWorkflowStorage::new(&cli.storage_dir).await?;

    match cli.command {
        Commands::List => {
            list_workflows(&storage).await?;
        }

        Commands::Show { id } => {
            show_workflow(&storage, &id).await?;
        }

        Commands::Create {
            file,
            name,
            description,
        } => {
            create_workflow(&storage, file, name, description).await?;
        }

        Commands::Delete { id } => {
            if storage.delete_workflow(&id).await? {
                println!("Workflow {} deleted.", id);
            } else {
                println!("Workflow {} not found.", id);
            }
        }

        Commands::Run { id, input } => {
            run_workflow(&storage, &id, input).await?;
        }
    }

    Ok(())
}

async fn list_workflows(storage: &FileWorkflowStorage) -> Result<()> {
    let workflows = storage.list_workflows().await?;

    if workflows.is_empty() {
        println!("No workflows found.");
        return Ok(());
    }

    println!("Found {} workflows:", workflows.len());
    for (i, summary) in workflows.iter().enumerate() {
        println!("{}. {} ({})", i + 1, summary.name, summary.id);
        if !summary.description.is_empty() {
            println!("   Description: {}", summary.description);
        }
        println!("   Created: {}", summary.created_at.to_rfc3339());
        println!("   Updated: {}", summary.updated_at.to_rfc3339());
        println!("   Version: {}", summary.version);
        println!();
    }
    Ok(())
}

async fn show_workflow(storage: &FileWorkflowStorage, id: &str) -> Result<()> {
    let workflow = match storage.load_workflow(id).await? {
        Some(workflow) => workflow,
        None => {
            println!("Workflow {} not found.", id);
            return Ok(());
        }
    };

    println!("Workflow: {} ({})", workflow.name, workflow.id);
    println!("Description: {}", workflow.description);
    println!("Created: {}", workflow.created_at.to_rfc3339());
    println!("Updated: {}", workflow.updated_at.to_rfc3339());
    println!("Version: {}", workflow.version);

    println!("\nNodes ({}):", workflow.nodes.len());
    let mut nodes: Vec<_> = workflow.nodes.values().collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    for node in nodes {
        println!("- {} ({}) - Type: {:?}", node.name, node.id, node.node_type);
    }

    println!("\nEdges ({}):", workflow.edges.len());
    let mut edges: Vec<_> = workflow.edges.values().collect();
    edges.sort_by(|a, b| a.id.cmp(&b.id));
    for edge in edges {
        let source_name = workflow
            .get_node(&edge.source_node_id)
            .map(|n| n.name.as_str())
            .unwrap_or("<unknown>");
        let target_name = workflow
            .get_node(&edge.target_node_id)
            .map(|n| n.name.as_str())
            .unwrap_or("<unknown>");
        println!("- {} -> {} ({:?})", source_name, target_name, edge.edge_type);
    }
    Ok(())
}

async fn create_workflow(
    storage: &FileWorkflowStorage,
    file: Option<String>,
    name: Option<String>,
    description: Option<String>,
) -> Result<()> {
    let mut workflow = match file {
        Some(path) => {
            let raw = tokio::fs::read_to_string(&path).await?;
            Workflow::from_json(&raw)?
        }
        None => Workflow::new("New Workflow"),
    };

    if let Some(name) = name {
        workflow.name = name;
    }
    if let Some(description) = description {
        workflow.description = description;
    }

    // Validation is advisory here: warn but save either way so workflows
    // under construction can still be persisted
    let (valid, errors) = workflow.validate();
    if !valid {
        println!("Warning: Workflow is not valid:");
        for error in &errors {
            println!("- {}", error);
        }
        println!("\nSaving workflow anyway.");
    }

    let workflow_id = storage.save_workflow(&mut workflow).await?;
    println!("Workflow saved with ID: {}", workflow_id);
    Ok(())
}

async fn run_workflow(
    storage: &FileWorkflowStorage,
    id: &str,
    input: Option<String>,
) -> Result<()> {
    let workflow = storage
        .load_workflow(id)
        .await?
        .ok_or_else(|| anyhow!("Workflow {} not found", id))?;

    let input_data = match input {
        Some(raw) => parse_input(&raw).await?,
        None => HashMap::new(),
    };

    let executor = WorkflowExecutor::new(Arc::new(AgentRegistry::new()), Arc::new(ToolRegistry::new()));

    println!("Running workflow: {} ({})", workflow.name, workflow.id);
    match executor.execute_workflow(workflow, input_data, true).await {
        Ok(ExecutionOutcome::Completed(results)) => {
            println!("\nWorkflow execution completed!");
            println!("\nResults:");
            let mut keys: Vec<_> = results.keys().collect();
            keys.sort();
            for key in keys {
                println!("{}: {}", key, results[key]);
            }
        }
        Ok(ExecutionOutcome::Started(execution_id)) => {
            println!("Workflow execution started. Execution ID: {}", execution_id);
        }
        Err(err) => {
            error!(error = %err, "workflow execution failed");
            return Err(err.into());
        }
    }
    Ok(())
}

/// Accept input as a path to a JSON file or an inline JSON object
async fn parse_input(raw: &str) -> Result<HashMap<String, serde_json::Value>> {
    let text = if Path::new(raw).is_file() {
        tokio::fs::read_to_string(raw).await?
    } else {
        raw.to_string()
    };

    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|err| anyhow!("Error parsing input data: {}", err))?;

    match value {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(anyhow!("Input data must be a JSON object")),
    }
}

// Tool models - definitions and registry for tool server collaborators

//! # Tool Models
//!
//! This module defines the tool collaborators reachable from TOOL nodes.
//! A [`ToolDefinition`] describes a callable tool (its parameters, where
//! it lives, how to invoke it); the [`ToolRegistry`] is the lookup service
//! the execution engine consults when a TOOL node dispatches.
//!
//! Remote tools are invoked over HTTP (`POST {url}{tool_path}` with a JSON
//! parameter object); custom tools run an in-process handler, which is
//! also how tests exercise TOOL nodes without a network.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{AgentFlowError, Result};

/// In-process tool implementation for [`ToolSource::Custom`] tools
pub type ToolHandler =
    Arc<dyn Fn(&HashMap<String, serde_json::Value>) -> Result<serde_json::Value> + Send + Sync>;

/// Source types for tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolSource {
    /// Tool hosted on a remote tool server (MCP-style)
    Remote,
    /// Tool implemented in-process
    Custom,
}

/// Availability status of a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolStatus {
    Available,
    Unavailable,
    Unknown,
}

/// A declared parameter of a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    /// Parameter name, as used in the invocation payload
    pub name: String,

    /// Declared type (string, number, boolean, object, array)
    #[serde(rename = "type", default = "default_param_type")]
    pub type_name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Whether the parameter must be present at invocation time
    #[serde(default)]
    pub required: bool,

    /// Default value applied when the parameter is absent
    #[serde(default)]
    pub default: Option<serde_json::Value>,

    /// Allowed values, when the parameter is an enumeration
    #[serde(default)]
    pub enum_values: Vec<serde_json::Value>,
}

fn default_param_type() -> String {
    "string".to_string()
}

impl ToolParameter {
    /// Create a required string parameter
    pub fn required<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            type_name: default_param_type(),
            description: String::new(),
            required: true,
            default: None,
            enum_values: Vec::new(),
        }
    }

    /// Create an optional parameter with a default value
    pub fn optional<N: Into<String>>(name: N, default: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            type_name: default_param_type(),
            description: String::new(),
            required: false,
            default: Some(default),
            enum_values: Vec::new(),
        }
    }
}

/// Definition of a tool to be used in workflows
#[derive(Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Description of the tool's purpose
    pub description: String,

    /// Base URL of the tool server (remote tools)
    pub url: String,

    /// Path of this tool on the server, e.g. `/tools/search`
    pub tool_path: String,

    /// Source type of the tool
    pub tool_source: ToolSource,

    /// Declared parameters
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,

    /// Configuration parameters
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Additional metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Last observed availability
    pub status: ToolStatus,

    /// Last error from availability check or execution, if any
    pub error_message: Option<String>,

    /// HTTP client for remote invocation
    #[serde(skip)]
    client: Option<reqwest::Client>,

    /// In-process implementation (custom tools)
    #[serde(skip)]
    handler: Option<ToolHandler>,
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("tool_path", &self.tool_path)
            .field("tool_source", &self.tool_source)
            .field("status", &self.status)
            .field("error_message", &self.error_message)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl ToolDefinition {
    /// Create a remote tool definition
    pub fn remote<N, U, P>(name: N, url: U, tool_path: P) -> Self
    where
        N: Into<String>,
        U: Into<String>,
        P: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            url: url.into(),
            tool_path: tool_path.into(),
            tool_source: ToolSource::Remote,
            parameters: Vec::new(),
            config: HashMap::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
            status: ToolStatus::Unknown,
            error_message: None,
            client: None,
            handler: None,
        }
    }

    /// Create a custom in-process tool backed by a handler function
    pub fn custom<N, F>(name: N, handler: F) -> Self
    where
        N: Into<String>,
        F: Fn(&HashMap<String, serde_json::Value>) -> Result<serde_json::Value>
            + Send
            + Sync
            + 'static,
    {
        let mut tool = Self::remote(name, "", "");
        tool.tool_source = ToolSource::Custom;
        tool.handler = Some(Arc::new(handler));
        tool
    }

    /// Set the tool ID, builder-style
    pub fn with_id<I: Into<String>>(mut self, id: I) -> Self {
        self.id = id.into();
        self
    }

    /// Add a declared parameter, builder-style
    pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Check whether the tool can currently be invoked
    ///
    /// Remote tools probe `{url}/health`; custom tools are available when
    /// a handler is attached. Updates `status` and returns the result.
    pub async fn check_availability(&mut self) -> bool {
        match self.tool_source {
            ToolSource::Custom => {
                if self.handler.is_some() {
                    self.status = ToolStatus::Available;
                    true
                } else {
                    self.status = ToolStatus::Unavailable;
                    self.error_message = Some("No handler attached".to_string());
                    false
                }
            }
            ToolSource::Remote => {
                let client = match self.http_client() {
                    Ok(client) => client,
                    Err(err) => {
                        self.status = ToolStatus::Unavailable;
                        self.error_message = Some(err.to_string());
                        return false;
                    }
                };

                let health_url = format!("{}/health", self.url.trim_end_matches('/'));
                match client.get(&health_url).send().await {
                    Ok(response) if response.status().is_success() => {
                        self.status = ToolStatus::Available;
                        self.error_message = None;
                        true
                    }
                    Ok(response) => {
                        self.status = ToolStatus::Unavailable;
                        self.error_message =
                            Some(format!("Health check returned {}", response.status()));
                        false
                    }
                    Err(err) => {
                        self.status = ToolStatus::Unavailable;
                        self.error_message = Some(err.to_string());
                        false
                    }
                }
            }
        }
    }

    /// Execute the tool with the given parameters
    ///
    /// Required parameters are validated first. Custom tool results are
    /// wrapped in `{"success": true, "result": ...}`; remote tools return
    /// the server's JSON response as-is.
    pub async fn execute(
        &mut self,
        mut params: HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value> {
        for parameter in &self.parameters {
            if params.contains_key(&parameter.name) {
                continue;
            }
            if let Some(default) = &parameter.default {
                params.insert(parameter.name.clone(), default.clone());
            } else if parameter.required {
                return Err(AgentFlowError::Tool(format!(
                    "Required parameter '{}' missing",
                    parameter.name
                )));
            }
        }

        match self.tool_source {
            ToolSource::Custom => {
                let handler = self.handler.clone().ok_or_else(|| {
                    AgentFlowError::Tool("No handler attached".to_string())
                })?;
                match handler(&params) {
                    Ok(result) => Ok(serde_json::json!({"success": true, "result": result})),
                    Err(err) => {
                        self.error_message = Some(err.to_string());
                        Err(err)
                    }
                }
            }
            ToolSource::Remote => {
                let client = self.http_client()?;
                let invoke_url = format!(
                    "{}{}",
                    self.url.trim_end_matches('/'),
                    self.tool_path
                );

                let response = client.post(&invoke_url).json(&params).send().await?;
                if !response.status().is_success() {
                    let status = response.status();
                    self.error_message = Some(format!("Tool server returned {}", status));
                    return Err(AgentFlowError::Tool(format!(
                        "Tool server returned {}",
                        status
                    )));
                }

                let result = response.json::<serde_json::Value>().await?;
                Ok(result)
            }
        }
    }

    fn http_client(&mut self) -> Result<reqwest::Client> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        self.client = Some(client.clone());
        Ok(client)
    }
}

/// Registry for managing tool definitions
///
/// Mirrors [`crate::models::agent::AgentRegistry`]: an async `RwLock`
/// guarded map with an engine-facing invocation path.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolDefinition>>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool in the registry
    pub async fn register(&self, tool: ToolDefinition) {
        let mut tools = self.tools.write().await;
        tools.insert(tool.id.clone(), tool);
    }

    /// Remove a tool from the registry
    ///
    /// Returns `true` if removed, `false` if not found.
    pub async fn unregister(&self, tool_id: &str) -> bool {
        let mut tools = self.tools.write().await;
        tools.remove(tool_id).is_some()
    }

    /// Get a snapshot of a tool by ID
    pub async fn get(&self, tool_id: &str) -> Option<ToolDefinition> {
        let tools = self.tools.read().await;
        tools.get(tool_id).cloned()
    }

    /// Get all registered tools
    pub async fn list_tools(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        tools.values().cloned().collect()
    }

    /// Invoke a registered tool
    ///
    /// This is the engine-facing path used by TOOL nodes: looks the tool
    /// up, verifies availability, and executes it with the given
    /// parameters.
    pub async fn execute(
        &self,
        tool_id: &str,
        params: HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut tools = self.tools.write().await;
        let tool = tools.get_mut(tool_id).ok_or_else(|| {
            AgentFlowError::Tool(format!("Tool with ID {} not found in registry", tool_id))
        })?;

        if !tool.check_availability().await {
            return Err(AgentFlowError::Tool(format!(
                "Tool is not available: {}",
                tool.error_message.as_deref().unwrap_or("unknown error")
            )));
        }

        tool.execute(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adder() -> ToolDefinition {
        ToolDefinition::custom("add", |params| {
            let a = params.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
            let b = params.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(json!(a + b))
        })
        .with_id("add")
        .with_parameter(ToolParameter::required("a"))
        .with_parameter(ToolParameter::optional("b", json!(10)))
    }

    #[tokio::test]
    async fn test_custom_tool_execute_wraps_result() {
        let registry = ToolRegistry::new();
        registry.register(adder()).await;

        let mut params = HashMap::new();
        params.insert("a".to_string(), json!(2));
        params.insert("b".to_string(), json!(3));

        let result = registry.execute("add", params).await.unwrap();
        assert_eq!(result, json!({"success": true, "result": 5}));
    }

    #[tokio::test]
    async fn test_optional_parameter_default_applied() {
        let registry = ToolRegistry::new();
        registry.register(adder()).await;

        let mut params = HashMap::new();
        params.insert("a".to_string(), json!(1));

        let result = registry.execute("add", params).await.unwrap();
        assert_eq!(result, json!({"success": true, "result": 11}));
    }

    #[tokio::test]
    async fn test_missing_required_parameter() {
        let registry = ToolRegistry::new();
        registry.register(adder()).await;

        let err = registry.execute("add", HashMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("Required parameter 'a'"));
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let registry = ToolRegistry::new();
        let err = registry.execute("ghost", HashMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_definition_serde_skips_runtime_fields() {
        let json = serde_json::to_string(&adder()).unwrap();
        let restored: ToolDefinition = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.id, "add");
        assert_eq!(restored.parameters.len(), 2);
        assert!(restored.handler.is_none());
    }
}

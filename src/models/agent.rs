// Agent models - definitions and registry for A2A agent collaborators

//! # Agent Models
//!
//! This module defines the agent collaborators reachable from AGENT nodes.
//! An [`AgentDefinition`] describes where an agent lives and how to talk to
//! it; the [`AgentRegistry`] is the lookup service the execution engine
//! consults when an AGENT node dispatches.
//!
//! ## Agent Sources
//!
//! - **Remote**: an A2A agent reachable over HTTP. `connect()` fetches the
//!   agent card from `{url}/agent.json`; `ask()` posts a text message.
//! - **Custom**: an in-process handler function injected by the host
//!   application (also how tests run without a network).
//! - **Local** / **Llm**: reserved source tags carried through
//!   serialization; they behave like Custom when a handler is attached.
//!
//! ## Error Reporting
//!
//! Connection and send failures do not panic and do not raise: they set
//! the definition's `error_message` side-channel and report failure
//! through the return value, mirroring the A2A client contract. The
//! registry's [`AgentRegistry::send_text`] wraps this into a `Result` for
//! the engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{AgentFlowError, Result};

/// In-process agent implementation for [`AgentSource::Custom`] agents
pub type AgentHandler = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// Source types for agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentSource {
    /// Local agent (part of this system)
    Local,
    /// Remote A2A agent
    Remote,
    /// Language model powered agent
    Llm,
    /// Custom agent implementation
    Custom,
}

/// Status of an agent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Connected,
    Disconnected,
    Error,
}

/// A skill advertised on an agent card
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSkill {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
}

/// The `/agent.json` card served by a remote A2A agent
#[derive(Debug, Clone, Deserialize)]
struct AgentCard {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    skills: Vec<AgentSkill>,
}

/// Definition of an agent to be used in workflows
///
/// This represents a specific agent instance with its configuration,
/// capabilities, and connection details.
#[derive(Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Description of the agent's purpose
    pub description: String,

    /// URL where the agent is accessible (remote agents)
    pub url: String,

    /// Source type of the agent
    pub agent_source: AgentSource,

    /// Type of the agent (a2a, mcp, custom, ...)
    pub agent_type: String,

    /// Configuration parameters for the agent
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Additional metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Skills advertised by the agent (populated on connect)
    #[serde(default)]
    pub skills: Vec<AgentSkill>,

    /// Current connection status
    pub status: AgentStatus,

    /// Last error from connect/send, if any
    pub error_message: Option<String>,

    /// HTTP client, created on connect (remote agents)
    #[serde(skip)]
    client: Option<reqwest::Client>,

    /// In-process implementation (custom agents)
    #[serde(skip)]
    handler: Option<AgentHandler>,
}

impl fmt::Debug for AgentDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("agent_source", &self.agent_source)
            .field("status", &self.status)
            .field("error_message", &self.error_message)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl AgentDefinition {
    /// Create a remote A2A agent definition
    pub fn remote<N: Into<String>, U: Into<String>>(name: N, url: U) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            url: url.into(),
            agent_source: AgentSource::Remote,
            agent_type: "a2a".to_string(),
            config: HashMap::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
            skills: Vec::new(),
            status: AgentStatus::Disconnected,
            error_message: None,
            client: None,
            handler: None,
        }
    }

    /// Create a custom in-process agent backed by a handler function
    pub fn custom<N, F>(name: N, handler: F) -> Self
    where
        N: Into<String>,
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        let mut agent = Self::remote(name, "");
        agent.agent_source = AgentSource::Custom;
        agent.agent_type = "custom".to_string();
        agent.handler = Some(Arc::new(handler));
        agent
    }

    /// Set the agent ID, builder-style
    pub fn with_id<I: Into<String>>(mut self, id: I) -> Self {
        self.id = id.into();
        self
    }

    /// Connect to the agent and fetch its capabilities
    ///
    /// Remote agents fetch the agent card from `{url}/agent.json` and fold
    /// its name/description/skills into the definition. Custom agents are
    /// connected when a handler is attached.
    ///
    /// Returns `true` on success; on failure the status moves to `Error`
    /// and `error_message` carries the reason.
    pub async fn connect(&mut self) -> bool {
        match self.agent_source {
            AgentSource::Custom | AgentSource::Local => {
                if self.handler.is_some() {
                    self.status = AgentStatus::Connected;
                    self.error_message = None;
                    true
                } else {
                    self.status = AgentStatus::Error;
                    self.error_message = Some("No handler attached".to_string());
                    false
                }
            }
            AgentSource::Remote | AgentSource::Llm => {
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(30))
                    .build();
                let client = match client {
                    Ok(client) => client,
                    Err(err) => {
                        self.status = AgentStatus::Error;
                        self.error_message = Some(err.to_string());
                        return false;
                    }
                };

                let card_url = format!("{}/agent.json", self.url.trim_end_matches('/'));
                match client.get(&card_url).send().await {
                    Ok(response) if response.status().is_success() => {
                        if let Ok(card) = response.json::<AgentCard>().await {
                            if let Some(name) = card.name {
                                self.name = name;
                            }
                            if let Some(description) = card.description {
                                self.description = description;
                            }
                            if !card.skills.is_empty() {
                                self.skills = card.skills;
                            }
                        }
                        self.client = Some(client);
                        self.status = AgentStatus::Connected;
                        self.error_message = None;
                        true
                    }
                    Ok(response) => {
                        self.status = AgentStatus::Error;
                        self.error_message =
                            Some(format!("Agent card request returned {}", response.status()));
                        false
                    }
                    Err(err) => {
                        self.status = AgentStatus::Error;
                        self.error_message = Some(err.to_string());
                        false
                    }
                }
            }
        }
    }

    /// Disconnect from the agent
    pub fn disconnect(&mut self) {
        self.client = None;
        self.status = AgentStatus::Disconnected;
    }

    /// Send a text message to the agent and return the response text
    ///
    /// Returns `None` on failure, with the reason in `error_message`.
    pub async fn ask(&mut self, text: &str) -> Option<String> {
        if self.status != AgentStatus::Connected {
            self.error_message = Some("Agent not connected".to_string());
            return None;
        }

        if let Some(handler) = self.handler.clone() {
            return match handler(text) {
                Ok(reply) => Some(reply),
                Err(err) => {
                    self.error_message = Some(err.to_string());
                    None
                }
            };
        }

        let client = match &self.client {
            Some(client) => client,
            None => {
                self.error_message = Some("Agent not connected".to_string());
                return None;
            }
        };

        let body = serde_json::json!({
            "message": {
                "content": {"type": "text", "text": text},
                "role": "user"
            }
        });

        let response = client.post(&self.url).json(&body).send().await;
        match response {
            Ok(response) if response.status().is_success() => {
                let raw = response.text().await.unwrap_or_default();
                // Tolerant unwrap: A2A responses nest the text under
                // content.text; plain servers may return a bare string
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) {
                    let text = value
                        .pointer("/content/text")
                        .or_else(|| value.pointer("/message/content/text"))
                        .or_else(|| value.get("text"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    Some(text.unwrap_or_else(|| value.to_string()))
                } else {
                    Some(raw)
                }
            }
            Ok(response) => {
                self.error_message = Some(format!("Agent returned {}", response.status()));
                None
            }
            Err(err) => {
                self.error_message = Some(err.to_string());
                None
            }
        }
    }
}

/// A successful agent reply, as handed back to the engine
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub agent_id: String,
    pub agent_name: String,
    pub text: String,
}

/// Registry for managing agent definitions
///
/// The registry maintains a collection of available agents that can be
/// used in workflows, providing lookup, registration, and connection
/// management. Access is guarded by an async `RwLock` so multiple runs can
/// consult it concurrently.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentDefinition>>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent in the registry
    pub async fn register(&self, agent: AgentDefinition) {
        let mut agents = self.agents.write().await;
        agents.insert(agent.id.clone(), agent);
    }

    /// Remove an agent from the registry, disconnecting it first
    ///
    /// Returns `true` if removed, `false` if not found.
    pub async fn unregister(&self, agent_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(agent_id) {
            if agent.status == AgentStatus::Connected {
                agent.disconnect();
            }
            agents.remove(agent_id);
            true
        } else {
            false
        }
    }

    /// Get a snapshot of an agent by ID
    pub async fn get(&self, agent_id: &str) -> Option<AgentDefinition> {
        let agents = self.agents.read().await;
        agents.get(agent_id).cloned()
    }

    /// Get all registered agents
    pub async fn list_agents(&self) -> Vec<AgentDefinition> {
        let agents = self.agents.read().await;
        agents.values().cloned().collect()
    }

    /// Connect to all agents in the registry
    ///
    /// Returns `(successful, failed)` connection counts.
    pub async fn connect_all(&self) -> (usize, usize) {
        let mut agents = self.agents.write().await;
        let mut successful = 0;
        let mut failed = 0;

        for agent in agents.values_mut() {
            if agent.connect().await {
                successful += 1;
            } else {
                failed += 1;
            }
        }

        (successful, failed)
    }

    /// Disconnect from all agents in the registry
    pub async fn disconnect_all(&self) {
        let mut agents = self.agents.write().await;
        for agent in agents.values_mut() {
            agent.disconnect();
        }
    }

    /// Send a text message through a registered agent
    ///
    /// This is the engine-facing path used by AGENT nodes: looks the agent
    /// up, connects it if it isn't connected yet, sends, and converts the
    /// error side-channel into a `Result`.
    pub async fn send_text(&self, agent_id: &str, text: &str) -> Result<AgentReply> {
        let mut agents = self.agents.write().await;
        let agent = agents.get_mut(agent_id).ok_or_else(|| {
            AgentFlowError::Agent(format!("Agent with ID {} not found in registry", agent_id))
        })?;

        if agent.status != AgentStatus::Connected && !agent.connect().await {
            return Err(AgentFlowError::Agent(format!(
                "Failed to connect to agent: {}",
                agent.error_message.as_deref().unwrap_or("unknown error")
            )));
        }

        match agent.ask(text).await {
            Some(reply) => Ok(AgentReply {
                agent_id: agent.id.clone(),
                agent_name: agent.name.clone(),
                text: reply,
            }),
            None => Err(AgentFlowError::Agent(format!(
                "Agent request failed: {}",
                agent.error_message.as_deref().unwrap_or("unknown error")
            ))),
        }
    }
}

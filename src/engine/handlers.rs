// Type-specific node handlers

//! # Node Handlers
//!
//! One handler per node type, dispatched from the scheduling loop. Each
//! handler reads the node's accumulated inputs, performs its work, and
//! stores the resulting message as the node's output. Handlers return
//! `Err` to signal failure; the scheduler decides whether an ERROR edge
//! absorbs it.
//!
//! Handlers that consume a single input take the earliest-delivered one;
//! the OUTPUT collector takes the latest, since later deliveries
//! supersede earlier ones at a collection point.

use std::collections::HashMap;

use serde_json::json;
use tracing::warn;

use crate::engine::conditions;
use crate::engine::execution::{first_delivered, latest_delivered, WorkflowExecution};
use crate::engine::routing::{
    self, classifier_prompt, extract_port, HttpRouterClassifier, RouterClassifier,
};
use crate::models::{MessageValue, NodeConfig, NodeType, WorkflowNode};
use crate::{AgentFlowError, Result};

/// String config value under the first key present
fn config_str<'a>(config: &'a NodeConfig, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| config.get(*key))
        .and_then(|v| v.as_str())
}

/// Integer config value under the first key present, tolerating
/// string-encoded numbers
fn config_i64(config: &NodeConfig, keys: &[&str]) -> Option<i64> {
    let value = keys.iter().find_map(|key| config.get(*key))?;
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Array config value under the first key present
fn config_array(config: &NodeConfig, keys: &[&str]) -> Vec<serde_json::Value> {
    keys.iter()
        .find_map(|key| config.get(*key))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Message content coerced to the text a collaborator should see
///
/// Strings pass through; `{"text": ...}` and nested `{"content": ...}`
/// wrappers are unwrapped; everything else is JSON-rendered.
fn content_to_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(text)) = map.get("text") {
                return text.clone();
            }
            if let Some(inner) = map.get("content") {
                return content_to_text(inner);
            }
            content.to_string()
        }
        other => other.to_string(),
    }
}

impl WorkflowExecution {
    /// Dispatch a node to its type-specific handler
    pub(crate) async fn dispatch_node(&mut self, node: &WorkflowNode) -> Result<()> {
        match node.node_type {
            NodeType::Agent => self.handle_agent_node(node).await,
            NodeType::Tool => self.handle_tool_node(node).await,
            NodeType::Input => self.handle_input_node(node),
            NodeType::Output => self.handle_output_node(node),
            NodeType::Conditional => self.handle_conditional_node(node),
            NodeType::Transform => self.handle_transform_node(node),
            NodeType::Router => self.handle_router_node(node).await,
        }
    }

    fn set_output(&mut self, node_id: &str, message: MessageValue) {
        if let Some(execution) = self.node_executions.get_mut(node_id) {
            execution.output_value = Some(message);
        }
    }

    fn first_input(&self, node_id: &str) -> Option<MessageValue> {
        self.node_executions
            .get(node_id)
            .and_then(|execution| first_delivered(&execution.input_values))
            .cloned()
    }

    /// INPUT: resolve a value from the run's input payload, a delivered
    /// message, or the configured default, in that order
    fn handle_input_node(&mut self, node: &WorkflowNode) -> Result<()> {
        let input_key = config_str(&node.config, &["input_key"]);

        let mut value = input_key
            .and_then(|key| self.input_data.get(key))
            .filter(|v| !v.is_null())
            .cloned();

        if value.is_none() {
            value = self
                .first_input(&node.id)
                .map(|message| message.content)
                .filter(|v| !v.is_null());
        }

        if value.is_none() {
            value = node.config.get("default_value").cloned();
        }

        let value = value.unwrap_or(serde_json::Value::Null);
        let content_type = if value.is_string() { "text" } else { "json" };
        let message = MessageValue::new(value, content_type, Some(node.id.clone()));
        self.set_output(&node.id, message);
        Ok(())
    }

    /// OUTPUT: collect the latest delivered input into the results map
    ///
    /// Consumed inputs are cleared so a later turn of the same collector
    /// does not reprocess them.
    fn handle_output_node(&mut self, node: &WorkflowNode) -> Result<()> {
        let output_key = config_str(&node.config, &["output_key"])
            .unwrap_or("output")
            .to_string();

        let input = {
            let execution = self.node_executions.get(&node.id);
            execution
                .and_then(|e| latest_delivered(&e.input_values))
                .cloned()
        };
        let input = input.ok_or_else(|| {
            AgentFlowError::MissingInput("No input message available for output node".to_string())
        })?;

        let mut content = input.content.clone();
        if let serde_json::Value::Object(map) = &content {
            if let Some(inner) = map.get("content") {
                content = inner.clone();
            } else if let Some(text) = map.get("text") {
                content = text.clone();
            }
        }

        self.results.insert(output_key.clone(), content.clone());

        // Fresh metadata: routing decisions must not leak past a collector
        let message = MessageValue::new(content, input.content_type, Some(node.id.clone()))
            .with_metadata("is_final_output", json!(true))
            .with_metadata("output_key", json!(output_key));

        if let Some(execution) = self.node_executions.get_mut(&node.id) {
            execution.input_values.clear();
            execution.output_value = Some(message);
        }
        Ok(())
    }

    /// AGENT: send the input text to a registered agent
    async fn handle_agent_node(&mut self, node: &WorkflowNode) -> Result<()> {
        let agent_id = config_str(&node.config, &["agent_id"])
            .ok_or_else(|| {
                AgentFlowError::NodeConfig(format!(
                    "Agent node {} is missing agent_id configuration",
                    node.id
                ))
            })?
            .to_string();

        let input = self.first_input(&node.id).ok_or_else(|| {
            AgentFlowError::MissingInput("No input message available for agent node".to_string())
        })?;

        let text = content_to_text(&input.content);
        let reply = self.agent_registry.send_text(&agent_id, &text).await?;

        let mut message = MessageValue::text(reply.text, Some(node.id.clone()))
            .with_metadata("agent_id", json!(agent_id))
            .with_metadata("agent_name", json!(reply.agent_name));
        // Conversation threading survives the hop; other metadata does not
        if let Some(conversation_id) = input.metadata.get("conversation_id") {
            message = message.with_metadata("conversation_id", conversation_id.clone());
        }
        self.set_output(&node.id, message);
        Ok(())
    }

    /// TOOL: merge parameters from config and inputs, then invoke a
    /// registered tool
    ///
    /// Parameter sources, later wins: `parameters` config object, then
    /// each delivered input in arrival order. Object inputs merge key by
    /// key; string inputs that parse as JSON objects merge too; any other
    /// string lands under the `input_parameter` config name if set.
    async fn handle_tool_node(&mut self, node: &WorkflowNode) -> Result<()> {
        let tool_id = config_str(&node.config, &["tool_id"])
            .ok_or_else(|| {
                AgentFlowError::NodeConfig(format!(
                    "Tool node {} is missing tool_id configuration",
                    node.id
                ))
            })?
            .to_string();

        let mut params: HashMap<String, serde_json::Value> = node
            .config
            .get("parameters")
            .and_then(|v| v.as_object())
            .map(|map| map.clone().into_iter().collect())
            .unwrap_or_default();

        let mut inputs: Vec<(i64, String, MessageValue)> = self
            .node_executions
            .get(&node.id)
            .map(|execution| {
                execution
                    .input_values
                    .iter()
                    .map(|(edge_id, message)| {
                        (
                            message.metadata_as_i64("delivery_seq").unwrap_or(i64::MAX),
                            edge_id.clone(),
                            message.clone(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        inputs.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        for (_, _, message) in &inputs {
            match &message.content {
                serde_json::Value::Object(map) => {
                    for (key, value) in map {
                        params.insert(key.clone(), value.clone());
                    }
                }
                serde_json::Value::String(s) => {
                    match serde_json::from_str::<serde_json::Value>(s) {
                        Ok(serde_json::Value::Object(map)) => {
                            for (key, value) in map {
                                params.insert(key, value);
                            }
                        }
                        _ => {
                            if let Some(param_name) =
                                config_str(&node.config, &["input_parameter"])
                            {
                                params.insert(param_name.to_string(), json!(s));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let result = self.tool_registry.execute(&tool_id, params).await?;

        let message = MessageValue::new(result, "json", Some(node.id.clone()))
            .with_metadata("tool_id", json!(tool_id));
        self.set_output(&node.id, message);
        Ok(())
    }

    /// CONDITIONAL: evaluate a condition and emit a boolean message
    fn handle_conditional_node(&mut self, node: &WorkflowNode) -> Result<()> {
        let condition_type = config_str(&node.config, &["condition_type"]).unwrap_or("always");
        let condition_value = node.config.get("condition_value").cloned();

        let input = self.first_input(&node.id);
        if input.is_none() && condition_type != "always" {
            return Err(AgentFlowError::MissingInput(
                "No input message available for conditional node".to_string(),
            ));
        }

        let result = match condition_type {
            "always" => true,
            "contains" => {
                let target = condition_value.as_ref().and_then(|v| v.as_str()).unwrap_or("");
                let text = input.as_ref().map(|m| m.content_as_text()).unwrap_or_default();
                text.contains(target)
            }
            "equals" => {
                let content = input.as_ref().map(|m| &m.content);
                match (&condition_value, content) {
                    (Some(serde_json::Value::String(target)), Some(content)) => {
                        content_to_text(content) == *target
                    }
                    (Some(target), Some(content)) => target == content,
                    _ => false,
                }
            }
            // "javascript" is the legacy name; both run the same safe
            // expression evaluator
            "expression" | "javascript" => {
                let expression = condition_value.as_ref().and_then(|v| v.as_str()).unwrap_or("");
                let content = input
                    .as_ref()
                    .map(|m| m.content.clone())
                    .unwrap_or(serde_json::Value::Null);
                match conditions::evaluate_expression(expression, &content) {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(node = %node.name, error = %err, "condition expression failed");
                        false
                    }
                }
            }
            other => {
                warn!(node = %node.name, condition_type = other, "unknown condition type");
                false
            }
        };

        let message = MessageValue::new(json!(result), "boolean", Some(node.id.clone()));
        self.set_output(&node.id, message);
        Ok(())
    }

    /// TRANSFORM: reshape the input content
    ///
    /// Types: `passthrough` (default), `extract` (dotted `field_path`
    /// walk, numeric segments index arrays, misses yield null),
    /// `template` (`${input}` substitution), `json` (parse string
    /// content, leave unchanged on failure).
    fn handle_transform_node(&mut self, node: &WorkflowNode) -> Result<()> {
        let transform_type =
            config_str(&node.config, &["transform_type"]).unwrap_or("passthrough");
        let transform_config = node
            .config
            .get("transform_config")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        let input = self.first_input(&node.id).ok_or_else(|| {
            AgentFlowError::MissingInput(
                "No input message available for transform node".to_string(),
            )
        })?;

        let mut result = input.content.clone();

        match transform_type {
            "passthrough" => {}
            "extract" => {
                let field_path = transform_config
                    .get("field_path")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if !field_path.is_empty() {
                    result = extract_field(&result, field_path);
                }
            }
            "template" => {
                let template = transform_config
                    .get("template")
                    .and_then(|v| v.as_str())
                    .unwrap_or("${input}");
                let input_text = content_to_text(&input.content);
                result = json!(template.replace("${input}", &input_text));
            }
            "json" => {
                if let serde_json::Value::String(s) = &result {
                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(s) {
                        result = parsed;
                    }
                }
            }
            other => {
                warn!(node = %node.name, transform_type = other, "unknown transform type");
            }
        }

        let content_type = if result.is_string() { "text" } else { "json" };
        let message = MessageValue::new(result, content_type, Some(node.id.clone()));
        self.set_output(&node.id, message);
        Ok(())
    }

    /// ROUTER: pick an output port and stamp the decision into metadata
    ///
    /// Downstream ROUTE_OUTPUT edges match their `port_number` against the
    /// stamped `selected_port`. A router with no input routes the literal
    /// text "No input message" instead of failing.
    async fn handle_router_node(&mut self, node: &WorkflowNode) -> Result<()> {
        let input = self.first_input(&node.id).unwrap_or_else(|| {
            warn!(node = %node.name, "router has no input message, using default");
            MessageValue::text("No input message", None)
        });

        let strategy = config_str(&node.config, &["routingStrategy", "routing_strategy"])
            .unwrap_or("keyword")
            .to_string();
        let default_output = config_i64(&node.config, &["default_output"]).unwrap_or(0);
        let output_ports = config_i64(&node.config, &["outputPorts", "output_ports"]).unwrap_or(2);

        let content = content_to_text(&input.content);

        let mut selected_port = default_output;
        match strategy.as_str() {
            "keyword" => {
                let patterns =
                    config_array(&node.config, &["keywordPatterns", "keyword_patterns"]);
                if patterns.is_empty() {
                    warn!(node = %node.name, "router has no keyword patterns, using default port");
                } else {
                    selected_port = routing::route_keyword(&patterns, &content, default_output);
                }
            }
            "random" => {
                selected_port = routing::route_random(output_ports);
            }
            "content-type" | "content_type" => {
                let mappings = config_array(
                    &node.config,
                    &["contentTypeMappings", "content_type_mappings"],
                );
                if mappings.is_empty() {
                    warn!(node = %node.name, "router has no content-type mappings");
                } else {
                    selected_port = routing::route_content_type(
                        &mappings,
                        &input.content_type,
                        default_output,
                    );
                }
            }
            "ai" => {
                if let Some(port) = self.classify_port(node, output_ports, &content).await {
                    selected_port = port;
                }
            }
            other => {
                warn!(node = %node.name, strategy = other, "unknown routing strategy");
            }
        }

        // Out-of-range selections fall back to the default
        if !(0..output_ports).contains(&selected_port) {
            warn!(
                node = %node.name,
                selected_port,
                output_ports,
                "selected port out of range, using default"
            );
            selected_port = default_output;
        }

        let message = MessageValue::new(
            json!(content),
            input.content_type.clone(),
            Some(node.id.clone()),
        )
        .with_metadata("router_node_id", json!(node.id))
        .with_metadata("selected_port", json!(selected_port))
        .with_metadata("port_name", json!(format!("Output {}", selected_port + 1)))
        .with_metadata("routing_strategy", json!(strategy))
        .with_metadata("router_timestamp", json!(chrono::Utc::now().to_rfc3339()));

        self.set_output(&node.id, message);
        Ok(())
    }

    /// Ask a classifier for a port; any failure leaves the default
    ///
    /// Uses the execution's injected classifier when present, otherwise
    /// builds one from the node's `apiKey`/`model` config.
    async fn classify_port(
        &self,
        node: &WorkflowNode,
        output_ports: i64,
        content: &str,
    ) -> Option<i64> {
        let prompt = classifier_prompt(output_ports, content);

        let response = if let Some(classifier) = &self.classifier {
            classifier.classify(&prompt).await
        } else if let Some(api_key) = config_str(&node.config, &["apiKey", "api_key"]) {
            let model = config_str(&node.config, &["model"]).unwrap_or("gpt-3.5-turbo");
            HttpRouterClassifier::new(api_key, model)
                .classify(&prompt)
                .await
        } else {
            warn!(node = %node.name, "no classifier or API key for ai routing, using default port");
            return None;
        };

        match response {
            Ok(text) => extract_port(&text).filter(|port| (0..output_ports).contains(port)),
            Err(err) => {
                warn!(node = %node.name, error = %err, "ai routing failed, using default port");
                None
            }
        }
    }
}

/// Walk a dotted field path through objects and arrays
fn extract_field(content: &serde_json::Value, field_path: &str) -> serde_json::Value {
    let mut current = content;
    for part in field_path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => match map.get(part) {
                Some(value) => value,
                None => return serde_json::Value::Null,
            },
            serde_json::Value::Array(items) => match part.parse::<usize>() {
                Ok(index) => match items.get(index) {
                    Some(value) => value,
                    None => return serde_json::Value::Null,
                },
                Err(_) => return serde_json::Value::Null,
            },
            _ => return serde_json::Value::Null,
        };
    }
    current.clone()
}

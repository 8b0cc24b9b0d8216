// Router strategies and AI classification

//! # Routing
//!
//! This module implements the port-selection strategies used by ROUTER
//! nodes:
//!
//! - **keyword**: first configured keyword found in the content wins
//! - **random**: uniform pick over the output ports
//! - **content-type**: exact match on the message's content-type tag
//! - **ai**: ask a language model to pick a port
//!
//! Every strategy resolves to an integer port; out-of-range selections
//! fall back to the configured default. The AI strategy is abstracted
//! behind the [`RouterClassifier`] trait so tests can inject a
//! deterministic classifier and the engine never hard-codes a vendor.

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;

use crate::{AgentFlowError, Result};

/// A classifier that picks an output port via a language model
///
/// Implementations receive the routing prompt and return the raw model
/// response; the engine extracts the port number from it.
#[async_trait]
pub trait RouterClassifier: Send + Sync {
    /// Send a routing prompt and return the model's text response
    async fn classify(&self, prompt: &str) -> Result<String>;
}

/// Classifier backed by an OpenAI-compatible chat completions endpoint
pub struct HttpRouterClassifier {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl HttpRouterClassifier {
    /// Create a classifier for `https://api.openai.com/v1`
    pub fn new<K: Into<String>, M: Into<String>>(api_key: K, model: M) -> Self {
        Self::with_base_url(api_key, model, "https://api.openai.com/v1")
    }

    /// Create a classifier against a custom OpenAI-compatible base URL
    pub fn with_base_url<K, M, U>(api_key: K, model: M, base_url: U) -> Self
    where
        K: Into<String>,
        M: Into<String>,
        U: Into<String>,
    {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RouterClassifier for HttpRouterClassifier {
    async fn classify(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AgentFlowError::Execution(format!(
                "Classifier returned {}",
                response.status()
            )));
        }

        let payload = response.json::<serde_json::Value>().await?;
        let text = payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AgentFlowError::Execution("Classifier response had no content".to_string())
            })?;
        Ok(text.to_string())
    }
}

/// Build the routing prompt sent to an AI classifier
pub fn classifier_prompt(output_ports: i64, content: &str) -> String {
    format!(
        "You are a message router. Choose the best output port (0 to {}) \
         for this message: '{}'. Respond ONLY with the port number.",
        output_ports - 1,
        content
    )
}

/// Extract the first integer from a classifier response
pub fn extract_port(response: &str) -> Option<i64> {
    // Unanchored so "port 2" and "2." both work
    let pattern = Regex::new(r"\b(\d+)\b").ok()?;
    pattern
        .captures(response)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Keyword strategy: first pattern whose keyword appears in the content
///
/// Patterns are `{"keyword": ..., "port": ...}` objects. Matching is
/// case-insensitive; entries with empty keywords or unparseable ports are
/// skipped.
pub fn route_keyword(patterns: &[serde_json::Value], content: &str, default_output: i64) -> i64 {
    let haystack = content.to_lowercase();
    for pattern in patterns {
        let keyword = pattern
            .get("keyword")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if keyword.is_empty() {
            continue;
        }
        if haystack.contains(&keyword.to_lowercase()) {
            if let Some(port) = value_as_port(pattern.get("port")) {
                return port;
            }
        }
    }
    default_output
}

/// Content-type strategy: exact (case-insensitive) content-type match
///
/// Mappings are `{"contentType": ..., "port": ...}` objects.
pub fn route_content_type(
    mappings: &[serde_json::Value],
    content_type: &str,
    default_output: i64,
) -> i64 {
    let wanted = content_type.to_lowercase();
    for mapping in mappings {
        let mapping_type = mapping
            .get("contentType")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_lowercase();
        if mapping_type == wanted {
            if let Some(port) = value_as_port(mapping.get("port")) {
                return port;
            }
        }
    }
    default_output
}

/// Random strategy: uniform pick over `0..output_ports`
pub fn route_random(output_ports: i64) -> i64 {
    if output_ports <= 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..output_ports)
}

/// Port value from config, tolerating string-encoded integers
fn value_as_port(value: Option<&serde_json::Value>) -> Option<i64> {
    match value? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keyword_first_match_wins() {
        let patterns = vec![
            json!({"keyword": "billing", "port": 1}),
            json!({"keyword": "bill", "port": 2}),
        ];
        assert_eq!(route_keyword(&patterns, "A BILLING question", 0), 1);
        assert_eq!(route_keyword(&patterns, "nothing relevant", 0), 0);
    }

    #[test]
    fn test_keyword_skips_bad_entries() {
        let patterns = vec![
            json!({"keyword": "", "port": 1}),
            json!({"keyword": "hit", "port": "not a number"}),
            json!({"keyword": "hit", "port": "3"}),
        ];
        // Empty keyword and unparseable port are skipped; string port parses
        assert_eq!(route_keyword(&patterns, "a hit here", 9), 3);
    }

    #[test]
    fn test_content_type_match() {
        let mappings = vec![
            json!({"contentType": "JSON", "port": 2}),
            json!({"contentType": "text", "port": 1}),
        ];
        assert_eq!(route_content_type(&mappings, "json", 0), 2);
        assert_eq!(route_content_type(&mappings, "audio", 0), 0);
    }

    #[test]
    fn test_random_stays_in_range() {
        for _ in 0..50 {
            let port = route_random(3);
            assert!((0..3).contains(&port));
        }
        assert_eq!(route_random(0), 0);
    }

    #[test]
    fn test_extract_port() {
        assert_eq!(extract_port("2"), Some(2));
        assert_eq!(extract_port("The best port is 1."), Some(1));
        assert_eq!(extract_port("no digits here"), None);
    }

    #[test]
    fn test_classifier_prompt_mentions_range() {
        let prompt = classifier_prompt(4, "hello");
        assert!(prompt.contains("(0 to 3)"));
        assert!(prompt.contains("'hello'"));
    }

    struct FixedClassifier(&'static str);

    #[async_trait]
    impl RouterClassifier for FixedClassifier {
        async fn classify(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_classifier_trait_object() {
        let classifier: Box<dyn RouterClassifier> = Box::new(FixedClassifier("port 2 please"));
        let response = classifier.classify("pick").await.unwrap();
        assert_eq!(extract_port(&response), Some(2));
    }
}

//! Ollama Analyzer Implementation
//!
//! Analysis collaborator backed by a local Ollama server.
//!
//! # Ollama API
//!
//! - `/api/generate` - Generate a completion (used non-streaming here)
//! - `/api/tags` - List available models (also the health probe)
//!
//! The model is asked for a small JSON object. Output that does not parse
//! as a JSON object is wrapped into a fallback structure carrying the raw
//! text, so a chatty model still yields something the client can render.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::traits::{Analyzer, AnalyzerError};

/// Ollama connection settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Ollama host name or address
    pub host: String,
    /// Ollama port
    pub port: u16,
    /// Preferred model; the first installed model is used if it is missing
    pub model: String,
    /// Per-request HTTP timeout (seconds)
    pub request_timeout_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11434,
            model: "llama3.2:1b".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl AnalyzerConfig {
    /// Base URL of the Ollama server
    ///
    /// `host` may already carry a scheme (`OLLAMA_HOST=http://box:11434`
    /// style); in that case it is used as-is.
    #[must_use]
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}:{}", self.port)
        }
    }
}

/// Ollama analyzer client
#[derive(Clone)]
pub struct OllamaAnalyzer {
    config: AnalyzerConfig,
    http_client: reqwest::Client,
}

impl OllamaAnalyzer {
    /// Create a new Ollama analyzer
    #[must_use]
    pub fn new(config: AnalyzerConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            config,
            http_client,
        }
    }

    /// Analyzer configuration
    #[must_use]
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.config.base_url())
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.config.base_url())
    }

    /// Build the structured-feedback prompt
    fn build_prompt(text: &str) -> String {
        format!(
            "Analyze this AB test hypothesis and provide brief feedback:\n\n\
             Hypothesis: \"{text}\"\n\n\
             Provide a JSON response with:\n\
             - clarity_score: 1-5 rating\n\
             - testability: brief assessment\n\
             - suggestions: 1-2 key improvements\n\n\
             Keep response under 100 words total."
        )
    }

    /// Names of the installed models
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` when the server cannot be reached.
    pub async fn list_models(&self) -> Result<Vec<String>, AnalyzerError> {
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| AnalyzerError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyzerError::Http { status, body });
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| AnalyzerError::Malformed(e.to_string()))?;

        Ok(data
            .get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str).map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Pick the configured model, or the first installed one if it is missing
    async fn resolve_model(&self) -> Result<String, AnalyzerError> {
        let models = self.list_models().await?;
        if models.iter().any(|m| m == &self.config.model) {
            return Ok(self.config.model.clone());
        }
        match models.into_iter().next() {
            Some(first) => {
                tracing::warn!(
                    wanted = %self.config.model,
                    using = %first,
                    "Configured model not installed, falling back"
                );
                Ok(first)
            }
            None => Err(AnalyzerError::Unavailable("no models installed".to_string())),
        }
    }
}

/// Turn raw model output into a result object
///
/// JSON objects pass through; anything else is wrapped with the raw text.
fn parse_model_output(output: &str) -> Value {
    match serde_json::from_str::<Value>(output.trim()) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({
            "raw_response": output,
            "clarity_score": 3,
            "testability": "Analysis generated",
            "suggestions": ["Review LLM feedback above"],
        }),
    }
}

impl Default for OllamaAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerConfig::default())
    }
}

#[async_trait]
impl Analyzer for OllamaAnalyzer {
    fn name(&self) -> &'static str {
        "Ollama"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn analyze(&self, text: &str) -> Result<Value, AnalyzerError> {
        if text.trim().is_empty() {
            return Err(AnalyzerError::InvalidInput("empty text".to_string()));
        }

        let model = self.resolve_model().await?;
        let request = json!({
            "model": model,
            "prompt": Self::build_prompt(text),
            "stream": false,
        });

        let response = self
            .http_client
            .post(self.generate_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalyzerError::Timeout(Duration::from_secs(self.config.request_timeout_secs))
                } else {
                    AnalyzerError::Unavailable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyzerError::Http { status, body });
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| AnalyzerError::Malformed(e.to_string()))?;
        let output = data
            .get("response")
            .and_then(Value::as_str)
            .ok_or_else(|| AnalyzerError::Malformed("missing response field".to_string()))?;

        tracing::debug!(model = %model, chars = output.len(), "Ollama analysis complete");
        Ok(parse_model_output(output))
    }
}

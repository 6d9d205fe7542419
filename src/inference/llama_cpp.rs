//! llama.cpp server client.
//!
//! Endpoint: POST /completion, GET /health

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::domain::Mapping;

use super::{parse_endpoint, InferenceBackend, InferenceResult};

pub const RUNTIME_NAME: &str = "llama_cpp";

/// Tokens to predict when the caller does not say
const DEFAULT_N_PREDICT: u64 = 512;

/// Response from the /completion endpoint
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    content: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    tokens_predicted: Option<u64>,
    #[serde(default)]
    tokens_evaluated: Option<u64>,
    #[serde(default)]
    stop_type: Option<String>,
}

/// HTTP client for a llama.cpp server
#[derive(Debug, Clone)]
pub struct LlamaCppBackend {
    endpoint: Url,
    timeout: Duration,
    client: reqwest::Client,
}

impl LlamaCppBackend {
    /// Create a client. In offline mode the endpoint must be a loopback address.
    pub fn new(endpoint: &str, timeout: Duration, offline: bool) -> Result<Self> {
        Ok(Self {
            endpoint: parse_endpoint(endpoint, offline)?,
            timeout,
            client: reqwest::Client::new(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.endpoint
            .join(path)
            .with_context(|| format!("Invalid endpoint path: {}", path))
    }
}

/// Request body: the prompt plus caller options, with a default token budget
fn request_body(prompt: &str, params: &Mapping) -> Value {
    let mut body = json!({ "prompt": prompt, "n_predict": DEFAULT_N_PREDICT });
    if let Value::Object(fields) = &mut body {
        for (key, value) in params {
            if key != "prompt" {
                fields.insert(key.clone(), value.clone());
            }
        }
    }
    body
}

#[async_trait]
impl InferenceBackend for LlamaCppBackend {
    fn name(&self) -> &str {
        RUNTIME_NAME
    }

    async fn generate(&self, prompt: &str, params: &Mapping) -> Result<InferenceResult> {
        let url = self.url("completion")?;
        debug!(%url, prompt_len = prompt.len(), "Requesting completion");

        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(&request_body(prompt, params))
            .send()
            .await
            .context("Failed to reach llama.cpp server")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("llama.cpp error ({}): {}", status, text);
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .context("Failed to parse llama.cpp response")?;

        let mut metadata = Mapping::new();
        metadata.insert("runtime".to_string(), json!(RUNTIME_NAME));
        if let Some(model) = completion.model {
            metadata.insert("model".to_string(), json!(model));
        }
        if let Some(n) = completion.tokens_predicted {
            metadata.insert("tokens_predicted".to_string(), json!(n));
        }
        if let Some(n) = completion.tokens_evaluated {
            metadata.insert("tokens_evaluated".to_string(), json!(n));
        }
        if let Some(stop) = completion.stop_type {
            metadata.insert("stop_type".to_string(), json!(stop));
        }

        Ok(InferenceResult {
            text: completion.content,
            metadata,
        })
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url("health")?)
            .timeout(self.timeout)
            .send()
            .await
            .context("Failed to reach llama.cpp server")?;

        if response.status().is_success() {
            Ok(())
        } else {
            anyhow::bail!("llama.cpp health check failed: {}", response.status())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_requires_loopback() {
        let timeout = Duration::from_secs(5);

        assert!(LlamaCppBackend::new("http://127.0.0.1:8080", timeout, true).is_ok());
        assert!(LlamaCppBackend::new("http://localhost:8080", timeout, true).is_ok());
        assert!(LlamaCppBackend::new("http://[::1]:8080", timeout, true).is_ok());
        assert!(LlamaCppBackend::new("http://10.0.0.9:8080", timeout, true).is_err());
        assert!(LlamaCppBackend::new("https://llm.example.com", timeout, true).is_err());

        assert!(LlamaCppBackend::new("https://llm.example.com", timeout, false).is_ok());
        assert!(LlamaCppBackend::new("not a url", timeout, false).is_err());
    }

    #[test]
    fn test_request_body_merges_params() {
        let mut params = Mapping::new();
        params.insert("temperature".to_string(), json!(0.2));
        params.insert("n_predict".to_string(), json!(64));
        params.insert("prompt".to_string(), json!("ignored"));

        let body = request_body("Summarize the scan", &params);

        assert_eq!(body["prompt"], "Summarize the scan");
        assert_eq!(body["n_predict"], 64);
        assert_eq!(body["temperature"], 0.2);
    }

    #[test]
    fn test_endpoint_join() {
        let backend =
            LlamaCppBackend::new("http://127.0.0.1:8080/", Duration::from_secs(1), true).unwrap();
        assert_eq!(
            backend.url("completion").unwrap().as_str(),
            "http://127.0.0.1:8080/completion"
        );
    }
}

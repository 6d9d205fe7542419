//! Hugging Face text-generation-inference client.
//!
//! Endpoint: POST /generate, GET /health

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::domain::Mapping;

use super::{parse_endpoint, InferenceBackend, InferenceResult};

pub const RUNTIME_NAME: &str = "hf_transformers";

const DEFAULT_MAX_NEW_TOKENS: u64 = 512;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    generated_text: String,
    #[serde(default)]
    details: Option<GenerateDetails>,
}

#[derive(Debug, Deserialize)]
struct GenerateDetails {
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    generated_tokens: Option<u64>,
}

/// HTTP client for a text-generation-inference server
#[derive(Debug, Clone)]
pub struct HfTransformersBackend {
    endpoint: Url,
    timeout: Duration,
    client: reqwest::Client,
}

impl HfTransformersBackend {
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

/// `{inputs, parameters}` with caller options under `parameters`
fn request_body(prompt: &str, params: &Mapping) -> Value {
    let mut parameters = serde_json::Map::new();
    parameters.insert("max_new_tokens".to_string(), json!(DEFAULT_MAX_NEW_TOKENS));
    for (key, value) in params {
        parameters.insert(key.clone(), value.clone());
    }
    json!({ "inputs": prompt, "parameters": parameters })
}

#[async_trait]
impl InferenceBackend for HfTransformersBackend {
    fn name(&self) -> &str {
        RUNTIME_NAME
    }

    async fn generate(&self, prompt: &str, params: &Mapping) -> Result<InferenceResult> {
        let url = self.url("generate")?;
        debug!(%url, prompt_len = prompt.len(), "Requesting generation");

        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(&request_body(prompt, params))
            .send()
            .await
            .context("Failed to reach text-generation-inference server")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("text-generation-inference error ({}): {}", status, text);
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse text-generation-inference response")?;

        let mut metadata = Mapping::new();
        metadata.insert("runtime".to_string(), json!(RUNTIME_NAME));
        if let Some(details) = generated.details {
            if let Some(reason) = details.finish_reason {
                metadata.insert("finish_reason".to_string(), json!(reason));
            }
            if let Some(n) = details.generated_tokens {
                metadata.insert("generated_tokens".to_string(), json!(n));
            }
        }

        Ok(InferenceResult {
            text: generated.generated_text,
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
            .context("Failed to reach text-generation-inference server")?;

        if response.status().is_success() {
            Ok(())
        } else {
            anyhow::bail!("text-generation-inference health check failed: {}", response.status())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_nests_parameters() {
        let mut params = Mapping::new();
        params.insert("temperature".to_string(), json!(0.1));
        params.insert("max_new_tokens".to_string(), json!(32));

        let body = request_body("Classify this banner", &params);

        assert_eq!(body["inputs"], "Classify this banner");
        assert_eq!(body["parameters"]["max_new_tokens"], 32);
        assert_eq!(body["parameters"]["temperature"], 0.1);
    }

    #[test]
    fn test_offline_requires_loopback() {
        let timeout = Duration::from_secs(5);
        assert!(HfTransformersBackend::new("http://127.0.0.1:3000", timeout, true).is_ok());
        assert!(HfTransformersBackend::new("https://tgi.example.com", timeout, true).is_err());
    }

    #[test]
    fn test_response_details_are_optional() {
        let bare: GenerateResponse = serde_json::from_str(r#"{"generated_text": "ok"}"#).unwrap();
        assert_eq!(bare.generated_text, "ok");
        assert!(bare.details.is_none());
    }
}

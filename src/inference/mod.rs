//! Language-model backends available to modules.
//!
//! Modules reach a model only through [`InferenceBackend`]; prompt
//! composition is theirs. Two runtimes ship, both HTTP clients: a llama.cpp
//! server and a Hugging Face text-generation-inference server.

pub mod hf_transformers;
pub mod llama_cpp;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::domain::Mapping;

pub use hf_transformers::HfTransformersBackend;
pub use llama_cpp::LlamaCppBackend;

/// Output of a single generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub text: String,

    /// Runtime-reported details (model, token counts, ...)
    #[serde(default)]
    pub metadata: Mapping,
}

impl InferenceResult {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Mapping::new(),
        }
    }
}

/// Trait for model runtimes
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Runtime name as used in configuration
    fn name(&self) -> &str;

    /// Generate a completion for `prompt`; `params` are runtime sampling options
    async fn generate(&self, prompt: &str, params: &Mapping) -> Result<InferenceResult>;

    /// Check that the runtime is reachable
    async fn health_check(&self) -> Result<()>;
}

/// Settings for the configured runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Base URL of the runtime server
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Per-request timeout
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_timeout_seconds() -> u64 {
    120
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Build the backend named by `runtime`
pub fn backend_for(
    runtime: &str,
    config: &InferenceConfig,
    offline: bool,
) -> Result<Arc<dyn InferenceBackend>> {
    match runtime {
        llama_cpp::RUNTIME_NAME => Ok(Arc::new(LlamaCppBackend::new(
            &config.endpoint,
            config.timeout(),
            offline,
        )?)),
        hf_transformers::RUNTIME_NAME => Ok(Arc::new(HfTransformersBackend::new(
            &config.endpoint,
            config.timeout(),
            offline,
        )?)),
        other => anyhow::bail!(
            "Unsupported llm_runtime '{}' (available: {}, {})",
            other,
            llama_cpp::RUNTIME_NAME,
            hf_transformers::RUNTIME_NAME
        ),
    }
}

/// Parse a runtime endpoint. Offline mode only permits loopback hosts.
fn parse_endpoint(endpoint: &str, offline: bool) -> Result<Url> {
    let url = Url::parse(endpoint)
        .with_context(|| format!("Invalid inference endpoint: {}", endpoint))?;

    if offline && !is_loopback(&url) {
        anyhow::bail!(
            "Offline mode only permits a loopback inference endpoint, got {}",
            url
        );
    }
    Ok(url)
}

fn is_loopback(url: &Url) -> bool {
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        None => false,
    }
}

//! The seam between provider actions and the HTTP client.

use std::sync::Arc;

use async_trait::async_trait;
use pflow_core::streaming::ChunkStream;
use pflow_core::template::ChatMessage;
use serde::Serialize;

use crate::config::RemoteLlmConfig;
use crate::error::Result;

/// What is sent to the model.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// `/chat/completions`
    Chat(Vec<ChatMessage>),
    /// `/completions`
    Text(String),
}

/// Optional sampling parameters, serialized only when set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    /// Model name, or the deployment name on Azure.
    pub model: String,
    pub prompt: Prompt,
    pub params: SamplingParams,
}

/// A provider endpoint able to answer completion requests.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Full response text.
    async fn complete(&self, request: &LlmRequest) -> Result<String>;

    /// Response text as it is generated.
    async fn stream(&self, request: &LlmRequest) -> Result<ChunkStream>;
}

/// Builds a backend for the connection a node is bound to.
pub type BackendFactory = Arc<dyn Fn(&RemoteLlmConfig) -> Result<Arc<dyn LlmBackend>> + Send + Sync>;

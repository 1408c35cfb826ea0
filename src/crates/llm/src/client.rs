//! HTTP client for OpenAI and Azure OpenAI completion endpoints.
//!
//! # Example
//!
//! ```rust,ignore
//! use llm::backend::{LlmBackend, LlmRequest, Prompt, SamplingParams};
//! use llm::client::OpenAiClient;
//! use llm::config::RemoteLlmConfig;
//! use pflow_core::template::ChatMessage;
//!
//! let client = OpenAiClient::new(RemoteLlmConfig::new(api_key, "https://api.openai.com/v1"))?;
//! let request = LlmRequest {
//!     model: "gpt-4o-mini".into(),
//!     prompt: Prompt::Chat(vec![ChatMessage::new("user", "Hello!")]),
//!     params: SamplingParams::default(),
//! };
//! let text = client.complete(&request).await?;
//! ```

use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::StreamExt;
use pflow_core::streaming::ChunkStream;
use pflow_core::template::ChatMessage;
use pflow_core::tool::ToolError;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tooling::logging::{sanitize_for_logging, truncate_for_logging};
use tracing::{debug, warn};

use crate::backend::{LlmBackend, LlmRequest, Prompt, SamplingParams};
use crate::config::{ApiFlavor, RemoteLlmConfig};
use crate::error::{LlmError, Result};

/// Data of the event that ends a completion stream.
const DONE: &str = "[DONE]";

/// OpenAI-compatible API client.
#[derive(Clone)]
pub struct OpenAiClient {
    config: RemoteLlmConfig,
    http: Client,
}

impl OpenAiClient {
    pub fn new(config: RemoteLlmConfig) -> Result<Self> {
        let http = Client::builder().build()?;
        Ok(Self::with_http_client(config, http))
    }

    /// Reuse an existing connection pool.
    pub fn with_http_client(config: RemoteLlmConfig, http: Client) -> Self {
        Self { config, http }
    }

    pub fn config(&self) -> &RemoteLlmConfig {
        &self.config
    }

    /// Endpoint URL for `request`.
    pub fn endpoint(&self, request: &LlmRequest) -> String {
        let path = match request.prompt {
            Prompt::Chat(_) => "chat/completions",
            Prompt::Text(_) => "completions",
        };
        match self.config.flavor {
            ApiFlavor::OpenAi => format!("{}/{}", self.config.base_url, path),
            ApiFlavor::AzureOpenAi => format!(
                "{}/openai/deployments/{}/{}?api-version={}",
                self.config.base_url,
                request.model,
                path,
                self.config.api_version.as_deref().unwrap_or_default()
            ),
        }
    }

    /// JSON body for `request`; Azure takes the model from the URL.
    pub fn body(&self, request: &LlmRequest, stream: bool) -> Result<Value> {
        let model = match self.config.flavor {
            ApiFlavor::OpenAi => Some(request.model.as_str()),
            ApiFlavor::AzureOpenAi => None,
        };
        let body = RequestBody {
            model,
            messages: match &request.prompt {
                Prompt::Chat(messages) => Some(messages),
                Prompt::Text(_) => None,
            },
            prompt: match &request.prompt {
                Prompt::Text(text) => Some(text),
                Prompt::Chat(_) => None,
            },
            params: &request.params,
            stream,
        };
        Ok(serde_json::to_value(body)?)
    }

    fn post(&self, request: &LlmRequest, stream: bool) -> Result<RequestBuilder> {
        let builder = self
            .http
            .post(self.endpoint(request))
            .timeout(self.config.timeout)
            .json(&self.body(request, stream)?);
        Ok(match self.config.flavor {
            ApiFlavor::OpenAi => {
                let builder = builder.bearer_auth(&self.config.api_key);
                match &self.config.organization {
                    Some(org) => builder.header("OpenAI-Organization", org),
                    None => builder,
                }
            }
            ApiFlavor::AzureOpenAi => builder.header("api-key", &self.config.api_key),
        })
    }

    async fn send(&self, request: &LlmRequest, stream: bool) -> Result<reqwest::Response> {
        debug!(
            model = %request.model,
            stream,
            url = %sanitize_for_logging(&self.endpoint(request)),
            "sending completion request"
        );
        let response = self.post(request, stream)?.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let error = LlmError::from_status(status, &body);
        warn!(
            status = status.as_u16(),
            body = %truncate_for_logging(&sanitize_for_logging(&body), 200),
            "provider returned an error"
        );
        Err(error)
    }
}

#[async_trait]
impl LlmBackend for OpenAiClient {
    async fn complete(&self, request: &LlmRequest) -> Result<String> {
        let response: CompletionResponse = self
            .send(request, false)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        if let Some(usage) = &response.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "completion finished"
            );
        }
        response
            .choices
            .into_iter()
            .next()
            .map(Choice::into_text)
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices".to_string()))
    }

    async fn stream(&self, request: &LlmRequest) -> Result<ChunkStream> {
        let response = self.send(request, true).await?;
        let mut events = response.bytes_stream().eventsource();

        let chunks = try_stream! {
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| ToolError::from(event_stream_error(e)))?;
                if event.data == DONE {
                    break;
                }
                if let Some(text) = delta_text(&event.data).map_err(ToolError::from)? {
                    yield text;
                }
            }
        };
        Ok(Box::pin(chunks))
    }
}

/// Timeouts are reported as such so the retry wrapper treats them as transient.
fn transport_error(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout(err.to_string())
    } else {
        LlmError::HttpError(err)
    }
}

fn event_stream_error(err: EventStreamError<reqwest::Error>) -> LlmError {
    match err {
        EventStreamError::Transport(err) => transport_error(err),
        other => LlmError::InvalidResponse(format!("bad event stream: {}", other)),
    }
}

/// Text carried by one stream event, `None` for role-only or empty deltas.
fn delta_text(data: &str) -> Result<Option<String>> {
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| LlmError::InvalidResponse(format!("bad stream event: {}", e)))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.and_then(|d| d.content).or(choice.text))
        .filter(|text| !text.is_empty()))
}

// OpenAI API types
#[derive(Serialize)]
struct RequestBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    messages: Option<&'a Vec<ChatMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a String>,
    #[serde(flatten)]
    params: &'a SamplingParams,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
    text: Option<String>,
}

impl Choice {
    fn into_text(self) -> String {
        self.message
            .and_then(|m| m.content)
            .or(self.text)
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<ResponseMessage>,
    text: Option<String>,
}

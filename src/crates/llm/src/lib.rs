//! OpenAI-compatible provider actions for pflow.
//!
//! LLM nodes in a flow name a provider and an API; this crate registers the
//! callables behind those names in a [`pflow_core::tool::ToolRegistry`]:
//!
//! | action                   | connection type          | model input       |
//! |--------------------------|--------------------------|-------------------|
//! | `OpenAI.chat`            | `OpenAIConnection`       | `model`           |
//! | `OpenAI.completion`      | `OpenAIConnection`       | `model`           |
//! | `AzureOpenAI.chat`       | `AzureOpenAIConnection`  | `deployment_name` |
//! | `AzureOpenAI.completion` | `AzureOpenAIConnection`  | `deployment_name` |
//!
//! The prompt is a Jinja template rendered with the node's remaining inputs; chat
//! prompts are split into messages on `# system:` / `# user:` / `# assistant:`
//! lines. With `stream: true` the action returns a live stream of text chunks
//! read from the provider's server-sent events.
//!
//! # Example
//!
//! ```rust,ignore
//! use pflow_core::prelude::*;
//!
//! let mut registry = ToolRegistry::new();
//! llm::register_builtin_actions(&mut registry)?;
//!
//! // flow.dag.yaml
//! //   nodes:
//! //     - name: answer
//! //       tool: chat_tool            # type: llm, source: chat.jinja2
//! //       connection: open_ai
//! //       api: chat
//! //       inputs:
//! //         model: gpt-4o-mini
//! //         question: ${inputs.question}
//! let executor = LineExecutor::create(flow, &connections, Arc::new(registry), loader, config)?;
//! ```

pub mod actions;
pub mod backend;
pub mod client;
pub mod config;
pub mod error;

pub use actions::{register_actions_with, register_builtin_actions, Api};
pub use backend::{BackendFactory, LlmBackend, LlmRequest, Prompt, SamplingParams};
pub use client::OpenAiClient;
pub use config::{ApiFlavor, RemoteLlmConfig};
pub use error::{LlmError, Result};

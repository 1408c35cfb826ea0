//! Provider actions: `OpenAI.chat`, `OpenAI.completion`, `AzureOpenAI.chat`,
//! `AzureOpenAI.completion`.
//!
//! Every action takes a bound connection, a prompt template (bound by the
//! resolver from the tool's source), a model or deployment name and optional
//! sampling parameters. Any other node input is a template variable.

use std::sync::Arc;

use pflow_core::flow::{InputType, ValueType};
use pflow_core::streaming::{LiveStream, STREAM_PARAM};
use pflow_core::template::{parse_chat, render_template};
use pflow_core::tool::{NodeOutput, ToolArgs, ToolError, ToolRegistry, ToolResult, ToolSignature};
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::backend::{BackendFactory, LlmBackend, LlmRequest, Prompt, SamplingParams};
use crate::client::OpenAiClient;
use crate::config::{RemoteLlmConfig, AZURE_OPENAI_CONNECTION, OPENAI_CONNECTION};
use crate::error::Result;

pub const OPENAI_PROVIDER: &str = "OpenAI";
pub const AZURE_OPENAI_PROVIDER: &str = "AzureOpenAI";

pub const CONNECTION_PARAM: &str = "connection";
pub const PROMPT_PARAM: &str = "prompt";

const SAMPLING_PARAMS: [&str; 7] = [
    "temperature",
    "max_tokens",
    "top_p",
    "stop",
    "presence_penalty",
    "frequency_penalty",
    "user",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Api {
    Chat,
    Completion,
}

impl Api {
    pub fn as_str(self) -> &'static str {
        match self {
            Api::Chat => "chat",
            Api::Completion => "completion",
        }
    }
}

struct ProviderSpec {
    name: &'static str,
    connection_type: &'static str,
    model_param: &'static str,
}

const PROVIDERS: [ProviderSpec; 2] = [
    ProviderSpec {
        name: OPENAI_PROVIDER,
        connection_type: OPENAI_CONNECTION,
        model_param: "model",
    },
    ProviderSpec {
        name: AZURE_OPENAI_PROVIDER,
        connection_type: AZURE_OPENAI_CONNECTION,
        model_param: "deployment_name",
    },
];

/// Register the HTTP-backed actions and their connection providers.
pub fn register_builtin_actions(registry: &mut ToolRegistry) -> Result<()> {
    let http = Client::builder().build()?;
    let factory: BackendFactory =
        Arc::new(move |config: &RemoteLlmConfig| -> Result<Arc<dyn LlmBackend>> {
            let client = OpenAiClient::with_http_client(config.clone(), http.clone());
            Ok(Arc::new(client) as Arc<dyn LlmBackend>)
        });
    register_actions_with(registry, factory);
    Ok(())
}

/// Register the actions over a custom backend.
pub fn register_actions_with(registry: &mut ToolRegistry, factory: BackendFactory) {
    for spec in &PROVIDERS {
        registry.register_provider(spec.connection_type, spec.name);
        for api in [Api::Chat, Api::Completion] {
            let action = Action {
                provider: spec.name,
                api,
                model_param: spec.model_param,
                factory: factory.clone(),
            };
            registry.register_action(
                spec.name,
                api.as_str(),
                action_signature(spec.connection_type, spec.model_param),
                move |args: ToolArgs| {
                    let action = action.clone();
                    async move { action.call(args).await }
                },
            );
        }
    }
}

fn action_signature(connection_type: &str, model_param: &str) -> ToolSignature {
    let typed = |value_type| vec![InputType::Value(value_type)];
    ToolSignature::new()
        .with_input(
            CONNECTION_PARAM,
            vec![InputType::Connection(connection_type.to_string())],
        )
        .with_input(PROMPT_PARAM, typed(ValueType::PromptTemplate))
        .with_input(model_param, typed(ValueType::String))
        .with_default("temperature", typed(ValueType::Double), json!(1.0))
        .with_input("max_tokens", typed(ValueType::Int))
        .with_default("top_p", typed(ValueType::Double), json!(1.0))
        .with_input("stop", typed(ValueType::List))
        .with_default("presence_penalty", typed(ValueType::Double), json!(0.0))
        .with_default("frequency_penalty", typed(ValueType::Double), json!(0.0))
        .with_input("user", typed(ValueType::String))
        .with_default(STREAM_PARAM, typed(ValueType::Bool), json!(false))
}

#[derive(Clone)]
struct Action {
    provider: &'static str,
    api: Api,
    model_param: &'static str,
    factory: BackendFactory,
}

impl Action {
    async fn call(&self, args: ToolArgs) -> ToolResult {
        let connection = args.connection(CONNECTION_PARAM)?;
        let config = RemoteLlmConfig::from_connection(&connection)?;
        let model = args.require_str(self.model_param)?.to_string();
        let template = args.require_str(PROMPT_PARAM)?.to_string();
        let stream = args.get_bool(STREAM_PARAM).unwrap_or(false);
        let params = sampling_params(&args)?;

        let variables = self.template_variables(args);
        let rendered = render_template(&template, &variables)
            .map_err(|e| ToolError::invalid_argument(PROMPT_PARAM, e.to_string()))?;
        let prompt = match self.api {
            Api::Chat => {
                let messages = parse_chat(&rendered);
                if messages.is_empty() {
                    return Err(ToolError::invalid_argument(
                        PROMPT_PARAM,
                        "the rendered chat prompt has no messages",
                    ));
                }
                Prompt::Chat(messages)
            }
            Api::Completion => Prompt::Text(rendered),
        };

        debug!(
            provider = self.provider,
            api = self.api.as_str(),
            connection = %connection.name,
            model = %model,
            stream,
            "calling provider"
        );
        let backend = (self.factory)(&config)?;
        let request = LlmRequest {
            model,
            prompt,
            params,
        };
        if stream {
            let chunks = backend.stream(&request).await?;
            Ok(NodeOutput::from(LiveStream::new(chunks)))
        } else {
            let text = backend.complete(&request).await?;
            Ok(NodeOutput::from(Value::String(text)))
        }
    }

    /// Node inputs that are not action parameters
    fn template_variables(&self, args: ToolArgs) -> Map<String, Value> {
        let mut variables = args.into_map();
        for reserved in [CONNECTION_PARAM, PROMPT_PARAM, STREAM_PARAM, self.model_param]
            .into_iter()
            .chain(SAMPLING_PARAMS)
        {
            variables.remove(reserved);
        }
        variables
    }
}

fn sampling_params(args: &ToolArgs) -> std::result::Result<SamplingParams, ToolError> {
    Ok(SamplingParams {
        temperature: float_arg(args, "temperature")?,
        max_tokens: match present(args, "max_tokens") {
            None => None,
            Some(value) => Some(value.as_u64().ok_or_else(|| {
                ToolError::invalid_argument("max_tokens", "expected a non-negative integer")
            })?),
        },
        top_p: float_arg(args, "top_p")?,
        stop: match present(args, "stop") {
            None => None,
            Some(Value::String(s)) => Some(vec![s.clone()]),
            Some(Value::Array(items)) if items.is_empty() => None,
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|item| {
                        item.as_str().map(str::to_string).ok_or_else(|| {
                            ToolError::invalid_argument("stop", "expected a list of strings")
                        })
                    })
                    .collect::<std::result::Result<_, _>>()?,
            ),
            Some(_) => return Err(ToolError::invalid_argument("stop", "expected a list of strings")),
        },
        presence_penalty: float_arg(args, "presence_penalty")?,
        frequency_penalty: float_arg(args, "frequency_penalty")?,
        user: present(args, "user").and_then(Value::as_str).map(str::to_string),
    })
}

/// Argument value, treating `null` and `""` as absent
fn present<'a>(args: &'a ToolArgs, name: &str) -> Option<&'a Value> {
    args.get(name)
        .filter(|v| !v.is_null() && v.as_str() != Some(""))
}

fn float_arg(args: &ToolArgs, name: &str) -> std::result::Result<Option<f64>, ToolError> {
    present(args, name)
        .map(|value| {
            value
                .as_f64()
                .ok_or_else(|| ToolError::invalid_argument(name, "expected a number"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use pflow_core::connection::Connection;
    use pflow_core::streaming::{ensure_node_result_is_serializable, ChunkStream};
    use pflow_core::tool::ToolCallable;
    use std::sync::Mutex;

    /// Records requests and answers with the rendered prompt reversed into chunks
    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<LlmRequest>>,
    }

    #[async_trait]
    impl LlmBackend for Recorder {
        async fn complete(&self, request: &LlmRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            Ok("42".to_string())
        }

        async fn stream(&self, request: &LlmRequest) -> Result<ChunkStream> {
            self.requests.lock().unwrap().push(request.clone());
            let chunks: Vec<std::result::Result<String, ToolError>> =
                vec![Ok("4".to_string()), Ok("2".to_string())];
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    fn registry(recorder: Arc<Recorder>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        let factory: BackendFactory =
            Arc::new(move |_config: &RemoteLlmConfig| -> Result<Arc<dyn LlmBackend>> {
                Ok(recorder.clone() as Arc<dyn LlmBackend>)
            });
        register_actions_with(&mut registry, factory);
        registry
    }

    async fn call(registry: &ToolRegistry, provider: &str, api: &str, args: ToolArgs) -> ToolResult {
        let action = registry.action(provider, api).unwrap();
        let ToolCallable::Function(f) = &action.callable else {
            panic!("actions are functions");
        };
        f(args).await
    }

    fn openai() -> Value {
        Connection::new("open_ai", OPENAI_CONNECTION)
            .with_value("api_key", "sk-test")
            .to_value()
    }

    #[test]
    fn test_registration() {
        let registry = registry(Arc::default());
        assert_eq!(
            registry.action_names(),
            vec![
                "AzureOpenAI.chat",
                "AzureOpenAI.completion",
                "OpenAI.chat",
                "OpenAI.completion"
            ]
        );
        assert_eq!(registry.provider_for(AZURE_OPENAI_CONNECTION), Some("AzureOpenAI"));

        let signature = &registry.action("OpenAI", "chat").unwrap().signature;
        assert_eq!(signature.template_param(), Some(PROMPT_PARAM));
        assert_eq!(signature.connection_param().map(|(name, _)| name), Some(CONNECTION_PARAM));
        assert!(signature.accepts(STREAM_PARAM));
    }

    #[tokio::test]
    async fn test_chat_renders_template_variables_into_messages() {
        let recorder = Arc::new(Recorder::default());
        let registry = registry(recorder.clone());
        let args = ToolArgs::new()
            .with(CONNECTION_PARAM, openai())
            .with(PROMPT_PARAM, json!("# system:\nAnswer tersely.\n# user:\n{{ question }}"))
            .with("model", json!("gpt-4o-mini"))
            .with("temperature", json!(0))
            .with("stop", json!("\n"))
            .with("max_tokens", Value::Null)
            .with("question", json!("What is 6 * 7?"));

        let output = call(&registry, "OpenAI", "chat", args).await.unwrap();
        let value = ensure_node_result_is_serializable(output).await.unwrap();
        assert_eq!(value, json!("42"));

        let requests = recorder.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.model, "gpt-4o-mini");
        let Prompt::Chat(messages) = &request.prompt else {
            panic!("expected a chat prompt");
        };
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "What is 6 * 7?");
        assert_eq!(request.params.temperature, Some(0.0));
        assert_eq!(request.params.stop, Some(vec!["\n".to_string()]));
        assert_eq!(request.params.max_tokens, None);
    }

    #[tokio::test]
    async fn test_streaming_completion_returns_live_stream() {
        let recorder = Arc::new(Recorder::default());
        let registry = registry(recorder.clone());
        let azure = Connection::new("azure", AZURE_OPENAI_CONNECTION)
            .with_value("api_key", "k")
            .with_value("api_base", "https://res.openai.azure.com")
            .to_value();
        let args = ToolArgs::new()
            .with(CONNECTION_PARAM, azure)
            .with(PROMPT_PARAM, json!("Count: {{ n }}"))
            .with("deployment_name", json!("text-deploy"))
            .with(STREAM_PARAM, json!(true))
            .with("n", json!(3));

        let output = call(&registry, "AzureOpenAI", "completion", args).await.unwrap();
        assert!(output.is_stream());
        let value = ensure_node_result_is_serializable(output).await.unwrap();
        assert_eq!(value, json!("42"));

        let requests = recorder.requests.lock().unwrap();
        assert_eq!(requests[0].prompt, Prompt::Text("Count: 3".to_string()));
        assert_eq!(requests[0].model, "text-deploy");
    }

    #[tokio::test]
    async fn test_argument_errors_are_not_retryable() {
        let registry = registry(Arc::default());
        let missing_model = ToolArgs::new()
            .with(CONNECTION_PARAM, openai())
            .with(PROMPT_PARAM, json!("hi"));
        let err = call(&registry, "OpenAI", "chat", missing_model).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { ref param, .. } if param == "model"));

        let empty_prompt = ToolArgs::new()
            .with(CONNECTION_PARAM, openai())
            .with(PROMPT_PARAM, json!("# user:\n"))
            .with("model", json!("gpt-4o-mini"));
        let err = call(&registry, "OpenAI", "chat", empty_prompt).await.unwrap_err();
        assert!(!err.is_retryable());

        let bad_temperature = ToolArgs::new()
            .with(CONNECTION_PARAM, openai())
            .with(PROMPT_PARAM, json!("hi"))
            .with("model", json!("gpt-4o-mini"))
            .with("temperature", json!("warm"));
        let err = call(&registry, "OpenAI", "chat", bad_temperature).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { ref param, .. } if param == "temperature"));
    }
}

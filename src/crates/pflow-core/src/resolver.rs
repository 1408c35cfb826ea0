//! Tool resolution
//!
//! Turns each node of a [`ValidatedFlow`] into a ready-to-call [`ToolFn`]. The
//! kind of the node's tool selects the strategy:
//!
//! | kind         | callable                                                      |
//! |--------------|---------------------------------------------------------------|
//! | `python`     | registered function, or a class built from literal init args  |
//! | `llm`        | provider action `"{provider}.{api}"` with the prompt bound    |
//! | `_action`    | provider action, prompt bound when the tool carries one       |
//! | `prompt`     | template rendered with the call arguments                     |
//! | `custom_llm` | registered function with the prompt bound                     |
//!
//! LLM-backed callables are wrapped with [`handle_llm_errors`] and, when streaming
//! is enabled, with [`enable_streaming_for_llm_tool`].

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{FlowError, Result};
use crate::flow::{CodeSource, InputAssignment, Node, Tool, ToolType};
use crate::retry::handle_llm_errors;
use crate::streaming::enable_streaming_for_llm_tool;
use crate::template::{render_template, validate_template};
use crate::tool::{
    action_key, tool_fn, NodeOutput, ToolArgs, ToolCallable, ToolError, ToolFn, ToolFuture,
    ToolRegistry, ToolSignature,
};
use crate::validator::ValidatedFlow;

/// Loads tool code and prompt templates
pub trait CodeLoader: Send + Sync {
    fn load(&self, source: &CodeSource) -> io::Result<String>;
}

/// Reads file sources relative to a working directory
#[derive(Debug, Clone, Default)]
pub struct FileCodeLoader {
    working_dir: PathBuf,
}

impl FileCodeLoader {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

impl CodeLoader for FileCodeLoader {
    fn load(&self, source: &CodeSource) -> io::Result<String> {
        match source {
            CodeSource::Inline(text) => Ok(text.clone()),
            CodeSource::FilePath(path) => std::fs::read_to_string(self.working_dir.join(path)),
        }
    }
}

/// A node bound to its callable
#[derive(Clone)]
pub struct ResolvedTool {
    pub node: String,
    pub tool_type: ToolType,
    pub callable: ToolFn,
    pub signature: ToolSignature,
    /// Literal arguments consumed by a class constructor
    pub init_args: Map<String, Value>,
}

impl fmt::Debug for ResolvedTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedTool")
            .field("node", &self.node)
            .field("tool_type", &self.tool_type)
            .field("signature", &self.signature)
            .field("init_args", &self.init_args)
            .finish()
    }
}

/// Binds nodes to callables from a [`ToolRegistry`]
#[derive(Clone)]
pub struct ToolResolver {
    registry: Arc<ToolRegistry>,
    loader: Arc<dyn CodeLoader>,
    streaming: bool,
}

impl ToolResolver {
    pub fn new(registry: Arc<ToolRegistry>, loader: Arc<dyn CodeLoader>) -> Self {
        Self {
            registry,
            loader,
            streaming: false,
        }
    }

    /// Make LLM tools return live streams
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Resolve every node of the flow, aggregation nodes included
    pub fn resolve_all(&self, flow: &ValidatedFlow) -> Result<IndexMap<String, ResolvedTool>> {
        let mut resolved = IndexMap::new();
        for node in &flow.flow().nodes {
            let tool = self.resolve(flow, node)?;
            resolved.insert(node.name.clone(), tool);
        }
        Ok(resolved)
    }

    /// Resolve one node
    pub fn resolve(&self, flow: &ValidatedFlow, node: &Node) -> Result<ResolvedTool> {
        let tool_name = node.tool.as_deref().unwrap_or_default();
        let tool = flow
            .flow()
            .get_tool(tool_name)
            .ok_or_else(|| FlowError::ToolNotFoundInFlow {
                node: node.name.clone(),
                tool: tool_name.to_string(),
            })?;

        let resolved = match tool.tool_type {
            ToolType::Python => self.resolve_python(node, tool)?,
            ToolType::Llm | ToolType::Action => self.resolve_action(node, tool)?,
            ToolType::Prompt => self.resolve_prompt(node, tool)?,
            ToolType::CustomLlm => self.resolve_custom_llm(node, tool)?,
        };
        debug!(
            node = %node.name,
            tool = %tool.name,
            tool_type = ?tool.tool_type,
            "resolved tool"
        );
        Ok(resolved)
    }

    fn load_source(&self, node: &Node, tool: &Tool) -> Result<Option<String>> {
        let Some(source) = tool.code_source() else {
            return Ok(None);
        };
        self.loader
            .load(&source)
            .map(Some)
            .map_err(|e| FlowError::InvalidSource {
                node: node.name.clone(),
                message: match &source {
                    CodeSource::FilePath(path) => format!("{}: {}", path.display(), e),
                    CodeSource::Inline(_) => e.to_string(),
                },
            })
    }

    fn resolve_python(&self, node: &Node, tool: &Tool) -> Result<ResolvedTool> {
        self.load_source(node, tool)?;

        let key = tool.registry_key();
        let registered = self
            .registry
            .get(&key)
            .or_else(|| self.registry.get(&tool.name))
            .ok_or_else(|| FlowError::ToolNotRegistered {
                node: node.name.clone(),
                key: key.clone(),
            })?;

        let (callable, init_args) = match &registered.callable {
            ToolCallable::Function(f) => (f.clone(), Map::new()),
            ToolCallable::Class {
                init_params,
                factory,
            } => {
                let mut init = Map::new();
                let mut missing = Vec::new();
                for (param, definition) in init_params {
                    match node.inputs.get(param) {
                        Some(InputAssignment::Literal(value)) => {
                            init.insert(param.clone(), value.clone());
                        }
                        Some(_) => {
                            return Err(FlowError::NonLiteralInitArgs {
                                node: node.name.clone(),
                                input: param.clone(),
                            })
                        }
                        None => match &definition.default {
                            Some(default) => {
                                init.insert(param.clone(), default.clone());
                            }
                            None => missing.push(param.clone()),
                        },
                    }
                }
                if !missing.is_empty() {
                    return Err(FlowError::MissingRequiredInputs {
                        node: node.name.clone(),
                        missing,
                    });
                }
                let callable =
                    factory(&init).map_err(|e| FlowError::tool_execution(&node.name, e))?;
                (callable, init)
            }
        };

        Ok(ResolvedTool {
            node: node.name.clone(),
            tool_type: tool.tool_type,
            callable,
            signature: registered.signature.clone(),
            init_args,
        })
    }

    fn resolve_action(&self, node: &Node, tool: &Tool) -> Result<ResolvedTool> {
        let provider = node.provider.as_deref().unwrap_or_default();
        let api = node.api.as_deref().unwrap_or_default();
        let action = self
            .registry
            .action(provider, api)
            .ok_or_else(|| FlowError::APINotFound {
                api: action_key(provider, api),
            })?;
        let ToolCallable::Function(f) = &action.callable else {
            return Err(FlowError::APINotFound {
                api: action_key(provider, api),
            });
        };

        let template = self.load_template(node, tool)?;
        let mut callable = f.clone();
        match (action.signature.template_param(), template) {
            (Some(param), Some(template)) => {
                callable = bind_template(callable, param, template);
            }
            (Some(param), None) if tool.tool_type == ToolType::Llm && !node.inputs.contains_key(param) => {
                return Err(FlowError::InvalidSource {
                    node: node.name.clone(),
                    message: "no prompt template".to_string(),
                });
            }
            _ => {}
        }

        Ok(ResolvedTool {
            node: node.name.clone(),
            tool_type: tool.tool_type,
            callable: self.wrap_llm(callable, &action.signature),
            signature: action.signature.clone(),
            init_args: Map::new(),
        })
    }

    fn resolve_prompt(&self, node: &Node, tool: &Tool) -> Result<ResolvedTool> {
        let template = self.load_template(node, tool)?.ok_or_else(|| FlowError::InvalidSource {
            node: node.name.clone(),
            message: "no prompt template".to_string(),
        })?;
        let template: Arc<str> = Arc::from(template);
        let callable = tool_fn(move |args: ToolArgs| {
            let template = template.clone();
            async move {
                render_template(&template, args.as_map())
                    .map(|text| NodeOutput::from(Value::String(text)))
                    .map_err(|e| ToolError::execution(e.to_string()))
            }
        });

        let mut signature = ToolSignature::new();
        signature.inputs = tool.inputs.clone();
        Ok(ResolvedTool {
            node: node.name.clone(),
            tool_type: tool.tool_type,
            callable,
            signature,
            init_args: Map::new(),
        })
    }

    fn resolve_custom_llm(&self, node: &Node, tool: &Tool) -> Result<ResolvedTool> {
        let key = tool.registry_key();
        let registered = self
            .registry
            .get(&key)
            .or_else(|| self.registry.get(&tool.name))
            .ok_or_else(|| FlowError::ToolNotRegistered {
                node: node.name.clone(),
                key: key.clone(),
            })?;
        let ToolCallable::Function(f) = &registered.callable else {
            return Err(FlowError::ToolNotRegistered {
                node: node.name.clone(),
                key,
            });
        };

        let template = self.load_template(node, tool)?;
        let param = registered.signature.template_param();
        let callable = match (param, template) {
            (Some(param), Some(template)) => bind_template(f.clone(), param, template),
            (Some(param), None) if !node.inputs.contains_key(param) => {
                return Err(FlowError::InvalidSource {
                    node: node.name.clone(),
                    message: "no prompt template".to_string(),
                });
            }
            _ => f.clone(),
        };

        Ok(ResolvedTool {
            node: node.name.clone(),
            tool_type: tool.tool_type,
            callable: self.wrap_llm(callable, &registered.signature),
            signature: registered.signature.clone(),
            init_args: Map::new(),
        })
    }

    /// Load and compile-check the tool's template
    fn load_template(&self, node: &Node, tool: &Tool) -> Result<Option<String>> {
        let Some(template) = self.load_source(node, tool)? else {
            return Ok(None);
        };
        validate_template(&template).map_err(|e| FlowError::TemplateError {
            node: node.name.clone(),
            message: e.to_string(),
        })?;
        Ok(Some(template))
    }

    fn wrap_llm(&self, callable: ToolFn, signature: &ToolSignature) -> ToolFn {
        let callable = handle_llm_errors(callable);
        if self.streaming {
            enable_streaming_for_llm_tool(callable, signature)
        } else {
            callable
        }
    }
}

/// Partially apply a prompt template to `param`
fn bind_template(callable: ToolFn, param: &str, template: String) -> ToolFn {
    let param = param.to_string();
    let template = Value::String(template);
    Arc::new(move |mut args: ToolArgs| -> ToolFuture {
        args.insert(param.clone(), template.clone());
        callable(args)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionSet};
    use crate::flow::{Flow, InputDefinition, InputType, ValueType};
    use crate::streaming::{ensure_node_result_is_serializable, LiveStream, STREAM_PARAM};
    use crate::validator::ensure_flow_valid;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    struct MapLoader(HashMap<PathBuf, String>);

    impl CodeLoader for MapLoader {
        fn load(&self, source: &CodeSource) -> io::Result<String> {
            match source {
                CodeSource::Inline(text) => Ok(text.clone()),
                CodeSource::FilePath(path) => self
                    .0
                    .get(path)
                    .cloned()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "not found")),
            }
        }
    }

    fn loader(files: &[(&str, &str)]) -> Arc<dyn CodeLoader> {
        Arc::new(MapLoader(
            files
                .iter()
                .map(|(p, c)| (PathBuf::from(p), c.to_string()))
                .collect(),
        ))
    }

    fn string_type() -> Vec<InputType> {
        vec![InputType::Value(ValueType::String)]
    }

    async fn call(tool: &ResolvedTool, args: ToolArgs) -> Value {
        let output = (tool.callable)(args).await.unwrap();
        ensure_node_result_is_serializable(output).await.unwrap()
    }

    #[tokio::test]
    async fn test_prompt_tool_renders_template() {
        let flow = Flow::new("f")
            .with_tool(Tool::new("greet", ToolType::Prompt).with_source("greet.jinja2"))
            .with_node(Node::new("greet", "greet").with_input("name", InputAssignment::literal("Ada")));
        let validated = ensure_flow_valid(flow, &ConnectionSet::new(), &ToolRegistry::new()).unwrap();

        let resolver = ToolResolver::new(
            Arc::new(ToolRegistry::new()),
            loader(&[("greet.jinja2", "Hello {{ name }}")]),
        );
        let resolved = resolver.resolve_all(&validated).unwrap();
        let value = call(&resolved["greet"], ToolArgs::new().with("name", json!("Ada"))).await;
        assert_eq!(value, json!("Hello Ada"));
    }

    #[test]
    fn test_missing_source_is_invalid_source() {
        let flow = Flow::new("f")
            .with_tool(Tool::new("greet", ToolType::Prompt).with_source("missing.jinja2"))
            .with_node(Node::new("greet", "greet"));
        let validated = ensure_flow_valid(flow, &ConnectionSet::new(), &ToolRegistry::new()).unwrap();
        let resolver = ToolResolver::new(Arc::new(ToolRegistry::new()), loader(&[]));
        let err = resolver.resolve_all(&validated).unwrap_err();
        assert!(matches!(err, FlowError::InvalidSource { node, .. } if node == "greet"));
    }

    #[test]
    fn test_bad_template_is_template_error() {
        let flow = Flow::new("f")
            .with_tool(Tool::new("greet", ToolType::Prompt).with_code("{{ name }"))
            .with_node(Node::new("greet", "greet"));
        let validated = ensure_flow_valid(flow, &ConnectionSet::new(), &ToolRegistry::new()).unwrap();
        let resolver = ToolResolver::new(Arc::new(ToolRegistry::new()), loader(&[]));
        assert!(matches!(
            resolver.resolve_all(&validated),
            Err(FlowError::TemplateError { .. })
        ));
    }

    #[test]
    fn test_unregistered_python_tool() {
        let flow = Flow::new("f")
            .with_tool(Tool::new("t", ToolType::Python).with_module("m").with_function("f"))
            .with_node(Node::new("a", "t"));
        let registry = ToolRegistry::new();
        let validated = ensure_flow_valid(flow, &ConnectionSet::new(), &registry).unwrap();
        let resolver = ToolResolver::new(Arc::new(registry), loader(&[]));
        let err = resolver.resolve_all(&validated).unwrap_err();
        assert!(matches!(err, FlowError::ToolNotRegistered { key, .. } if key == "m.f"));
    }

    fn class_registry() -> ToolRegistry {
        let mut init_params = IndexMap::new();
        init_params.insert("prefix".to_string(), InputDefinition::new(string_type()));
        let mut with_default = InputDefinition::new(string_type());
        with_default.default = Some(json!("!"));
        init_params.insert("suffix".to_string(), with_default);

        let mut registry = ToolRegistry::new();
        registry.register_class(
            "text.Decorator.decorate",
            ToolSignature::new().with_input("text", string_type()),
            init_params,
            |init| {
                let prefix = init
                    .get("prefix")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let suffix = init
                    .get("suffix")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(tool_fn(move |args: ToolArgs| {
                    let decorated = format!("{}{}{}", prefix, args.get_str("text").unwrap_or_default(), suffix);
                    async move { Ok(NodeOutput::from(json!(decorated))) }
                }))
            },
        );
        registry
    }

    fn class_tool() -> Tool {
        Tool::new("decorate", ToolType::Python)
            .with_module("text")
            .with_class_name("Decorator")
            .with_function("decorate")
    }

    #[tokio::test]
    async fn test_class_tool_uses_literal_init_args_and_defaults() {
        let registry = class_registry();
        let flow = Flow::new("f").with_tool(class_tool()).with_node(
            Node::new("d", "decorate")
                .with_input("prefix", InputAssignment::literal(">> "))
                .with_input("text", InputAssignment::literal("hi")),
        );
        let validated = ensure_flow_valid(flow, &ConnectionSet::new(), &registry).unwrap();
        let resolver = ToolResolver::new(Arc::new(registry), loader(&[]));
        let resolved = resolver.resolve_all(&validated).unwrap();

        let tool = &resolved["d"];
        assert_eq!(tool.init_args.get("prefix"), Some(&json!(">> ")));
        assert_eq!(tool.init_args.get("suffix"), Some(&json!("!")));
        assert_eq!(call(tool, ToolArgs::new().with("text", json!("hi"))).await, json!(">> hi!"));
    }

    #[test]
    fn test_class_tool_init_arg_errors() {
        let registry = class_registry();
        let missing = Flow::new("f")
            .with_tool(class_tool())
            .with_node(Node::new("d", "decorate"));
        let validated = ensure_flow_valid(missing, &ConnectionSet::new(), &registry).unwrap();
        let resolver = ToolResolver::new(Arc::new(registry.clone()), loader(&[]));
        let err = resolver.resolve_all(&validated).unwrap_err();
        assert!(matches!(err, FlowError::MissingRequiredInputs { missing, .. } if missing == vec!["prefix".to_string()]));

        let flow = Flow::new("f")
            .with_input("p", crate::flow::FlowInputDefinition::new(ValueType::String))
            .with_tool(class_tool())
            .with_node(Node::new("d", "decorate").with_input("prefix", InputAssignment::flow_input("p")));
        let validated = ensure_flow_valid(flow, &ConnectionSet::new(), &registry).unwrap();
        let err = resolver.resolve_all(&validated).unwrap_err();
        assert!(matches!(err, FlowError::NonLiteralInitArgs { input, .. } if input == "prefix"));
    }

    fn chat_registry(seen: Arc<Mutex<Option<ToolArgs>>>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register_action(
            "OpenAI",
            "chat",
            ToolSignature::new()
                .with_input("connection", vec![InputType::Connection("OpenAIConnection".into())])
                .with_input("prompt", vec![InputType::Value(ValueType::PromptTemplate)])
                .with_input(STREAM_PARAM, vec![InputType::Value(ValueType::Bool)]),
            move |args: ToolArgs| {
                let seen = seen.clone();
                async move {
                    let streaming = args.get_bool(STREAM_PARAM) == Some(true);
                    *seen.lock() = Some(args);
                    if streaming {
                        Ok(NodeOutput::from(LiveStream::from_chunks(["to", "ken"])))
                    } else {
                        Ok(NodeOutput::from(json!("token")))
                    }
                }
            },
        );
        registry.register_provider("OpenAIConnection", "OpenAI");
        registry
    }

    #[tokio::test]
    async fn test_llm_tool_binds_prompt_and_streams() {
        let seen = Arc::new(Mutex::new(None));
        let registry = chat_registry(seen.clone());
        let connections =
            ConnectionSet::new().with_connection(Connection::new("openai", "OpenAIConnection"));
        let flow = Flow::new("f")
            .with_tool(Tool::new("chat", ToolType::Llm).with_code("# user:\n{{ question }}"))
            .with_node(Node::new("chat", "chat").with_connection("openai").with_api("chat"));
        let validated = ensure_flow_valid(flow, &connections, &registry).unwrap();

        let resolver = ToolResolver::new(Arc::new(registry), loader(&[])).with_streaming(true);
        let resolved = resolver.resolve_all(&validated).unwrap();
        let output = (resolved["chat"].callable)(ToolArgs::new().with("question", json!("hi")))
            .await
            .unwrap();
        assert!(output.is_stream());
        assert_eq!(ensure_node_result_is_serializable(output).await.unwrap(), json!("token"));

        let args = seen.lock().clone().unwrap();
        assert_eq!(args.get_str("prompt"), Some("# user:\n{{ question }}"));
        assert_eq!(args.get_str("question"), Some("hi"));
    }

    #[test]
    fn test_llm_tool_without_prompt() {
        let registry = chat_registry(Arc::new(Mutex::new(None)));
        let connections =
            ConnectionSet::new().with_connection(Connection::new("openai", "OpenAIConnection"));
        let flow = Flow::new("f")
            .with_tool(Tool::new("chat", ToolType::Llm))
            .with_node(Node::new("chat", "chat").with_connection("openai").with_api("chat"));
        let validated = ensure_flow_valid(flow, &connections, &registry).unwrap();
        let resolver = ToolResolver::new(Arc::new(registry), loader(&[]));
        assert!(matches!(
            resolver.resolve_all(&validated),
            Err(FlowError::InvalidSource { .. })
        ));
    }
}

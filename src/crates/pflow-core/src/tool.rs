//! Tool callables and the tool registry
//!
//! A flow's [`crate::flow::Tool`] entries only *describe* computations. The code
//! that runs lives in a [`ToolRegistry`], built once at startup and handed to the
//! validator and the resolver by reference:
//!
//! - **functions** - plain async callables, keyed by `module.function`
//! - **classes** - factories taking literal init arguments and returning a callable
//! - **actions** - provider APIs keyed by `"{provider}.{api}"`, e.g. `OpenAI.chat`
//!
//! # Example
//!
//! ```rust
//! use pflow_core::flow::{InputType, ValueType};
//! use pflow_core::tool::{NodeOutput, ToolRegistry, ToolSignature};
//! use serde_json::json;
//!
//! let mut registry = ToolRegistry::new();
//! registry.register_function(
//!     "echo",
//!     ToolSignature::new().with_input("text", vec![InputType::Value(ValueType::String)]),
//!     |args| async move { Ok(NodeOutput::from(args.get("text").cloned().unwrap_or(json!(null)))) },
//! );
//! assert!(registry.has_tool("echo"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::connection::Connection;
use crate::flow::{InputDefinition, InputType, ValueType};
use crate::streaming::LiveStream;

/// Error returned by a tool callable
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// The arguments were wrong; never retried
    #[error("Invalid argument '{param}': {message}")]
    InvalidArguments { param: String, message: String },

    /// The tool failed
    #[error("{0}")]
    Execution(String),

    /// A provider call failed in a way worth retrying
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The retry wrapper gave up
    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn invalid_argument(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            param: param.into(),
            message: message.into(),
        }
    }

    /// Whether the LLM retry wrapper should try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Transient(_))
    }
}

/// What a tool returns: a plain value or a live text stream
pub enum NodeOutput {
    Value(Value),
    Stream(LiveStream),
}

impl NodeOutput {
    pub fn is_stream(&self) -> bool {
        matches!(self, NodeOutput::Stream(_))
    }
}

impl std::fmt::Debug for NodeOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeOutput::Value(v) => f.debug_tuple("Value").field(v).finish(),
            NodeOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Value> for NodeOutput {
    fn from(value: Value) -> Self {
        NodeOutput::Value(value)
    }
}

impl From<LiveStream> for NodeOutput {
    fn from(stream: LiveStream) -> Self {
        NodeOutput::Stream(stream)
    }
}

/// Resolved keyword arguments of one tool call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs {
    values: Map<String, Value>,
}

impl ToolArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.values.get(name).and_then(Value::as_bool)
    }

    /// Required argument
    pub fn require(&self, name: &str) -> Result<&Value, ToolError> {
        self.values
            .get(name)
            .ok_or_else(|| ToolError::invalid_argument(name, "missing required argument"))
    }

    /// Required string argument
    pub fn require_str(&self, name: &str) -> Result<&str, ToolError> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| ToolError::invalid_argument(name, "expected a string"))
    }

    /// Connection passed under `name`
    pub fn connection(&self, name: &str) -> Result<Connection, ToolError> {
        Connection::from_value(self.require(name)?)
            .ok_or_else(|| ToolError::invalid_argument(name, "expected a connection"))
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }
}

impl From<Map<String, Value>> for ToolArgs {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

/// Result of a tool call
pub type ToolResult = Result<NodeOutput, ToolError>;

/// Boxed future of a tool call
pub type ToolFuture = Pin<Box<dyn Future<Output = ToolResult> + Send>>;

/// A ready-to-call tool
pub type ToolFn = Arc<dyn Fn(ToolArgs) -> ToolFuture + Send + Sync>;

/// Builds a callable from literal init arguments
pub type ToolFactory = Arc<dyn Fn(&Map<String, Value>) -> Result<ToolFn, ToolError> + Send + Sync>;

/// Box an async closure into a [`ToolFn`]
pub fn tool_fn<F, Fut>(f: F) -> ToolFn
where
    F: Fn(ToolArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolResult> + Send + 'static,
{
    Arc::new(move |args: ToolArgs| -> ToolFuture { Box::pin(f(args)) })
}

/// Declared parameters of a registered callable
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolSignature {
    pub inputs: IndexMap<String, InputDefinition>,
}

impl ToolSignature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, name: impl Into<String>, types: Vec<InputType>) -> Self {
        self.inputs.insert(name.into(), InputDefinition::new(types));
        self
    }

    pub fn with_default(
        mut self,
        name: impl Into<String>,
        types: Vec<InputType>,
        default: Value,
    ) -> Self {
        let mut definition = InputDefinition::new(types);
        definition.default = Some(default);
        self.inputs.insert(name.into(), definition);
        self
    }

    /// Whether the callable takes a parameter with this name
    pub fn accepts(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    /// First parameter that accepts a connection type
    pub fn connection_param(&self) -> Option<(&str, &InputDefinition)> {
        self.inputs
            .iter()
            .find(|(_, def)| def.accepts_connection())
            .map(|(name, def)| (name.as_str(), def))
    }

    /// First parameter typed as a prompt template
    pub fn template_param(&self) -> Option<&str> {
        self.inputs
            .iter()
            .find(|(_, def)| {
                def.types
                    .contains(&InputType::Value(ValueType::PromptTemplate))
            })
            .map(|(name, _)| name.as_str())
    }
}

/// How a registered tool becomes callable
#[derive(Clone)]
pub enum ToolCallable {
    Function(ToolFn),
    Class {
        init_params: IndexMap<String, InputDefinition>,
        factory: ToolFactory,
    },
}

/// A callable plus its signature
#[derive(Clone)]
pub struct RegisteredTool {
    pub signature: ToolSignature,
    pub callable: ToolCallable,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.callable {
            ToolCallable::Function(_) => "function",
            ToolCallable::Class { .. } => "class",
        };
        f.debug_struct("RegisteredTool")
            .field("signature", &self.signature)
            .field("kind", &kind)
            .finish()
    }
}

/// Registry of tool callables, provider actions and connection providers
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    actions: HashMap<String, RegisteredTool>,
    providers: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async function under `key`
    pub fn register_function<F, Fut>(&mut self, key: impl Into<String>, signature: ToolSignature, f: F)
    where
        F: Fn(ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolResult> + Send + 'static,
    {
        self.tools.insert(
            key.into(),
            RegisteredTool {
                signature,
                callable: ToolCallable::Function(tool_fn(f)),
            },
        );
    }

    /// Register a class tool; `factory` receives the literal init arguments
    pub fn register_class<F>(
        &mut self,
        key: impl Into<String>,
        signature: ToolSignature,
        init_params: IndexMap<String, InputDefinition>,
        factory: F,
    ) where
        F: Fn(&Map<String, Value>) -> Result<ToolFn, ToolError> + Send + Sync + 'static,
    {
        self.tools.insert(
            key.into(),
            RegisteredTool {
                signature,
                callable: ToolCallable::Class {
                    init_params,
                    factory: Arc::new(factory),
                },
            },
        );
    }

    /// Register a provider API under `"{provider}.{api}"`
    pub fn register_action<F, Fut>(
        &mut self,
        provider: &str,
        api: &str,
        signature: ToolSignature,
        f: F,
    ) where
        F: Fn(ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolResult> + Send + 'static,
    {
        self.actions.insert(
            action_key(provider, api),
            RegisteredTool {
                signature,
                callable: ToolCallable::Function(tool_fn(f)),
            },
        );
    }

    /// Map a connection type to the provider serving it
    pub fn register_provider(&mut self, connection_type: impl Into<String>, provider: impl Into<String>) {
        self.providers
            .insert(connection_type.into(), provider.into());
    }

    pub fn get(&self, key: &str) -> Option<&RegisteredTool> {
        self.tools.get(key)
    }

    pub fn has_tool(&self, key: &str) -> bool {
        self.tools.contains_key(key)
    }

    pub fn action(&self, provider: &str, api: &str) -> Option<&RegisteredTool> {
        self.actions.get(&action_key(provider, api))
    }

    pub fn provider_for(&self, connection_type: &str) -> Option<&str> {
        self.providers.get(connection_type).map(String::as_str)
    }

    /// Sorted keys of registered functions and classes
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted `"{provider}.{api}"` keys
    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Registry key of a provider action
pub fn action_key(provider: &str, api: &str) -> String {
    format!("{}.{}", provider, api)
}

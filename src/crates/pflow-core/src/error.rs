//! Error types for flow validation, input mapping and execution
//!
//! Every failure the engine can produce is a variant of [`FlowError`]. Instead of a
//! class hierarchy, each variant reports three orthogonal facts:
//!
//! - [`FlowError::kind`] - whether the flow author ([`ErrorKind::UserError`]) or the
//!   environment ([`ErrorKind::SystemError`]) is at fault
//! - [`FlowError::target`] - which component raised it
//! - [`FlowError::node_name`] - the offending node, when there is one
//!
//! # Error Taxonomy
//!
//! ```text
//! FlowError
//! ├── validation (user, FlowValidator)
//! │   ├── DuplicateNodeName
//! │   ├── InputReferenceNotFound
//! │   ├── ToolNotFoundInFlow
//! │   ├── ConnectionNotSet / ConnectionNotFound / InvalidConnectionType
//! │   ├── NodeInputValidationError
//! │   ├── NodeReferenceNotFound / InvalidNodeReference
//! │   ├── NodeCircularDependency
//! │   ├── EmptyOutputError / OutputReferenceNotFound
//! │   └── NodeVariantNotFound
//! ├── input mapping (user, InputMapping)
//! │   ├── MappingSourceNotFound
//! │   ├── EmptyInputMappingError
//! │   ├── EmptyInputListError
//! │   └── LineNumberNotAlign
//! ├── resolution
//! │   ├── InvalidSource / NonLiteralInitArgs / TemplateError (user)
//! │   └── APINotFound / ToolNotRegistered / MissingRequiredInputs (system)
//! └── execution
//!     ├── InputNotFound / InputTypeError / InvalidReferenceProperty (user)
//!     ├── ToolExecution (user, Tool)
//!     ├── LineTimeout / LineAborted (system)
//!     └── Yaml / Serialization / Io / Configuration (system)
//! ```
//!
//! # Example
//!
//! ```rust
//! use pflow_core::error::{ErrorKind, ErrorTarget, FlowError};
//!
//! let err = FlowError::DuplicateNodeName { name: "summarize".to_string() };
//! assert_eq!(err.kind(), ErrorKind::UserError);
//! assert_eq!(err.target(), ErrorTarget::FlowValidator);
//! assert_eq!(err.code(), "DuplicateNodeName");
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tool::ToolError;

/// Who is responsible for an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad flow content, bad inputs or a failing user tool
    UserError,
    /// Registration, environment or runtime problem
    SystemError,
}

/// Component that raised an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorTarget {
    FlowValidator,
    ToolResolver,
    InputMapping,
    Executor,
    BatchCoordinator,
    Tool,
    Runtime,
}

/// Errors raised by the flow execution core
#[derive(Debug, Error)]
pub enum FlowError {
    /// Two nodes share the same name
    #[error("Node name '{name}' is duplicated in the flow")]
    DuplicateNodeName { name: String },

    /// A node input refers to a flow input that is not declared
    #[error("Node '{node}' references flow input '{input}' which is not defined in the flow inputs")]
    InputReferenceNotFound { node: String, input: String },

    /// A node names a tool missing from the flow's tool list
    #[error("Node '{node}' references tool '{tool}' which is not found in the flow")]
    ToolNotFoundInFlow { node: String, tool: String },

    /// An LLM node has no connection or no api selected
    #[error("Node '{node}' is an LLM node but has no {missing} set")]
    ConnectionNotSet { node: String, missing: String },

    /// A node names a connection that was not supplied
    #[error("Connection '{connection}' used by node '{node}' is not found")]
    ConnectionNotFound { node: String, connection: String },

    /// The connection type is not accepted by the tool
    #[error(
        "Node '{node}' uses connection '{connection}' of type '{actual}', but the tool only accepts {}",
        expected.join(", ")
    )]
    InvalidConnectionType {
        node: String,
        connection: String,
        actual: String,
        expected: Vec<String>,
    },

    /// A literal node input could not be coerced to its declared type
    #[error("Input '{input}' of node '{node}' is not valid: {message}")]
    NodeInputValidationError {
        node: String,
        input: String,
        message: String,
    },

    /// A node input references a node that does not exist
    #[error("Node '{node}' references node '{reference}' which is not found in the flow")]
    NodeReferenceNotFound { node: String, reference: String },

    /// A per-line node references an aggregation node
    #[error("Node '{node}' cannot reference aggregation node '{reference}'")]
    InvalidNodeReference { node: String, reference: String },

    /// The node references form a cycle
    #[error("Circular dependency detected among nodes: {}", nodes.join(", "))]
    NodeCircularDependency { nodes: Vec<String> },

    /// A flow output has an empty reference
    #[error("Output '{output}' has an empty reference")]
    EmptyOutputError { output: String },

    /// A flow output references an unknown flow input or node
    #[error("Output '{output}' references '{reference}' which is not found in the flow")]
    OutputReferenceNotFound { output: String, reference: String },

    /// A node asks for a variant that is not declared
    #[error("Variant '{variant}' of node '{node}' is not found")]
    NodeVariantNotFound { node: String, variant: String },

    /// One or more mapping expressions could not be resolved
    #[error("Couldn't find these mapping relations: {}", describe_missing(.missing))]
    MappingSourceNotFound { missing: Vec<MissingMapping> },

    /// No mapping was given for several input sources
    #[error("Inputs mapping is required when more than one input source is supplied: {}", sources.join(", "))]
    EmptyInputMappingError { sources: Vec<String> },

    /// A source list is empty, or no complete line could be merged
    #[error("{message}")]
    EmptyInputListError { message: String },

    /// Positional sources have different lengths
    #[error("{message}")]
    LineNumberNotAlign { message: String },

    /// Tool source code or template could not be found or loaded
    #[error("Node '{node}' has an invalid tool source: {message}")]
    InvalidSource { node: String, message: String },

    /// A class tool init argument is not a literal
    #[error("Init argument '{input}' of node '{node}' must be a literal value")]
    NonLiteralInitArgs { node: String, input: String },

    /// A prompt template failed to compile or render
    #[error("Template error in node '{node}': {message}")]
    TemplateError { node: String, message: String },

    /// No provider action is registered under the key
    #[error("The API '{api}' is not found")]
    APINotFound { api: String },

    /// No callable is registered for a tool
    #[error("Tool '{key}' used by node '{node}' is not registered")]
    ToolNotRegistered { node: String, key: String },

    /// Required tool init arguments are missing
    #[error("Node '{node}' is missing required inputs: {}", missing.join(", "))]
    MissingRequiredInputs { node: String, missing: Vec<String> },

    /// A required flow input is absent for a line
    #[error("Flow input '{input}' is required but not provided")]
    InputNotFound { input: String },

    /// A flow input value does not match its declared type
    #[error("Flow input '{input}' is not of type {expected}: {message}")]
    InputTypeError {
        input: String,
        expected: String,
        message: String,
    },

    /// A dotted property is missing from a referenced node output
    #[error("Node '{node}' references '{reference}', but property '{property}' is not found")]
    InvalidReferenceProperty {
        node: String,
        reference: String,
        property: String,
    },

    /// A tool call failed
    #[error("Execution failure in '{node}': {source}")]
    ToolExecution {
        node: String,
        #[source]
        source: ToolError,
    },

    /// A line did not finish in time
    #[error("Line {line} execution timeout for exceeding {timeout_secs} seconds")]
    LineTimeout { line: usize, timeout_secs: u64 },

    /// A line worker stopped without producing a result
    #[error("Line {line} was aborted: {message}")]
    LineAborted { line: usize, message: String },

    /// YAML parsing failed
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File system access failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid executor configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// One unresolved mapping expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingMapping {
    /// The dotted path that failed, e.g. `data.answer`
    pub path: String,
    /// Source prefix that matched, if any
    pub source: Option<String>,
    /// Keys available where the lookup stopped
    pub available_keys: Vec<String>,
}

fn describe_missing(missing: &[MissingMapping]) -> String {
    missing
        .iter()
        .map(|m| match &m.source {
            Some(source) => format!(
                "'{}' (available keys in '{}': [{}])",
                m.path,
                source,
                m.available_keys
                    .iter()
                    .map(|k| format!("'{}'", k))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            None => format!("'{}'", m.path),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

impl FlowError {
    /// Wrap a tool failure with the node that raised it
    pub fn tool_execution(node: impl Into<String>, source: ToolError) -> Self {
        Self::ToolExecution {
            node: node.into(),
            source,
        }
    }

    /// Create an input validation error for a node input
    pub fn input_validation(
        node: impl Into<String>,
        input: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::NodeInputValidationError {
            node: node.into(),
            input: input.into(),
            message: message.into(),
        }
    }

    /// Taxonomy name of the error
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateNodeName { .. } => "DuplicateNodeName",
            Self::InputReferenceNotFound { .. } => "InputReferenceNotFound",
            Self::ToolNotFoundInFlow { .. } => "ToolNotFoundInFlow",
            Self::ConnectionNotSet { .. } => "ConnectionNotSet",
            Self::ConnectionNotFound { .. } => "ConnectionNotFound",
            Self::InvalidConnectionType { .. } => "InvalidConnectionType",
            Self::NodeInputValidationError { .. } => "NodeInputValidationError",
            Self::NodeReferenceNotFound { .. } => "NodeReferenceNotFound",
            Self::InvalidNodeReference { .. } => "InvalidNodeReference",
            Self::NodeCircularDependency { .. } => "NodeCircularDependency",
            Self::EmptyOutputError { .. } => "EmptyOutputError",
            Self::OutputReferenceNotFound { .. } => "OutputReferenceNotFound",
            Self::NodeVariantNotFound { .. } => "NodeVariantNotFound",
            Self::MappingSourceNotFound { .. } => "MappingSourceNotFound",
            Self::EmptyInputMappingError { .. } => "EmptyInputMappingError",
            Self::EmptyInputListError { .. } => "EmptyInputListError",
            Self::LineNumberNotAlign { .. } => "LineNumberNotAlign",
            Self::InvalidSource { .. } => "InvalidSource",
            Self::NonLiteralInitArgs { .. } => "NonLiteralInitArgs",
            Self::TemplateError { .. } => "TemplateError",
            Self::APINotFound { .. } => "APINotFound",
            Self::ToolNotRegistered { .. } => "ToolNotRegistered",
            Self::MissingRequiredInputs { .. } => "MissingRequiredInputs",
            Self::InputNotFound { .. } => "InputNotFound",
            Self::InputTypeError { .. } => "InputTypeError",
            Self::InvalidReferenceProperty { .. } => "InvalidReferenceProperty",
            Self::ToolExecution { .. } => "ToolExecutionError",
            Self::LineTimeout { .. } => "LineExecutionTimeoutError",
            Self::LineAborted { .. } => "LineAborted",
            Self::Yaml(_) => "YamlError",
            Self::Serialization(_) => "SerializationError",
            Self::Io(_) => "IoError",
            Self::Configuration(_) => "ConfigurationError",
        }
    }

    /// Whether the flow author or the environment is at fault
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::APINotFound { .. }
            | Self::ToolNotRegistered { .. }
            | Self::MissingRequiredInputs { .. }
            | Self::LineTimeout { .. }
            | Self::LineAborted { .. }
            | Self::Io(_)
            | Self::Configuration(_) => ErrorKind::SystemError,
            _ => ErrorKind::UserError,
        }
    }

    /// Component that raised the error
    pub fn target(&self) -> ErrorTarget {
        match self {
            Self::DuplicateNodeName { .. }
            | Self::InputReferenceNotFound { .. }
            | Self::ToolNotFoundInFlow { .. }
            | Self::ConnectionNotSet { .. }
            | Self::ConnectionNotFound { .. }
            | Self::InvalidConnectionType { .. }
            | Self::NodeInputValidationError { .. }
            | Self::NodeReferenceNotFound { .. }
            | Self::InvalidNodeReference { .. }
            | Self::NodeCircularDependency { .. }
            | Self::EmptyOutputError { .. }
            | Self::OutputReferenceNotFound { .. }
            | Self::NodeVariantNotFound { .. }
            | Self::Yaml(_) => ErrorTarget::FlowValidator,
            Self::MappingSourceNotFound { .. }
            | Self::EmptyInputMappingError { .. }
            | Self::EmptyInputListError { .. }
            | Self::LineNumberNotAlign { .. } => ErrorTarget::InputMapping,
            Self::InvalidSource { .. }
            | Self::NonLiteralInitArgs { .. }
            | Self::ToolNotRegistered { .. }
            | Self::MissingRequiredInputs { .. } => ErrorTarget::ToolResolver,
            Self::APINotFound { .. }
            | Self::InputNotFound { .. }
            | Self::InputTypeError { .. }
            | Self::InvalidReferenceProperty { .. }
            | Self::TemplateError { .. } => ErrorTarget::Executor,
            Self::ToolExecution { .. } => ErrorTarget::Tool,
            Self::LineTimeout { .. } | Self::LineAborted { .. } => ErrorTarget::BatchCoordinator,
            Self::Serialization(_)
            | Self::Io(_)
            | Self::Configuration(_) => ErrorTarget::Runtime,
        }
    }

    /// Name of the node the error is about, if any
    pub fn node_name(&self) -> Option<&str> {
        match self {
            Self::InputReferenceNotFound { node, .. }
            | Self::ToolNotFoundInFlow { node, .. }
            | Self::ConnectionNotSet { node, .. }
            | Self::ConnectionNotFound { node, .. }
            | Self::InvalidConnectionType { node, .. }
            | Self::NodeInputValidationError { node, .. }
            | Self::NodeReferenceNotFound { node, .. }
            | Self::InvalidNodeReference { node, .. }
            | Self::NodeVariantNotFound { node, .. }
            | Self::InvalidSource { node, .. }
            | Self::NonLiteralInitArgs { node, .. }
            | Self::TemplateError { node, .. }
            | Self::ToolNotRegistered { node, .. }
            | Self::MissingRequiredInputs { node, .. }
            | Self::InvalidReferenceProperty { node, .. }
            | Self::ToolExecution { node, .. } => Some(node.as_str()),
            Self::DuplicateNodeName { name } => Some(name.as_str()),
            _ => None,
        }
    }

    /// Snapshot suitable for storing in run info
    pub fn to_serialized(&self) -> SerializedError {
        SerializedError::from(self)
    }
}

/// Serializable record of a [`FlowError`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub code: String,
    pub kind: ErrorKind,
    pub target: ErrorTarget,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl From<&FlowError> for SerializedError {
    fn from(err: &FlowError) -> Self {
        Self {
            code: err.code().to_string(),
            kind: err.kind(),
            target: err.target(),
            message: err.to_string(),
            node_name: err.node_name().map(str::to_string),
        }
    }
}

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_user_errors() {
        let err = FlowError::NodeCircularDependency {
            nodes: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.kind(), ErrorKind::UserError);
        assert_eq!(err.target(), ErrorTarget::FlowValidator);
        assert_eq!(
            err.to_string(),
            "Circular dependency detected among nodes: a, b"
        );
    }

    #[test]
    fn test_api_not_found_is_system_error() {
        let err = FlowError::APINotFound {
            api: "Bing.search".into(),
        };
        assert_eq!(err.kind(), ErrorKind::SystemError);
        assert_eq!(err.target(), ErrorTarget::Executor);
        assert!(err.node_name().is_none());
    }

    #[test]
    fn test_invalid_connection_type_message_names_both_types() {
        let err = FlowError::InvalidConnectionType {
            node: "search".into(),
            connection: "conn1".into(),
            actual: "AzureOpenAIConnection".into(),
            expected: vec!["BingConnection".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("search"));
        assert!(msg.contains("AzureOpenAIConnection"));
        assert!(msg.contains("BingConnection"));
        assert_eq!(err.node_name(), Some("search"));
    }

    #[test]
    fn test_mapping_source_not_found_lists_available_keys() {
        let err = FlowError::MappingSourceNotFound {
            missing: vec![MissingMapping {
                path: "data.answer".into(),
                source: Some("data".into()),
                available_keys: vec!["q".into(), "a".into()],
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("'data.answer'"));
        assert!(msg.contains("['q', 'a']"));
    }

    #[test]
    fn test_serialized_error_carries_node_name() {
        let err = FlowError::tool_execution("x", ToolError::execution("boom"));
        let serialized = err.to_serialized();
        assert_eq!(serialized.code, "ToolExecutionError");
        assert_eq!(serialized.node_name.as_deref(), Some("x"));
        assert_eq!(serialized.target, ErrorTarget::Tool);
        assert!(serialized.message.contains("boom"));
    }
}

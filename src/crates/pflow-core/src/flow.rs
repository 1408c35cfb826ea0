//! Flow model - tools, nodes, input assignments and flow definitions
//!
//! A [`Flow`] is the parsed form of a `flow.dag.yaml` document:
//!
//! ```yaml
//! inputs:
//!   question: { type: string }
//! outputs:
//!   answer: { type: string, reference: ${answer_node.output} }
//! tools:
//!   - name: echo
//!     type: python
//!     function: echo
//!     inputs:
//!       text: { type: [string] }
//! nodes:
//!   - name: answer_node
//!     tool: echo
//!     inputs:
//!       text: ${inputs.question}
//! ```
//!
//! Node input strings shaped like `${inputs.x}` or `${node.output.a.b}` parse into
//! [`InputAssignment::FlowInput`] and [`InputAssignment::NodeReference`]; anything else
//! is an [`InputAssignment::Literal`].
//!
//! The model is read-only once loaded. Validation and ordering live in
//! [`crate::validator`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use indexmap::IndexMap;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};

/// Kind of a tool, selecting how it is resolved into a callable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    /// Registered native function or class
    Python,
    /// Provider chat/completion call with a prompt template
    Llm,
    /// Prompt template rendered to a string
    Prompt,
    /// Registered function that takes a prompt template
    CustomLlm,
    /// Provider API invoked directly
    #[serde(rename = "_action")]
    Action,
}

impl ToolType {
    /// Whether the tool talks to an LLM provider
    pub fn is_llm(&self) -> bool {
        matches!(self, ToolType::Llm | ToolType::CustomLlm)
    }
}

/// Primitive value types understood by tool inputs and flow inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int,
    Double,
    Bool,
    String,
    Secret,
    PromptTemplate,
    List,
    Object,
    FilePath,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Double => "double",
            ValueType::Bool => "bool",
            ValueType::String => "string",
            ValueType::Secret => "secret",
            ValueType::PromptTemplate => "prompt_template",
            ValueType::List => "list",
            ValueType::Object => "object",
            ValueType::FilePath => "file_path",
        }
    }

    /// Coerce a raw value into this type
    ///
    /// Strings are parsed for numbers, booleans, lists and objects. Text types
    /// accept any scalar and stringify it.
    pub fn parse_value(&self, value: &Value) -> std::result::Result<Value, String> {
        match self {
            ValueType::Int => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
                Value::Number(n) => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                    _ => Err(format!("{} is not an integer", value)),
                },
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| format!("'{}' is not an integer", s)),
                other => Err(format!("{} is not an integer", other)),
            },
            ValueType::Double => match value {
                Value::Number(n) => n
                    .as_f64()
                    .map(Value::from)
                    .ok_or_else(|| format!("{} is not a number", value)),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|_| format!("'{}' is not a number", s)),
                other => Err(format!("{} is not a number", other)),
            },
            ValueType::Bool => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
                other => Err(format!("{} is not a boolean", other)),
            },
            ValueType::String
            | ValueType::Secret
            | ValueType::PromptTemplate
            | ValueType::FilePath => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Null => Err("null is not a string".to_string()),
                other => Ok(Value::String(other.to_string())),
            },
            ValueType::List => match value {
                Value::Array(_) => Ok(value.clone()),
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(parsed @ Value::Array(_)) => Ok(parsed),
                    _ => Err(format!("'{}' is not a list", s)),
                },
                other => Err(format!("{} is not a list", other)),
            },
            ValueType::Object => match value {
                Value::Object(_) => Ok(value.clone()),
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(parsed @ Value::Object(_)) => Ok(parsed),
                    _ => Err(format!("'{}' is not an object", s)),
                },
                other => Err(format!("{} is not an object", other)),
            },
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared input type: a primitive, or a connection type such as
/// `AzureOpenAIConnection`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InputType {
    Value(ValueType),
    Connection(String),
}

impl InputType {
    pub fn connection_type(&self) -> Option<&str> {
        match self {
            InputType::Connection(name) => Some(name),
            InputType::Value(_) => None,
        }
    }
}

impl FromStr for InputType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let primitive = match s {
            "int" => Some(ValueType::Int),
            "double" | "float" => Some(ValueType::Double),
            "bool" => Some(ValueType::Bool),
            "string" => Some(ValueType::String),
            "secret" => Some(ValueType::Secret),
            "prompt_template" => Some(ValueType::PromptTemplate),
            "list" => Some(ValueType::List),
            "object" => Some(ValueType::Object),
            "file_path" => Some(ValueType::FilePath),
            _ => None,
        };
        match primitive {
            Some(vt) => Ok(InputType::Value(vt)),
            None if s.ends_with("Connection") => Ok(InputType::Connection(s.to_string())),
            None => Err(format!("unknown input type '{}'", s)),
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputType::Value(vt) => f.write_str(vt.as_str()),
            InputType::Connection(name) => f.write_str(name),
        }
    }
}

impl Serialize for InputType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InputType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(InputType),
    Many(Vec<InputType>),
}

fn one_or_many<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<InputType>, D::Error> {
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(t) => vec![t],
        OneOrMany::Many(ts) => ts,
    })
}

/// Declared input of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDefinition {
    /// Accepted types; more than one disables literal coercion
    #[serde(rename = "type", deserialize_with = "one_or_many")]
    pub types: Vec<InputType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InputDefinition {
    pub fn new(types: Vec<InputType>) -> Self {
        Self {
            types,
            default: None,
            description: None,
        }
    }

    /// Connection type names accepted by this input
    pub fn connection_types(&self) -> Vec<String> {
        self.types
            .iter()
            .filter_map(|t| t.connection_type().map(str::to_string))
            .collect()
    }

    pub fn accepts_connection(&self) -> bool {
        self.types.iter().any(|t| t.connection_type().is_some())
    }

    /// The single primitive type, when exactly one is declared
    pub fn single_value_type(&self) -> Option<ValueType> {
        match self.types.as_slice() {
            [InputType::Value(vt)] => Some(*vt),
            _ => None,
        }
    }
}

/// Where the code or template of a tool comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeSource {
    Inline(String),
    FilePath(PathBuf),
}

/// A named, typed unit of computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    #[serde(default)]
    pub inputs: IndexMap<String, InputDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Tool {
    pub fn new(name: impl Into<String>, tool_type: ToolType) -> Self {
        Self {
            name: name.into(),
            tool_type,
            inputs: IndexMap::new(),
            module: None,
            class_name: None,
            function: None,
            code: None,
            source: None,
            description: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, types: Vec<InputType>) -> Self {
        self.inputs.insert(name.into(), InputDefinition::new(types));
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_source(mut self, path: impl Into<String>) -> Self {
        self.source = Some(path.into());
        self
    }

    /// Inline code wins over a source path
    pub fn code_source(&self) -> Option<CodeSource> {
        if let Some(code) = &self.code {
            return Some(CodeSource::Inline(code.clone()));
        }
        self.source
            .as_ref()
            .map(|path| CodeSource::FilePath(PathBuf::from(path)))
    }

    /// Key the callable is registered under: `module.Class.function`, or the
    /// tool name when no identifiers are set
    pub fn registry_key(&self) -> String {
        let parts: Vec<&str> = [&self.module, &self.class_name, &self.function]
            .iter()
            .filter_map(|p| p.as_deref())
            .collect();
        if parts.is_empty() {
            self.name.clone()
        } else {
            parts.join(".")
        }
    }
}

/// Reference to another node's output, optionally to a dotted property of it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeReference {
    pub node: String,
    pub section: String,
    pub property: Option<String>,
}

impl NodeReference {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            section: "output".to_string(),
            property: None,
        }
    }

    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    /// Property path split on dots
    pub fn property_path(&self) -> Vec<&str> {
        self.property
            .as_deref()
            .map(|p| p.split('.').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// Where a node input, skip condition or flow output gets its value from
#[derive(Debug, Clone, PartialEq)]
pub enum InputAssignment {
    Literal(Value),
    FlowInput(String),
    NodeReference(NodeReference),
}

/// Inner text of a `${...}` expression, if `raw` is one
pub fn reference_expression(raw: &str) -> Option<&str> {
    let inner = raw.trim().strip_prefix("${")?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains(['{', '}']) {
        return None;
    }
    Some(inner.trim())
}

impl InputAssignment {
    /// Parse a raw YAML/JSON value
    pub fn parse(value: Value) -> Self {
        let Value::String(raw) = &value else {
            return InputAssignment::Literal(value);
        };
        let Some(inner) = reference_expression(raw) else {
            return InputAssignment::Literal(value);
        };
        if let Some(name) = inner.strip_prefix("inputs.") {
            return InputAssignment::FlowInput(name.to_string());
        }
        let mut parts = inner.splitn(3, '.');
        let node = parts.next().unwrap_or_default().to_string();
        let section = parts.next().unwrap_or("output").to_string();
        let property = parts.next().map(str::to_string);
        InputAssignment::NodeReference(NodeReference {
            node,
            section,
            property,
        })
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        InputAssignment::Literal(value.into())
    }

    pub fn flow_input(name: impl Into<String>) -> Self {
        InputAssignment::FlowInput(name.into())
    }

    pub fn node_output(node: impl Into<String>) -> Self {
        InputAssignment::NodeReference(NodeReference::new(node))
    }

    /// Null or empty-string literal
    pub fn is_empty_literal(&self) -> bool {
        match self {
            InputAssignment::Literal(Value::Null) => true,
            InputAssignment::Literal(Value::String(s)) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_node_reference(&self) -> Option<&NodeReference> {
        match self {
            InputAssignment::NodeReference(r) => Some(r),
            _ => None,
        }
    }

    /// Canonical `${...}` expression, used to key aggregation inputs
    pub fn expression(&self) -> String {
        match self {
            InputAssignment::Literal(Value::String(s)) => s.clone(),
            InputAssignment::Literal(v) => v.to_string(),
            InputAssignment::FlowInput(name) => format!("${{inputs.{}}}", name),
            InputAssignment::NodeReference(r) => match &r.property {
                Some(p) => format!("${{{}.{}.{}}}", r.node, r.section, p),
                None => format!("${{{}.{}}}", r.node, r.section),
            },
        }
    }
}

impl Serialize for InputAssignment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            InputAssignment::Literal(v) => v.serialize(serializer),
            other => serializer.serialize_str(&other.expression()),
        }
    }
}

impl<'de> Deserialize<'de> for InputAssignment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(InputAssignment::parse(Value::deserialize(deserializer)?))
    }
}

/// Skip a node when `condition` is truthy, yielding `return_value` instead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipCondition {
    #[serde(rename = "when", alias = "condition")]
    pub condition: InputAssignment,
    #[serde(rename = "return", alias = "return_value")]
    pub return_value: InputAssignment,
}

/// One DAG vertex
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default)]
    pub inputs: IndexMap<String, InputAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<SkipCondition>,
    /// Aggregation node, run once per batch over columnar inputs
    #[serde(default, alias = "aggregation")]
    pub reduce: bool,
    #[serde(default)]
    pub use_variants: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tool: Some(tool.into()),
            inputs: IndexMap::new(),
            connection: None,
            api: None,
            provider: None,
            skip: None,
            reduce: false,
            use_variants: false,
            comment: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, assignment: InputAssignment) -> Self {
        self.inputs.insert(name.into(), assignment);
        self
    }

    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn with_api(mut self, api: impl Into<String>) -> Self {
        self.api = Some(api.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_skip(mut self, condition: InputAssignment, return_value: InputAssignment) -> Self {
        self.skip = Some(SkipCondition {
            condition,
            return_value,
        });
        self
    }

    pub fn reduce(mut self) -> Self {
        self.reduce = true;
        self
    }

    /// Every assignment of the node: inputs first, then skip condition and return value
    pub fn assignments(&self) -> impl Iterator<Item = &InputAssignment> {
        self.inputs.values().chain(
            self.skip
                .iter()
                .flat_map(|s| [&s.condition, &s.return_value]),
        )
    }

    /// Nodes this node reads from
    pub fn node_references(&self) -> impl Iterator<Item = &NodeReference> {
        self.assignments().filter_map(InputAssignment::as_node_reference)
    }

    /// Flow inputs this node reads
    pub fn flow_input_references(&self) -> impl Iterator<Item = &str> {
        self.assignments().filter_map(|a| match a {
            InputAssignment::FlowInput(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Declared flow input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInputDefinition {
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_chat_input: bool,
}

impl FlowInputDefinition {
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            default: None,
            description: None,
            is_chat_input: false,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

fn default_output_type() -> ValueType {
    ValueType::String
}

/// Declared flow output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowOutputDefinition {
    #[serde(rename = "type", default = "default_output_type")]
    pub value_type: ValueType,
    pub reference: InputAssignment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_chat_output: bool,
}

impl FlowOutputDefinition {
    pub fn new(reference: InputAssignment) -> Self {
        Self {
            value_type: ValueType::String,
            reference,
            description: None,
            is_chat_output: false,
        }
    }
}

/// A single variant body of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVariant {
    pub node: VariantNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Node body inside a variant; the name comes from the node using it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default)]
    pub inputs: IndexMap<String, InputAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// All variants of a node and the one used when none is selected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVariants {
    pub default_variant_id: String,
    pub variants: IndexMap<String, NodeVariant>,
}

/// Parsed flow definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: IndexMap<String, FlowInputDefinition>,
    #[serde(default)]
    pub outputs: IndexMap<String, FlowOutputDefinition>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub node_variants: IndexMap<String, NodeVariants>,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            ..Default::default()
        }
    }

    /// Parse a flow from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut flow: Flow = serde_yaml::from_str(yaml)?;
        if flow.id.is_empty() {
            flow.id = if flow.name.is_empty() {
                "default_flow".to_string()
            } else {
                flow.name.clone()
            };
        }
        Ok(flow)
    }

    /// Load a flow from a YAML file
    ///
    /// When the flow has no name, the parent directory name is used.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut flow = Self::from_yaml_str(&content)?;
        if flow.name.is_empty() {
            if let Some(dir) = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
            {
                flow.name = dir.to_string();
            }
        }
        Ok(flow)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn with_input(mut self, name: impl Into<String>, input: FlowInputDefinition) -> Self {
        self.inputs.insert(name.into(), input);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, reference: InputAssignment) -> Self {
        self.outputs
            .insert(name.into(), FlowOutputDefinition::new(reference));
        self
    }

    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn get_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn get_tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn is_aggregation_node(&self, name: &str) -> bool {
        self.get_node(name).map(|n| n.reduce).unwrap_or(false)
    }

    /// Replace every `use_variants` node with the selected variant
    ///
    /// `selected` maps node names to variant ids; nodes not listed get their
    /// default variant.
    pub fn apply_variants(mut self, selected: &HashMap<String, String>) -> Result<Self> {
        for node in self.nodes.iter_mut().filter(|n| n.use_variants) {
            let variants =
                self.node_variants
                    .get(&node.name)
                    .ok_or_else(|| FlowError::NodeVariantNotFound {
                        node: node.name.clone(),
                        variant: selected
                            .get(&node.name)
                            .cloned()
                            .unwrap_or_else(|| "default".to_string()),
                    })?;
            let variant_id = selected
                .get(&node.name)
                .unwrap_or(&variants.default_variant_id);
            let variant =
                variants
                    .variants
                    .get(variant_id)
                    .ok_or_else(|| FlowError::NodeVariantNotFound {
                        node: node.name.clone(),
                        variant: variant_id.clone(),
                    })?;
            let body = variant.node.clone();
            node.tool = body.tool;
            node.inputs = body.inputs;
            node.connection = body.connection;
            node.api = body.api;
            node.provider = body.provider;
            node.use_variants = false;
        }
        Ok(self)
    }

    /// Select one variant for one node, defaults for the rest
    pub fn apply_variant(self, node: &str, variant_id: &str) -> Result<Self> {
        let mut selected = HashMap::new();
        selected.insert(node.to_string(), variant_id.to_string());
        self.apply_variants(&selected)
    }
}

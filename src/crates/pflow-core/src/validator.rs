//! Flow validation
//!
//! [`FlowValidator::ensure_flow_valid`] turns a raw [`Flow`] plus the supplied
//! connections into a [`ValidatedFlow`]. The passes run in a fixed order and stop
//! at the first violation:
//!
//! 1. default variants are applied
//! 2. node names are unique
//! 3. flow-input references exist
//! 4. every node's tool is declared in the flow
//! 5. LLM nodes have a connection and an api; the provider is inferred from the
//!    connection type when not set
//! 6. node inputs are typed: empty literals dropped, connections bound and
//!    type-checked, primitive literals coerced
//! 7. nodes are ordered topologically (stable, original order breaks ties)
//! 8. outputs are checked; outputs of aggregation nodes are dropped with a warning
//!
//! All failures are [`crate::error::ErrorKind::UserError`]s except a missing
//! provider action, which is a registration problem.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionSet};
use crate::error::{FlowError, Result};
use crate::flow::{
    Flow, FlowOutputDefinition, InputAssignment, InputDefinition, Node, Tool, ToolType,
};
use crate::tool::{action_key, ToolRegistry};

/// Connections bound to one node, keyed by parameter name
pub type NodeConnections = IndexMap<String, Arc<Connection>>;

/// A flow that passed validation
///
/// Nodes are in topological order, literal inputs are typed and every output
/// resolves to a flow input or a per-line node.
#[derive(Debug, Clone)]
pub struct ValidatedFlow {
    flow: Flow,
    connections: HashMap<String, NodeConnections>,
    aggregation_outputs: IndexMap<String, FlowOutputDefinition>,
}

impl ValidatedFlow {
    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn name(&self) -> &str {
        &self.flow.name
    }

    /// Per-line nodes in execution order
    pub fn line_nodes(&self) -> impl Iterator<Item = &Node> {
        self.flow.nodes.iter().filter(|n| !n.reduce)
    }

    /// Aggregation nodes in execution order
    pub fn aggregation_nodes(&self) -> impl Iterator<Item = &Node> {
        self.flow.nodes.iter().filter(|n| n.reduce)
    }

    pub fn has_aggregation_nodes(&self) -> bool {
        self.flow.nodes.iter().any(|n| n.reduce)
    }

    /// Connections bound to a node's parameters
    pub fn node_connections(&self, node: &str) -> Option<&NodeConnections> {
        self.connections.get(node)
    }

    /// Outputs dropped from line results because they reference aggregation nodes
    pub fn aggregation_outputs(&self) -> &IndexMap<String, FlowOutputDefinition> {
        &self.aggregation_outputs
    }

    /// Values each line must capture for the aggregation pass
    ///
    /// These are the flow-input and per-line node references used by aggregation
    /// nodes, deduplicated by expression.
    pub fn aggregation_references(&self) -> Vec<InputAssignment> {
        let mut seen = HashSet::new();
        let mut references = Vec::new();
        for node in self.aggregation_nodes() {
            for assignment in node.assignments() {
                let captured = match assignment {
                    InputAssignment::FlowInput(_) => true,
                    InputAssignment::NodeReference(r) => !self.flow.is_aggregation_node(&r.node),
                    InputAssignment::Literal(_) => false,
                };
                if captured && seen.insert(assignment.expression()) {
                    references.push(assignment.clone());
                }
            }
        }
        references
    }
}

/// Validates flows against a tool registry
pub struct FlowValidator<'a> {
    registry: &'a ToolRegistry,
}

impl<'a> FlowValidator<'a> {
    pub fn new(registry: &'a ToolRegistry) -> Self {
        Self { registry }
    }

    /// Validate and normalize a flow
    pub fn ensure_flow_valid(&self, flow: Flow, connections: &ConnectionSet) -> Result<ValidatedFlow> {
        let mut flow = flow.apply_variants(&HashMap::new())?;

        ensure_unique_names(&flow)?;
        ensure_flow_input_references(&flow)?;
        ensure_tools_exist(&flow)?;

        let mut bound = HashMap::new();
        for node in flow.nodes.iter_mut() {
            let tool = flow
                .tools
                .iter()
                .find(|t| Some(&t.name) == node.tool.as_ref())
                .ok_or_else(|| FlowError::ToolNotFoundInFlow {
                    node: node.name.clone(),
                    tool: node.tool.clone().unwrap_or_default(),
                })?;
            self.ensure_llm_selection(node, tool, connections)?;
            let node_connections = self.ensure_node_inputs_type(node, tool, connections)?;
            if !node_connections.is_empty() {
                bound.insert(node.name.clone(), node_connections);
            }
        }

        flow.nodes = ensure_nodes_order(std::mem::take(&mut flow.nodes))?;
        let aggregation_outputs = ensure_outputs_valid(&mut flow)?;

        debug!(
            flow = %flow.name,
            nodes = flow.nodes.len(),
            outputs = flow.outputs.len(),
            "flow validated"
        );
        Ok(ValidatedFlow {
            flow,
            connections: bound,
            aggregation_outputs,
        })
    }

    /// Check connection and api selection, filling in the provider
    fn ensure_llm_selection(
        &self,
        node: &mut Node,
        tool: &Tool,
        connections: &ConnectionSet,
    ) -> Result<()> {
        if !matches!(tool.tool_type, ToolType::Llm | ToolType::Action) {
            return Ok(());
        }
        if tool.tool_type == ToolType::Llm && node.connection.is_none() {
            return Err(FlowError::ConnectionNotSet {
                node: node.name.clone(),
                missing: "connection".to_string(),
            });
        }
        if node.api.is_none() {
            return Err(FlowError::ConnectionNotSet {
                node: node.name.clone(),
                missing: "api".to_string(),
            });
        }
        if node.provider.is_none() {
            let Some(name) = node.connection.as_deref() else {
                return Err(FlowError::ConnectionNotSet {
                    node: node.name.clone(),
                    missing: "provider".to_string(),
                });
            };
            let connection = connections.require(&node.name, name)?;
            let provider = self.infer_provider(&connection.connection_type);
            debug!(node = %node.name, provider = %provider, "inferred provider from connection");
            node.provider = Some(provider);
        }
        Ok(())
    }

    fn infer_provider(&self, connection_type: &str) -> String {
        self.registry
            .provider_for(connection_type)
            .map(str::to_string)
            .unwrap_or_else(|| {
                connection_type
                    .strip_suffix("Connection")
                    .unwrap_or(connection_type)
                    .to_string()
            })
    }

    /// Declared inputs of the callable a node will invoke
    fn declared_inputs(&self, node: &Node, tool: &Tool) -> Result<IndexMap<String, InputDefinition>> {
        match tool.tool_type {
            ToolType::Llm | ToolType::Action => {
                let provider = node.provider.as_deref().unwrap_or_default();
                let api = node.api.as_deref().unwrap_or_default();
                let action = self.registry.action(provider, api).ok_or_else(|| {
                    FlowError::APINotFound {
                        api: action_key(provider, api),
                    }
                })?;
                let mut inputs = action.signature.inputs.clone();
                for (name, definition) in &tool.inputs {
                    inputs
                        .entry(name.clone())
                        .or_insert_with(|| definition.clone());
                }
                Ok(inputs)
            }
            ToolType::Python | ToolType::Prompt | ToolType::CustomLlm => Ok(tool.inputs.clone()),
        }
    }

    /// Drop empty literals, bind connections and coerce primitive literals
    fn ensure_node_inputs_type(
        &self,
        node: &mut Node,
        tool: &Tool,
        connections: &ConnectionSet,
    ) -> Result<NodeConnections> {
        node.inputs.retain(|_, assignment| !assignment.is_empty_literal());

        let declared = self.declared_inputs(node, tool)?;
        if let Some(name) = node.connection.clone() {
            match declared.iter().find(|(_, def)| def.accepts_connection()) {
                Some((param, _)) => {
                    node.inputs
                        .insert(param.clone(), InputAssignment::literal(name));
                }
                None => warn!(
                    node = %node.name,
                    connection = %name,
                    "tool declares no connection input, connection ignored"
                ),
            }
        }

        let mut bound = NodeConnections::new();
        for (input, assignment) in node.inputs.iter_mut() {
            let Some(definition) = declared.get(input) else {
                continue;
            };
            let InputAssignment::Literal(value) = assignment else {
                continue;
            };

            if definition.accepts_connection() {
                if let Some(connection) = bind_connection(&node.name, value, definition, connections)? {
                    bound.insert(input.clone(), connection);
                    continue;
                }
            }

            if let Some(value_type) = definition.single_value_type() {
                let typed = value_type.parse_value(value).map_err(|message| {
                    FlowError::NodeInputValidationError {
                        node: node.name.clone(),
                        input: input.clone(),
                        message,
                    }
                })?;
                *value = typed;
            }
        }
        Ok(bound)
    }
}

/// Resolve a literal naming a connection and check its type
///
/// Returns `None` when the input also accepts plain values and the literal is not
/// a known connection name.
fn bind_connection(
    node: &str,
    value: &Value,
    definition: &InputDefinition,
    connections: &ConnectionSet,
) -> Result<Option<Arc<Connection>>> {
    let accepts_values = definition.connection_types().len() < definition.types.len();
    let Some(name) = value.as_str() else {
        return if accepts_values {
            Ok(None)
        } else {
            Err(FlowError::ConnectionNotFound {
                node: node.to_string(),
                connection: value.to_string(),
            })
        };
    };
    let connection = match connections.get(name) {
        Some(connection) => connection.clone(),
        None if accepts_values => return Ok(None),
        None => return Err(FlowError::ConnectionNotFound {
            node: node.to_string(),
            connection: name.to_string(),
        }),
    };

    let expected = definition.connection_types();
    if !expected.contains(&connection.connection_type) {
        return Err(FlowError::InvalidConnectionType {
            node: node.to_string(),
            connection: name.to_string(),
            actual: connection.connection_type.clone(),
            expected,
        });
    }
    Ok(Some(connection))
}

fn ensure_unique_names(flow: &Flow) -> Result<()> {
    let mut names = HashSet::new();
    for node in &flow.nodes {
        if !names.insert(node.name.as_str()) {
            return Err(FlowError::DuplicateNodeName {
                name: node.name.clone(),
            });
        }
    }
    Ok(())
}

fn ensure_flow_input_references(flow: &Flow) -> Result<()> {
    for node in &flow.nodes {
        if let Some(input) = node
            .flow_input_references()
            .find(|input| !flow.inputs.contains_key(*input))
        {
            return Err(FlowError::InputReferenceNotFound {
                node: node.name.clone(),
                input: input.to_string(),
            });
        }
    }
    Ok(())
}

fn ensure_tools_exist(flow: &Flow) -> Result<()> {
    for node in &flow.nodes {
        let tool = node.tool.as_deref().unwrap_or_default();
        if flow.get_tool(tool).is_none() {
            return Err(FlowError::ToolNotFoundInFlow {
                node: node.name.clone(),
                tool: tool.to_string(),
            });
        }
    }
    Ok(())
}

/// Stable greedy topological sort over node references
pub fn ensure_nodes_order(nodes: Vec<Node>) -> Result<Vec<Node>> {
    let names: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    let aggregation: HashSet<&str> = nodes
        .iter()
        .filter(|n| n.reduce)
        .map(|n| n.name.as_str())
        .collect();

    for node in &nodes {
        for reference in node.node_references() {
            if !names.contains(reference.node.as_str()) {
                return Err(FlowError::NodeReferenceNotFound {
                    node: node.name.clone(),
                    reference: reference.node.clone(),
                });
            }
            if !node.reduce && aggregation.contains(reference.node.as_str()) {
                return Err(FlowError::InvalidNodeReference {
                    node: node.name.clone(),
                    reference: reference.node.clone(),
                });
            }
        }
    }

    let mut picked: HashSet<String> = HashSet::new();
    let mut ordered = Vec::with_capacity(nodes.len());
    let mut remaining = nodes;
    while !remaining.is_empty() {
        let ready = remaining.iter().position(|node| {
            node.node_references()
                .all(|reference| picked.contains(&reference.node))
        });
        match ready {
            Some(index) => {
                let node = remaining.remove(index);
                picked.insert(node.name.clone());
                ordered.push(node);
            }
            None => {
                return Err(FlowError::NodeCircularDependency {
                    nodes: remaining.into_iter().map(|n| n.name).collect(),
                })
            }
        }
    }
    Ok(ordered)
}

/// Check outputs; split off the ones that reference aggregation nodes
fn ensure_outputs_valid(flow: &mut Flow) -> Result<IndexMap<String, FlowOutputDefinition>> {
    let mut dropped = IndexMap::new();
    let mut kept = IndexMap::new();
    for (name, output) in std::mem::take(&mut flow.outputs) {
        if output.reference.is_empty_literal() {
            return Err(FlowError::EmptyOutputError { output: name });
        }
        let aggregation_node = match &output.reference {
            InputAssignment::FlowInput(input) if !flow.inputs.contains_key(input) => None,
            InputAssignment::FlowInput(_) | InputAssignment::Literal(_) => Some(false),
            InputAssignment::NodeReference(reference) => {
                flow.get_node(&reference.node).map(|node| node.reduce)
            }
        };
        match aggregation_node {
            None => {
                return Err(FlowError::OutputReferenceNotFound {
                    output: name,
                    reference: output.reference.expression(),
                });
            }
            Some(true) => {
                warn!(
                    output = %name,
                    reference = %output.reference.expression(),
                    "output references an aggregation node and is dropped from line results"
                );
                dropped.insert(name, output);
            }
            Some(false) => {
                kept.insert(name, output);
            }
        }
    }
    flow.outputs = kept;
    Ok(dropped)
}

/// Validate a flow with a one-off validator
pub fn ensure_flow_valid(
    flow: Flow,
    connections: &ConnectionSet,
    registry: &ToolRegistry,
) -> Result<ValidatedFlow> {
    FlowValidator::new(registry).ensure_flow_valid(flow, connections)
}

//! Connections - named, typed credential bundles resolved into node inputs
//!
//! Connections are supplied by the caller, never embedded in a flow. The JSON
//! shape accepted by [`ConnectionSet::from_json`] is:
//!
//! ```json
//! {
//!   "azure_open_ai_connection": {
//!     "type": "AzureOpenAIConnection",
//!     "value": { "api_key": "...", "api_base": "https://..." }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FlowError, Result};

const SECRET_MARKERS: [&str; 5] = ["key", "secret", "token", "password", "credential"];

/// A typed credential/config bundle
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub name: String,
    #[serde(rename = "type")]
    pub connection_type: String,
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl Connection {
    pub fn new(name: impl Into<String>, connection_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_type: connection_type.into(),
            values: Map::new(),
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Value form handed to tools
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Rebuild a connection from the value form
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    fn is_secret_key(key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        SECRET_MARKERS.iter().any(|marker| key.contains(marker))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted: Map<String, Value> = self
            .values
            .iter()
            .map(|(k, v)| {
                if Self::is_secret_key(k) {
                    (k.clone(), Value::String("******".to_string()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect();
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("connection_type", &self.connection_type)
            .field("values", &redacted)
            .finish()
    }
}

#[derive(Deserialize)]
struct ConnectionEntry {
    #[serde(rename = "type")]
    connection_type: String,
    #[serde(default)]
    value: Map<String, Value>,
}

/// Read-only set of connections shared by every line
#[derive(Debug, Clone, Default)]
pub struct ConnectionSet {
    connections: HashMap<String, Arc<Connection>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `{name: {type, value}}` mapping
    pub fn from_json(value: Value) -> Result<Self> {
        let entries: HashMap<String, ConnectionEntry> = serde_json::from_value(value)?;
        let connections = entries
            .into_iter()
            .map(|(name, entry)| {
                let connection = Connection {
                    name: name.clone(),
                    connection_type: entry.connection_type,
                    values: entry.value,
                };
                (name, Arc::new(connection))
            })
            .collect();
        Ok(Self { connections })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        Self::from_json(value)
    }

    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.insert(connection);
        self
    }

    pub fn insert(&mut self, connection: Connection) {
        self.connections
            .insert(connection.name.clone(), Arc::new(connection));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Connection>> {
        self.connections.get(name)
    }

    /// Look up a connection used by a node
    pub fn require(&self, node: &str, name: &str) -> Result<Arc<Connection>> {
        self.connections
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::ConnectionNotFound {
                node: node.to_string(),
                connection: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

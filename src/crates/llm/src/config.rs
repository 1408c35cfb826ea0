//! Client configuration built from flow connections.

use std::time::Duration;

use pflow_core::connection::Connection;
use serde::{Deserialize, Serialize};

use crate::error::{LlmError, Result};

pub const OPENAI_CONNECTION: &str = "OpenAIConnection";
pub const AZURE_OPENAI_CONNECTION: &str = "AzureOpenAIConnection";

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_AZURE_API_VERSION: &str = "2024-02-01";

/// Which URL layout and auth header the endpoint expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiFlavor {
    /// `{base}/chat/completions`, `Authorization: Bearer`
    OpenAi,
    /// `{base}/openai/deployments/{deployment}/chat/completions?api-version=`, `api-key`
    AzureOpenAi,
}

/// Configuration for an OpenAI-compatible endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    pub flavor: ApiFlavor,

    pub api_key: String,

    /// Base URL without a trailing slash.
    ///
    /// Examples:
    /// - OpenAI: "https://api.openai.com/v1"
    /// - Azure: "https://my-resource.openai.azure.com"
    pub base_url: String,

    /// Azure only.
    pub api_version: Option<String>,

    /// OpenAI only.
    pub organization: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout: Duration,
}

impl std::fmt::Debug for RemoteLlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteLlmConfig")
            .field("flavor", &self.flavor)
            .field("api_key", &"***")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("organization", &self.organization)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteLlmConfig {
    /// OpenAI-flavored configuration.
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            flavor: ApiFlavor::OpenAi,
            api_key: api_key.into(),
            base_url: trim_base(base_url.into()),
            api_version: None,
            organization: None,
            timeout: default_timeout(),
        }
    }

    /// Azure-flavored configuration.
    pub fn azure(
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            flavor: ApiFlavor::AzureOpenAi,
            api_key: api_key.into(),
            base_url: trim_base(api_base.into()),
            api_version: Some(api_version.into()),
            organization: None,
            timeout: default_timeout(),
        }
    }

    /// Build from an `OpenAIConnection` or `AzureOpenAIConnection`.
    ///
    /// Reads `api_key` plus `base_url`/`organization` (OpenAI) or
    /// `api_base`/`api_version` (Azure); an optional numeric `timeout` is in seconds.
    pub fn from_connection(connection: &Connection) -> Result<Self> {
        let required = |key: &str| {
            connection
                .get_str(key)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    LlmError::ConfigError(format!(
                        "connection '{}' has no '{}'",
                        connection.name, key
                    ))
                })
        };

        let mut config = match connection.connection_type.as_str() {
            OPENAI_CONNECTION => {
                let base_url = connection
                    .get_str("base_url")
                    .filter(|v| !v.is_empty())
                    .unwrap_or(DEFAULT_OPENAI_BASE_URL);
                let mut config = Self::new(required("api_key")?, base_url);
                config.organization = connection
                    .get_str("organization")
                    .filter(|v| !v.is_empty())
                    .map(str::to_string);
                config
            }
            AZURE_OPENAI_CONNECTION => Self::azure(
                required("api_key")?,
                required("api_base")?,
                connection
                    .get_str("api_version")
                    .unwrap_or(DEFAULT_AZURE_API_VERSION),
            ),
            other => {
                return Err(LlmError::ConfigError(format!(
                    "connection '{}' has unsupported type {}",
                    connection.name, other
                )))
            }
        };

        if let Some(seconds) = connection.get("timeout").and_then(|v| v.as_f64()) {
            if seconds > 0.0 {
                config.timeout = Duration::from_secs_f64(seconds);
            }
        }
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }
}

fn trim_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

//! Executor configuration
//!
//! Settings are layered: built-in defaults, then a TOML `[executor]` table, then
//! `PF_`-prefixed environment variables, then explicit overrides. Each layer is
//! an [`ExecutorSettings`] whose `Some` fields win when merged on top.
//!
//! | setting                  | env var               | default |
//! |--------------------------|-----------------------|---------|
//! | `worker_count`           | `PF_WORKER_COUNT`     | 16      |
//! | `line_timeout_sec`       | `PF_LINE_TIMEOUT_SEC` | 600     |
//! | `raise_ex`               | `PF_RAISE_EX`         | false   |
//! | `allow_generator_output` |                       | false   |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tooling::config::{env_key, get_env_bool, get_env_parse, ConfigBuilder};
use tooling::ToolingError;

use crate::error::{FlowError, Result};

/// Prefix of executor environment variables
pub const ENV_PREFIX: &str = "PF_";

pub const DEFAULT_WORKER_COUNT: usize = 16;
pub const DEFAULT_LINE_TIMEOUT_SEC: u64 = 600;

/// Resolved executor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Lines run concurrently in a batch
    pub worker_count: usize,
    /// Per-line deadline
    pub line_timeout: Duration,
    /// Propagate line failures as errors instead of recording them
    pub raise_ex: bool,
    /// Let a streamed node output reach the caller as a live stream
    pub allow_generator_output: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            line_timeout: Duration::from_secs(DEFAULT_LINE_TIMEOUT_SEC),
            raise_ex: false,
            allow_generator_output: false,
        }
    }
}

impl ExecutorConfig {
    /// Defaults overridden by `PF_*` environment variables
    pub fn from_env() -> Result<Self> {
        ExecutorSettings::from_env(ENV_PREFIX)
            .map_err(|e| FlowError::Configuration(e.to_string()))?
            .into_config()
    }

    /// Stack settings layers, lowest precedence first, over the defaults
    pub fn from_layers<I>(layers: I) -> Result<Self>
    where
        I: IntoIterator<Item = ExecutorSettings>,
    {
        ExecutorSettings::layered(layers)
            .map_err(|e| FlowError::Configuration(e.to_string()))?
            .into_config()
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_line_timeout(mut self, line_timeout: Duration) -> Self {
        self.line_timeout = line_timeout;
        self
    }

    pub fn with_raise_ex(mut self, raise_ex: bool) -> Self {
        self.raise_ex = raise_ex;
        self
    }

    pub fn with_allow_generator_output(mut self, allow: bool) -> Self {
        self.allow_generator_output = allow;
        self
    }
}

/// One partial layer of executor settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorSettings {
    pub worker_count: Option<usize>,
    pub line_timeout_sec: Option<u64>,
    pub raise_ex: Option<bool>,
    pub allow_generator_output: Option<bool>,
}

impl ExecutorSettings {
    /// Apply this layer over the defaults and validate
    pub fn into_config(self) -> Result<ExecutorConfig> {
        self.validate()
            .map_err(|e| FlowError::Configuration(e.to_string()))?;
        let defaults = ExecutorConfig::default();
        Ok(ExecutorConfig {
            worker_count: self.worker_count.unwrap_or(defaults.worker_count),
            line_timeout: self
                .line_timeout_sec
                .map(Duration::from_secs)
                .unwrap_or(defaults.line_timeout),
            raise_ex: self.raise_ex.unwrap_or(defaults.raise_ex),
            allow_generator_output: self
                .allow_generator_output
                .unwrap_or(defaults.allow_generator_output),
        })
    }
}

impl ConfigBuilder for ExecutorSettings {
    fn validate(&self) -> tooling::Result<()> {
        if self.worker_count == Some(0) {
            return Err(ToolingError::General(
                "worker_count must be greater than 0".to_string(),
            ));
        }
        if self.line_timeout_sec == Some(0) {
            return Err(ToolingError::General(
                "line_timeout_sec must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn from_env(prefix: &str) -> tooling::Result<Self> {
        Ok(Self {
            worker_count: get_env_parse(&env_key(prefix, "worker_count"))?,
            line_timeout_sec: get_env_parse(&env_key(prefix, "line_timeout_sec"))?,
            raise_ex: get_env_bool(&env_key(prefix, "raise_ex"))?,
            allow_generator_output: None,
        })
    }

    fn merge(&mut self, other: Self) -> &mut Self {
        if other.worker_count.is_some() {
            self.worker_count = other.worker_count;
        }
        if other.line_timeout_sec.is_some() {
            self.line_timeout_sec = other.line_timeout_sec;
        }
        if other.raise_ex.is_some() {
            self.raise_ex = other.raise_ex;
        }
        if other.allow_generator_output.is_some() {
            self.allow_generator_output = other.allow_generator_output;
        }
        self
    }
}

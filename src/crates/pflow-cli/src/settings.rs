//! Executor settings for a CLI run
//!
//! Layers, lowest precedence first: built-in defaults, the `[executor]` table
//! of the `--config` file, `PF_*` environment variables, command-line flags.

use std::path::Path;

use anyhow::{Context, Result};
use pflow_core::config::ENV_PREFIX;
use pflow_core::{ExecutorConfig, ExecutorSettings};
use serde::Deserialize;
use tooling::config::ConfigBuilder;

/// Contents of `pflow.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub executor: ExecutorSettings,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Resolve the executor configuration for this run
pub fn resolve_executor_config(config_file: Option<&Path>, flags: ExecutorSettings) -> Result<ExecutorConfig> {
    resolve_with_prefix(config_file, ENV_PREFIX, flags)
}

fn resolve_with_prefix(config_file: Option<&Path>, env_prefix: &str, flags: ExecutorSettings) -> Result<ExecutorConfig> {
    let file = match config_file {
        Some(path) => FileConfig::load(path)?.executor,
        None => ExecutorSettings::default(),
    };
    let env = ExecutorSettings::from_env(env_prefix).context("reading executor settings from the environment")?;
    Ok(ExecutorConfig::from_layers([file, env, flags])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_config(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("pflow.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_layers() {
        let config = resolve_with_prefix(None, "PFLOW_CLI_UNSET_", ExecutorSettings::default()).unwrap();
        assert_eq!(config, ExecutorConfig::default());
    }

    #[test]
    fn test_file_then_env_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "[executor]\nworker_count = 8\nline_timeout_sec = 120\nraise_ex = true\n",
        );
        std::env::set_var("PFLOW_CLI_LAYERS_LINE_TIMEOUT_SEC", "30");
        std::env::set_var("PFLOW_CLI_LAYERS_WORKER_COUNT", "6");

        let flags = ExecutorSettings {
            worker_count: Some(2),
            ..Default::default()
        };
        let config = resolve_with_prefix(Some(&path), "PFLOW_CLI_LAYERS_", flags).unwrap();

        std::env::remove_var("PFLOW_CLI_LAYERS_LINE_TIMEOUT_SEC");
        std::env::remove_var("PFLOW_CLI_LAYERS_WORKER_COUNT");

        assert_eq!(config.worker_count, 2);
        assert_eq!(config.line_timeout, Duration::from_secs(30));
        assert!(config.raise_ex);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[executor]\nworkers = 8\n");
        assert!(FileConfig::load(&path).is_err());
    }

    #[test]
    fn test_zero_workers_fails_validation() {
        let flags = ExecutorSettings {
            worker_count: Some(0),
            ..Default::default()
        };
        let err = resolve_with_prefix(None, "PFLOW_CLI_UNSET_", flags).unwrap_err();
        assert!(err.to_string().contains("worker_count"));
    }
}

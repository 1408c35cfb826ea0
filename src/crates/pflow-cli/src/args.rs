//! Command-line arguments

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "pflow")]
#[command(about = "pflow - Validate and run LLM flows over batches of inputs", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// TOML file with an [executor] table
    #[arg(long, global = true, env = "PF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Connections JSON file: {name: {"type": ..., "value": {...}}}
    #[arg(long, global = true, env = "PF_CONNECTIONS")]
    pub connections: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Check a flow definition without running it
    Validate {
        /// Flow YAML file or a directory holding flow.dag.yaml
        flow: PathBuf,
    },

    /// Run a single line and print its outputs
    Test {
        /// Flow YAML file or a directory holding flow.dag.yaml
        flow: PathBuf,

        /// Flow inputs as a JSON object
        #[arg(short, long)]
        inputs: Option<String>,

        /// Variant selection, NODE=VARIANT_ID
        #[arg(long = "variant", value_parser = parse_key_value)]
        variants: Vec<(String, String)>,
    },

    /// Run every line of one or more JSONL sources
    Batch(BatchArgs),
}

#[derive(Debug, Args)]
pub struct BatchArgs {
    /// Flow YAML file or a directory holding flow.dag.yaml
    pub flow: PathBuf,

    /// Input source, NAME=PATH (JSONL, or a JSON array)
    #[arg(short, long = "data", value_parser = parse_key_value, required = true)]
    pub data: Vec<(String, String)>,

    /// Flow input mapping, INPUT='${source.column}' or a literal
    #[arg(short = 'm', long = "column-mapping", value_parser = parse_key_value)]
    pub column_mapping: Vec<(String, String)>,

    /// Lines run concurrently
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Per-line timeout in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Fail on the first failing line
    #[arg(long)]
    pub raise_ex: bool,

    /// Write successful line outputs here as JSONL
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Root run id; generated when omitted
    #[arg(long)]
    pub run_id: Option<String>,

    /// Variant selection, NODE=VARIANT_ID
    #[arg(long = "variant", value_parser = parse_key_value)]
    pub variants: Vec<(String, String)>,
}

/// Split `KEY=VALUE` at the first `=`
pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("question=${data.q}").unwrap(),
            ("question".to_string(), "${data.q}".to_string())
        );
        assert_eq!(
            parse_key_value("url=http://x?a=b").unwrap(),
            ("url".to_string(), "http://x?a=b".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_batch_command_line() {
        let cli = Cli::try_parse_from([
            "pflow",
            "--verbose",
            "batch",
            "flows/qa",
            "--data",
            "data=questions.jsonl",
            "--column-mapping",
            "question=${data.q}",
            "--workers",
            "4",
            "--output",
            "out.jsonl",
        ])
        .unwrap();

        assert!(cli.verbose);
        let Commands::Batch(batch) = cli.command else {
            panic!("expected batch");
        };
        assert_eq!(batch.flow, PathBuf::from("flows/qa"));
        assert_eq!(batch.data, vec![("data".to_string(), "questions.jsonl".to_string())]);
        assert_eq!(batch.column_mapping.len(), 1);
        assert_eq!(batch.workers, Some(4));
        assert_eq!(batch.timeout, None);
    }

    #[test]
    fn test_batch_requires_data() {
        assert!(Cli::try_parse_from(["pflow", "batch", "flow.yaml"]).is_err());
    }
}

//! pflow CLI
//!
//! Main entry point for the pflow command-line tool.

use std::io::Write;

use anyhow::bail;
use clap::Parser;
use pflow_cli::args::{Cli, Commands};
use pflow_cli::commands;
use pflow_cli::settings::resolve_executor_config;
use pflow_core::{ExecutorSettings, Status};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    pflow_cli::init_tracing(cli.verbose);

    let connections = commands::load_connections(cli.connections.as_deref())?;

    match cli.command {
        Commands::Validate { flow } => {
            println!("Validating: {}", flow.display());
            let report = commands::validate(&flow, &connections)?;
            print!("{}", report);
            Ok(())
        }
        Commands::Test { flow, inputs, variants } => {
            let flags = ExecutorSettings {
                allow_generator_output: Some(true),
                ..Default::default()
            };
            let config = resolve_executor_config(cli.config.as_deref(), flags)?;
            let executor =
                commands::create_executor(&flow, &variants, &connections, commands::builtin_registry()?, config)?;
            let inputs = commands::parse_inputs(inputs.as_deref())?;

            let mut stdout = std::io::stdout();
            let output = commands::test_line(&executor, inputs, &mut stdout).await?;
            writeln!(stdout, "{}", serde_json::to_string_pretty(&output)?)?;
            Ok(())
        }
        Commands::Batch(args) => {
            let flags = ExecutorSettings {
                worker_count: args.workers,
                line_timeout_sec: args.timeout,
                raise_ex: args.raise_ex.then_some(true),
                allow_generator_output: None,
            };
            let config = resolve_executor_config(cli.config.as_deref(), flags)?;
            tracing::debug!(
                workers = config.worker_count,
                line_timeout = ?config.line_timeout,
                "executor configured"
            );
            let executor = commands::create_executor(
                &args.flow,
                &args.variants,
                &connections,
                commands::builtin_registry()?,
                config,
            )?;

            let result = commands::run_batch(&args, executor).await?;
            print!("{}", commands::batch_summary(&result));
            if result.status == Status::Failed {
                bail!("batch run {} failed", result.run_id);
            }
            Ok(())
        }
    }
}

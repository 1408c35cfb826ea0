//! # pflow-cli
//!
//! Library side of the `pflow` binary: argument definitions, settings
//! layering, batch input files and the command handlers.
//!
//! ```text
//! pflow validate flows/qa --connections connections.json
//! pflow test flows/qa --inputs '{"question": "What is Rust?"}'
//! pflow batch flows/qa --data data=questions.jsonl \
//!     --column-mapping question='${data.q}' --workers 8 --output out.jsonl
//! ```

pub mod args;
pub mod commands;
pub mod data;
pub mod settings;

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber; `RUST_LOG` wins over `verbose`
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

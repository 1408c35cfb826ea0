//! Layered settings
//!
//! A settings type implements [`ConfigBuilder`] with all fields optional. Each
//! source (built-in defaults, a TOML file, the environment, command-line
//! flags) produces one layer, and [`ConfigBuilder::layered`] stacks them:
//!
//! ```rust,ignore
//! let settings = ExecutorSettings::layered([
//!     from_file,
//!     ExecutorSettings::from_env("PF_")?,
//!     from_flags,
//! ])?;
//! ```

mod builder;
mod env;

pub use builder::ConfigBuilder;
pub use env::{env_key, get_env, get_env_bool, get_env_parse};

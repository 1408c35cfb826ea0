//! Reading typed values out of the process environment

use std::env;
use std::str::FromStr;

use crate::{Result, ToolingError};

/// Raw value of `key`, `None` when unset
pub fn get_env(key: &str) -> Result<Option<String>> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ToolingError::InvalidEnv {
            key: key.to_string(),
            reason: "not valid UTF-8".to_string(),
        }),
    }
}

/// Parse `key` into `T`; surrounding whitespace is ignored
///
/// ```rust
/// std::env::set_var("DOC_WORKERS", " 4 ");
/// let workers: Option<usize> = tooling::config::get_env_parse("DOC_WORKERS").unwrap();
/// assert_eq!(workers, Some(4));
/// ```
pub fn get_env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key)?
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ToolingError::InvalidEnv {
                key: key.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Parse `key` as a flag: `true/1/yes/on` or `false/0/no/off`, any case
pub fn get_env_bool(key: &str) -> Result<Option<bool>> {
    let Some(raw) = get_env(key)? else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(ToolingError::InvalidEnv {
            key: key.to_string(),
            reason: format!("expected a boolean, got {:?}", raw),
        }),
    }
}

/// `prefix` followed by `name` in upper case: `("PF_", "worker_count")` is `PF_WORKER_COUNT`
pub fn env_key(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name.to_ascii_uppercase())
}

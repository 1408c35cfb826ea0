//! Async helpers
//!
//! [`timeout::with_timeout`] bounds a fallible future and keeps the
//! distinction between "the operation failed" and "the deadline passed":
//!
//! ```rust
//! use std::time::Duration;
//! use tooling::async_utils::timeout::{with_timeout, TimeoutError};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let result = with_timeout(Duration::from_millis(5), async {
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//!     Ok::<_, String>(())
//! })
//! .await;
//! assert!(matches!(result, Err(TimeoutError::Timeout(_))));
//! # });
//! ```

pub mod timeout;

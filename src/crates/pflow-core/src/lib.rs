//! # pflow-core
//!
//! Execution core for flows: small typed DAGs of tool nodes (LLM calls,
//! registered functions, prompt templates) run over batches of input records.
//!
//! ## Pipeline
//!
//! ```text
//! flow.yaml ──▶ Flow ──▶ FlowValidator ──▶ ValidatedFlow ──▶ ToolResolver ──▶ LineExecutor
//!                                                                              │
//!  input sources ──▶ input_mapping ──▶ Vec<LineInputs> ──▶ BatchCoordinator ───┘
//!                                                              │
//!                                                              ▼
//!                                           per-line results + aggregation metrics
//! ```
//!
//! - [`flow`]: the flow model and YAML loading
//! - [`validator`]: structural checks, connection binding, topological order
//! - [`tool`] / [`resolver`]: the explicit tool registry and node-to-callable binding
//! - [`input_mapping`]: merging named sources by line and `${source.path}` mapping
//! - [`executor`]: single-line execution with run tracking
//! - [`batch`]: bounded concurrent line execution followed by aggregation
//! - [`streaming`] / [`retry`]: live LLM streams and the fixed retry schedule
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pflow_core::prelude::*;
//! use serde_json::json;
//!
//! # tokio_test_block(async {
//! let mut registry = ToolRegistry::new();
//! registry.register_function(
//!     "shout",
//!     ToolSignature::new().with_input("text", vec![InputType::Value(ValueType::String)]),
//!     |args| async move {
//!         let text = args.require_str("text")?.to_uppercase();
//!         Ok(NodeOutput::from(json!(text)))
//!     },
//! );
//!
//! let flow = Flow::new("hello")
//!     .with_tool(Tool::new("shout", ToolType::Python))
//!     .with_input("text", FlowInputDefinition::new(ValueType::String))
//!     .with_node(Node::new("loud", "shout").with_input("text", InputAssignment::flow_input("text")))
//!     .with_output("answer", InputAssignment::node_output("loud"));
//!
//! let executor = LineExecutor::create(
//!     flow,
//!     &ConnectionSet::new(),
//!     Arc::new(registry),
//!     Arc::new(FileCodeLoader::new(".")),
//!     ExecutorConfig::default(),
//! )
//! .unwrap();
//!
//! let inputs = json!({"text": "hi"}).as_object().cloned().unwrap();
//! let result = executor.exec_line(inputs, 0, &LineOptions::default()).await.unwrap();
//! assert_eq!(result.output["answer"], json!("HI"));
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod flow;
pub mod input_mapping;
pub mod resolver;
pub mod retry;
pub mod run_info;
pub mod streaming;
pub mod template;
pub mod tool;
pub mod validator;

pub use batch::{BatchCoordinator, BatchLineResult, BatchResult};
pub use config::{ExecutorConfig, ExecutorSettings};
pub use connection::{Connection, ConnectionSet};
pub use error::{ErrorKind, ErrorTarget, FlowError, Result, SerializedError};
pub use executor::{AggregationResult, LineExecutor, LineOptions, LineResult};
pub use flow::{Flow, InputAssignment, Node, Tool, ToolType};
pub use input_mapping::{InputSources, InputsMapping, LineInputs};
pub use resolver::{CodeLoader, FileCodeLoader, ToolResolver};
pub use run_info::{FlowRunInfo, RunInfo, RunTracker, Status};
pub use streaming::{LiveStream, MaterializedText, StreamEnd};
pub use tool::{NodeOutput, ToolArgs, ToolError, ToolRegistry, ToolSignature};
pub use validator::{FlowValidator, ValidatedFlow};

/// Common imports for building and running flows
pub mod prelude {
    pub use crate::batch::{BatchCoordinator, BatchResult};
    pub use crate::config::ExecutorConfig;
    pub use crate::connection::{Connection, ConnectionSet};
    pub use crate::error::{FlowError, Result};
    pub use crate::executor::{LineExecutor, LineOptions, LineResult};
    pub use crate::flow::{
        Flow, FlowInputDefinition, InputAssignment, InputType, Node, Tool, ToolType, ValueType,
    };
    pub use crate::input_mapping::{apply_inputs_mapping_for_all_lines, LineInputs};
    pub use crate::resolver::FileCodeLoader;
    pub use crate::run_info::Status;
    pub use crate::streaming::LiveStream;
    pub use crate::tool::{NodeOutput, ToolArgs, ToolError, ToolRegistry, ToolSignature};
}

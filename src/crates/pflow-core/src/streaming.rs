//! Streaming LLM outputs
//!
//! A streaming tool returns a [`LiveStream`]: a lazy, finite, single-consumption
//! sequence of text chunks. It is a valid *transient* node result only. Anything
//! recorded in run info or returned from a batch is first drained into a
//! [`MaterializedText`] by [`ensure_node_result_is_serializable`].
//!
//! ```rust
//! use pflow_core::streaming::{ensure_node_result_is_serializable, LiveStream};
//! use pflow_core::tool::NodeOutput;
//! use serde_json::json;
//!
//! # futures::executor::block_on(async {
//! let stream = LiveStream::from_chunks(["Hel", "lo"]);
//! let value = ensure_node_result_is_serializable(NodeOutput::Stream(stream)).await.unwrap();
//! assert_eq!(value, json!("Hello"));
//! # });
//! ```

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tool::{NodeOutput, ToolArgs, ToolError, ToolFn, ToolSignature};

/// Boxed stream of text chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ToolError>> + Send>>;

/// Name of the parameter a streaming-capable tool accepts
pub const STREAM_PARAM: &str = "stream";

/// Accumulates streamed chunks
#[derive(Debug, Default)]
pub struct TokenBuffer {
    buffer: String,
    chunk_count: usize,
    finished: bool,
}

impl TokenBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunk(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        self.chunk_count += 1;
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn content(&self) -> &str {
        &self.buffer
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn into_text(self) -> MaterializedText {
        MaterializedText(self.buffer)
    }
}

/// Fully drained stream text; the only form a streamed result is stored in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaterializedText(String);

impl MaterializedText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::String(self.0)
    }
}

impl From<String> for MaterializedText {
    fn from(text: String) -> Self {
        Self(text)
    }
}

impl fmt::Display for MaterializedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lazy, single-consumption text stream
///
/// Consuming it (by polling or [`LiveStream::drain`]) moves it, so a stream can
/// never be read twice.
pub struct LiveStream {
    inner: ChunkStream,
}

impl LiveStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<String, ToolError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// Stream over fixed chunks
    pub fn from_chunks<I, T>(chunks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let chunks: Vec<Result<String, ToolError>> =
            chunks.into_iter().map(|c| Ok(c.into())).collect();
        Self::new(stream::iter(chunks))
    }

    /// Read every chunk and concatenate them in order
    pub async fn drain(mut self) -> Result<MaterializedText, ToolError> {
        let mut buffer = TokenBuffer::new();
        while let Some(chunk) = self.inner.next().await {
            buffer.add_chunk(&chunk?);
        }
        buffer.finish();
        Ok(buffer.into_text())
    }

    /// Pass chunks through unchanged and report how the stream ended
    ///
    /// `callback` runs exactly once: when the consumer reaches the end, on the
    /// first chunk error (the stream stops there), or when the stream is
    /// dropped before either.
    pub fn on_finish<F>(self, callback: F) -> Self
    where
        F: FnOnce(StreamEnd) + Send + 'static,
    {
        let mut inner = self.inner;
        let mut guard = FinishGuard {
            callback: Some(callback),
            buffer: TokenBuffer::new(),
        };
        Self::new(async_stream::stream! {
            while let Some(item) = inner.next().await {
                match item {
                    Ok(chunk) => {
                        guard.buffer.add_chunk(&chunk);
                        yield Ok(chunk);
                    }
                    Err(error) => {
                        guard.end(|partial| StreamEnd::Failed { partial, error: error.clone() });
                        yield Err(error);
                        break;
                    }
                }
            }
            guard.buffer.finish();
            guard.end(StreamEnd::Completed);
        })
    }
}

/// How a stream wrapped by [`LiveStream::on_finish`] ended
#[derive(Debug, Clone)]
pub enum StreamEnd {
    /// Every chunk was read
    Completed(MaterializedText),
    /// A chunk failed; `partial` holds the text read before it
    Failed { partial: MaterializedText, error: ToolError },
    /// Dropped before the end with this much text read
    Dropped(MaterializedText),
}

struct FinishGuard<F: FnOnce(StreamEnd)> {
    callback: Option<F>,
    buffer: TokenBuffer,
}

impl<F: FnOnce(StreamEnd)> FinishGuard<F> {
    fn end(&mut self, end: impl FnOnce(MaterializedText) -> StreamEnd) {
        if let Some(callback) = self.callback.take() {
            let text = std::mem::take(&mut self.buffer).into_text();
            callback(end(text));
        }
    }
}

impl<F: FnOnce(StreamEnd)> Drop for FinishGuard<F> {
    fn drop(&mut self) {
        self.end(StreamEnd::Dropped);
    }
}

impl Stream for LiveStream {
    type Item = Result<String, ToolError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for LiveStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LiveStream(..)")
    }
}

/// Turn any node result into a storable value, draining streams
pub async fn ensure_node_result_is_serializable(output: NodeOutput) -> Result<Value, ToolError> {
    match output {
        NodeOutput::Value(value) => Ok(value),
        NodeOutput::Stream(stream) => Ok(stream.drain().await?.into_value()),
    }
}

/// Whether a signature takes a `stream` parameter
pub fn supports_streaming(signature: &ToolSignature) -> bool {
    signature.accepts(STREAM_PARAM)
}

/// Make an LLM tool stream by injecting `stream = true`
///
/// Tools whose signature has no `stream` parameter are returned unchanged.
pub fn enable_streaming_for_llm_tool(tool: ToolFn, signature: &ToolSignature) -> ToolFn {
    if !supports_streaming(signature) {
        tracing::debug!("tool has no stream parameter, streaming not enabled");
        return tool;
    }
    std::sync::Arc::new(move |mut args: ToolArgs| {
        args.insert(STREAM_PARAM, Value::Bool(true));
        tool(args)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{InputType, ValueType};
    use crate::tool::tool_fn;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_drain_concatenates_in_order() {
        let stream = LiveStream::from_chunks(["a", "b", "c", ""]);
        let text = stream.drain().await.unwrap();
        assert_eq!(text.as_str(), "abc");
    }

    #[tokio::test]
    async fn test_ensure_serializable_passes_values_through() {
        let value = ensure_node_result_is_serializable(NodeOutput::from(json!({"k": 1})))
            .await
            .unwrap();
        assert_eq!(value, json!({"k": 1}));
    }

    #[tokio::test]
    async fn test_drain_surfaces_stream_errors() {
        let chunks: Vec<Result<String, ToolError>> =
            vec![Ok("partial".into()), Err(ToolError::transient("reset"))];
        let stream = LiveStream::new(futures::stream::iter(chunks));
        let err = ensure_node_result_is_serializable(NodeOutput::Stream(stream))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Transient(_)));
    }

    fn recorder() -> (Arc<Mutex<Option<StreamEnd>>>, impl FnOnce(StreamEnd) + Send + 'static) {
        let recorded = Arc::new(Mutex::new(None));
        let sink = recorded.clone();
        (recorded, move |end| *sink.lock() = Some(end))
    }

    #[tokio::test]
    async fn test_on_finish_records_full_text() {
        let (recorded, callback) = recorder();
        let mut stream = LiveStream::from_chunks(["x", "y"]).on_finish(callback);

        assert_eq!(stream.next().await.unwrap().unwrap(), "x");
        assert!(recorded.lock().is_none());
        assert_eq!(stream.next().await.unwrap().unwrap(), "y");
        assert!(stream.next().await.is_none());
        match recorded.lock().take() {
            Some(StreamEnd::Completed(text)) => assert_eq!(text.as_str(), "xy"),
            other => panic!("expected completion, got {:?}", other),
        };
    }

    #[tokio::test]
    async fn test_on_finish_stops_at_first_error() {
        let (recorded, callback) = recorder();
        let chunks: Vec<Result<String, ToolError>> = vec![
            Ok("a".into()),
            Err(ToolError::transient("reset")),
            Ok("never".into()),
        ];
        let mut stream = LiveStream::new(futures::stream::iter(chunks)).on_finish(callback);

        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
        match recorded.lock().take() {
            Some(StreamEnd::Failed { partial, error }) => {
                assert_eq!(partial.as_str(), "a");
                assert!(error.is_retryable());
            }
            other => panic!("expected failure, got {:?}", other),
        };
    }

    #[tokio::test]
    async fn test_on_finish_reports_dropped_stream() {
        let (recorded, callback) = recorder();
        let mut stream = LiveStream::from_chunks(["x", "y", "z"]).on_finish(callback);
        assert_eq!(stream.next().await.unwrap().unwrap(), "x");
        drop(stream);

        match recorded.lock().take() {
            Some(StreamEnd::Dropped(text)) => assert_eq!(text.as_str(), "x"),
            other => panic!("expected drop, got {:?}", other),
        }

        let (unread, callback) = recorder();
        drop(LiveStream::from_chunks(["x"]).on_finish(callback));
        assert!(matches!(unread.lock().take(), Some(StreamEnd::Dropped(_))));
    }

    #[tokio::test]
    async fn test_enable_streaming_injects_flag() {
        let tool = tool_fn(|args: ToolArgs| async move {
            if args.get_bool(STREAM_PARAM) == Some(true) {
                Ok(NodeOutput::Stream(LiveStream::from_chunks(["s", "t"])))
            } else {
                Ok(NodeOutput::from(json!("full")))
            }
        });
        let signature = ToolSignature::new()
            .with_input("prompt", vec![InputType::Value(ValueType::PromptTemplate)])
            .with_input(STREAM_PARAM, vec![InputType::Value(ValueType::Bool)]);

        let wrapped = enable_streaming_for_llm_tool(tool, &signature);
        let output = wrapped(ToolArgs::new()).await.unwrap();
        assert!(output.is_stream());
        let value = ensure_node_result_is_serializable(output).await.unwrap();
        assert_eq!(value, json!("st"));
    }

    #[tokio::test]
    async fn test_tools_without_stream_param_are_not_wrapped() {
        let tool = tool_fn(|args: ToolArgs| async move {
            Ok(NodeOutput::from(json!(args.contains(STREAM_PARAM))))
        });
        let signature =
            ToolSignature::new().with_input("text", vec![InputType::Value(ValueType::String)]);
        assert!(!supports_streaming(&signature));

        let wrapped = enable_streaming_for_llm_tool(tool, &signature);
        let value = ensure_node_result_is_serializable(wrapped(ToolArgs::new()).await.unwrap())
            .await
            .unwrap();
        assert_eq!(value, json!(false));
    }
}

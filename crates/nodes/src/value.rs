//! Tool output values, including lazily produced streams.
//!
//! A tool may return a plain JSON value or a stream of values. Streams are
//! wrapped in [`ValueStream`], a proxy that tees every yielded element into a
//! shared capture buffer while still handing items to the caller. The tracer
//! holds the capture handle so the trace can be completed after the stream is
//! exhausted, without forcing eager materialization on the consumer.

use std::sync::{Arc, Mutex};

use serde_json::Value;

/// The result of one tool invocation.
pub enum ToolValue {
    /// An eagerly computed value.
    Value(Value),
    /// A lazy sequence of values.
    Stream(ValueStream),
}

impl ToolValue {
    /// Force the value into a plain JSON value, draining a stream into an
    /// array if necessary.
    pub fn materialize(self) -> Value {
        match self {
            Self::Value(v) => v,
            Self::Stream(stream) => Value::Array(stream.collect()),
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

impl From<Value> for ToolValue {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl std::fmt::Debug for ToolValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Stream(s) => f
                .debug_struct("Stream")
                .field("captured", &s.captured.lock().unwrap().len())
                .finish(),
        }
    }
}

/// Shared buffer of elements a stream has yielded so far.
pub type CapturedItems = Arc<Mutex<Vec<Value>>>;

/// Iterator proxy over a lazy tool output.
///
/// Every call to `next` records the yielded element in the capture buffer
/// before returning it, so observers holding [`ValueStream::captured`] see
/// the prefix consumed so far and, once the iterator is exhausted, the full
/// output.
pub struct ValueStream {
    inner: Box<dyn Iterator<Item = Value> + Send>,
    captured: CapturedItems,
}

impl ValueStream {
    pub fn new(inner: Box<dyn Iterator<Item = Value> + Send>) -> Self {
        Self {
            inner,
            captured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Build a stream over an already known list of items. The proxy still
    /// captures lazily, so partial consumption is observable.
    pub fn from_items(items: Vec<Value>) -> Self {
        Self::new(Box::new(items.into_iter()))
    }

    /// Handle to the elements yielded so far.
    pub fn captured(&self) -> CapturedItems {
        Arc::clone(&self.captured)
    }
}

impl Iterator for ValueStream {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let item = self.inner.next();
        if let Some(v) = &item {
            self.captured.lock().unwrap().push(v.clone());
        }
        item
    }
}

use crate::exchange::exception::Exception;
use fnv::FnvBuildHasher;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub type Headers = HashMap<String, Value, FnvBuildHasher>;

/// A message carried by an exchange: an id, a body, and headers.
#[derive(Debug, Clone)]
pub struct Message {
    message_id: String,
    body: Body,
    headers: Headers,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            body: Body::Empty,
            headers: HashMap::with_hasher(FnvBuildHasher::default()),
        }
    }
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(body: impl Into<Body>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// Replaces a read-once stream body with a re-readable cached copy.
    ///
    /// Returns `true` when a stream was converted. A stream that was already consumed becomes
    /// an empty cache.
    pub fn cache_stream(&mut self) -> bool {
        if let Body::Stream(stream) = &self.body {
            let bytes = stream.read_all().unwrap_or_default();
            self.body = Body::Cached(CachedStream::new(bytes));
            true
        } else {
            false
        }
    }

    /// Rewinds a cached stream body so the next reader sees it from the start.
    pub fn reset_stream_cache(&mut self) {
        if let Body::Cached(cache) = &mut self.body {
            cache.reset();
        }
    }

    /// Reads the body as bytes. Reading a stream consumes it.
    pub fn read_body_bytes(&mut self) -> Result<Vec<u8>, Exception> {
        match &mut self.body {
            Body::Empty => Ok(Vec::new()),
            Body::Text(text) => Ok(text.as_bytes().to_vec()),
            Body::Bytes(bytes) => Ok(bytes.clone()),
            Body::Json(value) => Ok(serde_json::to_vec(value)?),
            Body::Stream(stream) => stream
                .read_all()
                .ok_or_else(|| Exception::illegal_state("stream body has already been consumed")),
            Body::Cached(cache) => Ok(cache.read_all()),
        }
    }
}

/// The payload of a message.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
    Stream(StreamBody),
    Cached(CachedStream),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }

    /// A textual view of the body, when one exists without consuming anything.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Body::Text(text) => Some(Cow::Borrowed(text.as_str())),
            Body::Bytes(bytes) => std::str::from_utf8(bytes).ok().map(Cow::Borrowed),
            Body::Json(Value::String(text)) => Some(Cow::Borrowed(text.as_str())),
            Body::Json(value) => Some(Cow::Owned(value.to_string())),
            Body::Cached(cache) => std::str::from_utf8(cache.as_bytes()).ok().map(Cow::Borrowed),
            Body::Empty | Body::Stream(_) => None,
        }
    }

    /// A JSON view of the body. Text and numbers become JSON scalars.
    pub fn to_json(&self) -> Value {
        match self {
            Body::Empty => Value::Null,
            Body::Json(value) => value.clone(),
            other => other
                .as_text()
                .map(|text| Value::String(text.into_owned()))
                .unwrap_or(Value::Null),
        }
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::Text(value.to_string())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Text(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Bytes(value)
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Body::Empty,
            Value::String(text) => Body::Text(text),
            other => Body::Json(other),
        }
    }
}

impl From<StreamBody> for Body {
    fn from(value: StreamBody) -> Self {
        Body::Stream(value)
    }
}

/// A read-once body. Clones share the underlying source, so once any holder reads it the
/// stream is consumed for all of them.
#[derive(Clone)]
pub struct StreamBody {
    source: Arc<Mutex<Option<Vec<u8>>>>,
}

impl StreamBody {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            source: Arc::new(Mutex::new(Some(bytes.into()))),
        }
    }

    pub fn read_all(&self) -> Option<Vec<u8>> {
        let mut guard = self.source.lock().unwrap_or_else(|e| e.into_inner());
        guard.take()
    }

    pub fn is_consumed(&self) -> bool {
        let guard = self.source.lock().unwrap_or_else(|e| e.into_inner());
        guard.is_none()
    }
}

impl Debug for StreamBody {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBody")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// A re-readable snapshot of a stream body with its own read position.
#[derive(Debug, Clone)]
pub struct CachedStream {
    data: Arc<[u8]>,
    position: usize,
}

impl CachedStream {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            data: Arc::from(bytes),
            position: 0,
        }
    }

    pub fn read_all(&mut self) -> Vec<u8> {
        let remaining = self.data[self.position..].to_vec();
        self.position = self.data.len();
        remaining
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

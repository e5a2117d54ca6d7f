//! The value an application handler produces for one request.
use std::fmt;

use bytes::Bytes;
use http::StatusCode;
use serde::Serialize;

/// A response body that is serialized lazily by the dispatcher.
pub trait SerializeBody: Send {
    /// Serialize to JSON, pretty-printed when `indented` is set.
    fn serialize_body(&self, indented: bool) -> serde_json::Result<Vec<u8>>;
}

impl<T> SerializeBody for T
where
    T: Serialize + Send,
{
    fn serialize_body(&self, indented: bool) -> serde_json::Result<Vec<u8>> {
        if indented {
            serde_json::to_vec_pretty(self)
        } else {
            serde_json::to_vec(self)
        }
    }
}

/// Handler response body.
pub enum Body {
    /// No body; only status and headers are sent.
    Empty,
    /// Sent verbatim as UTF-8; defaults to `text/plain` if no content type is set.
    Text(String),
    /// Sent verbatim with no default content type.
    Bytes(Bytes),
    /// Serialized to JSON at dispatch; defaults to `application/json`.
    Json(Box<dyn SerializeBody>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Body::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Body::Json(_) => f.write_str("Json(..)"),
        }
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Body::Text(text.to_string())
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(bytes))
    }
}

/// Body, status and headers returned by a handler.
///
/// A missing status means `200 OK`. Headers are written in the order given,
/// before the body is resolved.
#[derive(Debug)]
pub struct Response {
    pub(crate) body: Body,
    pub(crate) status: Option<StatusCode>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) error: Option<eyre::Report>,
}

impl Response {
    pub fn new(body: impl Into<Body>) -> Self {
        Self {
            body: body.into(),
            status: None,
            headers: Vec::new(),
            error: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Body::Empty)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Body::Text(text.into()))
    }

    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(Body::Bytes(bytes.into()))
    }

    pub fn json<T>(value: T) -> Self
    where
        T: Serialize + Send + 'static,
    {
        Self::new(Body::Json(Box::new(value)))
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach an error to be logged with this response; the status is left
    /// as the handler set it.
    pub fn with_error(mut self, error: impl Into<eyre::Report>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::empty()
    }
}

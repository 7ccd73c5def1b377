//! Typed HTTP responses.
//!
//! A [`Response`] is a plain value a handler can return instead of driving the
//! [`Exchange`](crate::exchange::Exchange) output by hand. The router flushes it
//! through the exchange, which is where `Content-Length`, `Connection` and body
//! suppression for `HEAD`/204/205/304 are applied.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::{Headers, StatusCode};

/// An HTTP response value: status, headers and a complete body.
///
/// # Examples
///
/// ```
/// use wharf::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Created)
///     .header("Location", "/users/7")
///     .body("created");
///
/// assert_eq!(response.status(), StatusCode::Created);
/// assert_eq!(response.headers().get("location"), Some("/users/7"));
/// assert_eq!(&response.body_bytes()[..], b"created");
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Creates a response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Appends a header in place.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.append(name, value);
    }

    /// Sets a text body, defaulting `Content-Type` to `text/plain; charset=utf-8`.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        if !self.headers.contains("content-type") {
            self.headers.append("Content-Type", "text/plain; charset=utf-8");
        }
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets a raw body without touching `Content-Type`.
    #[must_use]
    pub fn bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Serializes `value` as the JSON body.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if `value` cannot be represented as JSON.
    pub fn json<T: Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.body = Bytes::from(serde_json::to_vec(value)?);
        self.headers.set("Content-Type", "application/json");
        Ok(self)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Splits the response into its status, headers and body.
    pub fn into_parts(self) -> (StatusCode, Headers, Bytes) {
        (self.status, self.headers, self.body)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

impl From<StatusCode> for Response {
    fn from(status: StatusCode) -> Self {
        Self::new(status)
    }
}

/// Writes `HTTP/1.1 <code> <reason>\r\n`, the headers and the blank line.
pub(crate) fn encode_head(status: StatusCode, headers: &Headers, buf: &mut BytesMut) {
    buf.reserve(64 + headers.len() * 48);
    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_u16().to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.canonical_reason().as_bytes());
    buf.put_slice(b"\r\n");
    headers.write_to(buf);
    buf.put_slice(b"\r\n");
}

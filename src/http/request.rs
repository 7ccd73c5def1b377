//! Incremental HTTP/1.1 request-head parsing using the [`httparse`] crate.
//!
//! Only the head (request line and headers) is parsed here. The body stays on
//! the wire and is pulled on demand through
//! [`BodyReader`](crate::protocol::http::BodyReader).

use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request head is incomplete; more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header: {value:?}")]
    InvalidContentLength { value: String },

    #[error("request head exceeds maximum allowed size of {max_bytes} bytes")]
    HeadTooLarge { max_bytes: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed HTTP/1.1 request head.
///
/// Created by [`RequestHead::parse`] from the connection's read buffer. The
/// path is percent-decoded eagerly; a path that does not decode to UTF-8 is
/// kept raw and reported through [`decode_error`](Self::decode_error) so the
/// router can answer `400 Bad Request`.
///
/// # Examples
///
/// ```
/// use wharf::http::RequestHead;
///
/// let raw = b"GET /caf%C3%A9?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (head, _offset) = RequestHead::parse(raw).unwrap();
///
/// assert_eq!(head.method().as_str(), "GET");
/// assert_eq!(head.path(), "/café");
/// assert_eq!(head.query_string(), Some("name=world"));
/// assert_eq!(head.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    target: String,
    path: String,
    decode_error: Option<String>,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
}

impl RequestHead {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parses a request head from the start of `buf`.
    ///
    /// Returns the head and the byte offset at which the body begins
    /// (immediately after the `\r\n\r\n` terminator).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: the terminator has not arrived yet.
    /// - [`RequestError::Parse`]: the bytes are not a valid HTTP/1.x head.
    /// - [`RequestError::MissingField`]: method, target or version is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = match raw_req.method {
            Some(m) => m.parse::<Method>().unwrap_or_else(|never| match never {}),
            None => return Err(RequestError::MissingField { field: "method" }),
        };

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?
            .to_owned();

        let (raw_path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_owned())),
            None => (target.as_str(), None),
        };

        let (path, decode_error) = match percent_decode_str(raw_path).decode_utf8() {
            Ok(decoded) => (decoded.into_owned(), None),
            Err(e) => (raw_path.to_owned(), Some(e.to_string())),
        };

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.append(header.name, value);
            }
        }

        Ok((
            Self {
                method,
                target,
                path,
                decode_error,
                version,
                headers: header_map,
                query,
            },
            body_offset,
        ))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target exactly as received, query string included.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The percent-decoded request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Why the path failed to percent-decode, if it did.
    pub fn decode_error(&self) -> Option<&str> {
        self.decode_error.as_deref()
    }

    /// HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        self.version == 1 || self.headers.has_token("connection", "keep-alive")
    }

    /// The `Content-Length` header, if present.
    ///
    /// # Errors
    ///
    /// [`RequestError::InvalidContentLength`] when the value is not a number.
    pub fn content_length(&self) -> Result<Option<u64>, RequestError> {
        match self.headers.get("content-length") {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| RequestError::InvalidContentLength {
                    value: value.to_owned(),
                }),
        }
    }

    /// Returns `true` if the body uses chunked transfer encoding.
    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("transfer-encoding", "chunked")
    }

    /// Returns `true` if this is an HTTP-to-WebSocket upgrade request.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.method == Method::Get
            && self.headers.has_token("connection", "upgrade")
            && self
                .headers
                .get("upgrade")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
    }
}

/// Parses a URL query string (`key=value&key2=value2`) into a map.
///
/// Keys and values are `application/x-www-form-urlencoded` decoded. When a key
/// repeats, the first occurrence wins.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

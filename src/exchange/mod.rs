//! The per-request facade handed to route handlers.
//!
//! An [`Exchange`] owns the connection for the duration of one request. It
//! exposes the parsed request (query, cookies, params, body) and drives the
//! response through a one-way state machine:
//!
//! ```text
//! Building ──write()──▶ HeadersSent ──end()──▶ Ended
//!     └──────────────end() / send()──────────────▲
//! ```
//!
//! Status and headers can only change while `Building`; the first write
//! flushes them together with the first body bytes. A failed transport write
//! fires the abort observers and freezes the output at `Ended`.

pub mod file;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::debug;

use crate::BoxError;
use crate::http::cookie::parse_cookie_header;
use crate::http::request::{RequestError, parse_query_string};
use crate::http::response::encode_head;
use crate::http::{Cookie, Headers, Method, RequestHead, Response, StatusCode, http_date};
use crate::protocol::http::{BodyChunk, BodyError, BodyReader, Conn};
use crate::protocol::multipart::{self, Part};
use crate::router::Params;
use crate::server::Services;

pub use file::{FileError, FileOptions, FileOutcome};

/// Output progress of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing sent; status and headers may still change.
    Building,
    /// Status and headers are on the wire; body bytes may follow.
    HeadersSent,
    /// The response is complete (or the transport failed).
    Ended,
}

/// An error waiting for an error-handler route to take over.
#[derive(Debug)]
pub enum PendingError {
    /// The request path could not be percent-decoded.
    Decode(String),
    /// The request body could not be read or decoded.
    Body(BodyError),
    /// A handler returned an error or panicked.
    Handler(BoxError),
}

impl PendingError {
    /// The status sent when no error handler answers.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Decode(_) => StatusCode::BadRequest,
            Self::Body(BodyError::TooLarge { .. }) => StatusCode::PayloadTooLarge,
            Self::Body(BodyError::Consumed) | Self::Handler(_) => StatusCode::InternalServerError,
            Self::Body(_) => StatusCode::BadRequest,
        }
    }
}

impl From<BoxError> for PendingError {
    fn from(error: BoxError) -> Self {
        match error.downcast::<BodyError>() {
            Ok(body) => Self::Body(*body),
            Err(other) => Self::Handler(other),
        }
    }
}

impl fmt::Display for PendingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "malformed request path: {e}"),
            Self::Body(e) => write!(f, "malformed request body: {e}"),
            Self::Handler(e) => write!(f, "handler failed: {e}"),
        }
    }
}

/// How [`Exchange::body`] should interpret the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Bytes,
    Text,
    Json,
    Multipart,
}

/// A decoded request body.
#[derive(Debug, Clone)]
pub enum Body {
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
    Multipart(Vec<Part>),
}

/// Awaitable view of an exchange's abort flag, usable from spawned tasks.
#[derive(Debug, Clone)]
pub struct AbortSignal(watch::Receiver<bool>);

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the exchange is aborted (`true`) or finishes without
    /// being aborted (`false`).
    pub async fn aborted(&mut self) -> bool {
        self.0.wait_for(|aborted| *aborted).await.is_ok()
    }
}

type AbortObserver = Box<dyn FnOnce() + Send + Sync>;

/// One HTTP request and its response.
pub struct Exchange {
    conn: Conn,
    head: RequestHead,
    reader: BodyReader,
    body: Option<Bytes>,
    body_streamed: bool,
    query: OnceLock<HashMap<String, String>>,
    cookies: OnceLock<HashMap<String, String>>,
    params: Params,
    services: Arc<Services>,

    phase: Phase,
    status: StatusCode,
    headers: Headers,
    chunked: bool,
    declared_len: Option<u64>,
    body_sent: u64,
    keep_alive: bool,

    abort: watch::Sender<bool>,
    abort_observers: Vec<AbortObserver>,
    error: Option<PendingError>,
    staged: Option<Response>,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("method", self.head.method())
            .field("path", &self.head.path())
            .field("phase", &self.phase)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Exchange {
    pub(crate) fn new(conn: Conn, head: RequestHead, services: Arc<Services>) -> Result<Self, (Conn, RequestError)> {
        let reader = match BodyReader::for_head(&head) {
            Ok(reader) => reader,
            Err(e) => return Err((conn, e)),
        };
        let keep_alive = head.is_keep_alive();
        let error = head.decode_error().map(|e| PendingError::Decode(e.to_owned()));
        Ok(Self {
            conn,
            head,
            reader,
            body: None,
            body_streamed: false,
            query: OnceLock::new(),
            cookies: OnceLock::new(),
            params: Params::new(),
            services,
            phase: Phase::Building,
            status: StatusCode::Ok,
            headers: Headers::new(),
            chunked: false,
            declared_len: None,
            body_sent: 0,
            keep_alive,
            abort: watch::Sender::new(false),
            abort_observers: Vec::new(),
            error,
            staged: None,
        })
    }

    // ── Request ──────────────────────────────────────────────────────────────

    pub fn method(&self) -> &Method {
        self.head.method()
    }

    /// The percent-decoded request path.
    pub fn path(&self) -> &str {
        self.head.path()
    }

    /// The request target exactly as it appeared on the request line.
    pub fn raw_target(&self) -> &str {
        self.head.target()
    }

    /// The raw query string without the leading `?` (empty when absent).
    pub fn query_string(&self) -> &str {
        self.head.query_string().unwrap_or_default()
    }

    pub fn headers(&self) -> &Headers {
        self.head.headers()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers().get(name)
    }

    /// A decoded query parameter. The query string is parsed on first use.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.queries().get(name).map(String::as_str)
    }

    pub fn queries(&self) -> &HashMap<String, String> {
        self.query
            .get_or_init(|| parse_query_string(self.query_string()))
    }

    /// A request cookie. The `Cookie` header is parsed on first use.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .get_or_init(|| {
                self.head
                    .headers()
                    .get_all("cookie")
                    .map(parse_cookie_header)
                    .fold(HashMap::new(), |mut all, mut one| {
                        for (k, v) in one.drain() {
                            all.entry(k).or_insert(v);
                        }
                        all
                    })
            })
            .get(name)
            .map(String::as_str)
    }

    /// A parameter captured by the matched route.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub(crate) fn set_params(&mut self, params: Params) {
        self.params = params;
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    /// The error an error-handler route is being asked to handle.
    pub fn error(&self) -> Option<&PendingError> {
        self.error.as_ref()
    }

    pub(crate) fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn set_error(&mut self, error: PendingError) {
        self.error = Some(error);
    }

    pub(crate) fn take_error(&mut self) -> Option<PendingError> {
        self.error.take()
    }

    /// Stores a response that is sent only if no route handles the request.
    pub fn stage(&mut self, response: Response) {
        self.staged = Some(response);
    }

    pub(crate) fn take_staged(&mut self) -> Option<Response> {
        self.staged.take()
    }

    // ── Body ─────────────────────────────────────────────────────────────────

    /// Pulls the next piece of the body. Bytes not pulled are not read from the
    /// socket, so a slow consumer pauses the peer.
    ///
    /// After streaming, the buffered accessors return [`BodyError::Consumed`].
    pub async fn body_chunk(&mut self) -> Result<Option<BodyChunk>, BodyError> {
        if self.body.is_some() {
            return Ok(None);
        }
        self.body_streamed = true;
        self.reader.next_chunk(&mut self.conn).await
    }

    /// Reads the whole body. Repeated calls return the same bytes.
    pub async fn bytes(&mut self) -> Result<Bytes, BodyError> {
        if let Some(body) = &self.body {
            return Ok(body.clone());
        }
        if self.body_streamed {
            return Err(BodyError::Consumed);
        }
        let max = self.services.config.max_body_size;
        let body = match self.reader.expected_len() {
            Some(len) => self.read_exact_body(len, max).await?,
            None => self.read_chunked_body(max).await?,
        };
        self.body = Some(body.clone());
        Ok(body)
    }

    async fn read_exact_body(&mut self, len: u64, max: usize) -> Result<Bytes, BodyError> {
        if len > max as u64 {
            return Err(BodyError::TooLarge { max_bytes: max });
        }
        let mut buf = BytesMut::with_capacity(len as usize);
        let mut offset = 0u64;
        while let Some(chunk) = self.reader.next_chunk(&mut self.conn).await? {
            offset += chunk.data.len() as u64;
            if offset > len {
                return Err(BodyError::LengthMismatch {
                    expected: len,
                    actual: offset,
                });
            }
            buf.put_slice(&chunk.data);
            if chunk.last {
                break;
            }
        }
        if offset != len {
            return Err(BodyError::LengthMismatch {
                expected: len,
                actual: offset,
            });
        }
        Ok(buf.freeze())
    }

    async fn read_chunked_body(&mut self, max: usize) -> Result<Bytes, BodyError> {
        let mut parts = Vec::new();
        let mut total = 0usize;
        while let Some(chunk) = self.reader.next_chunk(&mut self.conn).await? {
            total += chunk.data.len();
            if total > max {
                return Err(BodyError::TooLarge { max_bytes: max });
            }
            if !chunk.data.is_empty() {
                parts.push(chunk.data);
            }
            if chunk.last {
                break;
            }
        }
        Ok(match parts.len() {
            0 => Bytes::new(),
            1 => parts.swap_remove(0),
            _ => Bytes::from(parts.concat()),
        })
    }

    pub async fn text(&mut self) -> Result<String, BodyError> {
        Ok(String::from_utf8(self.bytes().await?.to_vec())?)
    }

    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T, BodyError> {
        Ok(serde_json::from_slice(&self.bytes().await?)?)
    }

    /// Decodes a `multipart/form-data` body.
    pub async fn multipart(&mut self) -> Result<Vec<Part>, BodyError> {
        let content_type = self
            .header("content-type")
            .filter(|ct| multipart::boundary(ct).is_some())
            .ok_or(BodyError::NotMultipart)?
            .to_owned();
        let body = self.bytes().await?;
        Ok(multipart::decode(&content_type, body)?)
    }

    /// Reads the body as the requested kind.
    pub async fn body(&mut self, kind: BodyKind) -> Result<Body, BodyError> {
        Ok(match kind {
            BodyKind::Bytes => Body::Bytes(self.bytes().await?),
            BodyKind::Text => Body::Text(self.text().await?),
            BodyKind::Json => Body::Json(self.json().await?),
            BodyKind::Multipart => Body::Multipart(self.multipart().await?),
        })
    }

    // ── Response ─────────────────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// `true` once any part of the response has been sent.
    pub fn is_handled(&self) -> bool {
        self.phase != Phase::Building
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn response_headers(&self) -> &Headers {
        &self.headers
    }

    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        if self.phase == Phase::Building {
            self.status = status;
        } else {
            debug!(%status, "status ignored after headers were sent");
        }
        self
    }

    /// Sets a response header, replacing any previous value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        if self.phase == Phase::Building {
            self.headers.set(name, value);
        } else {
            debug!(header = name, "header ignored after headers were sent");
        }
        self
    }

    pub fn append_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        if self.phase == Phase::Building {
            self.headers.append(name, value);
        } else {
            debug!(header = name, "header ignored after headers were sent");
        }
        self
    }

    pub fn set_cookie(&mut self, cookie: &Cookie) -> &mut Self {
        self.append_header("Set-Cookie", cookie.to_string())
    }

    /// Whether the response carries no body regardless of what is written.
    fn body_suppressed(&self) -> bool {
        *self.head.method() == Method::Head || !self.status.allows_body()
    }

    /// Encodes status line and headers. `length` is the full body length when
    /// known; otherwise a `Content-Length` set by the handler is honoured and
    /// chunked encoding is used in its absence. HTTP/1.0 peers cannot decode
    /// chunks, so their body runs until the connection closes instead.
    fn encode_response_head(&mut self, length: Option<u64>) -> BytesMut {
        if self.status.allows_body() {
            if let Some(declared) = self.headers.get("content-length") {
                self.declared_len = declared.trim().parse().ok();
            } else if let Some(n) = length {
                self.headers.set("Content-Length", n.to_string());
                self.declared_len = Some(n);
            } else if *self.head.method() != Method::Head {
                if self.head.version() == 0 {
                    self.keep_alive = false;
                } else {
                    self.headers.set("Transfer-Encoding", "chunked");
                    self.chunked = true;
                }
            }
        } else {
            self.headers.remove("content-length");
            self.headers.remove("transfer-encoding");
        }
        if !self.headers.contains("date") {
            self.headers.set("Date", http_date(SystemTime::now()));
        }
        if !self.keep_alive {
            self.headers.set("Connection", "close");
        } else if self.head.version() == 0 {
            self.headers.set("Connection", "keep-alive");
        }
        let mut out = BytesMut::new();
        encode_head(self.status, &self.headers, &mut out);
        out
    }

    /// Appends body bytes to `out` in the response's framing.
    fn frame_body(&mut self, data: &[u8], out: &mut BytesMut) {
        if data.is_empty() || self.body_suppressed() {
            return;
        }
        if self.chunked {
            out.put_slice(format!("{:X}\r\n", data.len()).as_bytes());
            out.put_slice(data);
            out.put_slice(b"\r\n");
        } else {
            out.put_slice(data);
        }
        self.body_sent += data.len() as u64;
    }

    /// Writes body bytes, flushing status and headers first if needed.
    ///
    /// # Errors
    ///
    /// Fails if the response already ended or the transport write fails; in
    /// the latter case the exchange is aborted.
    pub async fn write(&mut self, data: impl AsRef<[u8]>) -> io::Result<()> {
        let data = data.as_ref();
        let mut out = match self.phase {
            Phase::Ended => return Err(ended()),
            Phase::Building => {
                let head = self.encode_response_head(None);
                self.phase = Phase::HeadersSent;
                head
            }
            Phase::HeadersSent => BytesMut::with_capacity(data.len() + 16),
        };
        self.frame_body(data, &mut out);
        self.transmit(&out).await
    }

    /// Writes the final body bytes and completes the response. Calling it
    /// again after the response ended does nothing.
    pub async fn end(&mut self, data: impl AsRef<[u8]>) -> io::Result<()> {
        let data = data.as_ref();
        let mut out = match self.phase {
            Phase::Ended => return Ok(()),
            Phase::Building => self.encode_response_head(Some(data.len() as u64)),
            Phase::HeadersSent => BytesMut::with_capacity(data.len() + 16),
        };
        self.frame_body(data, &mut out);
        if self.chunked && !self.body_suppressed() {
            out.put_slice(b"0\r\n\r\n");
        }
        self.phase = Phase::Ended;
        if let Some(declared) = self.declared_len {
            if !self.body_suppressed() && declared != self.body_sent {
                // The peer cannot find the next message boundary.
                self.keep_alive = false;
            }
        }
        self.transmit(&out).await
    }

    /// Ends the response and closes the connection once it is written.
    pub async fn close(&mut self) {
        self.keep_alive = false;
        if self.phase == Phase::Ended {
            return;
        }
        if let Err(e) = self.end(b"").await {
            debug!(error = %e, "close after failed write");
        }
    }

    /// Sends a complete [`Response`]. Its headers are added to any already
    /// set on the exchange.
    pub async fn send(&mut self, response: Response) -> io::Result<()> {
        if self.phase != Phase::Building {
            debug!(status = %response.status(), "response ignored after headers were sent");
            return Ok(());
        }
        let (status, headers, body) = response.into_parts();
        self.status = status;
        for (name, value) in headers.iter() {
            self.headers.append(name, value);
        }
        self.end(&body).await
    }

    /// Writes raw wire bytes, aborting the exchange on failure.
    async fn transmit(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.conn.write_all(data).await {
            debug!(error = %e, "response write failed");
            self.fire_abort();
            return Err(e);
        }
        Ok(())
    }

    // ── Abort ────────────────────────────────────────────────────────────────

    /// Registers `observer` to run when the exchange is aborted. It runs
    /// immediately if that already happened.
    pub fn on_abort(&mut self, observer: impl FnOnce() + Send + Sync + 'static) {
        if self.is_aborted() {
            observer();
        } else {
            self.abort_observers.push(Box::new(observer));
        }
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    pub fn abort_signal(&self) -> AbortSignal {
        AbortSignal(self.abort.subscribe())
    }

    fn fire_abort(&mut self) {
        if self.abort.send_replace(true) {
            return;
        }
        self.phase = Phase::Ended;
        self.keep_alive = false;
        for observer in self.abort_observers.drain(..) {
            observer();
        }
    }

    // ── Connection hand-back ─────────────────────────────────────────────────

    /// Completes the exchange and returns the connection if it can serve
    /// another request.
    pub(crate) async fn finish(mut self) -> Option<Conn> {
        if self.phase != Phase::Ended {
            if let Err(e) = self.end(b"").await {
                debug!(error = %e, "could not complete response");
            }
        }
        if !self.keep_alive || self.is_aborted() {
            return None;
        }
        let limit = self.services.config.max_body_size;
        if let Err(e) = self.reader.discard(&mut self.conn, limit).await {
            debug!(error = %e, "unread request body could not be discarded");
            return None;
        }
        Some(self.conn)
    }

    pub(crate) fn into_conn(self) -> Conn {
        self.conn
    }
}

fn ended() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "response already ended")
}

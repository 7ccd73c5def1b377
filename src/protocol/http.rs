//! Per-connection HTTP/1.1 I/O.
//!
//! [`Conn`] owns both halves of an accepted stream plus the read buffer shared
//! by head parsing, body delivery and (after an upgrade) the WebSocket frame
//! parser. Bodies are pulled on demand through [`BodyReader`], so a handler
//! that never reads the body never makes the socket read ahead of it.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use memchr::memmem;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;

use super::backend::BoxedIo;
use super::multipart::MultipartError;
use crate::http::request::{RequestError, RequestHead};

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Longest chunk-size or trailer line accepted in a chunked body.
const MAX_CHUNK_LINE: usize = 4096;

/// Errors produced while receiving a request body.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed after {received} of {expected} body bytes")]
    UnexpectedEof { expected: u64, received: u64 },

    #[error("body length {actual} does not match Content-Length {expected}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("request body exceeds maximum allowed size of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("malformed chunked body: {0}")]
    Chunked(&'static str),

    #[error("body is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Multipart(#[from] MultipartError),

    #[error("request is not multipart/form-data")]
    NotMultipart,

    #[error("request body was already consumed as a stream")]
    Consumed,
}

/// One piece of a request body and whether it is the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyChunk {
    pub data: Bytes,
    pub last: bool,
}

/// Both halves of an accepted stream plus its unconsumed input.
pub struct Conn {
    reader: ReadHalf<BoxedIo>,
    writer: WriteHalf<BoxedIo>,
    pub(crate) buf: BytesMut,
    peer: Option<SocketAddr>,
    idle_timeout: Duration,
    written: u64,
}

impl Conn {
    pub fn new(io: BoxedIo, peer: Option<SocketAddr>, idle_timeout: Duration) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            reader,
            writer,
            buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
            peer,
            idle_timeout,
            written: 0,
        }
    }

    /// Wraps any in-memory or custom stream, e.g. a `tokio::io::duplex` end.
    pub fn from_stream<S>(stream: S, idle_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(Box::new(stream), None, idle_timeout)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Replaces the idle timeout, e.g. after a WebSocket upgrade.
    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) {
        self.idle_timeout = idle_timeout;
    }

    /// Total bytes the transport has acknowledged on this connection.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Reads more input into the buffer. Returns `0` at end of stream.
    ///
    /// A read that stays idle past the connection's idle timeout fails with
    /// [`io::ErrorKind::TimedOut`].
    pub async fn fill(&mut self) -> io::Result<usize> {
        match timeout(self.idle_timeout, self.reader.read_buf(&mut self.buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle socket timeout")),
        }
    }

    /// Reads until a complete request head is buffered and parses it.
    ///
    /// Returns `Ok(None)` when the peer closes the connection cleanly between
    /// requests.
    pub async fn read_head(&mut self, max_head_size: usize) -> Result<Option<RequestHead>, RequestError> {
        loop {
            if !self.buf.is_empty() {
                match RequestHead::parse(&self.buf) {
                    Ok((_, offset)) if offset > max_head_size => {
                        return Err(RequestError::HeadTooLarge {
                            max_bytes: max_head_size,
                        });
                    }
                    Ok((head, offset)) => {
                        self.buf.advance(offset);
                        return Ok(Some(head));
                    }
                    Err(RequestError::Incomplete) => {}
                    Err(e) => return Err(e),
                }
                if self.buf.len() > max_head_size {
                    return Err(RequestError::HeadTooLarge {
                        max_bytes: max_head_size,
                    });
                }
            }

            if self.fill().await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(RequestError::Io(io::ErrorKind::UnexpectedEof.into()))
                };
            }
        }
    }

    /// Issues a single write and returns how many bytes the transport accepted.
    ///
    /// Waits while the transport's buffer is full, so callers pumping large
    /// payloads naturally pause until it drains.
    pub async fn write_some(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(data).await?;
        if n == 0 && !data.is_empty() {
            return Err(io::ErrorKind::WriteZero.into());
        }
        self.written += n as u64;
        Ok(n)
    }

    /// Writes all of `data`, resuming each partial write at the last
    /// acknowledged offset, then flushes.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            offset += self.write_some(&data[offset..]).await?;
        }
        self.writer.flush().await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

/// Incremental decoder for `Transfer-Encoding: chunked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailers,
    Done,
}

enum Decoded {
    Data(Bytes),
    NeedMore,
    Done,
}

fn decode_chunked(state: &mut ChunkState, buf: &mut BytesMut) -> Result<Decoded, BodyError> {
    loop {
        match *state {
            ChunkState::Size => {
                let Some(eol) = memmem::find(buf, b"\r\n") else {
                    if buf.len() > MAX_CHUNK_LINE {
                        return Err(BodyError::Chunked("chunk size line too long"));
                    }
                    return Ok(Decoded::NeedMore);
                };
                let line = buf.split_to(eol + 2);
                let line = std::str::from_utf8(&line[..eol])
                    .map_err(|_| BodyError::Chunked("chunk size is not ASCII"))?;
                let digits = line.split(';').next().unwrap_or("").trim();
                let size = u64::from_str_radix(digits, 16)
                    .map_err(|_| BodyError::Chunked("invalid chunk size"))?;
                *state = if size == 0 {
                    ChunkState::Trailers
                } else {
                    ChunkState::Data { remaining: size }
                };
            }
            ChunkState::Data { remaining } => {
                if buf.is_empty() {
                    return Ok(Decoded::NeedMore);
                }
                let take = remaining.min(buf.len() as u64) as usize;
                let data = buf.split_to(take).freeze();
                let remaining = remaining - take as u64;
                *state = if remaining == 0 {
                    ChunkState::DataEnd
                } else {
                    ChunkState::Data { remaining }
                };
                return Ok(Decoded::Data(data));
            }
            ChunkState::DataEnd => {
                if buf.len() < 2 {
                    return Ok(Decoded::NeedMore);
                }
                if &buf[..2] != b"\r\n" {
                    return Err(BodyError::Chunked("missing CRLF after chunk data"));
                }
                buf.advance(2);
                *state = ChunkState::Size;
            }
            ChunkState::Trailers => {
                let Some(eol) = memmem::find(buf, b"\r\n") else {
                    if buf.len() > MAX_CHUNK_LINE {
                        return Err(BodyError::Chunked("trailer line too long"));
                    }
                    return Ok(Decoded::NeedMore);
                };
                buf.advance(eol + 2);
                if eol == 0 {
                    *state = ChunkState::Done;
                }
            }
            ChunkState::Done => return Ok(Decoded::Done),
        }
    }
}

#[derive(Debug)]
enum Framing {
    Length { expected: u64, remaining: u64 },
    Chunked(ChunkState),
}

/// Pulls a request body off a [`Conn`] as a sequence of [`BodyChunk`]s.
#[derive(Debug)]
pub struct BodyReader {
    framing: Framing,
    finished: bool,
}

impl BodyReader {
    /// Chooses the framing for `head`'s body. Chunked encoding wins over
    /// `Content-Length`; a request with neither has an empty body.
    pub fn for_head(head: &RequestHead) -> Result<Self, RequestError> {
        let framing = if head.is_chunked() {
            Framing::Chunked(ChunkState::Size)
        } else {
            let expected = head.content_length()?.unwrap_or(0);
            Framing::Length {
                expected,
                remaining: expected,
            }
        };
        Ok(Self {
            framing,
            finished: false,
        })
    }

    /// An empty body, for exchanges built without one.
    pub fn empty() -> Self {
        Self {
            framing: Framing::Length {
                expected: 0,
                remaining: 0,
            },
            finished: true,
        }
    }

    /// The declared body length, when the framing carries one.
    pub fn expected_len(&self) -> Option<u64> {
        match self.framing {
            Framing::Length { expected, .. } => Some(expected),
            Framing::Chunked(_) => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns the next body chunk, or `None` once the final chunk was delivered.
    pub async fn next_chunk(&mut self, conn: &mut Conn) -> Result<Option<BodyChunk>, BodyError> {
        if self.finished {
            return Ok(None);
        }
        match &mut self.framing {
            Framing::Length { expected, remaining } => {
                if *remaining == 0 {
                    self.finished = true;
                    return Ok(Some(BodyChunk {
                        data: Bytes::new(),
                        last: true,
                    }));
                }
                if conn.buf.is_empty() && conn.fill().await? == 0 {
                    return Err(BodyError::UnexpectedEof {
                        expected: *expected,
                        received: *expected - *remaining,
                    });
                }
                let take = (*remaining).min(conn.buf.len() as u64) as usize;
                let data = conn.buf.split_to(take).freeze();
                *remaining -= take as u64;
                let last = *remaining == 0;
                self.finished = last;
                Ok(Some(BodyChunk { data, last }))
            }
            Framing::Chunked(state) => loop {
                match decode_chunked(state, &mut conn.buf)? {
                    Decoded::Data(data) => return Ok(Some(BodyChunk { data, last: false })),
                    Decoded::Done => {
                        self.finished = true;
                        return Ok(Some(BodyChunk {
                            data: Bytes::new(),
                            last: true,
                        }));
                    }
                    Decoded::NeedMore => {
                        if conn.fill().await? == 0 {
                            return Err(BodyError::Chunked("connection closed mid-body"));
                        }
                    }
                }
            },
        }
    }

    /// Reads and drops whatever is left of the body so the next request on the
    /// connection starts at a message boundary.
    ///
    /// Fails with [`BodyError::TooLarge`] rather than drop more than `limit`
    /// bytes; a declared length over the limit fails before anything is read.
    pub async fn discard(&mut self, conn: &mut Conn, limit: usize) -> Result<(), BodyError> {
        let too_large = || BodyError::TooLarge { max_bytes: limit };
        if let Framing::Length { remaining, .. } = self.framing {
            if !self.finished && remaining > limit as u64 {
                return Err(too_large());
            }
        }
        let mut dropped = 0usize;
        while let Some(chunk) = self.next_chunk(conn).await? {
            dropped += chunk.data.len();
            if dropped > limit {
                return Err(too_large());
            }
        }
        Ok(())
    }
}

//! Protocol backend: everything between raw transport bytes and the
//! [`Exchange`](crate::exchange::Exchange) facade.
//!
//! - [`backend`]: pluggable listeners ([`Backend`], [`TcpBackend`]).
//! - [`http`]: per-connection I/O: head reading, body framing, tracked writes.
//! - [`multipart`]: `multipart/form-data` decoding.
//!
//! The WebSocket half of the backend lives in [`crate::realtime`].

pub mod backend;
pub mod http;
pub mod multipart;

pub use backend::{Backend, BoxedIo, TcpBackend, TlsMaterial};
pub use http::{BodyChunk, BodyError};
pub use multipart::{MultipartError, Part};

//! WebSockets (RFC 6455) without extensions.
//!
//! - [`handshake`] validates upgrade requests and builds the `101` answer.
//! - [`frame`] is the incremental frame codec.
//! - [`socket`] drives an upgraded connection and exposes [`WebSocket`] to
//!   application callbacks.
//! - [`hub`] fans published messages out to topic subscribers.

pub mod frame;
pub mod handshake;
pub mod hub;
pub mod socket;

pub use frame::{Event, FrameParser, Message, ProtocolError, close_code};
pub use handshake::{HandshakeError, Upgrade};
pub use hub::TopicHub;
pub use socket::{SendStatus, WebSocket, WsHandlers, WsOptions, WsResult, WsState};

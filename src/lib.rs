//! # wharf
//!
//! An embeddable async HTTP/1.1 serving engine: pattern routing with nested
//! routers, a request/response facade with an explicit output state machine,
//! a cached and compressed static-file pipeline with range support, and
//! RFC 6455 WebSockets with topic pub/sub.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wharf::{FileOptions, Reply, Response, Router, ServerConfig, StatusCode, WsHandlers};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/hello/:name", |ex| {
//!         let name = ex.param("name").unwrap_or("world").to_owned();
//!         Ok(Response::new(StatusCode::Ok).body(format!("Hello, {name}!")).into())
//!     });
//!     router.get("/assets/*", |ex| {
//!         Ok(Reply::deferred(async move {
//!             let file = format!("public/{}", ex.param("wildcard").unwrap_or_default());
//!             ex.file(file, &FileOptions::default()).await?;
//!             Ok(None)
//!         }))
//!     });
//!     router.ws("/echo", WsHandlers::new().on_message(|ws, msg| {
//!         ws.send(msg);
//!         Ok(())
//!     }));
//!
//!     let server = router.listen(8080, Some("127.0.0.1"), ServerConfig::default()).await?;
//!     println!("Listening on http://127.0.0.1:{}", server.port());
//!     tokio::signal::ctrl_c().await?;
//!     server.unlisten().await;
//!     Ok(())
//! }
//! ```

use std::pin::Pin;

pub mod cache;
pub mod config;
pub mod exchange;
pub mod http;
pub mod protocol;
pub mod realtime;
pub mod router;
pub mod server;

/// Boxed error returned by handlers and callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future used at the crate's dynamic-dispatch seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{ConfigError, ServerConfig, WebSocketConfig};
pub use exchange::{Exchange, FileError, FileOptions, FileOutcome, Phase};
pub use http::{Cookie, Headers, Method, Response, StatusCode};
pub use realtime::{Message, SendStatus, WebSocket, WsHandlers, WsOptions};
pub use router::{Params, Pattern, Reply, Router};
pub use server::{Listening, ServerError, ServerHandle};

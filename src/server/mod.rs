//! Listen lifecycle and per-connection request loop.
//!
//! [`Router::listen`] binds a TCP backend and [`Router::serve`] accepts any
//! [`Backend`]. Each accepted stream gets its own Tokio task that reads one
//! request head at a time, hands the request to the router through an
//! [`Exchange`], and keeps the connection alive as long as both sides allow it.
//! Upgrade requests matching a WebSocket route leave the HTTP loop for the
//! WebSocket driver.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::FileCache;
use crate::config::{ConfigError, ServerConfig};
use crate::exchange::Exchange;
use crate::http::request::{RequestError, RequestHead};
use crate::http::response::encode_head;
use crate::http::{Headers, StatusCode};
use crate::protocol::http::Conn;
use crate::protocol::{Backend, TcpBackend};
use crate::realtime::handshake::{Upgrade, rejection};
use crate::realtime::socket::{self, UpgradeInfo};
use crate::realtime::{Message, TopicHub, WebSocket, WsHandlers};
use crate::router::{Params, Router};

/// Errors produced while starting a server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("backend cannot serve server name {name:?}: {source}")]
    ServerName {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// State shared by every connection of one server.
#[derive(Debug)]
pub(crate) struct Services {
    pub(crate) cache: FileCache,
    pub(crate) hub: Arc<TopicHub>,
    pub(crate) config: ServerConfig,
}

impl Services {
    pub(crate) fn new(config: ServerConfig) -> Self {
        Self {
            cache: FileCache::new(),
            hub: Arc::new(TopicHub::new()),
            config,
        }
    }
}

/// Cloneable handle to a running server's shared state.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    services: Arc<Services>,
}

impl ServerHandle {
    /// Sends `message` to every WebSocket subscribed to `topic`. Returns the
    /// number of recipients.
    pub fn publish(&self, topic: &str, message: impl Into<Message>) -> usize {
        self.services.hub.publish(topic, &message.into(), None)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.services.hub.subscriber_count(topic)
    }

    /// The server's static-file cache, e.g. to invalidate a changed file.
    pub fn file_cache(&self) -> &FileCache {
        &self.services.cache
    }

    pub fn config(&self) -> &ServerConfig {
        &self.services.config
    }
}

/// A server accepting connections.
///
/// Dropping it leaves the server running in the background; call
/// [`Listening::unlisten`] to stop accepting.
#[derive(Debug)]
pub struct Listening {
    local_addr: SocketAddr,
    handle: ServerHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Listening {
    /// The bound port; useful after listening on port `0`.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    /// Stops accepting new connections and waits for the accept loop to exit.
    /// Connections already accepted run to completion.
    pub async fn unlisten(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "accept loop ended abnormally");
        }
        info!(address = %self.local_addr, "wharf stopped listening");
    }
}

impl Router {
    /// Binds `address:port` (all interfaces when `address` is `None`) and
    /// starts serving.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound, and the
    /// errors of [`Router::serve`].
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use wharf::{Response, Router, ServerConfig, StatusCode};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let mut router = Router::new();
    ///     router.get("/", |_| Ok(Response::new(StatusCode::Ok).body("Hello!").into()));
    ///     let server = router.listen(8080, Some("127.0.0.1"), ServerConfig::default()).await?;
    ///     tokio::signal::ctrl_c().await?;
    ///     server.unlisten().await;
    ///     Ok(())
    /// }
    /// ```
    pub async fn listen(
        self,
        port: u16,
        address: Option<&str>,
        config: ServerConfig,
    ) -> Result<Listening, ServerError> {
        let addr = match address {
            Some(host) if host.contains(':') => format!("[{host}]:{port}"),
            Some(host) => format!("{host}:{port}"),
            None => format!("0.0.0.0:{port}"),
        };
        let backend = TcpBackend::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.serve(backend, config)
    }

    /// Serves connections accepted by `backend`.
    ///
    /// Server names registered with [`Router::server_name`] are applied to the
    /// backend first.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] for an invalid config and
    /// [`ServerError::ServerName`] when the backend refuses a server name.
    pub fn serve<B: Backend>(self, mut backend: B, config: ServerConfig) -> Result<Listening, ServerError> {
        config.validate()?;
        for (name, material) in self.server_names() {
            backend
                .add_server_name(name, material)
                .map_err(|source| ServerError::ServerName {
                    name: name.clone(),
                    source,
                })?;
        }
        let local_addr = backend.local_addr()?;
        let services = Arc::new(Services::new(config));
        let (shutdown, stop) = watch::channel(false);

        info!(address = %local_addr, backend = backend.name(), "wharf listening");
        let task = tokio::spawn(accept_loop(backend, Arc::new(self), services.clone(), stop));

        Ok(Listening {
            local_addr,
            handle: ServerHandle { services },
            shutdown,
            task,
        })
    }
}

async fn accept_loop<B: Backend>(
    backend: B,
    router: Arc<Router>,
    services: Arc<Services>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            Ok(()) = stop.changed() => break,
            accepted = backend.accept() => accepted,
        };
        let (io, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "failed to accept connection");
                continue;
            }
        };

        debug!(peer = %peer_addr, "connection accepted");
        let conn = Conn::new(io, Some(peer_addr), services.config.idle_timeout());
        let router = Arc::clone(&router);
        let services = Arc::clone(&services);

        tokio::spawn(async move {
            handle_connection(conn, router, services).await;
            debug!(peer = %peer_addr, "connection closed");
        });
    }
}

/// Serves requests on one connection until either side ends it.
async fn handle_connection(mut conn: Conn, router: Arc<Router>, services: Arc<Services>) {
    let peer = conn.peer_addr();
    loop {
        let head = match conn.read_head(services.config.max_head_size).await {
            Ok(Some(head)) => head,
            Ok(None) => return,
            Err(RequestError::HeadTooLarge { max_bytes }) => {
                warn!(peer = ?peer, max_bytes, "request head too large; sending 431");
                reject(&mut conn, StatusCode::RequestHeaderFieldsTooLarge).await;
                return;
            }
            Err(RequestError::Io(e)) if e.kind() == io::ErrorKind::TimedOut => {
                warn!(peer = ?peer, "idle connection timed out");
                return;
            }
            Err(RequestError::Io(e)) => {
                debug!(peer = ?peer, error = %e, "connection read failed");
                return;
            }
            Err(e) => {
                warn!(peer = ?peer, error = %e, "malformed request; sending 400");
                reject(&mut conn, StatusCode::BadRequest).await;
                return;
            }
        };

        debug!(peer = ?peer, method = %head.method(), path = %head.path(), "dispatching request");

        if head.is_websocket_upgrade() {
            if let Some((handlers, params)) = router.find_ws(head.path()) {
                upgrade(conn, head, handlers, params, &services).await;
                return;
            }
        }

        let mut ex = match Exchange::new(conn, head, Arc::clone(&services)) {
            Ok(ex) => ex,
            Err((mut conn, e)) => {
                warn!(peer = ?peer, error = %e, "unframeable request body; sending 400");
                reject(&mut conn, StatusCode::BadRequest).await;
                return;
            }
        };
        router.handle(&mut ex).await;
        match ex.finish().await {
            Some(next) => conn = next,
            None => return,
        }
    }
}

/// Completes the opening handshake and runs the WebSocket until it closes.
async fn upgrade(
    mut conn: Conn,
    head: RequestHead,
    handlers: Arc<WsHandlers>,
    params: Params,
    services: &Services,
) {
    let peer = conn.peer_addr();
    let upgrade = match Upgrade::from_head(&head) {
        Ok(upgrade) => upgrade,
        Err(e) => {
            warn!(peer = ?peer, path = %head.path(), error = %e, "WebSocket handshake rejected");
            if let Err(e) = conn.write_all(&rejection(&e)).await {
                debug!(peer = ?peer, error = %e, "handshake rejection could not be written");
            }
            shutdown(&mut conn).await;
            return;
        }
    };

    let options = handlers
        .options()
        .cloned()
        .unwrap_or_else(|| services.config.websocket.options());
    let protocol = upgrade.select_protocol(&options.protocols).map(str::to_owned);
    if let Err(e) = conn.write_all(&upgrade.response(protocol.as_deref())).await {
        debug!(peer = ?peer, error = %e, "handshake response could not be written");
        return;
    }

    let info = UpgradeInfo {
        path: head.path().to_owned(),
        query: head.query_string().unwrap_or_default().to_owned(),
        headers: head.headers().clone(),
        params,
        protocol,
    };
    let (ws, inbox) = WebSocket::new(Arc::clone(&services.hub), info, options.max_backpressure);
    debug!(peer = ?peer, id = ws.id(), path = %head.path(), "WebSocket opened");
    socket::run(conn, ws, inbox, handlers, options).await;
}

/// Answers with a bare status and closes the connection.
async fn reject(conn: &mut Conn, status: StatusCode) {
    let body = status.canonical_reason();
    let mut headers = Headers::with_capacity(3);
    headers.append("Content-Type", "text/plain; charset=utf-8");
    headers.append("Content-Length", body.len().to_string());
    headers.append("Connection", "close");
    let mut out = BytesMut::new();
    encode_head(status, &headers, &mut out);
    out.extend_from_slice(body.as_bytes());
    if let Err(e) = conn.write_all(&out).await {
        debug!(error = %e, status = %status, "rejection could not be written");
    }
    shutdown(conn).await;
}

async fn shutdown(conn: &mut Conn) {
    if let Err(e) = conn.shutdown().await {
        debug!(error = %e, "connection shutdown failed");
    }
}

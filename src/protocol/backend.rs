//! Listener backends.
//!
//! The router never touches sockets directly: it asks a [`Backend`] for
//! accepted byte streams. [`TcpBackend`] serves plain TCP; an embedder that owns
//! TLS termination implements [`Backend`] over its own acceptor and receives the
//! router's server-name bindings through [`Backend::add_server_name`].

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::BoxFuture;

/// A bidirectional byte stream accepted by a backend.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// Type-erased accepted stream.
pub type BoxedIo = Box<dyn Io>;

/// Certificate chain and private key for one server name, PEM encoded.
#[derive(Clone)]
pub struct TlsMaterial {
    pub cert_chain_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_chain_pem", &format_args!("{} bytes", self.cert_chain_pem.len()))
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// A source of accepted connections.
pub trait Backend: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// The address the backend is listening on.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Waits for the next connection.
    fn accept(&self) -> BoxFuture<'_, io::Result<(BoxedIo, SocketAddr)>>;

    /// Binds TLS material to a server name (SNI).
    ///
    /// Backends without TLS reject every binding.
    fn add_server_name(&mut self, name: &str, _material: &TlsMaterial) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} backend cannot serve server name {name:?}", self.name()),
        ))
    }
}

/// Plain TCP listener backend.
#[derive(Debug)]
pub struct TcpBackend {
    listener: TcpListener,
}

impl TcpBackend {
    /// Binds a TCP listener to `addr` (e.g. `"127.0.0.1:0"`).
    pub async fn bind(addr: &str) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }
}

impl Backend for TcpBackend {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<(BoxedIo, SocketAddr)>> {
        Box::pin(async move {
            let (stream, peer) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            Ok((Box::new(stream) as BoxedIo, peer))
        })
    }
}

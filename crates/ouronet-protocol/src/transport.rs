//! Byte-stream transports.
//!
//! The engine runs over anything that is `AsyncRead + AsyncWrite`. A
//! [`Connector`] opens client streams; an [`Acceptor`] yields server ones.
//! TCP and Unix sockets are provided, plus an in-memory network for tests.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Opens client connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<BoxedStream>;

    /// Human-readable peer address for logs.
    fn describe(&self) -> String;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for std::sync::Arc<C> {
    async fn connect(&self) -> io::Result<BoxedStream> {
        (**self).connect().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Accepts server connections.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// The next inbound stream and a description of its peer.
    async fn accept(&self) -> io::Result<(BoxedStream, String)>;
}

/// Where to reach a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix { path: path.into() }
    }
}

#[async_trait]
impl Connector for Endpoint {
    async fn connect(&self) -> io::Result<BoxedStream> {
        match self {
            Endpoint::Tcp { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    }

    fn describe(&self) -> String {
        match self {
            Endpoint::Tcp { host, port } => format!("{}:{}", host, port),
            Endpoint::Unix { path } => path.display().to_string(),
        }
    }
}

#[async_trait]
impl Acceptor for tokio::net::TcpListener {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        let (stream, addr) = tokio::net::TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), addr.to_string()))
    }
}

#[cfg(unix)]
#[async_trait]
impl Acceptor for tokio::net::UnixListener {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        let (stream, addr) = tokio::net::UnixListener::accept(self).await?;
        let peer = addr
            .as_pathname()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "unix".to_string());
        Ok((Box::new(stream), peer))
    }
}

/// An in-memory network for testing.
///
/// Streams are `tokio::io::duplex` pairs handed from connector to acceptor
/// over a channel. A network can be re-listened after its acceptor is
/// dropped, which lets tests take a server down and bring it back.
pub mod memory {
    use super::*;
    use std::sync::{Arc, Mutex, PoisonError};
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    const DUPLEX_BUFFER: usize = 64 * 1024;

    /// Shared state for a memory network.
    pub struct MemoryNetwork {
        name: String,
        listener: Mutex<Option<mpsc::UnboundedSender<DuplexStream>>>,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new(name: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                listener: Mutex::new(None),
            })
        }

        /// Start accepting; replaces any previous acceptor.
        pub fn listen(self: &Arc<Self>) -> MemoryAcceptor {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
            MemoryAcceptor {
                incoming: tokio::sync::Mutex::new(rx),
                name: self.name.clone(),
            }
        }

        /// A connector that dials this network.
        pub fn connector(self: &Arc<Self>) -> MemoryConnector {
            MemoryConnector {
                network: Arc::clone(self),
            }
        }
    }

    /// Dials a [`MemoryNetwork`].
    #[derive(Clone)]
    pub struct MemoryConnector {
        network: Arc<MemoryNetwork>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self) -> io::Result<BoxedStream> {
            let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
            let listener = self
                .network
                .listener
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match listener {
                Some(tx) if tx.send(remote).is_ok() => Ok(Box::new(local)),
                _ => Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("nothing listening on memory network {}", self.network.name),
                )),
            }
        }

        fn describe(&self) -> String {
            format!("memory:{}", self.network.name)
        }
    }

    /// Accepts streams dialled on a [`MemoryNetwork`].
    pub struct MemoryAcceptor {
        incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
        name: String,
    }

    #[async_trait]
    impl Acceptor for MemoryAcceptor {
        async fn accept(&self) -> io::Result<(BoxedStream, String)> {
            match self.incoming.lock().await.recv().await {
                Some(stream) => Ok((Box::new(stream), format!("memory:{}", self.name))),
                None => Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "memory network closed",
                )),
            }
        }
    }
}

//! Server node: serves one chain to every peer that connects.

use std::sync::Arc;

use ouronet_chainstate::ChainState;
use ouronet_core::Point;
use ouronet_protocol::chainsync::DEFAULT_ROLLBACK_WINDOW;
use ouronet_protocol::{
    serve, Acceptor, AgentHandle, BlockFetchServer, ChainSyncServer, Endpoint, HandshakeAgent,
    KeepAliveServer, Server, ServerAgents, ServerConfig, ServerHandle, VersionTable,
};

use crate::error::Result;

/// Builder for [`NodeServer`].
pub struct NodeServerBuilder {
    chain: Arc<dyn ChainState>,
    network_magic: u64,
    node_to_client: bool,
    config: ServerConfig,
    rollback_window: usize,
    max_batch: usize,
}

impl NodeServerBuilder {
    /// Serve the node-to-client family: whole blocks over chain-sync, no
    /// block-fetch or keep-alive.
    pub fn node_to_client(mut self) -> Self {
        self.node_to_client = true;
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rollback_window(mut self, window: usize) -> Self {
        self.rollback_window = window;
        self
    }

    pub fn max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    /// Start serving on an existing acceptor.
    pub fn serve(self, acceptor: impl Acceptor + 'static) -> NodeServer {
        let NodeServerBuilder {
            chain,
            network_magic,
            node_to_client,
            config,
            rollback_window,
            max_batch,
        } = self;

        let versions = if node_to_client {
            VersionTable::node_to_client(network_magic)
        } else {
            VersionTable::node_to_node(network_magic)
        };

        let factory = move |peer: &str| {
            tracing::debug!(peer = %peer, "building agents for peer");
            let chain_sync =
                ChainSyncServer::new(Arc::clone(&chain)).with_rollback_window(rollback_window);
            if node_to_client {
                return ServerAgents::new(HandshakeAgent::server(versions.clone()))
                    .with_chain_sync(AgentHandle::new(chain_sync.node_to_client()));
            }
            ServerAgents::new(HandshakeAgent::server(versions.clone()))
                .with_chain_sync(AgentHandle::new(chain_sync))
                .with_agent(AgentHandle::new(
                    BlockFetchServer::new(Arc::clone(&chain)).with_max_batch(max_batch),
                ))
                .with_agent(AgentHandle::new(KeepAliveServer::new()))
        };

        NodeServer {
            server: serve(acceptor, config, factory),
            local_addr: None,
        }
    }

    /// Bind `endpoint` and start serving on it.
    pub async fn bind(self, endpoint: &Endpoint) -> Result<NodeServer> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = tokio::net::TcpListener::bind((host.as_str(), *port)).await?;
                let local_addr = listener.local_addr()?.to_string();
                tracing::info!(addr = %local_addr, "listening");
                let mut server = self.serve(listener);
                server.local_addr = Some(local_addr);
                Ok(server)
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let listener = tokio::net::UnixListener::bind(path)?;
                tracing::info!(path = %path.display(), "listening");
                let mut server = self.serve(listener);
                server.local_addr = Some(path.display().to_string());
                Ok(server)
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(crate::error::NodeError::Config(
                "unix sockets are not available on this platform".into(),
            )),
        }
    }
}

/// A running server.
pub struct NodeServer {
    server: Server,
    local_addr: Option<String>,
}

impl NodeServer {
    pub fn builder(chain: Arc<dyn ChainState>, network_magic: u64) -> NodeServerBuilder {
        NodeServerBuilder {
            chain,
            network_magic,
            node_to_client: false,
            config: ServerConfig::default(),
            rollback_window: DEFAULT_ROLLBACK_WINDOW,
            max_batch: BlockFetchServer::DEFAULT_MAX_BATCH,
        }
    }

    /// Address the server is bound to, when it bound one itself.
    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }

    pub fn handle(&self) -> ServerHandle {
        self.server.handle()
    }

    /// Push a new tip to every waiting chain-sync client.
    pub fn notify_new_block(&self, point: Point) {
        self.server.handle().notify_new_block(point);
    }

    pub fn connection_count(&self) -> usize {
        self.server.handle().connection_count()
    }

    pub async fn shutdown(self) {
        self.server.shutdown().await;
    }
}

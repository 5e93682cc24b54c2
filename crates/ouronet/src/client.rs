//! Client node: one session to one peer with the usual agents attached.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ouronet_core::Point;
use ouronet_protocol::{
    AgentHandle, BlockFetchClient, ChainSyncClient, Connector, HandshakeAgent, KeepAliveClient,
    Session, SessionListener, SessionState, VersionData,
};
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};

/// Builder for [`NodeClient`].
pub struct NodeClientBuilder {
    config: NodeConfig,
    connector: Option<Arc<dyn Connector>>,
    chain_sync: Option<ChainSyncClient>,
    block_fetch: Option<BlockFetchClient>,
    listeners: Vec<Arc<dyn SessionListener>>,
}

impl NodeClientBuilder {
    /// Dial through `connector` instead of the configured endpoint.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn chain_sync(mut self, client: ChainSyncClient) -> Self {
        self.chain_sync = Some(client);
        self
    }

    /// Only available on node-to-node connections.
    pub fn block_fetch(mut self, client: BlockFetchClient) -> Self {
        self.block_fetch = Some(client);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Result<NodeClient> {
        let config = self.config;
        if config.node_to_client && self.block_fetch.is_some() {
            return Err(NodeError::Config(
                "block-fetch is not part of the node-to-client protocol family".into(),
            ));
        }

        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(config.endpoint.clone()),
        };
        let session = Session::new(
            connector,
            HandshakeAgent::client(config.version_table()),
            config.session.clone(),
        );

        let chain_sync = self.chain_sync.map(|client| {
            let client = if config.node_to_client {
                client.node_to_client()
            } else {
                client
            };
            AgentHandle::new(client)
        });
        if let Some(handle) = &chain_sync {
            session.add_agent(handle.clone())?;
        }

        let block_fetch = self.block_fetch.map(AgentHandle::new);
        if let Some(handle) = &block_fetch {
            session.add_agent(handle.clone())?;
        }

        let keep_alive = if config.node_to_client {
            None
        } else {
            let handle = AgentHandle::new(KeepAliveClient::new());
            session.add_agent(handle.clone())?;
            Some(handle)
        };

        for listener in self.listeners {
            session.add_listener(listener)?;
        }

        Ok(NodeClient {
            session,
            chain_sync,
            block_fetch,
            keep_alive,
            ping_interval: config.keep_alive_interval(),
            pinger: Mutex::new(None),
        })
    }
}

/// A connection to one peer with chain-sync, block-fetch and keep-alive.
pub struct NodeClient {
    session: Session,
    chain_sync: Option<AgentHandle<ChainSyncClient>>,
    block_fetch: Option<AgentHandle<BlockFetchClient>>,
    keep_alive: Option<AgentHandle<KeepAliveClient>>,
    ping_interval: Option<Duration>,
    pinger: Mutex<Option<JoinHandle<()>>>,
}

impl NodeClient {
    pub fn builder(config: NodeConfig) -> NodeClientBuilder {
        NodeClientBuilder {
            config,
            connector: None,
            chain_sync: None,
            block_fetch: None,
            listeners: Vec::new(),
        }
    }

    /// Connect, handshake and start the keep-alive timer.
    pub async fn start(&self) -> Result<()> {
        self.session.start().await?;

        if let (Some(handle), Some(interval)) = (&self.keep_alive, self.ping_interval) {
            let handle = handle.clone();
            let pinger = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick completes immediately.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Some(cookie) = tick_ping(&handle) {
                        tracing::trace!(cookie, "keep-alive ping");
                    }
                }
            });
            let previous = self
                .pinger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(pinger);
            if let Some(previous) = previous {
                previous.abort();
            }
        }
        Ok(())
    }

    /// Stop pinging, close the connection and wait for the session to stop.
    pub async fn shutdown(&self) {
        let pinger = self
            .pinger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pinger) = pinger {
            pinger.abort();
        }
        self.session.shutdown().await;
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn negotiated(&self) -> Option<(u64, VersionData)> {
        self.session.negotiated()
    }

    pub fn chain_sync(&self) -> Option<&AgentHandle<ChainSyncClient>> {
        self.chain_sync.as_ref()
    }

    pub fn block_fetch(&self) -> Option<&AgentHandle<BlockFetchClient>> {
        self.block_fetch.as_ref()
    }

    pub fn keep_alive(&self) -> Option<&AgentHandle<KeepAliveClient>> {
        self.keep_alive.as_ref()
    }

    /// Queue a block range on the block-fetch client.
    pub fn fetch(&self, from: Point, to: Point) -> Result<()> {
        let handle = self
            .block_fetch
            .as_ref()
            .ok_or_else(|| NodeError::Config("no block-fetch client configured".into()))?;
        handle.with(|client| client.fetch(from, to));
        Ok(())
    }

    /// Send a keep-alive ping now; returns its cookie.
    pub fn ping(&self) -> Option<u32> {
        self.keep_alive.as_ref().map(|handle| handle.with(|k| k.ping()))
    }
}

/// One pinger tick: ping unless disconnected or the last ping is unanswered.
fn tick_ping(handle: &AgentHandle<KeepAliveClient>) -> Option<u32> {
    if !handle.is_bound() {
        return None;
    }
    handle.with(|k| (!k.is_waiting()).then(|| k.ping()))
}

impl Drop for NodeClient {
    fn drop(&mut self) {
        if let Some(pinger) = self
            .pinger
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pinger.abort();
        }
    }
}

//! Server accept loop.
//!
//! Every accepted stream gets a fresh set of agents from the factory, runs
//! the handshake and, once a version is accepted, has the remaining agents
//! bound until the peer goes away or the server shuts down. Every agent is
//! routed before the handshake starts, so a client that pipelines its
//! first request behind the proposal is answered once the version is
//! accepted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ouronet_core::Point;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::agent::Agent;
use crate::chainsync::ChainSyncServer;
use crate::channel::{AgentHandle, AgentPort};
use crate::connection::{wait_raised, Connection};
use crate::handshake::{wait_outcome, HandshakeAgent, HandshakeOutcome};
use crate::mux::DEFAULT_MAX_MESSAGE_LEN;
use crate::transport::{Acceptor, BoxedStream};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Connections beyond this many are closed on accept.
    pub max_connections: Option<usize>,
    /// Time a peer has to complete the handshake.
    pub handshake_timeout_ms: u64,
    /// Largest message accepted from a peer.
    pub max_message_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            handshake_timeout_ms: 10_000,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

/// The agents serving one connection.
pub struct ServerAgents {
    handshake: HandshakeAgent,
    agents: Vec<Arc<dyn AgentPort>>,
    chain_sync: Vec<AgentHandle<ChainSyncServer>>,
}

impl ServerAgents {
    pub fn new(handshake: HandshakeAgent) -> Self {
        Self {
            handshake,
            agents: Vec::new(),
            chain_sync: Vec::new(),
        }
    }

    pub fn with_agent<A: Agent>(mut self, handle: AgentHandle<A>) -> Self {
        self.agents.push(Arc::new(handle));
        self
    }

    /// Add a chain-sync server that receives new-block notifications.
    pub fn with_chain_sync(mut self, handle: AgentHandle<ChainSyncServer>) -> Self {
        self.agents.push(Arc::new(handle.clone()));
        self.chain_sync.push(handle);
        self
    }
}

/// Builds the agents for a newly accepted peer.
pub trait AgentFactory: Send + Sync + 'static {
    fn agents(&self, peer: &str) -> ServerAgents;
}

impl<F> AgentFactory for F
where
    F: Fn(&str) -> ServerAgents + Send + Sync + 'static,
{
    fn agents(&self, peer: &str) -> ServerAgents {
        self(peer)
    }
}

struct Shared {
    config: ServerConfig,
    factory: Box<dyn AgentFactory>,
    /// Chain-sync servers of every active connection, by connection id.
    active: Mutex<HashMap<u64, Vec<AgentHandle<ChainSyncServer>>>>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, HashMap<u64, Vec<AgentHandle<ChainSyncServer>>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable access to a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Tell every connected chain-sync client that the chain grew.
    pub fn notify_new_block(&self, point: Point) {
        let handles: Vec<_> = self.shared.active().values().flatten().cloned().collect();
        for handle in handles {
            handle.with(|server| server.notify_new_block(point));
        }
    }

    /// Connections that completed the handshake and are still open.
    pub fn connection_count(&self) -> usize {
        self.shared.active().len()
    }
}

/// A running server.
pub struct Server {
    handle: ServerHandle,
    accept: Option<JoinHandle<()>>,
}

/// Start accepting on `acceptor`.
pub fn serve(
    acceptor: impl Acceptor + 'static,
    config: ServerConfig,
    factory: impl AgentFactory,
) -> Server {
    let shared = Arc::new(Shared {
        config,
        factory: Box::new(factory),
        active: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(0),
        shutdown: watch::Sender::new(false),
    });
    let accept = tokio::spawn(accept_loop(Arc::clone(&shared), Box::new(acceptor)));
    Server {
        handle: ServerHandle { shared },
        accept: Some(accept),
    }
}

impl Server {
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Stop accepting, close every connection and wait for them.
    pub async fn shutdown(mut self) {
        self.handle.shared.shutdown.send_replace(true);
        if let Some(accept) = self.accept.take() {
            let _ = accept.await;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.shared.shutdown.send_replace(true);
    }
}

async fn accept_loop(shared: Arc<Shared>, acceptor: Box<dyn Acceptor>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            accepted = acceptor.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Some(max) = shared.config.max_connections {
                        if tasks.len() >= max {
                            tracing::warn!(peer = %peer, max, "connection limit reached");
                            continue;
                        }
                    }
                    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
                    tasks.spawn(serve_connection(Arc::clone(&shared), id, stream, peer));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {
                    tracing::info!("acceptor closed: {}", e);
                    break;
                }
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            _ = wait_raised(&mut shutdown) => break,
        }
    }

    shared.shutdown.send_replace(true);
    while tasks.join_next().await.is_some() {}
    tracing::debug!("server stopped");
}

async fn serve_connection(shared: Arc<Shared>, id: u64, stream: BoxedStream, peer: String) {
    let agents = shared.factory.agents(&peer);
    let max_len = shared.config.max_message_len;
    let mut conn = Connection::spawn_with_limit(stream, peer.clone(), max_len);
    let mut shutdown = shared.shutdown.subscribe();

    let handshake = AgentHandle::new(agents.handshake);
    handshake.seal_listeners();
    for agent in &agents.agents {
        agent.seal_listeners();
        conn.route(Arc::clone(agent));
    }
    let mut watcher = handshake.inspect(|h| h.subscribe());

    let accepted = match conn.bind(Arc::new(handshake.clone())) {
        Ok(()) => {
            let timeout = Duration::from_millis(shared.config.handshake_timeout_ms);
            let wait = async {
                tokio::select! {
                    biased;
                    outcome = wait_outcome(&mut watcher) => outcome,
                    _ = conn.closed() => None,
                    _ = wait_raised(&mut shutdown) => None,
                }
            };
            match tokio::time::timeout(timeout, wait).await {
                Ok(Some(HandshakeOutcome::Accepted { version, .. })) => {
                    tracing::info!(peer = %peer, version, "peer connected");
                    true
                }
                Ok(Some(other)) => {
                    tracing::debug!(peer = %peer, ?other, "handshake did not accept a version");
                    false
                }
                Ok(None) => false,
                Err(_) => {
                    tracing::warn!(peer = %peer, "handshake timed out");
                    false
                }
            }
        }
        Err(e) => {
            tracing::warn!(peer = %peer, "handshake bind failed: {}", e);
            false
        }
    };

    if accepted {
        let bound = agents
            .agents
            .iter()
            .all(|agent| conn.bind(Arc::clone(agent)).is_ok());
        if bound {
            shared.active().insert(id, agents.chain_sync.clone());
            tokio::select! {
                _ = conn.closed() => {}
                _ = wait_raised(&mut shutdown) => {}
            }
            shared.active().remove(&id);
        }
    }

    conn.close().await;
    handshake.unbind();
    for agent in &agents.agents {
        agent.unbind();
    }
    tracing::info!(peer = %peer, "peer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::handshake::{RefuseReason, VersionTable};
    use crate::handshake::{HandshakeMessage, ProposedVersions};
    use crate::keepalive::{KeepAliveClient, KeepAliveListener, KeepAliveServer};
    use crate::mux::{self, Mode, ProtocolId};
    use crate::transport::Connector;
    use crate::Message;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use crate::session::{Session, SessionConfig};
    use crate::transport::memory::MemoryNetwork;
    use tokio::sync::Notify;

    struct Pong(Arc<Notify>);

    impl KeepAliveListener for Pong {
        fn keep_alive_response(&self, _cookie: u32, _rtt: Duration) {
            self.0.notify_one();
        }
    }

    fn keep_alive_factory(magic: u64) -> impl AgentFactory {
        move |_peer: &str| {
            ServerAgents::new(HandshakeAgent::server(VersionTable::node_to_node(magic)))
                .with_agent(AgentHandle::new(KeepAliveServer::new()))
        }
    }

    fn quick() -> SessionConfig {
        SessionConfig {
            retry_delay: Duration::from_millis(20),
            ..SessionConfig::probe()
        }
    }

    async fn wait_for_count(handle: &ServerHandle, count: usize) {
        for _ in 0..200 {
            if handle.connection_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection count never reached {}", count);
    }

    #[tokio::test]
    async fn test_keep_alive_through_server() {
        let network = MemoryNetwork::new("server-ka");
        let server = serve(network.listen(), ServerConfig::default(), keep_alive_factory(42));

        let session = Session::new(
            network.connector(),
            HandshakeAgent::client(VersionTable::node_to_node(42)),
            quick(),
        );
        let notify = Arc::new(Notify::new());
        let client = AgentHandle::new(KeepAliveClient::new());
        client.with(|c| c.add_listener(Arc::new(Pong(notify.clone())))).unwrap();
        session.add_agent(client.clone()).unwrap();

        session.start().await.unwrap();
        assert_eq!(session.negotiated().map(|(v, _)| v), Some(14));
        wait_for_count(&server.handle(), 1).await;

        client.with(|c| c.ping_with(7));
        tokio::time::timeout(Duration::from_secs(5), notify.notified())
            .await
            .unwrap();

        session.shutdown().await;
        wait_for_count(&server.handle(), 0).await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_magic_mismatch_is_refused() {
        let network = MemoryNetwork::new("server-refuse");
        let server = serve(network.listen(), ServerConfig::default(), keep_alive_factory(2));

        let session = Session::new(
            network.connector(),
            HandshakeAgent::client(VersionTable::node_to_node(1)),
            quick(),
        );
        match session.start().await {
            Err(SessionError::Handshake(RefuseReason::Refused { version, .. })) => {
                assert_eq!(version, 14)
            }
            other => panic!("expected refusal, got {:?}", other.err()),
        }
        assert_eq!(server.handle().connection_count(), 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_clients() {
        let network = MemoryNetwork::new("server-down");
        let server = serve(network.listen(), ServerConfig::default(), keep_alive_factory(9));

        let session = Session::new(
            network.connector(),
            HandshakeAgent::client(VersionTable::node_to_node(9)),
            quick(),
        );
        session.start().await.unwrap();
        server.shutdown().await;

        tokio::time::timeout(Duration::from_secs(5), session.wait_closed())
            .await
            .unwrap();
    }

    #[test]
    fn test_connection_task_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let shared = Arc::new(Shared {
            config: ServerConfig::default(),
            factory: Box::new(keep_alive_factory(1)),
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            shutdown: watch::Sender::new(false),
        });
        let (near, _far) = tokio::io::duplex(64);
        let task = serve_connection(shared, 0, Box::new(near), "peer".into());
        assert_send(&task);
    }

    #[tokio::test]
    async fn test_pipelined_request_after_proposal() {
        let network = MemoryNetwork::new("server-pipelined");
        let server = serve(network.listen(), ServerConfig::default(), keep_alive_factory(5));
        let mut raw = network.connector().connect().await.unwrap();

        let table = VersionTable::node_to_node(5);
        let propose = HandshakeMessage::ProposeVersions(ProposedVersions::from(&table));
        let mut wire = BytesMut::new();
        mux::write_message(
            &mut wire,
            0,
            ProtocolId::HANDSHAKE,
            Mode::Initiator,
            &propose.encode().unwrap(),
        );
        mux::write_message(
            &mut wire,
            0,
            ProtocolId::KEEP_ALIVE,
            Mode::Initiator,
            &[0x82, 0x00, 0x09],
        );
        raw.write_all(&wire).await.unwrap();

        // Header is 8 bytes; read segments until the keep-alive echo shows up.
        let echo = async {
            loop {
                let mut header = [0u8; 8];
                raw.read_exact(&mut header).await.unwrap();
                let len = u16::from_be_bytes([header[6], header[7]]) as usize;
                let mut payload = vec![0u8; len];
                raw.read_exact(&mut payload).await.unwrap();
                let protocol = u16::from_be_bytes([header[4], header[5]]) & 0x7fff;
                if protocol == ProtocolId::KEEP_ALIVE.0 {
                    return payload;
                }
            }
        };
        let payload = tokio::time::timeout(Duration::from_secs(5), echo)
            .await
            .unwrap();
        assert_eq!(payload, vec![0x82, 0x01, 0x09]);

        drop(raw);
        server.shutdown().await;
    }
}

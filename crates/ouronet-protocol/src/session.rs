//! Client session lifecycle.
//!
//! A [`Session`] owns one connector, one handshake agent and any number of
//! mini-protocol agents. `start` connects (with retries), runs the
//! handshake, binds every agent to the connection and hands the connection
//! to a supervisor task. When the connection drops the supervisor unbinds
//! the agents, reports the disconnect and, if reconnection is enabled,
//! resets the agents and goes through connect and handshake again.
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Active
//!       ^              |              |           |
//!       +--------------+--------------+-----------+
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::agent::{Agent, ListenerId, Listeners};
use crate::channel::{AgentHandle, AgentPort};
use crate::connection::{wait_raised, Connection};
use crate::error::{AgentError, SessionError};
use crate::handshake::{wait_outcome, HandshakeAgent, HandshakeOutcome, VersionData};
use crate::mux::DEFAULT_MAX_MESSAGE_LEN;
use crate::transport::Connector;

/// Configuration for connection behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reconnect after the connection drops.
    pub auto_reconnect: bool,
    /// Pause between connection attempts.
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    /// Retries after the first failed attempt; `None` retries forever.
    pub max_retries: Option<u32>,
    /// Limit on a single connect call.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Limit on the handshake once connected.
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
    /// Largest message accepted from the peer.
    pub max_message_len: usize,
    /// Log connection events at info instead of debug.
    pub log_connection_events: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            retry_delay: Duration::from_secs(5),
            max_retries: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            log_connection_events: true,
        }
    }
}

impl SessionConfig {
    /// One-shot use: no reconnection, give up after a few attempts.
    pub fn probe() -> Self {
        Self {
            auto_reconnect: false,
            retry_delay: Duration::from_secs(1),
            max_retries: Some(2),
            ..Self::default()
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Active,
}

/// Observer of connection lifecycle events.
pub trait SessionListener: Send + Sync {
    fn connected(&self, _peer: &str, _version: u64, _data: &VersionData) {}

    fn disconnected(&self, _peer: &str) {}

    fn connect_failed(&self, _attempt: u32, _error: &str) {}
}

macro_rules! lifecycle {
    ($shared:expr, $($arg:tt)+) => {
        if $shared.config.log_connection_events {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

struct Shared {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    handshake: AgentHandle<HandshakeAgent>,
    agents: Mutex<Vec<Arc<dyn AgentPort>>>,
    listeners: Mutex<Listeners<dyn SessionListener>>,
    state: watch::Sender<SessionState>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn agents(&self) -> Vec<Arc<dyn AgentPort>> {
        self.agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Call `f` on every listener, outside the registry lock.
    fn notify(&self, f: impl Fn(&dyn SessionListener)) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot();
        for listener in &listeners {
            f(listener.as_ref());
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `delay` unless shutdown comes first. Returns false on shutdown.
    async fn pause(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.shutting_down(),
            _ = wait_raised(&mut shutdown) => false,
        }
    }

    /// Connect, handshake and bind, retrying per the config.
    async fn establish(&self) -> Result<Connection, SessionError> {
        let mut attempt: u32 = 0;
        loop {
            if self.shutting_down() {
                return Err(SessionError::Shutdown);
            }
            attempt += 1;

            let error = match self.attempt().await {
                Ok(conn) => return Ok(conn),
                Err(SessionError::Handshake(reason)) => {
                    self.set_state(SessionState::Disconnected);
                    return Err(SessionError::Handshake(reason));
                }
                Err(e) => e,
            };

            let message = error.to_string();
            tracing::warn!(
                peer = %self.connector.describe(),
                attempt,
                "connection attempt failed: {}",
                message
            );
            self.notify(|l| l.connect_failed(attempt, &message));
            self.set_state(SessionState::Disconnected);

            if let Some(max) = self.config.max_retries {
                if attempt > max {
                    return Err(SessionError::ConnectFailed {
                        attempts: attempt,
                        last_error: message,
                    });
                }
            }
            if !self.pause(self.config.retry_delay).await {
                return Err(SessionError::Shutdown);
            }
        }
    }

    async fn attempt(&self) -> Result<Connection, SessionError> {
        let peer = self.connector.describe();
        self.set_state(SessionState::Connecting);

        let limit = self.config.connect_timeout;
        let stream = match tokio::time::timeout(limit, self.connector.connect()).await {
            Ok(stream) => stream?,
            Err(_) => return Err(SessionError::ConnectTimeout(limit)),
        };

        self.set_state(SessionState::Handshaking);
        self.handshake.reset();
        let mut conn =
            Connection::spawn_with_limit(stream, peer.clone(), self.config.max_message_len);

        match self.handshake(&conn).await {
            Ok((version, data)) => {
                for agent in self.agents() {
                    if let Err(e) = conn.bind(agent) {
                        conn.close().await;
                        return Err(e.into());
                    }
                }
                self.set_state(SessionState::Active);
                lifecycle!(self, peer = %peer, version, "connected");
                self.notify(|l| l.connected(&peer, version, &data));
                Ok(conn)
            }
            Err(e) => {
                conn.close().await;
                self.handshake.unbind();
                Err(e)
            }
        }
    }

    async fn handshake(&self, conn: &Connection) -> Result<(u64, VersionData), SessionError> {
        let mut watcher = self.handshake.inspect(|h| h.subscribe());
        conn.bind(Arc::new(self.handshake.clone()))?;

        let wait = async {
            tokio::select! {
                biased;
                outcome = wait_outcome(&mut watcher) => outcome,
                _ = conn.closed() => None,
            }
        };

        match tokio::time::timeout(self.config.handshake_timeout, wait).await {
            Ok(Some(HandshakeOutcome::Accepted { version, data })) => Ok((version, data)),
            Ok(Some(HandshakeOutcome::Refused(reason))) => Err(SessionError::Handshake(reason)),
            Ok(Some(HandshakeOutcome::Queried(table))) => Err(SessionError::Queried {
                versions: table.versions(),
            }),
            Ok(None) => Err(SessionError::ClosedDuringHandshake),
            Err(_) => Err(SessionError::HandshakeTimeout(self.config.handshake_timeout)),
        }
    }

    fn detach(&self) {
        self.handshake.unbind();
        for agent in self.agents() {
            agent.unbind();
        }
    }

    fn reset_agents(&self) {
        self.handshake.reset();
        for agent in self.agents() {
            agent.reset();
        }
    }
}

/// A client connection to one node, kept alive across reconnects.
pub struct Session {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        connector: impl Connector + 'static,
        handshake: HandshakeAgent,
        config: SessionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector: Arc::new(connector),
                config,
                handshake: AgentHandle::new(handshake),
                agents: Mutex::new(Vec::new()),
                listeners: Mutex::new(Listeners::new()),
                state: watch::Sender::new(SessionState::Disconnected),
                shutdown: watch::Sender::new(false),
                running: AtomicBool::new(false),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Register an agent to bind on every connection.
    pub fn add_agent<A: Agent>(&self, handle: AgentHandle<A>) -> Result<(), SessionError> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }
        self.shared
            .agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handle));
        Ok(())
    }

    pub fn add_listener(
        &self,
        listener: Arc<dyn SessionListener>,
    ) -> Result<ListenerId, AgentError> {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn handshake(&self) -> &AgentHandle<HandshakeAgent> {
        &self.shared.handshake
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// The negotiated version of the current connection.
    pub fn negotiated(&self) -> Option<(u64, VersionData)> {
        self.shared.handshake.inspect(|h| h.negotiated())
    }

    /// Connect and hand the connection to the supervisor.
    ///
    /// Returns once the handshake has succeeded. Listener registration is
    /// closed from here on.
    pub async fn start(&self) -> Result<(), SessionError> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::AlreadyStarted);
        }

        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seal();
        self.shared.handshake.seal_listeners();
        for agent in self.shared.agents() {
            agent.seal_listeners();
        }
        self.shared.shutdown.send_replace(false);
        self.shared.reset_agents();

        let conn = match self.shared.establish().await {
            Ok(conn) => conn,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let handle = tokio::spawn(supervise(Arc::clone(&self.shared), conn));
        *self.supervisor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Disable reconnection, close the connection and wait for the
    /// supervisor to exit.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.set_state(SessionState::Disconnected);
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// Resolve once the supervisor has stopped on its own.
    ///
    /// With reconnection disabled this is the end of the connection.
    pub async fn wait_closed(&self) {
        let mut state = self.subscribe_state();
        let stopped = |s: &SessionState| {
            *s == SessionState::Disconnected && !self.shared.running.load(Ordering::SeqCst)
        };
        let _ = state.wait_for(stopped).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

async fn supervise(shared: Arc<Shared>, mut conn: Connection) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = conn.closed() => {}
            _ = wait_raised(&mut shutdown) => {}
        }

        conn.close().await;
        shared.detach();
        shared.set_state(SessionState::Disconnected);
        let peer = conn.peer().to_string();
        lifecycle!(shared, peer = %peer, "disconnected");
        shared.notify(|l| l.disconnected(&peer));

        if shared.shutting_down() || !shared.config.auto_reconnect {
            break;
        }
        if !shared.pause(shared.config.retry_delay).await {
            break;
        }

        shared.reset_agents();
        match shared.establish().await {
            Ok(next) => conn = next,
            Err(e) => {
                tracing::error!(peer = %peer, "giving up on reconnection: {}", e);
                break;
            }
        }
    }
    shared.running.store(false, Ordering::SeqCst);
    shared.set_state(SessionState::Disconnected);
}

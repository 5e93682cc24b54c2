//! Binding agents to a live connection.
//!
//! An [`AgentHandle`] owns an agent behind a mutex together with the
//! outbound channel of the connection it is currently bound to. Every send
//! goes through [`AgentHandle`] so the agency check, the transition and the
//! enqueue happen under one lock. Listener calls the agent queued are made
//! after that lock is released.
//!
//! The connection side only sees [`AgentPort`], an object-safe view used by
//! the [`Router`] to deliver inbound messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::agent::{Agent, Message, MessageOf, Notifications, Protocol, Role};
use crate::error::{AgentError, Result};
use crate::mux::{Inbound, Mode, ProtocolId};

/// An encoded message queued for the connection writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub protocol: ProtocolId,
    pub mode: Mode,
    pub payload: Bytes,
}

/// Sending half of a connection, stamped with the sender's mode.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    mode: Mode,
}

impl ChannelHandle {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>, mode: Mode) -> Self {
        Self { tx, mode }
    }

    /// Queue `payload` for the writer.
    pub fn send(&self, protocol: ProtocolId, payload: Vec<u8>) -> Result<()> {
        self.tx
            .send(Outbound {
                protocol,
                mode: self.mode,
                payload: Bytes::from(payload),
            })
            .map_err(|_| AgentError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An agent and the channel it is bound to.
pub struct Bound<A: Agent> {
    agent: A,
    channel: Option<ChannelHandle>,
}

impl<A: Agent> Bound<A> {
    /// Send one message if the agent holds agency and has one ready.
    ///
    /// Returns whether a message was sent. The transition and the agent's
    /// bookkeeping are applied only after the message has been handed to
    /// the channel.
    fn send_next(&mut self) -> Result<bool> {
        let Some(channel) = &self.channel else {
            return Ok(false);
        };
        if !self.agent.has_agency() {
            return Ok(false);
        }
        let Some(message) = self.agent.produce_next() else {
            return Ok(false);
        };

        let state = self.agent.state();
        let Some(next) = A::Protocol::transition(state, &message) else {
            tracing::error!(
                protocol = A::Protocol::NAME,
                ?state,
                message = message.name(),
                "agent produced a message with no transition, dropping"
            );
            return Ok(false);
        };

        channel.send(self.agent.protocol_id(), message.encode()?)?;
        tracing::trace!(protocol = A::Protocol::NAME, message = message.name(), "sent");
        self.agent.set_state(next);
        self.agent.on_sent(&message);
        Ok(true)
    }

    /// Send until the agent runs out of messages or loses agency.
    fn pump(&mut self) {
        loop {
            match self.send_next() {
                Ok(true) => continue,
                Ok(false) => return,
                Err(e) => {
                    tracing::warn!(protocol = A::Protocol::NAME, "send failed: {}", e);
                    return;
                }
            }
        }
    }
}

/// Shared handle to an agent.
///
/// Cloning shares the agent. Application code reaches the agent through
/// [`AgentHandle::with`], which sends whatever the closure made ready.
pub struct AgentHandle<A: Agent> {
    inner: Arc<Mutex<Bound<A>>>,
}

impl<A: Agent> Clone for AgentHandle<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Agent> AgentHandle<A> {
    pub fn new(agent: A) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Bound {
                agent,
                channel: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Bound<A>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the lock, then make the listener calls it queued.
    fn locked<R>(&self, f: impl FnOnce(&mut Bound<A>) -> R) -> R {
        let (result, pending): (R, Notifications) = {
            let mut bound = self.lock();
            let result = f(&mut bound);
            (result, bound.agent.take_notifications())
        };
        pending.run();
        result
    }

    /// Run `f` on the agent, then send anything it made ready.
    pub fn with<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        self.locked(|bound| {
            let result = f(&mut bound.agent);
            bound.pump();
            result
        })
    }

    /// Read the agent without sending.
    pub fn inspect<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        f(&self.lock().agent)
    }

    pub fn is_bound(&self) -> bool {
        self.lock().channel.is_some()
    }

    /// Send at most one message. Returns whether one was sent.
    ///
    /// A handle that is not bound, or whose agent lacks agency, sends
    /// nothing.
    pub fn send_next(&self) -> Result<bool> {
        self.locked(|bound| bound.send_next())
    }

    /// Deliver an already-decoded message, then send any replies.
    pub fn receive(&self, message: MessageOf<A>) -> Result<()> {
        self.locked(|bound| {
            bound.agent.consume(message)?;
            bound.pump();
            Ok(())
        })
    }
}

/// Object-safe view of a bound agent used by the connection.
pub trait AgentPort: Send + Sync {
    fn protocol_id(&self) -> ProtocolId;

    fn role(&self) -> Role;

    fn name(&self) -> &'static str;

    /// Decode and consume one inbound message, then send any replies.
    ///
    /// Decode failures and protocol violations are logged and dropped.
    fn deliver(&self, payload: &[u8]);

    /// Attach to a connection and send whatever is ready.
    fn bind(&self, channel: ChannelHandle) -> Result<()>;

    fn unbind(&self);

    fn reset(&self);

    fn seal_listeners(&self);

    fn is_done(&self) -> bool;
}

impl<A: Agent> AgentPort for AgentHandle<A> {
    fn protocol_id(&self) -> ProtocolId {
        self.lock().agent.protocol_id()
    }

    fn role(&self) -> Role {
        self.lock().agent.role()
    }

    fn name(&self) -> &'static str {
        A::Protocol::NAME
    }

    fn deliver(&self, payload: &[u8]) {
        let message = match MessageOf::<A>::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(protocol = A::Protocol::NAME, "dropping undecodable message: {}", e);
                return;
            }
        };
        tracing::trace!(protocol = A::Protocol::NAME, message = message.name(), "received");

        self.locked(|bound| {
            if let Err(violation) = bound.agent.consume(message) {
                tracing::warn!("{}", violation);
                return;
            }
            bound.pump();
        });
    }

    fn bind(&self, channel: ChannelHandle) -> Result<()> {
        self.locked(|bound| {
            if bound.channel.is_some() {
                return Err(AgentError::AlreadyBound(A::Protocol::NAME));
            }
            bound.channel = Some(channel);
            bound.pump();
            Ok(())
        })
    }

    fn unbind(&self) {
        self.lock().channel = None;
    }

    fn reset(&self) {
        self.lock().agent.reset();
    }

    fn seal_listeners(&self) {
        self.lock().agent.seal_listeners();
    }

    fn is_done(&self) -> bool {
        self.lock().agent.is_done()
    }
}

fn same_port(a: &Arc<dyn AgentPort>, b: &Arc<dyn AgentPort>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Routes reassembled messages to the agent bound for their channel.
///
/// A client agent receives responder segments and a server agent receives
/// initiator segments, so both sides of one protocol can share a
/// connection.
#[derive(Default)]
pub struct Router {
    routes: RwLock<HashMap<(ProtocolId, Mode), Arc<dyn AgentPort>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, port: Arc<dyn AgentPort>) {
        let key = (port.protocol_id(), port.role().inbound_mode());
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = routes.insert(key, Arc::clone(&port)) {
            if !same_port(&previous, &port) {
                tracing::warn!(protocol = %key.0, "replaced agent on channel");
            }
        }
    }

    pub fn contains(&self, protocol: ProtocolId, mode: Mode) -> bool {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(protocol, mode))
    }

    pub fn clear(&self) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Hand a message to its agent; unknown channels are logged and dropped.
    pub fn dispatch(&self, inbound: &Inbound) {
        let port = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(inbound.protocol, inbound.mode))
            .cloned();
        match port {
            Some(port) => port.deliver(&inbound.payload),
            None => tracing::debug!(
                protocol = %inbound.protocol,
                mode = ?inbound.mode,
                "no agent for channel, dropping {} bytes",
                inbound.payload.len()
            ),
        }
    }
}

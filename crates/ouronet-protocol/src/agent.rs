//! The agent contract shared by every mini-protocol.
//!
//! A [`Protocol`] is a pure state machine: which side holds agency in each
//! state, and which message moves it to which state. An [`Agent`] is one
//! side of that machine with its local bookkeeping. Agents never touch the
//! network; a binding (see [`crate::channel`]) asks them for the next
//! message and feeds them inbound ones.
//!
//! ## Agency
//!
//! In every state exactly one of client, server or nobody may send. The
//! sender applies the transition for messages it produces; the receiver
//! applies it for messages it consumes. A message that arrives while the
//! local side holds agency, or that has no transition from the current
//! state, is a [`ProtocolViolation`] and changes nothing.
//!
//! ## Listeners
//!
//! Agents queue listener calls instead of making them. The binding runs
//! the queue once it has released the agent, so a listener may drive the
//! agent it observes.

use std::fmt;
use std::sync::Arc;

use ouronet_core::{cbor, CborValue, CodecError};

use crate::error::{AgentError, ProtocolViolation};
use crate::mux::{Mode, ProtocolId};

/// Who may send in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agency {
    Client,
    Server,
    Nobody,
}

/// Which side of a mini-protocol an agent plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Whether this role may send under `agency`.
    pub fn holds(self, agency: Agency) -> bool {
        matches!(
            (self, agency),
            (Role::Client, Agency::Client) | (Role::Server, Agency::Server)
        )
    }

    /// Mode bit this role stamps on outbound segments.
    pub fn outbound_mode(self) -> Mode {
        match self {
            Role::Client => Mode::Initiator,
            Role::Server => Mode::Responder,
        }
    }

    /// Mode bit of the segments this role receives.
    pub fn inbound_mode(self) -> Mode {
        match self {
            Role::Client => Mode::Responder,
            Role::Server => Mode::Initiator,
        }
    }
}

/// A mini-protocol message with its CBOR wire form.
pub trait Message: Clone + fmt::Debug + Send + Sized + 'static {
    /// Short name used in logs and violations.
    fn name(&self) -> &'static str;

    fn to_cbor(&self) -> CborValue;

    fn from_cbor(value: CborValue) -> Result<Self, CodecError>;

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        cbor::encode(&self.to_cbor())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::from_cbor(cbor::decode(bytes)?)
    }
}

/// A mini-protocol state machine.
pub trait Protocol: Send + 'static {
    type State: Copy + Eq + fmt::Debug + Send + 'static;
    type Message: Message;

    const NAME: &'static str;
    const INITIAL: Self::State;

    /// Who may send in `state`.
    fn agency(state: Self::State) -> Agency;

    /// The state `message` leads to from `state`, if it is allowed there.
    fn transition(state: Self::State, message: &Self::Message) -> Option<Self::State>;
}

/// State type of an agent's protocol.
pub type StateOf<A> = <<A as Agent>::Protocol as Protocol>::State;

/// Message type of an agent's protocol.
pub type MessageOf<A> = <<A as Agent>::Protocol as Protocol>::Message;

/// One side of a mini-protocol.
pub trait Agent: Send + 'static {
    type Protocol: Protocol;

    /// Protocol number this agent runs on.
    fn protocol_id(&self) -> ProtocolId;

    fn role(&self) -> Role;

    fn state(&self) -> StateOf<Self>;

    /// Apply a transition. Only the binding and [`Agent::consume`] call this.
    fn set_state(&mut self, state: StateOf<Self>);

    /// The next message to send, if the agent has one.
    ///
    /// Called only while the agent holds agency. Nothing is committed here:
    /// a message whose send fails is asked for again.
    fn produce_next(&self) -> Option<MessageOf<Self>>;

    /// The message from [`Agent::produce_next`] was handed to the
    /// connection and the state has moved. Commit local bookkeeping
    /// (dequeueing, recording what was requested).
    fn on_sent(&mut self, _message: &MessageOf<Self>) {}

    /// React to an accepted inbound message. The state has already moved.
    fn on_message(&mut self, message: MessageOf<Self>);

    /// Return to the initial state and drop per-connection bookkeeping.
    fn reset(&mut self);

    /// Stop accepting listener registrations.
    fn seal_listeners(&mut self) {}

    /// Listener calls queued since the last take.
    fn take_notifications(&mut self) -> Notifications {
        Notifications::default()
    }

    fn has_agency(&self) -> bool {
        self.role().holds(Self::Protocol::agency(self.state()))
    }

    fn is_done(&self) -> bool {
        Self::Protocol::agency(self.state()) == Agency::Nobody
    }

    /// Validate and apply an inbound message.
    fn consume(&mut self, message: MessageOf<Self>) -> Result<(), ProtocolViolation> {
        let state = self.state();
        if self.is_done() {
            return Err(ProtocolViolation::Terminated {
                protocol: Self::Protocol::NAME,
                message: message.name(),
            });
        }
        if self.has_agency() {
            return Err(ProtocolViolation::LocalAgency {
                protocol: Self::Protocol::NAME,
                state: format!("{:?}", state),
                message: message.name(),
            });
        }
        let next = Self::Protocol::transition(state, &message).ok_or_else(|| {
            ProtocolViolation::InvalidTransition {
                protocol: Self::Protocol::NAME,
                state: format!("{:?}", state),
                message: message.name(),
            }
        })?;

        self.set_state(next);
        self.on_message(message);
        Ok(())
    }

    /// Take the next message as if it had been sent: apply its transition
    /// and commit it. Drives an agent without a connection.
    fn take_next(&mut self) -> Option<MessageOf<Self>> {
        if !self.has_agency() {
            return None;
        }
        let message = self.produce_next()?;
        let next = Self::Protocol::transition(self.state(), &message)?;
        self.set_state(next);
        self.on_sent(&message);
        Some(message)
    }
}

/// Listener calls queued by an agent, run after its lock is released.
#[derive(Default)]
pub struct Notifications(Vec<Box<dyn FnOnce() + Send>>);

impl Notifications {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn append(&mut self, mut other: Notifications) {
        self.0.append(&mut other.0);
    }

    /// Make the queued calls in order.
    pub fn run(self) {
        for call in self.0 {
            call();
        }
    }
}

/// Handle returned by [`Listeners::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registry of observers for one agent.
///
/// Registration is closed once the owning session starts; removal is
/// allowed at any time.
pub struct Listeners<L: ?Sized> {
    entries: Vec<(ListenerId, Arc<L>)>,
    next_id: u64,
    sealed: bool,
    pending: Notifications,
}

impl<L: ?Sized> Listeners<L> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            sealed: false,
            pending: Notifications::default(),
        }
    }

    pub fn add(&mut self, listener: Arc<L>) -> Result<ListenerId, AgentError> {
        if self.sealed {
            return Err(AgentError::ListenersSealed);
        }
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        Ok(id)
    }

    /// Remove a listener; returns whether it was registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The registered listeners in registration order.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    /// Queue a call of `f` on every listener in registration order.
    pub fn notify(&mut self, f: impl Fn(&L) + Send + Sync + 'static)
    where
        L: Send + Sync + 'static,
    {
        if self.entries.is_empty() {
            return;
        }
        let f = Arc::new(f);
        let mut queued = Notifications::default();
        for (_, listener) in &self.entries {
            let listener = Arc::clone(listener);
            let f = Arc::clone(&f);
            queued.0.push(Box::new(move || f(listener.as_ref())));
        }
        self.pending.append(queued);
    }

    /// Calls queued by [`Listeners::notify`] and not yet run.
    pub fn take_pending(&mut self) -> Notifications {
        std::mem::take(&mut self.pending)
    }
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self::new()
    }
}

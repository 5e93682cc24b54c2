//! Keep-alive mini-protocol.
//!
//! ```text
//! MsgKeepAlive          [0, cookie]
//! MsgKeepAliveResponse  [1, cookie]
//! MsgDone               [2]
//! ```
//!
//! The client pings with a cookie; the server echoes it unchanged.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ouronet_core::cbor::{as_u64, expect_fields, split_message, uint};
use ouronet_core::{CborValue, CodecError};

use crate::agent::{
    Agency, Agent, ListenerId, Listeners, Message, Notifications, Protocol, Role,
};
use crate::error::AgentError;
use crate::mux::ProtocolId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveMessage {
    KeepAlive(u32),
    KeepAliveResponse(u32),
    Done,
}

fn cookie(value: &CborValue) -> Result<u32, CodecError> {
    let raw = as_u64(value, "keep-alive cookie")?;
    u32::try_from(raw).map_err(|_| CodecError::structure("keep-alive cookie", "out of range"))
}

impl Message for KeepAliveMessage {
    fn name(&self) -> &'static str {
        match self {
            KeepAliveMessage::KeepAlive(_) => "KeepAlive",
            KeepAliveMessage::KeepAliveResponse(_) => "KeepAliveResponse",
            KeepAliveMessage::Done => "Done",
        }
    }

    fn to_cbor(&self) -> CborValue {
        match self {
            KeepAliveMessage::KeepAlive(c) => CborValue::Array(vec![uint(0), uint(*c as u64)]),
            KeepAliveMessage::KeepAliveResponse(c) => {
                CborValue::Array(vec![uint(1), uint(*c as u64)])
            }
            KeepAliveMessage::Done => CborValue::Array(vec![uint(2)]),
        }
    }

    fn from_cbor(value: CborValue) -> Result<Self, CodecError> {
        let (tag, fields) = split_message(value, KeepAlive::NAME)?;
        match tag {
            0 => {
                expect_fields(&fields, 1, "MsgKeepAlive")?;
                Ok(KeepAliveMessage::KeepAlive(cookie(&fields[0])?))
            }
            1 => {
                expect_fields(&fields, 1, "MsgKeepAliveResponse")?;
                Ok(KeepAliveMessage::KeepAliveResponse(cookie(&fields[0])?))
            }
            2 => {
                expect_fields(&fields, 0, "MsgDone")?;
                Ok(KeepAliveMessage::Done)
            }
            tag => Err(CodecError::UnknownTag {
                protocol: KeepAlive::NAME,
                tag,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveState {
    Client,
    Server,
    Done,
}

pub struct KeepAlive;

impl Protocol for KeepAlive {
    type State = KeepAliveState;
    type Message = KeepAliveMessage;

    const NAME: &'static str = "keep-alive";
    const INITIAL: KeepAliveState = KeepAliveState::Client;

    fn agency(state: KeepAliveState) -> Agency {
        match state {
            KeepAliveState::Client => Agency::Client,
            KeepAliveState::Server => Agency::Server,
            KeepAliveState::Done => Agency::Nobody,
        }
    }

    fn transition(state: KeepAliveState, message: &KeepAliveMessage) -> Option<KeepAliveState> {
        match (state, message) {
            (KeepAliveState::Client, KeepAliveMessage::KeepAlive(_)) => {
                Some(KeepAliveState::Server)
            }
            (KeepAliveState::Client, KeepAliveMessage::Done) => Some(KeepAliveState::Done),
            (KeepAliveState::Server, KeepAliveMessage::KeepAliveResponse(_)) => {
                Some(KeepAliveState::Client)
            }
            _ => None,
        }
    }
}

/// Observer of keep-alive round trips.
pub trait KeepAliveListener: Send + Sync {
    fn keep_alive_response(&self, _cookie: u32, _rtt: Duration) {}
}

/// Client side: sends pings and measures round-trip time.
pub struct KeepAliveClient {
    state: KeepAliveState,
    queued: VecDeque<u32>,
    in_flight: Option<(u32, Instant)>,
    done_requested: bool,
    last_rtt: Option<Duration>,
    listeners: Listeners<dyn KeepAliveListener>,
}

impl KeepAliveClient {
    pub fn new() -> Self {
        Self {
            state: KeepAlive::INITIAL,
            queued: VecDeque::new(),
            in_flight: None,
            done_requested: false,
            last_rtt: None,
            listeners: Listeners::new(),
        }
    }

    /// Queue a ping with a random cookie; returns the cookie.
    pub fn ping(&mut self) -> u32 {
        let cookie = u32::from(rand::random::<u16>());
        self.ping_with(cookie);
        cookie
    }

    pub fn ping_with(&mut self, cookie: u32) {
        self.queued.push_back(cookie);
    }

    /// Terminate the protocol once outstanding pings are answered.
    pub fn request_done(&mut self) {
        self.done_requested = true;
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Whether a ping is queued or awaiting its response.
    pub fn is_waiting(&self) -> bool {
        self.in_flight.is_some() || !self.queued.is_empty()
    }

    pub fn add_listener(
        &mut self,
        listener: Arc<dyn KeepAliveListener>,
    ) -> Result<ListenerId, AgentError> {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

impl Default for KeepAliveClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for KeepAliveClient {
    type Protocol = KeepAlive;

    fn protocol_id(&self) -> ProtocolId {
        ProtocolId::KEEP_ALIVE
    }

    fn role(&self) -> Role {
        Role::Client
    }

    fn state(&self) -> KeepAliveState {
        self.state
    }

    fn set_state(&mut self, state: KeepAliveState) {
        self.state = state;
    }

    fn produce_next(&self) -> Option<KeepAliveMessage> {
        if let Some(cookie) = self.queued.front() {
            return Some(KeepAliveMessage::KeepAlive(*cookie));
        }
        self.done_requested.then_some(KeepAliveMessage::Done)
    }

    fn on_sent(&mut self, message: &KeepAliveMessage) {
        if let KeepAliveMessage::KeepAlive(cookie) = message {
            self.queued.pop_front();
            self.in_flight = Some((*cookie, Instant::now()));
        }
    }

    fn on_message(&mut self, message: KeepAliveMessage) {
        let KeepAliveMessage::KeepAliveResponse(cookie) = message else {
            return;
        };
        match self.in_flight.take() {
            Some((sent, at)) if sent == cookie => {
                let rtt = at.elapsed();
                self.last_rtt = Some(rtt);
                tracing::trace!(cookie, ?rtt, "keep-alive response");
                self.listeners
                    .notify(move |l| l.keep_alive_response(cookie, rtt));
            }
            other => {
                let expected = other.map(|(c, _)| c);
                tracing::warn!(cookie, ?expected, "keep-alive cookie mismatch");
            }
        }
    }

    fn reset(&mut self) {
        self.state = KeepAlive::INITIAL;
        self.queued.clear();
        self.in_flight = None;
        self.done_requested = false;
    }

    fn seal_listeners(&mut self) {
        self.listeners.seal();
    }

    fn take_notifications(&mut self) -> Notifications {
        self.listeners.take_pending()
    }
}

/// Server side: echoes every cookie.
pub struct KeepAliveServer {
    state: KeepAliveState,
    replies: VecDeque<KeepAliveMessage>,
}

impl KeepAliveServer {
    pub fn new() -> Self {
        Self {
            state: KeepAlive::INITIAL,
            replies: VecDeque::new(),
        }
    }
}

impl Default for KeepAliveServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for KeepAliveServer {
    type Protocol = KeepAlive;

    fn protocol_id(&self) -> ProtocolId {
        ProtocolId::KEEP_ALIVE
    }

    fn role(&self) -> Role {
        Role::Server
    }

    fn state(&self) -> KeepAliveState {
        self.state
    }

    fn set_state(&mut self, state: KeepAliveState) {
        self.state = state;
    }

    fn produce_next(&self) -> Option<KeepAliveMessage> {
        self.replies.front().cloned()
    }

    fn on_sent(&mut self, _message: &KeepAliveMessage) {
        self.replies.pop_front();
    }

    fn on_message(&mut self, message: KeepAliveMessage) {
        if let KeepAliveMessage::KeepAlive(cookie) = message {
            self.replies
                .push_back(KeepAliveMessage::KeepAliveResponse(cookie));
        }
    }

    fn reset(&mut self) {
        self.state = KeepAlive::INITIAL;
        self.replies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolViolation;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<u32>>);

    impl KeepAliveListener for Recorder {
        fn keep_alive_response(&self, cookie: u32, _rtt: Duration) {
            self.0.lock().unwrap().push(cookie);
        }
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(
            KeepAliveMessage::KeepAlive(56701).encode().unwrap(),
            vec![0x82, 0x00, 0x19, 0xdd, 0x7d]
        );
        assert_eq!(KeepAliveMessage::Done.encode().unwrap(), vec![0x81, 0x02]);
        assert_eq!(
            KeepAliveMessage::decode(&[0x82, 0x01, 0x1a, 0x00, 0x01, 0x86, 0x9f]).unwrap(),
            KeepAliveMessage::KeepAliveResponse(99999)
        );
    }

    #[test]
    fn test_server_echoes_cookie() {
        let mut server = KeepAliveServer::new();
        server.consume(KeepAliveMessage::KeepAlive(56701)).unwrap();
        assert!(server.has_agency());
        assert_eq!(
            server.take_next(),
            Some(KeepAliveMessage::KeepAliveResponse(56701))
        );
        assert_eq!(server.produce_next(), None);

        let mut server = KeepAliveServer::new();
        server.consume(KeepAliveMessage::KeepAlive(99999)).unwrap();
        assert_eq!(
            server.produce_next(),
            Some(KeepAliveMessage::KeepAliveResponse(99999))
        );
    }

    #[test]
    fn test_client_reports_round_trip() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut client = KeepAliveClient::new();
        client.add_listener(recorder.clone()).unwrap();

        client.ping_with(42);
        assert!(client.is_waiting());
        assert_eq!(client.take_next(), Some(KeepAliveMessage::KeepAlive(42)));
        assert!(client.is_waiting());

        client
            .consume(KeepAliveMessage::KeepAliveResponse(42))
            .unwrap();
        assert!(recorder.0.lock().unwrap().is_empty());
        client.take_notifications().run();
        assert_eq!(*recorder.0.lock().unwrap(), vec![42]);
        assert!(!client.is_waiting());
        assert!(client.last_rtt().is_some());
        assert!(client.has_agency());
    }

    #[test]
    fn test_unexpected_message_is_noop() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut client = KeepAliveClient::new();
        client.add_listener(recorder.clone()).unwrap();

        // Client holds agency in its initial state.
        let err = client
            .consume(KeepAliveMessage::KeepAliveResponse(1))
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::LocalAgency { .. }));
        assert_eq!(client.state(), KeepAliveState::Client);
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_done_terminates() {
        let mut client = KeepAliveClient::new();
        client.request_done();
        assert_eq!(client.take_next(), Some(KeepAliveMessage::Done));
        assert!(client.is_done());
        assert!(!client.has_agency());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut client = KeepAliveClient::new();
        client.ping_with(5);
        client.take_next();

        let snapshot = |c: &KeepAliveClient| (c.state(), c.queued.clone(), c.in_flight.is_none());
        client.reset();
        let once = snapshot(&client);
        client.reset();
        let twice = snapshot(&client);
        assert_eq!(once, twice);
        assert_eq!(once.0, KeepAliveState::Client);
    }

    #[test]
    fn test_peek_keeps_ping_queued() {
        let mut client = KeepAliveClient::new();
        client.ping_with(7);

        assert_eq!(client.produce_next(), Some(KeepAliveMessage::KeepAlive(7)));
        assert_eq!(client.produce_next(), Some(KeepAliveMessage::KeepAlive(7)));
        assert!(client.in_flight.is_none());

        assert_eq!(client.take_next(), Some(KeepAliveMessage::KeepAlive(7)));
        assert_eq!(client.in_flight.map(|(c, _)| c), Some(7));
        assert!(client.queued.is_empty());
    }
}

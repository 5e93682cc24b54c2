//! Block-fetch mini-protocol.
//!
//! ```text
//! MsgRequestRange  [0, from, to]
//! MsgClientDone    [1]
//! MsgStartBatch    [2]
//! MsgNoBlocks      [3]
//! MsgBlock         [4, #6.24(bytes)]
//! MsgBatchDone     [5]
//! ```
//!
//! The client asks for an inclusive range of points; the server streams
//! the bodies between `StartBatch` and `BatchDone`, or answers `NoBlocks`
//! when it cannot serve the whole range.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use ouronet_chainstate::{ChainState, ChainStateError};
use ouronet_core::cbor::{as_wrapped, expect_fields, split_message, uint, wrap_encoded};
use ouronet_core::{CborValue, CodecError, Point};

use crate::agent::{
    Agency, Agent, ListenerId, Listeners, Message, Notifications, Protocol, Role,
};
use crate::error::AgentError;
use crate::mux::ProtocolId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockFetchMessage {
    RequestRange { from: Point, to: Point },
    ClientDone,
    StartBatch,
    NoBlocks,
    Block(Bytes),
    BatchDone,
}

impl Message for BlockFetchMessage {
    fn name(&self) -> &'static str {
        match self {
            BlockFetchMessage::RequestRange { .. } => "RequestRange",
            BlockFetchMessage::ClientDone => "ClientDone",
            BlockFetchMessage::StartBatch => "StartBatch",
            BlockFetchMessage::NoBlocks => "NoBlocks",
            BlockFetchMessage::Block(_) => "Block",
            BlockFetchMessage::BatchDone => "BatchDone",
        }
    }

    fn to_cbor(&self) -> CborValue {
        CborValue::Array(match self {
            BlockFetchMessage::RequestRange { from, to } => {
                vec![uint(0), from.to_cbor(), to.to_cbor()]
            }
            BlockFetchMessage::ClientDone => vec![uint(1)],
            BlockFetchMessage::StartBatch => vec![uint(2)],
            BlockFetchMessage::NoBlocks => vec![uint(3)],
            BlockFetchMessage::Block(body) => vec![uint(4), wrap_encoded(body)],
            BlockFetchMessage::BatchDone => vec![uint(5)],
        })
    }

    fn from_cbor(value: CborValue) -> Result<Self, CodecError> {
        let (tag, mut fields) = split_message(value, BlockFetch::NAME)?;
        match tag {
            0 => {
                expect_fields(&fields, 2, "MsgRequestRange")?;
                let to = Point::from_cbor(fields.remove(1))?;
                let from = Point::from_cbor(fields.remove(0))?;
                Ok(BlockFetchMessage::RequestRange { from, to })
            }
            4 => {
                expect_fields(&fields, 1, "MsgBlock")?;
                let body = as_wrapped(fields.remove(0), "MsgBlock")?;
                Ok(BlockFetchMessage::Block(Bytes::from(body)))
            }
            1 | 2 | 3 | 5 => {
                expect_fields(&fields, 0, "block-fetch message")?;
                Ok(match tag {
                    1 => BlockFetchMessage::ClientDone,
                    2 => BlockFetchMessage::StartBatch,
                    3 => BlockFetchMessage::NoBlocks,
                    _ => BlockFetchMessage::BatchDone,
                })
            }
            tag => Err(CodecError::UnknownTag {
                protocol: BlockFetch::NAME,
                tag,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFetchState {
    Idle,
    Busy,
    Streaming,
    Done,
}

pub struct BlockFetch;

impl Protocol for BlockFetch {
    type State = BlockFetchState;
    type Message = BlockFetchMessage;

    const NAME: &'static str = "block-fetch";
    const INITIAL: BlockFetchState = BlockFetchState::Idle;

    fn agency(state: BlockFetchState) -> Agency {
        match state {
            BlockFetchState::Idle => Agency::Client,
            BlockFetchState::Busy | BlockFetchState::Streaming => Agency::Server,
            BlockFetchState::Done => Agency::Nobody,
        }
    }

    fn transition(state: BlockFetchState, message: &BlockFetchMessage) -> Option<BlockFetchState> {
        use BlockFetchMessage as M;
        use BlockFetchState as S;
        match (state, message) {
            (S::Idle, M::RequestRange { .. }) => Some(S::Busy),
            (S::Idle, M::ClientDone) => Some(S::Done),
            (S::Busy, M::StartBatch) => Some(S::Streaming),
            (S::Busy, M::NoBlocks) => Some(S::Idle),
            (S::Streaming, M::Block(_)) => Some(S::Streaming),
            (S::Streaming, M::BatchDone) => Some(S::Idle),
            _ => None,
        }
    }
}

/// Observer of fetched blocks.
pub trait BlockFetchListener: Send + Sync {
    fn batch_started(&self, _from: &Point, _to: &Point) {}

    fn block_received(&self, _body: &Bytes) {}

    fn batch_done(&self, _from: &Point, _to: &Point) {}

    fn no_blocks(&self, _from: &Point, _to: &Point) {}
}

/// Client side: requests ranges one at a time.
pub struct BlockFetchClient {
    state: BlockFetchState,
    queued: VecDeque<(Point, Point)>,
    current: Option<(Point, Point)>,
    done_requested: bool,
    listeners: Listeners<dyn BlockFetchListener>,
}

impl BlockFetchClient {
    pub fn new() -> Self {
        Self {
            state: BlockFetch::INITIAL,
            queued: VecDeque::new(),
            current: None,
            done_requested: false,
            listeners: Listeners::new(),
        }
    }

    /// Queue a request for the inclusive range `from..=to`.
    pub fn fetch(&mut self, from: Point, to: Point) {
        self.queued.push_back((from, to));
    }

    /// Terminate once queued ranges are served.
    pub fn request_done(&mut self) {
        self.done_requested = true;
    }

    /// The range being served, if any.
    pub fn in_flight(&self) -> Option<(Point, Point)> {
        self.current
    }

    pub fn add_listener(
        &mut self,
        listener: Arc<dyn BlockFetchListener>,
    ) -> Result<ListenerId, AgentError> {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

impl Default for BlockFetchClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for BlockFetchClient {
    type Protocol = BlockFetch;

    fn protocol_id(&self) -> ProtocolId {
        ProtocolId::BLOCK_FETCH
    }

    fn role(&self) -> Role {
        Role::Client
    }

    fn state(&self) -> BlockFetchState {
        self.state
    }

    fn set_state(&mut self, state: BlockFetchState) {
        self.state = state;
    }

    fn produce_next(&self) -> Option<BlockFetchMessage> {
        if let Some((from, to)) = self.queued.front().copied() {
            return Some(BlockFetchMessage::RequestRange { from, to });
        }
        self.done_requested.then_some(BlockFetchMessage::ClientDone)
    }

    fn on_sent(&mut self, message: &BlockFetchMessage) {
        if let BlockFetchMessage::RequestRange { .. } = message {
            self.current = self.queued.pop_front();
        }
    }

    fn on_message(&mut self, message: BlockFetchMessage) {
        let Some((from, to)) = self.current else {
            return;
        };
        match message {
            BlockFetchMessage::StartBatch => self
                .listeners
                .notify(move |l| l.batch_started(&from, &to)),
            BlockFetchMessage::Block(body) => self
                .listeners
                .notify(move |l| l.block_received(&body)),
            BlockFetchMessage::BatchDone => {
                self.current = None;
                self.listeners.notify(move |l| l.batch_done(&from, &to));
            }
            BlockFetchMessage::NoBlocks => {
                self.current = None;
                tracing::debug!(from = %from, to = %to, "peer has no blocks for range");
                self.listeners.notify(move |l| l.no_blocks(&from, &to));
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.state = BlockFetch::INITIAL;
        // An interrupted range is requested again on the next connection.
        if let Some(range) = self.current.take() {
            self.queued.push_front(range);
        }
        self.done_requested = false;
    }

    fn seal_listeners(&mut self) {
        self.listeners.seal();
    }

    fn take_notifications(&mut self) -> Notifications {
        self.listeners.take_pending()
    }
}

/// Server side: streams block bodies from a [`ChainState`].
pub struct BlockFetchServer {
    state: BlockFetchState,
    chain: Arc<dyn ChainState>,
    max_batch: usize,
    pending: VecDeque<BlockFetchMessage>,
}

impl BlockFetchServer {
    pub const DEFAULT_MAX_BATCH: usize = 1000;

    pub fn new(chain: Arc<dyn ChainState>) -> Self {
        Self {
            state: BlockFetch::INITIAL,
            chain,
            max_batch: Self::DEFAULT_MAX_BATCH,
            pending: VecDeque::new(),
        }
    }

    /// Refuse ranges longer than `max_batch` blocks.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Bodies from `from` through `to`, or `None` if the range can't be served.
    fn collect_range(
        &self,
        from: &Point,
        to: &Point,
    ) -> Result<Option<Vec<Bytes>>, ChainStateError> {
        if from.slot > to.slot || !self.chain.has_point(from)? || !self.chain.has_point(to)? {
            return Ok(None);
        }

        let mut bodies = Vec::new();
        let mut cursor = *from;
        loop {
            let Some(hash) = cursor.hash else {
                return Ok(None);
            };
            let Some(body) = self.chain.get_block(&hash)? else {
                return Ok(None);
            };
            bodies.push(body);
            if cursor == *to {
                return Ok(Some(bodies));
            }
            if bodies.len() >= self.max_batch {
                tracing::debug!(max = self.max_batch, "range exceeds batch limit");
                return Ok(None);
            }
            match self.chain.find_next_block(&cursor)? {
                Some(next) if next.slot <= to.slot => cursor = next,
                _ => return Ok(None),
            }
        }
    }
}

impl Agent for BlockFetchServer {
    type Protocol = BlockFetch;

    fn protocol_id(&self) -> ProtocolId {
        ProtocolId::BLOCK_FETCH
    }

    fn role(&self) -> Role {
        Role::Server
    }

    fn state(&self) -> BlockFetchState {
        self.state
    }

    fn set_state(&mut self, state: BlockFetchState) {
        self.state = state;
    }

    fn produce_next(&self) -> Option<BlockFetchMessage> {
        self.pending.front().cloned()
    }

    fn on_sent(&mut self, _message: &BlockFetchMessage) {
        self.pending.pop_front();
    }

    fn on_message(&mut self, message: BlockFetchMessage) {
        let BlockFetchMessage::RequestRange { from, to } = message else {
            return;
        };
        match self.collect_range(&from, &to) {
            Ok(Some(bodies)) => {
                tracing::trace!(from = %from, to = %to, blocks = bodies.len(), "serving range");
                self.pending.push_back(BlockFetchMessage::StartBatch);
                self.pending
                    .extend(bodies.into_iter().map(BlockFetchMessage::Block));
                self.pending.push_back(BlockFetchMessage::BatchDone);
            }
            Ok(None) => self.pending.push_back(BlockFetchMessage::NoBlocks),
            Err(e) => {
                tracing::warn!("block lookup failed: {}", e);
                self.pending.push_back(BlockFetchMessage::NoBlocks);
            }
        }
    }

    fn reset(&mut self) {
        self.state = BlockFetch::INITIAL;
        self.pending.clear();
    }
}

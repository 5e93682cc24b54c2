//! Chain-sync server: serves headers from a [`ChainState`].
//!
//! Responses are computed when a request arrives and queued; the binding
//! sends them in order. After an intersection the first reply to
//! `RequestNext` is always a `RollBackward` to the intersection point. At
//! the tip the server answers `AwaitReply` and remembers that the client is
//! waiting, so [`ChainSyncServer::notify_new_block`] can push the next
//! header as soon as the chain grows.

use std::collections::VecDeque;
use std::sync::Arc;

use ouronet_chainstate::{ChainState, ChainStateError};
use ouronet_core::{HeaderContent, Point, Tip};

use super::{ChainSync, ChainSyncMessage, ChainSyncState};
use crate::agent::{Agent, Protocol, Role};
use crate::mux::ProtocolId;

/// Points remembered for finding a common ancestor after a reorg.
pub const DEFAULT_ROLLBACK_WINDOW: usize = 2160;

pub struct ChainSyncServer {
    protocol_id: ProtocolId,
    state: ChainSyncState,
    chain: Arc<dyn ChainState>,
    serve_blocks: bool,
    /// Points sent to the client, oldest first; the back is the last sent.
    sent: VecDeque<Point>,
    rollback_window: usize,
    needs_rollback: bool,
    tip_waiting: bool,
    pending: VecDeque<ChainSyncMessage>,
}

impl ChainSyncServer {
    pub fn new(chain: Arc<dyn ChainState>) -> Self {
        Self {
            protocol_id: ProtocolId::CHAIN_SYNC,
            state: ChainSync::INITIAL,
            chain,
            serve_blocks: false,
            sent: VecDeque::new(),
            rollback_window: DEFAULT_ROLLBACK_WINDOW,
            needs_rollback: false,
            tip_waiting: false,
            pending: VecDeque::new(),
        }
    }

    /// Serve whole blocks on the node-to-client protocol number.
    pub fn node_to_client(mut self) -> Self {
        self.protocol_id = ProtocolId::LOCAL_CHAIN_SYNC;
        self.serve_blocks = true;
        self
    }

    pub fn with_rollback_window(mut self, window: usize) -> Self {
        self.rollback_window = window.max(1);
        self
    }

    /// The point the client is positioned at, if intersected.
    pub fn last_sent(&self) -> Option<Point> {
        self.sent.back().copied()
    }

    pub fn is_tip_waiting(&self) -> bool {
        self.tip_waiting
    }

    /// Responses queued but not yet sent.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The chain grew; answer a client parked at the tip.
    ///
    /// Does nothing unless the client is waiting and this side holds agency.
    pub fn notify_new_block(&mut self, point: Point) {
        if !self.tip_waiting || !self.has_agency() {
            return;
        }
        match self.next_update() {
            Ok(Some(update)) => {
                tracing::trace!(new = %point, "pushing update to waiting client");
                self.tip_waiting = false;
                self.pending.push_back(update);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("chain lookup failed on new block: {}", e),
        }
    }

    fn tip(&self) -> Tip {
        match self.chain.get_tip() {
            Ok(tip) => tip.unwrap_or(Tip::ORIGIN),
            Err(e) => {
                tracing::warn!("tip lookup failed: {}", e);
                Tip::ORIGIN
            }
        }
    }

    /// Whether a client-supplied point can be intersected. The origin only
    /// counts once the chain has a block.
    fn contains(&self, point: &Point) -> Result<bool, ChainStateError> {
        if point.is_origin() {
            return Ok(self.chain.get_tip()?.is_some());
        }
        self.chain.has_point(point)
    }

    /// Whether the client's position is still on the served chain. The
    /// origin always is.
    fn on_chain(&self, point: &Point) -> Result<bool, ChainStateError> {
        if point.is_origin() {
            return Ok(true);
        }
        self.chain.has_point(point)
    }

    fn find_intersect(&mut self, candidates: &[Point]) -> ChainSyncMessage {
        for candidate in candidates {
            match self.contains(candidate) {
                Ok(true) => {
                    self.sent.clear();
                    self.sent.push_back(*candidate);
                    self.needs_rollback = true;
                    self.tip_waiting = false;
                    return ChainSyncMessage::IntersectFound {
                        point: *candidate,
                        tip: self.tip(),
                    };
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("intersection lookup failed: {}", e);
                    break;
                }
            }
        }
        ChainSyncMessage::IntersectNotFound { tip: self.tip() }
    }

    /// The reply that moves the client forward, or `None` at the tip.
    fn next_update(&mut self) -> Result<Option<ChainSyncMessage>, ChainStateError> {
        let Some(last) = self.last_sent() else {
            return Ok(None);
        };

        if !self.on_chain(&last)? {
            self.needs_rollback = false;
            let common = self.common_ancestor()?;
            tracing::debug!(from = %last, to = %common, "client is on a fork, rolling back");
            return Ok(Some(ChainSyncMessage::RollBackward {
                point: common,
                tip: self.tip(),
            }));
        }

        if self.needs_rollback {
            self.needs_rollback = false;
            return Ok(Some(ChainSyncMessage::RollBackward {
                point: last,
                tip: self.tip(),
            }));
        }

        let Some(next) = self.chain.find_next_block(&last)? else {
            return Ok(None);
        };
        let header = self.content_at(&next)?;
        self.record_sent(next);
        Ok(Some(ChainSyncMessage::RollForward {
            header,
            tip: self.tip(),
        }))
    }

    /// Newest previously sent point still on the chain, else the origin.
    fn common_ancestor(&mut self) -> Result<Point, ChainStateError> {
        while let Some(point) = self.sent.back().copied() {
            if self.on_chain(&point)? {
                return Ok(point);
            }
            self.sent.pop_back();
        }
        self.sent.push_back(Point::ORIGIN);
        Ok(Point::ORIGIN)
    }

    fn content_at(&self, point: &Point) -> Result<HeaderContent, ChainStateError> {
        let hash = point.hash.ok_or(ChainStateError::NotFound(*point))?;
        if self.serve_blocks {
            let block = self
                .chain
                .get_block(&hash)?
                .ok_or(ChainStateError::NotFound(*point))?;
            return Ok(HeaderContent::Block { bytes: block });
        }
        let raw = self
            .chain
            .get_block_header(&hash)?
            .ok_or(ChainStateError::NotFound(*point))?;
        Ok(HeaderContent::decode(&raw)?)
    }

    fn record_sent(&mut self, point: Point) {
        self.sent.push_back(point);
        while self.sent.len() > self.rollback_window {
            self.sent.pop_front();
        }
    }

    fn request_next(&mut self) -> ChainSyncMessage {
        if self.last_sent().is_none() {
            tracing::warn!("RequestNext before any intersection");
            return ChainSyncMessage::AwaitReply;
        }
        match self.next_update() {
            Ok(Some(update)) => update,
            Ok(None) => {
                self.tip_waiting = true;
                ChainSyncMessage::AwaitReply
            }
            Err(e) => {
                tracing::warn!("chain lookup failed, parking client: {}", e);
                self.tip_waiting = true;
                ChainSyncMessage::AwaitReply
            }
        }
    }
}

impl Agent for ChainSyncServer {
    type Protocol = ChainSync;

    fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    fn role(&self) -> Role {
        Role::Server
    }

    fn state(&self) -> ChainSyncState {
        self.state
    }

    fn set_state(&mut self, state: ChainSyncState) {
        self.state = state;
    }

    fn produce_next(&self) -> Option<ChainSyncMessage> {
        let next = self.pending.front()?;
        ChainSync::transition(self.state, next)?;
        Some(next.clone())
    }

    fn on_sent(&mut self, _message: &ChainSyncMessage) {
        self.pending.pop_front();
    }

    fn on_message(&mut self, message: ChainSyncMessage) {
        let reply = match message {
            ChainSyncMessage::FindIntersect(points) => self.find_intersect(&points),
            ChainSyncMessage::RequestNext => self.request_next(),
            ChainSyncMessage::Done => {
                tracing::debug!("client finished chain-sync");
                return;
            }
            _ => return,
        };
        self.pending.push_back(reply);
    }

    fn reset(&mut self) {
        self.state = ChainSync::INITIAL;
        self.sent.clear();
        self.needs_rollback = false;
        self.tip_waiting = false;
        self.pending.clear();
    }
}

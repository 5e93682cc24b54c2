//! Chain-sync client: follows a peer's chain from an intersection.

use std::sync::Arc;

use bytes::Bytes;
use ouronet_core::{HeaderContent, Point, Tip};

use super::{ChainSync, ChainSyncMessage, ChainSyncState};
use crate::agent::{Agent, ListenerId, Listeners, Notifications, Protocol, Role};
use crate::error::AgentError;
use crate::mux::ProtocolId;

/// Observer of chain-sync progress.
///
/// Roll-forward callbacks are split by era so consumers can decode the
/// header bytes without re-inspecting the wrapper.
pub trait ChainSyncListener: Send + Sync {
    fn intersect_found(&self, _point: &Point, _tip: &Tip) {}

    fn intersect_not_found(&self, _tip: &Tip) {}

    /// Post-Byron header.
    fn roll_forward(&self, _era: u64, _header: &Bytes, _tip: &Tip) {}

    fn roll_forward_byron(&self, _header: &Bytes, _tip: &Tip) {}

    /// Byron epoch-boundary header.
    fn roll_forward_byron_ebb(&self, _header: &Bytes, _tip: &Tip) {}

    /// Whole block, on node-to-client connections.
    fn roll_forward_block(&self, _block: &Bytes, _tip: &Tip) {}

    fn roll_backward(&self, _point: &Point, _tip: &Tip) {}

    fn await_reply(&self) {}
}

pub struct ChainSyncClient {
    protocol_id: ProtocolId,
    state: ChainSyncState,
    candidates: Vec<Point>,
    cursor: Option<Point>,
    intersected: bool,
    peer_tip: Option<Tip>,
    follow_tip: bool,
    done_requested: bool,
    listeners: Listeners<dyn ChainSyncListener>,
}

impl ChainSyncClient {
    /// Follow the chain from the first of `candidates` the server knows.
    pub fn new(candidates: Vec<Point>) -> Self {
        Self {
            protocol_id: ProtocolId::CHAIN_SYNC,
            state: ChainSync::INITIAL,
            candidates,
            cursor: None,
            intersected: false,
            peer_tip: None,
            follow_tip: false,
            done_requested: false,
            listeners: Listeners::new(),
        }
    }

    /// Start at the peer's current tip instead of replaying history.
    ///
    /// Intersects at the origin to learn the tip, then re-intersects there.
    pub fn from_tip() -> Self {
        Self {
            follow_tip: true,
            ..Self::new(vec![Point::ORIGIN])
        }
    }

    /// Run on the node-to-client protocol number, receiving whole blocks.
    pub fn node_to_client(mut self) -> Self {
        self.protocol_id = ProtocolId::LOCAL_CHAIN_SYNC;
        self
    }

    /// Forget the cursor and intersect again from `point`.
    pub fn reset_to(&mut self, point: Point) {
        self.cursor = None;
        self.intersected = false;
        self.candidates = vec![point];
    }

    /// Replace the candidate points used for the next intersection.
    pub fn set_candidates(&mut self, candidates: Vec<Point>) {
        self.candidates = candidates;
        self.intersected = false;
    }

    /// Terminate the protocol at the next opportunity.
    pub fn request_done(&mut self) {
        self.done_requested = true;
    }

    /// Last point applied locally.
    pub fn cursor(&self) -> Option<Point> {
        self.cursor
    }

    pub fn peer_tip(&self) -> Option<Tip> {
        self.peer_tip
    }

    pub fn is_intersected(&self) -> bool {
        self.intersected
    }

    pub fn add_listener(
        &mut self,
        listener: Arc<dyn ChainSyncListener>,
    ) -> Result<ListenerId, AgentError> {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    fn roll_forward(&mut self, header: HeaderContent, tip: Tip) {
        match header.point() {
            Ok(point) => self.cursor = Some(point),
            Err(e) => tracing::warn!("cannot derive point from header: {}", e),
        }

        match header {
            HeaderContent::Shelley { era, bytes } => self
                .listeners
                .notify(move |l| l.roll_forward(era, &bytes, &tip)),
            HeaderContent::ByronMain { bytes, .. } => self
                .listeners
                .notify(move |l| l.roll_forward_byron(&bytes, &tip)),
            HeaderContent::ByronBoundary { bytes, .. } => self
                .listeners
                .notify(move |l| l.roll_forward_byron_ebb(&bytes, &tip)),
            HeaderContent::Block { bytes } => self
                .listeners
                .notify(move |l| l.roll_forward_block(&bytes, &tip)),
        }
    }

    fn roll_backward(&mut self, point: Point, tip: Tip) {
        if self.cursor != Some(point) {
            tracing::debug!(from = ?self.cursor, to = %point, "rolling back");
            self.cursor = Some(point);
            self.candidates = vec![point];
            self.intersected = false;
        }
        self.listeners
            .notify(move |l| l.roll_backward(&point, &tip));
    }
}

impl Agent for ChainSyncClient {
    type Protocol = ChainSync;

    fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    fn role(&self) -> Role {
        Role::Client
    }

    fn state(&self) -> ChainSyncState {
        self.state
    }

    fn set_state(&mut self, state: ChainSyncState) {
        self.state = state;
    }

    fn produce_next(&self) -> Option<ChainSyncMessage> {
        if self.done_requested {
            return Some(ChainSyncMessage::Done);
        }
        if self.intersected {
            return Some(ChainSyncMessage::RequestNext);
        }
        if self.candidates.is_empty() {
            return None;
        }
        Some(ChainSyncMessage::FindIntersect(self.candidates.clone()))
    }

    fn on_message(&mut self, message: ChainSyncMessage) {
        match message {
            ChainSyncMessage::IntersectFound { point, tip } => {
                self.peer_tip = Some(tip);
                self.listeners
                    .notify(move |l| l.intersect_found(&point, &tip));

                if self.follow_tip {
                    self.follow_tip = false;
                    tracing::debug!(tip = %tip, "re-intersecting at peer tip");
                    self.candidates = vec![tip.point];
                } else {
                    self.cursor = Some(point);
                    self.intersected = true;
                }
            }
            ChainSyncMessage::IntersectNotFound { tip } => {
                self.peer_tip = Some(tip);
                tracing::warn!(candidates = self.candidates.len(), "no intersection found");
                self.candidates.clear();
                self.listeners.notify(move |l| l.intersect_not_found(&tip));
            }
            ChainSyncMessage::RollForward { header, tip } => {
                self.peer_tip = Some(tip);
                self.roll_forward(header, tip);
            }
            ChainSyncMessage::RollBackward { point, tip } => {
                self.peer_tip = Some(tip);
                self.roll_backward(point, tip);
            }
            ChainSyncMessage::AwaitReply => self.listeners.notify(|l| l.await_reply()),
            _ => {}
        }
    }

    /// Back to `Idle`, resuming from the cursor on the next intersection.
    fn reset(&mut self) {
        self.state = ChainSync::INITIAL;
        if let Some(cursor) = self.cursor.take() {
            self.candidates = vec![cursor];
        }
        self.intersected = false;
        self.done_requested = false;
    }

    fn seal_listeners(&mut self) {
        self.listeners.seal();
    }

    fn take_notifications(&mut self) -> Notifications {
        self.listeners.take_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolViolation;
    use ouronet_core::BlockHash;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ChainSyncListener for Recorder {
        fn intersect_found(&self, point: &Point, _tip: &Tip) {
            self.0.lock().unwrap().push(format!("found {}", point.slot));
        }
        fn intersect_not_found(&self, _tip: &Tip) {
            self.0.lock().unwrap().push("not-found".into());
        }
        fn roll_forward(&self, era: u64, _header: &Bytes, _tip: &Tip) {
            self.0.lock().unwrap().push(format!("forward era {}", era));
        }
        fn roll_backward(&self, point: &Point, _tip: &Tip) {
            self.0.lock().unwrap().push(format!("backward {}", point.slot));
        }
        fn await_reply(&self) {
            self.0.lock().unwrap().push("await".into());
        }
    }

    fn point(slot: u64) -> Point {
        Point::new(slot, BlockHash::digest(&slot.to_be_bytes()))
    }

    fn tip(slot: u64) -> Tip {
        Tip::new(point(slot), slot)
    }

    fn send(client: &mut ChainSyncClient) -> ChainSyncMessage {
        client.take_next().unwrap()
    }

    /// Deliver a server message and run the listener calls it queued.
    fn feed(client: &mut ChainSyncClient, message: ChainSyncMessage) {
        client.consume(message).unwrap();
        client.take_notifications().run();
    }

    #[test]
    fn test_intersect_then_request_next() {
        let recorder = Arc::new(Recorder::default());
        let mut client = ChainSyncClient::new(vec![point(10), Point::ORIGIN]);
        client.add_listener(recorder.clone()).unwrap();

        assert_eq!(
            send(&mut client),
            ChainSyncMessage::FindIntersect(vec![point(10), Point::ORIGIN])
        );
        feed(
            &mut client,
            ChainSyncMessage::IntersectFound {
                point: point(10),
                tip: tip(20),
            },
        );

        assert!(client.is_intersected());
        assert_eq!(client.cursor(), Some(point(10)));
        assert_eq!(client.peer_tip(), Some(tip(20)));
        assert_eq!(send(&mut client), ChainSyncMessage::RequestNext);
        assert_eq!(recorder.events(), vec!["found 10"]);
    }

    #[test]
    fn test_listeners_run_only_when_taken() {
        let recorder = Arc::new(Recorder::default());
        let mut client = ChainSyncClient::new(vec![Point::ORIGIN]);
        client.add_listener(recorder.clone()).unwrap();

        send(&mut client);
        client
            .consume(ChainSyncMessage::IntersectFound {
                point: Point::ORIGIN,
                tip: tip(4),
            })
            .unwrap();
        assert!(recorder.events().is_empty());

        client.take_notifications().run();
        assert_eq!(recorder.events(), vec!["found 0"]);
    }

    #[test]
    fn test_rollback_to_cursor_is_noop() {
        let recorder = Arc::new(Recorder::default());
        let mut client = ChainSyncClient::new(vec![point(10)]);
        client.add_listener(recorder.clone()).unwrap();

        send(&mut client);
        feed(
            &mut client,
            ChainSyncMessage::IntersectFound {
                point: point(10),
                tip: tip(20),
            },
        );
        send(&mut client);
        feed(
            &mut client,
            ChainSyncMessage::RollBackward {
                point: point(10),
                tip: tip(20),
            },
        );

        assert!(client.is_intersected());
        assert_eq!(client.cursor(), Some(point(10)));
        assert_eq!(send(&mut client), ChainSyncMessage::RequestNext);
        assert_eq!(recorder.events(), vec!["found 10", "backward 10"]);
    }

    #[test]
    fn test_real_rollback_reintersects() {
        let mut client = ChainSyncClient::new(vec![point(30)]);
        send(&mut client);
        feed(
            &mut client,
            ChainSyncMessage::IntersectFound {
                point: point(30),
                tip: tip(30),
            },
        );
        send(&mut client);
        feed(
            &mut client,
            ChainSyncMessage::RollBackward {
                point: point(20),
                tip: tip(20),
            },
        );

        assert!(!client.is_intersected());
        assert_eq!(client.cursor(), Some(point(20)));
        assert_eq!(
            send(&mut client),
            ChainSyncMessage::FindIntersect(vec![point(20)])
        );
    }

    #[test]
    fn test_from_tip_reintersects_once() {
        let mut client = ChainSyncClient::from_tip();
        assert_eq!(
            send(&mut client),
            ChainSyncMessage::FindIntersect(vec![Point::ORIGIN])
        );
        feed(
            &mut client,
            ChainSyncMessage::IntersectFound {
                point: Point::ORIGIN,
                tip: tip(500),
            },
        );
        assert!(!client.is_intersected());
        assert_eq!(
            send(&mut client),
            ChainSyncMessage::FindIntersect(vec![point(500)])
        );

        feed(
            &mut client,
            ChainSyncMessage::IntersectFound {
                point: point(500),
                tip: tip(500),
            },
        );
        assert!(client.is_intersected());
        assert_eq!(client.cursor(), Some(point(500)));
    }

    #[test]
    fn test_not_found_stalls_until_reset() {
        let recorder = Arc::new(Recorder::default());
        let mut client = ChainSyncClient::new(vec![point(99)]);
        client.add_listener(recorder.clone()).unwrap();

        send(&mut client);
        feed(&mut client, ChainSyncMessage::IntersectNotFound { tip: tip(20) });
        assert_eq!(client.produce_next(), None);
        assert_eq!(recorder.events(), vec!["not-found"]);

        client.reset_to(Point::ORIGIN);
        assert_eq!(
            client.produce_next(),
            Some(ChainSyncMessage::FindIntersect(vec![Point::ORIGIN]))
        );
    }

    #[test]
    fn test_roll_forward_moves_cursor() {
        let recorder = Arc::new(Recorder::default());
        let mut client = ChainSyncClient::new(vec![Point::ORIGIN]);
        client.add_listener(recorder.clone()).unwrap();

        send(&mut client);
        feed(
            &mut client,
            ChainSyncMessage::IntersectFound {
                point: Point::ORIGIN,
                tip: tip(1),
            },
        );
        send(&mut client);

        // [[block_no, slot, prev], sig]
        let raw = ouronet_core::cbor::encode(&ouronet_core::CborValue::Array(vec![
            ouronet_core::CborValue::Array(vec![
                ouronet_core::cbor::uint(1),
                ouronet_core::cbor::uint(7),
                ouronet_core::CborValue::Null,
            ]),
            ouronet_core::CborValue::Bytes(vec![0; 4]),
        ]))
        .unwrap();
        let header = HeaderContent::Shelley {
            era: 6,
            bytes: Bytes::from(raw),
        };
        let expected = header.point().unwrap();

        feed(&mut client, ChainSyncMessage::RollForward { header, tip: tip(7) });
        assert_eq!(client.cursor(), Some(expected));
        assert_eq!(expected.slot, 7);
        assert_eq!(recorder.events(), vec!["found 0", "forward era 6"]);
    }

    #[test]
    fn test_message_while_holding_agency_rejected() {
        let recorder = Arc::new(Recorder::default());
        let mut client = ChainSyncClient::new(vec![Point::ORIGIN]);
        client.add_listener(recorder.clone()).unwrap();

        let err = client
            .consume(ChainSyncMessage::RollBackward {
                point: point(5),
                tip: tip(5),
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::LocalAgency { .. }));
        assert_eq!(client.cursor(), None);
        assert!(client.take_notifications().is_empty());
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut client = ChainSyncClient::new(vec![Point::ORIGIN]);
        send(&mut client);
        assert_eq!(client.state(), ChainSyncState::Intersect);

        let err = client.consume(ChainSyncMessage::AwaitReply).unwrap_err();
        assert!(matches!(err, ProtocolViolation::InvalidTransition { .. }));
        assert_eq!(client.state(), ChainSyncState::Intersect);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut client = ChainSyncClient::new(vec![Point::ORIGIN]);
        send(&mut client);
        feed(
            &mut client,
            ChainSyncMessage::IntersectFound {
                point: point(3),
                tip: tip(9),
            },
        );
        send(&mut client);

        let snapshot =
            |c: &ChainSyncClient| (c.state(), c.cursor(), c.candidates.clone(), c.intersected);
        client.reset();
        let once = snapshot(&client);
        client.reset();
        let twice = snapshot(&client);

        assert_eq!(once, twice);
        assert_eq!(once.0, ChainSyncState::Idle);
        assert_eq!(once.2, vec![point(3)]);
    }

    #[test]
    fn test_done_terminates() {
        let mut client = ChainSyncClient::new(vec![Point::ORIGIN]);
        client.request_done();
        assert_eq!(send(&mut client), ChainSyncMessage::Done);
        assert!(client.is_done());
    }
}

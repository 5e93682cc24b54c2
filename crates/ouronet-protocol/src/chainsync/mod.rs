//! Chain-sync mini-protocol.
//!
//! ```text
//! MsgRequestNext        [0]
//! MsgAwaitReply         [1]
//! MsgRollForward        [2, header, tip]
//! MsgRollBackward       [3, point, tip]
//! MsgFindIntersect      [4, [point*]]
//! MsgIntersectFound     [5, point, tip]
//! MsgIntersectNotFound  [6, tip]
//! MsgDone               [7]
//! ```
//!
//! State machine:
//!
//! ```text
//!            FindIntersect                 IntersectFound / NotFound
//!   Idle ---------------------> Intersect ---------------------------> Idle
//!   Idle ---RequestNext-------> CanAwait --RollForward/Backward------> Idle
//!                               CanAwait --AwaitReply--> MustReply --Roll*--> Idle
//!   Idle ---Done--------------> Done
//! ```
//!
//! The client holds agency in `Idle`; the server in the three waiting
//! states.

mod client;
mod server;

pub use client::{ChainSyncClient, ChainSyncListener};
pub use server::{ChainSyncServer, DEFAULT_ROLLBACK_WINDOW};

use ouronet_core::cbor::{as_array, expect_fields, split_message, uint};
use ouronet_core::{CborValue, CodecError, HeaderContent, Point, Tip};

use crate::agent::{Agency, Message, Protocol};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainSyncMessage {
    RequestNext,
    AwaitReply,
    RollForward { header: HeaderContent, tip: Tip },
    RollBackward { point: Point, tip: Tip },
    FindIntersect(Vec<Point>),
    IntersectFound { point: Point, tip: Tip },
    IntersectNotFound { tip: Tip },
    Done,
}

impl Message for ChainSyncMessage {
    fn name(&self) -> &'static str {
        match self {
            ChainSyncMessage::RequestNext => "RequestNext",
            ChainSyncMessage::AwaitReply => "AwaitReply",
            ChainSyncMessage::RollForward { .. } => "RollForward",
            ChainSyncMessage::RollBackward { .. } => "RollBackward",
            ChainSyncMessage::FindIntersect(_) => "FindIntersect",
            ChainSyncMessage::IntersectFound { .. } => "IntersectFound",
            ChainSyncMessage::IntersectNotFound { .. } => "IntersectNotFound",
            ChainSyncMessage::Done => "Done",
        }
    }

    fn to_cbor(&self) -> CborValue {
        let items = match self {
            ChainSyncMessage::RequestNext => vec![uint(0)],
            ChainSyncMessage::AwaitReply => vec![uint(1)],
            ChainSyncMessage::RollForward { header, tip } => {
                vec![uint(2), header.to_cbor(), tip.to_cbor()]
            }
            ChainSyncMessage::RollBackward { point, tip } => {
                vec![uint(3), point.to_cbor(), tip.to_cbor()]
            }
            ChainSyncMessage::FindIntersect(points) => vec![
                uint(4),
                CborValue::Array(points.iter().map(Point::to_cbor).collect()),
            ],
            ChainSyncMessage::IntersectFound { point, tip } => {
                vec![uint(5), point.to_cbor(), tip.to_cbor()]
            }
            ChainSyncMessage::IntersectNotFound { tip } => vec![uint(6), tip.to_cbor()],
            ChainSyncMessage::Done => vec![uint(7)],
        };
        CborValue::Array(items)
    }

    fn from_cbor(value: CborValue) -> Result<Self, CodecError> {
        let (tag, fields) = split_message(value, ChainSync::NAME)?;
        let mut it = fields.iter().cloned();
        let mut next = || it.next().unwrap_or(CborValue::Null);

        let msg = match tag {
            0 => {
                expect_fields(&fields, 0, "MsgRequestNext")?;
                ChainSyncMessage::RequestNext
            }
            1 => {
                expect_fields(&fields, 0, "MsgAwaitReply")?;
                ChainSyncMessage::AwaitReply
            }
            2 => {
                expect_fields(&fields, 2, "MsgRollForward")?;
                ChainSyncMessage::RollForward {
                    header: HeaderContent::from_cbor(next())?,
                    tip: Tip::from_cbor(next())?,
                }
            }
            3 => {
                expect_fields(&fields, 2, "MsgRollBackward")?;
                ChainSyncMessage::RollBackward {
                    point: Point::from_cbor(next())?,
                    tip: Tip::from_cbor(next())?,
                }
            }
            4 => {
                expect_fields(&fields, 1, "MsgFindIntersect")?;
                let points = as_array(next(), "MsgFindIntersect")?
                    .into_iter()
                    .map(Point::from_cbor)
                    .collect::<Result<_, _>>()?;
                ChainSyncMessage::FindIntersect(points)
            }
            5 => {
                expect_fields(&fields, 2, "MsgIntersectFound")?;
                ChainSyncMessage::IntersectFound {
                    point: Point::from_cbor(next())?,
                    tip: Tip::from_cbor(next())?,
                }
            }
            6 => {
                expect_fields(&fields, 1, "MsgIntersectNotFound")?;
                ChainSyncMessage::IntersectNotFound {
                    tip: Tip::from_cbor(next())?,
                }
            }
            7 => {
                expect_fields(&fields, 0, "MsgDone")?;
                ChainSyncMessage::Done
            }
            tag => {
                return Err(CodecError::UnknownTag {
                    protocol: ChainSync::NAME,
                    tag,
                })
            }
        };
        Ok(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainSyncState {
    Idle,
    Intersect,
    CanAwait,
    MustReply,
    Done,
}

pub struct ChainSync;

impl Protocol for ChainSync {
    type State = ChainSyncState;
    type Message = ChainSyncMessage;

    const NAME: &'static str = "chain-sync";
    const INITIAL: ChainSyncState = ChainSyncState::Idle;

    fn agency(state: ChainSyncState) -> Agency {
        match state {
            ChainSyncState::Idle => Agency::Client,
            ChainSyncState::Intersect | ChainSyncState::CanAwait | ChainSyncState::MustReply => {
                Agency::Server
            }
            ChainSyncState::Done => Agency::Nobody,
        }
    }

    fn transition(state: ChainSyncState, message: &ChainSyncMessage) -> Option<ChainSyncState> {
        use ChainSyncMessage as M;
        use ChainSyncState as S;
        match (state, message) {
            (S::Idle, M::RequestNext) => Some(S::CanAwait),
            (S::Idle, M::FindIntersect(_)) => Some(S::Intersect),
            (S::Idle, M::Done) => Some(S::Done),
            (S::CanAwait, M::AwaitReply) => Some(S::MustReply),
            (S::CanAwait | S::MustReply, M::RollForward { .. } | M::RollBackward { .. }) => {
                Some(S::Idle)
            }
            (S::Intersect, M::IntersectFound { .. } | M::IntersectNotFound { .. }) => {
                Some(S::Idle)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ouronet_core::BlockHash;

    fn hex(bytes: &[u8]) -> String {
        hex::encode(bytes)
    }

    #[test]
    fn test_find_intersect_origin() {
        let msg = ChainSyncMessage::FindIntersect(vec![Point::ORIGIN]);
        assert_eq!(hex(&msg.encode().unwrap()), "82048180");
        assert_eq!(ChainSyncMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_simple_messages() {
        assert_eq!(hex(&ChainSyncMessage::RequestNext.encode().unwrap()), "8100");
        assert_eq!(hex(&ChainSyncMessage::AwaitReply.encode().unwrap()), "8101");
        assert_eq!(hex(&ChainSyncMessage::Done.encode().unwrap()), "8107");
    }

    #[test]
    fn test_roll_forward_roundtrip() {
        let header = HeaderContent::Shelley {
            era: 6,
            bytes: Bytes::from_static(&[0x82, 0x80, 0x40]),
        };
        let tip = Tip::new(Point::new(100, BlockHash::digest(b"tip")), 50);
        let msg = ChainSyncMessage::RollForward { header, tip };
        assert_eq!(ChainSyncMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_unknown_tag() {
        let err = ChainSyncMessage::decode(&[0x81, 0x09]).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnknownTag {
                protocol: "chain-sync",
                tag: 9
            }
        );
    }

    #[test]
    fn test_field_count_checked() {
        // [2, tip] is missing the header.
        let bad = CborValue::Array(vec![uint(2), Tip::ORIGIN.to_cbor()]);
        assert!(ChainSyncMessage::from_cbor(bad).is_err());
    }

    #[test]
    fn test_transitions() {
        use ChainSyncState as S;
        let tip = Tip::ORIGIN;
        let back = ChainSyncMessage::RollBackward {
            point: Point::ORIGIN,
            tip,
        };

        let next = ChainSyncMessage::RequestNext;
        let wait = ChainSyncMessage::AwaitReply;

        assert_eq!(ChainSync::transition(S::Idle, &next), Some(S::CanAwait));
        assert_eq!(ChainSync::transition(S::CanAwait, &wait), Some(S::MustReply));
        assert_eq!(ChainSync::transition(S::MustReply, &back), Some(S::Idle));
        assert_eq!(ChainSync::transition(S::MustReply, &wait), None);
        assert_eq!(ChainSync::transition(S::Idle, &back), None);
        assert_eq!(ChainSync::transition(S::Done, &next), None);
        assert_eq!(ChainSync::agency(S::Intersect), Agency::Server);
    }
}

//! Proptest generators for property-based testing.

use bytes::Bytes;
use proptest::prelude::*;

use ouronet_core::{BlockHash, HeaderContent, Point, Tip};
use ouronet_protocol::{BlockFetchMessage, ChainSyncMessage, KeepAliveMessage};

/// Generate a random BlockHash.
pub fn block_hash() -> impl Strategy<Value = BlockHash> {
    any::<[u8; 32]>().prop_map(BlockHash)
}

/// Generate a point, the origin included.
pub fn point() -> impl Strategy<Value = Point> {
    prop_oneof![
        1 => Just(Point::ORIGIN),
        9 => (1u64..=u64::MAX / 2, block_hash()).prop_map(|(slot, hash)| Point::new(slot, hash)),
    ]
}

pub fn tip() -> impl Strategy<Value = Tip> {
    (point(), any::<u64>()).prop_map(|(point, block_number)| Tip::new(point, block_number))
}

/// Opaque bytes of at most `max_len`.
pub fn opaque(max_len: usize) -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..=max_len).prop_map(Bytes::from)
}

pub fn header_content() -> impl Strategy<Value = HeaderContent> {
    prop_oneof![
        (1u64..8, opaque(200)).prop_map(|(era, bytes)| HeaderContent::Shelley { era, bytes }),
        (any::<u32>(), opaque(200)).prop_map(|(size, bytes)| HeaderContent::ByronMain {
            size: size as u64,
            bytes
        }),
        (any::<u32>(), opaque(200)).prop_map(|(size, bytes)| HeaderContent::ByronBoundary {
            size: size as u64,
            bytes
        }),
        opaque(400).prop_map(|bytes| HeaderContent::Block { bytes }),
    ]
}

pub fn chain_sync_message() -> impl Strategy<Value = ChainSyncMessage> {
    prop_oneof![
        Just(ChainSyncMessage::RequestNext),
        Just(ChainSyncMessage::AwaitReply),
        (header_content(), tip())
            .prop_map(|(header, tip)| ChainSyncMessage::RollForward { header, tip }),
        (point(), tip()).prop_map(|(point, tip)| ChainSyncMessage::RollBackward { point, tip }),
        prop::collection::vec(point(), 0..8).prop_map(ChainSyncMessage::FindIntersect),
        (point(), tip()).prop_map(|(point, tip)| ChainSyncMessage::IntersectFound { point, tip }),
        tip().prop_map(|tip| ChainSyncMessage::IntersectNotFound { tip }),
        Just(ChainSyncMessage::Done),
    ]
}

pub fn block_fetch_message() -> impl Strategy<Value = BlockFetchMessage> {
    prop_oneof![
        (point(), point()).prop_map(|(from, to)| BlockFetchMessage::RequestRange { from, to }),
        Just(BlockFetchMessage::ClientDone),
        Just(BlockFetchMessage::StartBatch),
        Just(BlockFetchMessage::NoBlocks),
        opaque(1000).prop_map(BlockFetchMessage::Block),
        Just(BlockFetchMessage::BatchDone),
    ]
}

pub fn keep_alive_message() -> impl Strategy<Value = KeepAliveMessage> {
    prop_oneof![
        any::<u32>().prop_map(KeepAliveMessage::KeepAlive),
        any::<u32>().prop_map(KeepAliveMessage::KeepAliveResponse),
        Just(KeepAliveMessage::Done),
    ]
}

/// Split `bytes` into chunks at the given cut points.
///
/// Cut points are taken modulo the length, so any generated vector works.
pub fn fragment(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return vec![];
    }
    let mut cuts: Vec<usize> = cuts.iter().map(|c| c % bytes.len()).collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut chunks = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for cut in cuts {
        if cut > start {
            chunks.push(bytes[start..cut].to_vec());
            start = cut;
        }
    }
    chunks.push(bytes[start..].to_vec());
    chunks
}

//! Golden wire vectors.
//!
//! Each vector is a complete CBOR message for one mini-protocol. Decoding
//! a vector and encoding it again must reproduce the exact bytes, which
//! pins the codec to the Ouroboros wire layout.

use serde::{Deserialize, Serialize};

use ouronet_protocol::{
    BlockFetchMessage, ChainSyncMessage, HandshakeMessage, KeepAliveMessage, Message, ProtocolId,
};

const MESSAGES: &str = include_str!("../vectors/messages.json");

/// A golden wire vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoldenVector {
    /// Human-readable name for the vector.
    pub name: String,
    /// Mini-protocol number the message belongs to.
    pub protocol: u16,
    /// The encoded message.
    pub hex: String,
}

/// Get all golden vectors.
pub fn all_vectors() -> Vec<GoldenVector> {
    // The file ships with the crate and is checked by the tests below.
    serde_json::from_str(MESSAGES).unwrap_or_default()
}

/// Decode a vector with its protocol's codec and encode it again.
///
/// Returns the re-encoded hex and the message's name.
pub fn reencode(vector: &GoldenVector) -> Result<(String, &'static str), String> {
    let bytes = hex::decode(&vector.hex).map_err(|e| e.to_string())?;
    match ProtocolId(vector.protocol) {
        ProtocolId::HANDSHAKE => roundtrip::<HandshakeMessage>(&bytes),
        ProtocolId::CHAIN_SYNC | ProtocolId::LOCAL_CHAIN_SYNC => {
            roundtrip::<ChainSyncMessage>(&bytes)
        }
        ProtocolId::BLOCK_FETCH => roundtrip::<BlockFetchMessage>(&bytes),
        ProtocolId::KEEP_ALIVE => roundtrip::<KeepAliveMessage>(&bytes),
        other => Err(format!("no codec for protocol {}", other)),
    }
}

fn roundtrip<M: Message>(bytes: &[u8]) -> Result<(String, &'static str), String> {
    let message = M::decode(bytes).map_err(|e| e.to_string())?;
    let encoded = message.encode().map_err(|e| e.to_string())?;
    Ok((hex::encode(encoded), message.name()))
}

/// Check every golden vector.
///
/// Returns `(name, matches, reencoded_hex)` for each.
pub fn verify_all_vectors() -> Vec<(String, bool, String)> {
    all_vectors()
        .iter()
        .map(|v| match reencode(v) {
            Ok((hex, _)) => (v.name.clone(), hex == v.hex, hex),
            Err(e) => (v.name.clone(), false, e),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vectors_load() {
        let vectors = all_vectors();
        assert!(vectors.len() >= 16);
        assert!(vectors.iter().any(|v| v.protocol == 0));
    }

    #[test]
    fn test_all_vectors_reencode() {
        for (name, matches, hex) in verify_all_vectors() {
            assert!(matches, "vector '{}' re-encoded as {}", name, hex);
        }
    }

    #[test]
    fn test_vector_names_match_messages() {
        let vectors = all_vectors();
        let find = |name: &str| vectors.iter().find(|v| v.name == name).unwrap();

        assert_eq!(reencode(find("keep-alive ping")).unwrap().1, "KeepAlive");
        assert_eq!(
            reencode(find("chain-sync find intersect at origin")).unwrap().1,
            "FindIntersect"
        );
        assert_eq!(
            reencode(find("handshake refuse version mismatch")).unwrap().1,
            "Refuse"
        );
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let vector = GoldenVector {
            name: "local state query".into(),
            protocol: 7,
            hex: "8100".into(),
        };
        assert!(reencode(&vector).is_err());
    }
}

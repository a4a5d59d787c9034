//! Identity types: peer, message, and query identifiers.
//!
//! Peer IDs are 256-bit BLAKE3 digests of a peer's public key material.
//! Their bytewise ordering is load-bearing: the consistent-hash replica
//! mapping requires every participant to sort the peer-view identically,
//! and ordering the raw bytes is equivalent to ordering the hex form as an
//! opaque string.

use iroh_blake3::Hasher;
use rand::RngCore;

/// A 256-bit peer identifier, derived from the peer's public key.
pub type PeerId = [u8; 32];

/// A 128-bit random identifier stamped on every flooded message.
pub type MessageId = [u8; 16];

/// Correlates a pipe resolution query with its responses.
pub type QueryId = u64;

/// Wildcard query id matching any outstanding query for a pipe.
pub const ANY_QUERY: QueryId = 0;

/// Compute a 32-byte BLAKE3 digest of the input data.
pub(crate) fn blake3_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Derive a stable [`PeerId`] by hashing arbitrary input with BLAKE3.
///
/// Typically used to derive a peer's overlay identity from its endpoint
/// public key:
///
/// ```
/// use rendezvous_overlay::derive_peer_id;
///
/// let public_key = b"example-public-key-bytes";
/// let peer_id = derive_peer_id(public_key);
/// assert_eq!(peer_id, derive_peer_id(public_key));
/// ```
pub fn derive_peer_id(data: &[u8]) -> PeerId {
    blake3_digest(data)
}

/// Generate a fresh random [`MessageId`].
pub fn fresh_message_id() -> MessageId {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Generate a fresh nonzero [`QueryId`].
///
/// Zero is reserved for [`ANY_QUERY`], so the generator re-rolls on it.
pub fn fresh_query_id() -> QueryId {
    loop {
        let id = rand::thread_rng().next_u64();
        if id != ANY_QUERY {
            return id;
        }
    }
}

/// A peer identity together with the route hint the messenger needs to
/// reach it. The route hint is an opaque serialized transport address; the
/// core never interprets it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PeerAddr {
    /// The peer's unique identifier.
    pub id: PeerId,
    /// Serialized transport address for connecting to this peer.
    pub route: String,
}

impl PeerAddr {
    /// Short hex form of the peer id for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.id[..6])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_peer_id_is_deterministic() {
        let a = derive_peer_id(b"peer key");
        let b = derive_peer_id(b"peer key");
        assert_eq!(a, b);
        assert_ne!(a, derive_peer_id(b"other key"));
    }

    #[test]
    fn fresh_query_id_never_returns_wildcard() {
        for _ in 0..64 {
            assert_ne!(fresh_query_id(), ANY_QUERY);
        }
    }
}

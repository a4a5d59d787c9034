//! Overlay wire message definitions.
//!
//! Every flooded message carries a [`WireHeader`] for loop and TTL
//! control; the payload is a tagged enum so receivers dispatch with an
//! exhaustive match instead of runtime type tests. All messages are
//! serializable for network transport.

use serde::{Deserialize, Serialize};

use crate::id::{MessageId, PeerAddr, PeerId, QueryId};

/// Service name for SRDI push and query traffic.
pub const SRDI_SERVICE: &str = "overlay/srdi";
/// Service name for pipe resolution traffic.
pub const PIPE_SERVICE: &str = "overlay/pipe";
/// Service name for membership greetings.
pub const MEMBERSHIP_SERVICE: &str = "overlay/membership";

/// Anti-loop, anti-storm header attached to every flooded message.
///
/// The header is mutated at each hop — TTL decremented, visiting peer
/// appended — and both fields are monotonic for the life of one message
/// instance: TTL never increases, the visited set never shrinks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireHeader {
    /// Unique id for duplicate suppression.
    pub msg_id: MessageId,
    /// Remaining hop budget. A message arriving with zero is dropped.
    pub ttl: u32,
    /// The peer that originated the message.
    pub source: PeerId,
    /// Every peer that has handled the message, in visit order.
    pub visited: Vec<PeerId>,
    /// Service the message is addressed to.
    pub dest_service: String,
    /// Sub-address within the destination service.
    pub dest_param: String,
}

impl WireHeader {
    /// Build a fresh header as the originating peer.
    ///
    /// The originator lists itself in the visited set from the start so a
    /// looped-back copy is recognized without touching the TTL — the
    /// first visit must not double-decrement.
    pub fn fresh(
        msg_id: MessageId,
        source: PeerId,
        ttl: u32,
        dest_service: &str,
        dest_param: &str,
    ) -> Self {
        Self {
            msg_id,
            ttl,
            source,
            visited: vec![source],
            dest_service: dest_service.to_string(),
            dest_param: dest_param.to_string(),
        }
    }
}

/// A single replicated index claim on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireSrdiEntry {
    /// Attribute under the message's primary key.
    pub key: String,
    /// Attribute value.
    pub value: String,
    /// Relative expiration of the claim in ms.
    pub expiration: u64,
}

/// A batch of index claims pushed from one peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SrdiPush {
    /// Primary key all entries in the batch share.
    pub primary_key: String,
    /// The peer whose resources the entries describe.
    pub owner: PeerId,
    /// Replication hop budget, distinct from the wire TTL: it bounds how
    /// many times the batch may be re-bucketed across replica peers.
    pub ttl: u32,
    /// The claims themselves.
    pub entries: Vec<WireSrdiEntry>,
}

/// Type of a pipe endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipeType {
    /// Point-to-point, unauthenticated.
    Unicast,
    /// Point-to-point over a secured channel.
    UnicastSecure,
    /// One-to-many.
    Propagate,
}

/// A request to locate the peer(s) hosting a pipe.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipeQuery {
    /// The pipe being resolved.
    pub pipe_id: String,
    /// Expected pipe type; a host with a different type answers negative.
    pub pipe_type: PipeType,
    /// Correlates responses with the outstanding query.
    pub query_id: QueryId,
    /// Number of times the query has been forwarded.
    pub hop_count: u32,
    /// Peer awaiting the answer.
    pub requestor: PeerAddr,
    /// When non-empty, only these peers are acceptable hosts.
    pub acceptable_peers: Vec<PeerId>,
}

/// Answer to a [`PipeQuery`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipeResponse {
    /// The pipe the response concerns.
    pub pipe_id: String,
    /// The query being answered.
    pub query_id: QueryId,
    /// Type of the pipe on the responding peer.
    pub pipe_type: PipeType,
    /// The responding peer.
    pub peer: PeerAddr,
    /// True for a positive resolution, false for a NAK.
    pub found: bool,
}

/// Lightweight hello sent on seed contact and lease refresh so the
/// receiver learns the sender's route hint and role.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeGreeting {
    /// The greeting peer.
    pub peer: PeerAddr,
    /// Whether the greeting peer is currently a rendezvous.
    pub rendezvous: bool,
}

/// The message payloads the overlay understands.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    /// Index replication batch.
    SrdiPush(SrdiPush),
    /// Pipe resolution request.
    PipeQuery(PipeQuery),
    /// Pipe resolution answer.
    PipeResponse(PipeResponse),
    /// Membership hello.
    ProbeGreeting(ProbeGreeting),
}

/// A complete overlay message: control header, optional opaque credential,
/// and payload.
///
/// The credential is an authentication token attached by the sender and
/// surfaced to receivers; the core carries it untouched and never
/// interprets it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverlayMessage {
    /// Loop/TTL control header.
    pub header: WireHeader,
    /// Opaque authentication token, if the sender attached one.
    pub credential: Option<Vec<u8>>,
    /// The message body.
    pub payload: Payload,
}

impl OverlayMessage {
    /// Serialize for transport.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from transport bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, crate::error::DecodeError> {
        serde_json::from_slice(bytes)
            .map_err(|err| crate::error::DecodeError::Malformed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::fresh_message_id;

    #[test]
    fn fresh_header_lists_originator_as_visited() {
        let source = [7u8; 32];
        let header = WireHeader::fresh(fresh_message_id(), source, 5, SRDI_SERVICE, "");
        assert_eq!(header.visited, vec![source]);
        assert_eq!(header.ttl, 5);
    }

    #[test]
    fn message_round_trips_through_codec() {
        let header = WireHeader::fresh(fresh_message_id(), [1u8; 32], 3, PIPE_SERVICE, "q");
        let msg = OverlayMessage {
            header,
            credential: Some(b"token".to_vec()),
            payload: Payload::PipeResponse(PipeResponse {
                pipe_id: "pipe-1".into(),
                query_id: 42,
                pipe_type: PipeType::Unicast,
                peer: crate::id::PeerAddr {
                    id: [2u8; 32],
                    route: "route".into(),
                },
                found: true,
            }),
        };
        let bytes = msg.encode().unwrap();
        let parsed = OverlayMessage::decode(&bytes).unwrap();
        assert_eq!(parsed.header.msg_id, msg.header.msg_id);
        assert!(matches!(parsed.payload, Payload::PipeResponse(r) if r.found));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(OverlayMessage::decode(b"not json").is_err());
    }
}

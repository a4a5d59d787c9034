//! # Rendezvous Overlay
//!
//! This crate implements a peer-to-peer overlay runtime built around a
//! rendezvous/SRDI core on top of the [`iroh`](https://crates.io/crates/iroh)
//! transport stack. Peers form a loosely consistent distributed directory:
//! super-peers ("rendezvous") index other peers' resource claims, replicate
//! those claims to consistent-hash-selected replica peers, and resolve
//! logical endpoints ("pipes") across a dynamically changing membership —
//! all with TTL-bounded, loop-detected, duplicate-suppressed flooding.
//!
//! The crate is split into modules that can be reused independently:
//!
//! - [`store`]: expiring record storage with secondary indexing and
//!   callback-driven scans.
//! - [`srdi`]: the Shared Resource Distributed Index — (key, attribute,
//!   value) → peer claims with wildcard queries and garbage collection.
//! - [`replication`]: consistent-hash replica placement and the SRDI push
//!   loop.
//! - [`peerview`]: rendezvous membership, leases, and the promotion/
//!   demotion watchdog.
//! - [`walk`]: the propagation and walk flooding engine.
//! - [`pipe`]: pipe advertisements, input pipes, and the pipe resolver.
//! - [`protocol`]: the serializable wire messages exchanged between peers.
//! - [`messenger`]: the transport boundary and its iroh implementation.
//! - [`framing`]: length-prefixed frame helpers for QUIC streams.
//! - [`server`]: hosting the inbound overlay handler on the transport.
//! - [`node`]: the assembled [`OverlayNode`] facade.
//!
//! ## Getting started
//!
//! Construct an [`IrohMessenger`], assemble an [`OverlayNode`], spawn its
//! background loops, and drive the async API from your application:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use rendezvous_overlay::{
//!     derive_peer_id, IrohMessenger, OverlayConfig, OverlayNode, PeerAddr, RdvRole,
//! };
//!
//! # async fn launch(endpoint: iroh::Endpoint) -> Result<()> {
//! let self_addr = PeerAddr {
//!     id: derive_peer_id(endpoint.id().as_bytes()),
//!     route: serde_json::to_string(&endpoint.addr())?,
//! };
//! let messenger = Arc::new(IrohMessenger::new(endpoint));
//! let node = OverlayNode::new(
//!     self_addr,
//!     OverlayConfig::default(),
//!     messenger,
//!     RdvRole::Edge,
//! )
//! .await;
//! node.spawn_background().await;
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` demonstrates how to wire these pieces
//! together into a self-contained overlay node that discovers peers via
//! mDNS with relay fallback.

pub mod config;
pub mod error;
pub mod framing;
pub mod id;
pub mod messenger;
pub mod node;
pub mod peerview;
pub mod pipe;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod srdi;
pub mod store;
pub mod walk;

pub use config::OverlayConfig;
pub use error::{DecodeError, ResolveError, SendError, StoreError};
pub use id::{derive_peer_id, MessageId, PeerAddr, PeerId, QueryId, ANY_QUERY};
pub use messenger::{IrohMessenger, Messenger, OVERLAY_ALPN};
pub use node::{OverlayNode, OverlayStats};
pub use peerview::{PeerView, RdvRole, RendezvousEvent, RendezvousListener};
pub use pipe::{InputPipe, PipeAdvertisement, PipeReceiver, PipeResolveEvent, PipeResolver};
pub use protocol::{OverlayMessage, Payload, PipeType, WireHeader};
pub use replication::SrdiEngine;
pub use server::{handle_connection, OverlayProtocolHandler};
pub use srdi::SrdiIndex;
pub use store::{ExpiringStore, Record};
pub use walk::{MessageListener, WalkEngine, WalkOutcome};

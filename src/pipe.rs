//! Pipe advertisements and the pipe resolver.
//!
//! A pipe is a logical, location-independent communication endpoint
//! identified by an opaque id. Applications register input pipes locally;
//! the resolver records them in the SRDI index, advertises them through
//! the SRDI engine, and answers resolution queries from the overlay.
//!
//! Resolution prefers knowledge in this order: the local registry, the
//! SRDI cache (directed queries to known holders), a consistent-hash
//! replica-peer hint, and finally flooding — a walk across rendezvous
//! peers, or a local-segment propagate when this peer is an edge.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::config::OverlayConfig;
use crate::error::{DecodeError, ResolveError, SendError};
use crate::id::{fresh_message_id, fresh_query_id, PeerAddr, PeerId, QueryId, ANY_QUERY};
use crate::messenger::Messenger;
use crate::peerview::{PeerView, RdvRole};
use crate::protocol::{
    OverlayMessage, Payload, PipeQuery, PipeResponse, PipeType, WireHeader, PIPE_SERVICE,
};
use crate::replication::SrdiEngine;
use crate::walk::{MessageListener, WalkEngine};

/// Primary key under which pipe claims live in the SRDI index.
pub const PIPE_PRIMARY_KEY: &str = "Pipe";
/// Attribute under which pipe ids are indexed.
pub const PIPE_ID_ATTR: &str = "Id";

/// How long a registered pipe's index claim stays valid (2 hours); the
/// push loop re-advertises well within this window.
const PIPE_CLAIM_EXPIRATION_MS: u64 = 2 * 60 * 60 * 1000;

/// Outstanding-forward history size; bounds the "did I forward this
/// query" memory used for NAK suppression.
const FORWARDED_HISTORY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Advertisements
// ─────────────────────────────────────────────────────────────────────────────

/// Describes a pipe endpoint. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeAdvertisement {
    /// Opaque pipe identifier.
    pub pipe_id: String,
    /// Delivery semantics of the pipe.
    pub pipe_type: PipeType,
    /// Human-readable name.
    pub name: String,
}

impl PipeAdvertisement {
    /// Create an advertisement, rejecting an empty pipe id.
    pub fn new(
        pipe_id: impl Into<String>,
        pipe_type: PipeType,
        name: impl Into<String>,
    ) -> Result<Self, DecodeError> {
        let pipe_id = pipe_id.into();
        if pipe_id.is_empty() {
            return Err(DecodeError::InvalidField("empty pipe id".into()));
        }
        Ok(Self {
            pipe_id,
            pipe_type,
            name: name.into(),
        })
    }

    /// Serialize to the opaque document form.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("advertisement serialization cannot fail")
    }

    /// Parse from the opaque document form.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let adv: Self = serde_json::from_slice(bytes)
            .map_err(|err| DecodeError::Malformed(err.to_string()))?;
        if adv.pipe_id.is_empty() {
            return Err(DecodeError::InvalidField("empty pipe id".into()));
        }
        Ok(adv)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Input pipes
// ─────────────────────────────────────────────────────────────────────────────

/// The receiving half of a queue-backed input pipe. Messages arrive in
/// the order they were pushed by any single sender.
pub struct PipeReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl PipeReceiver {
    /// Await the next message; `None` once the pipe is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// A locally registered input pipe backed by a bounded queue.
#[derive(Clone)]
pub struct InputPipe {
    adv: PipeAdvertisement,
    tx: mpsc::Sender<Vec<u8>>,
    push_timeout: Duration,
}

impl InputPipe {
    /// Create a pipe and its receiver with the given queue depth.
    pub fn new(
        adv: PipeAdvertisement,
        depth: usize,
        push_timeout: Duration,
    ) -> (Self, PipeReceiver) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (
            Self {
                adv,
                tx,
                push_timeout,
            },
            PipeReceiver { rx },
        )
    }

    /// The advertisement this pipe was registered under.
    pub fn advertisement(&self) -> &PipeAdvertisement {
        &self.adv
    }

    /// Push a message into the pipe's queue.
    ///
    /// Blocks up to the configured push timeout when the queue is full,
    /// then degrades to an error; a closed pipe errors immediately.
    pub async fn push(&self, payload: Vec<u8>) -> Result<(), SendError> {
        match tokio::time::timeout(self.push_timeout, self.tx.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_closed)) => Err(SendError::Transport(format!(
                "input pipe {} closed",
                self.adv.pipe_id
            ))),
            Err(_elapsed) => Err(SendError::Transport(format!(
                "input pipe {} queue full",
                self.adv.pipe_id
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolve listeners
// ─────────────────────────────────────────────────────────────────────────────

/// The two terminal outcomes a resolution listener can observe.
#[derive(Clone, Debug)]
pub enum PipeResolveEvent {
    /// A peer positively claims to host the pipe.
    Resolved {
        pipe_id: String,
        query_id: QueryId,
        peer: PeerAddr,
    },
    /// A peer answered negatively.
    Nak {
        pipe_id: String,
        query_id: QueryId,
        peer: PeerAddr,
    },
}

/// Receives resolution outcomes. Invoked at most once per response; a
/// listener registered under [`ANY_QUERY`] catches responses whose query
/// id has no specific listener.
#[async_trait]
pub trait PipeResolveListener: Send + Sync {
    async fn pipe_resolve_event(&self, event: PipeResolveEvent) -> anyhow::Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolver
// ─────────────────────────────────────────────────────────────────────────────

struct RegisteredPipe {
    pipe: InputPipe,
}

/// Resolves pipe ids to hosting peers across the overlay.
pub struct PipeResolver {
    cfg: OverlayConfig,
    engine: Arc<SrdiEngine>,
    peerview: Arc<PeerView>,
    walk: Arc<WalkEngine>,
    messenger: Arc<dyn Messenger>,
    registry: Mutex<HashMap<String, RegisteredPipe>>,
    /// Resolution listeners on their own lock, distinct from the data
    /// path, keyed by (pipe id, query id).
    listeners: Mutex<HashMap<(String, QueryId), Arc<dyn PipeResolveListener>>>,
    /// Queries this peer forwarded; an edge never NAKs those.
    forwarded: Mutex<LruCache<(String, QueryId), ()>>,
}

impl PipeResolver {
    /// Create a resolver wired to the engine, view, walk engine, and
    /// messenger.
    pub fn new(
        cfg: OverlayConfig,
        engine: Arc<SrdiEngine>,
        peerview: Arc<PeerView>,
        walk: Arc<WalkEngine>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        let cap = NonZeroUsize::new(FORWARDED_HISTORY).expect("history size is nonzero");
        Self {
            cfg,
            engine,
            peerview,
            walk,
            messenger,
            registry: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            forwarded: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Register a local input pipe.
    ///
    /// Returns false without touching anything if a pipe is already
    /// registered under that id — no silent overwrite. On success the
    /// pipe is recorded in the SRDI index and queued for advertisement.
    pub async fn register(&self, pipe: InputPipe) -> bool {
        let pipe_id = pipe.adv.pipe_id.clone();
        {
            let mut registry = self.registry.lock().await;
            if registry.contains_key(&pipe_id) {
                return false;
            }
            registry.insert(pipe_id.clone(), RegisteredPipe { pipe });
        }
        if let Err(err) = self
            .engine
            .publish(
                PIPE_PRIMARY_KEY,
                PIPE_ID_ATTR,
                &pipe_id,
                PIPE_CLAIM_EXPIRATION_MS,
            )
            .await
        {
            warn!(pipe = %pipe_id, %err, "failed to advertise registered pipe");
        }
        true
    }

    /// Unregister a pipe and withdraw its advertisement. Idempotent.
    pub async fn close(&self, pipe_id: &str) {
        let removed = {
            let mut registry = self.registry.lock().await;
            registry.remove(pipe_id).is_some()
        };
        if removed {
            self.engine
                .unpublish(PIPE_PRIMARY_KEY, PIPE_ID_ATTR, pipe_id)
                .await;
        }
    }

    /// Look up a pipe in the local registry only.
    pub async fn find_local(&self, pipe_id: &str) -> Option<PipeAdvertisement> {
        let registry = self.registry.lock().await;
        registry.get(pipe_id).map(|r| r.pipe.adv.clone())
    }

    /// Deliver a payload into a locally registered pipe's queue.
    pub async fn deliver_local(&self, pipe_id: &str, payload: Vec<u8>) -> Result<(), SendError> {
        let pipe = {
            let registry = self.registry.lock().await;
            registry.get(pipe_id).map(|r| r.pipe.clone())
        };
        match pipe {
            Some(pipe) => pipe.push(payload).await,
            None => Err(SendError::NoRoute(pipe_id.to_string())),
        }
    }

    /// Register a resolution listener for (pipe id, query id). Use
    /// [`ANY_QUERY`] to catch responses for any query on the pipe.
    pub async fn add_resolve_listener(
        &self,
        pipe_id: &str,
        query_id: QueryId,
        listener: Arc<dyn PipeResolveListener>,
    ) {
        let mut listeners = self.listeners.lock().await;
        listeners.insert((pipe_id.to_string(), query_id), listener);
    }

    /// Remove a resolution listener.
    pub async fn remove_resolve_listener(&self, pipe_id: &str, query_id: QueryId) {
        let mut listeners = self.listeners.lock().await;
        listeners.remove(&(pipe_id.to_string(), query_id));
    }

    /// Issue a resolution query for `adv`, restricted to
    /// `acceptable_peers` when non-empty.
    ///
    /// A pipe registered locally resolves immediately through the
    /// listener path with zero network sends. Otherwise the SRDI cache
    /// directs the query to known holders; on a cache miss the query goes
    /// to the consistent-hash replica peer if one exists, else it floods:
    /// a walk when this peer is a rendezvous, a local-segment propagate
    /// when it is an edge.
    ///
    /// Returns the query id responses will carry.
    pub async fn send_pipe_query(
        &self,
        adv: &PipeAdvertisement,
        acceptable_peers: &[PeerId],
        query_id: Option<QueryId>,
    ) -> QueryId {
        let query_id = query_id.unwrap_or_else(fresh_query_id);
        let self_addr = self.peerview.self_addr().clone();

        if self.find_local(&adv.pipe_id).await.is_some() {
            let event = PipeResolveEvent::Resolved {
                pipe_id: adv.pipe_id.clone(),
                query_id,
                peer: self_addr,
            };
            self.dispatch(&adv.pipe_id, query_id, event).await;
            return query_id;
        }

        let query = PipeQuery {
            pipe_id: adv.pipe_id.clone(),
            pipe_type: adv.pipe_type,
            query_id,
            hop_count: 0,
            requestor: self_addr.clone(),
            acceptable_peers: acceptable_peers.to_vec(),
        };

        // Directed path: SRDI-known holders intersected with the
        // acceptable set.
        let known = self
            .engine
            .index()
            .query(
                PIPE_PRIMARY_KEY,
                PIPE_ID_ATTR,
                &adv.pipe_id,
                self.cfg.query_threshold,
            )
            .await;
        let mut candidates = Vec::new();
        for peer in known {
            if peer == self_addr.id {
                continue;
            }
            if !acceptable_peers.is_empty() && !acceptable_peers.contains(&peer) {
                continue;
            }
            if let Some(addr) = self.peerview.lookup(&peer).await {
                candidates.push(addr);
            }
        }
        if !candidates.is_empty() {
            self.send_direct_query(&candidates, &query).await;
            return query_id;
        }

        // Replica hint: the peer the consistent hash says should hold
        // the claim.
        let expression = format!("{PIPE_PRIMARY_KEY}{PIPE_ID_ATTR}{}", adv.pipe_id);
        if let Some(replica) = self.engine.get_replica_peer(&expression).await {
            if replica.id != self_addr.id {
                self.send_direct_query(std::slice::from_ref(&replica), &query)
                    .await;
                return query_id;
            }
        }

        // Flood fallback.
        let payload = Payload::PipeQuery(query);
        let result = if self.peerview.role().await == RdvRole::Rendezvous {
            self.walk
                .walk(payload, None, PIPE_SERVICE, &adv.pipe_id, self.cfg.max_ttl)
                .await
        } else {
            self.walk
                .propagate(payload, None, PIPE_SERVICE, &adv.pipe_id, self.cfg.max_ttl)
                .await
        };
        if let Err(err) = result {
            warn!(pipe = %adv.pipe_id, %err, "pipe query flood failed");
        }
        query_id
    }

    /// Resolve synchronously with a caller-specified timeout.
    ///
    /// On expiry the internal listener is removed and
    /// [`ResolveError::Timeout`] returned; a NAK surfaces as
    /// [`ResolveError::Nak`], distinct from the timeout.
    pub async fn resolve_with_timeout(
        &self,
        adv: &PipeAdvertisement,
        acceptable_peers: &[PeerId],
        timeout: Duration,
    ) -> Result<PeerAddr, ResolveError> {
        struct OneshotListener {
            tx: Mutex<Option<oneshot::Sender<PipeResolveEvent>>>,
        }

        #[async_trait]
        impl PipeResolveListener for OneshotListener {
            async fn pipe_resolve_event(&self, event: PipeResolveEvent) -> anyhow::Result<()> {
                if let Some(tx) = self.tx.lock().await.take() {
                    let _ = tx.send(event);
                }
                Ok(())
            }
        }

        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(OneshotListener {
            tx: Mutex::new(Some(tx)),
        });

        let query_id = fresh_query_id();
        self.add_resolve_listener(&adv.pipe_id, query_id, listener)
            .await;
        self.send_pipe_query(adv, acceptable_peers, Some(query_id))
            .await;

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.remove_resolve_listener(&adv.pipe_id, query_id).await;

        match outcome {
            Ok(Ok(PipeResolveEvent::Resolved { peer, .. })) => Ok(peer),
            Ok(Ok(PipeResolveEvent::Nak { .. })) => Err(ResolveError::Nak(adv.pipe_id.clone())),
            Ok(Err(_dropped)) => Err(ResolveError::Closed),
            Err(_elapsed) => Err(ResolveError::Timeout(adv.pipe_id.clone())),
        }
    }

    /// Handle an incoming resolution query. Returns true when this peer
    /// answered or forwarded it; false asks the walk engine to keep the
    /// query moving.
    async fn handle_query(&self, query: &PipeQuery) -> bool {
        let self_addr = self.peerview.self_addr().clone();
        let acceptable_here =
            query.acceptable_peers.is_empty() || query.acceptable_peers.contains(&self_addr.id);

        if let Some(local) = self.find_local(&query.pipe_id).await {
            if local.pipe_type == query.pipe_type && acceptable_here {
                self.send_response(query, true, &self_addr).await;
                return true;
            }
        }

        // Directed forward to SRDI-known holders, excluding the
        // requestor itself.
        let known = self
            .engine
            .index()
            .query(
                PIPE_PRIMARY_KEY,
                PIPE_ID_ATTR,
                &query.pipe_id,
                self.cfg.query_threshold,
            )
            .await;
        let mut candidates = Vec::new();
        for peer in known {
            if peer == self_addr.id || peer == query.requestor.id {
                continue;
            }
            if !query.acceptable_peers.is_empty() && !query.acceptable_peers.contains(&peer) {
                continue;
            }
            if let Some(addr) = self.peerview.lookup(&peer).await {
                candidates.push(addr);
            }
        }
        if !candidates.is_empty() {
            {
                let mut forwarded = self.forwarded.lock().await;
                forwarded.put((query.pipe_id.clone(), query.query_id), ());
            }
            self.engine.forward_query(&candidates, query).await;
            return true;
        }

        if self.peerview.role().await == RdvRole::Rendezvous {
            // A rendezvous with no answer lets the walk continue instead
            // of responding.
            return false;
        }

        // An edge stays silent on queries it forwarded itself; answering
        // those would NAK its own outstanding forwards.
        let was_forwarder = {
            let forwarded = self.forwarded.lock().await;
            forwarded.contains(&(query.pipe_id.clone(), query.query_id))
        };
        if !was_forwarder {
            self.send_response(query, false, &self_addr).await;
            return true;
        }
        false
    }

    /// Handle an incoming resolution response: dispatch to the listener
    /// for (pipe, query), falling back to the pipe's any-query listener.
    async fn handle_response(&self, response: &PipeResponse) -> bool {
        let event = if response.found {
            PipeResolveEvent::Resolved {
                pipe_id: response.pipe_id.clone(),
                query_id: response.query_id,
                peer: response.peer.clone(),
            }
        } else {
            PipeResolveEvent::Nak {
                pipe_id: response.pipe_id.clone(),
                query_id: response.query_id,
                peer: response.peer.clone(),
            }
        };
        self.dispatch(&response.pipe_id, response.query_id, event)
            .await
    }

    async fn dispatch(&self, pipe_id: &str, query_id: QueryId, event: PipeResolveEvent) -> bool {
        let listener = {
            let listeners = self.listeners.lock().await;
            listeners
                .get(&(pipe_id.to_string(), query_id))
                .or_else(|| listeners.get(&(pipe_id.to_string(), ANY_QUERY)))
                .cloned()
        };
        match listener {
            Some(listener) => {
                if let Err(err) = listener.pipe_resolve_event(event).await {
                    warn!(pipe = pipe_id, %err, "pipe resolve listener failed");
                }
                true
            }
            None => {
                debug!(pipe = pipe_id, query_id, "response with no listener");
                false
            }
        }
    }

    async fn send_direct_query(&self, targets: &[PeerAddr], query: &PipeQuery) {
        // Directed delivery: TTL 1 keeps an addressed query from
        // re-entering the flood at the receiver.
        let header = WireHeader::fresh(
            fresh_message_id(),
            self.peerview.self_addr().id,
            1,
            PIPE_SERVICE,
            &query.pipe_id,
        );
        let msg = OverlayMessage {
            header,
            credential: None,
            payload: Payload::PipeQuery(query.clone()),
        };
        for target in targets {
            if let Err(err) = self.messenger.send(target, &msg).await {
                debug!(peer = %target.short(), %err, "directed pipe query failed");
            }
        }
    }

    async fn send_response(&self, query: &PipeQuery, found: bool, self_addr: &PeerAddr) {
        let response = PipeResponse {
            pipe_id: query.pipe_id.clone(),
            query_id: query.query_id,
            pipe_type: query.pipe_type,
            peer: self_addr.clone(),
            found,
        };
        let header = WireHeader::fresh(fresh_message_id(), self_addr.id, 1, PIPE_SERVICE, &query.pipe_id);
        let msg = OverlayMessage {
            header,
            credential: None,
            payload: Payload::PipeResponse(response),
        };
        if let Err(err) = self.messenger.send(&query.requestor, &msg).await {
            debug!(
                peer = %query.requestor.short(),
                %err,
                "pipe response send failed"
            );
        }
    }
}

/// Wire the resolver into the walk engine's delivery path.
#[async_trait]
impl MessageListener for PipeResolver {
    async fn on_message(&self, msg: &OverlayMessage) -> anyhow::Result<bool> {
        match &msg.payload {
            Payload::PipeQuery(query) => Ok(self.handle_query(query).await),
            Payload::PipeResponse(response) => Ok(self.handle_response(response).await),
            _ => Ok(false),
        }
    }
}

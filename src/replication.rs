//! SRDI protocol engine: index replication, query forwarding, and the
//! background push loop.
//!
//! Replica placement uses consistent hashing over the globally sorted
//! peer-view: an entry's `(primary key + attribute + value)` expression is
//! hashed to a 256-bit digest and mapped proportionally into
//! `[0, view size)`. Because every peer sorts the view identically, every
//! peer computes the same home for a given expression — eventual global
//! agreement on "who holds the index for key K" with no coordination.
//!
//! The push loop alternates between waiting for rendezvous connectivity
//! and pushing the local publication ledger — everything after a
//! reconnect, deltas otherwise. Membership events wake the loop early.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::OverlayConfig;
use crate::id::{blake3_digest, fresh_message_id, PeerAddr, PeerId};
use crate::messenger::Messenger;
use crate::peerview::{PeerView, RdvRole, RendezvousEvent, RendezvousListener};
use crate::protocol::{
    OverlayMessage, Payload, PipeQuery, SrdiPush, WireHeader, WireSrdiEntry, SRDI_SERVICE,
};
use crate::srdi::SrdiIndex;

/// Map a 256-bit digest proportionally into `[0, size)`.
///
/// Computes `⌊digest · size / 2^256⌋` exactly via base-256 long
/// multiplication, so every peer derives the same position from the same
/// digest and view size regardless of platform.
fn replica_position(digest: &[u8; 32], size: usize) -> usize {
    debug_assert!(size > 0);
    let n = size as u64;
    let mut product = [0u8; 40];
    let mut carry: u128 = 0;
    for i in (0..32).rev() {
        let v = digest[i] as u128 * n as u128 + carry;
        product[i + 8] = (v & 0xff) as u8;
        carry = v >> 8;
    }
    for i in (0..8).rev() {
        product[i] = (carry & 0xff) as u8;
        carry >>= 8;
    }
    let mut hi = [0u8; 8];
    hi.copy_from_slice(&product[0..8]);
    // The quotient is < size by construction; the clamp only guards the
    // all-ones digest edge in case of a future width change.
    (u64::from_be_bytes(hi) as usize).min(size - 1)
}

/// A locally published index claim awaiting replication.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Publication {
    primary_key: String,
    attribute: String,
    value: String,
}

struct PushState {
    /// Whether at least one rendezvous is currently reachable.
    connected: bool,
    /// Forces the next push to cover the full ledger instead of deltas.
    republish: bool,
    /// Publications touched since the last push.
    delta: Vec<Publication>,
}

/// The SRDI protocol engine.
pub struct SrdiEngine {
    cfg: OverlayConfig,
    index: Arc<SrdiIndex>,
    peerview: Arc<PeerView>,
    messenger: Arc<dyn Messenger>,
    /// Local publication ledger: claim -> relative expiration ms.
    published: Mutex<HashMap<Publication, u64>>,
    state: Mutex<PushState>,
    wake: Notify,
    stopped: AtomicBool,
    pushes: AtomicU64,
}

impl SrdiEngine {
    /// Create an engine over the given index, view, and messenger.
    pub fn new(
        cfg: OverlayConfig,
        index: Arc<SrdiIndex>,
        peerview: Arc<PeerView>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            cfg,
            index,
            peerview,
            messenger,
            published: Mutex::new(HashMap::new()),
            state: Mutex::new(PushState {
                connected: false,
                republish: true,
                delta: Vec::new(),
            }),
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
            pushes: AtomicU64::new(0),
        }
    }

    /// The local SRDI index this engine feeds.
    pub fn index(&self) -> &Arc<SrdiIndex> {
        &self.index
    }

    /// Number of pushes performed since startup.
    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    /// Record a local resource claim: it becomes queryable locally at
    /// once and is included in the next push (delta or full).
    pub async fn publish(
        &self,
        primary_key: &str,
        attribute: &str,
        value: &str,
        expiration_rel: u64,
    ) -> anyhow::Result<()> {
        let self_id = self.peerview.self_addr().id;
        self.index
            .add(primary_key, attribute, value, self_id, expiration_rel)
            .await?;

        let publication = Publication {
            primary_key: primary_key.to_string(),
            attribute: attribute.to_string(),
            value: value.to_string(),
        };
        {
            let mut published = self.published.lock().await;
            published.insert(publication.clone(), expiration_rel);
        }
        {
            let mut state = self.state.lock().await;
            state.delta.push(publication);
        }
        Ok(())
    }

    /// Drop a local claim from the ledger. The already replicated copies
    /// age out on their own expirations.
    pub async fn unpublish(&self, primary_key: &str, attribute: &str, value: &str) {
        let publication = Publication {
            primary_key: primary_key.to_string(),
            attribute: attribute.to_string(),
            value: value.to_string(),
        };
        let mut published = self.published.lock().await;
        published.remove(&publication);
    }

    /// Deterministically select the peer responsible for `expression`
    /// from the current peer-view.
    ///
    /// Returns `None` when the view is smaller than the replication
    /// threshold — a tiny view makes replication churn pointless.
    pub async fn get_replica_peer(&self, expression: &str) -> Option<PeerAddr> {
        let view = self.peerview.global_view().await;
        if view.len() < self.cfg.replication_threshold {
            return None;
        }
        let digest = blake3_digest(expression.as_bytes());
        let position = replica_position(&digest, view.len());
        Some(view[position].clone())
    }

    /// Re-bucket an incoming push across replica peers.
    ///
    /// Each entry's expression is hashed against the current view and the
    /// entries are grouped per destination into new outgoing pushes. A
    /// peer never replicates to itself. Skipped entirely when the push's
    /// replication budget is spent, this peer is an edge, or the view is
    /// below the replication threshold.
    pub async fn replicate_entries(&self, push: &SrdiPush) {
        if push.ttl < 1 {
            return;
        }
        if self.peerview.role().await != RdvRole::Rendezvous {
            return;
        }
        let view = self.peerview.global_view().await;
        if view.len() < self.cfg.replication_threshold {
            return;
        }

        let self_id = self.peerview.self_addr().id;
        let mut buckets: HashMap<PeerId, (PeerAddr, Vec<WireSrdiEntry>)> = HashMap::new();
        for entry in &push.entries {
            let expression = format!("{}{}{}", push.primary_key, entry.key, entry.value);
            let digest = blake3_digest(expression.as_bytes());
            let dest = &view[replica_position(&digest, view.len())];
            if dest.id == self_id {
                continue;
            }
            buckets
                .entry(dest.id)
                .or_insert_with(|| (dest.clone(), Vec::new()))
                .1
                .push(entry.clone());
        }

        for (_, (dest, entries)) in buckets {
            let outgoing = SrdiPush {
                primary_key: push.primary_key.clone(),
                owner: push.owner,
                ttl: push.ttl - 1,
                entries,
            };
            self.send_push(&dest, outgoing).await;
        }
    }

    /// Forward a pipe query toward candidate peers.
    ///
    /// The hop count is incremented first; a query past the hop limit is
    /// silently dropped. A candidate set larger than the fan-out cap is
    /// replaced by a uniform random subset of that size.
    pub async fn forward_query(&self, candidates: &[PeerAddr], query: &PipeQuery) {
        let mut query = query.clone();
        query.hop_count += 1;
        if query.hop_count > self.cfg.max_forward_hops {
            debug!(
                pipe = %query.pipe_id,
                hops = query.hop_count,
                "dropping over-forwarded query"
            );
            return;
        }

        let targets: Vec<PeerAddr> = if candidates.len() > self.cfg.forward_fanout {
            candidates
                .choose_multiple(&mut rand::thread_rng(), self.cfg.forward_fanout)
                .cloned()
                .collect()
        } else {
            candidates.to_vec()
        };

        let self_id = self.peerview.self_addr().id;
        // Directed delivery: TTL 1 so receivers never re-flood a message
        // that was addressed to them specifically.
        let header = WireHeader::fresh(
            fresh_message_id(),
            self_id,
            1,
            crate::protocol::PIPE_SERVICE,
            &query.pipe_id,
        );
        let msg = OverlayMessage {
            header,
            credential: None,
            payload: Payload::PipeQuery(query),
        };
        for target in targets {
            if target.id == self_id {
                continue;
            }
            if let Err(err) = self.messenger.send(&target, &msg).await {
                debug!(peer = %target.short(), %err, "query forward failed");
            }
        }
    }

    /// Ingest a push received from the wire: index every entry under its
    /// owner, then keep the batch moving across replica peers.
    pub async fn handle_push(&self, push: &SrdiPush) {
        for entry in &push.entries {
            if let Err(err) = self
                .index
                .add(
                    &push.primary_key,
                    &entry.key,
                    &entry.value,
                    push.owner,
                    entry.expiration,
                )
                .await
            {
                debug!(key = %entry.key, %err, "skipping unusable pushed entry");
            }
        }
        self.replicate_entries(push).await;
    }

    /// One push-loop iteration: select full ledger or delta, group by
    /// primary key, and hand each batch to its destination.
    ///
    /// An edge pushes to its rendezvous; a rendezvous feeds the batches
    /// straight into replica placement.
    pub async fn push_once(&self) -> anyhow::Result<()> {
        let (full, delta) = {
            let mut state = self.state.lock().await;
            let full = state.republish;
            state.republish = false;
            let delta = std::mem::take(&mut state.delta);
            (full, delta)
        };

        let selected: Vec<(Publication, u64)> = {
            let published = self.published.lock().await;
            if full {
                published
                    .iter()
                    .map(|(p, exp)| (p.clone(), *exp))
                    .collect()
            } else {
                delta
                    .into_iter()
                    .filter_map(|p| published.get(&p).map(|exp| (p.clone(), *exp)))
                    .collect()
            }
        };
        if selected.is_empty() {
            return Ok(());
        }

        let self_id = self.peerview.self_addr().id;
        let mut batches: HashMap<String, Vec<WireSrdiEntry>> = HashMap::new();
        for (publication, expiration) in selected {
            batches
                .entry(publication.primary_key.clone())
                .or_default()
                .push(WireSrdiEntry {
                    key: publication.attribute,
                    value: publication.value,
                    expiration,
                });
        }

        let is_rdv = self.peerview.role().await == RdvRole::Rendezvous;
        for (primary_key, entries) in batches {
            let push = SrdiPush {
                primary_key,
                owner: self_id,
                ttl: self.cfg.max_forward_hops,
                entries,
            };
            if is_rdv {
                self.replicate_entries(&push).await;
            } else if let Some(rdv) = self.connected_rendezvous().await {
                self.send_push(&rdv, push).await;
            }
        }
        self.pushes.fetch_add(1, Ordering::Relaxed);
        if full {
            info!("completed full SRDI republish");
        }
        Ok(())
    }

    /// Run the push loop until [`SrdiEngine::stop`].
    ///
    /// The loop alternates between two waits: for rendezvous connectivity
    /// when disconnected, and for the push interval (or an early wake
    /// from a membership event) when connected. A failed push is logged
    /// and retried on the next cycle; it never terminates the loop.
    pub fn spawn_push_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = engine.cfg.push_interval;
        tokio::spawn(async move {
            loop {
                let _ = tokio::time::timeout(interval, engine.wake.notified()).await;
                if engine.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let ready = {
                    let state = engine.state.lock().await;
                    state.connected
                } || engine.peerview.role().await == RdvRole::Rendezvous;
                if !ready {
                    continue;
                }
                if let Err(err) = engine.push_once().await {
                    warn!(%err, "SRDI push failed; will retry next cycle");
                }
            }
            debug!("SRDI push loop stopped");
        })
    }

    /// Run periodic index garbage collection until [`SrdiEngine::stop`].
    pub fn spawn_gc_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = engine.cfg.srdi_gc_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if engine.stopped.load(Ordering::SeqCst) {
                    break;
                }
                engine.index.garbage_collect().await;
            }
            debug!("SRDI gc loop stopped");
        })
    }

    /// Wake the loops and make them exit.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    async fn connected_rendezvous(&self) -> Option<PeerAddr> {
        self.peerview.elements().await.first().map(|e| e.peer.clone())
    }

    async fn send_push(&self, dest: &PeerAddr, push: SrdiPush) {
        // Directed delivery: TTL 1; onward movement happens through
        // replica re-bucketing, not wire flooding.
        let header = WireHeader::fresh(
            fresh_message_id(),
            self.peerview.self_addr().id,
            1,
            SRDI_SERVICE,
            &push.primary_key,
        );
        let msg = OverlayMessage {
            header,
            credential: None,
            payload: Payload::SrdiPush(push),
        };
        if let Err(err) = self.messenger.send(dest, &msg).await {
            debug!(peer = %dest.short(), %err, "push send failed");
        }
    }
}

/// Membership events drive the push state machine: connects force a full
/// republish, disconnects park the loop until connectivity returns, and a
/// client going away purges its index entries at once.
#[async_trait]
impl RendezvousListener for SrdiEngine {
    async fn rendezvous_event(&self, event: RendezvousEvent) -> anyhow::Result<()> {
        match event {
            RendezvousEvent::Connect(_) | RendezvousEvent::Reconnect(_) => {
                let mut state = self.state.lock().await;
                state.connected = true;
                state.republish = true;
                drop(state);
                self.wake.notify_waiters();
            }
            RendezvousEvent::RdvDisconnect(peer) | RendezvousEvent::RdvFailed(peer) => {
                // Entries the departed rendezvous owned are masked now and
                // swept on the next gc pass.
                self.index.remove(peer).await;
                let mut state = self.state.lock().await;
                if self.peerview.rendezvous_count().await == 0 {
                    state.connected = false;
                }
                state.republish = true;
            }
            RendezvousEvent::ClientDisconnect(peer) | RendezvousEvent::ClientFailed(peer) => {
                // A departed client's claims are purged immediately.
                self.index.remove(peer).await;
                self.index.garbage_collect().await;
            }
            RendezvousEvent::BecameRendezvous | RendezvousEvent::BecameEdge => {
                let mut state = self.state.lock().await;
                state.republish = true;
                drop(state);
                self.wake.notify_waiters();
            }
            other => {
                // Tolerate variants this engine does not care about.
                debug!(?other, "ignoring membership event");
            }
        }
        Ok(())
    }
}

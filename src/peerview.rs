//! Peer-view and rendezvous membership.
//!
//! Maintains the locally known, eventually consistent set of active
//! rendezvous peers, tracks client connection leases, fans out membership
//! events to registered listeners, and runs the promotion/demotion
//! watchdog that moves this peer between the edge and rendezvous roles.
//!
//! The peer-view's global ordering is load-bearing: every peer that
//! derives the same view must order it identically so the consistent-hash
//! replica mapping agrees across the overlay. Ordering is by raw peer-id
//! bytes, which matches ordering the hex form as an opaque string.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::OverlayConfig;
use crate::id::{PeerAddr, PeerId};
use crate::store::now_ms;

/// The role this peer currently plays in the overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RdvRole {
    /// Leaf peer: consumes rendezvous services, holds no index replicas.
    Edge,
    /// Super-peer: indexes other peers' SRDI entries and participates in
    /// the peer-view.
    Rendezvous,
}

/// Membership changes delivered to [`RendezvousListener`]s.
///
/// The enum is non-exhaustive: consumers must tolerate variants added in
/// later protocol revisions by logging and ignoring them.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum RendezvousEvent {
    /// A rendezvous peer became reachable.
    Connect(PeerId),
    /// A previously known rendezvous peer re-announced itself.
    Reconnect(PeerId),
    /// A client obtained a lease from us.
    ClientConnect(PeerId),
    /// A known client renewed its lease.
    ClientReconnect(PeerId),
    /// This peer was promoted to rendezvous.
    BecameRendezvous,
    /// This peer was demoted to edge.
    BecameEdge,
    /// A rendezvous peer failed without disconnecting cleanly.
    RdvFailed(PeerId),
    /// A rendezvous peer disconnected.
    RdvDisconnect(PeerId),
    /// A client failed without disconnecting cleanly.
    ClientFailed(PeerId),
    /// A client disconnected or its lease lapsed.
    ClientDisconnect(PeerId),
}

/// Receives membership events.
///
/// Errors are caught and logged at the dispatch site; a failing listener
/// never blocks delivery to the others.
#[async_trait]
pub trait RendezvousListener: Send + Sync {
    async fn rendezvous_event(&self, event: RendezvousEvent) -> anyhow::Result<()>;
}

/// One known rendezvous peer.
#[derive(Clone, Debug)]
pub struct PeerViewElement {
    /// Identity and route hint.
    pub peer: PeerAddr,
    /// When we last heard from this peer, ms since the Unix epoch.
    pub last_seen: u64,
    /// The role the peer advertised for itself.
    pub role_hint: RdvRole,
}

struct ClientLease {
    peer: PeerAddr,
    deadline: u64,
}

struct ViewState {
    role: RdvRole,
    /// Observed rendezvous peers, keyed (and therefore ordered) by id.
    view: BTreeMap<PeerId, PeerViewElement>,
    /// Connected clients and their leases.
    clients: HashMap<PeerId, ClientLease>,
}

/// The membership component: peer-view, leases, role control.
pub struct PeerView {
    self_addr: PeerAddr,
    cfg: OverlayConfig,
    state: Mutex<ViewState>,
    /// Listener registry on its own lock so registration never contends
    /// with the data path.
    listeners: Mutex<Vec<Arc<dyn RendezvousListener>>>,
    wake: Notify,
    stopped: AtomicBool,
}

impl PeerView {
    /// Create a peer-view starting in the given role.
    pub fn new(self_addr: PeerAddr, cfg: OverlayConfig, role: RdvRole) -> Self {
        Self {
            self_addr,
            cfg,
            state: Mutex::new(ViewState {
                role,
                view: BTreeMap::new(),
                clients: HashMap::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// This peer's identity and route hint.
    pub fn self_addr(&self) -> &PeerAddr {
        &self.self_addr
    }

    /// Register a membership listener.
    pub async fn add_listener(&self, listener: Arc<dyn RendezvousListener>) {
        let mut listeners = self.listeners.lock().await;
        listeners.push(listener);
    }

    /// Current role.
    pub async fn role(&self) -> RdvRole {
        let state = self.state.lock().await;
        state.role
    }

    /// Whether this peer currently acts as a rendezvous.
    pub async fn is_rendezvous(&self) -> bool {
        self.role().await == RdvRole::Rendezvous
    }

    /// Number of reachable rendezvous peers (excluding self).
    pub async fn rendezvous_count(&self) -> usize {
        let state = self.state.lock().await;
        state.view.len()
    }

    /// Number of clients holding a live lease.
    pub async fn client_count(&self) -> usize {
        let now = now_ms();
        let state = self.state.lock().await;
        state.clients.values().filter(|l| l.deadline > now).count()
    }

    /// Look up the route hint for a peer we know about, whether as a
    /// rendezvous in the view or as a leased client.
    pub async fn lookup(&self, peer: &PeerId) -> Option<PeerAddr> {
        if *peer == self.self_addr.id {
            return Some(self.self_addr.clone());
        }
        let state = self.state.lock().await;
        if let Some(element) = state.view.get(peer) {
            return Some(element.peer.clone());
        }
        state.clients.get(peer).map(|lease| lease.peer.clone())
    }

    /// The globally ordered peer-view: observed rendezvous peers plus
    /// self when this peer is a rendezvous, deduplicated and sorted by
    /// peer id. Two peers observing the same membership derive the same
    /// ordering, which the replica mapping depends on.
    pub async fn global_view(&self) -> Vec<PeerAddr> {
        let state = self.state.lock().await;
        let mut peers: Vec<PeerAddr> = state.view.values().map(|e| e.peer.clone()).collect();
        if state.role == RdvRole::Rendezvous && !state.view.contains_key(&self.self_addr.id) {
            peers.push(self.self_addr.clone());
        }
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers.dedup_by(|a, b| a.id == b.id);
        peers
    }

    /// Snapshot of the observed walk view with bookkeeping fields.
    pub async fn elements(&self) -> Vec<PeerViewElement> {
        let state = self.state.lock().await;
        state.view.values().cloned().collect()
    }

    /// Record a rendezvous peer as reachable, emitting `Connect` for a
    /// new peer or `Reconnect` for a known one.
    pub async fn observe_rendezvous(&self, peer: PeerAddr) {
        if peer.id == self.self_addr.id {
            return;
        }
        let event = {
            let mut state = self.state.lock().await;
            let known = state.view.contains_key(&peer.id);
            state.view.insert(
                peer.id,
                PeerViewElement {
                    peer: peer.clone(),
                    last_seen: now_ms(),
                    role_hint: RdvRole::Rendezvous,
                },
            );
            if known {
                RendezvousEvent::Reconnect(peer.id)
            } else {
                RendezvousEvent::Connect(peer.id)
            }
        };
        self.dispatch(event).await;
        self.wake.notify_waiters();
    }

    /// Seed the view from bootstrap rendezvous addresses.
    pub async fn seed(&self, peers: Vec<PeerAddr>) {
        for peer in peers {
            self.observe_rendezvous(peer).await;
        }
    }

    /// Record a clean disconnect of a rendezvous peer.
    pub async fn rdv_disconnected(&self, peer: PeerId) {
        let removed = {
            let mut state = self.state.lock().await;
            state.view.remove(&peer).is_some()
        };
        if removed {
            self.dispatch(RendezvousEvent::RdvDisconnect(peer)).await;
            self.wake.notify_waiters();
        }
    }

    /// Record an unclean failure of a rendezvous peer.
    pub async fn rdv_failed(&self, peer: PeerId) {
        let removed = {
            let mut state = self.state.lock().await;
            state.view.remove(&peer).is_some()
        };
        if removed {
            self.dispatch(RendezvousEvent::RdvFailed(peer)).await;
            self.wake.notify_waiters();
        }
    }

    /// Grant or renew a client lease.
    pub async fn client_connected(&self, peer: PeerAddr) {
        let deadline = now_ms().saturating_add(self.cfg.client_lease.as_millis() as u64);
        let id = peer.id;
        let event = {
            let mut state = self.state.lock().await;
            let known = state
                .clients
                .insert(id, ClientLease { peer, deadline })
                .is_some();
            if known {
                RendezvousEvent::ClientReconnect(id)
            } else {
                RendezvousEvent::ClientConnect(id)
            }
        };
        self.dispatch(event).await;
    }

    /// Record a clean client disconnect.
    pub async fn client_disconnected(&self, peer: PeerId) {
        let removed = {
            let mut state = self.state.lock().await;
            state.clients.remove(&peer).is_some()
        };
        if removed {
            self.dispatch(RendezvousEvent::ClientDisconnect(peer)).await;
        }
    }

    /// Record an unclean client failure.
    pub async fn client_failed(&self, peer: PeerId) {
        let removed = {
            let mut state = self.state.lock().await;
            state.clients.remove(&peer).is_some()
        };
        if removed {
            self.dispatch(RendezvousEvent::ClientFailed(peer)).await;
        }
    }

    /// One watchdog evaluation: expire client leases, then apply the
    /// promotion/demotion rules.
    ///
    /// - Edge with zero reachable rendezvous: promote.
    /// - Rendezvous with a large view and zero clients: demote.
    /// - Rendezvous with a large view and few clients: demote with the
    ///   configured probability, damping synchronized mass demotion.
    pub async fn watchdog_tick(&self) {
        let now = now_ms();

        // Lease expiry first so the demotion rules see fresh counts.
        let lapsed: Vec<PeerId> = {
            let mut state = self.state.lock().await;
            let lapsed: Vec<PeerId> = state
                .clients
                .iter()
                .filter(|(_, lease)| lease.deadline <= now)
                .map(|(peer, _)| *peer)
                .collect();
            for peer in &lapsed {
                state.clients.remove(peer);
            }
            lapsed
        };
        for peer in lapsed {
            debug!(peer = %hex::encode(&peer[..6]), "client lease lapsed");
            self.dispatch(RendezvousEvent::ClientDisconnect(peer)).await;
        }

        let (role, view_size, clients) = {
            let state = self.state.lock().await;
            let mut view_size = state.view.len();
            if state.role == RdvRole::Rendezvous {
                view_size += 1; // self participates in the view
            }
            (state.role, view_size, state.clients.len())
        };

        match role {
            RdvRole::Edge => {
                if self.rendezvous_count().await == 0 {
                    info!("no reachable rendezvous; promoting self");
                    self.promote().await;
                }
            }
            RdvRole::Rendezvous => {
                if view_size > self.cfg.many_peers_threshold {
                    if clients == 0 {
                        info!(view_size, "overprovisioned with no clients; demoting");
                        self.demote().await;
                    } else if clients < self.cfg.few_clients_threshold {
                        let roll: f64 = rand::thread_rng().gen();
                        if roll < self.cfg.demotion_probability {
                            info!(view_size, clients, "overprovisioned; demoting (damped)");
                            self.demote().await;
                        }
                    }
                }
            }
        }
    }

    /// Run the watchdog until [`PeerView::stop`], evaluating every
    /// configured interval or earlier when a membership change wakes it.
    pub fn spawn_watchdog(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let view = Arc::clone(self);
        let interval = view.cfg.watchdog_interval;
        tokio::spawn(async move {
            loop {
                let _ = tokio::time::timeout(interval, view.wake.notified()).await;
                if view.stopped.load(Ordering::SeqCst) {
                    break;
                }
                view.watchdog_tick().await;
            }
            debug!("membership watchdog stopped");
        })
    }

    /// Wake the watchdog and make its loop exit.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    async fn promote(&self) {
        {
            let mut state = self.state.lock().await;
            if state.role == RdvRole::Rendezvous {
                return;
            }
            state.role = RdvRole::Rendezvous;
        }
        self.dispatch(RendezvousEvent::BecameRendezvous).await;
    }

    async fn demote(&self) {
        {
            let mut state = self.state.lock().await;
            if state.role == RdvRole::Edge {
                return;
            }
            state.role = RdvRole::Edge;
        }
        self.dispatch(RendezvousEvent::BecameEdge).await;
    }

    async fn dispatch(&self, event: RendezvousEvent) {
        let listeners: Vec<Arc<dyn RendezvousListener>> = {
            let registry = self.listeners.lock().await;
            registry.clone()
        };
        for listener in listeners {
            if let Err(err) = listener.rendezvous_event(event.clone()).await {
                // A listener that fails did not handle the event; the
                // remaining listeners still get it.
                warn!(?event, %err, "rendezvous listener failed");
            }
        }
    }
}

//! The assembled overlay node.
//!
//! [`OverlayNode`] wires the components together — advertisement cache,
//! SRDI index and engine, peer-view, walk engine, pipe resolver — hooks
//! the wire services into the walk engine's delivery path, and owns the
//! background loops (store GC, index GC, SRDI push, membership watchdog).
//!
//! Applications use this facade rather than the components directly. The
//! node is `Arc`-friendly and can be shared between tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::OverlayConfig;
use crate::error::StoreError;
use crate::id::PeerAddr;
use crate::messenger::Messenger;
use crate::peerview::{PeerView, RdvRole};
use crate::pipe::{PipeAdvertisement, PipeResolver};
use crate::protocol::{Payload, MEMBERSHIP_SERVICE, PIPE_SERVICE, SRDI_SERVICE};
use crate::replication::SrdiEngine;
use crate::srdi::SrdiIndex;
use crate::store::ExpiringStore;
use crate::walk::{MessageListener, WalkEngine, WalkStats};

/// Attribute under which cached advertisements are indexed by name.
const ADV_NAME_INDEX: &str = "AdvName";

/// Snapshot of node state for telemetry and debugging.
#[derive(Clone, Debug, Default)]
pub struct OverlayStats {
    /// Whether this peer is currently a rendezvous.
    pub rendezvous: bool,
    /// Observed rendezvous peers (excluding self).
    pub view_size: usize,
    /// Clients holding a live lease.
    pub clients: usize,
    /// Live claims in the SRDI index.
    pub srdi_entries: usize,
    /// Live records in the advertisement cache.
    pub cached_records: usize,
    /// SRDI pushes performed since startup.
    pub pushes: u64,
    /// Walk engine counters.
    pub walk: WalkStats,
}

/// Wire glue: SRDI traffic into the engine.
struct SrdiService {
    engine: Arc<SrdiEngine>,
}

#[async_trait]
impl MessageListener for SrdiService {
    async fn on_message(&self, msg: &crate::protocol::OverlayMessage) -> anyhow::Result<bool> {
        match &msg.payload {
            Payload::SrdiPush(push) => {
                self.engine.handle_push(push).await;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Wire glue: membership greetings into the peer-view.
struct MembershipService {
    peerview: Arc<PeerView>,
}

#[async_trait]
impl MessageListener for MembershipService {
    async fn on_message(&self, msg: &crate::protocol::OverlayMessage) -> anyhow::Result<bool> {
        match &msg.payload {
            Payload::ProbeGreeting(greeting) => {
                if greeting.rendezvous {
                    self.peerview.observe_rendezvous(greeting.peer.clone()).await;
                } else if self.peerview.is_rendezvous().await {
                    self.peerview.client_connected(greeting.peer.clone()).await;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// A fully wired overlay node.
pub struct OverlayNode {
    cfg: OverlayConfig,
    peerview: Arc<PeerView>,
    cache: Arc<ExpiringStore>,
    engine: Arc<SrdiEngine>,
    walk: Arc<WalkEngine>,
    resolver: Arc<PipeResolver>,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl OverlayNode {
    /// Assemble a node over the given messenger, starting in `role`.
    pub async fn new(
        self_addr: PeerAddr,
        cfg: OverlayConfig,
        messenger: Arc<dyn Messenger>,
        role: RdvRole,
    ) -> Arc<Self> {
        let peerview = Arc::new(PeerView::new(self_addr, cfg.clone(), role));
        let index = Arc::new(SrdiIndex::new());
        let engine = Arc::new(SrdiEngine::new(
            cfg.clone(),
            index,
            Arc::clone(&peerview),
            Arc::clone(&messenger),
        ));
        let walk = Arc::new(WalkEngine::new(
            cfg.clone(),
            Arc::clone(&peerview),
            Arc::clone(&messenger),
        ));
        let resolver = Arc::new(PipeResolver::new(
            cfg.clone(),
            Arc::clone(&engine),
            Arc::clone(&peerview),
            Arc::clone(&walk),
            Arc::clone(&messenger),
        ));

        // Membership events drive the SRDI push state machine.
        peerview
            .add_listener(Arc::clone(&engine) as Arc<dyn crate::peerview::RendezvousListener>)
            .await;

        // Wire services into the delivery path.
        walk.register_listener(
            SRDI_SERVICE,
            "",
            Arc::new(SrdiService {
                engine: Arc::clone(&engine),
            }),
        )
        .await;
        walk.register_listener(
            MEMBERSHIP_SERVICE,
            "",
            Arc::new(MembershipService {
                peerview: Arc::clone(&peerview),
            }),
        )
        .await;
        walk.register_listener(
            PIPE_SERVICE,
            "",
            Arc::clone(&resolver) as Arc<dyn MessageListener>,
        )
        .await;

        Arc::new(Self {
            cfg,
            peerview,
            cache: Arc::new(ExpiringStore::new()),
            engine,
            walk,
            resolver,
            tasks: tokio::sync::Mutex::new(Vec::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The membership component.
    pub fn peerview(&self) -> &Arc<PeerView> {
        &self.peerview
    }

    /// The SRDI engine.
    pub fn engine(&self) -> &Arc<SrdiEngine> {
        &self.engine
    }

    /// The walk engine.
    pub fn walk(&self) -> &Arc<WalkEngine> {
        &self.walk
    }

    /// The pipe resolver.
    pub fn resolver(&self) -> &Arc<PipeResolver> {
        &self.resolver
    }

    /// The local advertisement cache.
    pub fn cache(&self) -> &Arc<ExpiringStore> {
        &self.cache
    }

    /// Cache an advertisement document locally, indexed by its name.
    pub async fn cache_advertisement(
        &self,
        adv: &PipeAdvertisement,
        lifetime_rel: u64,
        expiration_rel: u64,
    ) -> Result<(), StoreError> {
        self.cache
            .put(
                &adv.pipe_id,
                &[(ADV_NAME_INDEX.to_string(), adv.name.to_uppercase())],
                adv.encode(),
                lifetime_rel,
                expiration_rel,
            )
            .await?;
        Ok(())
    }

    /// Fetch a cached advertisement by pipe id.
    pub async fn cached_advertisement(&self, pipe_id: &str) -> Option<PipeAdvertisement> {
        let record = self.cache.get(pipe_id).await?;
        match PipeAdvertisement::decode(&record.payload) {
            Ok(adv) => Some(adv),
            Err(err) => {
                debug!(pipe_id, %err, "dropping undecodable cached advertisement");
                self.cache.delete(pipe_id).await;
                None
            }
        }
    }

    /// Spawn the background loops: cache GC, index GC, SRDI push, and the
    /// membership watchdog.
    pub async fn spawn_background(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        tasks.push(self.peerview.spawn_watchdog());
        tasks.push(self.engine.spawn_push_loop());
        tasks.push(self.engine.spawn_gc_loop());

        let cache = Arc::clone(&self.cache);
        let stopped = Arc::clone(&self.stopped);
        let interval = self.cfg.store_gc_interval;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                cache.garbage_collect().await;
            }
            debug!("cache gc loop stopped");
        }));
    }

    /// Stop all background loops cooperatively.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.engine.stop();
        self.peerview.stop();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Snapshot of current node state for telemetry.
    pub async fn stats(&self) -> OverlayStats {
        OverlayStats {
            rendezvous: self.peerview.is_rendezvous().await,
            view_size: self.peerview.rendezvous_count().await,
            clients: self.peerview.client_count().await,
            srdi_entries: self.engine.index().entry_count().await,
            cached_records: self.cache.len().await,
            pushes: self.engine.push_count(),
            walk: self.walk.stats(),
        }
    }
}

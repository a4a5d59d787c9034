//! Propagation and walk engine: TTL-bounded, loop-detected,
//! duplicate-suppressed message flooding.
//!
//! Two delivery primitives share the machinery:
//!
//! - [`WalkEngine::propagate`] floods to every reachable peer on the
//!   local segment — expensive, single-hop semantics; each receiver
//!   decides whether to re-propagate.
//! - [`WalkEngine::walk`] floods across rendezvous peers only — cheaper,
//!   used for index-style queries.
//!
//! Every message carries a [`WireHeader`]; on receipt a message is
//! dropped without delivery or re-propagation when its TTL is exhausted,
//! its id was already seen (bounded history, oldest evicted first), or
//! this peer already appears in its visited set.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::OverlayConfig;
use crate::id::{fresh_message_id, MessageId, PeerAddr};
use crate::messenger::Messenger;
use crate::peerview::{PeerView, RdvRole};
use crate::protocol::{OverlayMessage, Payload, WireHeader, PIPE_SERVICE};

/// Receives messages addressed to a registered (service, param) pair.
///
/// Returning `Ok(true)` claims the message; an unclaimed or failed
/// delivery leaves the message eligible for re-propagation. Errors are
/// caught and logged at the call site and never abort delivery to other
/// recipients.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, msg: &OverlayMessage) -> anyhow::Result<bool>;
}

/// What became of one incoming message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WalkOutcome {
    /// A local listener was invoked.
    pub delivered: bool,
    /// The message was sent onward.
    pub repropagated: bool,
}

/// Counters for telemetry.
#[derive(Clone, Copy, Debug, Default)]
pub struct WalkStats {
    pub delivered: u64,
    pub dropped_duplicate: u64,
    pub dropped_loop: u64,
    pub dropped_expired: u64,
    pub repropagated: u64,
}

/// The flooding engine shared by SRDI and pipe traffic.
pub struct WalkEngine {
    cfg: OverlayConfig,
    peerview: Arc<PeerView>,
    messenger: Arc<dyn Messenger>,
    /// Message-id history for general rendezvous traffic.
    seen: Mutex<LruCache<MessageId, ()>>,
    /// Smaller, separate history for wire-pipe traffic.
    pipe_seen: Mutex<LruCache<MessageId, ()>>,
    /// Listener registry on its own lock, keyed by (service, param).
    listeners: Mutex<HashMap<(String, String), Arc<dyn MessageListener>>>,
    delivered: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_loop: AtomicU64,
    dropped_expired: AtomicU64,
    repropagated: AtomicU64,
}

impl WalkEngine {
    /// Create an engine over the given view and messenger.
    pub fn new(cfg: OverlayConfig, peerview: Arc<PeerView>, messenger: Arc<dyn Messenger>) -> Self {
        let seen_cap = NonZeroUsize::new(cfg.seen_cache_capacity.max(1))
            .expect("capacity clamped to nonzero");
        let pipe_cap = NonZeroUsize::new(cfg.pipe_seen_cache_capacity.max(1))
            .expect("capacity clamped to nonzero");
        Self {
            cfg,
            peerview,
            messenger,
            seen: Mutex::new(LruCache::new(seen_cap)),
            pipe_seen: Mutex::new(LruCache::new(pipe_cap)),
            listeners: Mutex::new(HashMap::new()),
            delivered: AtomicU64::new(0),
            dropped_duplicate: AtomicU64::new(0),
            dropped_loop: AtomicU64::new(0),
            dropped_expired: AtomicU64::new(0),
            repropagated: AtomicU64::new(0),
        }
    }

    /// Register a listener for a (service, param) address. Returns false
    /// if the address is already claimed.
    pub async fn register_listener(
        &self,
        service: &str,
        param: &str,
        listener: Arc<dyn MessageListener>,
    ) -> bool {
        let mut listeners = self.listeners.lock().await;
        let key = (service.to_string(), param.to_string());
        if listeners.contains_key(&key) {
            return false;
        }
        listeners.insert(key, listener);
        true
    }

    /// Remove the listener at a (service, param) address.
    pub async fn unregister_listener(&self, service: &str, param: &str) {
        let mut listeners = self.listeners.lock().await;
        listeners.remove(&(service.to_string(), param.to_string()));
    }

    /// Flood a payload to all reachable peers on the local segment.
    ///
    /// Returns the id stamped on the message. The id is recorded in the
    /// history first, so a looped-back copy of our own flood is dropped
    /// by the duplicate rule without touching its TTL.
    pub async fn propagate(
        &self,
        payload: Payload,
        credential: Option<Vec<u8>>,
        service: &str,
        param: &str,
        ttl: u32,
    ) -> anyhow::Result<MessageId> {
        let msg = self.originate(payload, credential, service, param, ttl).await;
        self.messenger
            .broadcast_local_segment(&msg)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(msg.header.msg_id)
    }

    /// Flood a payload across rendezvous peers only.
    pub async fn walk(
        &self,
        payload: Payload,
        credential: Option<Vec<u8>>,
        service: &str,
        param: &str,
        ttl: u32,
    ) -> anyhow::Result<MessageId> {
        let msg = self.originate(payload, credential, service, param, ttl).await;
        let self_id = self.peerview.self_addr().id;
        for peer in self.peerview.global_view().await {
            if peer.id == self_id {
                continue;
            }
            if let Err(err) = self.messenger.send(&peer, &msg).await {
                debug!(peer = %peer.short(), %err, "walk send failed");
            }
        }
        Ok(msg.header.msg_id)
    }

    /// Run one incoming message through the drop rules, local delivery,
    /// and the re-propagation decision.
    pub async fn handle_incoming(&self, mut msg: OverlayMessage) -> WalkOutcome {
        let self_id = self.peerview.self_addr().id;

        // Duplicate suppression comes first: a message whose id was seen
        // before is dropped regardless of TTL.
        if self.already_seen(&msg).await {
            self.dropped_duplicate.fetch_add(1, Ordering::Relaxed);
            debug!(id = %hex::encode(msg.header.msg_id), "dropping duplicate message");
            return WalkOutcome::default();
        }

        // Loop detection: we already handled (or originated) this one.
        if msg.header.visited.contains(&self_id) {
            self.dropped_loop.fetch_add(1, Ordering::Relaxed);
            debug!(id = %hex::encode(msg.header.msg_id), "dropping looped message");
            return WalkOutcome::default();
        }

        // TTL is re-capped on receipt; a sender cannot grant more hops
        // than our own ceiling allows.
        let ttl = msg.header.ttl.min(self.cfg.max_ttl);
        if ttl == 0 {
            self.dropped_expired.fetch_add(1, Ordering::Relaxed);
            debug!(id = %hex::encode(msg.header.msg_id), "dropping expired message");
            return WalkOutcome::default();
        }
        msg.header.ttl = ttl;

        let claimed = self.deliver(&msg).await;
        let mut outcome = WalkOutcome {
            delivered: claimed.is_some(),
            repropagated: false,
        };

        // Receivers re-propagate only when they are a rendezvous or no
        // local listener claimed the message.
        let is_rdv = self.peerview.role().await == RdvRole::Rendezvous;
        if !is_rdv && claimed == Some(true) {
            return outcome;
        }
        if msg.header.ttl <= 1 {
            return outcome;
        }

        msg.header.ttl -= 1;
        msg.header.visited.push(self_id);
        self.repropagate(&msg, is_rdv).await;
        self.repropagated.fetch_add(1, Ordering::Relaxed);
        outcome.repropagated = true;
        outcome
    }

    /// Counter snapshot.
    pub fn stats(&self) -> WalkStats {
        WalkStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            dropped_loop: self.dropped_loop.load(Ordering::Relaxed),
            dropped_expired: self.dropped_expired.load(Ordering::Relaxed),
            repropagated: self.repropagated.load(Ordering::Relaxed),
        }
    }

    async fn originate(
        &self,
        payload: Payload,
        credential: Option<Vec<u8>>,
        service: &str,
        param: &str,
        ttl: u32,
    ) -> OverlayMessage {
        let self_id = self.peerview.self_addr().id;
        let header = WireHeader::fresh(
            fresh_message_id(),
            self_id,
            ttl.min(self.cfg.max_ttl),
            service,
            param,
        );
        let msg = OverlayMessage {
            header,
            credential,
            payload,
        };
        self.record_seen(&msg).await;
        msg
    }

    async fn already_seen(&self, msg: &OverlayMessage) -> bool {
        let id = msg.header.msg_id;
        if msg.header.dest_service == PIPE_SERVICE {
            let mut cache = self.pipe_seen.lock().await;
            cache.put(id, ()).is_some()
        } else {
            let mut cache = self.seen.lock().await;
            cache.put(id, ()).is_some()
        }
    }

    async fn record_seen(&self, msg: &OverlayMessage) {
        let id = msg.header.msg_id;
        if msg.header.dest_service == PIPE_SERVICE {
            let mut cache = self.pipe_seen.lock().await;
            cache.put(id, ());
        } else {
            let mut cache = self.seen.lock().await;
            cache.put(id, ());
        }
    }

    /// Invoke the local listener, if any. Returns `Some(claimed)` when a
    /// listener ran, `None` when the address had no listener.
    ///
    /// Lookup is exact on (service, param) first; a listener registered
    /// with an empty param acts as the service-wide handler.
    async fn deliver(&self, msg: &OverlayMessage) -> Option<bool> {
        let listener = {
            let listeners = self.listeners.lock().await;
            listeners
                .get(&(
                    msg.header.dest_service.clone(),
                    msg.header.dest_param.clone(),
                ))
                .or_else(|| listeners.get(&(msg.header.dest_service.clone(), String::new())))
                .cloned()
        }?;

        self.delivered.fetch_add(1, Ordering::Relaxed);
        match listener.on_message(msg).await {
            Ok(claimed) => Some(claimed),
            Err(err) => {
                // A failing listener did not handle the message; the
                // propagation machinery continues as if unclaimed.
                warn!(
                    service = %msg.header.dest_service,
                    %err,
                    "message listener failed"
                );
                Some(false)
            }
        }
    }

    async fn repropagate(&self, msg: &OverlayMessage, is_rdv: bool) {
        if is_rdv {
            let self_id = self.peerview.self_addr().id;
            let peers: Vec<PeerAddr> = self
                .peerview
                .global_view()
                .await
                .into_iter()
                .filter(|p| p.id != self_id && !msg.header.visited.contains(&p.id))
                .collect();
            for peer in peers {
                if let Err(err) = self.messenger.send(&peer, msg).await {
                    debug!(peer = %peer.short(), %err, "repropagation send failed");
                }
            }
        } else if let Err(err) = self.messenger.broadcast_local_segment(msg).await {
            debug!(%err, "segment repropagation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendError;
    use crate::id::PeerId;
    use crate::protocol::{ProbeGreeting, MEMBERSHIP_SERVICE};

    fn addr(byte: u8) -> PeerAddr {
        let mut id = [0u8; 32];
        id[0] = byte;
        PeerAddr {
            id,
            route: format!("peer-{byte}"),
        }
    }

    fn greeting(from: u8) -> Payload {
        Payload::ProbeGreeting(ProbeGreeting {
            peer: addr(from),
            rendezvous: false,
        })
    }

    #[derive(Default)]
    struct RecordingMessenger {
        sends: Mutex<Vec<(PeerAddr, OverlayMessage)>>,
        broadcasts: Mutex<Vec<OverlayMessage>>,
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send(&self, to: &PeerAddr, msg: &OverlayMessage) -> Result<(), SendError> {
            self.sends.lock().await.push((to.clone(), msg.clone()));
            Ok(())
        }

        async fn broadcast_local_segment(&self, msg: &OverlayMessage) -> Result<(), SendError> {
            self.broadcasts.lock().await.push(msg.clone());
            Ok(())
        }
    }

    struct ClaimingListener;

    #[async_trait]
    impl MessageListener for ClaimingListener {
        async fn on_message(&self, _: &OverlayMessage) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    struct CountingListener {
        hits: AtomicU64,
    }

    #[async_trait]
    impl MessageListener for CountingListener {
        async fn on_message(&self, _: &OverlayMessage) -> anyhow::Result<bool> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn engine(
        self_byte: u8,
        role: RdvRole,
    ) -> (Arc<WalkEngine>, Arc<RecordingMessenger>, Arc<PeerView>) {
        let cfg = OverlayConfig::compressed();
        let view = Arc::new(PeerView::new(addr(self_byte), cfg.clone(), role));
        let messenger = Arc::new(RecordingMessenger::default());
        let engine = Arc::new(WalkEngine::new(
            cfg,
            Arc::clone(&view),
            messenger.clone() as Arc<dyn Messenger>,
        ));
        (engine, messenger, view)
    }

    fn incoming(from: u8, ttl: u32, visited: &[u8], service: &str) -> OverlayMessage {
        let source = addr(from).id;
        let visited: Vec<PeerId> = visited.iter().map(|b| addr(*b).id).collect();
        OverlayMessage {
            header: WireHeader {
                msg_id: fresh_message_id(),
                ttl,
                source,
                visited,
                dest_service: service.to_string(),
                dest_param: String::new(),
            },
            credential: None,
            payload: greeting(from),
        }
    }

    #[tokio::test]
    async fn message_with_self_in_visited_set_is_never_repropagated() {
        let (engine, messenger, _) = engine(1, RdvRole::Rendezvous);
        let msg = incoming(2, 5, &[2, 1], MEMBERSHIP_SERVICE);
        let outcome = engine.handle_incoming(msg).await;
        assert_eq!(outcome, WalkOutcome::default());
        assert!(messenger.sends.lock().await.is_empty());
        assert!(messenger.broadcasts.lock().await.is_empty());
        assert_eq!(engine.stats().dropped_loop, 1);
    }

    #[tokio::test]
    async fn expired_ttl_generates_zero_sends() {
        let (engine, messenger, _) = engine(1, RdvRole::Rendezvous);
        let msg = incoming(2, 0, &[2], MEMBERSHIP_SERVICE);
        let outcome = engine.handle_incoming(msg).await;
        assert_eq!(outcome, WalkOutcome::default());
        assert!(messenger.sends.lock().await.is_empty());
        assert!(messenger.broadcasts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_is_dropped_without_delivery() {
        let (engine, _messenger, _) = engine(1, RdvRole::Edge);
        let listener = Arc::new(CountingListener {
            hits: AtomicU64::new(0),
        });
        engine
            .register_listener(MEMBERSHIP_SERVICE, "", listener.clone())
            .await;

        let msg = incoming(2, 5, &[2], MEMBERSHIP_SERVICE);
        let dup = msg.clone();
        let first = engine.handle_incoming(msg).await;
        let second = engine.handle_incoming(dup).await;

        assert!(first.delivered);
        assert!(!second.delivered);
        assert!(!second.repropagated);
        assert_eq!(listener.hits.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().dropped_duplicate, 1);
    }

    #[tokio::test]
    async fn ttl_decreases_across_repropagation_and_visited_grows() {
        let (engine, messenger, view) = engine(1, RdvRole::Rendezvous);
        view.observe_rendezvous(addr(3)).await;

        let msg = incoming(2, 5, &[2], MEMBERSHIP_SERVICE);
        let outcome = engine.handle_incoming(msg).await;
        assert!(outcome.repropagated);

        let sends = messenger.sends.lock().await;
        let (_, forwarded) = &sends[0];
        assert_eq!(forwarded.header.ttl, 4);
        assert!(forwarded.header.visited.contains(&addr(1).id));
        assert!(forwarded.header.visited.contains(&addr(2).id));
    }

    #[tokio::test]
    async fn incoming_ttl_is_capped_at_configured_max() {
        let (engine, messenger, view) = engine(1, RdvRole::Rendezvous);
        view.observe_rendezvous(addr(3)).await;

        let msg = incoming(2, 1000, &[2], MEMBERSHIP_SERVICE);
        engine.handle_incoming(msg).await;

        let sends = messenger.sends.lock().await;
        let (_, forwarded) = &sends[0];
        // Capped to max_ttl on receipt, then decremented once.
        assert_eq!(forwarded.header.ttl, OverlayConfig::compressed().max_ttl - 1);
    }

    #[tokio::test]
    async fn edge_does_not_repropagate_claimed_messages() {
        let (engine, messenger, _) = engine(1, RdvRole::Edge);
        engine
            .register_listener(MEMBERSHIP_SERVICE, "", Arc::new(ClaimingListener))
            .await;

        let msg = incoming(2, 5, &[2], MEMBERSHIP_SERVICE);
        let outcome = engine.handle_incoming(msg).await;
        assert!(outcome.delivered);
        assert!(!outcome.repropagated);
        assert!(messenger.broadcasts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn edge_repropagates_unclaimed_messages_on_segment() {
        let (engine, messenger, _) = engine(1, RdvRole::Edge);
        let msg = incoming(2, 5, &[2], MEMBERSHIP_SERVICE);
        let outcome = engine.handle_incoming(msg).await;
        assert!(!outcome.delivered);
        assert!(outcome.repropagated);
        assert_eq!(messenger.broadcasts.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn rendezvous_skips_visited_peers_when_forwarding() {
        let (engine, messenger, view) = engine(1, RdvRole::Rendezvous);
        view.observe_rendezvous(addr(2)).await;
        view.observe_rendezvous(addr(3)).await;

        let msg = incoming(2, 5, &[2], MEMBERSHIP_SERVICE);
        engine.handle_incoming(msg).await;

        let sends = messenger.sends.lock().await;
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0.id, addr(3).id);
    }

    #[tokio::test]
    async fn failing_listener_counts_as_unclaimed() {
        struct FailingListener;
        #[async_trait]
        impl MessageListener for FailingListener {
            async fn on_message(&self, _: &OverlayMessage) -> anyhow::Result<bool> {
                anyhow::bail!("listener exploded")
            }
        }

        let (engine, messenger, _) = engine(1, RdvRole::Edge);
        engine
            .register_listener(MEMBERSHIP_SERVICE, "", Arc::new(FailingListener))
            .await;

        let msg = incoming(2, 5, &[2], MEMBERSHIP_SERVICE);
        let outcome = engine.handle_incoming(msg).await;
        // Failure is treated as "did not claim": the edge floods onward.
        assert!(outcome.repropagated);
        assert_eq!(messenger.broadcasts.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn own_propagation_loopback_is_dropped_as_duplicate() {
        let (engine, messenger, _) = engine(1, RdvRole::Edge);
        let id = engine
            .propagate(greeting(1), None, MEMBERSHIP_SERVICE, "", 5)
            .await
            .unwrap();

        let echoed = {
            let broadcasts = messenger.broadcasts.lock().await;
            broadcasts[0].clone()
        };
        assert_eq!(echoed.header.msg_id, id);

        let outcome = engine.handle_incoming(echoed).await;
        assert_eq!(outcome, WalkOutcome::default());
        assert_eq!(engine.stats().dropped_duplicate, 1);
    }

    #[tokio::test]
    async fn walk_targets_rendezvous_view_only() {
        let (engine, messenger, view) = engine(1, RdvRole::Rendezvous);
        view.observe_rendezvous(addr(2)).await;
        view.observe_rendezvous(addr(3)).await;

        engine
            .walk(greeting(1), None, MEMBERSHIP_SERVICE, "", 5)
            .await
            .unwrap();

        let sends = messenger.sends.lock().await;
        let mut targets: Vec<u8> = sends.iter().map(|(p, _)| p.id[0]).collect();
        targets.sort();
        assert_eq!(targets, vec![2, 3]);
        assert!(messenger.broadcasts.lock().await.is_empty());
    }
}

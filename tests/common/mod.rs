#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use rendezvous_overlay::{
    Messenger, OverlayConfig, OverlayMessage, OverlayNode, PeerAddr, PeerId, RdvRole, SendError,
};

pub fn make_peer_id(byte: u8) -> PeerId {
    let mut id = [0u8; 32];
    id[0] = byte;
    id
}

pub fn make_peer_addr(byte: u8) -> PeerAddr {
    PeerAddr {
        id: make_peer_id(byte),
        route: format!("node-{byte}"),
    }
}

/// In-memory overlay network: nodes deliver messages to each other by
/// routing frames straight into the destination's walk engine.
#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<PeerId, Arc<OverlayNode>>>,
    failures: Mutex<HashSet<PeerId>>,
}

impl NetworkRegistry {
    pub async fn register(&self, id: PeerId, node: Arc<OverlayNode>) {
        let mut peers = self.peers.write().await;
        peers.insert(id, node);
    }

    pub async fn get(&self, id: &PeerId) -> Option<Arc<OverlayNode>> {
        let peers = self.peers.read().await;
        peers.get(id).cloned()
    }

    pub async fn all_except(&self, id: &PeerId) -> Vec<Arc<OverlayNode>> {
        let peers = self.peers.read().await;
        peers
            .iter()
            .filter(|(peer, _)| *peer != id)
            .map(|(_, node)| node.clone())
            .collect()
    }

    pub async fn set_failure(&self, id: PeerId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(id);
        } else {
            failures.remove(&id);
        }
    }

    async fn should_fail(&self, id: &PeerId) -> bool {
        let failures = self.failures.lock().await;
        failures.contains(id)
    }
}

/// Messenger that records traffic and delivers through the registry.
pub struct TestMessenger {
    registry: Arc<NetworkRegistry>,
    self_id: PeerId,
    sends: Mutex<Vec<(PeerId, OverlayMessage)>>,
    broadcasts: Mutex<Vec<OverlayMessage>>,
}

impl TestMessenger {
    pub fn new(registry: Arc<NetworkRegistry>, self_id: PeerId) -> Self {
        Self {
            registry,
            self_id,
            sends: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    pub async fn sent(&self) -> Vec<(PeerId, OverlayMessage)> {
        self.sends.lock().await.clone()
    }

    pub async fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().await.len()
    }
}

#[async_trait]
impl Messenger for TestMessenger {
    async fn send(&self, to: &PeerAddr, msg: &OverlayMessage) -> Result<(), SendError> {
        if self.registry.should_fail(&to.id).await {
            return Err(SendError::Transport("injected network failure".into()));
        }
        {
            let mut sends = self.sends.lock().await;
            sends.push((to.id, msg.clone()));
        }
        if let Some(node) = self.registry.get(&to.id).await {
            node.walk().handle_incoming(msg.clone()).await;
        }
        Ok(())
    }

    async fn broadcast_local_segment(&self, msg: &OverlayMessage) -> Result<(), SendError> {
        {
            let mut broadcasts = self.broadcasts.lock().await;
            broadcasts.push(msg.clone());
        }
        for node in self.registry.all_except(&self.self_id).await {
            node.walk().handle_incoming(msg.clone()).await;
        }
        Ok(())
    }
}

/// A node wired into the in-memory network.
pub struct TestNode {
    pub node: Arc<OverlayNode>,
    pub messenger: Arc<TestMessenger>,
    pub addr: PeerAddr,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, byte: u8, role: RdvRole) -> Self {
        Self::with_config(registry, byte, role, OverlayConfig::compressed()).await
    }

    pub async fn with_config(
        registry: Arc<NetworkRegistry>,
        byte: u8,
        role: RdvRole,
        cfg: OverlayConfig,
    ) -> Self {
        let addr = make_peer_addr(byte);
        let messenger = Arc::new(TestMessenger::new(Arc::clone(&registry), addr.id));
        let node = OverlayNode::new(
            addr.clone(),
            cfg,
            messenger.clone() as Arc<dyn Messenger>,
            role,
        )
        .await;
        registry.register(addr.id, node.clone()).await;
        Self {
            node,
            messenger,
            addr,
        }
    }
}

#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{make_peer_addr, NetworkRegistry, TestNode};
use rendezvous_overlay::protocol::{ProbeGreeting, MEMBERSHIP_SERVICE};
use rendezvous_overlay::{Payload, RdvRole};

#[tokio::test]
async fn isolated_edge_promotes_itself_via_the_watchdog() {
    let registry = Arc::new(NetworkRegistry::default());
    let node = TestNode::new(registry.clone(), 0x10, RdvRole::Edge).await;

    node.node.spawn_background().await;
    // The compressed watchdog interval is 20ms; give it a few ticks.
    tokio::time::sleep(Duration::from_millis(120)).await;
    node.node.stop().await;

    assert!(node.node.peerview().is_rendezvous().await);
}

#[tokio::test]
async fn overprovisioned_rendezvous_demotes_via_the_watchdog() {
    let registry = Arc::new(NetworkRegistry::default());
    let node = TestNode::new(registry.clone(), 0x10, RdvRole::Rendezvous).await;
    // Six peers in view (observed five + self) with zero clients.
    for byte in [0x20, 0x30, 0x40, 0x50, 0x60] {
        node.node
            .peerview()
            .observe_rendezvous(make_peer_addr(byte))
            .await;
    }

    node.node.spawn_background().await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    node.node.stop().await;

    assert!(!node.node.peerview().is_rendezvous().await);
}

#[tokio::test]
async fn rendezvous_greeting_joins_the_receivers_view() {
    let registry = Arc::new(NetworkRegistry::default());
    let a = TestNode::new(registry.clone(), 0x10, RdvRole::Edge).await;
    let b = TestNode::new(registry.clone(), 0x20, RdvRole::Rendezvous).await;

    // B announces itself on the segment.
    b.node
        .walk()
        .propagate(
            Payload::ProbeGreeting(ProbeGreeting {
                peer: b.addr.clone(),
                rendezvous: true,
            }),
            None,
            MEMBERSHIP_SERVICE,
            "",
            2,
        )
        .await
        .expect("propagate succeeds");

    assert_eq!(a.node.peerview().rendezvous_count().await, 1);
    assert_eq!(
        a.node.peerview().lookup(&b.addr.id).await.map(|p| p.route),
        Some(b.addr.route.clone())
    );
}

#[tokio::test]
async fn edge_greeting_becomes_a_client_lease_on_a_rendezvous() {
    let registry = Arc::new(NetworkRegistry::default());
    let rdv = TestNode::new(registry.clone(), 0x10, RdvRole::Rendezvous).await;
    let edge = TestNode::new(registry.clone(), 0x20, RdvRole::Edge).await;

    edge.node
        .walk()
        .propagate(
            Payload::ProbeGreeting(ProbeGreeting {
                peer: edge.addr.clone(),
                rendezvous: false,
            }),
            None,
            MEMBERSHIP_SERVICE,
            "",
            2,
        )
        .await
        .expect("propagate succeeds");

    assert_eq!(rdv.node.peerview().client_count().await, 1);
    // An edge receiving the same greeting records no lease.
    assert_eq!(edge.node.peerview().client_count().await, 0);
}

#[tokio::test]
async fn seeding_populates_the_view_and_feeds_the_push_state() {
    let registry = Arc::new(NetworkRegistry::default());
    let node = TestNode::new(registry.clone(), 0x10, RdvRole::Edge).await;

    node.node
        .peerview()
        .seed(vec![make_peer_addr(0x20), make_peer_addr(0x30)])
        .await;

    assert_eq!(node.node.peerview().rendezvous_count().await, 2);
    // Seeding emitted Connect events, so a subsequent push cycle is a
    // full republish even without an explicit reconnect.
    node.node
        .engine()
        .publish("Pipe", "Id", "pipe-x", 60_000)
        .await
        .unwrap();
    node.node.engine().push_once().await.unwrap();
    assert_eq!(node.messenger.sent().await.len(), 1);
}

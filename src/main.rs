//! Example overlay node binary.
//!
//! This binary starts an overlay node with mDNS discovery for local
//! network peer discovery and QUIC relay support for NAT traversal. It
//! demonstrates the basic setup pattern for using the rendezvous-overlay
//! library.
//!
//! # Usage
//!
//! ```bash
//! cargo run [-- --rendezvous] [-- --seed '<EndpointAddr JSON>' ...]
//! ```
//!
//! The node prints its peer id and endpoint address on startup. Stats are
//! printed every five minutes.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future;
use iroh::discovery::mdns::MdnsDiscovery;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, RelayMode};
use tokio::time::{self, Duration};
use tracing::info;

use rendezvous_overlay::{
    derive_peer_id, IrohMessenger, OverlayConfig, OverlayNode, OverlayProtocolHandler, PeerAddr,
    RdvRole, OVERLAY_ALPN,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let start_role = if args.iter().any(|a| a == "--rendezvous") {
        RdvRole::Rendezvous
    } else {
        RdvRole::Edge
    };
    let seeds = parse_seeds(&args)?;

    // Peers connecting with our ALPN are routed to the overlay handler.
    let endpoint = Endpoint::builder()
        .alpns(vec![OVERLAY_ALPN.to_vec()])
        .relay_mode(RelayMode::Default)
        .bind()
        .await?;

    if let Err(err) = enable_local_mdns(&endpoint) {
        eprintln!("Failed to initialize mDNS discovery ({err:?}); continuing with relay-only mode");
    } else {
        info!("mDNS discovery enabled; will fall back to relay if unavailable");
    }

    let peer_id = derive_peer_id(endpoint.id().as_bytes());
    let endpoint_addr: EndpointAddr = endpoint.addr();
    let route = serde_json::to_string(&endpoint_addr)?;
    let self_addr = PeerAddr { id: peer_id, route: route.clone() };

    println!("Overlay node started");
    println!("  PeerId (hex): {}", hex::encode(peer_id));
    println!("  Endpoint addr JSON: {route}");

    let messenger = Arc::new(IrohMessenger::new(endpoint.clone()));
    let node = OverlayNode::new(
        self_addr,
        OverlayConfig::default(),
        messenger,
        start_role,
    )
    .await;

    // Accept incoming overlay connections.
    let _router = Router::builder(endpoint.clone())
        .accept(OVERLAY_ALPN, OverlayProtocolHandler::new(node.walk().clone()))
        .spawn();

    // Bootstrap from any seed rendezvous addresses.
    if !seeds.is_empty() {
        let seed_peers: Vec<PeerAddr> = seeds
            .iter()
            .map(|addr| {
                let route = serde_json::to_string(addr)?;
                Ok(PeerAddr {
                    id: derive_peer_id(addr.id.as_bytes()),
                    route,
                })
            })
            .collect::<Result<_>>()?;
        node.peerview().seed(seed_peers).await;
    }

    node.spawn_background().await;

    // Periodically print node stats.
    let stats_node = node.clone();
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let stats = stats_node.stats().await;
            println!(
                "Stats: rendezvous={}, view={}, clients={}, srdi_entries={}, cached={}, pushes={}, delivered={}, dropped_dup={}",
                stats.rendezvous,
                stats.view_size,
                stats.clients,
                stats.srdi_entries,
                stats.cached_records,
                stats.pushes,
                stats.walk.delivered,
                stats.walk.dropped_duplicate,
            );
        }
    });

    // Park the main task indefinitely.
    future::pending::<()>().await;
    Ok(())
}

/// Parse `--seed '<EndpointAddr JSON>'` arguments.
fn parse_seeds(args: &[String]) -> Result<Vec<EndpointAddr>> {
    let mut seeds = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--seed" {
            let raw = iter
                .next()
                .context("--seed requires an EndpointAddr JSON argument")?;
            seeds.push(serde_json::from_str(raw).context("invalid EndpointAddr JSON")?);
        }
    }
    Ok(seeds)
}

/// Enable mDNS discovery for the endpoint.
///
/// This allows automatic discovery of other overlay nodes on the local
/// network.
fn enable_local_mdns(endpoint: &Endpoint) -> anyhow::Result<()> {
    let mdns = MdnsDiscovery::builder()
        .service_name("rendezvous-overlay")
        .build(endpoint.id())
        .map_err(|err| anyhow::anyhow!("mDNS discovery initialization failed: {err}"))?;
    endpoint.discovery().add(mdns);
    Ok(())
}

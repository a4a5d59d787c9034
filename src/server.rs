//! Inbound connection handling for the overlay ALPN.
//!
//! Every connection carries one length-prefixed frame holding an
//! [`OverlayMessage`]; the handler decodes it, hands it to the walk
//! engine's drop/deliver/re-propagate pipeline, and acknowledges with an
//! empty frame. Malformed frames are discarded at debug level — an
//! expected occasional occurrence on a hostile or lossy network — and
//! never reach the propagation machinery.

use std::fmt;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use tracing::debug;

use crate::framing::{read_frame, write_frame};
use crate::protocol::OverlayMessage;
use crate::walk::WalkEngine;

/// Handle a single inbound overlay connection.
///
/// The connection lifetime is one message exchange: read the frame, run
/// it through the walk engine, write the ack, finish. The client performs
/// the final read of the ack frame and closes the connection.
pub async fn handle_connection(walk: Arc<WalkEngine>, conn: Connection) -> Result<()> {
    let (mut send, mut recv) = conn.accept_bi().await?;
    let Some(bytes) = read_frame(&mut recv).await? else {
        return Ok(());
    };

    match OverlayMessage::decode(&bytes) {
        Ok(msg) => {
            walk.handle_incoming(msg).await;
        }
        Err(err) => {
            debug!(%err, "discarding malformed overlay frame");
        }
    }

    // Empty ack frame: the sender treats its arrival as frame-level
    // delivery confirmation.
    write_frame(&mut send, &[]).await?;
    send.finish()?;
    Ok(())
}

/// The router entry point for inbound overlay connections.
///
/// Register with
/// `Router::builder(endpoint).accept(OVERLAY_ALPN, OverlayProtocolHandler::new(walk))`;
/// the router invokes [`ProtocolHandler::accept`] per negotiated
/// connection, which delegates to [`handle_connection`].
#[derive(Clone)]
pub struct OverlayProtocolHandler {
    walk: Arc<WalkEngine>,
}

impl OverlayProtocolHandler {
    pub fn new(walk: Arc<WalkEngine>) -> Self {
        Self { walk }
    }
}

impl fmt::Debug for OverlayProtocolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayProtocolHandler").finish()
    }
}

impl ProtocolHandler for OverlayProtocolHandler {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let walk = self.walk.clone();
        async move {
            handle_connection(walk, connection)
                .await
                .map_err(|err| AcceptError::from_err(io::Error::new(io::ErrorKind::Other, err)))
        }
    }
}

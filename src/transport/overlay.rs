//! Overlay broadcast adapter.
//!
//! Stands in for a gossip mesh: every member sees every message on a shared
//! `tokio::sync::broadcast` bus and keeps those addressed to it or to
//! [`BROADCAST_ADDRESS`]. Delivery is unordered across senders and lagging
//! members lose messages, so callers match replies by correlation id.

use crate::core::{Error, Result, TransportKind};
use crate::transport::{InboundFrame, Link, TransportBackend};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Address reaching every member of the overlay.
pub const BROADCAST_ADDRESS: &str = "*";

#[derive(Clone, Debug)]
struct OverlayMessage {
    from: String,
    to: String,
    frame: Bytes,
}

/// Shared overlay medium.
#[derive(Clone)]
pub struct OverlayBus {
    tx: broadcast::Sender<OverlayMessage>,
}

impl OverlayBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Join as `address`; frames addressed to it (or broadcast) go to
    /// `inbound`.
    pub fn join(&self, address: &str, inbound: mpsc::Sender<InboundFrame>) -> OverlayTransport {
        let mut rx = self.tx.subscribe();
        let me = address.to_string();
        let pump = tokio::spawn(async move {
            loop {
                let message = match rx.recv().await {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(member = %me, missed, "overlay member lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if message.from == me || (message.to != me && message.to != BROADCAST_ADDRESS) {
                    continue;
                }
                let frame = InboundFrame {
                    kind: TransportKind::Overlay,
                    from: Some(message.from),
                    frame: message.frame,
                };
                if inbound.send(frame).await.is_err() {
                    break;
                }
            }
            debug!(member = %me, "overlay member left");
        });
        OverlayTransport {
            bus: self.clone(),
            address: address.to_string(),
            pump: Arc::new(pump),
        }
    }

    pub fn member_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for OverlayBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for OverlayBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayBus")
            .field("members", &self.member_count())
            .finish()
    }
}

/// Membership of one address in an [`OverlayBus`].
#[derive(Clone)]
pub struct OverlayTransport {
    bus: OverlayBus,
    address: String,
    pump: Arc<JoinHandle<()>>,
}

impl OverlayTransport {
    /// Stop receiving. Further sends still reach other members.
    pub fn leave(&self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for OverlayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayTransport")
            .field("address", &self.address)
            .finish()
    }
}

#[async_trait]
impl TransportBackend for OverlayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Overlay
    }

    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn Link>> {
        Ok(Arc::new(OverlayLink {
            bus: self.bus.clone(),
            from: self.address.clone(),
            to: address.to_string(),
        }))
    }
}

struct OverlayLink {
    bus: OverlayBus,
    from: String,
    to: String,
}

#[async_trait]
impl Link for OverlayLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Overlay
    }

    fn address(&self) -> &str {
        &self.to
    }

    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        // Only our own pump would see it; nobody else is listening.
        if self.bus.member_count() <= 1 {
            return Err(Error::unavailable("overlay has no other members"));
        }
        self.bus
            .tx
            .send(OverlayMessage {
                from: self.from.clone(),
                to: self.to.clone(),
                frame,
            })
            .map(|_| ())
            .map_err(|_| Error::unavailable("overlay bus closed"))
    }
}

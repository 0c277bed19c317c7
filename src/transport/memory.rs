//! In-process direct transport.
//!
//! A [`MemoryNetwork`] is a shared address book of bound inboxes. Links
//! deliver in order, like a stream connection.

use crate::core::{Error, Result, TransportKind};
use crate::transport::{InboundFrame, Link, TransportBackend};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inboxes: Arc<DashMap<String, mpsc::Sender<InboundFrame>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `address`; frames sent to it go to `inbound`.
    pub fn bind(&self, address: &str, inbound: mpsc::Sender<InboundFrame>) -> Result<MemoryTransport> {
        if self.inboxes.contains_key(address) {
            return Err(Error::Config(format!("memory address {} already bound", address)));
        }
        self.inboxes.insert(address.to_string(), inbound);
        debug!(address = %address, "memory transport bound");
        Ok(MemoryTransport {
            network: self.clone(),
            address: address.to_string(),
        })
    }

    /// Remove `address`, simulating a peer going offline.
    pub fn unbind(&self, address: &str) -> bool {
        self.inboxes.remove(address).is_some()
    }

    pub fn is_bound(&self, address: &str) -> bool {
        self.inboxes.contains_key(address)
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("bound", &self.inboxes.len())
            .finish()
    }
}

/// One bound address on a [`MemoryNetwork`].
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: String,
}

#[async_trait]
impl TransportBackend for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn Link>> {
        if !self.network.is_bound(address) {
            return Err(Error::unavailable(format!("memory address {} is not bound", address)));
        }
        Ok(Arc::new(MemoryLink {
            network: self.network.clone(),
            from: self.address.clone(),
            to: address.to_string(),
        }))
    }
}

struct MemoryLink {
    network: MemoryNetwork,
    from: String,
    to: String,
}

#[async_trait]
impl Link for MemoryLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn address(&self) -> &str {
        &self.to
    }

    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        // Look up on every send so an unbound peer surfaces immediately.
        let inbox = self
            .network
            .inboxes
            .get(&self.to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::unavailable(format!("memory address {} is gone", self.to)))?;
        inbox
            .send(InboundFrame {
                kind: TransportKind::Direct,
                from: Some(self.from.clone()),
                frame,
            })
            .await
            .map_err(|_| Error::unavailable(format!("memory inbox {} closed", self.to)))
    }

    fn is_closed(&self) -> bool {
        !self.network.is_bound(&self.to)
    }
}

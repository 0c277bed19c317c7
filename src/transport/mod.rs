//! Transport Abstraction Layer.
//!
//! Backends move opaque, already-signed frames. A [`TransportBackend`] opens
//! [`Link`]s to addresses of its own kind and pushes every frame it receives
//! into the inbound channel it was bound with. Selection, pooling, retry and
//! fallback live in [`TransportLayer`].

pub mod dispatch;
pub mod memory;
pub mod overlay;
pub mod pool;
pub mod selector;
pub mod tcp;

use crate::core::{Result, TransportKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub use dispatch::{DeliveryReceipt, OutboundFrame, RetryPolicy, SendTicket, TransportConfig, TransportLayer};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use overlay::{OverlayBus, OverlayTransport, BROADCAST_ADDRESS};
pub use pool::HandlePool;
pub use selector::{
    select_transport, DefaultSelectionPolicy, QosTier, SecurityRequirement, SelectionContext,
    SelectionPolicy, TransportHandle,
};
pub use tcp::TcpTransport;

/// Capacity of inbound channels handed to backends.
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// A frame received by a backend.
#[derive(Clone, Debug)]
pub struct InboundFrame {
    pub kind: TransportKind,
    /// Sender address when the backend knows it
    pub from: Option<String>,
    pub frame: Bytes,
}

/// An open path to one remote address.
#[async_trait]
pub trait Link: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Remote address.
    fn address(&self) -> &str;

    /// Hand one frame to the backend. Returns once the backend has accepted
    /// it; delivery beyond that is not confirmed.
    async fn send_frame(&self, frame: Bytes) -> Result<()>;

    fn is_closed(&self) -> bool {
        false
    }
}

/// A transport implementation.
#[async_trait]
pub trait TransportBackend: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Address peers use to reach this backend.
    fn local_address(&self) -> String;

    async fn connect(&self, address: &str) -> Result<Arc<dyn Link>>;
}

//! # IICP - Intent-routed Inter-agent Communication Protocol
//!
//! Protocol core for agents that address each other by *intent* rather than
//! by address:
//! - **Envelope**: signed, length-prefixed binary messages
//! - **Intent**: capability registry and intent resolution
//! - **QoS**: class-based admission and weighted fair scheduling
//! - **Transport**: direct and overlay backends with retry and fallback
//! - **Security**: DID identities, handshakes, sessions and replay defense
//! - **Observability**: lifecycle and counter hooks, `tracing` setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use iicp::security::{AgentIdentity, DidDirectory, KeyResolver};
//! use iicp::{Envelope, ProtocolConfig, ProtocolNode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> iicp::Result<()> {
//!     let identity = AgentIdentity::generate();
//!     let directory = Arc::new(DidDirectory::new());
//!     directory.register(identity.document())?;
//!
//!     let mut config = ProtocolConfig::default();
//!     config.transport.tcp_listen = Some("0.0.0.0:7400".into());
//!     let resolver: Arc<dyn KeyResolver> = directory;
//!     let node = ProtocolNode::builder(identity, resolver, config).start().await?;
//!
//!     let request = Envelope::request("research:climate-analysis:run@2.1.0", "interactive")?;
//!     let receipt = node.submit(request).await?;
//!     println!("sent to {}", receipt.peer);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod envelope;
pub mod intent;
pub mod node;
pub mod observability;
pub mod qos;
pub mod security;
pub mod transport;

pub use config::ProtocolConfig;
pub use core::error::{Error, ErrorKind, Result};
pub use envelope::{Envelope, EnvelopeFlags, MessageType};
pub use intent::{CapabilityRecord, IntentIdentifier, IntentPattern};
pub use node::{NodeBuilder, NodeConfig, ProtocolNode, Subscription};
pub use transport::DeliveryReceipt;

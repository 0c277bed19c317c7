//! Security/Identity Manager.
//!
//! Provides identity and message authentication:
//! - self-certifying DIDs and key resolution
//! - DID-authenticated session handshakes
//! - per-envelope Ed25519 signatures over header and payload
//! - sliding-window replay protection

pub mod crypto;
pub mod handshake;
pub mod identity;
pub mod manager;
pub mod replay;
pub mod session;

pub use crypto::{sha3_256, CryptoSuite};
pub use handshake::{HandshakeAccept, HandshakeOffer, SUPPORTED_SCHEME};
pub use identity::{did_from_public_key, AgentIdentity, DidDirectory, DidDocument, KeyResolver};
pub use manager::{HandshakeExchange, Sealed, SecurityConfig, SecurityManager};
pub use replay::{CorrelationCache, ReplayScope, SequenceWindow};
pub use session::{Session, SessionRole, SessionState};

//! Agent identities and DID resolution.
//!
//! Identities are self-certifying: `did:iicp:<16 hex of sha3-256(pubkey)>`.
//! A resolved key is only trusted when it hashes back to the DID.

use crate::core::{now, Endpoint, Error, Result, Timestamp};
use crate::security::crypto::{sha3_256, verifying_key_from_bytes, CryptoSuite};
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// DID method prefix.
pub const DID_PREFIX: &str = "did:iicp:";

const KEY_TYPE: &str = "Ed25519VerificationKey2020";

/// Derive the DID for a public key.
pub fn did_from_public_key(public_key: &[u8; 32]) -> String {
    let hash = sha3_256(public_key);
    format!("{}{}", DID_PREFIX, &hash.to_hex()[..16])
}

/// Whether `did` is the self-certifying DID of `key`.
pub fn is_bound(did: &str, key: &VerifyingKey) -> bool {
    did_from_public_key(&key.to_bytes()) == did
}

/// A local agent identity: DID plus signing key.
#[derive(Clone, Debug)]
pub struct AgentIdentity {
    did: String,
    crypto: CryptoSuite,
}

impl AgentIdentity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self::from_suite(CryptoSuite::new())
    }

    /// Restore an identity from its secret key.
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self::from_suite(CryptoSuite::from_bytes(secret))
    }

    fn from_suite(crypto: CryptoSuite) -> Self {
        Self {
            did: did_from_public_key(&crypto.verifying_key_bytes()),
            crypto,
        }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.crypto.verifying_key_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.crypto.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.crypto.sign(message)
    }

    /// Public DID document for this identity.
    pub fn document(&self) -> DidDocument {
        DidDocument::new(&self.did, &self.public_key_bytes())
    }
}

/// A verification method in a DID Document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: String,
    pub controller: String,
    #[serde(rename = "publicKeyBase64")]
    pub public_key_base64: String,
}

/// A service endpoint in a DID Document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(rename = "serviceEndpoint")]
    pub endpoint: String,
}

/// DID Document for public discovery and verification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DidDocument {
    /// The DID this document describes
    pub id: String,
    #[serde(rename = "verificationMethod")]
    pub verification_method: Vec<VerificationMethod>,
    pub service: Vec<ServiceEndpoint>,
    pub created: Timestamp,
    pub updated: Timestamp,
}

impl DidDocument {
    /// Document with a single Ed25519 key.
    pub fn new(did: &str, public_key: &[u8; 32]) -> Self {
        let now = now();
        Self {
            id: did.to_string(),
            verification_method: vec![VerificationMethod {
                id: format!("{}#key-1", did),
                method_type: KEY_TYPE.to_string(),
                controller: did.to_string(),
                public_key_base64: base64::engine::general_purpose::STANDARD.encode(public_key),
            }],
            service: Vec::new(),
            created: now,
            updated: now,
        }
    }

    /// Advertise a reachable endpoint.
    pub fn with_service(mut self, endpoint: &Endpoint) -> Self {
        self.service.push(ServiceEndpoint {
            id: format!("{}#service-{}", self.id, self.service.len() + 1),
            service_type: endpoint.kind.to_string(),
            endpoint: endpoint.address.clone(),
        });
        self.updated = now();
        self
    }

    /// The document's Ed25519 key.
    pub fn primary_key(&self) -> Result<VerifyingKey> {
        let method = self
            .verification_method
            .iter()
            .find(|m| m.method_type == KEY_TYPE)
            .ok_or_else(|| Error::auth(format!("{} has no Ed25519 key", self.id)))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&method.public_key_base64)
            .map_err(|e| Error::auth(format!("bad key encoding for {}: {}", self.id, e)))?;
        verifying_key_from_bytes(&bytes)
    }

    /// Check that the document's key hashes to its DID.
    pub fn verify_binding(&self) -> Result<VerifyingKey> {
        let key = self.primary_key()?;
        if !is_bound(&self.id, &key) {
            return Err(Error::auth(format!("key does not match {}", self.id)));
        }
        Ok(key)
    }
}

/// Independent source of truth for DID public keys.
pub trait KeyResolver: Send + Sync {
    /// Resolve the verifying key for a DID.
    fn resolve_key(&self, did: &str) -> Result<VerifyingKey>;
}

/// In-memory DID directory.
#[derive(Debug, Default)]
pub struct DidDirectory {
    documents: RwLock<HashMap<String, DidDocument>>,
}

impl DidDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a document after checking its DID/key binding.
    pub fn register(&self, document: DidDocument) -> Result<()> {
        document.verify_binding()?;
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        documents.insert(document.id.clone(), document);
        Ok(())
    }

    pub fn get(&self, did: &str) -> Option<DidDocument> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        documents.get(did).cloned()
    }

    pub fn remove(&self, did: &str) -> Option<DidDocument> {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        documents.remove(did)
    }

    pub fn len(&self) -> usize {
        self.documents.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyResolver for DidDirectory {
    fn resolve_key(&self, did: &str) -> Result<VerifyingKey> {
        self.get(did)
            .ok_or_else(|| Error::auth(format!("unknown DID {}", did)))?
            .verify_binding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_did_format() {
        let identity = AgentIdentity::generate();
        assert!(identity.did().starts_with(DID_PREFIX));
        assert_eq!(identity.did().len(), DID_PREFIX.len() + 16);
        assert!(is_bound(identity.did(), &identity.verifying_key()));
    }

    #[test]
    fn test_identity_from_secret_is_stable() {
        let identity = AgentIdentity::generate();
        let restored = AgentIdentity::from_secret(&identity.crypto.signing_key_bytes());
        assert_eq!(restored.did(), identity.did());
    }

    #[test]
    fn test_directory_resolves_registered_key() {
        let identity = AgentIdentity::generate();
        let directory = DidDirectory::new();
        directory
            .register(identity.document().with_service(&Endpoint::direct("127.0.0.1:7400")))
            .unwrap();

        let key = directory.resolve_key(identity.did()).unwrap();
        assert_eq!(key.to_bytes(), identity.public_key_bytes());
        assert_eq!(directory.get(identity.did()).unwrap().service.len(), 1);
    }

    #[test]
    fn test_unknown_did_fails_authentication() {
        let directory = DidDirectory::new();
        let err = directory.resolve_key("did:iicp:0000000000000000").unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::AuthenticationFailed);
    }

    #[test]
    fn test_mismatched_document_rejected() {
        let a = AgentIdentity::generate();
        let b = AgentIdentity::generate();
        let forged = DidDocument::new(a.did(), &b.public_key_bytes());
        assert!(DidDirectory::new().register(forged).is_err());
    }

    #[test]
    fn test_document_json_shape() {
        let doc = AgentIdentity::generate().document();
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["verificationMethod"][0]["publicKeyBase64"].is_string());
        let parsed: DidDocument = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, doc);
    }
}

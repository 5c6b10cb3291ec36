//! Identities, keys and published peer documents.
//!
//! A peer is addressed by a decentralized identifier ([`PeerId`]) and publishes
//! a [`PeerDocument`] carrying its Ed25519 identity key, its X25519 exchange
//! key, a signed pre-key and the relay endpoints ("mailboxes") it can be
//! reached on. The identifier scheme and document resolution live outside
//! this crate; only the fields the core relies on are modelled here.
//!
//! Local secret keys are wrapped in [`KeyHandle`], which pairs the opaque key
//! with an optional exportable serialized form produced at generation time.

use crate::error::{CoreError, Result};
use crate::hash::{Hash, hex_array};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Decentralized identifier of a peer (`did:<method>:<id>`)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Parse a DID string
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidState`] if the string is not of the form
    /// `did:<method>:<id>`.
    pub fn new(did: impl Into<String>) -> Result<Self> {
        let did = did.into();
        let mut parts = did.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("did"), Some(method), Some(id)) if !method.is_empty() && !id.is_empty() => {
                Ok(Self(did))
            }
            _ => Err(CoreError::InvalidState(Cow::Owned(format!(
                "not a DID: {did}"
            )))),
        }
    }

    /// The DID string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// Ed25519 identity (signing) public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(#[serde(with = "hex_array")] [u8; 32]);

impl IdentityKey {
    /// Wrap raw public key bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Verify `signature` over `message`
    ///
    /// Returns false for keys that are not valid curve points.
    #[must_use]
    pub fn verifies(&self, message: &[u8], signature: &KeySignature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &signature).is_ok()
    }

    /// First 8 bytes in hex, for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", self.short())
    }
}

/// X25519 public key used as exchange key, signed pre-key or relay pre-key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreKey(#[serde(with = "hex_array")] [u8; 32]);

impl PreKey {
    /// Wrap raw public key bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// SHA-256 thumbprint of the key
    #[must_use]
    pub fn thumbprint(&self) -> Hash {
        Hash::sha256(&self.0)
    }
}

impl fmt::Debug for PreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PreKey({})", hex::encode(&self.0[..8]))
    }
}

/// Ed25519 signature bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySignature(#[serde(with = "hex_array")] [u8; 64]);

impl KeySignature {
    /// Wrap raw signature bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for KeySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySignature({}..)", hex::encode(&self.0[..8]))
    }
}

/// Pre-key signed by the owner's identity key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// The pre-key
    pub key: PreKey,
    /// Identity-key signature over the pre-key bytes
    pub signature: KeySignature,
}

impl SignedPreKey {
    /// Check the signature against `identity`
    #[must_use]
    pub fn verifies_with(&self, identity: &IdentityKey) -> bool {
        identity.verifies(self.key.as_bytes(), &self.signature)
    }
}

/// Relay endpoint a peer can be reached on
///
/// Self-generated configs carry only the URL. Propagated configs also carry
/// the relay-issued pre-key and the owner's signature over it, and must pass
/// [`crate::endpoints::validate_endpoint`] before use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Relay URL
    pub url: String,
    /// Relay pre-key for this mailbox
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_key: Option<PreKey>,
    /// Signature over `pre_key` by the mailbox owner's identity key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<KeySignature>,
}

impl EndpointConfig {
    /// Self-generated endpoint (URL only)
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pre_key: None,
            signature: None,
        }
    }

    /// Endpoint carrying relay pre-key material
    #[must_use]
    pub fn propagated(url: impl Into<String>, pre_key: PreKey, signature: KeySignature) -> Self {
        Self {
            url: url.into(),
            pre_key: Some(pre_key),
            signature: Some(signature),
        }
    }

    /// True if the config carries any relay-issued material
    #[must_use]
    pub fn is_propagated(&self) -> bool {
        self.pre_key.is_some() || self.signature.is_some()
    }
}

/// Published description of a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDocument {
    /// Peer DID
    pub id: PeerId,
    /// Ed25519 identity key
    pub identity_key: IdentityKey,
    /// X25519 identity exchange key
    pub exchange_key: PreKey,
    /// Signed pre-key for session initiation
    pub signed_pre_key: SignedPreKey,
    /// Relay endpoints currently advertised
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// Opaque key paired with an optional exportable serialized form
///
/// The exportable form is produced by key generation itself, so serialization
/// never has to reconstruct it from the opaque handle.
pub struct KeyHandle<K> {
    opaque: K,
    exportable: Option<String>,
}

impl<K> KeyHandle<K> {
    /// Wrap an opaque key
    pub fn new(opaque: K, exportable: Option<String>) -> Self {
        Self { opaque, exportable }
    }

    /// The opaque key
    pub fn key(&self) -> &K {
        &self.opaque
    }

    /// Serialized form, if the key was generated exportable
    pub fn exportable(&self) -> Option<&str> {
        self.exportable.as_deref()
    }
}

impl<K> fmt::Debug for KeyHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("exportable", &self.exportable.is_some())
            .finish()
    }
}

impl KeyHandle<SigningKey> {
    fn generate_signing(exportable: bool) -> Self {
        let key = SigningKey::generate(&mut OsRng);
        let export = exportable.then(|| hex::encode(key.to_bytes()));
        Self::new(key, export)
    }
}

impl KeyHandle<StaticSecret> {
    fn generate_exchange(exportable: bool) -> Self {
        let key = StaticSecret::random_from_rng(OsRng);
        let export = exportable.then(|| hex::encode(key.to_bytes()));
        Self::new(key, export)
    }
}

/// Serialized local identity (only available for exportable identities)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedIdentity {
    /// Local DID
    pub id: PeerId,
    /// Ed25519 secret key (hex)
    pub signing_key: String,
    /// X25519 exchange secret (hex)
    pub exchange_key: String,
    /// X25519 signed pre-key secret (hex)
    pub pre_key: String,
    /// Registered endpoints
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// The local identity: secret keys plus the published endpoint list
#[derive(Debug)]
pub struct LocalIdentity {
    id: PeerId,
    signing: KeyHandle<SigningKey>,
    exchange: KeyHandle<StaticSecret>,
    pre_key: KeyHandle<StaticSecret>,
    signed_pre_key: SignedPreKey,
    endpoints: Vec<EndpointConfig>,
}

impl LocalIdentity {
    /// Generate fresh keys for `id`
    ///
    /// With `exportable` set, every key keeps a serialized form so the
    /// identity can later be written out with [`LocalIdentity::export`].
    #[must_use]
    pub fn generate(id: PeerId, exportable: bool) -> Self {
        let signing = KeyHandle::generate_signing(exportable);
        let exchange = KeyHandle::generate_exchange(exportable);
        let pre_key = KeyHandle::generate_exchange(exportable);
        Self::assemble(id, signing, exchange, pre_key, Vec::new())
    }

    /// Restore an identity written by [`LocalIdentity::export`]
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Serialization`] if a key is not valid hex of the
    /// right length.
    pub fn import(exported: &ExportedIdentity) -> Result<Self> {
        let signing_bytes = decode_secret(&exported.signing_key)?;
        let exchange_bytes = decode_secret(&exported.exchange_key)?;
        let pre_key_bytes = decode_secret(&exported.pre_key)?;

        let signing = KeyHandle::new(
            SigningKey::from_bytes(&signing_bytes),
            Some(exported.signing_key.clone()),
        );
        let exchange = KeyHandle::new(
            StaticSecret::from(exchange_bytes),
            Some(exported.exchange_key.clone()),
        );
        let pre_key = KeyHandle::new(
            StaticSecret::from(pre_key_bytes),
            Some(exported.pre_key.clone()),
        );

        Ok(Self::assemble(
            exported.id.clone(),
            signing,
            exchange,
            pre_key,
            exported.endpoints.clone(),
        ))
    }

    fn assemble(
        id: PeerId,
        signing: KeyHandle<SigningKey>,
        exchange: KeyHandle<StaticSecret>,
        pre_key: KeyHandle<StaticSecret>,
        endpoints: Vec<EndpointConfig>,
    ) -> Self {
        let pre_public = PreKey(X25519Public::from(pre_key.key()).to_bytes());
        let signature = KeySignature(signing.key().sign(pre_public.as_bytes()).to_bytes());
        Self {
            id,
            signing,
            exchange,
            pre_key,
            signed_pre_key: SignedPreKey {
                key: pre_public,
                signature,
            },
            endpoints,
        }
    }

    /// Serialize every key, if the identity was generated exportable
    #[must_use]
    pub fn export(&self) -> Option<ExportedIdentity> {
        Some(ExportedIdentity {
            id: self.id.clone(),
            signing_key: self.signing.exportable()?.to_string(),
            exchange_key: self.exchange.exportable()?.to_string(),
            pre_key: self.pre_key.exportable()?.to_string(),
            endpoints: self.endpoints.clone(),
        })
    }

    /// Local DID
    #[must_use]
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Ed25519 identity public key
    #[must_use]
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey(self.signing.key().verifying_key().to_bytes())
    }

    /// X25519 exchange public key
    #[must_use]
    pub fn exchange_key(&self) -> PreKey {
        PreKey(X25519Public::from(self.exchange.key()).to_bytes())
    }

    /// Signed pre-key currently on file
    #[must_use]
    pub fn signed_pre_key(&self) -> &SignedPreKey {
        &self.signed_pre_key
    }

    /// X25519 exchange secret, for cipher suites
    #[must_use]
    pub fn exchange_secret(&self) -> &StaticSecret {
        self.exchange.key()
    }

    /// X25519 signed pre-key secret, for cipher suites
    #[must_use]
    pub fn pre_key_secret(&self) -> &StaticSecret {
        self.pre_key.key()
    }

    /// Sign `message` with the identity key
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> KeySignature {
        KeySignature(self.signing.key().sign(message).to_bytes())
    }

    /// Endpoints registered for this identity
    #[must_use]
    pub fn endpoints(&self) -> &[EndpointConfig] {
        &self.endpoints
    }

    /// Add or replace the endpoint with the same URL
    pub fn upsert_endpoint(&mut self, endpoint: EndpointConfig) {
        match self.endpoints.iter_mut().find(|e| e.url == endpoint.url) {
            Some(existing) => *existing = endpoint,
            None => self.endpoints.push(endpoint),
        }
    }

    /// Remove the endpoint with `url`, returning whether it was present
    pub fn remove_endpoint(&mut self, url: &str) -> bool {
        let before = self.endpoints.len();
        self.endpoints.retain(|e| e.url != url);
        self.endpoints.len() != before
    }

    /// The document other peers resolve for this identity
    #[must_use]
    pub fn document(&self) -> PeerDocument {
        PeerDocument {
            id: self.id.clone(),
            identity_key: self.identity_key(),
            exchange_key: self.exchange_key(),
            signed_pre_key: self.signed_pre_key,
            endpoints: self.endpoints.clone(),
        }
    }
}

fn decode_secret(s: &str) -> Result<[u8; 32]> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(s, &mut bytes)
        .map_err(|e| CoreError::Serialization(Cow::Owned(format!("invalid key: {e}"))))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> LocalIdentity {
        LocalIdentity::generate(PeerId::new("did:key:alice").unwrap(), true)
    }

    #[test]
    fn test_peer_id_parsing() {
        assert!(PeerId::new("did:key:z6Mk").is_ok());
        assert!(PeerId::new("did:web:example.com:user").is_ok());
        assert!(PeerId::new("key:z6Mk").is_err());
        assert!(PeerId::new("did::x").is_err());
        assert!(PeerId::new("did:key:").is_err());
    }

    #[test]
    fn test_peer_id_serde_validates() {
        let id: PeerId = serde_json::from_str("\"did:key:bob\"").unwrap();
        assert_eq!(id.as_str(), "did:key:bob");
        assert!(serde_json::from_str::<PeerId>("\"bob\"").is_err());
    }

    #[test]
    fn test_signed_pre_key_verifies() {
        let identity = alice();
        let spk = identity.signed_pre_key();
        assert!(spk.verifies_with(&identity.identity_key()));

        let other = LocalIdentity::generate(PeerId::new("did:key:mallory").unwrap(), false);
        assert!(!spk.verifies_with(&other.identity_key()));
    }

    #[test]
    fn test_document_reflects_identity() {
        let mut identity = alice();
        identity.upsert_endpoint(EndpointConfig::new("wss://relay-a.example"));
        identity.upsert_endpoint(EndpointConfig::new("wss://relay-b.example"));
        identity.upsert_endpoint(EndpointConfig::new("wss://relay-a.example"));

        let doc = identity.document();
        assert_eq!(doc.id, *identity.id());
        assert_eq!(doc.identity_key, identity.identity_key());
        assert_eq!(doc.endpoints.len(), 2);

        assert!(identity.remove_endpoint("wss://relay-b.example"));
        assert!(!identity.remove_endpoint("wss://relay-b.example"));
        assert_eq!(identity.document().endpoints.len(), 1);
    }

    #[test]
    fn test_export_import_preserves_keys() {
        let identity = alice();
        let exported = identity.export().expect("exportable identity");
        let restored = LocalIdentity::import(&exported).unwrap();

        assert_eq!(restored.identity_key(), identity.identity_key());
        assert_eq!(restored.exchange_key(), identity.exchange_key());
        assert_eq!(restored.signed_pre_key().key, identity.signed_pre_key().key);
    }

    #[test]
    fn test_non_exportable_identity_cannot_export() {
        let identity = LocalIdentity::generate(PeerId::new("did:key:carol").unwrap(), false);
        assert!(identity.export().is_none());
        assert!(format!("{:?}", identity).contains("exportable: false"));
    }

    #[test]
    fn test_document_json_shape() {
        let doc = alice().document();
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["id"], "did:key:alice");
        assert_eq!(json["identity_key"].as_str().unwrap().len(), 64);
        assert_eq!(
            json["signed_pre_key"]["signature"].as_str().unwrap().len(),
            128
        );

        let back: PeerDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
    }
}

//! Ratchet cipher boundary
//!
//! The double-ratchet primitives are supplied by the embedding application
//! through [`CipherSuite`]. The core only needs three things from it:
//!
//! 1. Start an outbound session from a peer's published key bundle.
//! 2. Recognise and accept an inbound first-contact (handshake) ciphertext.
//! 3. Encrypt and decrypt opaque blobs on an established session.
//!
//! Both sides derive the session id as `BLAKE3(base_key)`, where `base_key` is
//! the initiator's public key material embedded in the handshake.

use crate::error::CoreError;
use crate::identity::{IdentityKey, LocalIdentity, PreKey, SignedPreKey};
use std::borrow::Cow;
use thiserror::Error;

/// Errors reported by cipher implementations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Bytes are an ordinary ratchet message, not a handshake
    #[error("not a handshake message")]
    NotHandshake,

    /// Handshake material is malformed or fails verification
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// Ciphertext could not be decrypted
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// Plaintext could not be encrypted
    #[error("encryption failed: {0}")]
    Encrypt(String),
}

impl From<CipherError> for CoreError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::NotHandshake => CoreError::handshake("not a handshake message"),
            CipherError::Handshake(reason) => CoreError::Handshake(Cow::Owned(reason)),
            CipherError::Decrypt(reason) => CoreError::Decryption(Cow::Owned(reason)),
            CipherError::Encrypt(reason) => {
                CoreError::InvalidState(Cow::Owned(format!("encryption failed: {reason}")))
            }
        }
    }
}

/// One established ratchet
pub trait RatchetCipher: Send {
    /// Encrypt one plaintext blob, advancing the sending chain
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Decrypt one ciphertext blob, advancing the receiving chain
    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// Key material needed to start a session with a peer
#[derive(Debug, Clone)]
pub struct HandshakeBundle {
    /// Peer Ed25519 identity key
    pub identity_key: IdentityKey,
    /// Peer X25519 identity exchange key
    pub exchange_key: PreKey,
    /// Peer signed pre-key (already verified)
    pub signed_pre_key: SignedPreKey,
    /// Pre-key of the relay endpoint the session is opened through
    pub relay_pre_key: Option<PreKey>,
}

/// Result of starting an outbound session
pub struct OutboundHandshake {
    /// The new ratchet; its first ciphertext carries the handshake
    pub cipher: Box<dyn RatchetCipher>,
    /// Initiator public key material the session id is derived from
    pub base_key: [u8; 32],
}

/// Result of accepting an inbound handshake
pub struct InboundHandshake {
    /// The new ratchet
    pub cipher: Box<dyn RatchetCipher>,
    /// Initiator public key material the session id is derived from
    pub base_key: [u8; 32],
    /// Identity key of the initiator
    pub peer_identity_key: IdentityKey,
    /// Decrypted first message carried by the handshake
    pub plaintext: Vec<u8>,
}

/// Factory for ratchet sessions
pub trait CipherSuite: Send + Sync {
    /// Start a session towards the owner of `bundle`
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Handshake`] if the bundle cannot be used.
    fn initiate(
        &self,
        local: &LocalIdentity,
        bundle: &HandshakeBundle,
    ) -> Result<OutboundHandshake, CipherError>;

    /// Accept a first-contact ciphertext addressed to `local`
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::NotHandshake`] for ordinary ratchet messages and
    /// [`CipherError::Handshake`] for malformed handshakes.
    fn accept(&self, local: &LocalIdentity, bytes: &[u8]) -> Result<InboundHandshake, CipherError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_error_mapping() {
        let err: CoreError = CipherError::Decrypt("bad tag".into()).into();
        assert!(matches!(err, CoreError::Decryption(_)));
        assert!(err.is_transient());

        let err: CoreError = CipherError::Handshake("bad key".into()).into();
        assert!(matches!(err, CoreError::Handshake(_)));
        assert!(err.is_permanent());

        let err: CoreError = CipherError::Encrypt("chain exhausted".into()).into();
        assert!(err.to_string().contains("chain exhausted"));
    }
}

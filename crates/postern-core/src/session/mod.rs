//! Ratchet sessions and their registry
//!
//! A [`Session`] wraps one established ratchet with the peer identity key it
//! belongs to. Sessions are owned by the shared [`SessionRegistry`]; endpoints
//! and outboxes only ever refer to them through the registry so that creation
//! and removal stay consistent across concurrent sends.

mod registry;

pub use registry::{InboundBatch, SessionRegistry};

use crate::cipher::RatchetCipher;
use crate::error::{CoreError, Result};
use crate::hash::Hash;
use crate::identity::IdentityKey;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// One established ratchet session with a peer
pub struct Session {
    id: Hash,
    peer_identity_key: IdentityKey,
    cipher: Mutex<Box<dyn RatchetCipher>>,
    created_at: Instant,
    ttl: Duration,
    first_use: AtomicBool,
}

impl Session {
    /// Wrap a freshly established ratchet
    pub fn new(
        id: Hash,
        peer_identity_key: IdentityKey,
        cipher: Box<dyn RatchetCipher>,
        ttl: Duration,
    ) -> Self {
        Self {
            id,
            peer_identity_key,
            cipher: Mutex::new(cipher),
            created_at: Instant::now(),
            ttl,
            first_use: AtomicBool::new(true),
        }
    }

    /// Deterministic session id (`BLAKE3(base_key)`)
    #[must_use]
    pub fn id(&self) -> Hash {
        self.id
    }

    /// Identity key of the remote peer
    #[must_use]
    pub fn peer_identity_key(&self) -> IdentityKey {
        self.peer_identity_key
    }

    /// Time since creation
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// True once the session outlived its time-to-live
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.age() > self.ttl
    }

    /// True until the first successful flush over this session
    #[must_use]
    pub fn is_first_use(&self) -> bool {
        self.first_use.load(Ordering::Acquire)
    }

    /// Record a successful flush
    pub fn mark_used(&self) {
        self.first_use.store(false, Ordering::Release);
    }

    /// Encrypt a batch plaintext
    ///
    /// # Errors
    ///
    /// Propagates cipher failures.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut cipher = self.cipher.lock().await;
        cipher.encrypt(plaintext).map_err(CoreError::from)
    }

    /// Decrypt a ciphertext received on this session
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Decryption`] if the ratchet rejects the bytes.
    pub async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut cipher = self.cipher.lock().await;
        cipher.decrypt(ciphertext).map_err(CoreError::from)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_identity_key", &self.peer_identity_key)
            .field("age", &self.age())
            .field("first_use", &self.is_first_use())
            .finish()
    }
}

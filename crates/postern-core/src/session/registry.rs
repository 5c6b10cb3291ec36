//! Session registry
//!
//! Owns every live [`Session`], indexed by id and by "preferred session for
//! a peer identity key".
//!
//! # Inbound flow
//!
//! ```text
//! incoming_data(id, bytes)
//!     |
//!     +-- id known, not expired ----> decrypt, mark preferred
//!     |
//!     +-- id unknown --> parse_incoming
//!                          |
//!                          +-- handshake ------> register, decrypt, drain pending[id]
//!                          +-- NotHandshake --+-- id expired here --> drop
//!                          |                  +-- otherwise --------> pending[id]
//!                          +-- other error ----> reject
//! ```
//!
//! Expiry is checked on every lookup; there is no background sweep.

use crate::cipher::{CipherError, CipherSuite, HandshakeBundle, OutboundHandshake};
use crate::config::CoreConfig;
use crate::dead_letter::DeadLetterQueue;
use crate::envelope::{Envelope, decode_batch};
use crate::error::{CoreError, Result};
use crate::hash::Hash;
use crate::identity::{EndpointConfig, IdentityKey, LocalIdentity, PeerDocument};
use crate::session::Session;
use dashmap::DashMap;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Envelopes decrypted from one ciphertext
#[derive(Debug, Clone)]
pub struct InboundBatch {
    /// Identity key of the sender, as bound to the session
    pub peer_identity_key: IdentityKey,
    /// Session the ciphertext arrived on
    pub session_id: Hash,
    /// Decrypted envelopes, in batch order
    pub messages: Vec<Envelope>,
}

/// Registry of live sessions shared by all peers and endpoints
pub struct SessionRegistry {
    /// Local identity (keys for handshakes)
    local: Arc<RwLock<LocalIdentity>>,

    /// Ratchet implementation
    suite: Arc<dyn CipherSuite>,

    /// Session lifetime
    ttl: Duration,

    /// Live sessions (session id -> session)
    sessions: DashMap<Hash, Arc<Session>>,

    /// Preferred session per peer (identity key -> session id)
    preferred: DashMap<IdentityKey, Hash>,

    /// Ciphertext that arrived before its handshake (session id -> bytes)
    pending: DeadLetterQueue<Hash, Vec<u8>>,

    /// Ids of sessions recently evicted for age; their traffic is not parked
    expired: std::sync::Mutex<LruCache<Hash, ()>>,

    /// Serializes first-contact handling so pending data cannot be stranded
    inbound: Mutex<()>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(
        local: Arc<RwLock<LocalIdentity>>,
        suite: Arc<dyn CipherSuite>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            local,
            suite,
            ttl: config.session.ttl,
            sessions: DashMap::new(),
            preferred: DashMap::new(),
            pending: DeadLetterQueue::new(
                config.inbound.dead_letter_keys,
                config.inbound.dead_letter_per_key,
            ),
            expired: std::sync::Mutex::new(LruCache::new(
                NonZeroUsize::new(config.inbound.dead_letter_keys).unwrap_or(NonZeroUsize::MIN),
            )),
            inbound: Mutex::new(()),
        }
    }

    /// Start an outbound session with the owner of `document`
    ///
    /// The session becomes the peer's preferred session if it has none.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Handshake`] if the document's signed pre-key does
    /// not verify or the cipher rejects the bundle.
    pub async fn create(
        &self,
        document: &PeerDocument,
        endpoint: &EndpointConfig,
    ) -> Result<Arc<Session>> {
        if !document
            .signed_pre_key
            .verifies_with(&document.identity_key)
        {
            tracing::warn!("Signed pre-key of {} does not verify", document.id);
            return Err(CoreError::handshake("signed pre-key signature invalid"));
        }

        let bundle = HandshakeBundle {
            identity_key: document.identity_key,
            exchange_key: document.exchange_key,
            signed_pre_key: document.signed_pre_key,
            relay_pre_key: endpoint.pre_key,
        };

        let OutboundHandshake { cipher, base_key } = {
            let local = self.local.read().await;
            self.suite.initiate(&local, &bundle)?
        };

        let id = Hash::blake3(&base_key);
        let session = Arc::new(Session::new(id, document.identity_key, cipher, self.ttl));
        self.sessions.insert(id, session.clone());
        if self.preferred_for(&document.identity_key).is_none() {
            self.preferred.insert(document.identity_key, id);
        }

        tracing::info!(
            "Created outbound session {} with {} via {}",
            id.short(),
            document.id,
            endpoint.url
        );

        Ok(session)
    }

    /// Accept a first-contact handshake claimed to belong to `claimed`
    ///
    /// On success the session is registered as the sender's preferred session
    /// and the first batch carried by the handshake is returned.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotHandshake`] if the bytes are an ordinary message
    /// - [`CoreError::SessionIdMismatch`] if the derived id differs from `claimed`
    /// - [`CoreError::Handshake`] for malformed handshakes
    pub async fn parse_incoming(
        &self,
        claimed: Hash,
        bytes: &[u8],
    ) -> Result<(Arc<Session>, Vec<Envelope>)> {
        let accepted = {
            let local = self.local.read().await;
            self.suite.accept(&local, bytes)
        };
        let handshake = match accepted {
            Ok(handshake) => handshake,
            Err(CipherError::NotHandshake) => return Err(CoreError::NotHandshake(claimed)),
            Err(e) => return Err(e.into()),
        };

        let derived = Hash::blake3(&handshake.base_key);
        if derived != claimed {
            tracing::warn!(
                "Rejecting handshake: claimed session {} but derived {}",
                claimed.short(),
                derived.short()
            );
            return Err(CoreError::SessionIdMismatch { claimed, derived });
        }

        let messages = decode_batch(&handshake.plaintext)?;
        let session = Arc::new(Session::new(
            derived,
            handshake.peer_identity_key,
            handshake.cipher,
            self.ttl,
        ));
        self.sessions.insert(derived, session.clone());
        self.preferred.insert(handshake.peer_identity_key, derived);

        tracing::info!(
            "Accepted inbound session {} from {}",
            derived.short(),
            handshake.peer_identity_key.short()
        );

        Ok((session, messages))
    }

    /// Decrypt ciphertext that arrived on `session_id`
    ///
    /// Returns one batch for ordinary traffic, the handshake batch followed by
    /// any previously parked batches for a first contact, or nothing when the
    /// bytes were parked to wait for their handshake.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Decryption`] for undecryptable ciphertext on a known
    /// session and the [`SessionRegistry::parse_incoming`] errors otherwise.
    pub async fn incoming_data(&self, session_id: Hash, bytes: &[u8]) -> Result<Vec<InboundBatch>> {
        if let Some(session) = self.get(&session_id) {
            return self.decrypt_known(&session, bytes).await.map(|b| vec![b]);
        }

        let _guard = self.inbound.lock().await;

        // the handshake may have been processed while we waited
        if let Some(session) = self.get(&session_id) {
            return self.decrypt_known(&session, bytes).await.map(|b| vec![b]);
        }

        let (session, messages) = match self.parse_incoming(session_id, bytes).await {
            Ok(parsed) => parsed,
            Err(CoreError::NotHandshake(id)) if self.was_expired(&id) => {
                tracing::debug!("Dropping ciphertext for expired session {}", id.short());
                return Ok(Vec::new());
            }
            Err(CoreError::NotHandshake(id)) => {
                tracing::debug!("Parking ciphertext for unknown session {}", id.short());
                if self.pending.push(id, bytes.to_vec()).await {
                    tracing::warn!("Dropped parked ciphertext for session {}", id.short());
                }
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut batches = vec![InboundBatch {
            peer_identity_key: session.peer_identity_key(),
            session_id,
            messages,
        }];

        let parked = self.pending.take(&session_id).await;
        if !parked.is_empty() {
            tracing::debug!(
                "Draining {} parked ciphertexts for session {}",
                parked.len(),
                session_id.short()
            );
        }
        for ciphertext in parked {
            match self.decrypt_known(&session, &ciphertext).await {
                Ok(batch) => batches.push(batch),
                Err(e) => tracing::warn!(
                    "Discarding parked ciphertext for session {}: {}",
                    session_id.short(),
                    e
                ),
            }
        }

        Ok(batches)
    }

    async fn decrypt_known(&self, session: &Arc<Session>, bytes: &[u8]) -> Result<InboundBatch> {
        let plaintext = session.decrypt(bytes).await?;
        let messages = decode_batch(&plaintext)?;
        self.preferred
            .insert(session.peer_identity_key(), session.id());
        tracing::trace!(
            "Decrypted {} envelopes on session {}",
            messages.len(),
            session.id().short()
        );
        Ok(InboundBatch {
            peer_identity_key: session.peer_identity_key(),
            session_id: session.id(),
            messages,
        })
    }

    /// Look up a live session, evicting it if expired
    #[must_use]
    pub fn get(&self, id: &Hash) -> Option<Arc<Session>> {
        let session = self.sessions.get(id).map(|entry| entry.value().clone())?;
        if session.is_expired() {
            tracing::info!(
                "Session {} expired after {:?}",
                id.short(),
                session.age()
            );
            self.remove_session(id);
            self.expired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .put(*id, ());
            return None;
        }
        Some(session)
    }

    fn was_expired(&self, id: &Hash) -> bool {
        self.expired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// The session used by default for `peer`
    #[must_use]
    pub fn preferred_for(&self, peer: &IdentityKey) -> Option<Arc<Session>> {
        let id = self.preferred.get(peer).map(|entry| *entry.value())?;
        let session = self.get(&id);
        if session.is_none() {
            self.preferred.remove_if(peer, |_, current| *current == id);
        }
        session
    }

    /// Forget the preferred session of `peer` (the session itself stays)
    pub fn reset_preferred(&self, peer: &IdentityKey) {
        if let Some((_, id)) = self.preferred.remove(peer) {
            tracing::debug!("Reset preferred session {} for {}", id.short(), peer.short());
        }
    }

    /// Remove one session
    pub fn remove_session(&self, id: &Hash) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        self.preferred
            .remove_if(&session.peer_identity_key(), |_, current| current == id);
        Some(session)
    }

    /// Purge sessions of `peer`
    ///
    /// Non-preferred sessions are always removed; the preferred one only when
    /// `delete_active` is set. Returns the number of sessions removed.
    pub fn remove_all_sessions_for_peer(&self, peer: &IdentityKey, delete_active: bool) -> usize {
        let active = self.preferred.get(peer).map(|entry| *entry.value());
        let before = self.sessions.len();

        self.sessions.retain(|id, session| {
            session.peer_identity_key() != *peer || (!delete_active && Some(*id) == active)
        });
        if delete_active {
            self.preferred.remove(peer);
        }

        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::info!(
                "Removed {} sessions for {} (delete_active: {})",
                removed,
                peer.short(),
                delete_active
            );
        }
        removed
    }

    /// Number of sessions held, expired ones included until looked up
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True if no session is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

//! Top-level coordinator
//!
//! [`Messenger`] owns the session registry, one [`PeerOutbox`] per remote
//! peer, the inbound middleware and the per-peer lock table. Outbound, it
//! materializes peers on demand and hands messages to their outbox. Inbound,
//! it feeds relay deliveries through the registry and middleware and
//! dispatches the result: acknowledgements update outboxes, protocol messages
//! update peer state, and everything else reaches the application as
//! [`CoreEvent::Message`].

use crate::cipher::CipherSuite;
use crate::config::CoreConfig;
use crate::endpoints::EndpointRegistry;
use crate::envelope::{
    AckKind, AckPayload, Envelope, PreferredEndpointPayload, SessionResetPayload, kinds,
};
use crate::error::{CoreError, Result};
use crate::events::{self, CoreEvent, EventReceiver};
use crate::hash::Hash;
use crate::identity::{ExportedIdentity, IdentityKey, LocalIdentity, PeerDocument, PeerId};
use crate::inbound::{InboundContext, InboundMiddleware};
use crate::locks::{LockKind, LockTable};
use crate::outbox::{DeliveryContext, PeerOutbox, Relationship};
use crate::session::SessionRegistry;
use crate::split::MessageSplitter;
use crate::transport::{DocumentPublisher, DocumentResolver, RelayConnector, Transport};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lru::LruCache;
use serde_json::Value;
use std::borrow::Cow;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;

/// Session and delivery core for one local identity
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<MessengerInner>,
}

struct MessengerInner {
    ctx: Arc<DeliveryContext>,
    peers: DashMap<PeerId, Arc<PeerOutbox>>,
    keys: DashMap<IdentityKey, PeerId>,
    middleware: InboundMiddleware,
    processed_resets: Mutex<LruCache<Hash, ()>>,
    /// Receipt deliveries still in flight
    receipts: Mutex<JoinSet<()>>,
}

impl Messenger {
    /// Create a messenger and the event stream it reports to
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if `config` does not validate.
    pub fn new(
        config: CoreConfig,
        local: LocalIdentity,
        suite: Arc<dyn CipherSuite>,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn DocumentResolver>,
    ) -> Result<(Self, EventReceiver)> {
        config.validate()?;

        tracing::info!("Starting messenger for {}", local.id());
        let local = Arc::new(RwLock::new(local));
        let registry = Arc::new(SessionRegistry::new(local.clone(), suite, &config));
        let (events, receiver) = events::channel();
        let resets = NonZeroUsize::new(config.inbound.processed_resets).unwrap_or(NonZeroUsize::MIN);

        let inner = MessengerInner {
            middleware: InboundMiddleware::new(&config),
            processed_resets: Mutex::new(LruCache::new(resets)),
            receipts: Mutex::new(JoinSet::new()),
            peers: DashMap::new(),
            keys: DashMap::new(),
            ctx: Arc::new(DeliveryContext {
                locks: LockTable::new(config.locks.clone()),
                splitter: MessageSplitter::new(&config),
                config,
                local,
                local_preferred: RwLock::new(None),
                registry,
                transport,
                resolver,
                events,
            }),
        };

        Ok((
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        ))
    }

    /// Local peer id
    pub async fn local_id(&self) -> PeerId {
        self.inner.ctx.local.read().await.id().clone()
    }

    /// Current local document
    pub async fn local_document(&self) -> PeerDocument {
        self.inner.ctx.local.read().await.document()
    }

    /// Serialized local identity, if it was created exportable
    pub async fn export_identity(&self) -> Option<ExportedIdentity> {
        self.inner.ctx.local.read().await.export()
    }

    /// Registry managing the local identity's relay mailboxes
    #[must_use]
    pub fn endpoint_registry(
        &self,
        connector: Arc<dyn RelayConnector>,
        publisher: Arc<dyn DocumentPublisher>,
    ) -> EndpointRegistry {
        EndpointRegistry::new(self.inner.ctx.local.clone(), connector, publisher)
    }

    /// Relay announced to peers as the one to use (`None` restores the default)
    pub async fn set_local_preferred_endpoint(&self, url: Option<String>) {
        *self.inner.ctx.local_preferred.write().await = url;
    }

    /// Outbox of `peer`, resolving and creating it if needed
    ///
    /// # Errors
    ///
    /// Returns the resolver's error, [`CoreError::Resolution`] if the
    /// resolved document names another peer, or
    /// [`CoreError::IdentityKeyMismatch`] if it conflicts with a known peer.
    pub async fn add_peer(&self, peer: &PeerId) -> Result<Arc<PeerOutbox>> {
        if let Some(outbox) = self.peer(peer) {
            return Ok(outbox);
        }

        let document = self.inner.ctx.resolver.resolve(peer).await?;
        if document.id != *peer {
            return Err(CoreError::Resolution(Cow::Owned(format!(
                "document resolved for {peer} names {}",
                document.id
            ))));
        }
        self.inner.materialize(document)
    }

    /// Outbox of a known peer
    #[must_use]
    pub fn peer(&self, peer: &PeerId) -> Option<Arc<PeerOutbox>> {
        self.inner.peer(peer)
    }

    /// Known peers
    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.iter().map(|e| e.key().clone()).collect()
    }

    /// Send an application message to `to`
    ///
    /// Resolves once at least one relay accepted the message.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidState`] when sending to the local identity or to a
    ///   peer whose relationship is [`Relationship::Pass`]
    /// - [`CoreError::RetryExhausted`] when delivery gave up
    /// - resolution and handshake errors
    pub async fn send(&self, to: &PeerId, kind: &str, data: Value) -> Result<Hash> {
        if *to == self.local_id().await {
            return Err(CoreError::invalid_state("cannot send to the local identity"));
        }
        let outbox = self.add_peer(to).await?;
        outbox.send(kind, data).await
    }

    /// Send a read receipt for `ids` to `peer`
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PeerNotFound`] for an unknown peer, or the
    /// delivery error.
    pub async fn mark_read(&self, peer: &PeerId, ids: Vec<Hash>) -> Result<()> {
        let outbox = self
            .peer(peer)
            .ok_or_else(|| CoreError::PeerNotFound(peer.to_string()))?;
        outbox.send_envelope(Envelope::ack(AckKind::Read, ids)?).await
    }

    /// Handle ciphertext a relay delivered for `session_id`
    ///
    /// Undecryptable data is logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns handshake errors for malformed session establishment, or
    /// [`CoreError::IdentityKeyMismatch`] for a sender impersonating a
    /// resolved peer.
    pub async fn incoming_data(&self, session_id: Hash, bytes: &[u8]) -> Result<()> {
        let batches = match self.inner.ctx.registry.incoming_data(session_id, bytes).await {
            Ok(batches) => batches,
            Err(CoreError::Decryption(reason)) => {
                tracing::warn!(
                    "Dropping undecryptable data on session {}: {}",
                    session_id.short(),
                    reason
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut first_error = None;
        for batch in batches {
            tracing::trace!(
                "Inbound batch of {} on session {}",
                batch.messages.len(),
                batch.session_id.short()
            );
            let ctx: &dyn InboundContext = self.inner.as_ref();
            if let Err(e) = self
                .inner
                .middleware
                .handle(ctx, batch.peer_identity_key, batch.messages)
                .await
            {
                tracing::warn!("Inbound batch on {} rejected: {}", batch.session_id.short(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Change the relationship with `peer`
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PeerNotFound`] for an unknown peer.
    pub async fn set_relationship(&self, peer: &PeerId, relationship: Relationship) -> Result<()> {
        let outbox = self
            .peer(peer)
            .ok_or_else(|| CoreError::PeerNotFound(peer.to_string()))?;
        outbox.set_relationship(relationship).await;
        Ok(())
    }

    /// Preferred session with `peer`, if any
    #[must_use]
    pub fn active_session(&self, peer: &PeerId) -> Option<Hash> {
        self.peer(peer)?.active_session()
    }

    /// Number of live sessions across all peers
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.ctx.registry.len()
    }

    /// Close `peer`: cancel retries, discard its queue and drop its sessions
    ///
    /// Returns false if the peer was not known.
    pub async fn close_peer(&self, peer: &PeerId) -> bool {
        let Some((_, outbox)) = self.inner.peers.remove(peer) else {
            return false;
        };
        outbox.close().await;

        let key = outbox.identity_key();
        self.inner.keys.remove_if(&key, |_, id| id == peer);
        self.inner.ctx.locks.remove_peer(peer);
        self.inner.ctx.registry.remove_all_sessions_for_peer(&key, true);
        true
    }

    /// Close every peer and wait for receipts still being delivered
    ///
    /// Closed outboxes fail their pending receipts, so the wait is bounded by
    /// the occupation timeout of the close.
    pub async fn shutdown(&self) {
        let peers = self.peers();
        tracing::info!("Shutting down messenger ({} peers)", peers.len());
        for peer in peers {
            self.close_peer(&peer).await;
        }

        let mut receipts = std::mem::take(&mut *self.inner.receipts.lock().await);
        if !receipts.is_empty() {
            tracing::debug!("Waiting for {} receipt deliveries", receipts.len());
        }
        while receipts.join_next().await.is_some() {}
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("peers", &self.inner.peers.len())
            .field("sessions", &self.inner.ctx.registry.len())
            .finish_non_exhaustive()
    }
}

impl MessengerInner {
    fn peer(&self, peer: &PeerId) -> Option<Arc<PeerOutbox>> {
        self.peers.get(peer).map(|e| e.value().clone())
    }

    fn materialize(&self, document: PeerDocument) -> Result<Arc<PeerOutbox>> {
        let key = document.identity_key;
        match self.peers.entry(document.id.clone()) {
            Entry::Occupied(existing) => {
                if existing.get().identity_key() != key {
                    return Err(CoreError::IdentityKeyMismatch(document.id.to_string()));
                }
                Ok(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                tracing::info!("Materialized peer {} ({})", document.id, key.short());
                self.keys.insert(key, document.id.clone());
                let outbox = PeerOutbox::new(document, self.ctx.clone());
                slot.insert(outbox.clone());
                Ok(outbox)
            }
        }
    }

    async fn on_ack(&self, outbox: &PeerOutbox, envelope: &Envelope) {
        let Some(kind) = AckKind::from_kind(&envelope.kind) else {
            return;
        };
        let payload: AckPayload = match envelope.payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Malformed {} ack from {}: {}", envelope.kind, outbox.id(), e);
                return;
            }
        };

        let peer = outbox.id().clone();
        let splitter = &self.ctx.splitter;
        let event = match kind {
            AckKind::Received => {
                let removed = match outbox.ack(&payload.ids).await {
                    Ok(removed) => removed,
                    Err(e) => {
                        tracing::warn!("Could not apply receipt from {}: {}", peer, e);
                        return;
                    }
                };
                let ids = splitter.on_ack(AckKind::Received, &removed).await;
                CoreEvent::Received { peer, ids }
            }
            AckKind::Delivered => {
                let ids = splitter.on_ack(AckKind::Delivered, &payload.ids).await;
                CoreEvent::Delivered { peer, ids }
            }
            AckKind::Read => CoreEvent::Read {
                peer,
                ids: payload.ids,
            },
        };

        let empty = match &event {
            CoreEvent::Received { ids, .. }
            | CoreEvent::Delivered { ids, .. }
            | CoreEvent::Read { ids, .. } => ids.is_empty(),
            _ => false,
        };
        if !empty {
            self.ctx.events.emit(event);
        }
    }

    async fn on_identity(&self, outbox: &PeerOutbox, envelope: &Envelope) {
        let document: PeerDocument = match envelope.payload() {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!("Malformed identity from {}: {}", outbox.id(), e);
                return;
            }
        };
        if document.id != *outbox.id() {
            tracing::warn!("{} announced the identity of {}", outbox.id(), document.id);
            return;
        }
        if document == outbox.document().await {
            return;
        }
        if let Err(e) = outbox.configure_endpoints(document).await {
            tracing::warn!("Ignoring identity announcement of {}: {}", outbox.id(), e);
        }
    }

    async fn on_preferred_endpoint(&self, outbox: &PeerOutbox, envelope: &Envelope) {
        match envelope.payload::<PreferredEndpointPayload>() {
            Ok(payload) => {
                if let Err(e) = outbox.set_preferred_endpoint(&payload.url).await {
                    tracing::warn!("Could not set preferred endpoint of {}: {}", outbox.id(), e);
                }
            }
            Err(e) => tracing::warn!("Malformed preferred endpoint from {}: {}", outbox.id(), e),
        }
    }

    /// Apply a session reset notification once per reset id
    ///
    /// Drops every non-preferred session with the peer. The preferred session
    /// is the one the notification arrived on and stays usable.
    async fn incoming_session_reset(&self, outbox: &PeerOutbox, reset_id: Hash) -> Result<()> {
        let peer = outbox.id();
        let _guard = self.ctx.locks.acquire(peer, LockKind::SessionReset).await?;
        if self.processed_resets.lock().await.put(reset_id, ()).is_some() {
            tracing::debug!("Session reset {} from {} already handled", reset_id.short(), peer);
            return Ok(());
        }

        let removed = self
            .ctx
            .registry
            .remove_all_sessions_for_peer(&outbox.identity_key(), false);
        outbox.on_session_reset().await;
        tracing::info!(
            "Session reset {} from {}: dropped {} sessions",
            reset_id.short(),
            peer,
            removed
        );
        self.ctx
            .events
            .emit(CoreEvent::SessionReset { peer: peer.clone() });
        Ok(())
    }
}

#[async_trait]
impl InboundContext for MessengerInner {
    fn peer_for_key(&self, key: &IdentityKey) -> Option<PeerId> {
        self.keys.get(key).map(|e| e.value().clone())
    }

    async fn resolve_document(&self, id: &PeerId) -> Result<PeerDocument> {
        self.ctx.resolver.resolve(id).await
    }

    async fn materialize_peer(&self, document: PeerDocument) -> Result<()> {
        if document.id == *self.ctx.local.read().await.id() {
            return Err(CoreError::invalid_state("sender claims the local identity"));
        }
        self.materialize(document).map(|_| ())
    }

    async fn send_receipts(&self, peer: &PeerId, ids: Vec<Hash>) {
        let Some(outbox) = self.peer(peer) else {
            return;
        };
        let receipt = match Envelope::ack(AckKind::Received, ids) {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::warn!("Could not build receipt for {}: {}", peer, e);
                return;
            }
        };
        let mut receipts = self.receipts.lock().await;
        while receipts.try_join_next().is_some() {}
        receipts.spawn(async move {
            if let Err(e) = outbox.send_envelope(receipt).await {
                tracing::warn!("Receipt to {} failed: {}", outbox.id(), e);
            }
        });
    }

    async fn dispatch(&self, peer: &PeerId, messages: Vec<Envelope>) {
        let Some(outbox) = self.peer(peer) else {
            tracing::warn!("Dropping {} messages for closed peer {}", messages.len(), peer);
            return;
        };
        outbox.touch().await;
        let relationship = outbox.relationship().await;

        for envelope in messages {
            match envelope.kind.as_str() {
                kinds::DELIVERED | kinds::RECEIVED | kinds::READ => {
                    self.on_ack(&outbox, &envelope).await;
                }
                kinds::IDENTITY => self.on_identity(&outbox, &envelope).await,
                kinds::PREFERRED_ENDPOINT => self.on_preferred_endpoint(&outbox, &envelope).await,
                kinds::SESSION_RESET => match envelope.payload::<SessionResetPayload>() {
                    Ok(payload) => {
                        if let Err(e) = self.incoming_session_reset(&outbox, payload.reset_id).await {
                            tracing::warn!("Session reset from {} failed: {}", peer, e);
                        }
                    }
                    Err(e) => tracing::warn!("Malformed session reset from {}: {}", peer, e),
                },
                _ if relationship == Relationship::Pass => {
                    tracing::trace!("Suppressing {} from {} (pass)", envelope.sha256.short(), peer);
                }
                _ => self.ctx.events.emit(CoreEvent::Message {
                    from: peer.clone(),
                    envelope,
                }),
            }
        }
    }
}

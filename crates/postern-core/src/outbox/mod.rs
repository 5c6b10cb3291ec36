//! Per-peer outbound delivery
//!
//! A [`PeerOutbox`] owns everything pending for one remote peer: the message
//! queue, the peer's relay endpoints (each a [`PeerEndpoint`] with its own
//! queue and session), the preferred endpoint and the retry schedule.
//!
//! # Delivery
//!
//! `send` queues an envelope on the outbox and on every endpoint, then flushes.
//! A flush goes through the preferred endpoint when the peer named one and a
//! preferred session exists; otherwise through every endpoint. It fails only
//! if all endpoints fail. Failed flushes are retried with exponential backoff
//! by a single background run per peer that every caller joins; between
//! attempts the peer's document is re-resolved so relay moves are picked up.
//!
//! Acknowledgements remove entries from every queue. Until then entries stay
//! queued so that a replacement session resends them.

mod batch;
mod endpoint;

pub use endpoint::PeerEndpoint;

use crate::config::CoreConfig;
use crate::endpoints::validate_endpoint;
use crate::envelope::{AckKind, Envelope};
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventSender};
use crate::hash::Hash;
use crate::identity::{IdentityKey, LocalIdentity, PeerDocument, PeerId};
use crate::locks::{LockKind, LockTable};
use crate::session::SessionRegistry;
use crate::split::MessageSplitter;
use crate::transport::{DocumentResolver, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;

/// Application-level disposition toward a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relationship {
    /// Normal contact
    #[default]
    Clear,
    /// Favoured contact
    Smash,
    /// Blocked: application messages are neither sent nor surfaced
    Pass,
}

/// State shared by every outbox of a messenger
pub(crate) struct DeliveryContext {
    pub(crate) config: CoreConfig,
    pub(crate) local: Arc<RwLock<LocalIdentity>>,
    /// Relay the local identity asks peers to use
    pub(crate) local_preferred: RwLock<Option<String>>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) resolver: Arc<dyn DocumentResolver>,
    pub(crate) locks: LockTable,
    pub(crate) splitter: MessageSplitter,
    pub(crate) events: EventSender,
}

impl DeliveryContext {
    /// Local preferred relay, defaulting to the first advertised endpoint
    pub(crate) async fn local_preferred_endpoint(&self) -> Option<String> {
        if let Some(url) = self.local_preferred.read().await.clone() {
            return Some(url);
        }
        self.local
            .read()
            .await
            .endpoints()
            .first()
            .map(|e| e.url.clone())
    }

    /// Envelopes that open every new outbound session
    pub(crate) async fn bookkeeping(&self) -> Result<Vec<Envelope>> {
        let mut envelopes = Vec::with_capacity(2);
        if let Some(url) = self.local_preferred_endpoint().await {
            envelopes.push(Envelope::preferred_endpoint(&url)?);
        }
        let document = self.local.read().await.document();
        envelopes.push(Envelope::identity(&document)?);
        Ok(envelopes)
    }
}

#[derive(Debug)]
struct Pending {
    seq: u64,
    envelope: Envelope,
    /// Delivered event already emitted
    delivered: bool,
}

#[derive(Debug, Default)]
struct MessageQueue {
    entries: HashMap<Hash, Pending>,
    next_seq: u64,
}

impl MessageQueue {
    /// Insert unless present; returns the sequence number of a new entry
    fn insert(&mut self, envelope: Envelope) -> Option<u64> {
        if self.entries.contains_key(&envelope.sha256) {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            envelope.sha256,
            Pending {
                seq,
                envelope,
                delivered: false,
            },
        );
        Some(seq)
    }

    fn snapshot(&self) -> Vec<(u64, Envelope)> {
        let mut entries: Vec<(u64, Envelope)> = self
            .entries
            .values()
            .map(|p| (p.seq, p.envelope.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries
    }
}

type RetrySlot = Option<watch::Receiver<Option<Result<()>>>>;

/// Outbound state for one remote peer
pub struct PeerOutbox {
    id: PeerId,
    identity_key: IdentityKey,
    ctx: Arc<DeliveryContext>,
    document: RwLock<PeerDocument>,
    endpoints: RwLock<Vec<Arc<PeerEndpoint>>>,
    queue: Mutex<MessageQueue>,
    preferred_endpoint: RwLock<Option<String>>,
    relationship: RwLock<Relationship>,
    /// In-flight retry run, joined by concurrent flushes
    retry: Mutex<RetrySlot>,
    /// Bumped on every queue change so a retry run knows to go again
    generation: AtomicU64,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    last_exchange: Mutex<Instant>,
    last_sent: Mutex<Option<Hash>>,
}

impl PeerOutbox {
    pub(crate) fn new(document: PeerDocument, ctx: Arc<DeliveryContext>) -> Arc<Self> {
        let endpoints = build_endpoints(&document);
        let (close_tx, _) = watch::channel(false);
        tracing::debug!(
            "Opened outbox for {} with {} endpoints",
            document.id,
            endpoints.len()
        );
        Arc::new(Self {
            id: document.id.clone(),
            identity_key: document.identity_key,
            ctx,
            document: RwLock::new(document),
            endpoints: RwLock::new(endpoints),
            queue: Mutex::new(MessageQueue::default()),
            preferred_endpoint: RwLock::new(None),
            relationship: RwLock::new(Relationship::default()),
            retry: Mutex::new(None),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_tx,
            last_exchange: Mutex::new(Instant::now()),
            last_sent: Mutex::new(None),
        })
    }

    /// Peer id
    #[must_use]
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Peer identity key
    #[must_use]
    pub fn identity_key(&self) -> IdentityKey {
        self.identity_key
    }

    /// Current copy of the peer's document
    pub async fn document(&self) -> PeerDocument {
        self.document.read().await.clone()
    }

    /// Usable relay endpoints of the peer
    pub async fn endpoints(&self) -> Vec<Arc<PeerEndpoint>> {
        self.endpoints.read().await.clone()
    }

    /// Current relationship
    pub async fn relationship(&self) -> Relationship {
        *self.relationship.read().await
    }

    /// Change the relationship
    pub async fn set_relationship(&self, relationship: Relationship) {
        *self.relationship.write().await = relationship;
    }

    /// The preferred session's id, if any
    #[must_use]
    pub fn active_session(&self) -> Option<Hash> {
        self.ctx
            .registry
            .preferred_for(&self.identity_key)
            .map(|s| s.id())
    }

    /// True once [`PeerOutbox::close`] ran
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ids still waiting for a `received` acknowledgement, in queue order
    pub async fn pending_ids(&self) -> Vec<Hash> {
        self.queue
            .lock()
            .await
            .snapshot()
            .into_iter()
            .map(|(_, e)| e.sha256)
            .collect()
    }

    /// Number of queued envelopes
    pub async fn pending_count(&self) -> usize {
        self.queue.lock().await.entries.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CoreError::PeerClosed(self.id.to_string()));
        }
        Ok(())
    }

    /// Send an application message
    ///
    /// The envelope is chained after the previous message sent to this peer.
    /// Returns once the message is delivered to at least one relay.
    ///
    /// # Errors
    ///
    /// - [`CoreError::PeerClosed`] if the outbox is closed
    /// - [`CoreError::InvalidState`] if the relationship is [`Relationship::Pass`]
    /// - [`CoreError::RetryExhausted`] if every retry failed
    pub async fn send(self: &Arc<Self>, kind: &str, data: Value) -> Result<Hash> {
        self.ensure_open()?;
        if self.relationship().await == Relationship::Pass {
            return Err(CoreError::invalid_state("peer relationship is pass"));
        }

        let envelope = {
            let mut last = self.last_sent.lock().await;
            let envelope = Envelope::new(kind, data, *last)?;
            *last = Some(envelope.sha256);
            envelope
        };
        let id = envelope.sha256;
        self.send_envelope(envelope).await?;
        Ok(id)
    }

    /// Queue and deliver a prepared envelope, splitting it if oversized
    ///
    /// # Errors
    ///
    /// See [`PeerOutbox::send`].
    pub async fn send_envelope(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        self.ensure_open()?;
        let parts = if self.ctx.splitter.needs_split(&envelope)? {
            self.ctx.splitter.split(&envelope).await?
        } else {
            vec![envelope]
        };

        for part in parts {
            self.queue(part).await?;
            self.flush_with_retry().await?;
        }
        Ok(())
    }

    /// Add an envelope to the outbox and every endpoint queue
    ///
    /// Endpoint failures are logged; the envelope stays in the outbox queue.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PeerClosed`] or a lock timeout.
    pub async fn queue(&self, envelope: Envelope) -> Result<()> {
        self.ensure_open()?;
        self.ctx
            .locks
            .run_exclusive(&self.id, LockKind::QueueFlush, async {
                self.insert_locked(envelope).await;
                Ok(())
            })
            .await
    }

    /// Caller holds the queue-flush lock
    async fn insert_locked(&self, envelope: Envelope) {
        let Some(seq) = self.queue.lock().await.insert(envelope.clone()) else {
            return;
        };
        for endpoint in self.endpoints.read().await.iter() {
            if let Err(e) = endpoint.enqueue(seq, &envelope).await {
                tracing::warn!("Could not queue {} on {}: {}", envelope.sha256.short(), endpoint.url(), e);
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Attempt delivery once, without retries
    ///
    /// # Errors
    ///
    /// Returns the most retryable endpoint error if every endpoint failed.
    pub async fn flush(&self) -> Result<()> {
        self.ctx
            .locks
            .run_exclusive(&self.id, LockKind::QueueFlush, self.flush_locked())
            .await
    }

    async fn flush_locked(&self) -> Result<()> {
        self.ensure_open()?;
        if self.queue.lock().await.entries.is_empty() {
            return Ok(());
        }

        let endpoints = self.endpoints.read().await.clone();
        if endpoints.is_empty() {
            return Err(CoreError::Transport(Cow::Owned(format!(
                "no usable endpoints for {}",
                self.id
            ))));
        }
        let document = self.document.read().await.clone();

        let preferred = match self.preferred_endpoint().await? {
            Some(url) => self
                .ctx
                .registry
                .preferred_for(&self.identity_key)
                .and_then(|session| {
                    endpoints
                        .iter()
                        .find(|e| e.url() == url)
                        .map(|e| (e.clone(), session))
                }),
            None => None,
        };
        let targets: Vec<_> = match preferred {
            Some((endpoint, session)) => vec![(endpoint, Some(session))],
            None => endpoints.into_iter().map(|e| (e, None)).collect(),
        };

        let mut delivered = Vec::new();
        let mut errors = Vec::new();
        let mut any_ok = false;
        for (endpoint, session) in targets {
            match endpoint.flush(&self.ctx, &document, session).await {
                Ok(ids) => {
                    any_ok = true;
                    delivered.extend(ids);
                }
                Err(e) => {
                    tracing::warn!("Flush to {} via {} failed: {}", self.id, endpoint.url(), e);
                    errors.push(e);
                }
            }
        }

        if !any_ok {
            let index = errors.iter().position(CoreError::should_retry).unwrap_or(0);
            if index < errors.len() {
                return Err(errors.swap_remove(index));
            }
        }

        if !delivered.is_empty() {
            self.touch().await;
            self.on_delivered(delivered).await;
        }
        Ok(())
    }

    /// Handle relay acknowledgements: drop acked acks, report the rest once
    async fn on_delivered(&self, ids: Vec<Hash>) {
        let mut finished_acks = Vec::new();
        let mut newly_delivered = Vec::new();
        {
            let mut queue = self.queue.lock().await;
            for id in ids {
                let is_ack = match queue.entries.get_mut(&id) {
                    None => continue,
                    Some(pending) if pending.envelope.is_ack() => true,
                    Some(pending) => {
                        if !pending.delivered {
                            pending.delivered = true;
                            newly_delivered.push(id);
                        }
                        false
                    }
                };
                if is_ack {
                    queue.entries.remove(&id);
                    finished_acks.push(id);
                }
            }
        }

        if !finished_acks.is_empty() {
            for endpoint in self.endpoints.read().await.iter() {
                endpoint.remove(&finished_acks).await;
            }
        }

        let ids = self
            .ctx
            .splitter
            .on_ack(AckKind::Delivered, &newly_delivered)
            .await;
        if !ids.is_empty() {
            self.ctx.events.emit(CoreEvent::Delivered {
                peer: self.id.clone(),
                ids,
            });
        }
    }

    /// Flush, retrying with backoff until success or exhaustion
    ///
    /// Concurrent callers join the run already in flight and all observe its
    /// outcome. The run keeps going while new envelopes were queued during an
    /// attempt.
    ///
    /// # Errors
    ///
    /// - [`CoreError::RetryExhausted`] after `max_attempts` failed attempts
    /// - [`CoreError::PeerClosed`] if the outbox is closed meanwhile
    /// - any non-retryable flush error
    pub async fn flush_with_retry(self: &Arc<Self>) -> Result<()> {
        let mut rx = {
            let mut slot = self.retry.lock().await;
            match slot.as_ref() {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        loop {
                            let result = this.deliver().await;
                            if this.publish(result, &tx).await {
                                break;
                            }
                        }
                    });
                    rx
                }
            }
        };

        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(CoreError::invalid_state("delivery run ended without result"));
            }
        }
    }

    /// End the retry run with `result`, unless the queue changed since the
    /// attempt that produced it
    ///
    /// Clearing the slot and publishing happen under one slot lock, so a
    /// caller either joined this run before the check or starts a new one.
    async fn publish(&self, result: Result<u64>, tx: &watch::Sender<Option<Result<()>>>) -> bool {
        let mut slot = self.retry.lock().await;
        let result = match result {
            Ok(generation) if self.generation.load(Ordering::SeqCst) != generation => {
                tracing::trace!("Queue of {} changed after the last attempt, going again", self.id);
                return false;
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        *slot = None;
        tx.send_replace(Some(result));
        true
    }

    /// Returns the queue generation the last successful attempt covered
    async fn deliver(&self) -> Result<u64> {
        let retry = &self.ctx.config.retry;
        let mut close_rx = self.close_tx.subscribe();
        let mut failures = 0u32;

        loop {
            self.ensure_open()?;
            let generation = self.generation.load(Ordering::SeqCst);

            match self.flush().await {
                Ok(()) => {
                    if self.generation.load(Ordering::SeqCst) == generation {
                        return Ok(generation);
                    }
                    failures = 0;
                }
                Err(e) if !e.should_retry() => return Err(e),
                Err(e) => {
                    failures += 1;
                    self.ctx.registry.reset_preferred(&self.identity_key);

                    if retry.is_exhausted(failures) {
                        let error = CoreError::RetryExhausted {
                            peer: self.id.to_string(),
                            attempts: failures,
                        };
                        tracing::error!("Giving up delivery to {} after {} attempts: {}", self.id, failures, e);
                        let ids = self.pending_message_ids().await;
                        if !ids.is_empty() {
                            self.ctx.events.emit(CoreEvent::DeliveryFailed {
                                peer: self.id.clone(),
                                ids,
                                error: error.clone(),
                            });
                        }
                        return Err(error);
                    }

                    let delay = retry.backoff_duration(failures - 1);
                    tracing::debug!(
                        "Delivery to {} failed (attempt {}), retrying in {:?}: {}",
                        self.id,
                        failures,
                        delay,
                        e
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = close_rx.wait_for(|closed| *closed) => {
                            return Err(CoreError::PeerClosed(self.id.to_string()));
                        }
                    }
                    self.refresh_document().await;
                }
            }
        }
    }

    /// Pending ids other than acknowledgements
    async fn pending_message_ids(&self) -> Vec<Hash> {
        self.queue
            .lock()
            .await
            .snapshot()
            .into_iter()
            .filter(|(_, e)| !e.is_ack())
            .map(|(_, e)| e.sha256)
            .collect()
    }

    /// Re-resolve the peer's document and reconfigure if it changed
    pub async fn refresh_document(&self) {
        match self.ctx.resolver.resolve(&self.id).await {
            Ok(document) => {
                let changed = document != *self.document.read().await;
                if changed {
                    if let Err(e) = self.configure_endpoints(document).await {
                        tracing::warn!("Could not apply new document of {}: {}", self.id, e);
                    }
                }
            }
            Err(e) => tracing::debug!("Could not refresh document of {}: {}", self.id, e),
        }
    }

    /// Rebuild endpoints from a new document
    ///
    /// If nothing was exchanged with the peer within the session TTL, a
    /// session reset notification is queued and flushed over the current
    /// endpoints first, and every session with the peer is dropped; otherwise
    /// only non-preferred sessions are. New endpoints are seeded with the
    /// whole pending queue, so an undelivered reset goes out on them too.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IdentityKeyMismatch`] if the document belongs to a
    /// different key.
    pub async fn configure_endpoints(&self, document: PeerDocument) -> Result<()> {
        if document.identity_key != self.identity_key {
            tracing::warn!("Document for {} carries a different identity key", self.id);
            return Err(CoreError::IdentityKeyMismatch(self.id.to_string()));
        }
        self.ensure_open()?;

        let stale = self.last_exchange.lock().await.elapsed() > self.ctx.config.session.ttl;
        let urls: HashSet<String> = self
            .ctx
            .locks
            .run_exclusive(&self.id, LockKind::QueueFlush, async {
                if stale {
                    tracing::info!(
                        "No exchange with {} within session TTL, sending session reset",
                        self.id
                    );
                    let reset_id = Hash::sha256(&rand::random::<[u8; 32]>());
                    self.insert_locked(Envelope::session_reset(reset_id)?).await;
                    if let Err(e) = self.flush_locked().await {
                        tracing::debug!(
                            "Session reset to {} not delivered before reconfiguring: {}",
                            self.id,
                            e
                        );
                    }
                }
                self.ctx
                    .registry
                    .remove_all_sessions_for_peer(&self.identity_key, stale);

                let endpoints = build_endpoints(&document);
                let pending = self.queue.lock().await.snapshot();
                for endpoint in &endpoints {
                    for (seq, envelope) in &pending {
                        if let Err(e) = endpoint.enqueue(*seq, envelope).await {
                            tracing::warn!("Could not seed {}: {}", endpoint.url(), e);
                        }
                    }
                }
                let urls: HashSet<String> =
                    endpoints.iter().map(|e| e.url().to_string()).collect();

                tracing::info!(
                    "Reconfigured {} with {} endpoints ({} pending)",
                    self.id,
                    endpoints.len(),
                    pending.len()
                );
                *self.endpoints.write().await = endpoints;
                *self.document.write().await = document;
                self.generation.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CoreError>(urls)
            })
            .await?;

        let _guard = self
            .ctx
            .locks
            .acquire(&self.id, LockKind::PreferredEndpoint)
            .await?;
        let mut preferred = self.preferred_endpoint.write().await;
        if preferred.as_ref().is_some_and(|url| !urls.contains(url)) {
            tracing::debug!("Preferred endpoint of {} is gone", self.id);
            *preferred = None;
        }
        Ok(())
    }

    /// The relay the peer asked us to use
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Timeout`] if the preferred-endpoint lock is busy.
    pub async fn preferred_endpoint(&self) -> Result<Option<String>> {
        let _guard = self
            .ctx
            .locks
            .acquire(&self.id, LockKind::PreferredEndpoint)
            .await?;
        Ok(self.preferred_endpoint.read().await.clone())
    }

    /// Record the relay the peer asked us to use
    ///
    /// Ignored (returning false) if the peer has no such usable endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Timeout`] if the preferred-endpoint lock is busy.
    pub async fn set_preferred_endpoint(&self, url: &str) -> Result<bool> {
        let _guard = self
            .ctx
            .locks
            .acquire(&self.id, LockKind::PreferredEndpoint)
            .await?;
        let known = self.endpoints.read().await.iter().any(|e| e.url() == url);
        if !known {
            tracing::warn!("Ignoring unknown preferred endpoint {} of {}", url, self.id);
            return Ok(false);
        }
        *self.preferred_endpoint.write().await = Some(url.to_string());
        tracing::debug!("Preferred endpoint of {} is now {}", self.id, url);
        Ok(true)
    }

    /// Remove acknowledged envelopes; returns the ids that were pending
    ///
    /// # Errors
    ///
    /// Returns a lock timeout.
    pub async fn ack(&self, ids: &[Hash]) -> Result<Vec<Hash>> {
        self.ctx
            .locks
            .run_exclusive(&self.id, LockKind::QueueFlush, async {
                let removed: Vec<Hash> = {
                    let mut queue = self.queue.lock().await;
                    ids.iter()
                        .filter(|id| queue.entries.remove(id).is_some())
                        .copied()
                        .collect()
                };
                if !removed.is_empty() {
                    for endpoint in self.endpoints.read().await.iter() {
                        endpoint.remove(&removed).await;
                    }
                }
                Ok(removed)
            })
            .await
    }

    /// Drop endpoint sessions so pending entries go out on fresh ones
    pub async fn on_session_reset(&self) {
        for endpoint in self.endpoints.read().await.iter() {
            endpoint.reset_session().await;
        }
    }

    /// Record an exchange with the peer
    pub async fn touch(&self) {
        *self.last_exchange.lock().await = Instant::now();
    }

    /// Stop delivery and discard everything pending
    ///
    /// A retry run in flight observes the close and fails with
    /// [`CoreError::PeerClosed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_tx.send_replace(true);

        let guard = self
            .ctx
            .locks
            .acquire_skip_queue(&self.id, LockKind::QueueFlush)
            .await;
        let discarded = {
            let mut queue = self.queue.lock().await;
            let n = queue.entries.len();
            queue.entries.clear();
            n
        };
        for endpoint in self.endpoints.read().await.iter() {
            endpoint.clear().await;
        }
        drop(guard);

        tracing::info!("Closed outbox for {} ({} pending discarded)", self.id, discarded);
    }
}

impl std::fmt::Debug for PeerOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerOutbox")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Endpoints of `document` worth sending to
///
/// Propagated endpoints whose relay key material fails validation are
/// skipped, as are duplicate URLs.
fn build_endpoints(document: &PeerDocument) -> Vec<Arc<PeerEndpoint>> {
    let mut seen = HashSet::new();
    document
        .endpoints
        .iter()
        .filter(|endpoint| {
            if endpoint.is_propagated() {
                if let Err(e) = validate_endpoint(
                    endpoint,
                    &document.identity_key,
                    &document.signed_pre_key.key,
                ) {
                    tracing::warn!("Skipping endpoint of {}: {}", document.id, e);
                    return false;
                }
            }
            seen.insert(endpoint.url.clone())
        })
        .map(|endpoint| Arc::new(PeerEndpoint::new(endpoint.clone())))
        .collect()
}

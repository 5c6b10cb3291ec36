//! Per-relay delivery for one peer

use super::DeliveryContext;
use super::batch::pack_batches;
use crate::envelope::{Envelope, encode_batch};
use crate::error::Result;
use crate::hash::Hash;
use crate::identity::{EndpointConfig, PeerDocument};
use crate::session::Session;
use crate::transport::DeliveryAck;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug)]
struct QueuedEntry {
    seq: u64,
    envelope: Envelope,
    size: usize,
    /// Sent over the current session (cleared when the session changes)
    sent: bool,
}

/// One relay endpoint advertised by a peer
///
/// The queue mirrors the peer's pending messages and keeps every entry until
/// it is acknowledged, so a replacement session can resend the history.
#[derive(Debug)]
pub struct PeerEndpoint {
    config: EndpointConfig,
    queue: Mutex<HashMap<Hash, QueuedEntry>>,
    session_id: Mutex<Option<Hash>>,
}

impl PeerEndpoint {
    pub(crate) fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            queue: Mutex::new(HashMap::new()),
            session_id: Mutex::new(None),
        }
    }

    /// Relay endpoint config
    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Relay URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Session last used on this endpoint
    pub async fn session_id(&self) -> Option<Hash> {
        *self.session_id.lock().await
    }

    /// Entries not yet acknowledged
    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub(crate) async fn enqueue(&self, seq: u64, envelope: &Envelope) -> Result<()> {
        let size = envelope.serialized_len()?;
        self.queue
            .lock()
            .await
            .entry(envelope.sha256)
            .or_insert_with(|| QueuedEntry {
                seq,
                envelope: envelope.clone(),
                size,
                sent: false,
            });
        Ok(())
    }

    pub(crate) async fn remove(&self, ids: &[Hash]) {
        let mut queue = self.queue.lock().await;
        for id in ids {
            queue.remove(id);
        }
    }

    pub(crate) async fn clear(&self) {
        self.queue.lock().await.clear();
        *self.session_id.lock().await = None;
    }

    /// Forget the session; everything pending goes out again on the next one
    pub(crate) async fn reset_session(&self) {
        let mut queue = self.queue.lock().await;
        *self.session_id.lock().await = None;
        for entry in queue.values_mut() {
            entry.sent = false;
        }
    }

    /// Send every unsent entry, returning the ids the relay acknowledged
    ///
    /// Uses `session` if given, otherwise the endpoint's current session, the
    /// peer's preferred session, or a new one, in that order. A new session
    /// first carries the local preferred-endpoint announcement and identity
    /// document. Any failed batch aborts the session.
    pub(crate) async fn flush(
        &self,
        ctx: &DeliveryContext,
        document: &PeerDocument,
        session: Option<Arc<Session>>,
    ) -> Result<Vec<Hash>> {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return Ok(Vec::new());
        }

        let mut current = self.session_id.lock().await;
        let session = match session {
            Some(session) => session,
            None => self.obtain_session(ctx, document, *current).await?,
        };
        if *current != Some(session.id()) {
            if current.is_some() {
                tracing::debug!(
                    "Endpoint {} moved to session {}, resending history",
                    self.config.url,
                    session.id().short()
                );
            }
            for entry in queue.values_mut() {
                entry.sent = false;
            }
            *current = Some(session.id());
        }

        let mut unsent: Vec<&QueuedEntry> = queue.values().filter(|e| !e.sent).collect();
        if unsent.is_empty() {
            return Ok(Vec::new());
        }
        unsent.sort_by_key(|e| e.seq);

        let mut outgoing = Vec::with_capacity(unsent.len() + 2);
        if session.is_first_use() {
            for envelope in ctx.bookkeeping().await? {
                let size = envelope.serialized_len()?;
                outgoing.push((envelope, size));
            }
        }
        outgoing.extend(unsent.iter().map(|e| (e.envelope.clone(), e.size)));
        let queued_ids: Vec<Hash> = unsent.iter().map(|e| e.envelope.sha256).collect();

        let sizes: Vec<usize> = outgoing.iter().map(|(_, size)| *size).collect();
        let batches = pack_batches(&sizes, ctx.config.limits.max_batch_size);

        let mut delivered = Vec::new();
        for range in batches {
            let batch: Vec<&Envelope> = outgoing[range].iter().map(|(e, _)| e).collect();
            match self.send_batch(ctx, &session, &batch).await {
                Ok(ack) => delivered.extend(ack.message_ids),
                Err(e) => {
                    tracing::warn!(
                        "Send via {} on session {} failed: {}",
                        self.config.url,
                        session.id().short(),
                        e
                    );
                    ctx.registry.remove_session(&session.id());
                    *current = None;
                    for entry in queue.values_mut() {
                        entry.sent = false;
                    }
                    return Err(e);
                }
            }
        }

        for id in &queued_ids {
            if let Some(entry) = queue.get_mut(id) {
                entry.sent = true;
            }
        }
        session.mark_used();

        tracing::debug!(
            "Flushed {} envelopes to {} via {}",
            queued_ids.len(),
            document.id,
            self.config.url
        );
        Ok(delivered)
    }

    async fn obtain_session(
        &self,
        ctx: &DeliveryContext,
        document: &PeerDocument,
        current: Option<Hash>,
    ) -> Result<Arc<Session>> {
        if let Some(session) = current.and_then(|id| ctx.registry.get(&id)) {
            return Ok(session);
        }
        if let Some(session) = ctx.registry.preferred_for(&document.identity_key) {
            return Ok(session);
        }
        ctx.registry.create(document, &self.config).await
    }

    async fn send_batch(
        &self,
        ctx: &DeliveryContext,
        session: &Session,
        batch: &[&Envelope],
    ) -> Result<DeliveryAck> {
        let ids: Vec<Hash> = batch.iter().map(|e| e.sha256).collect();
        let plaintext = encode_batch(batch)?;
        let ciphertext = session.encrypt(&plaintext).await?;

        tracing::trace!(
            "Sending {} envelopes ({} bytes) via {}",
            ids.len(),
            ciphertext.len(),
            self.config.url
        );

        tokio::time::timeout(
            ctx.config.transport.send_timeout,
            ctx.transport
                .send_data(&self.config, &session.id(), ciphertext, &ids),
        )
        .await?
    }
}

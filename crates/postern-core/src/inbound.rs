//! Inbound middleware
//!
//! Sits between the session registry and the application. For every decrypted
//! batch it:
//!
//! 1. Holds messages from unknown senders until an identity announcement lets
//!    the sender be resolved and materialized as a local peer.
//! 2. Drops envelopes whose id does not match their content.
//! 3. Filters exact repeats by envelope id.
//! 4. Answers every unique non-acknowledgement envelope with a `received`
//!    receipt.
//! 5. Reassembles split messages.
//! 6. Hands what is left to the messenger for dispatch.

use crate::config::CoreConfig;
use crate::dead_letter::DeadLetterQueue;
use crate::envelope::{Envelope, PartPayload, kinds};
use crate::error::{CoreError, Result};
use crate::hash::Hash;
use crate::identity::{IdentityKey, PeerDocument, PeerId};
use crate::split::MessageReassembler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;

/// What the middleware needs from its owner
#[async_trait]
pub trait InboundContext: Send + Sync {
    /// Local peer known under `key`, if any
    fn peer_for_key(&self, key: &IdentityKey) -> Option<PeerId>;

    /// Resolve the published document of `id`
    async fn resolve_document(&self, id: &PeerId) -> Result<PeerDocument>;

    /// Create the local peer for a resolved document
    async fn materialize_peer(&self, document: PeerDocument) -> Result<()>;

    /// Acknowledge processed envelopes back to `peer`
    async fn send_receipts(&self, peer: &PeerId, ids: Vec<Hash>);

    /// Forward unique, reassembled envelopes
    async fn dispatch(&self, peer: &PeerId, messages: Vec<Envelope>);
}

/// Dedup, sender resolution, receipts and reassembly for inbound batches
#[derive(Debug)]
pub struct InboundMiddleware {
    /// Envelope id -> last time it was seen
    seen: Mutex<LruCache<Hash, DateTime<Utc>>>,
    /// Batches from senders not yet known locally
    unknown: DeadLetterQueue<IdentityKey, Vec<Envelope>>,
    reassembler: MessageReassembler,
}

impl InboundMiddleware {
    /// Create a middleware bounded by `config.inbound`
    #[must_use]
    pub fn new(config: &CoreConfig) -> Self {
        let inbound = &config.inbound;
        Self {
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(inbound.dedup_capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            unknown: DeadLetterQueue::new(inbound.dead_letter_keys, inbound.dead_letter_per_key),
            reassembler: MessageReassembler::new(inbound.reassembly_groups),
        }
    }

    /// Process one decrypted batch from the holder of `key`
    ///
    /// Messages from an unknown sender are held. If the batch carries an
    /// identity announcement, the claimed document is resolved and, when its
    /// identity key matches `key`, the peer is materialized and everything
    /// held for it is processed. Resolution failures leave the messages held.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IdentityKeyMismatch`] if the resolved document
    /// belongs to a different key, or the error of materializing the peer.
    pub async fn handle(
        &self,
        ctx: &dyn InboundContext,
        key: IdentityKey,
        messages: Vec<Envelope>,
    ) -> Result<()> {
        if let Some(peer) = ctx.peer_for_key(&key) {
            self.handle_known(ctx, &peer, messages).await;
            return Ok(());
        }

        let claimed = messages
            .iter()
            .filter(|e| e.kind == kinds::IDENTITY)
            .find_map(|e| e.payload::<PeerDocument>().ok());

        if self.unknown.push(key, messages).await {
            tracing::warn!("Dead-letter queue for {} overflowed", key.short());
        }

        let Some(claimed) = claimed else {
            tracing::debug!("Holding messages from unknown sender {}", key.short());
            return Ok(());
        };

        let document = match ctx.resolve_document(&claimed.id).await {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!(
                    "Could not resolve {} claimed by {}: {}",
                    claimed.id,
                    key.short(),
                    e
                );
                return Ok(());
            }
        };
        if document.identity_key != key {
            tracing::warn!(
                "Resolved document of {} does not carry sender key {}",
                document.id,
                key.short()
            );
            return Err(CoreError::IdentityKeyMismatch(document.id.to_string()));
        }

        let peer = document.id.clone();
        ctx.materialize_peer(document).await?;
        tracing::info!("Resolved unknown sender {} as {}", key.short(), peer);

        let held: Vec<Envelope> = self.unknown.take(&key).await.into_iter().flatten().collect();
        self.handle_known(ctx, &peer, held).await;
        Ok(())
    }

    async fn handle_known(&self, ctx: &dyn InboundContext, peer: &PeerId, messages: Vec<Envelope>) {
        let unique = self.dedup(peer, messages).await;
        if unique.is_empty() {
            return;
        }

        let receipts: Vec<Hash> = unique
            .iter()
            .filter(|e| !e.is_ack())
            .map(|e| e.sha256)
            .collect();
        if !receipts.is_empty() {
            ctx.send_receipts(peer, receipts).await;
        }

        let mut forward = Vec::with_capacity(unique.len());
        for envelope in unique {
            if envelope.kind != kinds::PART {
                forward.push(envelope);
                continue;
            }
            if let Some(original) = self.reassemble(peer, &envelope).await {
                if self.first_sighting(original.sha256).await {
                    forward.push(original);
                }
            }
        }

        if !forward.is_empty() {
            ctx.dispatch(peer, forward).await;
        }
    }

    /// Drop invalid envelopes and repeats, keeping batch order
    async fn dedup(&self, peer: &PeerId, messages: Vec<Envelope>) -> Vec<Envelope> {
        let now = Utc::now();
        let mut seen = self.seen.lock().await;
        let mut unique = Vec::with_capacity(messages.len());

        for envelope in messages {
            if !envelope.verify() {
                tracing::warn!(
                    "Dropping {} envelope from {} with mismatched id {}",
                    envelope.kind,
                    peer,
                    envelope.sha256.short()
                );
                continue;
            }
            if seen.put(envelope.sha256, now).is_some() {
                tracing::trace!("Duplicate {} from {}", envelope.sha256.short(), peer);
                continue;
            }
            unique.push(envelope);
        }
        unique
    }

    async fn first_sighting(&self, id: Hash) -> bool {
        self.seen.lock().await.put(id, Utc::now()).is_none()
    }

    async fn reassemble(&self, peer: &PeerId, envelope: &Envelope) -> Option<Envelope> {
        let part: PartPayload = match envelope.payload() {
            Ok(part) => part,
            Err(e) => {
                tracing::warn!("Malformed part {} from {}: {}", envelope.sha256.short(), peer, e);
                return None;
            }
        };
        match self.reassembler.reassemble(peer, &part).await {
            Ok(original) => original,
            Err(e) => {
                tracing::warn!(
                    "Discarding part group {} from {}: {}",
                    part.original_sha256.short(),
                    peer,
                    e
                );
                None
            }
        }
    }

    /// True if `id` was seen recently
    pub async fn has_seen(&self, id: &Hash) -> bool {
        self.seen.lock().await.contains(id)
    }

    /// Number of unknown senders with held messages
    pub async fn held_senders(&self) -> usize {
        self.unknown.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::AckKind;
    use crate::identity::LocalIdentity;
    use crate::split::MessageSplitter;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Recorder {
        known: std::sync::Mutex<HashMap<IdentityKey, PeerId>>,
        documents: HashMap<PeerId, PeerDocument>,
        receipts: Mutex<Vec<Vec<Hash>>>,
        dispatched: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl InboundContext for Recorder {
        fn peer_for_key(&self, key: &IdentityKey) -> Option<PeerId> {
            self.known.lock().unwrap().get(key).cloned()
        }

        async fn resolve_document(&self, id: &PeerId) -> Result<PeerDocument> {
            self.documents
                .get(id)
                .cloned()
                .ok_or_else(|| CoreError::Resolution(id.to_string().into()))
        }

        async fn materialize_peer(&self, document: PeerDocument) -> Result<()> {
            self.known
                .lock()
                .unwrap()
                .insert(document.identity_key, document.id);
            Ok(())
        }

        async fn send_receipts(&self, _peer: &PeerId, ids: Vec<Hash>) {
            self.receipts.lock().await.push(ids);
        }

        async fn dispatch(&self, _peer: &PeerId, messages: Vec<Envelope>) {
            self.dispatched.lock().await.extend(messages);
        }
    }

    fn identity(name: &str) -> LocalIdentity {
        LocalIdentity::generate(PeerId::new(format!("did:test:{name}")).unwrap(), false)
    }

    fn text(body: &str) -> Envelope {
        Envelope::new("text", json!(body), None).unwrap()
    }

    fn known(sender: &LocalIdentity) -> Recorder {
        let recorder = Recorder::default();
        recorder
            .known
            .lock()
            .unwrap()
            .insert(sender.identity_key(), sender.id().clone());
        recorder
    }

    #[tokio::test]
    async fn test_repeats_processed_once() {
        let sender = identity("alice");
        let ctx = known(&sender);
        let middleware = InboundMiddleware::new(&CoreConfig::default());
        let hello = text("hello");

        middleware
            .handle(&ctx, sender.identity_key(), vec![hello.clone(), hello.clone()])
            .await
            .unwrap();
        middleware
            .handle(&ctx, sender.identity_key(), vec![hello.clone()])
            .await
            .unwrap();

        assert_eq!(*ctx.dispatched.lock().await, vec![hello.clone()]);
        assert_eq!(*ctx.receipts.lock().await, vec![vec![hello.sha256]]);
        assert!(middleware.has_seen(&hello.sha256).await);
    }

    #[tokio::test]
    async fn test_acks_are_not_acknowledged() {
        let sender = identity("alice");
        let ctx = known(&sender);
        let middleware = InboundMiddleware::new(&CoreConfig::default());
        let ack = Envelope::ack(AckKind::Received, vec![Hash::sha256(b"x")]).unwrap();

        middleware
            .handle(&ctx, sender.identity_key(), vec![ack.clone()])
            .await
            .unwrap();

        assert!(ctx.receipts.lock().await.is_empty());
        assert_eq!(*ctx.dispatched.lock().await, vec![ack]);
    }

    #[tokio::test]
    async fn test_tampered_envelope_dropped() {
        let sender = identity("alice");
        let ctx = known(&sender);
        let middleware = InboundMiddleware::new(&CoreConfig::default());
        let mut forged = text("original");
        forged.data = json!("changed");

        middleware
            .handle(&ctx, sender.identity_key(), vec![forged])
            .await
            .unwrap();
        assert!(ctx.dispatched.lock().await.is_empty());
        assert!(ctx.receipts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_sender_held_until_identified() {
        let sender = identity("bob");
        let mut ctx = Recorder::default();
        ctx.documents.insert(sender.id().clone(), sender.document());
        let middleware = InboundMiddleware::new(&CoreConfig::default());

        let early = text("before identity");
        middleware
            .handle(&ctx, sender.identity_key(), vec![early.clone()])
            .await
            .unwrap();
        assert!(ctx.dispatched.lock().await.is_empty());
        assert_eq!(middleware.held_senders().await, 1);

        let announce = Envelope::identity(&sender.document()).unwrap();
        let late = text("after identity");
        middleware
            .handle(&ctx, sender.identity_key(), vec![announce.clone(), late.clone()])
            .await
            .unwrap();

        assert_eq!(middleware.held_senders().await, 0);
        assert_eq!(*ctx.dispatched.lock().await, vec![early, announce, late]);
        assert_eq!(ctx.peer_for_key(&sender.identity_key()), Some(sender.id().clone()));
    }

    #[tokio::test]
    async fn test_identity_for_other_key_rejected() {
        let sender = identity("mallory");
        let victim = identity("bob");
        let mut ctx = Recorder::default();
        ctx.documents.insert(victim.id().clone(), victim.document());
        let middleware = InboundMiddleware::new(&CoreConfig::default());

        let claim = Envelope::identity(&victim.document()).unwrap();
        let err = middleware
            .handle(&ctx, sender.identity_key(), vec![claim])
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::IdentityKeyMismatch(_)));
        assert!(ctx.peer_for_key(&sender.identity_key()).is_none());
        assert!(ctx.dispatched.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_sender_stays_held() {
        let sender = identity("carol");
        let ctx = Recorder::default();
        let middleware = InboundMiddleware::new(&CoreConfig::default());

        let announce = Envelope::identity(&sender.document()).unwrap();
        middleware
            .handle(&ctx, sender.identity_key(), vec![announce])
            .await
            .unwrap();
        assert_eq!(middleware.held_senders().await, 1);
    }

    #[tokio::test]
    async fn test_parts_reassembled_and_receipted() {
        let sender = identity("alice");
        let ctx = known(&sender);
        let mut config = CoreConfig::default();
        config.limits.part_size = 128;
        let splitter = MessageSplitter::new(&config);
        let middleware = InboundMiddleware::new(&config);

        let original = Envelope::new("text", json!("z".repeat(1000)), None).unwrap();
        let mut parts = splitter.split(&original).await.unwrap();
        parts.rotate_left(2);
        let part_ids: Vec<Hash> = parts.iter().map(|p| p.sha256).collect();

        middleware
            .handle(&ctx, sender.identity_key(), parts.clone())
            .await
            .unwrap();
        // replay of the whole group changes nothing
        middleware
            .handle(&ctx, sender.identity_key(), parts)
            .await
            .unwrap();

        assert_eq!(*ctx.dispatched.lock().await, vec![original]);
        assert_eq!(*ctx.receipts.lock().await, vec![part_ids]);
    }
}

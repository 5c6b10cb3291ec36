//! Outbound splitting and part-group acknowledgement tracking

use crate::config::CoreConfig;
use crate::envelope::{AckKind, Envelope, PartPayload, kinds};
use crate::error::{CoreError, Result};
use crate::hash::Hash;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use tokio::sync::Mutex;

/// Acknowledgement progress of one outbound part group
#[derive(Debug)]
struct GroupProgress {
    parts: Vec<Hash>,
    delivered: HashSet<Hash>,
    received: HashSet<Hash>,
    delivered_fired: bool,
    received_fired: bool,
}

impl GroupProgress {
    fn new(parts: Vec<Hash>) -> Self {
        Self {
            parts,
            delivered: HashSet::new(),
            received: HashSet::new(),
            delivered_fired: false,
            received_fired: false,
        }
    }

    /// Record an ack for `part`; true when the group completes for `kind`
    fn record(&mut self, kind: AckKind, part: Hash) -> bool {
        let total = self.parts.len();
        let (seen, fired) = match kind {
            AckKind::Delivered => (&mut self.delivered, &mut self.delivered_fired),
            AckKind::Received => (&mut self.received, &mut self.received_fired),
            AckKind::Read => return false,
        };
        seen.insert(part);
        if !*fired && seen.len() == total {
            *fired = true;
            return true;
        }
        false
    }

    fn finished(&self) -> bool {
        self.delivered_fired && self.received_fired
    }
}

#[derive(Debug)]
struct Tracker {
    /// Original id -> progress
    groups: LruCache<Hash, GroupProgress>,
    /// Part id -> original id
    parts: HashMap<Hash, Hash>,
}

/// Splits oversized envelopes and folds part acks back into original ids
#[derive(Debug)]
pub struct MessageSplitter {
    max_message_size: usize,
    part_size: usize,
    tracker: Mutex<Tracker>,
}

impl MessageSplitter {
    /// Create a splitter from the configured limits
    #[must_use]
    pub fn new(config: &CoreConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.inbound.reassembly_groups).unwrap_or(NonZeroUsize::MIN);
        Self {
            max_message_size: config.limits.max_message_size,
            part_size: config.limits.part_size.max(1),
            tracker: Mutex::new(Tracker {
                groups: LruCache::new(capacity),
                parts: HashMap::new(),
            }),
        }
    }

    /// True if the envelope's wire encoding exceeds the message size limit
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Serialization`] if the envelope cannot be encoded.
    pub fn needs_split(&self, envelope: &Envelope) -> Result<bool> {
        Ok(envelope.serialized_len()? > self.max_message_size)
    }

    /// Split `envelope` into part envelopes and start tracking the group
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Serialization`] if the envelope cannot be encoded,
    /// or [`CoreError::InvalidState`] if it would need more than `u32::MAX`
    /// parts.
    pub async fn split(&self, envelope: &Envelope) -> Result<Vec<Envelope>> {
        let bytes = envelope.to_bytes()?;
        let chunks: Vec<&[u8]> = bytes.chunks(self.part_size).collect();
        let total_parts = u32::try_from(chunks.len())
            .map_err(|_| CoreError::invalid_state("message needs too many parts"))?;

        let mut parts = Vec::with_capacity(chunks.len());
        for (index, chunk) in (0u32..).zip(chunks) {
            let payload = PartPayload {
                original_type: envelope.kind.clone(),
                part_number: index,
                total_parts,
                original_sha256: envelope.sha256,
                content: BASE64.encode(chunk),
            };
            parts.push(Envelope::encode(kinds::PART, &payload, None)?);
        }

        let ids: Vec<Hash> = parts.iter().map(|p| p.sha256).collect();
        self.track(envelope.sha256, ids).await;

        tracing::debug!(
            "Split {} ({} bytes) into {} parts",
            envelope.sha256.short(),
            bytes.len(),
            total_parts
        );
        Ok(parts)
    }

    async fn track(&self, original: Hash, ids: Vec<Hash>) {
        let mut tracker = self.tracker.lock().await;
        for id in &ids {
            tracker.parts.insert(*id, original);
        }
        if let Some((evicted, progress)) = tracker.groups.push(original, GroupProgress::new(ids))
        {
            if evicted != original {
                tracing::debug!("Evicting part group {} from tracker", evicted.short());
            }
            for part in progress.parts {
                if tracker.parts.get(&part) == Some(&evicted) {
                    tracker.parts.remove(&part);
                }
            }
        }
    }

    /// Translate acknowledged ids into the ids reported to the application
    ///
    /// Ids that are not parts pass through unchanged. Part ids are swallowed;
    /// the original id is emitted exactly once per ack kind, when the last
    /// part of its group is acknowledged.
    pub async fn on_ack(&self, kind: AckKind, ids: &[Hash]) -> Vec<Hash> {
        let mut tracker = self.tracker.lock().await;
        let mut out = Vec::with_capacity(ids.len());

        for id in ids {
            let Some(original) = tracker.parts.get(id).copied() else {
                out.push(*id);
                continue;
            };
            let Some(progress) = tracker.groups.get_mut(&original) else {
                continue;
            };
            if progress.record(kind, *id) {
                tracing::debug!(
                    "Part group {} complete for {:?}",
                    original.short(),
                    kind
                );
                out.push(original);
            }
            if progress.finished() {
                if let Some(progress) = tracker.groups.pop(&original) {
                    for part in progress.parts {
                        tracker.parts.remove(&part);
                    }
                }
            }
        }

        out
    }

    /// Number of part groups still tracked
    pub async fn tracked_groups(&self) -> usize {
        self.tracker.lock().await.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn splitter(max_message_size: usize, part_size: usize) -> MessageSplitter {
        let mut config = CoreConfig::default();
        config.limits.max_message_size = max_message_size;
        config.limits.part_size = part_size;
        MessageSplitter::new(&config)
    }

    fn big_envelope(len: usize) -> Envelope {
        Envelope::new("text", json!("x".repeat(len)), None).unwrap()
    }

    #[tokio::test]
    async fn test_needs_split_threshold() {
        let s = splitter(1024, 256);
        assert!(!s.needs_split(&big_envelope(10)).unwrap());
        assert!(s.needs_split(&big_envelope(2048)).unwrap());
    }

    #[tokio::test]
    async fn test_split_parts_carry_group_metadata() {
        let s = splitter(1024, 256);
        let original = big_envelope(2048);
        let parts = s.split(&original).await.unwrap();

        let total = original.to_bytes().unwrap().len().div_ceil(256);
        assert_eq!(parts.len(), total);

        let mut joined = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.kind, kinds::PART);
            let payload: PartPayload = part.payload().unwrap();
            assert_eq!(payload.part_number as usize, i);
            assert_eq!(payload.total_parts as usize, total);
            assert_eq!(payload.original_sha256, original.sha256);
            assert_eq!(payload.original_type, "text");
            joined.extend(BASE64.decode(payload.content).unwrap());
        }
        assert_eq!(joined, original.to_bytes().unwrap());
    }

    #[tokio::test]
    async fn test_group_ack_fires_once_after_last_part() {
        let s = splitter(1024, 256);
        let original = big_envelope(1000);
        let parts = s.split(&original).await.unwrap();
        let ids: Vec<Hash> = parts.iter().map(|p| p.sha256).collect();
        assert!(ids.len() >= 3);

        let other = Hash::sha256(b"plain message");

        // acks arrive in reverse order, with a duplicate and an unrelated id
        let (last, rest) = ids.split_first().unwrap();
        let mut fired = s.on_ack(AckKind::Delivered, &[other]).await;
        for id in rest.iter().rev() {
            fired.extend(s.on_ack(AckKind::Delivered, &[*id]).await);
        }
        fired.extend(s.on_ack(AckKind::Delivered, &[rest[0]]).await);
        assert_eq!(fired, vec![other]);

        assert_eq!(s.on_ack(AckKind::Delivered, &[*last]).await, vec![original.sha256]);
        assert!(s.on_ack(AckKind::Delivered, &ids).await.is_empty());
        assert_eq!(s.tracked_groups().await, 1);

        // received acks complete the group and stop tracking
        assert_eq!(s.on_ack(AckKind::Received, &ids).await, vec![original.sha256]);
        assert_eq!(s.tracked_groups().await, 0);

        // once untracked, part ids pass through untouched
        assert_eq!(s.on_ack(AckKind::Received, &[ids[0]]).await, vec![ids[0]]);
    }

    #[tokio::test]
    async fn test_read_acks_pass_through() {
        let s = splitter(1024, 256);
        let original = big_envelope(1000);
        s.split(&original).await.unwrap();
        assert_eq!(
            s.on_ack(AckKind::Read, &[original.sha256]).await,
            vec![original.sha256]
        );
    }
}

//! Inbound part reassembly
//!
//! Groups are keyed by sender and original id, so two peers sending the same
//! content never share a group.

use crate::envelope::{Envelope, PartPayload};
use crate::error::{CoreError, Result};
use crate::hash::Hash;
use crate::identity::PeerId;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use lru::LruCache;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;

/// Parts buffered for one original envelope
#[derive(Debug)]
struct PartGroup {
    total_parts: u32,
    parts: BTreeMap<u32, Vec<u8>>,
}

type GroupKey = (PeerId, Hash);

#[derive(Debug)]
struct Groups {
    pending: LruCache<GroupKey, PartGroup>,
    /// Recently finished groups, so late duplicates are ignored
    finished: LruCache<GroupKey, ()>,
}

/// Buffers parts by sender and original id and rebuilds the original envelope
#[derive(Debug)]
pub struct MessageReassembler {
    groups: Mutex<Groups>,
}

impl MessageReassembler {
    /// Create a reassembler buffering at most `capacity` groups
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            groups: Mutex::new(Groups {
                pending: LruCache::new(capacity),
                finished: LruCache::new(capacity),
            }),
        }
    }

    /// Buffer one part from `sender`; returns the concatenated bytes once the
    /// group is whole
    ///
    /// Duplicate part numbers, parts of already finished groups and parts
    /// disagreeing with their group on `total_parts` are ignored. The group is
    /// discarded after success or failure.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Serialization`] if the content is not valid base64
    /// - [`CoreError::MissingPart`] if the completed group is not numbered
    ///   `0..total_parts`
    pub async fn accept(&self, sender: &PeerId, part: &PartPayload) -> Result<Option<Vec<u8>>> {
        let group_id = part.original_sha256;
        let key = (sender.clone(), group_id);
        if part.total_parts == 0 {
            return Err(CoreError::MissingPart {
                group: group_id,
                expected: 0,
            });
        }

        let content = BASE64.decode(&part.content).map_err(|e| {
            CoreError::Serialization(Cow::Owned(format!("invalid part content: {e}")))
        })?;

        let mut groups = self.groups.lock().await;
        if groups.finished.contains(&key) {
            tracing::trace!(
                "Ignoring late part {} of finished group {}",
                part.part_number,
                group_id.short()
            );
            return Ok(None);
        }

        let group = groups.pending.get_or_insert_mut(key.clone(), || PartGroup {
            total_parts: part.total_parts,
            parts: BTreeMap::new(),
        });
        if group.total_parts != part.total_parts {
            tracing::debug!(
                "Ignoring part {} of group {} from {}: {} total parts, group has {}",
                part.part_number,
                group_id.short(),
                sender,
                part.total_parts,
                group.total_parts
            );
            return Ok(None);
        }
        if group.parts.contains_key(&part.part_number) {
            tracing::trace!(
                "Ignoring duplicate part {} of group {}",
                part.part_number,
                group_id.short()
            );
            return Ok(None);
        }
        group.parts.insert(part.part_number, content);

        if group.parts.len() < group.total_parts as usize {
            return Ok(None);
        }

        let Some(group) = groups.pending.pop(&key) else {
            return Ok(None);
        };
        groups.finished.put(key, ());
        drop(groups);

        // BTreeMap iterates in part order, so the first gap is the first mismatch
        for (expected, number) in (0u32..).zip(group.parts.keys()) {
            if *number != expected {
                tracing::warn!(
                    "Discarding part group {}: missing part {}",
                    group_id.short(),
                    expected
                );
                return Err(CoreError::MissingPart {
                    group: group_id,
                    expected,
                });
            }
        }

        Ok(Some(group.parts.into_values().flatten().collect()))
    }

    /// Buffer one part from `sender`; returns the original envelope once the
    /// group is whole
    ///
    /// # Errors
    ///
    /// Returns the [`MessageReassembler::accept`] errors, plus
    /// [`CoreError::Serialization`] if the rebuilt bytes do not parse or do not
    /// match `original_sha256`.
    pub async fn reassemble(&self, sender: &PeerId, part: &PartPayload) -> Result<Option<Envelope>> {
        let Some(bytes) = self.accept(sender, part).await? else {
            return Ok(None);
        };

        let envelope = Envelope::from_bytes(&bytes)?;
        if envelope.sha256 != part.original_sha256 || !envelope.verify() {
            return Err(CoreError::serialization(
                "reassembled envelope does not match its id",
            ));
        }
        Ok(Some(envelope))
    }

    /// Number of groups waiting for parts
    pub async fn pending_groups(&self) -> usize {
        self.groups.lock().await.pending.len()
    }
}

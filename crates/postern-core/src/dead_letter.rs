//! Bounded dead-letter queues
//!
//! Holds items that cannot be processed yet (ciphertext that arrived before
//! its handshake, batches from a sender that is not resolved yet). Entries
//! are released only through [`DeadLetterQueue::take`], which removes the
//! whole key at once so that a key is never partially replayed.

use lru::LruCache;
use std::hash::Hash as StdHash;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;

/// Keyed holding area with least-recently-used eviction of whole keys
#[derive(Debug)]
pub struct DeadLetterQueue<K: StdHash + Eq, V> {
    entries: Mutex<LruCache<K, Vec<V>>>,
    per_key: usize,
}

impl<K: StdHash + Eq, V> DeadLetterQueue<K, V> {
    /// Create a queue holding at most `keys` keys of `per_key` items each
    ///
    /// Zero capacities are raised to one.
    #[must_use]
    pub fn new(keys: usize, per_key: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(NonZeroUsize::new(keys).unwrap_or(NonZeroUsize::MIN))),
            per_key: per_key.max(1),
        }
    }

    /// Append `item` under `key`
    ///
    /// When the key is full the oldest item under it is dropped. Returns
    /// `true` if something was dropped (an old item or an evicted key).
    pub async fn push(&self, key: K, item: V) -> bool {
        let mut entries = self.entries.lock().await;
        let mut dropped = false;

        if let Some(items) = entries.get_mut(&key) {
            if items.len() >= self.per_key {
                items.remove(0);
                dropped = true;
            }
            items.push(item);
            return dropped;
        }

        if entries.push(key, vec![item]).is_some() {
            dropped = true;
        }
        dropped
    }

    /// Remove and return every item under `key`, in arrival order
    pub async fn take(&self, key: &K) -> Vec<V> {
        self.entries.lock().await.pop(key).unwrap_or_default()
    }

    /// True if `key` has pending items
    pub async fn contains(&self, key: &K) -> bool {
        self.entries.lock().await.contains(key)
    }

    /// Number of keys with pending items
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// True if nothing is pending
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

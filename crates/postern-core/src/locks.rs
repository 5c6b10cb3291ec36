//! Named per-peer critical sections
//!
//! Every peer owns three independent, non-reentrant locks:
//!
//! - [`LockKind::QueueFlush`] serializes `queue`, `flush`, `ack` and `close`.
//! - [`LockKind::PreferredEndpoint`] guards the preferred endpoint so that
//!   preference changes and pending sends do not block each other.
//! - [`LockKind::SessionReset`] makes concurrent reset notifications for the
//!   same event idempotent.
//!
//! Locks live in a table keyed by `(PeerId, LockKind)` and are held through
//! RAII guards, so every exit path (including errors and cancellation)
//! releases them. Acquisition is bounded by `acquire_timeout`; work done
//! under [`LockTable::run_exclusive`] is bounded by `occupation_timeout`, after
//! which the work is dropped and the lock released.
//!
//! [`LockTable::acquire_skip_queue`] raises a priority gate on the lock: while
//! it is raised, ordinary acquirers that obtain the mutex hand it straight
//! back and wait, so the skip-queue caller is served before them.

use crate::config::LockConfig;
use crate::error::{CoreError, Result};
use crate::identity::PeerId;
use dashmap::DashMap;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};

/// Named critical section of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Queue mutation and flushing
    QueueFlush,
    /// Preferred endpoint reads and writes
    PreferredEndpoint,
    /// Incoming session reset handling
    SessionReset,
}

impl LockKind {
    fn name(self) -> &'static str {
        match self {
            LockKind::QueueFlush => "queue-flush",
            LockKind::PreferredEndpoint => "preferred-endpoint",
            LockKind::SessionReset => "session-reset",
        }
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct PeerLockGuard {
    _guard: OwnedMutexGuard<()>,
    kind: LockKind,
}

impl PeerLockGuard {
    /// Which critical section is held
    #[must_use]
    pub fn kind(&self) -> LockKind {
        self.kind
    }
}

/// One named lock plus its skip-queue gate
#[derive(Debug, Default)]
struct PeerLock {
    mutex: Arc<Mutex<()>>,
    /// Skip-queue callers currently waiting
    priority: AtomicUsize,
    /// Signalled when the last skip-queue caller stops waiting
    gate_lowered: Notify,
}

impl PeerLock {
    /// Ordinary FIFO acquisition that yields to skip-queue callers
    async fn lock(&self) -> OwnedMutexGuard<()> {
        loop {
            let lowered = self.gate_lowered.notified();
            if self.priority.load(Ordering::SeqCst) == 0 {
                let guard = self.mutex.clone().lock_owned().await;
                if self.priority.load(Ordering::SeqCst) == 0 {
                    return guard;
                }
                // hand the mutex on to the skip-queue caller behind us
                drop(guard);
                continue;
            }
            lowered.await;
        }
    }
}

/// Lowers the gate when a skip-queue caller stops waiting, however it stops
struct RaisedGate<'a>(&'a PeerLock);

impl Drop for RaisedGate<'_> {
    fn drop(&mut self) {
        if self.0.priority.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.gate_lowered.notify_waiters();
        }
    }
}

/// Table of `(peer, kind)` locks
#[derive(Debug)]
pub struct LockTable {
    locks: DashMap<(PeerId, LockKind), Arc<PeerLock>>,
    config: LockConfig,
}

impl LockTable {
    /// Create an empty table
    #[must_use]
    pub fn new(config: LockConfig) -> Self {
        Self {
            locks: DashMap::new(),
            config,
        }
    }

    fn lock_for(&self, peer: &PeerId, kind: LockKind) -> Arc<PeerLock> {
        self.locks
            .entry((peer.clone(), kind))
            .or_default()
            .value()
            .clone()
    }

    /// Wait (in FIFO order, behind skip-queue callers) for the lock, bounded
    /// by `acquire_timeout`
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Timeout`] if the lock is not obtained in time.
    pub async fn acquire(&self, peer: &PeerId, kind: LockKind) -> Result<PeerLockGuard> {
        let lock = self.lock_for(peer, kind);
        match tokio::time::timeout(self.config.acquire_timeout, lock.lock()).await {
            Ok(guard) => Ok(PeerLockGuard {
                _guard: guard,
                kind,
            }),
            Err(_) => {
                tracing::warn!("Timed out acquiring {} lock for {}", kind.name(), peer);
                Err(CoreError::Timeout(Cow::Owned(format!(
                    "acquiring {} lock for {peer}",
                    kind.name()
                ))))
            }
        }
    }

    /// Acquire ahead of every ordinary waiter
    ///
    /// Used by cancellation: the caller has already signalled cancellation and
    /// only needs the in-flight holder to finish, not the callers queued
    /// behind it. Waits at most `occupation_timeout`; returns `None` if the
    /// holder overran, which is treated as a forced release.
    pub async fn acquire_skip_queue(&self, peer: &PeerId, kind: LockKind) -> Option<PeerLockGuard> {
        let lock = self.lock_for(peer, kind);
        if let Ok(guard) = lock.mutex.clone().try_lock_owned() {
            return Some(PeerLockGuard {
                _guard: guard,
                kind,
            });
        }

        lock.priority.fetch_add(1, Ordering::SeqCst);
        let gate = RaisedGate(&lock);
        let acquired =
            tokio::time::timeout(self.config.occupation_timeout, lock.mutex.clone().lock_owned())
                .await;
        drop(gate);

        match acquired {
            Ok(guard) => Some(PeerLockGuard {
                _guard: guard,
                kind,
            }),
            Err(_) => {
                tracing::warn!(
                    "{} lock for {} still occupied, forcing release",
                    kind.name(),
                    peer
                );
                None
            }
        }
    }

    /// Run `work` while holding the lock, bounded by `occupation_timeout`
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Timeout`] if the lock cannot be acquired or the
    /// work overruns its occupation budget; otherwise the work's own result.
    pub async fn run_exclusive<T, F>(&self, peer: &PeerId, kind: LockKind, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _guard = self.acquire(peer, kind).await?;
        match tokio::time::timeout(self.config.occupation_timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("{} lock for {} exceeded occupation timeout", kind.name(), peer);
                Err(CoreError::Timeout(Cow::Owned(format!(
                    "{} occupation for {peer}",
                    kind.name()
                ))))
            }
        }
    }

    /// Drop every lock of a closed peer
    pub fn remove_peer(&self, peer: &PeerId) {
        self.locks.retain(|(id, _), _| id != peer);
    }

    /// Number of lock entries (for diagnostics)
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no lock has been created yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn peer(name: &str) -> PeerId {
        PeerId::new(format!("did:key:{name}")).unwrap()
    }

    fn table(acquire_ms: u64, occupation_ms: u64) -> Arc<LockTable> {
        Arc::new(LockTable::new(LockConfig {
            acquire_timeout: Duration::from_millis(acquire_ms),
            occupation_timeout: Duration::from_millis(occupation_ms),
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_kind_is_exclusive() {
        let locks = table(1_000, 10_000);
        let bob = peer("bob");

        let guard = locks.acquire(&bob, LockKind::QueueFlush).await.unwrap();
        assert_eq!(guard.kind(), LockKind::QueueFlush);

        let blocked = locks.acquire(&bob, LockKind::QueueFlush).await;
        assert!(matches!(blocked, Err(CoreError::Timeout(_))));

        drop(guard);
        assert!(locks.acquire(&bob, LockKind::QueueFlush).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_kinds_and_peers_are_independent() {
        let locks = table(100, 10_000);
        let bob = peer("bob");
        let carol = peer("carol");

        let _flush = locks.acquire(&bob, LockKind::QueueFlush).await.unwrap();
        assert!(locks.acquire(&bob, LockKind::PreferredEndpoint).await.is_ok());
        assert!(locks.acquire(&bob, LockKind::SessionReset).await.is_ok());
        assert!(locks.acquire(&carol, LockKind::QueueFlush).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exclusive_serializes() {
        let locks = table(10_000, 10_000);
        let bob = peer("bob");
        let inside = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let bob = bob.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                locks
                    .run_exclusive(&bob, LockKind::QueueFlush, async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_occupation_timeout_releases_lock() {
        let locks = table(10_000, 50);
        let bob = peer("bob");

        let result: Result<()> = locks
            .run_exclusive(&bob, LockKind::QueueFlush, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CoreError::Timeout(_))));

        // lock is free again
        let guard = locks.acquire(&bob, LockKind::QueueFlush).await;
        assert!(guard.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_path_releases_lock() {
        let locks = table(100, 1_000);
        let bob = peer("bob");

        let result: Result<()> = locks
            .run_exclusive(&bob, LockKind::QueueFlush, async {
                Err(CoreError::transport("boom"))
            })
            .await;
        assert!(result.is_err());
        assert!(locks.acquire(&bob, LockKind::QueueFlush).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_queue_forces_release_after_occupation_timeout() {
        let locks = table(10_000, 100);
        let bob = peer("bob");

        assert!(locks.acquire_skip_queue(&bob, LockKind::QueueFlush).await.is_some());

        let held = locks.acquire(&bob, LockKind::QueueFlush).await.unwrap();
        assert!(locks.acquire_skip_queue(&bob, LockKind::QueueFlush).await.is_none());
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_queue_served_before_waiters() {
        let locks = table(10_000, 10_000);
        let bob = peer("bob");
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = locks.acquire(&bob, LockKind::QueueFlush).await.unwrap();

        let flush = tokio::spawn({
            let locks = locks.clone();
            let bob = bob.clone();
            let order = order.clone();
            async move {
                let _guard = locks.acquire(&bob, LockKind::QueueFlush).await.unwrap();
                order.lock().await.push("flush");
            }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let close = tokio::spawn({
            let locks = locks.clone();
            let bob = bob.clone();
            let order = order.clone();
            async move {
                let _guard = locks.acquire_skip_queue(&bob, LockKind::QueueFlush).await.unwrap();
                order.lock().await.push("close");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        drop(held);
        close.await.unwrap();
        flush.await.unwrap();
        assert_eq!(*order.lock().await, vec!["close", "flush"]);

        // the gate is lowered again
        assert_eq!(locks.lock_for(&bob, LockKind::QueueFlush).priority.load(Ordering::SeqCst), 0);
        assert!(locks.acquire(&bob, LockKind::QueueFlush).await.is_ok());
    }

    #[test]
    fn test_remove_peer() {
        let locks = LockTable::new(LockConfig::default());
        let bob = peer("bob");
        let carol = peer("carol");
        let _ = locks.lock_for(&bob, LockKind::QueueFlush);
        let _ = locks.lock_for(&bob, LockKind::SessionReset);
        let _ = locks.lock_for(&carol, LockKind::QueueFlush);
        assert_eq!(locks.len(), 3);

        locks.remove_peer(&bob);
        assert_eq!(locks.len(), 1);
    }
}

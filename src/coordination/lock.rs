//! Polling mutual-exclusion lock built on sequential ephemeral nodes
//!
//! Each contender creates an ephemeral, sequentially numbered child under
//! the lock root. The contender whose child sorts first by sequence suffix
//! holds the lock. Waiting is done by re-listing the children at a fixed
//! interval rather than through watches.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use super::store::{
    join_path, node_name, sequence_suffix, CoordinationStore, CreateMode, StoreError, ANY_VERSION,
};
use crate::observability::convergence_metrics;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {timeout:?} waiting for lock {path}")]
    Timeout { path: String, timeout: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotAcquiredReason {
    /// Non-blocking attempt found another contender ahead
    Rejected,
    Timeout,
    /// The attempt was aborted by a store error
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unattempted,
    Contending,
    Acquired,
    NotAcquired(NotAcquiredReason),
    Released,
}

/// A lock held across worker processes
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to become the holder. Returns `Ok(false)` when a non-blocking
    /// attempt loses, and `LockError::Timeout` when a blocking attempt runs
    /// out of time.
    async fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> Result<bool, LockError>;

    /// Give the lock up. Releasing a lock that was never held is a no-op.
    async fn release(&self) -> Result<(), LockError>;

    /// Re-derive from the store whether this contender currently holds the lock
    async fn is_acquired(&self) -> Result<bool, LockError>;
}

enum Contention {
    Acquired,
    Rejected,
    /// Our own node is no longer listed under the root
    Vanished,
    TimedOut(Duration),
}

#[derive(Debug)]
struct Contender {
    node: Option<String>,
    state: LockState,
}

/// `DistributedLock` over a `CoordinationStore`
pub struct PollingLock {
    store: Arc<dyn CoordinationStore>,
    path: String,
    owner_id: String,
    poll_interval: Duration,
    contender: Mutex<Contender>,
}

impl std::fmt::Debug for PollingLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingLock")
            .field("path", &self.path)
            .field("owner_id", &self.owner_id)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl PollingLock {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        path: impl Into<String>,
        owner_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            path: path.into(),
            owner_id: owner_id.into(),
            poll_interval,
            contender: Mutex::new(Contender {
                node: None,
                state: LockState::Unattempted,
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub async fn state(&self) -> LockState {
        self.contender.lock().await.state
    }

    /// Full path of the node this contender currently owns, if any
    pub async fn node(&self) -> Option<String> {
        self.contender.lock().await.node.clone()
    }

    async fn ensure_root(&self) -> Result<(), StoreError> {
        match self
            .store
            .create(&self.path, b"", CreateMode::persistent().with_makepath())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_node_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn holds_first(&self, node: &str) -> Result<bool, StoreError> {
        let children = self.store.get_children(&self.path).await?;
        Ok(is_first(&children, node_name(node)))
    }

    async fn contend(
        &self,
        node: &str,
        blocking: bool,
        timeout: Option<Duration>,
        started: Instant,
    ) -> Result<Contention, StoreError> {
        let own = node_name(node);
        loop {
            let children = self.store.get_children(&self.path).await?;
            if !children.iter().any(|child| child == own) {
                return Ok(Contention::Vanished);
            }
            if is_first(&children, own) {
                return Ok(Contention::Acquired);
            }
            if !blocking {
                return Ok(Contention::Rejected);
            }
            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    return Ok(Contention::TimedOut(timeout));
                }
            }
            debug!(path = %self.path, node, "Lock held elsewhere, polling");
            sleep(self.poll_interval).await;
        }
    }

    /// Delete the owned node, forgetting it once it is gone
    async fn remove_node(&self, contender: &mut Contender) -> Result<(), StoreError> {
        let Some(node) = contender.node.clone() else {
            return Ok(());
        };
        match self.store.delete(&node, ANY_VERSION).await {
            Ok(()) => {}
            Err(e) if e.is_no_node() || e.is_bad_version() => {
                debug!(node = %node, "Lock node already gone");
            }
            Err(e) => return Err(e),
        }
        contender.node = None;
        Ok(())
    }

    /// Create this contender's sequential node under the lock root
    async fn enter(&self) -> Result<String, StoreError> {
        self.ensure_root().await?;

        let prefix = Uuid::new_v4().simple().to_string();
        self.store
            .create(
                &join_path(&self.path, &prefix),
                self.owner_id.as_bytes(),
                CreateMode::ephemeral_sequential(),
            )
            .await
    }

    async fn conclude(
        &self,
        contender: &mut Contender,
        node: &str,
        contention: Contention,
    ) -> Result<bool, LockError> {
        match contention {
            Contention::Acquired => {
                contender.state = LockState::Acquired;
                convergence_metrics().record_lock_acquisition();
                info!(path = %self.path, node, owner = %self.owner_id, "Acquired lock");
                Ok(true)
            }
            Contention::Rejected => {
                self.remove_node(contender).await?;
                contender.state = LockState::NotAcquired(NotAcquiredReason::Rejected);
                debug!(path = %self.path, "Lock held elsewhere, not waiting");
                Ok(false)
            }
            Contention::Vanished => {
                contender.node = None;
                contender.state = LockState::NotAcquired(NotAcquiredReason::Failed);
                warn!(path = %self.path, node, "Lock node disappeared while contending");
                Ok(false)
            }
            Contention::TimedOut(timeout) => {
                if let Err(e) = self.remove_node(contender).await {
                    warn!(path = %self.path, node, error = %e, "Failed to delete lock node after timeout");
                }
                contender.state = LockState::NotAcquired(NotAcquiredReason::Timeout);
                convergence_metrics().record_lock_timeout();
                Err(LockError::Timeout {
                    path: self.path.clone(),
                    timeout,
                })
            }
        }
    }
}

#[async_trait]
impl DistributedLock for PollingLock {
    async fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> Result<bool, LockError> {
        let (node, started) = {
            let mut contender = self.contender.lock().await;

            // a node left over from an earlier failed attempt
            self.remove_node(&mut contender).await?;

            contender.state = LockState::Contending;
            let started = Instant::now();
            match self.enter().await {
                Ok(node) => {
                    contender.node = Some(node.clone());
                    (node, started)
                }
                Err(e) => {
                    contender.state = LockState::NotAcquired(NotAcquiredReason::Failed);
                    return Err(e.into());
                }
            }
        };

        // polling runs without the contender mutex
        let contention = self.contend(&node, blocking, timeout, started).await;

        let mut contender = self.contender.lock().await;
        if contender.node.as_deref() != Some(node.as_str()) {
            debug!(path = %self.path, node = %node, "Lock released while contending");
            return Ok(false);
        }

        let result = match contention {
            Ok(contention) => self.conclude(&mut contender, &node, contention).await,
            Err(e) => Err(e.into()),
        };
        if let Err(LockError::Store(_)) = &result {
            if let Err(cleanup) = self.remove_node(&mut contender).await {
                warn!(path = %self.path, error = %cleanup, "Failed to delete lock node after error");
            }
            contender.state = LockState::NotAcquired(NotAcquiredReason::Failed);
        }
        result
    }

    async fn release(&self) -> Result<(), LockError> {
        let mut contender = self.contender.lock().await;
        if contender.node.is_none() {
            return Ok(());
        }
        self.remove_node(&mut contender).await?;
        contender.state = LockState::Released;
        info!(path = %self.path, owner = %self.owner_id, "Released lock");
        Ok(())
    }

    async fn is_acquired(&self) -> Result<bool, LockError> {
        let node = self.contender.lock().await.node.clone();
        match node {
            Some(node) => Ok(self.holds_first(&node).await?),
            None => Ok(false),
        }
    }
}

/// Whether `own` sorts first among `children` by (sequence suffix, name)
fn is_first(children: &[String], own: &str) -> bool {
    children
        .iter()
        .min_by(|a, b| {
            sequence_suffix(a)
                .cmp(sequence_suffix(b))
                .then_with(|| a.cmp(b))
        })
        .is_some_and(|first| first == own)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::store::MockCoordinationStore;
    use mockall::Sequence;
    use std::sync::Mutex as StdMutex;

    const ROOT: &str = "/testlock";

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Records the name the store assigns to this contender's node so that
    /// scripted `get_children` results can include it.
    #[derive(Clone, Default)]
    struct Assigned(Arc<StdMutex<String>>);

    impl Assigned {
        fn set(&self, name: String) {
            *self.0.lock().unwrap() = name;
        }

        fn get(&self) -> String {
            self.0.lock().unwrap().clone()
        }
    }

    fn expect_root(store: &mut MockCoordinationStore, seq: &mut Sequence, exists: bool) {
        store
            .expect_create()
            .withf(|path, _, mode| path == ROOT && mode.makepath && !mode.ephemeral)
            .times(1)
            .in_sequence(seq)
            .returning(move |path, _, _| {
                if exists {
                    Err(StoreError::NodeExists {
                        path: path.to_string(),
                    })
                } else {
                    Ok(path.to_string())
                }
            });
    }

    fn expect_contender_node(
        store: &mut MockCoordinationStore,
        seq: &mut Sequence,
        assigned: &Assigned,
        suffix: &'static str,
    ) {
        let assigned = assigned.clone();
        store
            .expect_create()
            .withf(|path, value, mode| {
                path.starts_with("/testlock/")
                    && value == b"id"
                    && mode.ephemeral
                    && mode.sequence
            })
            .times(1)
            .in_sequence(seq)
            .returning(move |path, _, _| {
                let full = format!("{path}{suffix}");
                assigned.set(node_name(&full).to_string());
                Ok(full)
            });
    }

    fn expect_children(
        store: &mut MockCoordinationStore,
        seq: &mut Sequence,
        assigned: &Assigned,
        others: &'static [&'static str],
        times: usize,
    ) {
        let assigned = assigned.clone();
        store
            .expect_get_children()
            .withf(|path| path == ROOT)
            .times(times)
            .in_sequence(seq)
            .returning(move |_| {
                let mut children = names(others);
                children.push(assigned.get());
                Ok(children)
            });
    }

    fn expect_delete_own(
        store: &mut MockCoordinationStore,
        seq: &mut Sequence,
        assigned: &Assigned,
        result: Result<(), StoreError>,
    ) {
        let assigned = assigned.clone();
        store
            .expect_delete()
            .withf(move |path, version| {
                *path == join_path(ROOT, &assigned.get()) && *version == ANY_VERSION
            })
            .times(1)
            .in_sequence(seq)
            .returning(move |_, _| result.clone());
    }

    fn lock(store: MockCoordinationStore) -> PollingLock {
        PollingLock::new(Arc::new(store), ROOT, "id", Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_acquire_success() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();
        expect_root(&mut store, &mut seq, true);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000000");
        expect_children(&mut store, &mut seq, &assigned, &[], 1);

        let lock = lock(store);
        assert!(lock.acquire(false, None).await.unwrap());
        assert_eq!(lock.state().await, LockState::Acquired);
        assert!(lock.node().await.unwrap().ends_with("0000000000"));
    }

    #[tokio::test]
    async fn test_acquire_creates_root() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();
        expect_root(&mut store, &mut seq, false);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000000");
        expect_children(&mut store, &mut seq, &assigned, &[], 1);

        assert!(lock(store).acquire(false, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_deletes_prior_node() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();

        // first attempt loses and its cleanup fails, leaving the node recorded
        expect_root(&mut store, &mut seq, true);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000002");
        expect_children(&mut store, &mut seq, &assigned, &["other0000000001"], 1);
        expect_delete_own(
            &mut store,
            &mut seq,
            &assigned,
            Err(StoreError::Connection {
                message: "reset".to_string(),
            }),
        );
        // best-effort cleanup after the error also fails
        expect_delete_own(
            &mut store,
            &mut seq,
            &assigned,
            Err(StoreError::Connection {
                message: "reset".to_string(),
            }),
        );

        // second attempt deletes the leftover before contending again
        expect_delete_own(&mut store, &mut seq, &assigned, Ok(()));
        expect_root(&mut store, &mut seq, true);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000003");
        expect_children(&mut store, &mut seq, &assigned, &[], 1);

        let lock = lock(store);
        assert!(lock.acquire(false, None).await.is_err());
        assert!(lock.node().await.is_some());
        assert!(lock.acquire(false, None).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_blocking_success() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();
        expect_root(&mut store, &mut seq, false);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000001");
        expect_children(&mut store, &mut seq, &assigned, &["prefix0000000000"], 2);
        expect_children(&mut store, &mut seq, &assigned, &[], 1);

        let lock = lock(store);
        let started = Instant::now();
        assert!(lock.acquire(true, Some(Duration::from_secs(1))).await.unwrap());
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_blocking_no_timeout() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();
        expect_root(&mut store, &mut seq, false);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000001");
        expect_children(&mut store, &mut seq, &assigned, &["prefix0000000000"], 50);
        expect_children(&mut store, &mut seq, &assigned, &[], 1);

        assert!(lock(store).acquire(true, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_nonblocking_fails() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();
        expect_root(&mut store, &mut seq, false);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000001");
        expect_children(&mut store, &mut seq, &assigned, &["prefix0000000000"], 1);
        expect_delete_own(&mut store, &mut seq, &assigned, Ok(()));

        let lock = lock(store);
        assert!(!lock.acquire(false, None).await.unwrap());
        assert_eq!(
            lock.state().await,
            LockState::NotAcquired(NotAcquiredReason::Rejected)
        );
        assert!(lock.node().await.is_none());
        // no node recorded, so no store call is made
        assert!(!lock.is_acquired().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();
        expect_root(&mut store, &mut seq, false);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000001");
        // polled at 0ms, 100ms, 200ms and 300ms
        expect_children(&mut store, &mut seq, &assigned, &["prefix0000000000"], 4);
        expect_delete_own(&mut store, &mut seq, &assigned, Ok(()));

        let lock = lock(store);
        let err = lock
            .acquire(true, Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LockError::Timeout {
                path: ROOT.to_string(),
                timeout: Duration::from_millis(300),
            }
        );
        assert_eq!(
            lock.state().await,
            LockState::NotAcquired(NotAcquiredReason::Timeout)
        );
        assert!(lock.node().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout_survives_failed_cleanup() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();
        expect_root(&mut store, &mut seq, false);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000001");
        expect_children(&mut store, &mut seq, &assigned, &["prefix0000000000"], 4);
        expect_delete_own(
            &mut store,
            &mut seq,
            &assigned,
            Err(StoreError::Connection {
                message: "reset".to_string(),
            }),
        );

        let lock = lock(store);
        let err = lock
            .acquire(true, Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert_eq!(
            lock.state().await,
            LockState::NotAcquired(NotAcquiredReason::Timeout)
        );
        // kept so the next acquire or release retries the delete
        assert!(lock.node().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_when_node_vanishes() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();
        expect_root(&mut store, &mut seq, true);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000001");
        expect_children(&mut store, &mut seq, &assigned, &["prefix0000000000"], 1);
        store
            .expect_get_children()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(names(&["prefix0000000000"])));

        let lock = lock(store);
        assert!(!lock.acquire(true, None).await.unwrap());
        assert_eq!(
            lock.state().await,
            LockState::NotAcquired(NotAcquiredReason::Failed)
        );
        assert!(lock.node().await.is_none());
    }

    #[tokio::test]
    async fn test_acquire_other_error() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();
        expect_root(&mut store, &mut seq, false);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000001");
        store
            .expect_get_children()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(StoreError::SessionExpired));
        expect_delete_own(&mut store, &mut seq, &assigned, Err(StoreError::SessionExpired));

        let err = lock(store)
            .acquire(true, Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert_eq!(err, LockError::Store(StoreError::SessionExpired));
    }

    #[tokio::test]
    async fn test_is_acquired_no_node() {
        let lock = lock(MockCoordinationStore::new());
        assert!(!lock.is_acquired().await.unwrap());
    }

    #[tokio::test]
    async fn test_is_acquired_tracks_rank() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();
        expect_root(&mut store, &mut seq, true);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000000");
        expect_children(&mut store, &mut seq, &assigned, &[], 2);
        expect_children(&mut store, &mut seq, &assigned, &["zzz0000000001"], 1);
        store
            .expect_get_children()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Vec::new()));

        let lock = lock(store);
        assert!(lock.acquire(false, None).await.unwrap());
        assert!(lock.is_acquired().await.unwrap());
        // a later contender does not displace the holder
        assert!(lock.is_acquired().await.unwrap());
        // node removed externally
        assert!(!lock.is_acquired().await.unwrap());
    }

    #[tokio::test]
    async fn test_release() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();
        expect_root(&mut store, &mut seq, true);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000000");
        expect_children(&mut store, &mut seq, &assigned, &[], 1);
        expect_delete_own(&mut store, &mut seq, &assigned, Ok(()));

        let lock = lock(store);
        assert!(lock.acquire(false, None).await.unwrap());
        lock.release().await.unwrap();
        assert_eq!(lock.state().await, LockState::Released);
        assert!(lock.node().await.is_none());
        // idempotent: nothing recorded, nothing deleted
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_tolerates_missing_node() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();
        expect_root(&mut store, &mut seq, true);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000000");
        expect_children(&mut store, &mut seq, &assigned, &[], 1);
        expect_delete_own(
            &mut store,
            &mut seq,
            &assigned,
            Err(StoreError::NoNode {
                path: "gone".to_string(),
            }),
        );

        let lock = lock(store);
        assert!(lock.acquire(false, None).await.unwrap());
        lock.release().await.unwrap();
        assert!(lock.node().await.is_none());
    }

    #[tokio::test]
    async fn test_release_keeps_node_on_unexpected_error() {
        let mut store = MockCoordinationStore::new();
        let mut seq = Sequence::new();
        let assigned = Assigned::default();
        expect_root(&mut store, &mut seq, true);
        expect_contender_node(&mut store, &mut seq, &assigned, "0000000000");
        expect_children(&mut store, &mut seq, &assigned, &[], 1);
        expect_delete_own(&mut store, &mut seq, &assigned, Err(StoreError::SessionExpired));
        expect_delete_own(&mut store, &mut seq, &assigned, Ok(()));

        let lock = lock(store);
        assert!(lock.acquire(false, None).await.unwrap());
        let node = lock.node().await;
        assert!(lock.release().await.is_err());
        assert_eq!(lock.node().await, node);
        lock.release().await.unwrap();
        assert!(lock.node().await.is_none());
    }

    #[test]
    fn test_is_first_orders_by_suffix() {
        let children = names(&["bbb0000000002", "zzz0000000001", "aaa0000000003"]);
        assert!(is_first(&children, "zzz0000000001"));
        assert!(!is_first(&children, "aaa0000000003"));
        assert!(!is_first(&[], "zzz0000000001"));
    }
}

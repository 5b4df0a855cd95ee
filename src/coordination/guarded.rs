// Lock-guarded execution helpers and the lock health surface

use serde::Serialize;
use std::future::Future;
use tracing::{info, warn};

use super::lock::{DistributedLock, LockError};

/// Result of an action that only runs while a lock is held
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T> {
    Called(T),
    NotCalled,
}

impl<T> CallOutcome<T> {
    pub fn is_called(&self) -> bool {
        matches!(self, CallOutcome::Called(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            CallOutcome::Called(value) => Some(value),
            CallOutcome::NotCalled => None,
        }
    }
}

/// Run `action` if the lock is already held or a single non-blocking
/// acquire succeeds.
///
/// Returns the outcome together with whether the lock was freshly acquired
/// by this call.
pub async fn call_if_acquired<L, F, Fut, T>(
    lock: &L,
    action: F,
) -> Result<(CallOutcome<T>, bool), LockError>
where
    L: DistributedLock + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    if lock.is_acquired().await? {
        return Ok((CallOutcome::Called(action().await), false));
    }
    if lock.acquire(false, None).await? {
        return Ok((CallOutcome::Called(action().await), true));
    }
    Ok((CallOutcome::NotCalled, false))
}

/// `call_if_acquired`, logging `message` only when the lock was freshly acquired
pub async fn locked<L, F, Fut, T>(
    lock: &L,
    action: F,
    message: Option<&str>,
) -> Result<(CallOutcome<T>, bool), LockError>
where
    L: DistributedLock + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let (outcome, acquired) = call_if_acquired(lock, action).await?;
    if acquired {
        if let Some(message) = message {
            info!(lock_acquired = true, "{message}");
        }
    }
    Ok((outcome, acquired))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub has_lock: bool,
}

/// Always healthy; `has_lock` is informational
pub async fn health_check<L>(lock: &L) -> HealthReport
where
    L: DistributedLock + ?Sized,
{
    let has_lock = match lock.is_acquired().await {
        Ok(held) => held,
        Err(e) => {
            warn!(error = %e, "Could not determine lock ownership for health check");
            false
        }
    };
    HealthReport {
        healthy: true,
        has_lock,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::lock::MockDistributedLock;
    use crate::coordination::store::StoreError;
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fast_path_when_already_held() {
        let mut lock = MockDistributedLock::new();
        lock.expect_is_acquired().times(1).returning(|| Ok(true));
        lock.expect_acquire().never();

        let result = call_if_acquired(&lock, || async { "result" }).await.unwrap();
        assert_eq!(result, (CallOutcome::Called("result"), false));
    }

    #[tokio::test]
    async fn test_acquires_then_calls() {
        let mut lock = MockDistributedLock::new();
        lock.expect_is_acquired().times(1).returning(|| Ok(false));
        lock.expect_acquire()
            .with(eq(false), eq(None))
            .times(1)
            .returning(|_, _| Ok(true));

        let result = call_if_acquired(&lock, || async { 42 }).await.unwrap();
        assert_eq!(result, (CallOutcome::Called(42), true));
    }

    #[tokio::test]
    async fn test_not_called_when_not_acquired() {
        let mut lock = MockDistributedLock::new();
        lock.expect_is_acquired().returning(|| Ok(false));
        lock.expect_acquire().times(1).returning(|_, _| Ok(false));
        let calls = AtomicUsize::new(0);

        let result = call_if_acquired(&lock, || async {
            calls.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        assert_eq!(result, (CallOutcome::NotCalled, false));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falsy_result_is_distinct_from_not_called() {
        let mut lock = MockDistributedLock::new();
        lock.expect_is_acquired().returning(|| Ok(true));

        let (outcome, _) = call_if_acquired(&lock, || async { None::<u32> }).await.unwrap();
        assert_eq!(outcome, CallOutcome::Called(None));
        assert!(outcome.is_called());
    }

    #[tokio::test]
    async fn test_acquire_error_propagates() {
        let mut lock = MockDistributedLock::new();
        lock.expect_is_acquired().returning(|| Ok(false));
        lock.expect_acquire()
            .returning(|_, _| Err(LockError::Store(StoreError::SessionExpired)));

        let err = call_if_acquired(&lock, || async {}).await.unwrap_err();
        assert_eq!(err, LockError::Store(StoreError::SessionExpired));
    }

    #[tokio::test]
    async fn test_locked_reports_fresh_acquisition() {
        let mut lock = MockDistributedLock::new();
        lock.expect_is_acquired().returning(|| Ok(false));
        lock.expect_acquire().returning(|_, _| Ok(true));

        let (outcome, acquired) = locked(&lock, || async { "done" }, Some("Acquired convergence lock"))
            .await
            .unwrap();
        assert_eq!(outcome.into_option(), Some("done"));
        assert!(acquired);
    }

    #[tokio::test]
    async fn test_health_check() {
        let mut held = MockDistributedLock::new();
        held.expect_is_acquired().returning(|| Ok(true));
        assert_eq!(
            health_check(&held).await,
            HealthReport {
                healthy: true,
                has_lock: true
            }
        );

        let mut broken = MockDistributedLock::new();
        broken
            .expect_is_acquired()
            .returning(|| Err(LockError::Store(StoreError::SessionExpired)));
        assert_eq!(
            health_check(&broken).await,
            HealthReport {
                healthy: true,
                has_lock: false
            }
        );
    }
}

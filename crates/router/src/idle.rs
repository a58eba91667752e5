//! Periodic idling of targets without recent traffic

use crate::backend::Backend;
use crate::common::error::Result;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often the sweep runs
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Targets without requests for this many minutes are idled
pub const IDLE_THRESHOLD_MINUTES: i64 = 60;

/// Idles stale targets through the backend
pub struct IdleSweeper {
    storage: Arc<dyn Storage>,
    backend: Arc<dyn Backend>,
}

impl IdleSweeper {
    pub fn new(storage: Arc<dyn Storage>, backend: Arc<dyn Backend>) -> Self {
        Self { storage, backend }
    }

    /// Run one pass as if the current time were `now`.
    ///
    /// Returns the number of targets idled. An `idle_get` failure aborts the
    /// pass; an `idle_set` failure is logged and the pass continues.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - chrono::Duration::minutes(IDLE_THRESHOLD_MINUTES);
        let stale = self.storage.stale(cutoff).await?;
        debug!("Found {} stale targets", stale.len());

        let mut idled = 0;
        for target in stale {
            if self.backend.idle_get(&target).await? {
                continue;
            }

            match self.backend.idle_set(&target, true).await {
                Ok(()) => {
                    info!(target = %target, "Idled target");
                    idled += 1;
                }
                Err(e) => warn!(target = %target, "Failed to idle target: {}", e),
            }
        }

        Ok(idled)
    }

    /// Sweep every [`SWEEP_INTERVAL`] until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Idle sweeper stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_at(Utc::now()).await {
                        error!("Idle sweep failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::common::error::RouterError;
    use crate::storage::{MemoryStorage, MockStorage};

    fn storage_returning(targets: Vec<&'static str>) -> MockStorage {
        let mut storage = MockStorage::new();
        storage
            .expect_stale()
            .returning(move |_| Ok(targets.iter().map(|t| t.to_string()).collect()));
        storage
    }

    #[tokio::test]
    async fn test_stale_target_is_idled() {
        let mut backend = MockBackend::new();
        backend.expect_idle_get().times(1).returning(|_| Ok(false));
        backend
            .expect_idle_set()
            .withf(|target, idle| target == "http://10.0.0.5:8080" && *idle)
            .times(1)
            .returning(|_, _| Ok(()));

        let sweeper = IdleSweeper::new(
            Arc::new(storage_returning(vec!["http://10.0.0.5:8080"])),
            Arc::new(backend),
        );

        assert_eq!(sweeper.sweep_at(Utc::now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_already_idle_target_is_skipped() {
        let mut backend = MockBackend::new();
        backend.expect_idle_get().times(1).returning(|_| Ok(true));
        backend.expect_idle_set().never();

        let sweeper = IdleSweeper::new(
            Arc::new(storage_returning(vec!["http://10.0.0.5:8080"])),
            Arc::new(backend),
        );

        assert_eq!(sweeper.sweep_at(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_idle_set_failure_continues_pass() {
        let mut backend = MockBackend::new();
        backend.expect_idle_get().times(2).returning(|_| Ok(false));
        backend
            .expect_idle_set()
            .withf(|target, _| target == "a")
            .times(1)
            .returning(|_, _| Err(RouterError::Backend("scale failed".into())));
        backend
            .expect_idle_set()
            .withf(|target, _| target == "b")
            .times(1)
            .returning(|_, _| Ok(()));

        let sweeper = IdleSweeper::new(Arc::new(storage_returning(vec!["a", "b"])), Arc::new(backend));

        assert_eq!(sweeper.sweep_at(Utc::now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_idle_get_failure_aborts_pass() {
        let mut backend = MockBackend::new();
        backend
            .expect_idle_get()
            .times(1)
            .returning(|_| Err(RouterError::Backend("unreachable".into())));
        backend.expect_idle_set().never();

        let sweeper = IdleSweeper::new(Arc::new(storage_returning(vec!["a", "b"])), Arc::new(backend));

        assert!(sweeper.sweep_at(Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_threshold_against_memory_storage() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .target_add("app.example.com", "http://10.0.0.5:8080", true)
            .await
            .unwrap();

        let mut backend = MockBackend::new();
        backend.expect_idle_get().times(1).returning(|_| Ok(false));
        backend
            .expect_idle_set()
            .withf(|target, idle| target == "http://10.0.0.5:8080" && *idle)
            .times(1)
            .returning(|_, _| Ok(()));

        let sweeper = IdleSweeper::new(storage, Arc::new(backend));

        let after_59 = Utc::now() + chrono::Duration::minutes(59);
        assert_eq!(sweeper.sweep_at(after_59).await.unwrap(), 0);

        let after_61 = Utc::now() + chrono::Duration::minutes(61);
        assert_eq!(sweeper.sweep_at(after_61).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cutoff_is_sixty_minutes() {
        let now = Utc::now();

        let mut storage = MockStorage::new();
        storage
            .expect_stale()
            .withf(move |before| *before == now - chrono::Duration::minutes(60))
            .times(1)
            .returning(|_| Ok(vec![]));

        let sweeper = IdleSweeper::new(Arc::new(storage), Arc::new(MockBackend::new()));
        assert_eq!(sweeper.sweep_at(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let mut storage = MockStorage::new();
        storage.expect_stale().returning(|_| Ok(vec![]));

        let sweeper = IdleSweeper::new(Arc::new(storage), Arc::new(MockBackend::new()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sweeper.run(cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }
}

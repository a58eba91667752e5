//! In-memory routing storage

use super::Storage;
use crate::common::error::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Activity record for a single target
#[derive(Debug, Clone)]
struct Activity {
    /// Whether the target may be idled
    idles: bool,
    /// Last time a request started or finished
    last_request: DateTime<Utc>,
    /// Requests currently in flight
    in_flight: u64,
}

#[derive(Debug, Default)]
struct Tables {
    /// Key: hostname (possibly wildcard)
    /// Value: target addresses
    hosts: HashMap<String, BTreeSet<String>>,
    /// Key: target address
    activity: HashMap<String, Activity>,
}

/// Routing storage held in process memory, lost on restart
#[derive(Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStorage {
    /// Create an empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn request_begin(&self, target: &str) -> Result<()> {
        let mut tables = self.tables.write().await;

        if let Some(activity) = tables.activity.get_mut(target) {
            activity.in_flight += 1;
            activity.last_request = Utc::now();
        } else {
            debug!("Request began for untracked target {}", target);
        }

        Ok(())
    }

    async fn request_end(&self, target: &str) -> Result<()> {
        let mut tables = self.tables.write().await;

        if let Some(activity) = tables.activity.get_mut(target) {
            activity.in_flight = activity.in_flight.saturating_sub(1);
            activity.last_request = Utc::now();
        }

        Ok(())
    }

    async fn target_add(&self, host: &str, target: &str, idles: bool) -> Result<()> {
        let mut tables = self.tables.write().await;

        tables
            .hosts
            .entry(host.to_string())
            .or_default()
            .insert(target.to_string());

        tables
            .activity
            .entry(target.to_string())
            .and_modify(|a| a.idles = idles)
            .or_insert_with(|| Activity {
                idles,
                last_request: Utc::now(),
                in_flight: 0,
            });

        Ok(())
    }

    async fn target_list(&self, host: &str) -> Result<Vec<String>> {
        let tables = self.tables.read().await;

        Ok(tables
            .hosts
            .get(host)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn target_remove(&self, host: &str, target: &str) -> Result<()> {
        let mut tables = self.tables.write().await;

        if let Some(targets) = tables.hosts.get_mut(host) {
            targets.remove(target);
        }

        let still_routed = tables.hosts.values().any(|targets| targets.contains(target));
        if !still_routed {
            tables.activity.remove(target);
        }

        Ok(())
    }

    async fn stale(&self, before: DateTime<Utc>) -> Result<Vec<String>> {
        let tables = self.tables.read().await;

        let mut stale: Vec<String> = tables
            .activity
            .iter()
            .filter(|(_, a)| a.idles && a.in_flight == 0 && a.last_request < before)
            .map(|(target, _)| target.clone())
            .collect();
        stale.sort();

        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_target_add_is_idempotent() {
        let storage = MemoryStorage::new();

        storage
            .target_add("app.example.com", "http://10.0.0.5:8080", true)
            .await
            .unwrap();
        storage
            .target_add("app.example.com", "http://10.0.0.5:8080", true)
            .await
            .unwrap();

        let targets = storage.target_list("app.example.com").await.unwrap();
        assert_eq!(targets, vec!["http://10.0.0.5:8080".to_string()]);
    }

    #[tokio::test]
    async fn test_target_list_is_exact_match() {
        let storage = MemoryStorage::new();
        storage
            .target_add("*.example.com", "http://10.0.0.6:80", false)
            .await
            .unwrap();

        assert!(storage.target_list("app.example.com").await.unwrap().is_empty());
        assert_eq!(storage.target_list("*.example.com").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_last_target_leaves_empty_entry() {
        let storage = MemoryStorage::new();
        storage
            .target_add("app.example.com", "http://10.0.0.5:8080", true)
            .await
            .unwrap();
        storage
            .target_remove("app.example.com", "http://10.0.0.5:8080")
            .await
            .unwrap();

        assert!(storage.target_list("app.example.com").await.unwrap().is_empty());

        // removing again is not an error
        storage
            .target_remove("app.example.com", "http://10.0.0.5:8080")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_respects_idles_flag_and_cutoff() {
        let storage = MemoryStorage::new();
        storage
            .target_add("a.example.com", "http://10.0.0.1:80", true)
            .await
            .unwrap();
        storage
            .target_add("b.example.com", "http://10.0.0.2:80", false)
            .await
            .unwrap();

        let future = Utc::now() + Duration::minutes(5);
        let past = Utc::now() - Duration::minutes(5);

        assert_eq!(
            storage.stale(future).await.unwrap(),
            vec!["http://10.0.0.1:80".to_string()]
        );
        assert!(storage.stale(past).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_target_is_never_stale() {
        let storage = MemoryStorage::new();
        storage
            .target_add("a.example.com", "http://10.0.0.1:80", true)
            .await
            .unwrap();
        storage.request_begin("http://10.0.0.1:80").await.unwrap();

        let future = Utc::now() + Duration::hours(2);
        assert!(storage.stale(future).await.unwrap().is_empty());

        storage.request_end("http://10.0.0.1:80").await.unwrap();
        assert_eq!(storage.stale(future).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unrouted_target_is_not_stale() {
        let storage = MemoryStorage::new();
        storage
            .target_add("a.example.com", "http://10.0.0.1:80", true)
            .await
            .unwrap();
        storage
            .target_remove("a.example.com", "http://10.0.0.1:80")
            .await
            .unwrap();

        let future = Utc::now() + Duration::hours(2);
        assert!(storage.stale(future).await.unwrap().is_empty());
    }
}

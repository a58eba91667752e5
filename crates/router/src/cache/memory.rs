//! In-memory certificate cache

use super::Cache;
use crate::common::error::Result;
use dashmap::DashMap;
use std::sync::Arc;

/// Certificate cache held in process memory
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let cache = MemoryCache::new();

        assert!(cache.get("app.example.com").await.unwrap().is_none());

        cache
            .put("app.example.com", b"bundle".to_vec())
            .await
            .unwrap();
        assert_eq!(
            cache.get("app.example.com").await.unwrap().as_deref(),
            Some(&b"bundle"[..])
        );

        cache.delete("app.example.com").await.unwrap();
        cache.delete("app.example.com").await.unwrap();
        assert!(cache.get("app.example.com").await.unwrap().is_none());
    }
}

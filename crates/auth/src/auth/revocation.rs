use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RevocationStoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Set of revoked token ids, shared by every request handler.
///
/// Entries are kept at least until `retain_until`, which callers set to the
/// revoked session's absolute expiry. Past that point the session is rejected
/// by its lifetime cap anyway, so the entry may be dropped.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Marks `jti` as revoked. Idempotent; a later `retain_until` extends the entry.
    async fn add(&self, jti: &str, retain_until: DateTime<Utc>)
    -> Result<(), RevocationStoreError>;

    async fn contains(&self, jti: &str) -> Result<bool, RevocationStoreError>;

    /// Drops every entry. Administrative/test reset only.
    async fn clear(&self) -> Result<(), RevocationStoreError>;

    /// Removes entries whose retention has lapsed and returns how many went away.
    async fn purge_expired(&self) -> Result<u64, RevocationStoreError>;
}

pub type RevocationRegistry = Arc<dyn RevocationStore>;

/// Process-local store, used in tests and when no database is configured.
#[derive(Clone, Default)]
pub struct InMemoryRevocationStore {
    entries: Arc<DashMap<String, DateTime<Utc>>>,
}

impl InMemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RevocationStore for InMemoryRevocationStore {
    async fn add(
        &self,
        jti: &str,
        retain_until: DateTime<Utc>,
    ) -> Result<(), RevocationStoreError> {
        self.entries
            .entry(jti.to_string())
            .and_modify(|existing| {
                if retain_until > *existing {
                    *existing = retain_until;
                }
            })
            .or_insert(retain_until);
        Ok(())
    }

    async fn contains(&self, jti: &str) -> Result<bool, RevocationStoreError> {
        let now = Utc::now();
        Ok(self
            .entries
            .get(jti)
            .is_some_and(|retain_until| *retain_until > now))
    }

    async fn clear(&self) -> Result<(), RevocationStoreError> {
        self.entries.clear();
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, RevocationStoreError> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, retain_until| *retain_until > now);
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn add_contains_and_clear() {
        let store = InMemoryRevocationStore::new();
        let until = Utc::now() + Duration::days(30);

        assert!(!store.contains("abc").await.unwrap());
        store.add("abc", until).await.unwrap();
        assert!(store.contains("abc").await.unwrap());

        store.clear().await.unwrap();
        assert!(!store.contains("abc").await.unwrap());
    }

    #[tokio::test]
    async fn add_is_idempotent_and_keeps_longest_retention() {
        let store = InMemoryRevocationStore::new();
        let now = Utc::now();

        store.add("abc", now + Duration::days(5)).await.unwrap();
        store.add("abc", now + Duration::days(1)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(*store.entries.get("abc").unwrap(), now + Duration::days(5));
    }

    #[tokio::test]
    async fn purge_expired_only_removes_lapsed_entries() {
        let store = InMemoryRevocationStore::new();
        let now = Utc::now();

        store.add("old", now - Duration::minutes(1)).await.unwrap();
        store.add("live", now + Duration::days(1)).await.unwrap();

        assert!(!store.contains("old").await.unwrap());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.contains("live").await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_and_readers() {
        let store: RevocationRegistry = Arc::new(InMemoryRevocationStore::new());
        let until = Utc::now() + Duration::days(1);

        let mut handles = Vec::new();
        for i in 0..64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let jti = format!("jti-{i}");
                store.add(&jti, until).await.unwrap();
                assert!(store.contains(&jti).await.unwrap());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for i in 0..64 {
            assert!(store.contains(&format!("jti-{i}")).await.unwrap());
        }
    }
}

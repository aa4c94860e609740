//! Content-addressed embedding cache

use crate::models::TenantId;
use crate::store::ArtifactStore;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Vector computed for one content hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedEmbedding {
    pub vector: Vec<f32>,
    pub text_embedded: bool,
}

#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    async fn get(&self, tenant: TenantId, source_hash: &str) -> Result<Option<CachedEmbedding>>;
    async fn put(&self, tenant: TenantId, source_hash: &str, entry: CachedEmbedding) -> Result<()>;
    async fn evict(&self, tenant: TenantId, source_hash: &str) -> Result<()>;
}

/// Tenant-scoped in-memory cache; concurrent readers, last writer wins.
#[derive(Default)]
pub struct InMemoryEmbeddingCache {
    entries: Arc<RwLock<HashMap<(TenantId, String), CachedEmbedding>>>,
}

impl InMemoryEmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl EmbeddingCache for InMemoryEmbeddingCache {
    async fn get(&self, tenant: TenantId, source_hash: &str) -> Result<Option<CachedEmbedding>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(tenant, source_hash.to_string())).cloned())
    }

    async fn put(&self, tenant: TenantId, source_hash: &str, entry: CachedEmbedding) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert((tenant, source_hash.to_string()), entry);
        Ok(())
    }

    async fn evict(&self, tenant: TenantId, source_hash: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(&(tenant, source_hash.to_string()));
        Ok(())
    }
}

/// In-memory cache that falls back to the persisted embedding records, so
/// content embedded before a restart is not sent to the provider again.
pub struct PersistentEmbeddingCache {
    memory: InMemoryEmbeddingCache,
    store: Arc<dyn ArtifactStore>,
}

impl PersistentEmbeddingCache {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            memory: InMemoryEmbeddingCache::new(),
            store,
        }
    }
}

#[async_trait]
impl EmbeddingCache for PersistentEmbeddingCache {
    async fn get(&self, tenant: TenantId, source_hash: &str) -> Result<Option<CachedEmbedding>> {
        if let Some(hit) = self.memory.get(tenant, source_hash).await? {
            return Ok(Some(hit));
        }

        let Some(record) = self.store.embedding_by_hash(tenant, source_hash).await? else {
            return Ok(None);
        };
        debug!(%source_hash, record_id = %record.record_id, "Embedding restored from store");
        let entry = CachedEmbedding {
            vector: record.vector,
            text_embedded: record.text_embedded,
        };
        self.memory.put(tenant, source_hash, entry.clone()).await?;
        Ok(Some(entry))
    }

    async fn put(&self, tenant: TenantId, source_hash: &str, entry: CachedEmbedding) -> Result<()> {
        self.memory.put(tenant, source_hash, entry).await
    }

    async fn evict(&self, tenant: TenantId, source_hash: &str) -> Result<()> {
        self.memory.evict(tenant, source_hash).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmbeddingRecord, EntityType, Geography, StructuredAttributes};
    use crate::store::InMemoryArtifactStore;
    use chrono::Utc;
    use uuid::Uuid;

    fn stored(source_hash: &str, degraded: bool) -> EmbeddingRecord {
        EmbeddingRecord {
            record_id: Uuid::new_v4(),
            entity_id: Uuid::new_v4(),
            entity_type: EntityType::Deal,
            vector: vec![0.6, 0.8],
            source_hash: source_hash.to_string(),
            model_id: "test".to_string(),
            attributes: StructuredAttributes {
                industry_code: None,
                size_bucket: None,
                revenue: None,
                geography: Geography::default(),
                intents: vec![],
                tags: vec![],
            },
            text_embedded: !degraded,
            degraded,
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn persisted_records_survive_a_cold_cache() {
        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let tenant = Uuid::new_v4();
        store.append_embedding(tenant, stored("h-full", false)).await.unwrap();
        store.append_embedding(tenant, stored("h-degraded", true)).await.unwrap();

        let cache = PersistentEmbeddingCache::new(Arc::clone(&store));
        let hit = cache.get(tenant, "h-full").await.unwrap().unwrap();
        assert_eq!(hit.vector, vec![0.6, 0.8]);
        assert!(hit.text_embedded);

        assert!(cache.get(tenant, "h-degraded").await.unwrap().is_none());
        assert!(cache.get(Uuid::new_v4(), "h-full").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entries_are_tenant_scoped() {
        let cache = InMemoryEmbeddingCache::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let entry = CachedEmbedding {
            vector: vec![1.0, 0.0],
            text_embedded: true,
        };

        cache.put(a, "h1", entry.clone()).await.unwrap();
        assert_eq!(cache.get(a, "h1").await.unwrap(), Some(entry));
        assert_eq!(cache.get(b, "h1").await.unwrap(), None);

        cache.evict(a, "h1").await.unwrap();
        assert_eq!(cache.len().await, 0);
    }
}

//! Artifact persistence layer
//!
//! Derived artifacts are append-only: a new valuation report or match version
//! flags the previous one as superseded instead of overwriting it. Every write
//! that must be atomic happens in a single call.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryArtifactStore;
pub use postgres::PgArtifactStore;

use crate::config::{MatchWeights, Settings};
use crate::models::{
    EmbeddingRecord, MatchCandidate, PoolSelector, TenantId, ValuationReport, Versioned,
};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    fn backend(&self) -> &'static str;

    // Valuation reports

    async fn current_report(&self, tenant: TenantId, entity_id: Uuid) -> Result<Option<ValuationReport>>;

    /// Persist valuation and risk together, superseding the entity's current report.
    /// The snapshot is kept as an entity-owned row, separate from the report.
    async fn save_report(&self, tenant: TenantId, report: ValuationReport) -> Result<()>;

    /// Every version, oldest first.
    async fn report_history(
        &self,
        tenant: TenantId,
        entity_id: Uuid,
    ) -> Result<Vec<Versioned<ValuationReport>>>;

    /// Remove the entity's snapshots. Reports remain, with the snapshot detached.
    async fn delete_snapshots(&self, tenant: TenantId, entity_id: Uuid) -> Result<usize>;

    // Vector store

    async fn append_embedding(&self, tenant: TenantId, record: EmbeddingRecord) -> Result<()>;

    async fn latest_embedding(&self, tenant: TenantId, entity_id: Uuid) -> Result<Option<EmbeddingRecord>>;

    /// Latest record per entity admitted by the selector.
    async fn embedding_pool(
        &self,
        tenant: TenantId,
        selector: &PoolSelector,
    ) -> Result<Vec<EmbeddingRecord>>;

    /// Newest non-degraded record with this content hash.
    async fn embedding_by_hash(&self, tenant: TenantId, source_hash: &str) -> Result<Option<EmbeddingRecord>>;

    /// Remove every record owned by the entity, returning their source hashes.
    async fn delete_embeddings(&self, tenant: TenantId, entity_id: Uuid) -> Result<Vec<String>>;

    // Match candidates

    /// Current pairs with `entity_id` on either side.
    async fn current_matches(&self, tenant: TenantId, entity_id: Uuid) -> Result<Vec<MatchCandidate>>;

    /// Supersede the pairs `entity_id` initiated, plus any pair named in
    /// `candidates`, and store `candidates` as current.
    async fn replace_matches(
        &self,
        tenant: TenantId,
        entity_id: Uuid,
        candidates: Vec<MatchCandidate>,
    ) -> Result<()>;

    async fn current_match(&self, tenant: TenantId, match_id: Uuid) -> Result<Option<MatchCandidate>>;

    /// Store a new version of one match, superseding its current version.
    async fn save_match(&self, tenant: TenantId, candidate: MatchCandidate) -> Result<()>;

    // Tenant configuration

    async fn match_weights(&self, tenant: TenantId) -> Result<Option<MatchWeights>>;

    async fn set_match_weights(&self, tenant: TenantId, weights: MatchWeights) -> Result<()>;
}

/// Postgres when a database URL is configured, otherwise in-memory.
pub fn build_store(settings: &Settings) -> Arc<dyn ArtifactStore> {
    if let Some(url) = settings.database_url.as_deref() {
        match PgArtifactStore::connect_lazy(url) {
            Ok(store) => {
                info!("Artifact store backend: postgres");
                return Arc::new(store);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres artifact store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Artifact store backend: in-memory");
    Arc::new(InMemoryArtifactStore::new())
}

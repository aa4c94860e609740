//! In-memory artifact store for development and tests

use super::ArtifactStore;
use crate::config::MatchWeights;
use crate::models::{
    EmbeddingRecord, FinancialSnapshot, MatchCandidate, PoolSelector, TenantId, ValuationReport,
    Versioned,
};
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryArtifactStore {
    snapshots: Arc<RwLock<HashMap<(TenantId, Uuid), FinancialSnapshot>>>, // keyed by snapshot_id
    reports: Arc<RwLock<HashMap<(TenantId, Uuid), Vec<Versioned<ValuationReport>>>>>,
    embeddings: Arc<RwLock<HashMap<(TenantId, Uuid), Vec<EmbeddingRecord>>>>,
    matches: Arc<RwLock<HashMap<(TenantId, Uuid), Vec<Versioned<MatchCandidate>>>>>, // keyed by match_id
    weights: Arc<RwLock<HashMap<TenantId, MatchWeights>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn supersede_all<T>(versions: &mut [Versioned<T>]) {
    for v in versions.iter_mut() {
        v.superseded = true;
    }
}

/// Re-attach the snapshot if its entity still owns it.
fn attach(
    snapshots: &HashMap<(TenantId, Uuid), FinancialSnapshot>,
    tenant: TenantId,
    mut report: ValuationReport,
) -> ValuationReport {
    report.snapshot = snapshots.get(&(tenant, report.valuation.snapshot_id)).cloned();
    report
}

fn current<T: Clone>(versions: &[Versioned<T>]) -> Option<T> {
    versions
        .iter()
        .rev()
        .find(|v| !v.superseded)
        .map(|v| v.artifact.clone())
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    fn backend(&self) -> &'static str {
        "in-memory"
    }

    async fn current_report(&self, tenant: TenantId, entity_id: Uuid) -> Result<Option<ValuationReport>> {
        let snapshots = self.snapshots.read().await;
        let reports = self.reports.read().await;
        Ok(reports
            .get(&(tenant, entity_id))
            .and_then(|v| current(v))
            .map(|report| attach(&snapshots, tenant, report)))
    }

    async fn save_report(&self, tenant: TenantId, mut report: ValuationReport) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        let mut reports = self.reports.write().await;
        if let Some(snapshot) = report.snapshot.take() {
            snapshots.insert((tenant, snapshot.snapshot_id), snapshot);
        }
        let versions = reports
            .entry((tenant, report.valuation.entity_id))
            .or_insert_with(Vec::new);
        supersede_all(versions);
        versions.push(Versioned::current(report));
        Ok(())
    }

    async fn report_history(
        &self,
        tenant: TenantId,
        entity_id: Uuid,
    ) -> Result<Vec<Versioned<ValuationReport>>> {
        let snapshots = self.snapshots.read().await;
        let reports = self.reports.read().await;
        Ok(reports
            .get(&(tenant, entity_id))
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|mut version| {
                version.artifact = attach(&snapshots, tenant, version.artifact);
                version
            })
            .collect())
    }

    async fn delete_snapshots(&self, tenant: TenantId, entity_id: Uuid) -> Result<usize> {
        let mut snapshots = self.snapshots.write().await;
        let before = snapshots.len();
        snapshots.retain(|(t, _), snapshot| *t != tenant || snapshot.entity_id != entity_id);
        Ok(before - snapshots.len())
    }

    async fn append_embedding(&self, tenant: TenantId, record: EmbeddingRecord) -> Result<()> {
        let mut embeddings = self.embeddings.write().await;
        embeddings
            .entry((tenant, record.entity_id))
            .or_insert_with(Vec::new)
            .push(record);
        Ok(())
    }

    async fn latest_embedding(&self, tenant: TenantId, entity_id: Uuid) -> Result<Option<EmbeddingRecord>> {
        let embeddings = self.embeddings.read().await;
        Ok(embeddings
            .get(&(tenant, entity_id))
            .and_then(|records| records.iter().max_by_key(|r| (r.generated_at, r.record_id)))
            .cloned())
    }

    async fn embedding_pool(
        &self,
        tenant: TenantId,
        selector: &PoolSelector,
    ) -> Result<Vec<EmbeddingRecord>> {
        let embeddings = self.embeddings.read().await;
        Ok(embeddings
            .iter()
            .filter(|((t, _), _)| *t == tenant)
            .filter_map(|(_, records)| records.iter().max_by_key(|r| (r.generated_at, r.record_id)))
            .filter(|r| selector.admits(r))
            .cloned()
            .collect())
    }

    async fn embedding_by_hash(&self, tenant: TenantId, source_hash: &str) -> Result<Option<EmbeddingRecord>> {
        let embeddings = self.embeddings.read().await;
        Ok(embeddings
            .iter()
            .filter(|((t, _), _)| *t == tenant)
            .flat_map(|(_, records)| records.iter())
            .filter(|r| r.source_hash == source_hash && !r.degraded)
            .max_by_key(|r| (r.generated_at, r.record_id))
            .cloned())
    }

    async fn delete_embeddings(&self, tenant: TenantId, entity_id: Uuid) -> Result<Vec<String>> {
        let mut embeddings = self.embeddings.write().await;
        Ok(embeddings
            .remove(&(tenant, entity_id))
            .unwrap_or_default()
            .into_iter()
            .map(|r| r.source_hash)
            .collect())
    }

    async fn current_matches(&self, tenant: TenantId, entity_id: Uuid) -> Result<Vec<MatchCandidate>> {
        let matches = self.matches.read().await;
        Ok(matches
            .iter()
            .filter(|((t, _), _)| *t == tenant)
            .filter_map(|(_, versions)| current(versions))
            .filter(|m| m.involves(entity_id))
            .collect())
    }

    async fn replace_matches(
        &self,
        tenant: TenantId,
        entity_id: Uuid,
        candidates: Vec<MatchCandidate>,
    ) -> Result<()> {
        let mut matches = self.matches.write().await;
        let named: HashSet<Uuid> = candidates.iter().map(|c| c.match_id).collect();
        for ((t, match_id), versions) in matches.iter_mut() {
            if *t != tenant {
                continue;
            }
            if named.contains(match_id) || versions.iter().any(|v| v.artifact.entity_id == entity_id) {
                supersede_all(versions);
            }
        }
        for candidate in candidates {
            matches
                .entry((tenant, candidate.match_id))
                .or_insert_with(Vec::new)
                .push(Versioned::current(candidate));
        }
        Ok(())
    }

    async fn current_match(&self, tenant: TenantId, match_id: Uuid) -> Result<Option<MatchCandidate>> {
        let matches = self.matches.read().await;
        Ok(matches.get(&(tenant, match_id)).and_then(|v| current(v)))
    }

    async fn save_match(&self, tenant: TenantId, candidate: MatchCandidate) -> Result<()> {
        let mut matches = self.matches.write().await;
        let versions = matches
            .entry((tenant, candidate.match_id))
            .or_insert_with(Vec::new);
        supersede_all(versions);
        versions.push(Versioned::current(candidate));
        Ok(())
    }

    async fn match_weights(&self, tenant: TenantId) -> Result<Option<MatchWeights>> {
        Ok(self.weights.read().await.get(&tenant).copied())
    }

    async fn set_match_weights(&self, tenant: TenantId, weights: MatchWeights) -> Result<()> {
        self.weights.write().await.insert(tenant, weights);
        Ok(())
    }
}

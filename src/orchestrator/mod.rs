//! Orchestration and cache layer
//!
//! Coordinates normalization, valuation, risk, embedding and matching for one
//! request, and is the only component that talks to the artifact store. Every
//! operation computes first and persists in a single final store call, so a
//! request dropped mid-flight leaves nothing behind.

pub mod sources;

pub use sources::{
    EntityDirectory, InMemoryEntityDirectory, PeerDataSource, PeerSet, StaticPeerData,
};

use crate::config::{EngineConfig, MatchWeights};
use crate::embedding::{
    DegradePolicy, EmbeddingCache, EmbeddingGenerator, EmbeddingProvider, InMemoryEmbeddingCache,
};
use crate::error::EngineError;
use crate::fingerprint::valuation_fingerprint;
use crate::matching::MatchingEngine;
use crate::models::{
    Comparable, DisclosureStage, EmbeddingRecord, EntityProfile, FinancialSnapshot,
    MatchCandidate, PoolSelector, PrecedentTransaction, TenantId, ValuationMethod,
    ValuationReport, Versioned,
};
use crate::matching::DisclosureEvent;
use crate::normalizer::{CurrencyConverter, Normalizer, RawFinancialRecord, StaticRateTable};
use crate::risk::RiskAssessor;
use crate::store::{ArtifactStore, InMemoryArtifactStore};
use crate::valuation::ValuationEngine;
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

//
// ================= Requests / Responses =================
//

/// Financial input: a raw record to normalize, or an already normalized snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinancialInput {
    Raw(RawFinancialRecord),
    Snapshot(FinancialSnapshot),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuationRequest {
    pub input: FinancialInput,
    #[serde(default)]
    pub comparables: PeerSet<Comparable>,
    #[serde(default)]
    pub precedents: PeerSet<PrecedentTransaction>,
    pub wacc_override: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuationOutcome {
    #[serde(flatten)]
    pub report: ValuationReport,
    /// True when served from a stored report with the same input fingerprint.
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionSummary {
    pub entity_id: Uuid,
    pub snapshots_removed: usize,
    pub embeddings_removed: usize,
}

/// Collaborators injected into the orchestrator.
pub struct Collaborators {
    pub currency: Arc<dyn CurrencyConverter>,
    pub peers: Arc<dyn PeerDataSource>,
    pub directory: Arc<dyn EntityDirectory>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub cache: Arc<dyn EmbeddingCache>,
    pub store: Arc<dyn ArtifactStore>,
}

impl Collaborators {
    /// In-memory collaborators around a given embedding provider.
    pub fn in_memory(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            currency: Arc::new(StaticRateTable::default()),
            peers: Arc::new(StaticPeerData::new()),
            directory: Arc::new(InMemoryEntityDirectory::new()),
            provider,
            cache: Arc::new(InMemoryEmbeddingCache::new()),
            store: Arc::new(InMemoryArtifactStore::new()),
        }
    }
}

//
// ================= Inflight Registry =================
//

type InflightKey = (TenantId, String);
type InflightMap = std::sync::Mutex<HashMap<InflightKey, Arc<Mutex<()>>>>;

/// Shared lock for one (tenant, fingerprint). The registry entry is removed
/// when the last slot for the key is dropped, including on cancellation.
struct InflightSlot<'a> {
    registry: &'a InflightMap,
    key: InflightKey,
    lock: Arc<Mutex<()>>,
}

impl<'a> InflightSlot<'a> {
    fn claim(registry: &'a InflightMap, key: InflightKey) -> Self {
        let mut map = registry.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = Arc::clone(map.entry(key.clone()).or_default());
        Self { registry, key, lock }
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        let mut map = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the registry and this slot still hold the lock.
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.key);
        }
    }
}

//
// ================= Orchestrator =================
//

pub struct Orchestrator {
    config: EngineConfig,
    normalizer: Normalizer,
    valuation: ValuationEngine,
    risk: RiskAssessor,
    embeddings: EmbeddingGenerator,
    matching: MatchingEngine,
    peers: Arc<dyn PeerDataSource>,
    directory: Arc<dyn EntityDirectory>,
    store: Arc<dyn ArtifactStore>,
    /// One lock per (tenant, fingerprint) currently being computed.
    inflight: InflightMap,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        Self {
            normalizer: Normalizer::new(config.normalizer.clone(), collaborators.currency),
            valuation: ValuationEngine::new(config.valuation.clone()),
            risk: RiskAssessor::standard(),
            embeddings: EmbeddingGenerator::new(
                collaborators.provider,
                collaborators.cache,
                config.embedding.clone(),
                config.retry.clone(),
            ),
            matching: MatchingEngine::new(config.matching.clone()),
            peers: collaborators.peers,
            directory: collaborators.directory,
            store: collaborators.store,
            inflight: InflightMap::default(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    // =============================
    // Valuation
    // =============================

    pub async fn run_valuation(
        &self,
        tenant: TenantId,
        request: ValuationRequest,
    ) -> Result<ValuationOutcome> {
        let start_time = Instant::now();

        let snapshot = match request.input {
            FinancialInput::Raw(raw) => self.normalizer.normalize(&raw).await?,
            FinancialInput::Snapshot(snapshot) => self.normalizer.accept_snapshot(snapshot)?,
        };
        if let Some(wacc) = request.wacc_override {
            if !wacc.is_finite() || wacc <= 0.0 || wacc >= 1.0 {
                return Err(EngineError::InvalidInput(format!(
                    "wacc_override {} must be in (0, 1)",
                    wacc
                )));
            }
        }

        let (comparables, precedents) = tokio::try_join!(
            self.resolve_comparables(&request.comparables),
            self.resolve_precedents(&request.precedents),
        )?;

        let fingerprint = valuation_fingerprint(
            &snapshot,
            &self.config.valuation.methodology_version,
            request.wacc_override,
            &comparables,
            &precedents,
        );

        let slot = InflightSlot::claim(&self.inflight, (tenant, fingerprint.clone()));
        let outcome = {
            let _running = slot.lock.lock().await;
            self.compute_valuation(tenant, snapshot, &comparables, &precedents, request.wacc_override, fingerprint)
                .await
        };
        drop(slot);

        if let Ok(outcome) = &outcome {
            info!(
                tenant_id = %tenant,
                entity_id = %outcome.report.valuation.entity_id,
                cached = outcome.cached,
                elapsed_ms = start_time.elapsed().as_millis() as u64,
                "Valuation request complete"
            );
        }
        outcome
    }

    async fn compute_valuation(
        &self,
        tenant: TenantId,
        snapshot: FinancialSnapshot,
        comparables: &[Comparable],
        precedents: &[PrecedentTransaction],
        wacc_override: Option<f64>,
        fingerprint: String,
    ) -> Result<ValuationOutcome> {
        let current = self.store.current_report(tenant, snapshot.entity_id).await?;
        if let Some(report) = &current {
            // A report whose snapshot was deleted with its entity is not reused.
            if report.valuation.input_fingerprint == fingerprint && report.snapshot.is_some() {
                debug!(entity_id = %snapshot.entity_id, %fingerprint, "Valuation cache hit");
                return Ok(ValuationOutcome {
                    report: report.clone(),
                    cached: true,
                });
            }
        }

        // Trend rules compare against the last snapshot of an earlier period.
        let previous = current
            .and_then(|r| r.snapshot)
            .filter(|prev| prev.period.end < snapshot.period.end);

        let engine = &self.valuation;
        let (dcf, comps, precs, risk) = tokio::join!(
            async { engine.run_dcf(&snapshot, wacc_override) },
            async { engine.run_comparables(&snapshot, comparables) },
            async { engine.run_precedents(&snapshot, precedents) },
            async { self.risk.assess_with_history(&snapshot, previous.as_ref()) },
        );

        let valuation = engine.aggregate(
            &snapshot,
            vec![
                (ValuationMethod::Dcf, dcf),
                (ValuationMethod::Comparables, comps),
                (ValuationMethod::PrecedentTransactions, precs),
            ],
            fingerprint,
        )?;

        let report = ValuationReport {
            snapshot: Some(snapshot),
            valuation,
            risk,
        };
        self.store.save_report(tenant, report.clone()).await?;

        Ok(ValuationOutcome {
            report,
            cached: false,
        })
    }

    async fn resolve_comparables(&self, set: &PeerSet<Comparable>) -> Result<Vec<Comparable>> {
        match set {
            PeerSet::Inline(v) => Ok(v.clone()),
            PeerSet::Named(name) => self.peers.comparables(name).await,
        }
    }

    async fn resolve_precedents(
        &self,
        set: &PeerSet<PrecedentTransaction>,
    ) -> Result<Vec<PrecedentTransaction>> {
        match set {
            PeerSet::Inline(v) => Ok(v.clone()),
            PeerSet::Named(name) => self.peers.precedents(name).await,
        }
    }

    pub async fn valuation_history(
        &self,
        tenant: TenantId,
        entity_id: Uuid,
    ) -> Result<Vec<Versioned<ValuationReport>>> {
        self.store.report_history(tenant, entity_id).await
    }

    // =============================
    // Embeddings
    // =============================

    pub async fn generate_embedding(
        &self,
        tenant: TenantId,
        entity_id: Uuid,
        profile: Option<EntityProfile>,
        policy: DegradePolicy,
    ) -> Result<EmbeddingRecord> {
        let profile = match profile {
            Some(p) if p.entity_id != entity_id => {
                return Err(EngineError::InvalidInput(format!(
                    "profile entity {} does not match {}",
                    p.entity_id, entity_id
                )))
            }
            Some(p) => p,
            None => self
                .directory
                .profile(tenant, entity_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("entity {}", entity_id)))?,
        };

        let record = self.embeddings.embed(tenant, &profile, policy).await?;
        self.store.append_embedding(tenant, record.clone()).await?;
        Ok(record)
    }

    // =============================
    // Matching
    // =============================

    pub async fn run_match(
        &self,
        tenant: TenantId,
        entity_id: Uuid,
        selector: PoolSelector,
        top_k: Option<usize>,
    ) -> Result<Vec<MatchCandidate>> {
        let top_k = top_k.unwrap_or(self.config.matching.top_k);
        if top_k == 0 {
            return Err(EngineError::InvalidInput("top_k must be positive".to_string()));
        }

        let query = self
            .store
            .latest_embedding(tenant, entity_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("embedding for entity {}", entity_id)))?;
        let pool = self.store.embedding_pool(tenant, &selector).await?;
        let weights = self.match_weights(tenant).await?;

        // Pairs involving the entity from either side, including ones the candidate initiated.
        let mut previous: HashMap<Uuid, MatchCandidate> = self
            .store
            .current_matches(tenant, entity_id)
            .await?
            .into_iter()
            .map(|m| (m.match_id, m))
            .collect();

        let threshold = self.config.matching.teaser_threshold;
        let ranked: Vec<MatchCandidate> = self
            .matching
            .find_matches(&query, &pool, top_k, &weights)
            .map(|mut candidate| {
                if let Some(prev) = previous.remove(&candidate.match_id) {
                    // Orientation is fixed by whoever surfaced the pair first.
                    candidate.entity_id = prev.entity_id;
                    candidate.candidate_id = prev.candidate_id;
                    candidate.disclosure = prev.disclosure;
                    candidate.disclosure.refresh(candidate.compatibility, threshold);
                    candidate.created_at = prev.created_at;
                }
                candidate
            })
            .collect();

        // Pairs already in negotiation stay current even when they fall out of the ranking.
        // Pairs the other side initiated are left untouched.
        let retained = previous
            .into_values()
            .filter(|m| m.entity_id == entity_id && is_engaged(m));
        let mut persisted = ranked.clone();
        persisted.extend(retained);
        self.store.replace_matches(tenant, entity_id, persisted).await?;

        info!(
            tenant_id = %tenant,
            entity_id = %entity_id,
            pool = pool.len(),
            returned = ranked.len(),
            "Match run complete"
        );

        Ok(ranked)
    }

    pub async fn apply_disclosure(
        &self,
        tenant: TenantId,
        match_id: Uuid,
        event: DisclosureEvent,
    ) -> Result<MatchCandidate> {
        let mut candidate = self
            .store
            .current_match(tenant, match_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("match {}", match_id)))?;

        let from = candidate.stage();
        let to = candidate.disclosure.apply(event)?;
        candidate.updated_at = Utc::now();
        self.store.save_match(tenant, candidate.clone()).await?;

        info!(
            tenant_id = %tenant,
            match_id = %match_id,
            from = ?from,
            to = ?to,
            "Disclosure event applied"
        );

        Ok(candidate)
    }

    /// Tenant weights, or the platform defaults.
    pub async fn match_weights(&self, tenant: TenantId) -> Result<MatchWeights> {
        let weights = self
            .store
            .match_weights(tenant)
            .await?
            .unwrap_or(self.config.matching.default_weights);
        weights.normalized()
    }

    pub async fn set_match_weights(
        &self,
        tenant: TenantId,
        weights: MatchWeights,
    ) -> Result<MatchWeights> {
        let normalized = weights.normalized()?;
        self.store.set_match_weights(tenant, normalized).await?;
        info!(tenant_id = %tenant, ?normalized, "Match weights updated");
        Ok(normalized)
    }

    // =============================
    // Deletion
    // =============================

    /// Remove what the entity owns: its snapshots, embeddings and cached vectors.
    /// Valuation results, risk assessments and match history are retained for audit.
    pub async fn delete_entity(&self, tenant: TenantId, entity_id: Uuid) -> Result<DeletionSummary> {
        let snapshots_removed = self.store.delete_snapshots(tenant, entity_id).await?;
        let hashes = self.store.delete_embeddings(tenant, entity_id).await?;
        let removed = hashes.len();

        let unique: HashSet<String> = hashes.into_iter().collect();
        for hash in &unique {
            self.embeddings.cache().evict(tenant, hash).await?;
        }

        info!(
            tenant_id = %tenant,
            entity_id = %entity_id,
            snapshots_removed,
            embeddings_removed = removed,
            "Entity data deleted"
        );

        Ok(DeletionSummary {
            entity_id,
            snapshots_removed,
            embeddings_removed: removed,
        })
    }
}

fn is_engaged(candidate: &MatchCandidate) -> bool {
    let d = &candidate.disclosure;
    match d.stage {
        DisclosureStage::Anonymous => false,
        DisclosureStage::Teaser => d.interest.initiator || d.interest.counterparty,
        DisclosureStage::NdaPending | DisclosureStage::Disclosed | DisclosureStage::Withdrawn => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbeddingProvider;
    use crate::models::{EntityType, Geography, Intent, Money, Party, ReportingPeriod};
    use crate::normalizer::ManualEntry;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingProvider {
        inner: HashingEmbeddingProvider,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_id(&self) -> &str {
            "counting"
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed_text(text).await
        }
    }

    fn orchestrator() -> (Orchestrator, Arc<CountingProvider>) {
        let provider = Arc::new(CountingProvider {
            inner: HashingEmbeddingProvider::new(16),
            calls: AtomicUsize::new(0),
        });
        let mut config = EngineConfig::default();
        config.retry.backoff_base = Duration::from_millis(1);

        let mut collaborators = Collaborators::in_memory(provider.clone());
        collaborators.peers = Arc::new(StaticPeerData::new().with_comparables(
            "saas",
            vec![8.0, 9.0, 10.0]
                .into_iter()
                .enumerate()
                .map(|(i, m)| Comparable {
                    entity_id: format!("peer-{i}"),
                    industry_code: "SOFTWARE".to_string(),
                    revenue: Money::from_major(10_000_000.0),
                    ev_to_ebitda: m,
                })
                .collect(),
        ));
        (Orchestrator::new(config, collaborators), provider)
    }

    fn raw(entity_id: Uuid) -> RawFinancialRecord {
        RawFinancialRecord::ManualEntry(ManualEntry {
            entity_id,
            period: Some(ReportingPeriod {
                start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
            }),
            currency: Some("USD".to_string()),
            revenue: Some(10_000_000.0),
            ebitda: Some(2_000_000.0),
            net_income: Some(1_000_000.0),
            debt: Some(2_000_000.0),
            cash: Some(500_000.0),
            growth_rate: Some(0.05),
            industry_code: Some("SOFTWARE".to_string()),
            ..ManualEntry::default()
        })
    }

    fn valuation_request(entity_id: Uuid) -> ValuationRequest {
        ValuationRequest {
            input: FinancialInput::Raw(raw(entity_id)),
            comparables: PeerSet::Named("saas".to_string()),
            precedents: PeerSet::default(),
            wacc_override: Some(0.10),
        }
    }

    fn profile(entity_type: EntityType, intents: Vec<Intent>, description: Option<&str>) -> EntityProfile {
        EntityProfile {
            entity_id: Uuid::new_v4(),
            entity_type,
            industry_code: Some("SOFTWARE".to_string()),
            revenue: Some(Money::from_major(10_000_000.0)),
            geography: Geography {
                country: Some("DE".to_string()),
                region: Some("Europe".to_string()),
            },
            intents,
            tags: vec!["saas".to_string()],
            description: description.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn valuation_is_persisted_and_then_served_from_cache() {
        let (orch, _) = orchestrator();
        let tenant = Uuid::new_v4();
        let entity = Uuid::new_v4();

        let first = orch.run_valuation(tenant, valuation_request(entity)).await.unwrap();
        assert!(!first.cached);
        let comps = first
            .report
            .valuation
            .estimate(ValuationMethod::Comparables)
            .unwrap();
        assert_eq!(comps.range.mid, Money::from_major(18_000_000.0));

        let second = orch.run_valuation(tenant, valuation_request(entity)).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.report.valuation.result_id, first.report.valuation.result_id);

        let history = orch.valuation_history(tenant, entity).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn new_inputs_supersede_previous_report() {
        let (orch, _) = orchestrator();
        let tenant = Uuid::new_v4();
        let entity = Uuid::new_v4();

        orch.run_valuation(tenant, valuation_request(entity)).await.unwrap();
        let mut changed = valuation_request(entity);
        changed.wacc_override = Some(0.12);
        orch.run_valuation(tenant, changed).await.unwrap();

        let history = orch.valuation_history(tenant, entity).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].superseded);
        assert!(!history[1].superseded);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_compute_once() {
        let (orch, _) = orchestrator();
        let orch = Arc::new(orch);
        let tenant = Uuid::new_v4();
        let entity = Uuid::new_v4();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let orch = Arc::clone(&orch);
                tokio::spawn(async move { orch.run_valuation(tenant, valuation_request(entity)).await })
            })
            .collect();

        let mut computed = 0;
        for handle in handles {
            if !handle.await.unwrap().unwrap().cached {
                computed += 1;
            }
        }
        assert_eq!(computed, 1);
        assert_eq!(orch.valuation_history(tenant, entity).await.unwrap().len(), 1);
        assert!(orch.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_inflight_entry() {
        let (orch, _) = orchestrator();
        let orch = Arc::new(orch);
        let key = (Uuid::new_v4(), "fingerprint".to_string());

        let holder = InflightSlot::claim(&orch.inflight, key.clone());
        let running = holder.lock.lock().await;

        let waiter = {
            let orch = Arc::clone(&orch);
            let key = key.clone();
            tokio::spawn(async move {
                let slot = InflightSlot::claim(&orch.inflight, key);
                let _running = slot.lock.lock().await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(orch.inflight.lock().unwrap().len(), 1);

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(orch.inflight.lock().unwrap().len(), 1);

        drop(running);
        drop(holder);
        assert!(orch.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_valuation_future_releases_its_slot() {
        let (orch, _) = orchestrator();
        let tenant = Uuid::new_v4();
        let entity = Uuid::new_v4();

        let mut task = tokio_test::task::spawn(orch.run_valuation(tenant, valuation_request(entity)));
        // Whether or not the first poll finished, dropping the future must not leak.
        let _ = task.poll();
        drop(task);
        assert!(orch.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn low_completeness_persists_nothing() {
        let (orch, _) = orchestrator();
        let tenant = Uuid::new_v4();
        let entity = Uuid::new_v4();

        let request = ValuationRequest {
            input: FinancialInput::Raw(RawFinancialRecord::ManualEntry(ManualEntry {
                entity_id: entity,
                period: Some(ReportingPeriod {
                    start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                    end: NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
                }),
                currency: Some("USD".to_string()),
                revenue: Some(5_000_000.0),
                ..ManualEntry::default()
            })),
            comparables: PeerSet::default(),
            precedents: PeerSet::default(),
            wacc_override: None,
        };

        let err = orch.run_valuation(tenant, request).await.unwrap_err();
        assert!(matches!(err, EngineError::Normalization(_)));
        assert!(orch.valuation_history(tenant, entity).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_valuation_persists_nothing() {
        let (orch, _) = orchestrator();
        let tenant = Uuid::new_v4();
        let entity = Uuid::new_v4();

        let mut request = valuation_request(entity);
        request.comparables = PeerSet::default();
        request.wacc_override = Some(0.04);

        let err = orch.run_valuation(tenant, request).await.unwrap_err();
        assert!(matches!(err, EngineError::ValuationExhausted { .. }));
        assert!(orch.valuation_history(tenant, entity).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn embedding_uses_directory_and_cache() {
        let (orch, provider) = orchestrator();
        let tenant = Uuid::new_v4();
        let p = profile(EntityType::Deal, vec![Intent::Divest], Some("Payroll SaaS for SMBs"));

        let directory = InMemoryEntityDirectory::new();
        directory.upsert(tenant, p.clone()).await;
        let orch = Orchestrator {
            directory: Arc::new(directory),
            ..orch
        };

        let first = orch
            .generate_embedding(tenant, p.entity_id, None, DegradePolicy::Fail)
            .await
            .unwrap();
        let second = orch
            .generate_embedding(tenant, p.entity_id, Some(p.clone()), DegradePolicy::Fail)
            .await
            .unwrap();

        assert_eq!(first.source_hash, second.source_hash);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let missing = orch
            .generate_embedding(tenant, Uuid::new_v4(), None, DegradePolicy::Fail)
            .await
            .unwrap_err();
        assert!(matches!(missing, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn match_flow_carries_disclosure_forward() {
        let (orch, _) = orchestrator();
        let tenant = Uuid::new_v4();

        let seller = profile(EntityType::Deal, vec![Intent::Divest], None);
        let buyer = profile(EntityType::Member, vec![Intent::Acquire], None);
        for p in [&seller, &buyer] {
            orch.generate_embedding(tenant, p.entity_id, Some(p.clone()), DegradePolicy::Fail)
                .await
                .unwrap();
        }

        let matches = orch
            .run_match(tenant, seller.entity_id, PoolSelector::default(), None)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        let pair = &matches[0];
        assert_eq!(pair.candidate_id, buyer.entity_id);
        assert_eq!(pair.stage(), DisclosureStage::Teaser);

        for party in [Party::Initiator, Party::Counterparty] {
            orch.apply_disclosure(tenant, pair.match_id, DisclosureEvent::InterestExpressed { party })
                .await
                .unwrap();
        }

        let rerun = orch
            .run_match(tenant, seller.entity_id, PoolSelector::default(), None)
            .await
            .unwrap();
        assert_eq!(rerun[0].match_id, pair.match_id);
        assert_eq!(rerun[0].stage(), DisclosureStage::NdaPending);

        let err = orch
            .apply_disclosure(
                tenant,
                pair.match_id,
                DisclosureEvent::TeaserUnlocked { compatibility: 0.9 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn tenant_weights_change_compatibility() {
        let (orch, _) = orchestrator();
        let tenant = Uuid::new_v4();

        let a = profile(EntityType::Deal, vec![Intent::Divest], None);
        let mut b = profile(EntityType::Member, vec![Intent::Divest], None);
        b.geography = Geography::default();
        for p in [&a, &b] {
            orch.generate_embedding(tenant, p.entity_id, Some(p.clone()), DegradePolicy::Fail)
                .await
                .unwrap();
        }

        let before = orch
            .run_match(tenant, a.entity_id, PoolSelector::default(), Some(5))
            .await
            .unwrap()[0]
            .compatibility;

        let weights = orch
            .set_match_weights(
                tenant,
                MatchWeights {
                    similarity: 0.0,
                    size: 0.0,
                    strategic: 1.0,
                    geography: 0.0,
                },
            )
            .await
            .unwrap();
        assert_eq!(weights.strategic, 1.0);

        let after = orch
            .run_match(tenant, a.entity_id, PoolSelector::default(), Some(5))
            .await
            .unwrap()[0]
            .compatibility;
        assert_ne!(before, after);
        // Divest/Divest: no complement, tags identical → 0.5
        assert!((after - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn deletion_cascades_to_entity_owned_data() {
        let (orch, provider) = orchestrator();
        let tenant = Uuid::new_v4();
        let p = profile(EntityType::Deal, vec![], Some("Industrial IoT sensors"));

        orch.generate_embedding(tenant, p.entity_id, Some(p.clone()), DegradePolicy::Fail)
            .await
            .unwrap();
        let valued = orch.run_valuation(tenant, valuation_request(p.entity_id)).await.unwrap();
        let snapshot_id = valued.report.valuation.snapshot_id;

        let summary = orch.delete_entity(tenant, p.entity_id).await.unwrap();
        assert_eq!(summary.snapshots_removed, 1);
        assert_eq!(summary.embeddings_removed, 1);
        assert!(orch.store().latest_embedding(tenant, p.entity_id).await.unwrap().is_none());

        // Valuation and risk stay for audit; the financial figures do not.
        let history = orch.valuation_history(tenant, p.entity_id).await.unwrap();
        assert_eq!(history.len(), 1);
        let audit = &history[0].artifact;
        assert!(audit.snapshot.is_none());
        assert_eq!(audit.valuation.snapshot_id, snapshot_id);
        assert_eq!(audit.risk.snapshot_id, snapshot_id);

        // Same input again is recomputed rather than served without its snapshot.
        let again = orch.run_valuation(tenant, valuation_request(p.entity_id)).await.unwrap();
        assert!(!again.cached);
        assert!(again.report.snapshot.is_some());

        // Cached vector was evicted, so re-embedding calls the provider again.
        orch.generate_embedding(tenant, p.entity_id, Some(p), DegradePolicy::Fail)
            .await
            .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pair_shares_one_disclosure_state_from_both_sides() {
        let (orch, _) = orchestrator();
        let tenant = Uuid::new_v4();

        let seller = profile(EntityType::Deal, vec![Intent::Divest], None);
        let buyer = profile(EntityType::Member, vec![Intent::Acquire], None);
        for p in [&seller, &buyer] {
            orch.generate_embedding(tenant, p.entity_id, Some(p.clone()), DegradePolicy::Fail)
                .await
                .unwrap();
        }

        let pair = orch
            .run_match(tenant, seller.entity_id, PoolSelector::default(), None)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(pair.stage(), DisclosureStage::Teaser);
        orch.apply_disclosure(
            tenant,
            pair.match_id,
            DisclosureEvent::Withdrawn {
                party: Party::Counterparty,
            },
        )
        .await
        .unwrap();

        let from_buyer = orch
            .run_match(tenant, buyer.entity_id, PoolSelector::default(), None)
            .await
            .unwrap();
        assert_eq!(from_buyer.len(), 1);
        let same = &from_buyer[0];
        assert_eq!(same.match_id, pair.match_id);
        assert_eq!(same.entity_id, seller.entity_id);
        assert_eq!(same.candidate_id, buyer.entity_id);
        assert_eq!(same.stage(), DisclosureStage::Withdrawn);

        for party in [Party::Initiator, Party::Counterparty] {
            let err = orch
                .apply_disclosure(tenant, same.match_id, DisclosureEvent::InterestExpressed { party })
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidTransition { .. }));
        }

        let seller_view = orch.store().current_matches(tenant, seller.entity_id).await.unwrap();
        assert_eq!(seller_view.len(), 1);
        assert_eq!(seller_view[0].stage(), DisclosureStage::Withdrawn);
    }

    #[tokio::test]
    async fn restarted_engine_reuses_persisted_embeddings() {
        use crate::embedding::PersistentEmbeddingCache;

        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let tenant = Uuid::new_v4();
        let p = profile(EntityType::Deal, vec![Intent::Divest], Some("Cold chain logistics"));

        let boot = |store: Arc<dyn ArtifactStore>| {
            let provider = Arc::new(CountingProvider {
                inner: HashingEmbeddingProvider::new(16),
                calls: AtomicUsize::new(0),
            });
            let mut collaborators = Collaborators::in_memory(provider.clone());
            collaborators.cache = Arc::new(PersistentEmbeddingCache::new(Arc::clone(&store)));
            collaborators.store = store;
            (Orchestrator::new(EngineConfig::default(), collaborators), provider)
        };

        let (first, first_provider) = boot(Arc::clone(&store));
        let original = first
            .generate_embedding(tenant, p.entity_id, Some(p.clone()), DegradePolicy::Fail)
            .await
            .unwrap();
        assert_eq!(first_provider.calls.load(Ordering::SeqCst), 1);

        let (second, second_provider) = boot(store);
        let restored = second
            .generate_embedding(tenant, p.entity_id, Some(p), DegradePolicy::Fail)
            .await
            .unwrap();
        assert_eq!(second_provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(restored.source_hash, original.source_hash);
        assert_eq!(restored.vector, original.vector);
    }
}

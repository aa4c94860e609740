//! Matching engine
//!
//! Similarity search over embedding records followed by compatibility scoring
//! and ranking. Both the top-K cut and the final ranking use total orders, so
//! the output does not depend on the order in which the pool was assembled.

pub mod disclosure;

pub use disclosure::{DisclosureEvent, DisclosureState, PartyFlags, Transition};

use crate::config::{MatchWeights, MatchingConfig};
use crate::fingerprint::stable_uuid_from_string;
use crate::models::{
    CompatibilityBreakdown, EmbeddingRecord, Exclusion, Intent, MatchCandidate, StructuredAttributes,
};
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

const NEUTRAL: f64 = 0.5;

/// Cosine similarity in f64; zero when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0)
}

/// Match id shared by every version of a pair, whichever side runs the match.
pub fn pair_match_id(a: Uuid, b: Uuid) -> Uuid {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    stable_uuid_from_string(&format!("match:{}:{}", low, high))
}

//
// ================= Factor Scores =================
//

pub fn size_score(
    a: &StructuredAttributes,
    b: &StructuredAttributes,
    delta_cap: f64,
) -> (f64, Option<Exclusion>) {
    match (a.revenue, b.revenue) {
        (Some(x), Some(y)) if x.is_positive() && y.is_positive() => {
            let (x, y) = (x.minor() as f64, y.minor() as f64);
            let delta = (x - y).abs() / x.min(y);
            (1.0 / (1.0 + delta.min(delta_cap)), None)
        }
        _ => (NEUTRAL, Some(Exclusion::new("size", "revenue unknown on one side"))),
    }
}

fn intents_complement(a: &[Intent], b: &[Intent]) -> bool {
    a.iter().any(|i| b.contains(&i.complement()))
}

pub fn strategic_score(a: &StructuredAttributes, b: &StructuredAttributes) -> (f64, Option<Exclusion>) {
    let mut parts = Vec::with_capacity(2);

    if !a.intents.is_empty() && !b.intents.is_empty() {
        parts.push(if intents_complement(&a.intents, &b.intents) { 1.0 } else { 0.0 });
    }

    if !a.tags.is_empty() && !b.tags.is_empty() {
        let shared = a.tags.iter().filter(|t| b.tags.contains(t)).count();
        let union = a.tags.len() + b.tags.len() - shared;
        parts.push(shared as f64 / union as f64);
    }

    if parts.is_empty() {
        return (
            NEUTRAL,
            Some(Exclusion::new("strategic", "no intents or tags on one side")),
        );
    }
    (parts.iter().sum::<f64>() / parts.len() as f64, None)
}

pub fn geography_score(a: &StructuredAttributes, b: &StructuredAttributes) -> (f64, Option<Exclusion>) {
    let (ga, gb) = (&a.geography, &b.geography);

    if let (Some(ca), Some(cb)) = (&ga.country, &gb.country) {
        if ca == cb {
            return (1.0, None);
        }
    }
    if let (Some(ra), Some(rb)) = (&ga.region, &gb.region) {
        return (if ra == rb { 0.6 } else { 0.0 }, None);
    }
    if ga.country.is_some() && gb.country.is_some() {
        return (0.0, None);
    }
    (NEUTRAL, Some(Exclusion::new("geography", "location unknown on one side")))
}

//
// ================= Engine =================
//

struct Scored<'a> {
    candidate: &'a EmbeddingRecord,
    similarity: f64,
    compatibility: f64,
    breakdown: CompatibilityBreakdown,
    exclusions: Vec<Exclusion>,
}

pub struct MatchingEngine {
    config: MatchingConfig,
}

impl MatchingEngine {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Rank the pool against `query`. `weights` must already be normalized.
    pub fn find_matches<'a>(
        &self,
        query: &'a EmbeddingRecord,
        pool: &'a [EmbeddingRecord],
        top_k: usize,
        weights: &MatchWeights,
    ) -> MatchIter<'a> {
        // Latest record per entity; self and incompatible layouts are skipped.
        let mut latest: HashMap<Uuid, &EmbeddingRecord> = HashMap::new();
        for record in pool {
            if record.entity_id == query.entity_id || record.vector.len() != query.vector.len() {
                continue;
            }
            latest
                .entry(record.entity_id)
                .and_modify(|current| {
                    if fresher(record, current) == Ordering::Less {
                        *current = record;
                    }
                })
                .or_insert(record);
        }

        let mut by_similarity: Vec<(&EmbeddingRecord, f64)> = latest
            .into_values()
            .map(|r| (r, cosine_similarity(&query.vector, &r.vector)))
            .collect();
        by_similarity.sort_by(|(ra, sa), (rb, sb)| sb.total_cmp(sa).then_with(|| fresher(ra, rb)));
        by_similarity.truncate(top_k);

        let mut scored: Vec<Scored<'a>> = by_similarity
            .into_iter()
            .map(|(candidate, similarity)| self.score(query, candidate, similarity, weights))
            .collect();
        scored.sort_by(|a, b| {
            b.compatibility
                .total_cmp(&a.compatibility)
                .then_with(|| fresher(a.candidate, b.candidate))
        });

        debug!(
            entity_id = %query.entity_id,
            pool = pool.len(),
            kept = scored.len(),
            "Match candidates ranked"
        );

        MatchIter {
            query,
            ranked: scored.into_iter(),
            teaser_threshold: self.config.teaser_threshold,
        }
    }

    fn score<'a>(
        &self,
        query: &EmbeddingRecord,
        candidate: &'a EmbeddingRecord,
        similarity: f64,
        weights: &MatchWeights,
    ) -> Scored<'a> {
        let (qa, ca) = (&query.attributes, &candidate.attributes);
        let mut exclusions = Vec::new();

        let (size, note) = size_score(qa, ca, self.config.size_delta_cap);
        exclusions.extend(note);
        let (strategic, note) = strategic_score(qa, ca);
        exclusions.extend(note);
        let (geography, note) = geography_score(qa, ca);
        exclusions.extend(note);

        if query.degraded || candidate.degraded {
            exclusions.push(Exclusion::new(
                "similarity",
                "text embedding unavailable (provider degraded); structured-only similarity",
            ));
        } else if !query.text_embedded || !candidate.text_embedded {
            exclusions.push(Exclusion::new(
                "similarity",
                "no description on one side; structured-only similarity",
            ));
        }

        let compatibility = weights.similarity * similarity.max(0.0)
            + weights.size * size
            + weights.strategic * strategic
            + weights.geography * geography;

        Scored {
            candidate,
            similarity,
            compatibility: compatibility.clamp(0.0, 1.0),
            breakdown: CompatibilityBreakdown {
                similarity,
                size,
                strategic,
                geography,
            },
            exclusions,
        }
    }
}

/// Fresher embedding first, then entity id ascending.
fn fresher(a: &EmbeddingRecord, b: &EmbeddingRecord) -> Ordering {
    b.generated_at
        .cmp(&a.generated_at)
        .then_with(|| a.entity_id.cmp(&b.entity_id))
        .then_with(|| a.record_id.cmp(&b.record_id))
}

/// Ranked candidates, materialized one at a time. Finite and not restartable.
pub struct MatchIter<'a> {
    query: &'a EmbeddingRecord,
    ranked: std::vec::IntoIter<Scored<'a>>,
    teaser_threshold: f64,
}

impl<'a> Iterator for MatchIter<'a> {
    type Item = MatchCandidate;

    fn next(&mut self) -> Option<MatchCandidate> {
        let s = self.ranked.next()?;
        let now = Utc::now();
        Some(MatchCandidate {
            match_id: pair_match_id(self.query.entity_id, s.candidate.entity_id),
            entity_id: self.query.entity_id,
            candidate_id: s.candidate.entity_id,
            similarity: s.similarity,
            compatibility: s.compatibility,
            breakdown: s.breakdown,
            disclosure: DisclosureState::initial(s.compatibility, self.teaser_threshold),
            candidate_generated_at: s.candidate.generated_at,
            exclusions: s.exclusions,
            created_at: now,
            updated_at: now,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ranked.size_hint()
    }
}

impl<'a> ExactSizeIterator for MatchIter<'a> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::{normalize_attributes, structured_segment, HashingEmbeddingProvider, EmbeddingProvider, STRUCTURED_DIMS};
    use crate::models::{DisclosureStage, EntityProfile, EntityType, Geography, Money};
    use chrono::{Duration, Utc};

    fn profile(industry: &str, revenue: f64, country: &str, intents: Vec<Intent>) -> EntityProfile {
        EntityProfile {
            entity_id: Uuid::new_v4(),
            entity_type: EntityType::Member,
            industry_code: Some(industry.to_string()),
            revenue: Some(Money::from_major(revenue)),
            geography: Geography {
                country: Some(country.to_string()),
                region: Some("europe".to_string()),
            },
            intents,
            tags: vec!["b2b".to_string()],
            description: None,
        }
    }

    async fn record(profile: &EntityProfile, age_secs: i64) -> EmbeddingRecord {
        let attributes = normalize_attributes(profile);
        let mut vector = structured_segment(&attributes, EmbeddingConfig::default().structured_weight);
        let text_dims = 8;
        match &profile.description {
            Some(d) => {
                let text = HashingEmbeddingProvider::new(text_dims).embed_text(d).await.unwrap();
                vector.extend(crate::embedding::scaled_unit(text, 0.5));
            }
            None => vector.extend(vec![0.0; text_dims]),
        }
        EmbeddingRecord {
            record_id: Uuid::new_v4(),
            entity_id: profile.entity_id,
            entity_type: profile.entity_type,
            vector,
            source_hash: String::new(),
            model_id: "test".to_string(),
            attributes,
            text_embedded: profile.description.is_some(),
            degraded: false,
            generated_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    fn engine() -> MatchingEngine {
        MatchingEngine::new(MatchingConfig::default())
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-12);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn size_score_caps_delta() {
        let mut a = normalize_attributes(&profile("software", 10e6, "de", vec![]));
        let mut b = a.clone();
        assert_eq!(size_score(&a, &b, 9.0).0, 1.0);

        b.revenue = Some(Money::from_major(20e6));
        assert!((size_score(&a, &b, 9.0).0 - 0.5).abs() < 1e-12);

        b.revenue = Some(Money::from_major(10e9));
        assert!((size_score(&a, &b, 9.0).0 - 0.1).abs() < 1e-12);

        a.revenue = None;
        let (score, note) = size_score(&a, &b, 9.0);
        assert_eq!(score, 0.5);
        assert!(note.is_some());
    }

    #[test]
    fn strategic_and_geography_factors() {
        let seller = normalize_attributes(&profile("software", 10e6, "de", vec![Intent::Divest]));
        let buyer = normalize_attributes(&profile("software", 10e6, "fr", vec![Intent::Acquire]));
        let rival = normalize_attributes(&profile("software", 10e6, "de", vec![Intent::Divest]));

        // complement 1.0, tags identical 1.0
        assert_eq!(strategic_score(&seller, &buyer).0, 1.0);
        assert_eq!(strategic_score(&seller, &rival).0, 0.5);

        assert_eq!(geography_score(&seller, &rival).0, 1.0);
        assert_eq!(geography_score(&seller, &buyer).0, 0.6);

        let mut nowhere = buyer.clone();
        nowhere.geography = Geography::default();
        let (score, note) = geography_score(&seller, &nowhere);
        assert_eq!(score, 0.5);
        assert!(note.is_some());
    }

    #[tokio::test]
    async fn identical_structured_profiles_without_descriptions() {
        let a = profile("software", 10e6, "de", vec![Intent::Partner]);
        let mut b = a.clone();
        b.entity_id = Uuid::new_v4();

        let (ra, rb) = (record(&a, 0).await, record(&b, 0).await);
        assert!(ra.vector[STRUCTURED_DIMS..].iter().all(|x| *x == 0.0));

        let pool = vec![ra.clone(), rb.clone()];
        let matches: Vec<MatchCandidate> =
            engine().find_matches(&ra, &pool, 50, &MatchWeights::default()).collect();

        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.candidate_id, b.entity_id);
        assert!((m.similarity - 1.0).abs() < 1e-6);
        assert!((m.compatibility - 1.0).abs() < 1e-6);
        assert_eq!(m.stage(), DisclosureStage::Teaser);
        assert!(m.exclusions.iter().any(|e| e.subject == "similarity"));
    }

    #[tokio::test]
    async fn ranking_is_order_insensitive() {
        let query_profile = profile("software", 10e6, "de", vec![Intent::Acquire]);
        let query = record(&query_profile, 0).await;

        let mut pool = Vec::new();
        for (i, (industry, revenue, country, intent)) in [
            ("software", 12e6, "de", Intent::Divest),
            ("software", 12e6, "de", Intent::Divest),
            ("retail", 3e6, "fr", Intent::Invest),
            ("software", 50e6, "us", Intent::Divest),
            ("healthcare", 9e6, "de", Intent::Partner),
        ]
        .into_iter()
        .enumerate()
        {
            let mut p = profile(industry, revenue, country, vec![intent]);
            p.description = Some(format!("company number {}", i % 2));
            pool.push(record(&p, i as i64).await);
        }

        let ids = |pool: &[EmbeddingRecord]| -> Vec<(Uuid, u64)> {
            engine()
                .find_matches(&query, pool, 3, &MatchWeights::default())
                .map(|m| (m.candidate_id, m.compatibility.to_bits()))
                .collect()
        };

        let forward = ids(&pool);
        pool.reverse();
        let backward = ids(&pool);
        pool.swap(0, 3);
        let shuffled = ids(&pool);

        assert_eq!(forward.len(), 3);
        assert_eq!(forward, backward);
        assert_eq!(forward, shuffled);

        let scores: Vec<f64> = forward.iter().map(|(_, bits)| f64::from_bits(*bits)).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    }

    #[tokio::test]
    async fn union_of_pools_ranks_like_merged_partial_results() {
        let query = record(&profile("software", 10e6, "de", vec![Intent::Acquire]), 0).await;

        let mut pool = Vec::new();
        for (i, (industry, revenue, country, intent)) in [
            ("software", 12e6, "de", Intent::Divest),
            ("retail", 3e6, "fr", Intent::Invest),
            ("software", 9e6, "fr", Intent::Partner),
            ("healthcare", 40e6, "de", Intent::Divest),
            ("software", 11e6, "us", Intent::Divest),
            ("software", 80e6, "de", Intent::Acquire),
            ("logistics", 10e6, "de", Intent::Divest),
        ]
        .into_iter()
        .enumerate()
        {
            let mut p = profile(industry, revenue, country, vec![intent]);
            p.description = Some(format!("segment {}", i % 3));
            pool.push(record(&p, i as i64 + 1).await);
        }

        let top_k = 3;
        let weights = MatchWeights::default();
        let run = |pool: &[EmbeddingRecord]| -> Vec<MatchCandidate> {
            engine().find_matches(&query, pool, top_k, &weights).collect()
        };
        let newer_first = |x: &MatchCandidate, y: &MatchCandidate| {
            y.candidate_generated_at.cmp(&x.candidate_generated_at)
        };

        let union = run(&pool);

        let (a, b) = pool.split_at(4);
        let mut merged: Vec<MatchCandidate> = run(a).into_iter().chain(run(b)).collect();
        merged.sort_by(|x, y| y.similarity.total_cmp(&x.similarity).then_with(|| newer_first(x, y)));
        merged.truncate(top_k);
        merged.sort_by(|x, y| y.compatibility.total_cmp(&x.compatibility).then_with(|| newer_first(x, y)));

        let ranked = |candidates: &[MatchCandidate]| -> Vec<(Uuid, u64)> {
            candidates
                .iter()
                .map(|m| (m.candidate_id, m.compatibility.to_bits()))
                .collect()
        };
        assert_eq!(union.len(), top_k);
        assert_eq!(ranked(&union), ranked(&merged));
    }

    #[tokio::test]
    async fn latest_record_per_entity_wins() {
        let query = record(&profile("software", 10e6, "de", vec![]), 0).await;
        let p = profile("software", 10e6, "de", vec![]);
        let old = record(&p, 100).await;
        let new = record(&p, 1).await;

        let pool = vec![old, new.clone()];
        let matches: Vec<MatchCandidate> =
            engine().find_matches(&query, &pool, 10, &MatchWeights::default()).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].candidate_generated_at, new.generated_at);
    }

    #[tokio::test]
    async fn match_ids_are_stable_per_pair() {
        let query = record(&profile("software", 10e6, "de", vec![]), 0).await;
        let other = record(&profile("software", 11e6, "de", vec![]), 0).await;
        let pool = vec![other.clone()];

        let first = engine().find_matches(&query, &pool, 5, &MatchWeights::default()).next().unwrap();
        let second = engine().find_matches(&query, &pool, 5, &MatchWeights::default()).next().unwrap();
        assert_eq!(first.match_id, second.match_id);
        assert_eq!(first.match_id, pair_match_id(query.entity_id, other.entity_id));

        let reverse_pool = vec![query.clone()];
        let reverse = engine().find_matches(&other, &reverse_pool, 5, &MatchWeights::default()).next().unwrap();
        assert_eq!(reverse.match_id, first.match_id);
        assert_eq!(reverse.entity_id, other.entity_id);
    }
}

//! Embedding generator
//!
//! Vector layout: a fixed structured segment followed by the provider's text
//! segment. Each segment is L2-normalized on its own and scaled by its weight,
//! so segments never overlap and their contribution to cosine similarity is
//! bounded by the configured weights.
//!
//! Records are content-addressed: the source hash covers the normalized
//! attributes, description, model id and layout version. A cache hit skips the
//! provider entirely.

pub mod cache;
pub mod provider;

pub use cache::{CachedEmbedding, EmbeddingCache, InMemoryEmbeddingCache, PersistentEmbeddingCache};
pub use provider::{EmbeddingProvider, GeminiEmbeddingProvider};

use crate::config::{EmbeddingConfig, RetryPolicy};
use crate::fingerprint::{bucket_of, hash_json};
use crate::models::{EmbeddingRecord, EntityProfile, Geography, Intent, Money, StructuredAttributes, TenantId};
use crate::retry::call_with_retry;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const LAYOUT_VERSION: &str = "layout-v1";

pub const INDUSTRY_DIMS: usize = 16;
pub const SIZE_DIMS: usize = 6;
pub const REGION_DIMS: usize = 8;
pub const INTENT_TAG_DIMS: usize = 16;
pub const STRUCTURED_DIMS: usize = INDUSTRY_DIMS + SIZE_DIMS + REGION_DIMS + INTENT_TAG_DIMS;

/// Upper revenue bounds (major units) of the first five size buckets.
const SIZE_BOUNDS: [f64; 5] = [1e6, 5e6, 2e7, 1e8, 5e8];

/// What to do when the text provider is unavailable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DegradePolicy {
    /// Emit a structured-only record flagged `degraded`.
    #[default]
    StructuredOnly,
    /// Surface the provider error.
    Fail,
}

pub struct EmbeddingGenerator {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<dyn EmbeddingCache>,
    config: EmbeddingConfig,
    retry: RetryPolicy,
}

impl EmbeddingGenerator {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<dyn EmbeddingCache>,
        config: EmbeddingConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            cache,
            config,
            retry,
        }
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    pub fn dimension(&self) -> usize {
        STRUCTURED_DIMS + self.provider.dimension()
    }

    pub fn cache(&self) -> &Arc<dyn EmbeddingCache> {
        &self.cache
    }

    pub async fn embed(
        &self,
        tenant: TenantId,
        profile: &EntityProfile,
        policy: DegradePolicy,
    ) -> Result<EmbeddingRecord> {
        let attributes = normalize_attributes(profile);
        let description = profile.description.as_deref().map(collapse_whitespace).filter(|d| !d.is_empty());
        let source_hash = content_hash(&attributes, description.as_deref(), self.provider.model_id());

        if let Some(hit) = self.cache.get(tenant, &source_hash).await? {
            debug!(entity_id = %profile.entity_id, %source_hash, "Embedding cache hit");
            return Ok(self.record(profile, attributes, source_hash, hit.vector, hit.text_embedded, false));
        }

        let mut vector = structured_segment(&attributes, self.config.structured_weight);
        let text_dims = self.provider.dimension();

        let (text, text_embedded, degraded) = match description.as_deref() {
            None => (vec![0.0; text_dims], false, false),
            Some(text) => match self.embed_description(text).await {
                Ok(values) => (scaled_unit(values, self.config.text_weight), true, false),
                Err(e) if policy == DegradePolicy::StructuredOnly => {
                    warn!(
                        entity_id = %profile.entity_id,
                        error = %e,
                        "Embedding provider unavailable, degrading to structured-only"
                    );
                    (vec![0.0; text_dims], false, true)
                }
                Err(e) => return Err(e),
            },
        };
        vector.extend(text);

        if !degraded {
            self.cache
                .put(
                    tenant,
                    &source_hash,
                    CachedEmbedding {
                        vector: vector.clone(),
                        text_embedded,
                    },
                )
                .await?;
        }

        info!(
            entity_id = %profile.entity_id,
            %source_hash,
            text_embedded,
            degraded,
            "Embedding generated"
        );

        Ok(self.record(profile, attributes, source_hash, vector, text_embedded, degraded))
    }

    async fn embed_description(&self, text: &str) -> Result<Vec<f32>> {
        let provider = Arc::clone(&self.provider);
        let values = call_with_retry(&self.retry, "embed_text", || {
            let provider = Arc::clone(&provider);
            let text = text.to_string();
            async move { provider.embed_text(&text).await }
        })
        .await?;

        if values.len() != self.provider.dimension() {
            return Err(crate::error::EngineError::EmbeddingProvider(format!(
                "provider returned {} dimensions, expected {}",
                values.len(),
                self.provider.dimension()
            )));
        }
        Ok(values)
    }

    fn record(
        &self,
        profile: &EntityProfile,
        attributes: StructuredAttributes,
        source_hash: String,
        vector: Vec<f32>,
        text_embedded: bool,
        degraded: bool,
    ) -> EmbeddingRecord {
        EmbeddingRecord {
            record_id: Uuid::new_v4(),
            entity_id: profile.entity_id,
            entity_type: profile.entity_type,
            vector,
            source_hash,
            model_id: self.provider.model_id().to_string(),
            attributes,
            text_embedded,
            degraded,
            generated_at: Utc::now(),
        }
    }
}

//
// ================= Normalization =================
//

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_token(s: &str) -> Option<String> {
    let t = collapse_whitespace(s).to_lowercase();
    (!t.is_empty()).then_some(t)
}

/// Size bucket 0..=5 from revenue.
pub fn size_bucket(revenue: Money) -> u8 {
    let major = revenue.to_major();
    SIZE_BOUNDS
        .iter()
        .position(|bound| major < *bound)
        .unwrap_or(SIZE_BOUNDS.len()) as u8
}

pub fn normalize_attributes(profile: &EntityProfile) -> StructuredAttributes {
    let mut intents: Vec<Intent> = profile.intents.clone();
    intents.sort();
    intents.dedup();

    let mut tags: Vec<String> = profile.tags.iter().filter_map(|t| normalize_token(t)).collect();
    tags.sort();
    tags.dedup();

    let revenue = profile.revenue.filter(|r| r.minor() >= 0);

    StructuredAttributes {
        industry_code: profile
            .industry_code
            .as_deref()
            .and_then(normalize_token),
        size_bucket: revenue.map(size_bucket),
        revenue,
        geography: Geography {
            country: profile.geography.country.as_deref().and_then(normalize_token),
            region: profile.geography.region.as_deref().and_then(normalize_token),
        },
        intents,
        tags,
    }
}

#[derive(Serialize)]
struct HashInput<'a> {
    layout: &'a str,
    model_id: &'a str,
    attributes: &'a StructuredAttributes,
    description: Option<&'a str>,
}

pub fn content_hash(
    attributes: &StructuredAttributes,
    description: Option<&str>,
    model_id: &str,
) -> String {
    hash_json(&HashInput {
        layout: LAYOUT_VERSION,
        model_id,
        attributes,
        description,
    })
}

//
// ================= Vector Construction =================
//

pub fn structured_segment(attributes: &StructuredAttributes, weight: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; STRUCTURED_DIMS];

    if let Some(industry) = &attributes.industry_code {
        v[bucket_of(industry, INDUSTRY_DIMS)] = 1.0;
    }

    let size_offset = INDUSTRY_DIMS;
    if let Some(bucket) = attributes.size_bucket {
        v[size_offset + (bucket as usize).min(SIZE_DIMS - 1)] = 1.0;
    }

    let region_offset = size_offset + SIZE_DIMS;
    let location = attributes
        .geography
        .region
        .as_deref()
        .or(attributes.geography.country.as_deref());
    if let Some(location) = location {
        v[region_offset + bucket_of(location, REGION_DIMS)] = 1.0;
    }

    let intent_offset = region_offset + REGION_DIMS;
    for intent in &attributes.intents {
        v[intent_offset + bucket_of(&format!("intent:{}", intent.as_str()), INTENT_TAG_DIMS)] += 1.0;
    }
    for tag in &attributes.tags {
        v[intent_offset + bucket_of(&format!("tag:{}", tag), INTENT_TAG_DIMS)] += 1.0;
    }

    scaled_unit(v, weight)
}

/// L2-normalize then scale; all-zero input stays zero.
pub fn scaled_unit(mut v: Vec<f32>, weight: f32) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for x in v.iter_mut() {
            *x = *x / norm * weight;
        }
    }
    v
}

//
// ================= Offline Provider =================
//

/// Deterministic feature-hashing text embedder.
///
/// Used when no provider key is configured and in local runs.
pub struct HashingEmbeddingProvider {
    dimension: usize,
}

impl HashingEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    fn model_id(&self) -> &str {
        "local-hashing-v1"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dimension];
        for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let word = word.to_lowercase();
            let sign = if bucket_of(&format!("sign:{}", word), 2) == 0 { 1.0 } else { -1.0 };
            v[bucket_of(&word, self.dimension)] += sign;
        }
        Ok(v)
    }
}

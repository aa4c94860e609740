//! External data collaborators: peer sets and the entity directory

use crate::error::EngineError;
use crate::models::{Comparable, EntityProfile, PrecedentTransaction, TenantId};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Peers supplied inline or by the name of a curated set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PeerSet<T> {
    Inline(Vec<T>),
    Named(String),
}

impl<T> Default for PeerSet<T> {
    fn default() -> Self {
        PeerSet::Inline(Vec::new())
    }
}

/// Source of curated comparable and precedent sets.
#[async_trait]
pub trait PeerDataSource: Send + Sync {
    async fn comparables(&self, set_name: &str) -> Result<Vec<Comparable>>;
    async fn precedents(&self, set_name: &str) -> Result<Vec<PrecedentTransaction>>;
}

#[derive(Default)]
pub struct StaticPeerData {
    comparables: HashMap<String, Vec<Comparable>>,
    precedents: HashMap<String, Vec<PrecedentTransaction>>,
}

impl StaticPeerData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_comparables(mut self, name: &str, set: Vec<Comparable>) -> Self {
        self.comparables.insert(name.to_string(), set);
        self
    }

    pub fn with_precedents(mut self, name: &str, set: Vec<PrecedentTransaction>) -> Self {
        self.precedents.insert(name.to_string(), set);
        self
    }
}

#[async_trait]
impl PeerDataSource for StaticPeerData {
    async fn comparables(&self, set_name: &str) -> Result<Vec<Comparable>> {
        self.comparables
            .get(set_name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("comparable set '{}'", set_name)))
    }

    async fn precedents(&self, set_name: &str) -> Result<Vec<PrecedentTransaction>> {
        self.precedents
            .get(set_name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("precedent set '{}'", set_name)))
    }
}

/// Entity metadata owned by the CRUD layer.
#[async_trait]
pub trait EntityDirectory: Send + Sync {
    async fn profile(&self, tenant: TenantId, entity_id: Uuid) -> Result<Option<EntityProfile>>;
}

#[derive(Default)]
pub struct InMemoryEntityDirectory {
    profiles: Arc<RwLock<HashMap<(TenantId, Uuid), EntityProfile>>>,
}

impl InMemoryEntityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, tenant: TenantId, profile: EntityProfile) {
        self.profiles
            .write()
            .await
            .insert((tenant, profile.entity_id), profile);
    }

    pub async fn remove(&self, tenant: TenantId, entity_id: Uuid) -> Option<EntityProfile> {
        self.profiles.write().await.remove(&(tenant, entity_id))
    }
}

#[async_trait]
impl EntityDirectory for InMemoryEntityDirectory {
    async fn profile(&self, tenant: TenantId, entity_id: Uuid) -> Result<Option<EntityProfile>> {
        Ok(self.profiles.read().await.get(&(tenant, entity_id)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Money;

    #[test]
    fn peer_sets_deserialize_inline_or_named() {
        let named: PeerSet<Comparable> = serde_json::from_str("\"saas-mid-market\"").unwrap();
        assert_eq!(named, PeerSet::Named("saas-mid-market".to_string()));

        let inline: PeerSet<Comparable> = serde_json::from_str(
            r#"[{"entity_id":"p1","industry_code":"SOFTWARE","revenue":900000000,"ev_to_ebitda":8.0}]"#,
        )
        .unwrap();
        match inline {
            PeerSet::Inline(v) => assert_eq!(v[0].revenue, Money::from_major(9_000_000.0)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_named_set_is_not_found() {
        let data = StaticPeerData::new();
        assert!(matches!(
            data.comparables("missing").await,
            Err(EngineError::NotFound(_))
        ));
    }
}

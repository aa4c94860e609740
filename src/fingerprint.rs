//! Content hashing for fingerprints and content-addressed records
//!
//! Everything is hashed as canonical JSON streamed straight into SHA-256.
//! Field order is fixed by the serde derive order of the borrowed views below.

use crate::models::{Comparable, FinancialSnapshot, Money, PrecedentTransaction, ReportingPeriod};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Write;

/// SHA-256 hex digest of a value's JSON encoding.
/// Uses zero-copy streaming serialization into hasher
pub fn hash_json<T: Serialize + ?Sized>(value: &T) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), value).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct SnapshotContent<'a> {
    entity_id: &'a uuid::Uuid,
    period: &'a ReportingPeriod,
    currency: &'a str,
    revenue: Money,
    ebitda: Option<Money>,
    net_income: Option<Money>,
    debt: Option<Money>,
    cash: Option<Money>,
    growth_rate: Option<f64>,
    industry_code: Option<&'a str>,
    data_completeness: f64,
}

/// Digest of the financial content of a snapshot, ignoring its id and creation time.
pub fn snapshot_content_digest(snapshot: &FinancialSnapshot) -> String {
    hash_json(&SnapshotContent {
        entity_id: &snapshot.entity_id,
        period: &snapshot.period,
        currency: &snapshot.currency,
        revenue: snapshot.revenue,
        ebitda: snapshot.ebitda,
        net_income: snapshot.net_income,
        debt: snapshot.debt,
        cash: snapshot.cash,
        growth_rate: snapshot.growth_rate,
        industry_code: snapshot.industry_code.as_deref(),
        data_completeness: snapshot.data_completeness,
    })
}

/// Order-independent digest of a comparable set.
pub fn comparables_digest(comparables: &[Comparable]) -> String {
    let mut items: Vec<&Comparable> = comparables.iter().collect();
    items.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    hash_json(&items)
}

/// Order-independent digest of a precedent set.
pub fn precedents_digest(precedents: &[PrecedentTransaction]) -> String {
    let mut items: Vec<&PrecedentTransaction> = precedents.iter().collect();
    items.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));
    hash_json(&items)
}

#[derive(Serialize)]
struct ValuationInputs<'a> {
    snapshot: &'a str,
    methodology_version: &'a str,
    wacc_override: Option<f64>,
    comparables: &'a str,
    precedents: &'a str,
}

/// Input fingerprint of one valuation run.
pub fn valuation_fingerprint(
    snapshot: &FinancialSnapshot,
    methodology_version: &str,
    wacc_override: Option<f64>,
    comparables: &[Comparable],
    precedents: &[PrecedentTransaction],
) -> String {
    hash_json(&ValuationInputs {
        snapshot: &snapshot_content_digest(snapshot),
        methodology_version,
        wacc_override,
        comparables: &comparables_digest(comparables),
        precedents: &precedents_digest(precedents),
    })
}

/// Stable bucket index in `0..buckets` for a token.
pub fn bucket_of(token: &str, buckets: usize) -> usize {
    let hash = Sha256::digest(token.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    (u64::from_le_bytes(bytes) % buckets.max(1) as u64) as usize
}

/// Deterministic UUID derived from an arbitrary string.
pub fn stable_uuid_from_string(input: &str) -> uuid::Uuid {
    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    uuid::Uuid::from_bytes(bytes)
}

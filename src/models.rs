//! Core data models for valuation and matching

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use uuid::Uuid;

pub use crate::matching::disclosure::DisclosureState;

/// Tenant identifier supplied by the identity collaborator.
pub type TenantId = Uuid;

//
// ================= Money =================
//

/// Monetary amount in integer minor units (cents) of the reporting currency.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    /// Round a major-unit float (e.g. dollars) to the nearest minor unit.
    /// Saturates at the i64 bounds; use `checked_from_major` for untrusted input.
    pub fn from_major(major: f64) -> Self {
        Money((major * 100.0).round() as i64)
    }

    /// `None` when the amount is not finite or does not fit in i64 minor units.
    pub fn checked_from_major(major: f64) -> Option<Self> {
        let minor = (major * 100.0).round();
        // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
        if minor.is_finite() && minor >= i64::MIN as f64 && minor < i64::MAX as f64 {
            Some(Money(minor as i64))
        } else {
            None
        }
    }

    pub fn minor(self) -> i64 {
        self.0
    }

    pub fn to_major(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Multiply by a ratio, rounding half away from zero into minor units.
    pub fn scale(self, factor: f64) -> Self {
        Money((self.0 as f64 * factor).round() as i64)
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

//
// ================= Financial Snapshot =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ReportingPeriod {
    /// Inclusive length in days.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    AccountingExport,
    ManualEntry,
}

/// Immutable normalized financial record for one entity and period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinancialSnapshot {
    pub snapshot_id: Uuid,
    pub entity_id: Uuid,
    pub period: ReportingPeriod,
    pub currency: String,
    pub revenue: Money,
    pub ebitda: Option<Money>,
    pub net_income: Option<Money>,
    pub debt: Option<Money>,
    pub cash: Option<Money>,
    pub growth_rate: Option<f64>,
    pub industry_code: Option<String>,
    pub data_completeness: f64,
    pub annualized: bool,
    pub source: SnapshotSource,
    pub created_at: DateTime<Utc>,
}

impl FinancialSnapshot {
    pub fn ebitda_margin(&self) -> Option<f64> {
        let ebitda = self.ebitda?;
        if !self.revenue.is_positive() {
            return None;
        }
        Some(ebitda.minor() as f64 / self.revenue.minor() as f64)
    }

    pub fn net_debt(&self) -> Money {
        self.debt.unwrap_or(Money::ZERO) - self.cash.unwrap_or(Money::ZERO)
    }
}

//
// ================= Peer Sets =================
//

/// Publicly traded peer used by the comparables method.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comparable {
    pub entity_id: String,
    pub industry_code: String,
    pub revenue: Money,
    /// Trading EV/EBITDA multiple.
    pub ev_to_ebitda: f64,
}

/// Closed transaction used by the precedent method.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrecedentTransaction {
    pub transaction_id: String,
    pub industry_code: String,
    pub target_revenue: Money,
    /// EV/EBITDA paid in the transaction.
    pub ev_to_ebitda: f64,
    pub closed_on: NaiveDate,
}

//
// ================= Valuation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ValuationMethod {
    Dcf,
    Comparables,
    PrecedentTransactions,
}

impl ValuationMethod {
    pub const ALL: [ValuationMethod; 3] = [
        ValuationMethod::Dcf,
        ValuationMethod::Comparables,
        ValuationMethod::PrecedentTransactions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValuationMethod::Dcf => "dcf",
            ValuationMethod::Comparables => "comparables",
            ValuationMethod::PrecedentTransactions => "precedent_transactions",
        }
    }
}

impl fmt::Display for ValuationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Low/mid/high enterprise value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValueRange {
    pub low: Money,
    pub mid: Money,
    pub high: Money,
}

impl ValueRange {
    pub fn contains(&self, value: Money) -> bool {
        self.low <= value && value <= self.high
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MethodEstimate {
    pub method: ValuationMethod,
    pub range: ValueRange,
    /// Normalized aggregation weight.
    pub weight: f64,
    /// Peers (or 1 for DCF) supporting the estimate.
    pub supporting_count: usize,
}

/// A sub-computation that was skipped or degraded, with its reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Exclusion {
    pub subject: String,
    pub reason: String,
}

impl Exclusion {
    pub fn new(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValuationResult {
    pub result_id: Uuid,
    pub snapshot_id: Uuid,
    pub entity_id: Uuid,
    pub methodology_version: String,
    pub estimates: Vec<MethodEstimate>,
    pub aggregated: ValueRange,
    pub net_debt: Money,
    pub equity_mid: Money,
    pub confidence: f64,
    pub exclusions: Vec<Exclusion>,
    pub input_fingerprint: String,
    pub generated_at: DateTime<Utc>,
}

impl ValuationResult {
    pub fn estimate(&self, method: ValuationMethod) -> Option<&MethodEstimate> {
        self.estimates.iter().find(|e| e.method == method)
    }
}

//
// ================= Risk =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn points(&self) -> f64 {
        match self {
            Severity::Low => 1.0,
            Severity::Medium => 2.0,
            Severity::High => 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskFlag {
    pub rule: String,
    pub severity: Severity,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub assessment_id: Uuid,
    pub snapshot_id: Uuid,
    pub risk_score: f64,
    pub flags: Vec<RiskFlag>,
    pub assessed_at: DateTime<Utc>,
}

//
// ================= Entities =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Deal,
    Member,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Acquire,
    Divest,
    RaiseCapital,
    Invest,
    Partner,
    Merge,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Acquire => "acquire",
            Intent::Divest => "divest",
            Intent::RaiseCapital => "raise_capital",
            Intent::Invest => "invest",
            Intent::Partner => "partner",
            Intent::Merge => "merge",
        }
    }

    /// The intent a counterparty must hold for the two to fit.
    pub fn complement(&self) -> Intent {
        match self {
            Intent::Acquire => Intent::Divest,
            Intent::Divest => Intent::Acquire,
            Intent::RaiseCapital => Intent::Invest,
            Intent::Invest => Intent::RaiseCapital,
            Intent::Partner => Intent::Partner,
            Intent::Merge => Intent::Merge,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Geography {
    pub country: Option<String>,
    pub region: Option<String>,
}

/// Entity metadata as delivered by the CRUD layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityProfile {
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub industry_code: Option<String>,
    pub revenue: Option<Money>,
    #[serde(default)]
    pub geography: Geography,
    #[serde(default)]
    pub intents: Vec<Intent>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub description: Option<String>,
}

/// Normalized structured attributes carried on every embedding record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructuredAttributes {
    pub industry_code: Option<String>,
    pub size_bucket: Option<u8>,
    pub revenue: Option<Money>,
    pub geography: Geography,
    pub intents: Vec<Intent>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingRecord {
    pub record_id: Uuid,
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub vector: Vec<f32>,
    pub source_hash: String,
    pub model_id: String,
    pub attributes: StructuredAttributes,
    /// False when the text segment is empty (no description or degraded).
    pub text_embedded: bool,
    /// True when the provider failed and the caller chose structured-only.
    pub degraded: bool,
    pub generated_at: DateTime<Utc>,
}

//
// ================= Matching =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisclosureStage {
    Anonymous,
    Teaser,
    NdaPending,
    Disclosed,
    Withdrawn,
}

impl DisclosureStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DisclosureStage::Disclosed | DisclosureStage::Withdrawn)
    }

    /// Position on the forward path; `None` for WITHDRAWN.
    pub fn ordinal(&self) -> Option<u8> {
        match self {
            DisclosureStage::Anonymous => Some(0),
            DisclosureStage::Teaser => Some(1),
            DisclosureStage::NdaPending => Some(2),
            DisclosureStage::Disclosed => Some(3),
            DisclosureStage::Withdrawn => None,
        }
    }
}

/// Side of a match pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    /// The entity the match was run for.
    Initiator,
    Counterparty,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CompatibilityBreakdown {
    pub similarity: f64,
    pub size: f64,
    pub strategic: f64,
    pub geography: f64,
}

/// One pair of entities. The pair has a single id and disclosure state no
/// matter which side runs the match; `entity_id` is the side whose run first
/// surfaced it and acts as `Party::Initiator`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchCandidate {
    pub match_id: Uuid,
    pub entity_id: Uuid,
    pub candidate_id: Uuid,
    pub similarity: f64,
    pub compatibility: f64,
    pub breakdown: CompatibilityBreakdown,
    pub disclosure: DisclosureState,
    pub candidate_generated_at: DateTime<Utc>,
    pub exclusions: Vec<Exclusion>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MatchCandidate {
    pub fn stage(&self) -> DisclosureStage {
        self.disclosure.stage
    }

    pub fn involves(&self, entity_id: Uuid) -> bool {
        self.entity_id == entity_id || self.candidate_id == entity_id
    }
}

/// Which embedding records form a candidate pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PoolSelector {
    pub entity_type: Option<EntityType>,
    /// Restrict to these entities; empty means every entity of the tenant.
    #[serde(default)]
    pub entity_ids: Vec<Uuid>,
}

impl PoolSelector {
    pub fn admits(&self, record: &EmbeddingRecord) -> bool {
        self.entity_type.map_or(true, |t| t == record.entity_type)
            && (self.entity_ids.is_empty() || self.entity_ids.contains(&record.entity_id))
    }
}

//
// ================= Persistence =================
//

/// A persisted derived artifact; older versions are kept and flagged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Versioned<T> {
    pub artifact: T,
    pub superseded: bool,
    pub recorded_at: DateTime<Utc>,
}

impl<T> Versioned<T> {
    pub fn current(artifact: T) -> Self {
        Self {
            artifact,
            superseded: false,
            recorded_at: Utc::now(),
        }
    }
}

/// Valuation and risk produced together for one snapshot.
///
/// The snapshot belongs to its entity and is stored apart from the report.
/// After the entity is deleted the report survives for audit with `snapshot`
/// empty; `valuation.snapshot_id` still names what was valued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValuationReport {
    #[serde(default)]
    pub snapshot: Option<FinancialSnapshot>,
    pub valuation: ValuationResult,
    pub risk: RiskAssessment,
}

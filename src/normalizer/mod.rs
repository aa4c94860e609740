//! Financial normalizer
//!
//! Turns heterogeneous financial inputs into an immutable `FinancialSnapshot`
//! in the reporting currency. Validation happens here, at the boundary, so the
//! valuation and risk code can trust every snapshot it receives.

pub mod currency;

pub use currency::{CurrencyConverter, StaticRateTable};

use crate::config::NormalizerConfig;
use crate::error::EngineError;
use crate::models::{FinancialSnapshot, Money, ReportingPeriod, SnapshotSource};
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Fields counted towards the completeness ratio.
const TRACKED_FIELDS: usize = 9;

const REVENUE_KEYS: &[&str] = &["revenue", "total_revenue", "sales", "net_sales", "turnover"];
const EBITDA_KEYS: &[&str] = &["ebitda", "adjusted_ebitda"];
const NET_INCOME_KEYS: &[&str] = &["net_income", "net_profit", "profit_after_tax"];
const DEBT_KEYS: &[&str] = &["total_debt", "debt", "borrowings"];
const CASH_KEYS: &[&str] = &["cash", "cash_and_equivalents", "cash_and_cash_equivalents"];
const GROWTH_KEYS: &[&str] = &["growth_rate", "revenue_growth", "yoy_growth"];

//
// ================= Raw Inputs =================
//

/// Scale of the monetary figures in a raw record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    #[default]
    Units,
    Thousands,
    Millions,
}

impl Unit {
    fn multiplier(&self) -> f64 {
        match self {
            Unit::Units => 1.0,
            Unit::Thousands => 1_000.0,
            Unit::Millions => 1_000_000.0,
        }
    }
}

/// Line items exported from an accounting system, keyed by the system's own labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountingExport {
    pub entity_id: Uuid,
    pub period: Option<ReportingPeriod>,
    pub currency: Option<String>,
    #[serde(default)]
    pub unit: Unit,
    #[serde(default)]
    pub line_items: BTreeMap<String, f64>,
    pub industry_code: Option<String>,
}

/// Figures typed in by a user; every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ManualEntry {
    pub entity_id: Uuid,
    pub period: Option<ReportingPeriod>,
    pub currency: Option<String>,
    #[serde(default)]
    pub unit: Unit,
    pub revenue: Option<f64>,
    pub ebitda: Option<f64>,
    pub net_income: Option<f64>,
    pub debt: Option<f64>,
    pub cash: Option<f64>,
    pub growth_rate: Option<f64>,
    pub industry_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RawFinancialRecord {
    AccountingExport(AccountingExport),
    ManualEntry(ManualEntry),
}

impl RawFinancialRecord {
    pub fn entity_id(&self) -> Uuid {
        match self {
            RawFinancialRecord::AccountingExport(r) => r.entity_id,
            RawFinancialRecord::ManualEntry(r) => r.entity_id,
        }
    }
}

/// Variant-independent view after alias resolution, still in raw units.
#[derive(Debug, Default)]
struct ResolvedFields {
    period: Option<ReportingPeriod>,
    currency: Option<String>,
    unit: Unit,
    revenue: Option<f64>,
    ebitda: Option<f64>,
    net_income: Option<f64>,
    debt: Option<f64>,
    cash: Option<f64>,
    growth_rate: Option<f64>,
    industry_code: Option<String>,
}

impl ResolvedFields {
    fn from_raw(raw: &RawFinancialRecord) -> Self {
        match raw {
            RawFinancialRecord::AccountingExport(r) => {
                let items: BTreeMap<String, f64> = r
                    .line_items
                    .iter()
                    .map(|(k, v)| (normalize_key(k), *v))
                    .collect();
                let pick = |keys: &[&str]| keys.iter().find_map(|k| items.get(*k).copied());

                Self {
                    period: r.period,
                    currency: r.currency.clone(),
                    unit: r.unit,
                    revenue: pick(REVENUE_KEYS),
                    ebitda: pick(EBITDA_KEYS),
                    net_income: pick(NET_INCOME_KEYS),
                    debt: pick(DEBT_KEYS),
                    cash: pick(CASH_KEYS),
                    growth_rate: pick(GROWTH_KEYS),
                    industry_code: r.industry_code.clone(),
                }
            }
            RawFinancialRecord::ManualEntry(r) => Self {
                period: r.period,
                currency: r.currency.clone(),
                unit: r.unit,
                revenue: r.revenue,
                ebitda: r.ebitda,
                net_income: r.net_income,
                debt: r.debt,
                cash: r.cash,
                growth_rate: r.growth_rate,
                industry_code: r.industry_code.clone(),
            },
        }
    }

    fn completeness(&self) -> f64 {
        let present = [
            self.revenue.is_some(),
            self.period.is_some(),
            self.currency.is_some(),
            self.ebitda.is_some(),
            self.net_income.is_some(),
            self.debt.is_some(),
            self.cash.is_some(),
            self.growth_rate.is_some(),
            self.industry_code.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count();

        present as f64 / TRACKED_FIELDS as f64
    }
}

fn normalize_key(key: &str) -> String {
    key.trim()
        .to_lowercase()
        .replace([' ', '-'], "_")
}

fn source_of(raw: &RawFinancialRecord) -> SnapshotSource {
    match raw {
        RawFinancialRecord::AccountingExport(_) => SnapshotSource::AccountingExport,
        RawFinancialRecord::ManualEntry(_) => SnapshotSource::ManualEntry,
    }
}

//
// ================= Normalizer =================
//

pub struct Normalizer {
    config: NormalizerConfig,
    converter: Arc<dyn CurrencyConverter>,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig, converter: Arc<dyn CurrencyConverter>) -> Self {
        Self { config, converter }
    }

    /// Normalize a raw record into a new snapshot.
    pub async fn normalize(&self, raw: &RawFinancialRecord) -> Result<FinancialSnapshot> {
        let fields = ResolvedFields::from_raw(raw);

        let mut missing = Vec::new();
        if fields.revenue.is_none() {
            missing.push("revenue");
        }
        if fields.period.is_none() {
            missing.push("period");
        }
        if fields.currency.as_deref().map_or(true, |c| c.trim().is_empty()) {
            missing.push("currency");
        }
        if !missing.is_empty() {
            return Err(EngineError::Normalization(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
        let (Some(revenue), Some(period), Some(currency)) =
            (fields.revenue, fields.period, fields.currency.as_deref())
        else {
            return Err(EngineError::Normalization("missing required fields".to_string()));
        };

        validate(&fields, revenue, &period)?;

        let completeness = fields.completeness();
        if completeness < self.config.min_completeness {
            return Err(EngineError::Normalization(format!(
                "data completeness {:.2} below minimum {:.2}",
                completeness, self.config.min_completeness
            )));
        }

        let reporting = self.config.reporting_currency.as_str();
        let rate = self.converter.rate(currency, reporting).await?;
        let scale = fields.unit.multiplier() * rate;

        let days = period.days();
        let annualized = days < self.config.annual_period_days;
        let flow_factor = if annualized { 365.0 / days as f64 } else { 1.0 };

        let flow = |name: &str, v: f64| to_money(name, v * scale * flow_factor);
        let balance = |name: &str, v: f64| to_money(name, v * scale);

        let snapshot = FinancialSnapshot {
            snapshot_id: Uuid::new_v4(),
            entity_id: raw.entity_id(),
            period,
            currency: reporting.to_string(),
            revenue: flow("revenue", revenue)?,
            ebitda: fields.ebitda.map(|v| flow("ebitda", v)).transpose()?,
            net_income: fields.net_income.map(|v| flow("net_income", v)).transpose()?,
            debt: fields.debt.map(|v| balance("debt", v)).transpose()?,
            cash: fields.cash.map(|v| balance("cash", v)).transpose()?,
            growth_rate: fields.growth_rate,
            industry_code: fields
                .industry_code
                .as_deref()
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty()),
            data_completeness: completeness,
            annualized,
            source: source_of(raw),
            created_at: Utc::now(),
        };

        debug!(
            entity_id = %snapshot.entity_id,
            snapshot_id = %snapshot.snapshot_id,
            completeness = snapshot.data_completeness,
            annualized,
            "Snapshot normalized"
        );

        Ok(snapshot)
    }

    /// Check a snapshot produced elsewhere before it enters valuation.
    pub fn accept_snapshot(&self, snapshot: FinancialSnapshot) -> Result<FinancialSnapshot> {
        if !snapshot
            .currency
            .eq_ignore_ascii_case(&self.config.reporting_currency)
        {
            return Err(EngineError::Normalization(format!(
                "snapshot currency {} is not the reporting currency {}",
                snapshot.currency, self.config.reporting_currency
            )));
        }
        if snapshot.period.end < snapshot.period.start {
            return Err(EngineError::Normalization("snapshot period is inverted".to_string()));
        }
        if snapshot.revenue.minor() < 0 {
            return Err(EngineError::Normalization("revenue must not be negative".to_string()));
        }
        if snapshot.growth_rate.is_some_and(|g| !g.is_finite() || g <= -1.0 || g >= 10.0) {
            return Err(EngineError::Normalization("growth rate out of range".to_string()));
        }
        if !(0.0..=1.0).contains(&snapshot.data_completeness)
            || snapshot.data_completeness < self.config.min_completeness
        {
            return Err(EngineError::Normalization(format!(
                "data completeness {:.2} below minimum {:.2}",
                snapshot.data_completeness, self.config.min_completeness
            )));
        }
        Ok(snapshot)
    }
}

fn to_money(name: &str, major: f64) -> Result<Money> {
    Money::checked_from_major(major).ok_or_else(|| {
        EngineError::Normalization(format!("{} {:e} exceeds the representable range", name, major))
    })
}

fn validate(fields: &ResolvedFields, revenue: f64, period: &ReportingPeriod) -> Result<()> {
    if period.end < period.start {
        return Err(EngineError::Normalization(format!(
            "period end {} precedes start {}",
            period.end, period.start
        )));
    }

    let numbers = [
        ("revenue", Some(revenue)),
        ("ebitda", fields.ebitda),
        ("net_income", fields.net_income),
        ("debt", fields.debt),
        ("cash", fields.cash),
        ("growth_rate", fields.growth_rate),
    ];
    for (name, value) in numbers {
        if let Some(v) = value {
            if !v.is_finite() {
                return Err(EngineError::Normalization(format!("{} is not a finite number", name)));
            }
        }
    }

    if revenue < 0.0 {
        return Err(EngineError::Normalization("revenue must not be negative".to_string()));
    }
    if fields.debt.is_some_and(|d| d < 0.0) || fields.cash.is_some_and(|c| c < 0.0) {
        return Err(EngineError::Normalization(
            "debt and cash must not be negative".to_string(),
        ));
    }
    if let Some(g) = fields.growth_rate {
        if g <= -1.0 || g >= 10.0 {
            return Err(EngineError::Normalization(format!(
                "growth rate {} outside (-1, 10); expected a ratio, not a percentage",
                g
            )));
        }
    }

    Ok(())
}

//! Valuation engine
//!
//! Three independent methods (DCF, trading comparables, precedent
//! transactions) each produce a low/mid/high range or an exclusion reason.
//! Aggregation waits for all three outcomes before producing the result.

pub mod dcf;
pub mod multiples;

use crate::config::{industry_benchmark, ValuationConfig};
use crate::error::EngineError;
use crate::fingerprint::valuation_fingerprint;
use crate::models::{
    Comparable, Exclusion, FinancialSnapshot, MethodEstimate, Money, PrecedentTransaction,
    ValuationMethod, ValuationResult, ValueRange,
};
use crate::Result;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Range produced by one method, before weighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodValue {
    pub range: ValueRange,
    pub supporting_count: usize,
}

/// Outcome of one method: a value or the error that excluded it.
pub type MethodOutcome = (ValuationMethod, Result<MethodValue>);

pub struct ValuationEngine {
    config: ValuationConfig,
}

impl ValuationEngine {
    pub fn new(config: ValuationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValuationConfig {
        &self.config
    }

    /// Value a snapshot using the industry default WACC.
    pub fn valuate(
        &self,
        snapshot: &FinancialSnapshot,
        comparables: &[Comparable],
        precedents: &[PrecedentTransaction],
    ) -> Result<ValuationResult> {
        self.valuate_with(snapshot, comparables, precedents, None)
    }

    pub fn valuate_with(
        &self,
        snapshot: &FinancialSnapshot,
        comparables: &[Comparable],
        precedents: &[PrecedentTransaction],
        wacc_override: Option<f64>,
    ) -> Result<ValuationResult> {
        let outcomes = vec![
            (ValuationMethod::Dcf, self.run_dcf(snapshot, wacc_override)),
            (
                ValuationMethod::Comparables,
                self.run_comparables(snapshot, comparables),
            ),
            (
                ValuationMethod::PrecedentTransactions,
                self.run_precedents(snapshot, precedents),
            ),
        ];

        let fingerprint = valuation_fingerprint(
            snapshot,
            &self.config.methodology_version,
            wacc_override,
            comparables,
            precedents,
        );

        self.aggregate(snapshot, outcomes, fingerprint)
    }

    /// Discount rate for a snapshot: override, else the industry default.
    pub fn discount_rate(&self, snapshot: &FinancialSnapshot, wacc_override: Option<f64>) -> f64 {
        wacc_override.unwrap_or_else(|| industry_benchmark(snapshot.industry_code.as_deref()).wacc)
    }

    pub fn run_dcf(
        &self,
        snapshot: &FinancialSnapshot,
        wacc_override: Option<f64>,
    ) -> Result<MethodValue> {
        let unavailable = |reason: String| EngineError::ValuationMethodUnavailable {
            method: ValuationMethod::Dcf,
            reason,
        };

        let wacc = self.discount_rate(snapshot, wacc_override);
        if !wacc.is_finite() || wacc <= 0.0 {
            return Err(unavailable(format!("discount rate {} is not positive", wacc)));
        }

        let growth = snapshot
            .growth_rate
            .ok_or_else(|| unavailable("growth rate missing".to_string()))?;
        let terminal = self.config.terminal_growth;
        if growth >= wacc {
            return Err(unavailable(format!(
                "growth rate {:.4} >= discount rate {:.4}; terminal value undefined",
                growth, wacc
            )));
        }
        if terminal >= wacc {
            return Err(unavailable(format!(
                "terminal growth {:.4} >= discount rate {:.4}",
                terminal, wacc
            )));
        }

        let ebitda = snapshot
            .ebitda
            .ok_or_else(|| unavailable("EBITDA missing".to_string()))?;
        let base_fcf = ebitda.scale(self.config.fcf_conversion);
        if !base_fcf.is_positive() {
            return Err(unavailable(format!("base free cash flow {} is not positive", base_fcf)));
        }

        let horizon = self.config.horizon_periods;
        let value_at = |rate: f64| {
            dcf::enterprise_value(base_fcf, growth, terminal, horizon, rate)
                .map(|b| b.enterprise_value)
                .ok_or_else(|| unavailable(format!("terminal value undefined at {:.4}", rate)))
        };

        let mid = value_at(wacc)?;
        let low = value_at(wacc + self.config.wacc_spread)?;
        let high_rate = if wacc - self.config.wacc_spread > terminal {
            wacc - self.config.wacc_spread
        } else {
            (wacc + terminal) / 2.0
        };
        let high = value_at(high_rate)?;

        debug!(
            snapshot_id = %snapshot.snapshot_id,
            wacc,
            growth,
            mid = %mid,
            "DCF computed"
        );

        Ok(MethodValue {
            range: ValueRange { low, mid, high },
            supporting_count: 1,
        })
    }

    pub fn run_comparables(
        &self,
        snapshot: &FinancialSnapshot,
        comparables: &[Comparable],
    ) -> Result<MethodValue> {
        let ebitda = positive_ebitda(snapshot, ValuationMethod::Comparables)?;
        let selected = multiples::select_peers(snapshot, comparables, self.config.revenue_band);
        if selected.len() < self.config.min_comparables {
            return Err(EngineError::InsufficientComparables {
                found: selected.len(),
                required: self.config.min_comparables,
            });
        }

        let range = multiples::range_from_multiples(ebitda, &selected).ok_or_else(|| {
            EngineError::InsufficientComparables {
                found: 0,
                required: self.config.min_comparables,
            }
        })?;

        Ok(MethodValue {
            range,
            supporting_count: selected.len(),
        })
    }

    pub fn run_precedents(
        &self,
        snapshot: &FinancialSnapshot,
        precedents: &[PrecedentTransaction],
    ) -> Result<MethodValue> {
        let ebitda = positive_ebitda(snapshot, ValuationMethod::PrecedentTransactions)?;
        let selected = multiples::select_peers(snapshot, precedents, self.config.revenue_band);
        if selected.len() < self.config.min_precedents {
            return Err(EngineError::InsufficientPrecedents {
                found: selected.len(),
                required: self.config.min_precedents,
            });
        }

        let range = multiples::range_from_multiples(ebitda, &selected).ok_or_else(|| {
            EngineError::InsufficientPrecedents {
                found: 0,
                required: self.config.min_precedents,
            }
        })?;

        Ok(MethodValue {
            range,
            supporting_count: selected.len(),
        })
    }

    /// Combine method outcomes. Fails only when every method was excluded
    /// or a non method-level error is present.
    pub fn aggregate(
        &self,
        snapshot: &FinancialSnapshot,
        outcomes: Vec<MethodOutcome>,
        input_fingerprint: String,
    ) -> Result<ValuationResult> {
        let mut included: Vec<(ValuationMethod, MethodValue)> = Vec::with_capacity(3);
        let mut exclusions = Vec::new();

        for (method, outcome) in outcomes {
            match outcome {
                Ok(value) => included.push((method, value)),
                Err(e) if e.is_method_level() => {
                    warn!(
                        snapshot_id = %snapshot.snapshot_id,
                        method = %method,
                        reason = %e,
                        "Valuation method excluded"
                    );
                    exclusions.push(Exclusion::new(method.as_str(), e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        if included.is_empty() {
            return Err(EngineError::ValuationExhausted { exclusions });
        }

        let raw_weights: Vec<f64> = included
            .iter()
            .map(|(method, value)| match method {
                ValuationMethod::Dcf => 1.0,
                _ => value.supporting_count as f64,
            })
            .collect();
        let total_weight: f64 = raw_weights.iter().sum();

        let estimates: Vec<MethodEstimate> = included
            .iter()
            .zip(&raw_weights)
            .map(|((method, value), w)| MethodEstimate {
                method: *method,
                range: value.range,
                weight: w / total_weight,
                supporting_count: value.supporting_count,
            })
            .collect();

        let low = estimates.iter().map(|e| e.range.low).min().unwrap_or(Money::ZERO);
        let high = estimates.iter().map(|e| e.range.high).max().unwrap_or(Money::ZERO);
        let weighted_mid: f64 = estimates
            .iter()
            .map(|e| e.weight * e.range.mid.minor() as f64)
            .sum();
        let mid = Money(weighted_mid.round() as i64).clamp(low, high);

        let mids: Vec<f64> = estimates.iter().map(|e| e.range.mid.minor() as f64).collect();
        let confidence = confidence_score(snapshot.data_completeness, estimates.len(), &mids);

        let net_debt = snapshot.net_debt();
        let result = ValuationResult {
            result_id: Uuid::new_v4(),
            snapshot_id: snapshot.snapshot_id,
            entity_id: snapshot.entity_id,
            methodology_version: self.config.methodology_version.clone(),
            estimates,
            aggregated: ValueRange { low, mid, high },
            net_debt,
            equity_mid: mid - net_debt,
            confidence,
            exclusions,
            input_fingerprint,
            generated_at: Utc::now(),
        };

        info!(
            snapshot_id = %snapshot.snapshot_id,
            methods = result.estimates.len(),
            excluded = result.exclusions.len(),
            mid = %result.aggregated.mid,
            confidence = result.confidence,
            "Valuation aggregated"
        );

        Ok(result)
    }
}

fn positive_ebitda(snapshot: &FinancialSnapshot, method: ValuationMethod) -> Result<Money> {
    match snapshot.ebitda {
        Some(e) if e.is_positive() => Ok(e),
        Some(e) => Err(EngineError::ValuationMethodUnavailable {
            method,
            reason: format!("EBITDA {} is not positive", e),
        }),
        None => Err(EngineError::ValuationMethodUnavailable {
            method,
            reason: "EBITDA missing".to_string(),
        }),
    }
}

/// completeness × (included / 3) × clamp(1 − CV of mids).
pub fn confidence_score(completeness: f64, included: usize, mids: &[f64]) -> f64 {
    let method_share = included.min(3) as f64 / 3.0;

    let agreement = if mids.len() < 2 {
        1.0
    } else {
        let n = mids.len() as f64;
        let mean = mids.iter().sum::<f64>() / n;
        if mean <= 0.0 {
            0.0
        } else {
            let variance = mids.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n;
            (1.0 - variance.sqrt() / mean).clamp(0.0, 1.0)
        }
    };

    (completeness.clamp(0.0, 1.0) * method_share * agreement).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReportingPeriod, SnapshotSource};
    use chrono::NaiveDate;

    fn engine() -> ValuationEngine {
        ValuationEngine::new(ValuationConfig::default())
    }

    /// Revenue $10M, EBITDA $2M, growth 5%.
    fn scenario_snapshot() -> FinancialSnapshot {
        FinancialSnapshot {
            snapshot_id: Uuid::new_v4(),
            entity_id: Uuid::new_v4(),
            period: ReportingPeriod {
                start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
            },
            currency: "USD".to_string(),
            revenue: Money::from_major(10_000_000.0),
            ebitda: Some(Money::from_major(2_000_000.0)),
            net_income: Some(Money::from_major(1_100_000.0)),
            debt: Some(Money::from_major(4_000_000.0)),
            cash: Some(Money::from_major(1_000_000.0)),
            growth_rate: Some(0.05),
            industry_code: Some("SOFTWARE".to_string()),
            data_completeness: 1.0,
            annualized: false,
            source: SnapshotSource::ManualEntry,
            created_at: Utc::now(),
        }
    }

    fn comparables(multiples: &[f64]) -> Vec<Comparable> {
        multiples
            .iter()
            .enumerate()
            .map(|(i, m)| Comparable {
                entity_id: format!("peer-{i}"),
                industry_code: "SOFTWARE".to_string(),
                revenue: Money::from_major(9_000_000.0 + i as f64 * 500_000.0),
                ev_to_ebitda: *m,
            })
            .collect()
    }

    fn precedents(multiples: &[f64]) -> Vec<PrecedentTransaction> {
        multiples
            .iter()
            .enumerate()
            .map(|(i, m)| PrecedentTransaction {
                transaction_id: format!("deal-{i}"),
                industry_code: "SOFTWARE".to_string(),
                target_revenue: Money::from_major(11_000_000.0),
                ev_to_ebitda: *m,
                closed_on: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
            })
            .collect()
    }

    #[test]
    fn comparables_scenario_is_median_times_ebitda() {
        let snapshot = scenario_snapshot();
        let value = engine()
            .run_comparables(&snapshot, &comparables(&[8.0, 9.0, 10.0]))
            .unwrap();
        assert_eq!(value.range.mid, Money::from_major(18_000_000.0));
        assert_eq!(value.supporting_count, 3);
    }

    #[test]
    fn scenario_with_wacc_ten_percent() {
        let snapshot = scenario_snapshot();
        let result = engine()
            .valuate_with(&snapshot, &comparables(&[8.0, 9.0, 10.0]), &[], Some(0.10))
            .unwrap();

        let comps = result.estimate(ValuationMethod::Comparables).unwrap();
        assert_eq!(comps.range.mid, Money::from_major(18_000_000.0));
        assert!(result.estimate(ValuationMethod::Dcf).is_some());
        assert_eq!(result.exclusions.len(), 1);
        assert_eq!(result.exclusions[0].subject, "precedent_transactions");

        // Weights: DCF 1, comparables 3.
        assert!((comps.weight - 0.75).abs() < 1e-12);
        assert!(result.confidence > 0.0 && result.confidence <= 2.0 / 3.0);
        assert_eq!(result.net_debt, Money::from_major(3_000_000.0));
        assert_eq!(result.equity_mid, result.aggregated.mid - result.net_debt);
    }

    #[test]
    fn dcf_is_deterministic() {
        let snapshot = scenario_snapshot();
        let a = engine().run_dcf(&snapshot, Some(0.10)).unwrap();
        let b = engine().run_dcf(&snapshot.clone(), Some(0.10)).unwrap();
        assert_eq!(a, b);

        let full_a = engine()
            .valuate_with(&snapshot, &comparables(&[8.0, 9.0, 10.0]), &[], Some(0.10))
            .unwrap();
        let mut reordered = comparables(&[8.0, 9.0, 10.0]);
        reordered.reverse();
        let full_b = engine()
            .valuate_with(&snapshot, &reordered, &[], Some(0.10))
            .unwrap();
        assert_eq!(full_a.aggregated, full_b.aggregated);
        assert_eq!(full_a.estimates, full_b.estimates);
        assert_eq!(full_a.input_fingerprint, full_b.input_fingerprint);
    }

    #[test]
    fn dcf_range_is_ordered() {
        let value = engine().run_dcf(&scenario_snapshot(), Some(0.10)).unwrap();
        assert!(value.range.low < value.range.mid);
        assert!(value.range.mid < value.range.high);
    }

    #[test]
    fn dcf_excluded_when_growth_reaches_discount_rate() {
        let mut snapshot = scenario_snapshot();
        snapshot.growth_rate = Some(0.12);

        let err = engine().run_dcf(&snapshot, Some(0.10)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ValuationMethodUnavailable { method: ValuationMethod::Dcf, .. }
        ));

        let result = engine()
            .valuate_with(&snapshot, &comparables(&[8.0, 9.0, 10.0]), &[], Some(0.10))
            .unwrap();
        assert!(result.estimate(ValuationMethod::Dcf).is_none());
        assert!(result.exclusions.iter().any(|e| e.subject == "dcf"));
    }

    #[test]
    fn too_few_peers_are_method_level() {
        let snapshot = scenario_snapshot();
        let err = engine()
            .run_comparables(&snapshot, &comparables(&[8.0, 9.0]))
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientComparables { found: 2, required: 3 }));

        let err = engine().run_precedents(&snapshot, &precedents(&[7.0])).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientPrecedents { found: 1, required: 2 }));
        assert!(err.is_method_level());
    }

    #[test]
    fn aggregated_mid_lies_within_method_ranges() {
        let snapshot = scenario_snapshot();
        let result = engine()
            .valuate_with(
                &snapshot,
                &comparables(&[6.0, 9.0, 14.0]),
                &precedents(&[7.5, 12.0]),
                Some(0.10),
            )
            .unwrap();

        assert_eq!(result.estimates.len(), 3);
        let min_low = result.estimates.iter().map(|e| e.range.low).min().unwrap();
        let max_high = result.estimates.iter().map(|e| e.range.high).max().unwrap();
        assert_eq!(result.aggregated.low, min_low);
        assert_eq!(result.aggregated.high, max_high);
        assert!(result.aggregated.contains(result.aggregated.mid));

        let weight_sum: f64 = result.estimates.iter().map(|e| e.weight).sum();
        assert!((weight_sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn confidence_drops_with_fewer_methods() {
        let mids = [18.0, 18.0, 18.0];
        let three = confidence_score(0.9, 3, &mids);
        let two = confidence_score(0.9, 2, &mids[..2]);
        let one = confidence_score(0.9, 1, &mids[..1]);
        assert!(three > two && two > one);
        assert!((0.0..=1.0).contains(&three));
        assert!((one - 0.3).abs() < 1e-12);
    }

    #[test]
    fn confidence_is_clamped_when_methods_disagree() {
        let score = confidence_score(1.0, 3, &[1.0, 1.0, 100.0]);
        assert!((0.0..=1.0).contains(&score));
        assert_eq!(confidence_score(1.0, 2, &[-5.0, 1.0]), 0.0);
    }

    #[test]
    fn all_methods_excluded_is_fatal() {
        let mut snapshot = scenario_snapshot();
        snapshot.ebitda = None;

        let err = engine().valuate(&snapshot, &[], &[]).unwrap_err();
        match err {
            EngineError::ValuationExhausted { exclusions } => assert_eq!(exclusions.len(), 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

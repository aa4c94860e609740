//! Risk assessor
//!
//! Rules-based scoring of a financial snapshot against industry benchmarks.
//! Pure and deterministic: no I/O, no clock reads beyond the assessment stamp.

use crate::config::industry_benchmark;
use crate::models::{FinancialSnapshot, RiskAssessment, RiskFlag, Severity};
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

/// Inputs visible to every rule.
pub struct RiskContext<'a> {
    pub snapshot: &'a FinancialSnapshot,
    /// Prior snapshot of the same entity, for trend rules.
    pub previous: Option<&'a FinancialSnapshot>,
}

/// A single risk rule
pub trait RiskRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Relative weight in the aggregate score.
    fn weight(&self) -> f64 {
        1.0
    }

    /// `None` when the rule does not fire.
    fn evaluate(&self, ctx: &RiskContext<'_>) -> Option<(Severity, String)>;
}

pub struct RiskAssessor {
    rules: Vec<Box<dyn RiskRule>>,
}

impl RiskAssessor {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Assessor with the standard rule set.
    pub fn standard() -> Self {
        let mut assessor = Self::new();
        assessor.add_rule(Box::new(LeverageRule));
        assessor.add_rule(Box::new(GrowthTrendRule));
        assessor.add_rule(Box::new(DataCompletenessRule));
        assessor.add_rule(Box::new(MarginVolatilityRule));
        assessor
    }

    pub fn add_rule(&mut self, rule: Box<dyn RiskRule>) {
        self.rules.push(rule);
    }

    pub fn assess(&self, snapshot: &FinancialSnapshot) -> RiskAssessment {
        self.assess_with_history(snapshot, None)
    }

    pub fn assess_with_history(
        &self,
        snapshot: &FinancialSnapshot,
        previous: Option<&FinancialSnapshot>,
    ) -> RiskAssessment {
        let ctx = RiskContext { snapshot, previous };

        let mut flags = Vec::new();
        let mut scored = 0.0;
        let mut max_possible = 0.0;

        for rule in &self.rules {
            let weight = rule.weight().max(0.0);
            max_possible += weight * Severity::High.points();

            if let Some((severity, rationale)) = rule.evaluate(&ctx) {
                scored += weight * severity.points();
                flags.push(RiskFlag {
                    rule: rule.name().to_string(),
                    severity,
                    rationale,
                });
            }
        }

        // Most severe first, ties by rule name.
        flags.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.rule.cmp(&b.rule)));

        let risk_score = if max_possible > 0.0 {
            (scored / max_possible).clamp(0.0, 1.0)
        } else {
            0.0
        };

        debug!(
            snapshot_id = %snapshot.snapshot_id,
            rule_count = self.rules.len(),
            flags = flags.len(),
            risk_score,
            "Risk assessed"
        );

        RiskAssessment {
            assessment_id: Uuid::new_v4(),
            snapshot_id: snapshot.snapshot_id,
            risk_score,
            flags,
            assessed_at: Utc::now(),
        }
    }
}

impl Default for RiskAssessor {
    fn default() -> Self {
        Self::standard()
    }
}

//
// ========== Rules ==========
//

/// Debt / EBITDA against the industry ceiling.
pub struct LeverageRule;

impl RiskRule for LeverageRule {
    fn name(&self) -> &'static str {
        "leverage"
    }

    fn weight(&self) -> f64 {
        1.5
    }

    fn evaluate(&self, ctx: &RiskContext<'_>) -> Option<(Severity, String)> {
        let s = ctx.snapshot;
        let debt = s.debt.filter(|d| d.is_positive())?;

        let ebitda = match s.ebitda {
            Some(e) if e.is_positive() => e,
            _ => {
                return Some((
                    Severity::High,
                    format!("debt of {} against non-positive or missing EBITDA", debt),
                ))
            }
        };

        let ceiling = industry_benchmark(s.industry_code.as_deref()).max_leverage;
        let leverage = debt.minor() as f64 / ebitda.minor() as f64;

        let severity = if leverage > ceiling * 1.5 {
            Severity::High
        } else if leverage > ceiling {
            Severity::Medium
        } else {
            return None;
        };

        Some((
            severity,
            format!("debt/EBITDA {:.2}x exceeds industry ceiling {:.2}x", leverage, ceiling),
        ))
    }
}

pub struct GrowthTrendRule;

impl RiskRule for GrowthTrendRule {
    fn name(&self) -> &'static str {
        "growth_trend"
    }

    fn evaluate(&self, ctx: &RiskContext<'_>) -> Option<(Severity, String)> {
        let growth = ctx.snapshot.growth_rate?;

        if growth <= -0.10 {
            return Some((Severity::High, format!("revenue contracting at {:.1}%", growth * 100.0)));
        }
        if growth < 0.0 {
            return Some((Severity::Medium, format!("revenue declining at {:.1}%", growth * 100.0)));
        }

        let previous = ctx.previous.and_then(|p| p.growth_rate)?;
        if growth < previous {
            return Some((
                Severity::Low,
                format!(
                    "growth slowed from {:.1}% to {:.1}%",
                    previous * 100.0,
                    growth * 100.0
                ),
            ));
        }

        None
    }
}

pub struct DataCompletenessRule;

impl RiskRule for DataCompletenessRule {
    fn name(&self) -> &'static str {
        "data_completeness"
    }

    fn weight(&self) -> f64 {
        0.5
    }

    fn evaluate(&self, ctx: &RiskContext<'_>) -> Option<(Severity, String)> {
        let completeness = ctx.snapshot.data_completeness;
        let severity = if completeness < 0.6 {
            Severity::Medium
        } else if completeness < 0.8 {
            Severity::Low
        } else {
            return None;
        };

        Some((
            severity,
            format!("only {:.0}% of tracked financial fields present", completeness * 100.0),
        ))
    }
}

/// EBITDA margin deviation from the industry benchmark.
pub struct MarginVolatilityRule;

impl RiskRule for MarginVolatilityRule {
    fn name(&self) -> &'static str {
        "margin_volatility"
    }

    fn evaluate(&self, ctx: &RiskContext<'_>) -> Option<(Severity, String)> {
        let margin = ctx.snapshot.ebitda_margin()?;
        let benchmark = industry_benchmark(ctx.snapshot.industry_code.as_deref());
        if benchmark.ebitda_margin <= 0.0 {
            return None;
        }

        let deviation = (margin - benchmark.ebitda_margin).abs() / benchmark.ebitda_margin;
        let severity = if deviation > benchmark.margin_tolerance * 2.0 {
            Severity::High
        } else if deviation > benchmark.margin_tolerance {
            Severity::Medium
        } else {
            return None;
        };

        Some((
            severity,
            format!(
                "EBITDA margin {:.1}% vs industry {:.1}% ({:.0}% deviation)",
                margin * 100.0,
                benchmark.ebitda_margin * 100.0,
                deviation * 100.0
            ),
        ))
    }
}

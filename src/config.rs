//! Process settings and engine tunables
//!
//! `Settings` is read from the environment (after `dotenv`), `EngineConfig`
//! carries every numeric knob with the platform defaults.

use crate::error::EngineError;
use crate::Result;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

pub const METHODOLOGY_VERSION: &str = "valuation-v1";

//
// ================= Settings =================
//

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub gemini_api_key: Option<String>,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub api_port: u16,
    pub reporting_currency: String,
    pub provider_timeout_secs: u64,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let api_port = env::var("PORT")
            .or_else(|_| env::var("API_PORT"))
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .map_err(|e| EngineError::InvalidInput(format!("invalid PORT: {}", e)))?;

        Ok(Self {
            database_url: env::var("POSTGRES_URL")
                .or_else(|_| env::var("DATABASE_URL"))
                .ok(),
            gemini_api_key: env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty()),
            embedding_model: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-004".to_string()),
            embedding_dimension: env::var("EMBEDDING_DIMENSION")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(768),
            api_port,
            reporting_currency: env::var("REPORTING_CURRENCY")
                .unwrap_or_else(|_| "USD".to_string())
                .to_uppercase(),
            provider_timeout_secs: env::var("PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.normalizer.reporting_currency = self.reporting_currency.clone();
        config.retry.timeout = Duration::from_secs(self.provider_timeout_secs);
        config
    }
}

//
// ================= Engine Config =================
//

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub normalizer: NormalizerConfig,
    pub valuation: ValuationConfig,
    pub embedding: EmbeddingConfig,
    pub matching: MatchingConfig,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub reporting_currency: String,
    /// Snapshots below this completeness ratio are rejected.
    pub min_completeness: f64,
    /// Periods shorter than this are annualized.
    pub annual_period_days: i64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            reporting_currency: "USD".to_string(),
            min_completeness: 0.5,
            annual_period_days: 360,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValuationConfig {
    pub methodology_version: String,
    pub horizon_periods: u32,
    pub terminal_growth: f64,
    /// Share of EBITDA converted to free cash flow.
    pub fcf_conversion: f64,
    /// WACC sensitivity used for the DCF low/high bounds.
    pub wacc_spread: f64,
    /// Peers qualify within ±band of the snapshot revenue.
    pub revenue_band: f64,
    pub min_comparables: usize,
    pub min_precedents: usize,
}

impl Default for ValuationConfig {
    fn default() -> Self {
        Self {
            methodology_version: METHODOLOGY_VERSION.to_string(),
            horizon_periods: 5,
            terminal_growth: 0.025,
            fcf_conversion: 0.6,
            wacc_spread: 0.01,
            revenue_band: 0.5,
            min_comparables: 3,
            min_precedents: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub structured_weight: f32,
    pub text_weight: f32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            structured_weight: 0.5,
            text_weight: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub top_k: usize,
    /// ANONYMOUS → TEASER happens above this compatibility.
    pub teaser_threshold: f64,
    pub default_weights: MatchWeights,
    /// Relative size delta is capped before inversion.
    pub size_delta_cap: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            top_k: 50,
            teaser_threshold: 0.7,
            default_weights: MatchWeights::default(),
            size_delta_cap: 9.0,
        }
    }
}

/// Compatibility factor weights, configurable per tenant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MatchWeights {
    pub similarity: f64,
    pub size: f64,
    pub strategic: f64,
    pub geography: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            similarity: 0.4,
            size: 0.2,
            strategic: 0.3,
            geography: 0.1,
        }
    }
}

impl MatchWeights {
    /// Validate and rescale so the weights sum to 1.
    pub fn normalized(self) -> Result<Self> {
        let parts = [self.similarity, self.size, self.strategic, self.geography];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EngineError::InvalidInput(
                "match weights must be finite and non-negative".to_string(),
            ));
        }

        let total: f64 = parts.iter().sum();
        if total <= 0.0 {
            return Err(EngineError::InvalidInput(
                "match weights must not all be zero".to_string(),
            ));
        }

        Ok(Self {
            similarity: self.similarity / total,
            size: self.size / total,
            strategic: self.strategic / total,
            geography: self.geography / total,
        })
    }
}

/// Timeout and retry policy for external provider calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 1,
            backoff_base: Duration::from_millis(250),
        }
    }
}

//
// ================= Industry Benchmarks =================
//

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndustryBenchmark {
    pub wacc: f64,
    /// Debt/EBITDA above this is flagged.
    pub max_leverage: f64,
    pub ebitda_margin: f64,
    /// Relative margin deviation tolerated before flagging.
    pub margin_tolerance: f64,
}

const DEFAULT_BENCHMARK: IndustryBenchmark = IndustryBenchmark {
    wacc: 0.10,
    max_leverage: 3.5,
    ebitda_margin: 0.18,
    margin_tolerance: 0.5,
};

lazy_static! {
    static ref INDUSTRY_BENCHMARKS: HashMap<&'static str, IndustryBenchmark> = {
        let mut m = HashMap::new();
        m.insert("SOFTWARE", IndustryBenchmark { wacc: 0.11, max_leverage: 3.0, ebitda_margin: 0.25, margin_tolerance: 0.6 });
        m.insert("MANUFACTURING", IndustryBenchmark { wacc: 0.09, max_leverage: 3.5, ebitda_margin: 0.14, margin_tolerance: 0.4 });
        m.insert("HEALTHCARE", IndustryBenchmark { wacc: 0.095, max_leverage: 4.0, ebitda_margin: 0.17, margin_tolerance: 0.5 });
        m.insert("RETAIL", IndustryBenchmark { wacc: 0.085, max_leverage: 2.5, ebitda_margin: 0.08, margin_tolerance: 0.5 });
        m.insert("PROFESSIONAL_SERVICES", IndustryBenchmark { wacc: 0.10, max_leverage: 2.5, ebitda_margin: 0.15, margin_tolerance: 0.5 });
        m.insert("CONSTRUCTION", IndustryBenchmark { wacc: 0.105, max_leverage: 3.0, ebitda_margin: 0.10, margin_tolerance: 0.5 });
        m
    };
}

/// Benchmark for an industry code, falling back to the cross-industry default.
pub fn industry_benchmark(industry_code: Option<&str>) -> IndustryBenchmark {
    industry_code
        .and_then(|code| INDUSTRY_BENCHMARKS.get(code.trim().to_uppercase().as_str()))
        .copied()
        .unwrap_or(DEFAULT_BENCHMARK)
}

//! Currency conversion capability used by the normalizer

use crate::error::EngineError;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Exchange-rate lookup. May hit the network, hence async.
#[async_trait]
pub trait CurrencyConverter: Send + Sync {
    /// Units of `to` per one unit of `from`.
    async fn rate(&self, from: &str, to: &str) -> Result<f64>;
}

/// Fixed rate table quoted against USD.
#[derive(Debug, Clone)]
pub struct StaticRateTable {
    usd_per_unit: HashMap<String, f64>,
}

impl StaticRateTable {
    pub fn empty() -> Self {
        let mut usd_per_unit = HashMap::new();
        usd_per_unit.insert("USD".to_string(), 1.0);
        Self { usd_per_unit }
    }

    pub fn with_rate(mut self, code: &str, usd_per_unit: f64) -> Self {
        self.usd_per_unit
            .insert(code.trim().to_uppercase(), usd_per_unit);
        self
    }

    fn usd_rate(&self, code: &str) -> Result<f64> {
        self.usd_per_unit
            .get(code.trim().to_uppercase().as_str())
            .copied()
            .filter(|r| r.is_finite() && *r > 0.0)
            .ok_or_else(|| {
                EngineError::Normalization(format!("no exchange rate for currency '{}'", code))
            })
    }
}

impl Default for StaticRateTable {
    fn default() -> Self {
        Self::empty()
            .with_rate("EUR", 1.08)
            .with_rate("GBP", 1.27)
            .with_rate("CHF", 1.12)
            .with_rate("CAD", 0.73)
            .with_rate("AUD", 0.66)
            .with_rate("JPY", 0.0067)
    }
}

#[async_trait]
impl CurrencyConverter for StaticRateTable {
    async fn rate(&self, from: &str, to: &str) -> Result<f64> {
        if from.eq_ignore_ascii_case(to) {
            return Ok(1.0);
        }
        Ok(self.usd_rate(from)? / self.usd_rate(to)?)
    }
}

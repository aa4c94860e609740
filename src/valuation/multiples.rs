//! Peer selection and multiple-based valuation
//!
//! Shared by the trading comparables and precedent transaction methods; the
//! two differ only in where the multiples come from.

use crate::models::{Comparable, FinancialSnapshot, Money, PrecedentTransaction, ValueRange};

/// A peer that contributes an EV/EBITDA multiple.
pub trait PeerMultiple {
    fn industry_code(&self) -> &str;
    fn revenue(&self) -> Money;
    fn multiple(&self) -> f64;
}

impl PeerMultiple for Comparable {
    fn industry_code(&self) -> &str {
        &self.industry_code
    }

    fn revenue(&self) -> Money {
        self.revenue
    }

    fn multiple(&self) -> f64 {
        self.ev_to_ebitda
    }
}

impl PeerMultiple for PrecedentTransaction {
    fn industry_code(&self) -> &str {
        &self.industry_code
    }

    fn revenue(&self) -> Money {
        self.target_revenue
    }

    fn multiple(&self) -> f64 {
        self.ev_to_ebitda
    }
}

/// Peers in the snapshot's industry whose revenue is within ±`band` of the snapshot's.
pub fn select_peers<'a, P: PeerMultiple>(
    snapshot: &FinancialSnapshot,
    peers: &'a [P],
    band: f64,
) -> Vec<&'a P> {
    let Some(industry) = snapshot.industry_code.as_deref() else {
        return Vec::new();
    };
    let low = snapshot.revenue.scale(1.0 - band);
    let high = snapshot.revenue.scale(1.0 + band);

    peers
        .iter()
        .filter(|p| p.industry_code().trim().eq_ignore_ascii_case(industry))
        .filter(|p| low <= p.revenue() && p.revenue() <= high)
        .filter(|p| p.multiple().is_finite() && p.multiple() > 0.0)
        .collect()
}

pub fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    }
}

/// Median multiple × EBITDA, bounded by the lowest and highest multiple.
pub fn range_from_multiples<P: PeerMultiple>(ebitda: Money, peers: &[&P]) -> Option<ValueRange> {
    let mut multiples: Vec<f64> = peers.iter().map(|p| p.multiple()).collect();
    multiples.sort_by(|a, b| a.total_cmp(b));

    let mid = median(&multiples)?;
    let low = *multiples.first()?;
    let high = *multiples.last()?;

    Some(ValueRange {
        low: ebitda.scale(low),
        mid: ebitda.scale(mid),
        high: ebitda.scale(high),
    })
}

//! Discounted cash flow
//!
//! Cash flows are rounded into minor units every period so the result is
//! identical across runs and machines.

use crate::models::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcfBreakdown {
    pub pv_cash_flows: Money,
    pub pv_terminal: Money,
    pub enterprise_value: Money,
}

/// Growth for period `t` (1-based), decaying linearly from `initial` to `terminal`.
pub fn growth_for_period(initial: f64, terminal: f64, t: u32, horizon: u32) -> f64 {
    let progress = t as f64 / horizon.max(1) as f64;
    initial + (terminal - initial) * progress
}

/// Enterprise value, or `None` when the terminal value is undefined.
pub fn enterprise_value(
    base_fcf: Money,
    growth: f64,
    terminal_growth: f64,
    horizon: u32,
    wacc: f64,
) -> Option<DcfBreakdown> {
    if horizon == 0 || wacc <= terminal_growth || wacc <= -1.0 {
        return None;
    }

    let mut fcf = base_fcf;
    let mut pv_cash_flows = Money::ZERO;
    for t in 1..=horizon {
        fcf = fcf.scale(1.0 + growth_for_period(growth, terminal_growth, t, horizon));
        let discount = (1.0 + wacc).powi(t as i32);
        pv_cash_flows = pv_cash_flows + fcf.scale(1.0 / discount);
    }

    // Gordon growth on the final projected cash flow.
    let terminal = fcf.scale((1.0 + terminal_growth) / (wacc - terminal_growth));
    let pv_terminal = terminal.scale(1.0 / (1.0 + wacc).powi(horizon as i32));

    Some(DcfBreakdown {
        pv_cash_flows,
        pv_terminal,
        enterprise_value: pv_cash_flows + pv_terminal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_decays_to_terminal() {
        assert!((growth_for_period(0.05, 0.025, 5, 5) - 0.025).abs() < 1e-12);
        assert!((growth_for_period(0.05, 0.025, 1, 5) - 0.045).abs() < 1e-12);
    }

    #[test]
    fn no_growth_perpetuity_matches_closed_form() {
        // g = 0 everywhere: EV = FCF / r
        let breakdown = enterprise_value(Money::from_major(1_000_000.0), 0.0, 0.0, 5, 0.10).unwrap();
        let expected = Money::from_major(10_000_000.0);
        assert!((breakdown.enterprise_value.minor() - expected.minor()).abs() <= 5);
    }

    #[test]
    fn undefined_terminal_value() {
        assert!(enterprise_value(Money::from_major(1.0), 0.05, 0.10, 5, 0.10).is_none());
        assert!(enterprise_value(Money::from_major(1.0), 0.05, 0.02, 0, 0.10).is_none());
    }

    #[test]
    fn lower_discount_rate_means_higher_value() {
        let fcf = Money::from_major(1_200_000.0);
        let at_9 = enterprise_value(fcf, 0.05, 0.025, 5, 0.09).unwrap();
        let at_10 = enterprise_value(fcf, 0.05, 0.025, 5, 0.10).unwrap();
        let at_11 = enterprise_value(fcf, 0.05, 0.025, 5, 0.11).unwrap();
        assert!(at_9.enterprise_value > at_10.enterprise_value);
        assert!(at_10.enterprise_value > at_11.enterprise_value);
    }
}

//! Pair-position arithmetic and the `should_buy_more` gate.
//!
//! `hypo_buy` projects a position forward without mutating it, the way
//! a VWAP fill-averaging accumulator separates quantity/cost tracking
//! from average-price reads. `should_buy_more` walks six rejection
//! reasons in a fixed precedence order, checked against that
//! projection rather than the current position.

use super::types::{Fill, Side};

/// Per-market YES/NO inventory: shares bought and quote spent on each leg.
///
/// Created empty at market attachment, mutated only through [`apply_fill`],
/// dropped with the owning trading engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairPosition {
    pub fee_rate: f64,
    pub q_yes: f64,
    pub q_no: f64,
    pub c_yes: f64,
    pub c_no: f64,
}

impl PairPosition {
    pub fn new(fee_rate: f64) -> Self {
        Self {
            fee_rate,
            q_yes: 0.0,
            q_no: 0.0,
            c_yes: 0.0,
            c_no: 0.0,
        }
    }

    pub fn total_cost(&self) -> f64 {
        self.c_yes + self.c_no
    }

    pub fn q_min(&self) -> f64 {
        self.q_yes.min(self.q_no)
    }

    pub fn payout_net(&self) -> f64 {
        self.q_min() * (1.0 - self.fee_rate)
    }

    pub fn guaranteed_pnl(&self) -> f64 {
        self.payout_net() - self.total_cost()
    }

    pub fn avg_yes(&self) -> Option<f64> {
        (self.q_yes > 0.0).then(|| self.c_yes / self.q_yes)
    }

    pub fn avg_no(&self) -> Option<f64> {
        (self.q_no > 0.0).then(|| self.c_no / self.q_no)
    }

    pub fn pair_cost_avg(&self) -> Option<f64> {
        match (self.avg_yes(), self.avg_no()) {
            (Some(y), Some(n)) => Some(y + n),
            _ => None,
        }
    }

    pub fn leg_imbalance_quote(&self) -> f64 {
        (self.c_yes - self.c_no).abs()
    }

    pub fn leg_imbalance_shares(&self) -> f64 {
        (self.q_yes - self.q_no).abs()
    }

    /// Mutates the receiver to reflect an executed fill. Monotone
    /// non-decreasing on the touched leg.
    pub fn apply_fill(&mut self, fill: Fill) {
        let cost = fill.qty * fill.price;
        match fill.side {
            Side::Yes => {
                self.q_yes += fill.qty;
                self.c_yes += cost;
            }
            Side::No => {
                self.q_no += fill.qty;
                self.c_no += cost;
            }
        }
    }

    /// Returns a **new** position reflecting a synthetic fill of
    /// `qty = amount / price`, leaving `self` untouched. A no-op copy when
    /// `amount <= 0` or `price <= 0`.
    pub fn hypo_buy(&self, side: Side, amount: f64, price: f64) -> PairPosition {
        if amount <= 0.0 || price <= 0.0 {
            return *self;
        }
        let mut projected = *self;
        let qty = amount / price;
        projected.apply_fill(Fill {
            side,
            qty,
            price,
            ts_ms: 0,
        });
        projected
    }
}

/// Reason an attempted buy was rejected (or would have been), in the fixed
/// precedence order tests depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    ZeroAmount,
    ExceedsMaxTotal,
    PairCostExceedsNet,
    PairCostExceedsCap,
    LegImbalance,
    NoPnlImprovement,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::ZeroAmount => "zero_amount",
            RejectReason::ExceedsMaxTotal => "exceeds_max_total",
            RejectReason::PairCostExceedsNet => "pair_cost_exceeds_net",
            RejectReason::PairCostExceedsCap => "pair_cost_exceeds_cap",
            RejectReason::LegImbalance => "leg_imbalance",
            RejectReason::NoPnlImprovement => "no_pnl_improvement",
        }
    }
}

/// The single gate for adding to a pair position. Checks run in fixed
/// precedence order; checks 3-6 evaluate against the `hypo_buy` projection,
/// never the receiver.
#[allow(clippy::too_many_arguments)]
pub fn should_buy_more(
    pos: &PairPosition,
    side: Side,
    quote_amount: f64,
    price: f64,
    pair_cost_cap: f64,
    max_total_cost: f64,
    max_leg_imbalance_quote: f64,
    require_improve: bool,
) -> Result<(), RejectReason> {
    if quote_amount <= 0.0 {
        return Err(RejectReason::ZeroAmount);
    }
    if pos.total_cost() + quote_amount > max_total_cost {
        return Err(RejectReason::ExceedsMaxTotal);
    }

    let projected = pos.hypo_buy(side, quote_amount, price);
    let post_pair_cost = projected.pair_cost_avg();

    if let Some(pair_cost) = post_pair_cost {
        if pair_cost >= 1.0 - pos.fee_rate {
            return Err(RejectReason::PairCostExceedsNet);
        }
        if pair_cost >= pair_cost_cap {
            return Err(RejectReason::PairCostExceedsCap);
        }
    }

    if projected.leg_imbalance_quote() > max_leg_imbalance_quote {
        return Err(RejectReason::LegImbalance);
    }

    if require_improve && projected.guaranteed_pnl() <= pos.guaranteed_pnl() {
        return Err(RejectReason::NoPnlImprovement);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(side: Side, qty: f64, price: f64) -> Fill {
        Fill::new(side, qty, price, 0).unwrap()
    }

    #[test]
    fn scenario_pair_locks_profit() {
        let mut pos = PairPosition::new(0.02);
        pos.apply_fill(fill(Side::Yes, 100.0, 0.45));
        pos.apply_fill(fill(Side::No, 100.0, 0.50));

        assert!((pos.total_cost() - 95.0).abs() < 1e-9);
        assert!((pos.payout_net() - 98.0).abs() < 1e-9);
        assert!((pos.guaranteed_pnl() - 3.0).abs() < 1e-9);
        assert!((pos.pair_cost_avg().unwrap() - 0.95).abs() < 1e-9);
    }

    #[test]
    fn scenario_imbalance_loss() {
        let mut pos = PairPosition::new(0.02);
        pos.apply_fill(fill(Side::Yes, 100.0, 0.45));
        pos.apply_fill(fill(Side::No, 50.0, 0.50));

        assert_eq!(pos.q_min(), 50.0);
        assert!((pos.payout_net() - 49.0).abs() < 1e-9);
        assert!((pos.total_cost() - 70.0).abs() < 1e-9);
        assert!((pos.guaranteed_pnl() - (-21.0)).abs() < 1e-9);
        assert_eq!(pos.leg_imbalance_shares(), 40.0);
        assert!((pos.leg_imbalance_quote() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn scenario_should_buy_more_precedence() {
        let mut pos = PairPosition::new(0.02);
        pos.apply_fill(fill(Side::Yes, 100.0, 0.55));
        assert!((pos.c_yes - 55.0).abs() < 1e-9);

        let result = should_buy_more(&pos, Side::No, 50.0, 0.50, 0.99, 1000.0, 1000.0, true);
        assert_eq!(result, Err(RejectReason::PairCostExceedsNet));
    }

    #[test]
    fn hypo_buy_does_not_mutate_receiver() {
        let pos = PairPosition::new(0.02);
        let before = pos;
        let _ = pos.hypo_buy(Side::Yes, 50.0, 0.5);
        assert_eq!(pos, before);
    }

    #[test]
    fn hypo_buy_is_noop_copy_for_nonpositive_inputs() {
        let pos = PairPosition::new(0.02);
        assert_eq!(pos.hypo_buy(Side::Yes, 0.0, 0.5), pos);
        assert_eq!(pos.hypo_buy(Side::Yes, 50.0, 0.0), pos);
        assert_eq!(pos.hypo_buy(Side::Yes, -10.0, 0.5), pos);
    }

    #[test]
    fn zero_amount_is_rejected_before_any_other_check() {
        let pos = PairPosition::new(0.02);
        let result = should_buy_more(&pos, Side::Yes, 0.0, 0.5, 0.99, 1000.0, 1000.0, true);
        assert_eq!(result, Err(RejectReason::ZeroAmount));
    }

    #[test]
    fn exceeds_max_total_checked_before_pair_cost() {
        let pos = PairPosition::new(0.02);
        let result = should_buy_more(&pos, Side::Yes, 50.0, 0.5, 0.99, 10.0, 1000.0, true);
        assert_eq!(result, Err(RejectReason::ExceedsMaxTotal));
    }

    #[test]
    fn require_improve_rejects_non_improving_buy() {
        let mut pos = PairPosition::new(0.02);
        pos.apply_fill(fill(Side::Yes, 100.0, 0.45));
        pos.apply_fill(fill(Side::No, 100.0, 0.50));
        // Position is already profitable; buying more NO at a worse price
        // should not improve guaranteed_pnl enough to pass every gate, or
        // should fail on an earlier-precedence reason.
        let result = should_buy_more(&pos, Side::No, 1.0, 0.99, 0.999, 1000.0, 1000.0, true);
        assert!(result.is_err());
    }

    #[test]
    fn accepted_buy_strictly_increases_guaranteed_pnl() {
        let mut pos = PairPosition::new(0.02);
        pos.apply_fill(fill(Side::Yes, 100.0, 0.45));
        pos.apply_fill(fill(Side::No, 50.0, 0.50));
        let before = pos.guaranteed_pnl();

        let result = should_buy_more(&pos, Side::No, 10.0, 0.50, 0.99, 1000.0, 1000.0, true);
        assert!(result.is_ok());

        let projected = pos.hypo_buy(Side::No, 10.0, 0.50);
        assert!(projected.guaranteed_pnl() > before);
    }
}

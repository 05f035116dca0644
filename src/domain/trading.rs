//! Trading engine: per-market execution state machine.
//!
//! State table, circuit breaker, leg-selection heuristic, and config
//! field names/defaults re-expressed as a synchronous Rust state machine
//! in the style of a `StrategyCoordinator` (reprice/debounce decision
//! methods that return an intent rather than perform I/O, `Stats`-style
//! counters for consecutive-failure tracking), but without the actor/
//! channel plumbing: engine ticks are synchronous and non-suspending,
//! and the bus is the only async layer.

use std::collections::HashMap;

use crate::bus::event::{CancelIntent, OrderIntent};
use crate::config::TradingEngineConfig;
use crate::domain::pair_position::{should_buy_more, PairPosition};
use crate::domain::types::{Fill, Order, OrderStatus, OrderBook, Side};
use crate::error::{EngineError, EngineResult};

fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingStatus {
    Idle,
    BuildingPair,
    LockedPair,
    TemporalActive,
    Finalizing,
    Resolved,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Watch,
    BuyYes,
    BuyNo,
    BuyWinner,
    Cancel,
    CancelAll,
}

fn allowed_actions(status: TradingStatus) -> &'static [Action] {
    use Action::*;
    match status {
        TradingStatus::Idle => &[Watch],
        TradingStatus::BuildingPair => &[BuyYes, BuyNo, Cancel],
        TradingStatus::LockedPair => &[Watch],
        TradingStatus::TemporalActive => &[BuyWinner, Cancel],
        TradingStatus::Finalizing => &[CancelAll],
        TradingStatus::Resolved => &[],
        TradingStatus::Halt => &[CancelAll],
    }
}

/// Owned snapshot returned by [`TradingEngine::state`].
#[derive(Debug, Clone, PartialEq)]
pub struct TradingState {
    pub market_id: String,
    pub status: TradingStatus,
    pub position: PairPosition,
    pub open_orders: HashMap<String, Order>,
    pub consecutive_rejects: u32,
    pub consecutive_cancel_failures: u32,
    pub entered_state_at: i64,
    pub last_activity_at: i64,
}

pub struct TradingEngine {
    config: TradingEngineConfig,
    market_id: String,
    status: TradingStatus,
    position: PairPosition,
    open_orders: HashMap<String, Order>,
    consecutive_rejects: u32,
    consecutive_cancel_failures: u32,
    entered_state_at: i64,
    last_activity_at: i64,
    no_opportunity_ticks: u32,
    temporal_signal_at_ms: Option<i64>,
    halt_reason: Option<String>,
}

impl TradingEngine {
    pub fn new(market_id: impl Into<String>, config: TradingEngineConfig, now_ms: i64) -> Self {
        Self {
            position: PairPosition::new(config.fee_rate),
            config,
            market_id: market_id.into(),
            status: TradingStatus::Idle,
            open_orders: HashMap::new(),
            consecutive_rejects: 0,
            consecutive_cancel_failures: 0,
            entered_state_at: now_ms,
            last_activity_at: now_ms,
            no_opportunity_ticks: 0,
            temporal_signal_at_ms: None,
            halt_reason: None,
        }
    }

    pub fn can_place_orders(&self) -> bool {
        matches!(self.status, TradingStatus::BuildingPair | TradingStatus::TemporalActive)
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.status, TradingStatus::Resolved | TradingStatus::Halt)
    }

    pub fn get_allowed_actions(&self) -> &'static [Action] {
        allowed_actions(self.status)
    }

    pub fn state(&self) -> TradingState {
        TradingState {
            market_id: self.market_id.clone(),
            status: self.status,
            position: self.position,
            open_orders: self.open_orders.clone(),
            consecutive_rejects: self.consecutive_rejects,
            consecutive_cancel_failures: self.consecutive_cancel_failures,
            entered_state_at: self.entered_state_at,
            last_activity_at: self.last_activity_at,
        }
    }

    fn transition_to(&mut self, status: TradingStatus, now_ms: i64) -> EngineResult<()> {
        if status == TradingStatus::Halt && self.status == TradingStatus::Halt {
            return Err(EngineError::InvalidStateTransition(
                "already in HALT".to_string(),
            ));
        }
        self.status = status;
        self.entered_state_at = now_ms;
        self.last_activity_at = now_ms;
        Ok(())
    }

    pub fn track_order(&mut self, order: Order) {
        self.open_orders.insert(order.id.clone(), order);
    }

    fn open_order_ids(&self) -> Vec<String> {
        self.open_orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .map(|o| o.id.clone())
            .collect()
    }

    fn cancel_all_intents(&self, now_ms: i64, reason: &str) -> Vec<CancelIntent> {
        self.open_order_ids()
            .into_iter()
            .map(|order_id| CancelIntent {
                event_id: new_event_id(),
                market_id: self.market_id.clone(),
                order_id,
                reason: reason.to_string(),
                timestamp_ms: now_ms,
            })
            .collect()
    }

    /// Leg selection: the lagging side by share imbalance, or the side with
    /// the lower best ask when roughly balanced (ties favor YES).
    fn select_leg(&self, book_yes: &OrderBook, book_no: &OrderBook) -> Option<Side> {
        let imbalance = self.position.q_yes - self.position.q_no;
        if imbalance > self.config.leg_lag_threshold_shares {
            return Some(Side::No);
        }
        if imbalance < -self.config.leg_lag_threshold_shares {
            return Some(Side::Yes);
        }

        match (book_yes.best_ask(), book_no.best_ask()) {
            (Some(yes_ask), Some(no_ask)) => {
                if yes_ask <= no_ask {
                    Some(Side::Yes)
                } else {
                    Some(Side::No)
                }
            }
            (Some(_), None) => Some(Side::Yes),
            (None, Some(_)) => Some(Side::No),
            (None, None) => None,
        }
    }

    /// Order-book handling for IDLE / BUILDING_PAIR.
    pub fn on_orderbook_update(
        &mut self,
        book_yes: &OrderBook,
        book_no: &OrderBook,
        now_ms: i64,
    ) -> Option<OrderIntent> {
        if !matches!(self.status, TradingStatus::Idle | TradingStatus::BuildingPair) {
            return None;
        }

        let side = self.select_leg(book_yes, book_no)?;
        let price = match side {
            Side::Yes => book_yes.best_ask(),
            Side::No => book_no.best_ask(),
        }?;

        let decision = should_buy_more(
            &self.position,
            side,
            self.config.step_usdc,
            price,
            self.config.pair_cost_cap,
            self.config.max_total_cost,
            self.config.max_leg_imbalance_usdc,
            true,
        );

        match decision {
            Ok(()) => {
                self.no_opportunity_ticks = 0;
                if self.status == TradingStatus::Idle {
                    let _ = self.transition_to(TradingStatus::BuildingPair, now_ms);
                }
                self.last_activity_at = now_ms;
                Some(OrderIntent {
                    event_id: new_event_id(),
                    market_id: self.market_id.clone(),
                    side,
                    price,
                    size: self.config.step_usdc,
                    strategy: "pair_arb".to_string(),
                    reason: "opportunity".to_string(),
                    timestamp_ms: now_ms,
                })
            }
            Err(reason) => {
                if self.status == TradingStatus::BuildingPair {
                    self.no_opportunity_ticks += 1;
                    if self.no_opportunity_ticks >= self.config.idle_after_no_opportunity_ticks {
                        let _ = self.transition_to(TradingStatus::Idle, now_ms);
                        self.no_opportunity_ticks = 0;
                    }
                }
                tracing::debug!(reason = reason.code(), "pair arb opportunity rejected");
                None
            }
        }
    }

    /// Applies a fill, drops the matched order, and re-evaluates the
    /// position-driven transitions for BUILDING_PAIR / TEMPORAL_ACTIVE.
    pub fn on_fill(&mut self, side: Side, qty: f64, price: f64, order_id: &str, now_ms: i64) -> Option<OrderIntent> {
        let fill = match Fill::new(side, qty, price, now_ms) {
            Ok(f) => f,
            Err(_) => return None,
        };
        self.position.apply_fill(fill);
        self.open_orders.remove(order_id);
        self.last_activity_at = now_ms;

        match self.status {
            TradingStatus::BuildingPair => {
                if self.position.guaranteed_pnl() > 0.0 {
                    let _ = self.transition_to(TradingStatus::LockedPair, now_ms);
                }
                None
            }
            TradingStatus::TemporalActive => {
                self.temporal_signal_at_ms = None;
                if self.position.guaranteed_pnl() > 0.0 {
                    let _ = self.transition_to(TradingStatus::LockedPair, now_ms);
                } else {
                    let _ = self.transition_to(TradingStatus::Idle, now_ms);
                }
                None
            }
            _ => None,
        }
    }

    fn check_circuit_breaker(&mut self, now_ms: i64) -> Option<Vec<CancelIntent>> {
        if self.consecutive_rejects >= self.config.max_consecutive_rejects
            || self.consecutive_cancel_failures >= self.config.max_cancel_failures
        {
            let reason = format!(
                "consecutive_rejects={} consecutive_cancel_failures={}",
                self.consecutive_rejects, self.consecutive_cancel_failures
            );
            return self.halt(&reason, now_ms).ok();
        }
        None
    }

    pub fn on_order_rejected(&mut self, order_id: &str, reason: &str, now_ms: i64) -> Vec<CancelIntent> {
        self.consecutive_rejects += 1;
        if let Some(order) = self.open_orders.get_mut(order_id) {
            order.status = OrderStatus::Rejected;
            order.reject_reason = Some(reason.to_string());
        }
        self.last_activity_at = now_ms;
        self.check_circuit_breaker(now_ms).unwrap_or_default()
    }

    pub fn on_order_success(&mut self, order_id: &str, now_ms: i64) {
        self.consecutive_rejects = 0;
        if let Some(order) = self.open_orders.get_mut(order_id) {
            order.status = OrderStatus::Placed;
            order.placed_at = Some(now_ms);
        }
        self.last_activity_at = now_ms;
    }

    pub fn on_cancel_failure(&mut self, _order_id: &str, now_ms: i64) -> Vec<CancelIntent> {
        self.consecutive_cancel_failures += 1;
        self.last_activity_at = now_ms;
        self.check_circuit_breaker(now_ms).unwrap_or_default()
    }

    pub fn on_cancel_success(&mut self, order_id: &str, now_ms: i64) {
        self.consecutive_cancel_failures = 0;
        self.open_orders.remove(order_id);
        self.last_activity_at = now_ms;
    }

    /// Temporal-signal expiry check, run each tick while TEMPORAL_ACTIVE.
    pub fn on_tick(&mut self, now_ms: i64) -> Vec<CancelIntent> {
        if self.status != TradingStatus::TemporalActive {
            return Vec::new();
        }
        let Some(signal_at) = self.temporal_signal_at_ms else {
            return Vec::new();
        };
        if now_ms - signal_at >= self.config.temporal_signal_ttl_ms {
            let intents = self.cancel_all_intents(now_ms, "temporal_signal_expired");
            self.temporal_signal_at_ms = None;
            let _ = self.transition_to(TradingStatus::Idle, now_ms);
            intents
        } else {
            Vec::new()
        }
    }

    /// Marks a temporal-arbitrage signal as active, starting its TTL clock.
    /// No opportunity detector is defined for TEMPORAL_ACTIVE; callers
    /// decide externally when a temporal signal is observed.
    pub fn activate_temporal_signal(&mut self, now_ms: i64) -> EngineResult<()> {
        self.transition_to(TradingStatus::TemporalActive, now_ms)?;
        self.temporal_signal_at_ms = Some(now_ms);
        Ok(())
    }

    pub fn halt(&mut self, reason: &str, now_ms: i64) -> EngineResult<Vec<CancelIntent>> {
        self.transition_to(TradingStatus::Halt, now_ms)?;
        self.halt_reason = Some(reason.to_string());
        Ok(self.cancel_all_intents(now_ms, reason))
    }

    pub fn resume_from_halt(&mut self, now_ms: i64) -> EngineResult<()> {
        if self.status != TradingStatus::Halt {
            return Err(EngineError::InvalidStateTransition(
                "resume_from_halt called outside HALT".to_string(),
            ));
        }
        self.consecutive_rejects = 0;
        self.consecutive_cancel_failures = 0;
        self.halt_reason = None;
        self.transition_to(TradingStatus::Idle, now_ms)
    }

    pub fn finalize(&mut self, now_ms: i64) -> EngineResult<Vec<CancelIntent>> {
        self.transition_to(TradingStatus::Finalizing, now_ms)?;
        Ok(self.cancel_all_intents(now_ms, "finalizing"))
    }

    pub fn resolve(&mut self, now_ms: i64) -> EngineResult<()> {
        self.transition_to(TradingStatus::Resolved, now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Level;

    fn engine() -> TradingEngine {
        TradingEngine::new("market-1", TradingEngineConfig::default(), 0)
    }

    fn book_with_ask(price: f64) -> OrderBook {
        let mut book = OrderBook::new("tok");
        book.asks.push(Level { price, size: 1000.0 });
        book.bids.push(Level { price: price - 0.02, size: 1000.0 });
        book
    }

    #[test]
    fn initial_state_is_idle() {
        let e = engine();
        assert_eq!(e.state().status, TradingStatus::Idle);
        assert_eq!(e.get_allowed_actions(), &[Action::Watch]);
    }

    #[test]
    fn orderbook_opportunity_moves_idle_to_building_pair() {
        let mut e = engine();
        let book_yes = book_with_ask(0.45);
        let book_no = book_with_ask(0.50);
        let intent = e.on_orderbook_update(&book_yes, &book_no, 1000);
        assert!(intent.is_some());
        assert_eq!(e.state().status, TradingStatus::BuildingPair);
    }

    #[test]
    fn fill_locking_profit_transitions_to_locked_pair() {
        let mut e = engine();
        let book_yes = book_with_ask(0.45);
        let book_no = book_with_ask(0.50);
        e.on_orderbook_update(&book_yes, &book_no, 1000);
        e.on_fill(Side::Yes, 100.0, 0.45, "order-yes", 1100);
        assert_eq!(e.state().status, TradingStatus::BuildingPair);
        e.on_fill(Side::No, 100.0, 0.50, "order-no", 1200);
        assert_eq!(e.state().status, TradingStatus::LockedPair);
        assert!(e.state().position.guaranteed_pnl() > 0.0);
    }

    #[test]
    fn circuit_breaker_trips_to_halt_after_three_rejects() {
        let mut e = engine();
        e.track_order(Order::new("o1", "market-1", Side::Yes, 0.45, 25.0, "idem-1", 0));
        e.track_order(Order::new("o2", "market-1", Side::Yes, 0.45, 25.0, "idem-2", 0));
        e.track_order(Order::new("o3", "market-1", Side::Yes, 0.45, 25.0, "idem-3", 0));
        // A fourth order is never rejected, so it's still open when the
        // breaker trips and must show up in the halt's cancel batch.
        e.track_order(Order::new("o4", "market-1", Side::No, 0.50, 25.0, "idem-4", 0));

        e.on_order_rejected("o1", "insufficient funds", 100);
        e.on_order_rejected("o2", "insufficient funds", 200);
        let cancels = e.on_order_rejected("o3", "insufficient funds", 300);
        assert_eq!(e.state().status, TradingStatus::Halt);
        assert!(cancels.iter().any(|c| c.order_id == "o4"));
        assert!(!cancels.iter().any(|c| c.order_id == "o1" || c.order_id == "o2" || c.order_id == "o3"));
    }

    #[test]
    fn halt_rejects_double_halt() {
        let mut e = engine();
        e.halt("manual", 100).unwrap();
        assert!(e.halt("manual-again", 200).is_err());
    }

    #[test]
    fn resume_from_halt_resets_counters_and_returns_to_idle() {
        let mut e = engine();
        e.halt("manual", 100).unwrap();
        e.resume_from_halt(200).unwrap();
        assert_eq!(e.state().status, TradingStatus::Idle);
        assert_eq!(e.state().consecutive_rejects, 0);
        assert_eq!(e.state().consecutive_cancel_failures, 0);
    }

    #[test]
    fn temporal_signal_expires_and_cancels_all() {
        let mut e = engine();
        e.track_order(Order::new("o1", "market-1", Side::Yes, 0.5, 25.0, "idem-1", 0));
        e.activate_temporal_signal(1000).unwrap();
        assert!(e.on_tick(3000).is_empty());
        let cancels = e.on_tick(6001);
        assert!(!cancels.is_empty());
        assert_eq!(e.state().status, TradingStatus::Idle);
    }

    #[test]
    fn finalize_cancels_all_open_orders() {
        let mut e = engine();
        e.track_order(Order::new("o1", "market-1", Side::Yes, 0.5, 25.0, "idem-1", 0));
        let cancels = e.finalize(1000).unwrap();
        assert_eq!(cancels.len(), 1);
        assert_eq!(e.state().status, TradingStatus::Finalizing);
    }

    #[test]
    fn resolved_is_terminal_and_inactive() {
        let mut e = engine();
        e.resolve(1000).unwrap();
        assert_eq!(e.state().status, TradingStatus::Resolved);
        assert!(!e.is_active());
    }
}

//! Event envelopes and the tag-ancestry table that stands in for a
//! runtime type hierarchy's dynamic dispatch.
//!
//! The bus subscribes handlers to an [`EventKind`]; a handler subscribed to
//! a supertype kind (e.g. `MarketData`) is also invoked for every refinement
//! of that kind (e.g. `OrderBookUpdate`). [`ancestors`] is the explicit table
//! a runtime type hierarchy would otherwise provide implicitly.

use uuid::Uuid;

/// Sentinel partition for cross-cutting events (clock ticks, system halt).
pub const GLOBAL_PARTITION: &str = "__global__";

/// Tag identifying an event's place in the dispatch hierarchy. Leaves match
/// subscriptions to themselves and to every ancestor returned by
/// [`ancestors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Root of the hierarchy; subscribing here observes everything.
    Any,
    MatchEvent,
    TruthDelta,
    TruthFinal,
    MarketData,
    OrderBookUpdate,
    TradeTick,
    Fill,
    OrderIntent,
    CancelIntent,
    OrderRejected,
    OrderSuccess,
    CancelFailure,
    CancelSuccess,
    ClockTick,
    SystemHalt,
}

/// Returns every supertype of `kind`, most specific first, not including
/// `kind` itself. A handler subscribed to any entry in this list is invoked
/// when `kind` is published.
pub fn ancestors(kind: EventKind) -> &'static [EventKind] {
    use EventKind::*;
    match kind {
        Any => &[],
        MatchEvent => &[Any],
        TruthDelta => &[Any],
        TruthFinal => &[Any],
        MarketData => &[Any],
        OrderBookUpdate => &[MarketData, Any],
        TradeTick => &[MarketData, Any],
        Fill => &[Any],
        OrderIntent => &[Any],
        CancelIntent => &[Any],
        OrderRejected => &[Any],
        OrderSuccess => &[Any],
        CancelFailure => &[Any],
        CancelSuccess => &[Any],
        ClockTick => &[Any],
        SystemHalt => &[Any],
    }
}

/// Common fields every event carries, matching the base `Event` shape.
pub trait BusEvent: Send + Sync + std::fmt::Debug {
    fn event_id(&self) -> &str;
    fn timestamp_ms(&self) -> i64;
    fn kind(&self) -> EventKind;

    /// Queue key: `market_id`/`match_id` when present, else the global
    /// sentinel partition.
    fn partition_key(&self) -> &str;
}

fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// Normalized multi-source match event consumed by the truth engine.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchEvent {
    pub event_id: String,
    pub match_id: String,
    pub event_type: MatchEventType,
    pub source: String,
    pub source_tier: SourceTier,
    pub timestamp_ms: i64,
    pub source_event_id: Option<String>,
    pub seq: Option<u64>,
    pub payload: serde_json::Value,
}

impl MatchEvent {
    pub fn new(
        match_id: impl Into<String>,
        event_type: MatchEventType,
        source: impl Into<String>,
        source_tier: SourceTier,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            event_id: new_event_id(),
            match_id: match_id.into(),
            event_type,
            source: source.into(),
            source_tier,
            timestamp_ms,
            source_event_id: None,
            seq: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_source_event_id(mut self, id: impl Into<String>) -> Self {
        self.source_event_id = Some(id.into());
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

impl BusEvent for MatchEvent {
    fn event_id(&self) -> &str {
        &self.event_id
    }

    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    fn kind(&self) -> EventKind {
        EventKind::MatchEvent
    }

    fn partition_key(&self) -> &str {
        &self.match_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchEventType {
    MatchCreated,
    MatchStarted,
    Paused,
    Resumed,
    MapStarted,
    RoundEnded,
    MapEnded,
    ScoreUpdate,
    MatchEnded,
    Correction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceTier {
    A,
    B,
    C,
}

/// Emitted by the truth engine on a non-terminal state change.
#[derive(Debug, Clone, PartialEq)]
pub struct TruthDelta {
    pub event_id: String,
    pub match_id: String,
    pub timestamp_ms: i64,
    pub confidence: f64,
    pub reason: String,
}

impl BusEvent for TruthDelta {
    fn event_id(&self) -> &str {
        &self.event_id
    }
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
    fn kind(&self) -> EventKind {
        EventKind::TruthDelta
    }
    fn partition_key(&self) -> &str {
        &self.match_id
    }
}

/// Emitted once, when the truth engine reaches FINAL.
#[derive(Debug, Clone, PartialEq)]
pub struct TruthFinal {
    pub event_id: String,
    pub match_id: String,
    pub timestamp_ms: i64,
    pub winner_team_id: String,
    pub confidence: f64,
    pub confirmed_by: Vec<String>,
    pub finalized_at_ms: i64,
}

impl BusEvent for TruthFinal {
    fn event_id(&self) -> &str {
        &self.event_id
    }
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
    fn kind(&self) -> EventKind {
        EventKind::TruthFinal
    }
    fn partition_key(&self) -> &str {
        &self.match_id
    }
}

/// Order-book snapshot for one side (YES or NO) of a market.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookUpdate {
    pub event_id: String,
    pub market_id: String,
    pub timestamp_ms: i64,
    pub book: crate::domain::types::OrderBook,
}

impl BusEvent for OrderBookUpdate {
    fn event_id(&self) -> &str {
        &self.event_id
    }
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
    fn kind(&self) -> EventKind {
        EventKind::OrderBookUpdate
    }
    fn partition_key(&self) -> &str {
        &self.market_id
    }
}

/// Action the trading engine wants the execution collaborator to take.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub event_id: String,
    pub market_id: String,
    pub timestamp_ms: i64,
    pub side: crate::domain::types::Side,
    pub price: f64,
    pub size: f64,
    pub strategy: String,
    pub reason: String,
}

impl BusEvent for OrderIntent {
    fn event_id(&self) -> &str {
        &self.event_id
    }
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
    fn kind(&self) -> EventKind {
        EventKind::OrderIntent
    }
    fn partition_key(&self) -> &str {
        &self.market_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelIntent {
    pub event_id: String,
    pub market_id: String,
    pub timestamp_ms: i64,
    pub order_id: String,
    pub reason: String,
}

impl BusEvent for CancelIntent {
    fn event_id(&self) -> &str {
        &self.event_id
    }
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
    fn kind(&self) -> EventKind {
        EventKind::CancelIntent
    }
    fn partition_key(&self) -> &str {
        &self.market_id
    }
}

/// Cross-cutting ~1 Hz tick published on the global partition.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockTick {
    pub event_id: String,
    pub timestamp_ms: i64,
}

impl ClockTick {
    pub fn new(timestamp_ms: i64) -> Self {
        Self {
            event_id: new_event_id(),
            timestamp_ms,
        }
    }
}

impl BusEvent for ClockTick {
    fn event_id(&self) -> &str {
        &self.event_id
    }
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
    fn kind(&self) -> EventKind {
        EventKind::ClockTick
    }
    fn partition_key(&self) -> &str {
        GLOBAL_PARTITION
    }
}

/// Cross-cutting system halt signal published on the global partition.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemHalt {
    pub event_id: String,
    pub timestamp_ms: i64,
    pub reason: String,
}

impl BusEvent for SystemHalt {
    fn event_id(&self) -> &str {
        &self.event_id
    }
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
    fn kind(&self) -> EventKind {
        EventKind::SystemHalt
    }
    fn partition_key(&self) -> &str {
        GLOBAL_PARTITION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orderbook_update_is_a_market_data_event() {
        assert!(ancestors(EventKind::OrderBookUpdate).contains(&EventKind::MarketData));
        assert!(ancestors(EventKind::TradeTick).contains(&EventKind::MarketData));
    }

    #[test]
    fn any_has_no_ancestors() {
        assert!(ancestors(EventKind::Any).is_empty());
    }

    #[test]
    fn match_event_partition_key_is_match_id() {
        let ev = MatchEvent::new(
            "match-1",
            MatchEventType::MatchStarted,
            "grid",
            SourceTier::A,
            1000,
        );
        assert_eq!(ev.partition_key(), "match-1");
        assert_eq!(ev.kind(), EventKind::MatchEvent);
    }

    #[test]
    fn clock_tick_uses_global_partition() {
        let tick = ClockTick::new(1000);
        assert_eq!(tick.partition_key(), GLOBAL_PARTITION);
    }
}

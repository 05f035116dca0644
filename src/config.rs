//! Configuration records.
//!
//! All options configurable at startup. Each `from_env` constructor pulls
//! `PM_*` overrides one field at a time onto a `Default`. No YAML/file
//! loading; that collaborator is out of scope here.

use std::env;

fn env_parse<T: std::str::FromStr>(key: &str, cur: T) -> T {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or(cur),
        Err(_) => cur,
    }
}

/// `drop` discards the new event; `coalesce` attempts a merge and falls
/// back to drop; `block` awaits space; `halt` fails the publish fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    Drop,
    Coalesce,
    Block,
    Halt,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "coalesce" => Ok(Self::Coalesce),
            "block" => Ok(Self::Block),
            "halt" => Ok(Self::Halt),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub max_queue_size: usize,
    pub overflow_policy: OverflowPolicy,
    pub handler_timeout_ms: u64,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            overflow_policy: OverflowPolicy::Drop,
            handler_timeout_ms: 5000,
            max_retry_attempts: 3,
            retry_base_delay_ms: 100,
        }
    }
}

impl EventBusConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.max_queue_size = env_parse("PM_BUS_MAX_QUEUE_SIZE", cfg.max_queue_size);
        if let Ok(v) = env::var("PM_BUS_OVERFLOW_POLICY") {
            if let Ok(p) = v.parse() {
                cfg.overflow_policy = p;
            }
        }
        cfg.handler_timeout_ms = env_parse("PM_BUS_HANDLER_TIMEOUT_MS", cfg.handler_timeout_ms);
        cfg.max_retry_attempts = env_parse("PM_BUS_MAX_RETRY_ATTEMPTS", cfg.max_retry_attempts);
        cfg.retry_base_delay_ms = env_parse("PM_BUS_RETRY_BASE_DELAY_MS", cfg.retry_base_delay_ms);
        cfg
    }
}

#[derive(Debug, Clone)]
pub struct TruthEngineConfig {
    pub confirm_threshold: f64,
    pub max_wait_ms: i64,
    pub required_sources_for_final: usize,
    pub allowed_skew_ms: i64,
    pub tier_a_sources: Vec<String>,
    pub tier_b_sources: Vec<String>,
    pub tier_c_sources: Vec<String>,
}

impl Default for TruthEngineConfig {
    fn default() -> Self {
        Self {
            confirm_threshold: 0.90,
            max_wait_ms: 10_000,
            required_sources_for_final: 2,
            allowed_skew_ms: 2_000,
            tier_a_sources: vec!["grid".into(), "official".into()],
            tier_b_sources: vec!["opendota".into(), "pandascore".into()],
            tier_c_sources: vec!["liquipedia".into()],
        }
    }
}

impl TruthEngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.confirm_threshold = env_parse("PM_TRUTH_CONFIRM_THRESHOLD", cfg.confirm_threshold);
        cfg.max_wait_ms = env_parse("PM_TRUTH_MAX_WAIT_MS", cfg.max_wait_ms);
        cfg.required_sources_for_final =
            env_parse("PM_TRUTH_REQUIRED_SOURCES", cfg.required_sources_for_final);
        cfg.allowed_skew_ms = env_parse("PM_TRUTH_ALLOWED_SKEW_MS", cfg.allowed_skew_ms);
        cfg
    }
}

#[derive(Debug, Clone)]
pub struct TradingEngineConfig {
    pub idle_after_no_opportunity_ticks: u32,
    pub temporal_signal_ttl_ms: i64,
    pub pair_cost_cap: f64,
    pub fee_rate: f64,
    pub step_usdc: f64,
    pub max_total_cost: f64,
    pub max_leg_imbalance_usdc: f64,
    pub max_consecutive_rejects: u32,
    pub max_cancel_failures: u32,
    /// Share-count threshold past which a leg is considered "lagging" for
    /// leg-selection purposes (spec.md 4.4 step 1).
    pub leg_lag_threshold_shares: f64,
}

impl Default for TradingEngineConfig {
    fn default() -> Self {
        Self {
            idle_after_no_opportunity_ticks: 100,
            temporal_signal_ttl_ms: 5000,
            pair_cost_cap: 0.975,
            fee_rate: 0.02,
            step_usdc: 25.0,
            max_total_cost: 1500.0,
            max_leg_imbalance_usdc: 100.0,
            max_consecutive_rejects: 3,
            max_cancel_failures: 3,
            leg_lag_threshold_shares: 20.0,
        }
    }
}

impl TradingEngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.idle_after_no_opportunity_ticks =
            env_parse("PM_TRADING_IDLE_TICKS", cfg.idle_after_no_opportunity_ticks);
        cfg.temporal_signal_ttl_ms = env_parse("PM_TRADING_TEMPORAL_TTL_MS", cfg.temporal_signal_ttl_ms);
        cfg.pair_cost_cap = env_parse("PM_PAIR_COST_CAP", cfg.pair_cost_cap);
        cfg.fee_rate = env_parse("PM_FEE_RATE", cfg.fee_rate);
        cfg.step_usdc = env_parse("PM_STEP_USDC", cfg.step_usdc);
        cfg.max_total_cost = env_parse("PM_MAX_TOTAL_COST", cfg.max_total_cost);
        cfg.max_leg_imbalance_usdc = env_parse("PM_MAX_LEG_IMBALANCE_USDC", cfg.max_leg_imbalance_usdc);
        cfg.max_consecutive_rejects = env_parse("PM_MAX_CONSECUTIVE_REJECTS", cfg.max_consecutive_rejects);
        cfg.max_cancel_failures = env_parse("PM_MAX_CANCEL_FAILURES", cfg.max_cancel_failures);
        cfg
    }
}

/// Warning or error surfaced by [`Settings::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigIssue {
    Warning(String),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub event_bus: EventBusConfig,
    pub truth: TruthEngineConfig,
    pub trading: TradingEngineConfig,
    /// Paper-trading mode logs-and-continues on a configuration error at
    /// startup instead of aborting the process (spec.md 7).
    pub paper_trading: bool,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            event_bus: EventBusConfig::default(),
            truth: TruthEngineConfig::default(),
            trading: TradingEngineConfig::default(),
            paper_trading: true,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let mut cfg = Self {
            event_bus: EventBusConfig::from_env(),
            truth: TruthEngineConfig::from_env(),
            trading: TradingEngineConfig::from_env(),
            ..Self::default()
        };
        if let Ok(v) = env::var("PM_PAPER_TRADING") {
            cfg.paper_trading = v != "0" && v.to_lowercase() != "false";
        }
        if let Ok(v) = env::var("PM_LOG_LEVEL") {
            cfg.log_level = v;
        }
        cfg
    }

    /// Sanity-check cross-field invariants a malformed `.env` could violate.
    /// Mirrors `validate_settings()` in the original source.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.trading.fee_rate < 0.0 || self.trading.fee_rate >= 1.0 {
            issues.push(ConfigIssue::Error(format!(
                "trading.fee_rate must be in [0, 1), got {}",
                self.trading.fee_rate
            )));
        }
        if self.trading.pair_cost_cap <= 0.0 || self.trading.pair_cost_cap > 1.0 {
            issues.push(ConfigIssue::Error(format!(
                "trading.pair_cost_cap must be in (0, 1], got {}",
                self.trading.pair_cost_cap
            )));
        }
        if self.truth.confirm_threshold < 0.0 || self.truth.confirm_threshold > 1.0 {
            issues.push(ConfigIssue::Error(format!(
                "truth.confirm_threshold must be in [0, 1], got {}",
                self.truth.confirm_threshold
            )));
        }
        if self.event_bus.max_queue_size == 0 {
            issues.push(ConfigIssue::Warning(
                "event_bus.max_queue_size is 0; every publish will hit the overflow policy".into(),
            ));
        }
        if self.trading.max_total_cost < self.trading.step_usdc {
            issues.push(ConfigIssue::Warning(
                "trading.max_total_cost is smaller than a single step_usdc order".into(),
            ));
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let bus = EventBusConfig::default();
        assert_eq!(bus.max_queue_size, 1000);
        assert_eq!(bus.overflow_policy, OverflowPolicy::Drop);
        assert_eq!(bus.handler_timeout_ms, 5000);
        assert_eq!(bus.max_retry_attempts, 3);
        assert_eq!(bus.retry_base_delay_ms, 100);

        let truth = TruthEngineConfig::default();
        assert_eq!(truth.confirm_threshold, 0.90);
        assert_eq!(truth.max_wait_ms, 10_000);
        assert_eq!(truth.required_sources_for_final, 2);
        assert_eq!(truth.allowed_skew_ms, 2_000);

        let trading = TradingEngineConfig::default();
        assert_eq!(trading.idle_after_no_opportunity_ticks, 100);
        assert_eq!(trading.temporal_signal_ttl_ms, 5000);
        assert_eq!(trading.pair_cost_cap, 0.975);
        assert_eq!(trading.fee_rate, 0.02);
        assert_eq!(trading.step_usdc, 25.0);
        assert_eq!(trading.max_total_cost, 1500.0);
        assert_eq!(trading.max_leg_imbalance_usdc, 100.0);
        assert_eq!(trading.max_consecutive_rejects, 3);
        assert_eq!(trading.max_cancel_failures, 3);
    }

    #[test]
    fn validate_flags_bad_fee_rate() {
        let mut settings = Settings::default();
        settings.trading.fee_rate = 1.5;
        let issues = settings.validate();
        assert!(issues
            .iter()
            .any(|i| matches!(i, ConfigIssue::Error(msg) if msg.contains("fee_rate"))));
    }

    #[test]
    fn overflow_policy_parses_case_insensitively() {
        assert_eq!("HALT".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Halt);
        assert_eq!("Block".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Block);
        assert!("bogus".parse::<OverflowPolicy>().is_err());
    }
}

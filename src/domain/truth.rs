//! Truth engine: fuses multi-source match events into one confidence-scored
//! view of match progress and outcome.
//!
//! Built directly from the state-machine table and the per-scenario
//! behavioral contract (fixture-per-engine, scenario-named test groups),
//! in the synchronous non-suspending style `TradingEngine` uses for its
//! own `on_*`/`tick` methods.

use std::collections::HashSet;

use crate::bus::event::{MatchEvent, MatchEventType, SourceTier, TruthDelta, TruthFinal};
use crate::config::TruthEngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    PreMatch,
    Live,
    Paused,
    PendingConfirm,
    Final,
}

/// Owned, immutable view returned by [`TruthEngine::state`]. Never a live
/// reference into the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TruthState {
    pub match_id: String,
    pub team_a_id: String,
    pub team_b_id: String,
    pub status: MatchStatus,
    pub score_a: i64,
    pub score_b: i64,
    pub map_index: i64,
    pub round_index: i64,
    pub confidence: f64,
    pub winner_team_id: Option<String>,
    pub last_event_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub finalized_at_ms: Option<i64>,
    pub seen_event_ids: HashSet<String>,
    pub last_seq: Option<u64>,
    pub sources_confirming: HashSet<String>,
}

impl TruthState {
    fn new(match_id: impl Into<String>, team_a_id: impl Into<String>, team_b_id: impl Into<String>) -> Self {
        Self {
            match_id: match_id.into(),
            team_a_id: team_a_id.into(),
            team_b_id: team_b_id.into(),
            status: MatchStatus::PreMatch,
            score_a: 0,
            score_b: 0,
            map_index: 0,
            round_index: 0,
            confidence: 0.0,
            winner_team_id: None,
            last_event_ms: 0,
            ended_at_ms: None,
            finalized_at_ms: None,
            seen_event_ids: HashSet::new(),
            last_seq: None,
            sources_confirming: HashSet::new(),
        }
    }

    /// `status ∈ {PENDING_CONFIRM, FINAL} ∧ confidence ≥ 0.85`.
    pub fn is_effectively_final(&self) -> bool {
        matches!(self.status, MatchStatus::PendingConfirm | MatchStatus::Final) && self.confidence >= 0.85
    }

    pub fn winner_if_final(&self) -> Option<&str> {
        if self.is_effectively_final() {
            self.winner_team_id.as_deref()
        } else {
            None
        }
    }
}

fn hash16(event_type: MatchEventType, timestamp_ms: i64, payload: &serde_json::Value) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    format!("{event_type:?}").hash(&mut hasher);
    timestamp_ms.hash(&mut hasher);
    payload.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub struct TruthEngine {
    config: TruthEngineConfig,
    state: TruthState,
}

impl TruthEngine {
    pub fn new(
        match_id: impl Into<String>,
        team_a_id: impl Into<String>,
        team_b_id: impl Into<String>,
        config: TruthEngineConfig,
    ) -> Self {
        Self {
            config,
            state: TruthState::new(match_id, team_a_id, team_b_id),
        }
    }

    pub fn state(&self) -> TruthState {
        self.state.clone()
    }

    fn tier(&self, source: &str) -> SourceTier {
        if self.config.tier_a_sources.iter().any(|s| s == source) {
            SourceTier::A
        } else if self.config.tier_b_sources.iter().any(|s| s == source) {
            SourceTier::B
        } else {
            SourceTier::C
        }
    }

    /// Admission: dedup then ordering. Returns `false` if the event should
    /// be dropped before reaching the state machine.
    fn admit(&mut self, event: &MatchEvent) -> bool {
        let dedup_key = match &event.source_event_id {
            Some(id) => id.clone(),
            None => hash16(event.event_type, event.timestamp_ms, &event.payload),
        };
        if self.state.seen_event_ids.contains(&dedup_key) {
            return false;
        }

        if let Some(seq) = event.seq {
            if let Some(last_seq) = self.state.last_seq {
                if seq <= last_seq {
                    return false;
                }
            }
            self.state.last_seq = Some(seq);
        } else if event.timestamp_ms < self.state.last_event_ms - self.config.allowed_skew_ms {
            return false;
        }

        self.state.seen_event_ids.insert(dedup_key);
        self.state.last_event_ms = self.state.last_event_ms.max(event.timestamp_ms);
        true
    }

    fn seed_confidence(tier: SourceTier) -> f64 {
        match tier {
            SourceTier::A => 0.90,
            SourceTier::B => 0.80,
            SourceTier::C => 0.70,
        }
    }

    fn confirm_bump(tier: SourceTier) -> (f64, f64) {
        match tier {
            SourceTier::A => (0.10, 1.0),
            SourceTier::B => (0.08, 0.95),
            SourceTier::C => (0.03, 0.90),
        }
    }

    fn finalization_criterion_met(&self) -> bool {
        if self.state.confidence >= self.config.confirm_threshold {
            return true;
        }
        if self
            .state
            .sources_confirming
            .iter()
            .any(|s| self.config.tier_a_sources.iter().any(|a| a == s))
        {
            return true;
        }
        self.state.sources_confirming.len() >= self.config.required_sources_for_final
    }

    fn finalize(&mut self, now_ms: i64) -> TruthFinal {
        self.state.status = MatchStatus::Final;
        self.state.finalized_at_ms = Some(now_ms);
        TruthFinal {
            event_id: uuid::Uuid::new_v4().to_string(),
            match_id: self.state.match_id.clone(),
            timestamp_ms: now_ms,
            winner_team_id: self.state.winner_team_id.clone().unwrap_or_default(),
            confidence: self.state.confidence,
            confirmed_by: self.state.sources_confirming.iter().cloned().collect(),
            finalized_at_ms: now_ms,
        }
    }

    fn delta(&self, reason: impl Into<String>) -> TruthDelta {
        TruthDelta {
            event_id: uuid::Uuid::new_v4().to_string(),
            match_id: self.state.match_id.clone(),
            timestamp_ms: self.state.last_event_ms,
            confidence: self.state.confidence,
            reason: reason.into(),
        }
    }

    /// Outcome of dispatching one admitted `MatchEvent`.
    pub fn on_event(&mut self, event: MatchEvent) -> Option<TruthOutcome> {
        if !self.admit(&event) {
            return None;
        }

        let tier = self.tier(&event.source);

        match (self.state.status, event.event_type) {
            (MatchStatus::PreMatch, MatchEventType::MatchStarted) => {
                self.state.status = MatchStatus::Live;
                None
            }
            (MatchStatus::PreMatch, MatchEventType::Paused) | (MatchStatus::Live, MatchEventType::Paused) => {
                self.state.status = MatchStatus::Paused;
                None
            }
            (MatchStatus::Live, MatchEventType::ScoreUpdate) => {
                let (score_a, score_b) = parse_scores(&event.payload, self.state.score_a, self.state.score_b);
                let changed = score_a != self.state.score_a || score_b != self.state.score_b;
                self.state.score_a = score_a;
                self.state.score_b = score_b;
                changed.then(|| TruthOutcome::Delta(self.delta("score")))
            }
            (MatchStatus::Live, MatchEventType::RoundEnded) => {
                self.state.round_index += 1;
                self.state.confidence = 0.6_f64.max(self.state.confidence);
                Some(TruthOutcome::Delta(self.delta("round_ended")))
            }
            (MatchStatus::Live, MatchEventType::MapEnded) => {
                self.state.map_index += 1;
                self.state.confidence = 0.75_f64.max(self.state.confidence);
                Some(TruthOutcome::Delta(self.delta("map_ended")))
            }
            (MatchStatus::Live, MatchEventType::MatchEnded)
            | (MatchStatus::Paused, MatchEventType::MatchEnded) => {
                self.state.status = MatchStatus::PendingConfirm;
                self.state.ended_at_ms = Some(event.timestamp_ms);
                self.state.winner_team_id = winner_from_payload(&event.payload);
                self.state.confidence = Self::seed_confidence(tier);
                self.state.sources_confirming.clear();
                self.state.sources_confirming.insert(event.source.clone());

                if self.finalization_criterion_met() {
                    Some(TruthOutcome::Final(self.finalize(event.timestamp_ms)))
                } else {
                    None
                }
            }
            (MatchStatus::Paused, MatchEventType::Resumed) => {
                self.state.status = MatchStatus::Live;
                None
            }
            (MatchStatus::PendingConfirm, MatchEventType::MatchEnded) => {
                let incoming_winner = winner_from_payload(&event.payload);
                if incoming_winner == self.state.winner_team_id {
                    self.state.sources_confirming.insert(event.source.clone());
                    let (bump, cap) = Self::confirm_bump(tier);
                    self.state.confidence = (self.state.confidence + bump).min(cap);

                    if self.finalization_criterion_met() {
                        Some(TruthOutcome::Final(self.finalize(event.timestamp_ms)))
                    } else {
                        None
                    }
                } else {
                    self.state.status = MatchStatus::Live;
                    self.state.winner_team_id = None;
                    self.state.ended_at_ms = None;
                    self.state.sources_confirming.clear();
                    self.state.confidence = 0.0;
                    Some(TruthOutcome::Delta(self.delta("contradiction")))
                }
            }
            (MatchStatus::Final, MatchEventType::Correction) => None,
            (MatchStatus::Final, _) => None,
            _ => None,
        }
    }

    /// Timeout finalization: in PENDING_CONFIRM, finalizes once
    /// `now_ms - ended_at_ms >= max_wait_ms`.
    pub fn tick(&mut self, now_ms: i64) -> Option<TruthFinal> {
        if self.state.status != MatchStatus::PendingConfirm {
            return None;
        }
        let ended_at_ms = self.state.ended_at_ms?;
        if now_ms - ended_at_ms >= self.config.max_wait_ms {
            Some(self.finalize(now_ms))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TruthOutcome {
    Delta(TruthDelta),
    Final(TruthFinal),
}

fn winner_from_payload(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("winner_team_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn parse_scores(payload: &serde_json::Value, cur_a: i64, cur_b: i64) -> (i64, i64) {
    let a = payload.get("score_a").and_then(|v| v.as_i64()).unwrap_or(cur_a);
    let b = payload.get("score_b").and_then(|v| v.as_i64()).unwrap_or(cur_b);
    (a, b)
}

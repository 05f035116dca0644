//! Error taxonomy shared across the bus and the two engines.
//!
//! Kinds, not type names: each variant here corresponds to one of the
//! failure classes a caller actually needs to branch on, not to an
//! implementation detail. `DuplicateEvent` and `Contradiction` are carried
//! as variants even though the engines treat them as non-fatal signals
//! rather than propagated errors; see the call sites in `domain::truth`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("backpressure: partition '{0}' is full under halt policy")]
    Backpressure(String),

    #[error("handler '{handler}' timed out after {attempt} attempt(s)")]
    HandlerTimeout { handler: String, attempt: u32 },

    #[error("handler '{handler}' failed: {message}")]
    HandlerException { handler: String, message: String },

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("duplicate event: {0}")]
    DuplicateEvent(String),

    #[error("truth contradiction for match {match_id}")]
    Contradiction { match_id: String },

    #[error("circuit breaker tripped for market {market_id}: {reason}")]
    CircuitBreakerTrip { market_id: String, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

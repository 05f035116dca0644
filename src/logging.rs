//! Structured logging setup and per-task context propagation.
//!
//! Uses `tracing`'s span stack rather than hand-rolled context vars to
//! bind run/market/match/order id to every log line emitted while a
//! task is in scope.

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global tracing subscriber. Call once at process start.
///
/// `level` is an `EnvFilter` directive (e.g. `"info"`, `"polyloly_core=debug"`);
/// `json` switches between human-readable and newline-delimited JSON output.
pub fn init(level: &str, json: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt().with_env_filter(filter).with_target(true);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Identifying fields threaded through a task via [`Context::scope`].
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub run_id: Option<String>,
    pub market_id: Option<String>,
    pub match_id: Option<String>,
    pub order_id: Option<String>,
}

impl Context {
    pub fn with_run_id(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Default::default()
        }
    }

    pub fn with_market_id(mut self, market_id: impl Into<String>) -> Self {
        self.market_id = Some(market_id.into());
        self
    }

    pub fn with_match_id(mut self, match_id: impl Into<String>) -> Self {
        self.match_id = Some(match_id.into());
        self
    }

    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    /// Runs `fut` inside a `tracing::Span` carrying these fields, so every
    /// log emitted underneath picks them up without threading them through
    /// every call site by hand.
    pub async fn scope<F, T>(&self, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let span = tracing::info_span!(
            "context",
            run_id = self.run_id.as_deref().unwrap_or(""),
            market_id = self.market_id.as_deref().unwrap_or(""),
            match_id = self.match_id.as_deref().unwrap_or(""),
            order_id = self.order_id.as_deref().unwrap_or(""),
        );
        use tracing::Instrument;
        fut.instrument(span).await
    }
}

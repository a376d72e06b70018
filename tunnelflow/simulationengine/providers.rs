use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tunnelflow_scheduling::domain::{CurrentState, ForecastSeries, HorizonKind, OptimizationResult};

/// Source of the observed station state and sink for recommended schedules.
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// State at `now`.
    async fn current_state(&self, now: DateTime<Utc>) -> Result<CurrentState>;

    /// Hands over the recommended schedule. Only the first step is acted upon.
    async fn write_schedule(&self, result: &OptimizationResult) -> Result<()>;
}

/// Source of inflow and price forecasts.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    /// Forecast of up to `steps` steps of `step_minutes` starting at `start`.
    ///
    /// A shorter series than requested is acceptable.
    async fn forecast(
        &self,
        kind: HorizonKind,
        start: DateTime<Utc>,
        steps: usize,
        step_minutes: u32,
    ) -> Result<ForecastSeries>;
}

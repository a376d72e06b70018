use std::{fmt, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tunnelflow_scheduling::domain::{OptimizationResult, SolveMode};

use crate::strategic::StrategicPlan;

/// Facts a narrative is written from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExplanationRequest {
    /// Tier that produced the schedule.
    pub mode: SolveMode,
    /// Horizon energy cost (EUR).
    pub total_cost: f64,
    /// Horizon energy (kWh).
    pub total_energy_kwh: f64,
    /// Pumps running in the first step.
    pub pumps_on_first_step: usize,
    /// Outflow in the first step (m³/s).
    pub first_step_outflow: f64,
    /// Level at the end of the horizon (m).
    pub final_level: Option<f64>,
    /// Band excursions.
    pub violation_count: usize,
    /// Strategic stance, if a plan was in effect.
    pub plan_type: Option<String>,
    /// Strategic reasoning, if a plan was in effect.
    pub plan_reasoning: Option<String>,
    /// Fallback notes of the cascade.
    pub notes: Vec<String>,
}

impl ExplanationRequest {
    /// Collects the facts from a result and an optional plan.
    #[must_use]
    pub fn new(result: &OptimizationResult, plan: Option<&StrategicPlan>) -> Self {
        Self {
            mode: result.mode,
            total_cost: result.total_cost,
            total_energy_kwh: result.total_energy_kwh,
            pumps_on_first_step: result.pumps_on_at(0),
            first_step_outflow: result.first_step_outflow(),
            final_level: result.level_trajectory.last().copied(),
            violation_count: result.violation_count,
            plan_type: plan.map(|plan| plan.plan_type.label().to_owned()),
            plan_reasoning: plan.map(|plan| plan.reasoning.clone()),
            notes: result.notes.clone(),
        }
    }
}

/// Turns a schedule into operator-facing text.
#[async_trait]
pub trait Explainer: Send + Sync + fmt::Debug {
    /// Explainer name for logs.
    fn name(&self) -> &'static str;

    /// Writes the narrative.
    async fn explain(&self, request: &ExplanationRequest) -> Result<String>;
}

/// Deterministic template narrative. Always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlgorithmicExplainer;

impl AlgorithmicExplainer {
    /// Synchronous form of [`Explainer::explain`].
    #[must_use]
    pub fn narrate(request: &ExplanationRequest) -> String {
        let mut text = format!(
            "{} schedule: {} pump(s) on, {:.2} m³/s in the first step, {:.1} kWh costing {:.2} EUR over the horizon",
            request.mode.label(),
            request.pumps_on_first_step,
            request.first_step_outflow,
            request.total_energy_kwh,
            request.total_cost,
        );
        if let Some(level) = request.final_level {
            text.push_str(&format!(", ending at {level:.2} m"));
        }
        text.push('.');
        if request.violation_count > 0 {
            text.push_str(&format!(
                " {} step(s) leave the level band.",
                request.violation_count
            ));
        }
        if let Some(reasoning) = &request.plan_reasoning {
            text.push_str(&format!(" Strategy {reasoning}."));
        }
        if !request.notes.is_empty() {
            text.push_str(&format!(" Fallbacks: {}.", request.notes.join("; ")));
        }
        text
    }
}

#[async_trait]
impl Explainer for AlgorithmicExplainer {
    fn name(&self) -> &'static str {
        "algorithmic"
    }

    async fn explain(&self, request: &ExplanationRequest) -> Result<String> {
        Ok(Self::narrate(request))
    }
}

#[derive(Debug, Deserialize)]
struct RemoteReply {
    narrative: String,
}

/// Narrative service reached over HTTP. Posts the request as JSON and expects `{"narrative": "..."}`.
#[derive(Debug, Clone)]
pub struct RemoteExplainer {
    client: Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl RemoteExplainer {
    /// Explainer posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("building explainer http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            auth_token: None,
        })
    }

    /// Bearer token for the service.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

#[async_trait]
impl Explainer for RemoteExplainer {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn explain(&self, request: &ExplanationRequest) -> Result<String> {
        let mut call = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.auth_token {
            call = call.bearer_auth(token);
        }
        let reply = call
            .send()
            .await
            .with_context(|| format!("explainer request to {} failed", self.endpoint))?
            .error_for_status()
            .context("explainer returned an error status")?
            .json::<RemoteReply>()
            .await
            .context("explainer reply is not valid json")?;
        Ok(reply.narrative)
    }
}

/// Narrative plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Narrative {
    /// Text.
    pub text: String,
    /// Explainer that produced it.
    pub source: String,
    /// True when the primary explainer failed or timed out.
    pub fell_back: bool,
}

/// Wraps an explainer with a deadline and the algorithmic fallback.
#[derive(Debug, Clone)]
pub struct BoundedExplainer {
    inner: Arc<dyn Explainer>,
    timeout: Duration,
}

impl BoundedExplainer {
    /// Bounds `inner` by `timeout`.
    #[must_use]
    pub fn new(inner: Arc<dyn Explainer>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Algorithmic-only explainer.
    #[must_use]
    pub fn algorithmic() -> Self {
        Self::new(Arc::new(AlgorithmicExplainer), Duration::from_secs(1))
    }

    /// Always returns a narrative.
    pub async fn narrate(&self, request: &ExplanationRequest) -> Narrative {
        match tokio::time::timeout(self.timeout, self.inner.explain(request)).await {
            Ok(Ok(text)) => Narrative {
                text,
                source: self.inner.name().to_owned(),
                fell_back: false,
            },
            Ok(Err(_)) | Err(_) => Narrative {
                text: AlgorithmicExplainer::narrate(request),
                source: AlgorithmicExplainer.name().to_owned(),
                fell_back: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Sleepy;

    #[async_trait]
    impl Explainer for Sleepy {
        fn name(&self) -> &'static str {
            "sleepy"
        }

        async fn explain(&self, _request: &ExplanationRequest) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    fn request() -> ExplanationRequest {
        ExplanationRequest {
            mode: SolveMode::Simplified,
            total_cost: 12.5,
            total_energy_kwh: 250.0,
            pumps_on_first_step: 2,
            first_step_outflow: 3.2,
            final_level: Some(3.9),
            violation_count: 0,
            plan_type: Some("balanced".into()),
            plan_reasoning: Some("balanced: no surge or price extremes ahead".into()),
            notes: vec!["full: Full solve timed out after 30s".into()],
        }
    }

    #[tokio::test]
    async fn algorithmic_narrative_mentions_mode_and_fallbacks() {
        let text = AlgorithmicExplainer.explain(&request()).await.unwrap();
        assert!(text.starts_with("simplified schedule"));
        assert!(text.contains("Fallbacks"));
        assert!(text.contains("Strategy balanced"));
    }

    #[tokio::test]
    async fn slow_explainer_falls_back() {
        let bounded = BoundedExplainer::new(Arc::new(Sleepy), Duration::from_millis(20));
        let narrative = bounded.narrate(&request()).await;
        assert!(narrative.fell_back);
        assert_eq!(narrative.source, "algorithmic");
    }

    #[tokio::test]
    async fn unreachable_remote_falls_back() {
        let remote = RemoteExplainer::new("http://127.0.0.1:9/explain", Duration::from_millis(200)).unwrap();
        let bounded = BoundedExplainer::new(Arc::new(remote), Duration::from_secs(2));
        let narrative = bounded.narrate(&request()).await;
        assert!(narrative.fell_back);
        assert!(!narrative.text.is_empty());
    }
}

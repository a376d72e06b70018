#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::module_name_repetitions,
    clippy::suboptimal_flops
)]

//! Tunnelflow planning – forecast quality, strategic 24h guidance and schedule narratives.

/// Rolling forecast-error statistics and confidence.
#[path = "../quality.rs"]
pub mod quality;

/// Strategic plan construction and caching.
#[path = "../strategic/main.rs"]
pub mod strategic;

/// Narrative explainers.
#[path = "../explainer.rs"]
pub mod explainer;

pub use explainer::{
    AlgorithmicExplainer, BoundedExplainer, ExplanationRequest, Explainer, Narrative,
    RemoteExplainer,
};
pub use quality::{Confidence, ForecastQualityTracker, QualityReport, Trend};
pub use strategic::{
    Bucket, BucketClass, CacheStatus, PlanCache, PlanPeriod, PlanType, StrategicPlan,
    StrategicPlanner,
};

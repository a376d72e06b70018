use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tunnelflow_scheduling::domain::{mean, std_dev, ForecastSeries, WeightMultipliers};

/// Bucket inflow above this multiple of the horizon mean is a surge risk.
pub const SURGE_RATIO: f64 = 1.3;
/// Price band half-width in standard deviations.
pub const PRICE_SIGMAS: f64 = 0.5;

/// Coarse character of one strategic period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketClass {
    /// Price below mean − 0.5σ.
    Cheap,
    /// Price above mean + 0.5σ.
    Expensive,
    /// Neither cheap nor expensive.
    Normal,
    /// Inflow high enough to threaten the band.
    SurgeRisk,
}

impl BucketClass {
    /// Label for logs and reasoning text.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Cheap => "cheap",
            Self::Expensive => "expensive",
            Self::Normal => "normal",
            Self::SurgeRisk => "surge_risk",
        }
    }

    /// Per-bucket adjustment layered over the plan's base multipliers.
    #[must_use]
    pub const fn factor(self) -> WeightMultipliers {
        match self {
            Self::Cheap => WeightMultipliers::new(1.0, 0.6, 1.0),
            Self::Expensive => WeightMultipliers::new(0.8, 1.5, 1.0),
            Self::SurgeRisk => WeightMultipliers::new(1.8, 0.5, 1.0),
            Self::Normal => WeightMultipliers::identity(),
        }
    }
}

/// Aggregated statistics of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket start.
    pub start: DateTime<Utc>,
    /// Bucket end (exclusive).
    pub end: DateTime<Utc>,
    /// Mean forecast inflow (m³/s).
    pub mean_inflow: f64,
    /// Mean forecast price (EUR/kWh).
    pub mean_price: f64,
    /// Classification.
    pub class: BucketClass,
}

/// Splits a strategic forecast into fixed-length buckets and classifies them.
///
/// `observed_inflow` is compared with the first forecast step; a ratio above
/// [`SURGE_RATIO`] marks the current bucket as a surge risk.
#[must_use]
pub fn classify_buckets(
    forecast: &ForecastSeries,
    period_hours: f64,
    observed_inflow: Option<f64>,
) -> Vec<Bucket> {
    let steps = forecast.len();
    if steps == 0 {
        return Vec::new();
    }
    let per_bucket = ((period_hours * 60.0 / f64::from(forecast.step_minutes.max(1))).round()
        as usize)
        .max(1);
    let inflow = &forecast.inflow_m3s[..steps];
    let price = &forecast.price_eur_kwh[..steps];
    let horizon_inflow = mean(inflow);
    let price_mean = mean(price);
    let price_std = std_dev(price, price_mean);
    let current_surge = match (observed_inflow, inflow.first()) {
        (Some(observed), Some(first)) => observed / first.max(0.1) > SURGE_RATIO,
        _ => false,
    };
    let step = Duration::minutes(i64::from(forecast.step_minutes));

    (0..steps)
        .step_by(per_bucket)
        .enumerate()
        .map(|(idx, from)| {
            let to = (from + per_bucket).min(steps);
            let mean_inflow = mean(&inflow[from..to]);
            let mean_price = mean(&price[from..to]);
            let surge = mean_inflow > SURGE_RATIO * horizon_inflow || (idx == 0 && current_surge);
            let class = if surge {
                BucketClass::SurgeRisk
            } else if mean_price < PRICE_SIGMAS.mul_add(-price_std, price_mean) {
                BucketClass::Cheap
            } else if mean_price > PRICE_SIGMAS.mul_add(price_std, price_mean) {
                BucketClass::Expensive
            } else {
                BucketClass::Normal
            };
            let start = forecast.timestamps[from];
            Bucket {
                start,
                end: forecast.timestamps[to - 1] + step,
                mean_inflow,
                mean_price,
                class,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelflow_scheduling::domain::HorizonKind;

    fn series(inflow: Vec<f64>, price: Vec<f64>) -> ForecastSeries {
        ForecastSeries::new(HorizonKind::Strategic, Utc::now(), 15, inflow, price)
    }

    #[test]
    fn buckets_follow_price_band() {
        // four 2h buckets: cheap, normal, expensive, normal
        let mut price = vec![0.04; 8];
        price.extend(vec![0.08; 8]);
        price.extend(vec![0.12; 8]);
        price.extend(vec![0.08; 8]);
        let buckets = classify_buckets(&series(vec![1.0; 32], price), 2.0, None);
        let classes: Vec<_> = buckets.iter().map(|b| b.class).collect();
        assert_eq!(
            classes,
            vec![
                BucketClass::Cheap,
                BucketClass::Normal,
                BucketClass::Expensive,
                BucketClass::Normal
            ]
        );
        assert_eq!(buckets[0].end, buckets[1].start);
    }

    #[test]
    fn high_inflow_bucket_is_surge_risk() {
        let mut inflow = vec![1.0; 24];
        inflow.extend(vec![3.0; 8]);
        let buckets = classify_buckets(&series(inflow, vec![0.08; 32]), 2.0, None);
        assert_eq!(buckets[3].class, BucketClass::SurgeRisk);
        assert_eq!(buckets[0].class, BucketClass::Normal);
    }

    #[test]
    fn observed_surge_marks_current_bucket() {
        let buckets = classify_buckets(&series(vec![1.0; 16], vec![0.08; 16]), 2.0, Some(1.5));
        assert_eq!(buckets[0].class, BucketClass::SurgeRisk);
        assert_eq!(buckets[1].class, BucketClass::Normal);
    }
}

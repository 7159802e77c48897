//! Statistical estimators over a VM's monitoring history

use crate::models::UsageHistory;
use crate::resource::{Resource, ResourceVector};
use serde::{Deserialize, Serialize};

/// Per-resource statistic computed over the bounded sample history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationStrategy {
    #[default]
    Average,
    Maximum,
    /// Nearest-rank quantile, the quantile itself is configured separately
    Percentile,
}

impl EstimationStrategy {
    /// Estimate over a non-empty history; an empty history yields zero
    pub fn estimate(&self, history: &UsageHistory, percentile: f64) -> ResourceVector {
        if history.is_empty() {
            return ResourceVector::ZERO;
        }

        match self {
            EstimationStrategy::Average => {
                let total: ResourceVector = history.iter().map(|s| s.usage).sum();
                total.scale(1.0 / history.len() as f64)
            }
            EstimationStrategy::Maximum => history
                .iter()
                .map(|s| s.usage)
                .fold(ResourceVector::ZERO, |acc, v| acc.zip_with(&v, f64::max)),
            EstimationStrategy::Percentile => ResourceVector::from_fn(|resource| {
                nearest_rank(history, resource, percentile)
            }),
        }
    }
}

fn nearest_rank(history: &UsageHistory, resource: Resource, percentile: f64) -> f64 {
    let mut values: Vec<f64> = history.iter().map(|s| s.usage.get(resource)).collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = (percentile.clamp(0.0, 1.0) * values.len() as f64).ceil() as usize;
    values[rank.saturating_sub(1).min(values.len() - 1)]
}

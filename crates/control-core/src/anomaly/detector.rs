//! Threshold crossing detection
//!
//! A host is overloaded when its estimated utilization exceeds the high
//! threshold in any dimension, and underloaded when it hosts at least one VM
//! and every dimension sits below the low threshold.

use super::Anomaly;
use crate::estimator::DemandEstimator;
use crate::models::LocalController;
use crate::resource::Resource;

pub struct ThresholdCrossingDetector<'a> {
    estimator: &'a DemandEstimator,
}

impl<'a> ThresholdCrossingDetector<'a> {
    pub fn new(estimator: &'a DemandEstimator) -> Self {
        Self { estimator }
    }

    pub fn detect(&self, lc: &LocalController) -> Option<Anomaly> {
        let utilization = self.estimator.utilization(lc);
        let thresholds = self.estimator.thresholds();
        let high = thresholds.high();
        let low = thresholds.low();

        if Resource::ALL
            .iter()
            .any(|&r| utilization.get(r) > high.get(r))
        {
            return Some(Anomaly::Overloaded);
        }

        if !lc.is_idle()
            && Resource::ALL
                .iter()
                .all(|&r| utilization.get(r) < low.get(r))
        {
            return Some(Anomaly::Underloaded);
        }

        None
    }
}

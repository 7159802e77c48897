//! Host anomaly detection and resolution
//!
//! This module provides:
//! - Threshold crossing detection over estimated host utilization
//! - Debouncing so a single transient observation does not trigger relocation

mod detector;
mod resolver;

pub use detector::ThresholdCrossingDetector;
pub use resolver::AnomalyResolver;

use serde::{Deserialize, Serialize};

/// Condition reported for a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    Overloaded,
    Underloaded,
}

impl Anomaly {
    pub fn as_str(&self) -> &'static str {
        match self {
            Anomaly::Overloaded => "overloaded",
            Anomaly::Underloaded => "underloaded",
        }
    }
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

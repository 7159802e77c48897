//! Control states and transition notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the group manager is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemState {
    #[default]
    Idle,
    Management,
    Reconfiguration,
    Relocation,
    #[serde(rename = "ENERGYSAVER")]
    EnergySaver,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Idle => "IDLE",
            SystemState::Management => "MANAGEMENT",
            SystemState::Reconfiguration => "RECONFIGURATION",
            SystemState::Relocation => "RELOCATION",
            SystemState::EnergySaver => "ENERGYSAVER",
        }
    }
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on every state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub old: SystemState,
    pub new: SystemState,
    /// Operation that caused the change
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(SystemState::EnergySaver.to_string(), "ENERGYSAVER");
        assert_eq!(
            serde_json::to_string(&SystemState::EnergySaver).unwrap(),
            "\"ENERGYSAVER\""
        );
        assert_eq!(
            serde_json::to_string(&SystemState::Reconfiguration).unwrap(),
            "\"RECONFIGURATION\""
        );
        assert_eq!(SystemState::default(), SystemState::Idle);
    }
}

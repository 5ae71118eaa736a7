use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::event::ComponentSource;
use super::mode::SystemMode;
use super::reason::ReasonCode;

/// Audit record of a single mode mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from_mode: SystemMode,
    pub to_mode: SystemMode,
    pub reason_code: ReasonCode,
    pub source: ComponentSource,
    pub wall_timestamp: DateTime<Utc>,
    /// Milliseconds since the owning state service was created
    pub monotonic_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_ttl_secs: Option<u64>,
}

impl ModeTransition {
    pub fn is_override(&self) -> bool {
        self.operator_id.is_some()
    }
}

/// Active operator override of the automatic state machine
#[derive(Debug, Clone)]
pub struct ForceOverrideState {
    pub mode: SystemMode,
    pub ttl: Duration,
    pub operator_id: String,
    pub reason: String,
    pub start_monotonic: Instant,
    pub start_wall: DateTime<Utc>,
}

impl ForceOverrideState {
    pub fn new(mode: SystemMode, ttl: Duration, operator_id: &str, reason: &str) -> Self {
        Self {
            mode,
            ttl,
            operator_id: operator_id.to_string(),
            reason: reason.to_string(),
            start_monotonic: Instant::now(),
            start_wall: Utc::now(),
        }
    }

    /// Elapsed strictly beyond the TTL
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.start_monotonic) > self.ttl
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.start_monotonic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_override_expiry_is_strict() {
        let ov = ForceOverrideState::new(
            SystemMode::Halt,
            Duration::from_secs(10),
            "ops-1",
            "maintenance",
        );
        let start = ov.start_monotonic;

        assert!(!ov.is_expired_at(start + Duration::from_secs(10)));
        assert!(ov.is_expired_at(start + Duration::from_millis(10_001)));
        assert_eq!(
            ov.remaining_at(start + Duration::from_secs(4)),
            Duration::from_secs(6)
        );
    }
}

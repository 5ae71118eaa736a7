use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::reason::ReasonCode;

/// Kind of a system event, used for routing and must-deliver classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    BreakerUnstable,
    BreakerTripped,
    BreakerRecovered,
    ModeChanged,
    ManualOverride,
    RecoveryStarted,
    RecoveryStageAdvanced,
    RecoveryCompleted,
    RecoveryFailed,
    DbBufferOverflow,
    HealthReport,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BreakerUnstable => "BREAKER_UNSTABLE",
            EventType::BreakerTripped => "BREAKER_TRIPPED",
            EventType::BreakerRecovered => "BREAKER_RECOVERED",
            EventType::ModeChanged => "MODE_CHANGED",
            EventType::ManualOverride => "MANUAL_OVERRIDE",
            EventType::RecoveryStarted => "RECOVERY_STARTED",
            EventType::RecoveryStageAdvanced => "RECOVERY_STAGE_ADVANCED",
            EventType::RecoveryCompleted => "RECOVERY_COMPLETED",
            EventType::RecoveryFailed => "RECOVERY_FAILED",
            EventType::DbBufferOverflow => "DB_BUFFER_OVERFLOW",
            EventType::HealthReport => "HEALTH_REPORT",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Component that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentSource {
    Broker,
    MarketData,
    Risk,
    Database,
    Alerting,
    StateService,
    Recovery,
    Operator,
    System,
}

impl ComponentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentSource::Broker => "broker",
            ComponentSource::MarketData => "market_data",
            ComponentSource::Risk => "risk",
            ComponentSource::Database => "database",
            ComponentSource::Alerting => "alerting",
            ComponentSource::StateService => "state_service",
            ComponentSource::Recovery => "recovery",
            ComponentSource::Operator => "operator",
            ComponentSource::System => "system",
        }
    }
}

impl fmt::Display for ComponentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Immutable health/control event
///
/// Built once (optionally decorated with details through the `with_*`
/// builders) and then only read. Cloned when fanned out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    event_type: EventType,
    source: ComponentSource,
    severity: Severity,
    reason_code: ReasonCode,
    #[serde(default)]
    details: serde_json::Map<String, serde_json::Value>,
    timestamp: DateTime<Utc>,
}

impl SystemEvent {
    pub fn new(
        event_type: EventType,
        source: ComponentSource,
        severity: Severity,
        reason_code: ReasonCode,
    ) -> Self {
        Self {
            event_type,
            source,
            severity,
            reason_code,
            details: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Health report from an external producer, routed only by its reason code
    pub fn health(source: ComponentSource, reason_code: ReasonCode) -> Self {
        let severity = match reason_code.target_mode().priority() {
            0 => Severity::Info,
            1..=3 => Severity::Warning,
            _ => Severity::Critical,
        };
        Self::new(EventType::HealthReport, source, severity, reason_code)
    }

    /// Attach a detail entry
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn source(&self) -> ComponentSource {
        self.source
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn reason_code(&self) -> ReasonCode {
        self.reason_code
    }

    pub fn details(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.details
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

use super::mode::SystemMode;

/// Cause attached to every system event and mode transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    ColdStart,
    AllHealthy,
    // Broker
    BrokerUnstable,
    BrokerDisconnect,
    BrokerReconnected,
    // Market data
    MdDelayed,
    MdStale,
    // Risk engine
    RiskEngineSlow,
    RiskEngineDown,
    RiskBreachSoft,
    RiskBreachHard,
    // Database
    DbSlow,
    DbWriteFail,
    DbBufferFull,
    // Alerting
    AlertChannelDown,
    // Reconciliation / recovery
    ReconcileMismatch,
    RecoveryStarted,
    RecoveryFailed,
    // Operator
    ManualHalt,
    ManualOverride,
}

impl ReasonCode {
    /// Decision matrix: the mode this cause asks the system to enter
    pub fn target_mode(&self) -> SystemMode {
        use ReasonCode::*;

        match self {
            ColdStart => SystemMode::SafeModeDisconnected,
            AllHealthy => SystemMode::Normal,

            BrokerUnstable => SystemMode::Degraded,
            BrokerDisconnect => SystemMode::SafeModeDisconnected,
            BrokerReconnected => SystemMode::Recovering,

            MdDelayed => SystemMode::Degraded,
            MdStale => SystemMode::SafeMode,

            RiskEngineSlow => SystemMode::Degraded,
            RiskEngineDown => SystemMode::SafeMode,
            RiskBreachSoft => SystemMode::Degraded,
            RiskBreachHard => SystemMode::Halt,

            DbSlow => SystemMode::Degraded,
            DbWriteFail => SystemMode::Degraded,
            DbBufferFull => SystemMode::SafeMode,

            AlertChannelDown => SystemMode::Degraded,

            ReconcileMismatch => SystemMode::SafeMode,
            RecoveryStarted => SystemMode::Recovering,
            RecoveryFailed => SystemMode::SafeMode,

            ManualHalt => SystemMode::Halt,
            // Submitted as an event this is treated as an operator halt request;
            // force_mode itself never consults the matrix.
            ManualOverride => SystemMode::Halt,
        }
    }

    /// Causes allowed to lower global severity.
    ///
    /// ALL_HEALTHY may always return the system to NORMAL and
    /// BROKER_RECONNECTED may always move it into RECOVERING.
    pub fn is_recovery_path(&self) -> bool {
        matches!(
            (self, self.target_mode()),
            (ReasonCode::AllHealthy, SystemMode::Normal)
                | (ReasonCode::BrokerReconnected, SystemMode::Recovering)
        )
    }

    pub fn as_str(&self) -> &'static str {
        use ReasonCode::*;

        match self {
            ColdStart => "COLD_START",
            AllHealthy => "ALL_HEALTHY",
            BrokerUnstable => "BROKER_UNSTABLE",
            BrokerDisconnect => "BROKER_DISCONNECT",
            BrokerReconnected => "BROKER_RECONNECTED",
            MdDelayed => "MD_DELAYED",
            MdStale => "MD_STALE",
            RiskEngineSlow => "RISK_ENGINE_SLOW",
            RiskEngineDown => "RISK_ENGINE_DOWN",
            RiskBreachSoft => "RISK_BREACH_SOFT",
            RiskBreachHard => "RISK_BREACH_HARD",
            DbSlow => "DB_SLOW",
            DbWriteFail => "DB_WRITE_FAIL",
            DbBufferFull => "DB_BUFFER_FULL",
            AlertChannelDown => "ALERT_CHANNEL_DOWN",
            ReconcileMismatch => "RECONCILE_MISMATCH",
            RecoveryStarted => "RECOVERY_STARTED",
            RecoveryFailed => "RECOVERY_FAILED",
            ManualHalt => "MANUAL_HALT",
            ManualOverride => "MANUAL_OVERRIDE",
        }
    }

    pub const ALL: [ReasonCode; 20] = [
        ReasonCode::ColdStart,
        ReasonCode::AllHealthy,
        ReasonCode::BrokerUnstable,
        ReasonCode::BrokerDisconnect,
        ReasonCode::BrokerReconnected,
        ReasonCode::MdDelayed,
        ReasonCode::MdStale,
        ReasonCode::RiskEngineSlow,
        ReasonCode::RiskEngineDown,
        ReasonCode::RiskBreachSoft,
        ReasonCode::RiskBreachHard,
        ReasonCode::DbSlow,
        ReasonCode::DbWriteFail,
        ReasonCode::DbBufferFull,
        ReasonCode::AlertChannelDown,
        ReasonCode::ReconcileMismatch,
        ReasonCode::RecoveryStarted,
        ReasonCode::RecoveryFailed,
        ReasonCode::ManualHalt,
        ReasonCode::ManualOverride,
    ];
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

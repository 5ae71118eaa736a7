use serde::{Deserialize, Serialize};
use std::fmt;

/// System-wide operating mode
///
/// Exactly one mode is current at any time. The variants are declared from
/// least to most severe and `priority()` encodes that total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemMode {
    /// All dependencies healthy, full trading
    Normal,
    /// A non-critical dependency is impaired
    Degraded,
    /// New risk is blocked, existing orders may be managed
    SafeMode,
    /// Broker unreachable, only local bookkeeping possible
    SafeModeDisconnected,
    /// Staged recovery in progress
    Recovering,
    /// Nothing is allowed
    Halt,
}

impl SystemMode {
    pub const ALL: [SystemMode; 6] = [
        SystemMode::Normal,
        SystemMode::Degraded,
        SystemMode::SafeMode,
        SystemMode::SafeModeDisconnected,
        SystemMode::Recovering,
        SystemMode::Halt,
    ];

    /// Severity used for conflict resolution (higher = more severe)
    pub fn priority(&self) -> u8 {
        match self {
            SystemMode::Normal => 0,
            SystemMode::Degraded => 1,
            SystemMode::SafeMode => 2,
            SystemMode::SafeModeDisconnected => 3,
            SystemMode::Recovering => 4,
            SystemMode::Halt => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemMode::Normal => "NORMAL",
            SystemMode::Degraded => "DEGRADED",
            SystemMode::SafeMode => "SAFE_MODE",
            SystemMode::SafeModeDisconnected => "SAFE_MODE_DISCONNECTED",
            SystemMode::Recovering => "RECOVERING",
            SystemMode::Halt => "HALT",
        }
    }

    /// Is a move from `self` to `target` a severity escalation (or lateral move)?
    pub fn allows_escalation_to(&self, target: SystemMode) -> bool {
        target.priority() >= self.priority()
    }

    /// The more severe of two modes
    pub fn most_severe(self, other: SystemMode) -> SystemMode {
        if other.priority() > self.priority() {
            other
        } else {
            self
        }
    }
}

impl Default for SystemMode {
    fn default() -> Self {
        SystemMode::SafeModeDisconnected
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stages of the recovery protocol, in execution order
///
/// Only meaningful while the system mode is `Recovering`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStage {
    ConnectBroker,
    CatchupMarketdata,
    VerifyRisk,
    Ready,
}

impl RecoveryStage {
    pub const FIRST: RecoveryStage = RecoveryStage::ConnectBroker;

    /// Next stage in the sequence, `None` from `Ready`
    pub fn next(&self) -> Option<RecoveryStage> {
        match self {
            RecoveryStage::ConnectBroker => Some(RecoveryStage::CatchupMarketdata),
            RecoveryStage::CatchupMarketdata => Some(RecoveryStage::VerifyRisk),
            RecoveryStage::VerifyRisk => Some(RecoveryStage::Ready),
            RecoveryStage::Ready => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStage::ConnectBroker => "CONNECT_BROKER",
            RecoveryStage::CatchupMarketdata => "CATCHUP_MARKETDATA",
            RecoveryStage::VerifyRisk => "VERIFY_RISK",
            RecoveryStage::Ready => "READY",
        }
    }
}

impl fmt::Display for RecoveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

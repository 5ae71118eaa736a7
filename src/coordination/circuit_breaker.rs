//! Component Circuit Breakers
//!
//! One breaker per monitored dependency. A breaker turns a stream of
//! failure/success reports into level changes with hysteresis: it trips after
//! `fail_threshold_count` consecutive failures or once failures have persisted
//! for `fail_threshold_seconds`, and resets immediately on the first success.
//!
//! Breakers carry no lock. Each one belongs to the monitoring loop of its
//! dependency; share it only behind an external mutex.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{ComponentSource, EventType, ReasonCode, Severity, SystemEvent, SystemMode};
use crate::error::{Result, SentinelError};

/// Local health level of a breaker, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerLevel {
    Healthy,
    Unstable,
    Tripped,
}

impl BreakerLevel {
    /// Project a global mode onto the breaker scale
    pub fn from_mode(mode: SystemMode) -> Self {
        match mode {
            SystemMode::Normal => BreakerLevel::Healthy,
            SystemMode::Degraded => BreakerLevel::Unstable,
            _ => BreakerLevel::Tripped,
        }
    }
}

impl fmt::Display for BreakerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerLevel::Healthy => write!(f, "healthy"),
            BreakerLevel::Unstable => write!(f, "unstable"),
            BreakerLevel::Tripped => write!(f, "tripped"),
        }
    }
}

/// Monitored dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerKind {
    Broker,
    MarketData,
    Risk,
    Database,
}

impl BreakerKind {
    pub const ALL: [BreakerKind; 4] = [
        BreakerKind::Broker,
        BreakerKind::MarketData,
        BreakerKind::Risk,
        BreakerKind::Database,
    ];

    pub fn source(&self) -> ComponentSource {
        match self {
            BreakerKind::Broker => ComponentSource::Broker,
            BreakerKind::MarketData => ComponentSource::MarketData,
            BreakerKind::Risk => ComponentSource::Risk,
            BreakerKind::Database => ComponentSource::Database,
        }
    }

    pub fn unstable_reason(&self) -> ReasonCode {
        match self {
            BreakerKind::Broker => ReasonCode::BrokerUnstable,
            BreakerKind::MarketData => ReasonCode::MdDelayed,
            BreakerKind::Risk => ReasonCode::RiskEngineSlow,
            BreakerKind::Database => ReasonCode::DbSlow,
        }
    }

    pub fn tripped_reason(&self) -> ReasonCode {
        match self {
            BreakerKind::Broker => ReasonCode::BrokerDisconnect,
            BreakerKind::MarketData => ReasonCode::MdStale,
            BreakerKind::Risk => ReasonCode::RiskEngineDown,
            BreakerKind::Database => ReasonCode::DbWriteFail,
        }
    }

    /// Only the broker has a dedicated reconnection code
    pub fn recovered_reason(&self) -> ReasonCode {
        match self {
            BreakerKind::Broker => ReasonCode::BrokerReconnected,
            _ => ReasonCode::AllHealthy,
        }
    }
}

impl fmt::Display for BreakerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source())
    }
}

/// Hysteresis thresholds for one breaker
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker
    #[serde(default = "default_fail_threshold_count")]
    pub fail_threshold_count: u32,
    /// Seconds of sustained failure that trip the breaker
    #[serde(default = "default_fail_threshold_seconds")]
    pub fail_threshold_seconds: u64,
}

fn default_fail_threshold_count() -> u32 {
    3
}

fn default_fail_threshold_seconds() -> u64 {
    30
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold_count: default_fail_threshold_count(),
            fail_threshold_seconds: default_fail_threshold_seconds(),
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fail_threshold_count == 0 {
            return Err(SentinelError::validation(
                "fail_threshold_count must be greater than 0",
            ));
        }
        if self.fail_threshold_seconds == 0 {
            return Err(SentinelError::validation(
                "fail_threshold_seconds must be greater than 0",
            ));
        }
        Ok(())
    }

    fn fail_threshold_duration(&self) -> Duration {
        Duration::from_secs(self.fail_threshold_seconds)
    }
}

/// Capability set shared by all component breakers
pub trait ComponentBreaker: Send {
    /// Dependency this breaker watches
    fn kind(&self) -> BreakerKind;

    /// Current local level
    fn level(&self) -> BreakerLevel;

    /// Report one failure; returns an event only when the level changes
    fn record_failure(&mut self) -> Option<SystemEvent>;

    /// Report one success; returns an event only when leaving a failing level
    fn record_success(&mut self) -> Option<SystemEvent>;

    /// Local state can only tighten the externally visible severity
    fn effective_level(&self, central_level: BreakerLevel) -> BreakerLevel {
        self.level().max(central_level)
    }

    fn is_tripped(&self) -> bool {
        self.level() == BreakerLevel::Tripped
    }
}

/// Point-in-time view for monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub kind: BreakerKind,
    pub level: BreakerLevel,
    pub failure_count: u32,
    pub failing_for: Option<Duration>,
}

/// Count- and time-based breaker for a single dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    kind: BreakerKind,
    config: BreakerConfig,
    level: BreakerLevel,
    failure_count: u32,
    first_failure: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a breaker in the HEALTHY state
    pub fn new(kind: BreakerKind, config: BreakerConfig) -> Self {
        Self {
            kind,
            config,
            level: BreakerLevel::Healthy,
            failure_count: 0,
            first_failure: None,
        }
    }

    /// Create with default thresholds
    pub fn with_defaults(kind: BreakerKind) -> Self {
        Self::new(kind, BreakerConfig::default())
    }

    pub fn broker(config: BreakerConfig) -> Self {
        Self::new(BreakerKind::Broker, config)
    }

    pub fn market_data(config: BreakerConfig) -> Self {
        Self::new(BreakerKind::MarketData, config)
    }

    pub fn risk(config: BreakerConfig) -> Self {
        Self::new(BreakerKind::Risk, config)
    }

    pub fn database(config: BreakerConfig) -> Self {
        Self::new(BreakerKind::Database, config)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn first_failure(&self) -> Option<Instant> {
        self.first_failure
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            kind: self.kind,
            level: self.level,
            failure_count: self.failure_count,
            failing_for: self.first_failure.map(|t| t.elapsed()),
        }
    }

    fn should_trip(&self, now: Instant) -> bool {
        if self.failure_count >= self.config.fail_threshold_count {
            return true;
        }
        match self.first_failure {
            Some(first) => {
                now.saturating_duration_since(first) >= self.config.fail_threshold_duration()
            }
            None => false,
        }
    }

    fn event(&self, event_type: EventType, severity: Severity, reason: ReasonCode) -> SystemEvent {
        let failing_for_ms = self
            .first_failure
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        SystemEvent::new(event_type, self.kind.source(), severity, reason)
            .with_detail("component", self.kind.source().as_str())
            .with_detail("level", self.level.to_string())
            .with_detail("failure_count", self.failure_count)
            .with_detail("failing_for_ms", failing_for_ms)
    }
}

impl ComponentBreaker for CircuitBreaker {
    fn kind(&self) -> BreakerKind {
        self.kind
    }

    fn level(&self) -> BreakerLevel {
        self.level
    }

    fn record_failure(&mut self) -> Option<SystemEvent> {
        if self.level == BreakerLevel::Tripped {
            // Already tripped: no state change, no event storm
            return None;
        }

        let now = Instant::now();
        self.failure_count += 1;
        if self.first_failure.is_none() {
            self.first_failure = Some(now);
        }

        if self.should_trip(now) {
            self.level = BreakerLevel::Tripped;
            warn!(
                component = %self.kind,
                failures = self.failure_count,
                "Breaker TRIPPED"
            );
            return Some(self.event(
                EventType::BreakerTripped,
                Severity::Critical,
                self.kind.tripped_reason(),
            ));
        }

        if self.level == BreakerLevel::Healthy {
            self.level = BreakerLevel::Unstable;
            warn!(
                component = %self.kind,
                failures = self.failure_count,
                "Breaker unstable"
            );
            return Some(self.event(
                EventType::BreakerUnstable,
                Severity::Warning,
                self.kind.unstable_reason(),
            ));
        }

        debug!(
            component = %self.kind,
            failures = self.failure_count,
            "Breaker failure recorded"
        );
        None
    }

    fn record_success(&mut self) -> Option<SystemEvent> {
        if self.level == BreakerLevel::Healthy {
            return None;
        }

        let previous = self.level;
        self.failure_count = 0;
        self.first_failure = None;
        self.level = BreakerLevel::Healthy;

        info!(component = %self.kind, from = %previous, "Breaker recovered");

        Some(
            self.event(
                EventType::BreakerRecovered,
                Severity::Info,
                self.kind.recovered_reason(),
            )
            .with_detail("previous_level", previous.to_string()),
        )
    }
}

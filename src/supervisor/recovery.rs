//! Recovery Orchestrator
//!
//! Drives the system out of a degraded mode through an ordered sequence of
//! verification stages:
//!
//! `CONNECT_BROKER -> CATCHUP_MARKETDATA -> VERIFY_RISK -> READY -> NORMAL`
//!
//! Each recovery attempt is identified by a fresh `run_id`. Starting a new
//! run invalidates the previous id outright; any command carrying a stale id
//! is a no-op that returns `false`. Stage checks run without holding the run
//! lock, and the run is re-validated afterwards, so a run superseded while
//! its check was in flight can never move the stage. The state service only
//! accepts a stage move from the stage it currently holds, so a run whose
//! view drifted (the mode left RECOVERING and came back) stalls instead of
//! skipping stages.
//!
//! Leaving READY requires, besides a passing check, that the run has been in
//! READY for at least `ready_stable_secs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordination::SystemStateService;
use crate::domain::{
    ComponentSource, EventType, ReasonCode, RecoveryStage, Severity, SystemEvent, SystemMode,
};
use crate::error::{Result, SentinelError};
use crate::services::EventBus;

/// Configuration for the recovery orchestrator
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecoveryConfig {
    /// Minimum time in READY before the run may complete
    #[serde(default = "default_ready_stable_secs")]
    pub ready_stable_secs: u64,
}

fn default_ready_stable_secs() -> u64 {
    30
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            ready_stable_secs: default_ready_stable_secs(),
        }
    }
}

/// Who asked for the recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryTrigger {
    Manual,
    Auto,
}

impl fmt::Display for RecoveryTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryTrigger::Manual => write!(f, "MANUAL"),
            RecoveryTrigger::Auto => write!(f, "AUTO"),
        }
    }
}

/// The single authoritative recovery attempt
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryRun {
    pub run_id: Uuid,
    pub trigger: RecoveryTrigger,
    pub operator_id: Option<String>,
    pub current_stage: RecoveryStage,
    pub started_at: DateTime<Utc>,
    pub stage_entered_at: Instant,
    pub ready_since: Option<Instant>,
}

/// Health verification for one recovery stage.
///
/// May be called repeatedly for the same stage; implementations must be
/// idempotent and cancellation-safe. `Err` counts as a failed check.
#[async_trait]
pub trait StageCheck: Send + Sync {
    async fn check(&self, stage: RecoveryStage) -> Result<bool>;
}

/// Staged recovery driver
pub struct RecoveryOrchestrator {
    state: Arc<SystemStateService>,
    checks: Arc<dyn StageCheck>,
    bus: Option<Arc<EventBus>>,
    config: RecoveryConfig,
    current: Mutex<Option<RecoveryRun>>,
}

impl RecoveryOrchestrator {
    pub fn new(
        config: RecoveryConfig,
        state: Arc<SystemStateService>,
        checks: Arc<dyn StageCheck>,
    ) -> Self {
        Self {
            state,
            checks,
            bus: None,
            config,
            current: Mutex::new(None),
        }
    }

    /// Publish recovery lifecycle events to this bus
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub async fn is_recovering(&self) -> bool {
        self.current.lock().await.is_some()
    }

    pub async fn current_run_id(&self) -> Option<Uuid> {
        self.current.lock().await.as_ref().map(|r| r.run_id)
    }

    pub async fn current_stage(&self) -> Option<RecoveryStage> {
        self.current.lock().await.as_ref().map(|r| r.current_stage)
    }

    pub async fn current_run(&self) -> Option<RecoveryRun> {
        self.current.lock().await.clone()
    }

    /// Begin a new recovery run, superseding any active one.
    ///
    /// MANUAL runs require an operator id. Fails with `InvalidState` when a
    /// force override prevents entering RECOVERING.
    pub async fn start_recovery(
        &self,
        trigger: RecoveryTrigger,
        operator_id: Option<&str>,
    ) -> Result<Uuid> {
        if trigger == RecoveryTrigger::Manual && operator_id.is_none() {
            return Err(SentinelError::validation(
                "manual recovery requires an operator_id",
            ));
        }

        let mut current = self.current.lock().await;

        let entered = self
            .state
            .apply_recovery_transition(
                SystemMode::Recovering,
                Some(RecoveryStage::FIRST),
                ReasonCode::RecoveryStarted,
                ComponentSource::Recovery,
            )
            .await;
        if !entered {
            return Err(SentinelError::invalid_state(
                "force override active, cannot enter RECOVERING",
            ));
        }

        if let Some(previous) = current.as_ref() {
            info!(
                previous_run = %previous.run_id,
                previous_stage = %previous.current_stage,
                "Superseding active recovery run"
            );
        }

        let now = Instant::now();
        let run = RecoveryRun {
            run_id: Uuid::new_v4(),
            trigger,
            operator_id: operator_id.map(String::from),
            current_stage: RecoveryStage::FIRST,
            started_at: Utc::now(),
            stage_entered_at: now,
            ready_since: None,
        };
        let run_id = run.run_id;

        info!(%run_id, %trigger, ?operator_id, "Recovery started");
        self.publish(
            SystemEvent::new(
                EventType::RecoveryStarted,
                ComponentSource::Recovery,
                Severity::Warning,
                ReasonCode::RecoveryStarted,
            )
            .with_detail("run_id", run_id.to_string())
            .with_detail("trigger", trigger.to_string())
            .with_detail("operator_id", operator_id.unwrap_or_default()),
        );

        *current = Some(run);
        Ok(run_id)
    }

    /// Try to move run `run_id` one stage forward.
    ///
    /// Returns `false` without changing anything when the run is not current,
    /// the stage check fails, or READY has not been stable long enough.
    pub async fn advance_stage(&self, run_id: Uuid) -> bool {
        let stage = {
            let current = self.current.lock().await;
            let Some(run) = current.as_ref() else {
                debug!(%run_id, "advance_stage with no active recovery");
                return false;
            };
            if run.run_id != run_id {
                debug!(%run_id, active = %run.run_id, "advance_stage with stale run id");
                return false;
            }
            if run.current_stage == RecoveryStage::Ready && !self.ready_is_stable(run) {
                debug!(%run_id, "READY not yet stable");
                return false;
            }
            run.current_stage
        };

        let passed = match self.checks.check(stage).await {
            Ok(passed) => passed,
            Err(e) => {
                warn!(%run_id, %stage, "Stage check errored: {}", e);
                false
            }
        };
        if !passed {
            info!(%run_id, %stage, "Stage check failed, stage unchanged");
            return false;
        }

        let mut current = self.current.lock().await;
        let Some(run) = current
            .as_mut()
            .filter(|r| r.run_id == run_id && r.current_stage == stage)
        else {
            info!(%run_id, %stage, "Run superseded while stage check was running");
            return false;
        };

        match stage.next() {
            Some(next) => {
                if let Err(e) = self.state.advance_recovery_stage(stage, next).await {
                    warn!(%run_id, %next, "Cannot advance recovery stage: {}", e);
                    return false;
                }

                let now = Instant::now();
                run.current_stage = next;
                run.stage_entered_at = now;
                if next == RecoveryStage::Ready {
                    run.ready_since = Some(now);
                }

                info!(%run_id, from = %stage, to = %next, "Recovery stage advanced");
                self.publish(
                    SystemEvent::new(
                        EventType::RecoveryStageAdvanced,
                        ComponentSource::Recovery,
                        Severity::Info,
                        ReasonCode::RecoveryStarted,
                    )
                    .with_detail("run_id", run_id.to_string())
                    .with_detail("from_stage", stage.as_str())
                    .with_detail("to_stage", next.as_str()),
                );
                true
            }
            None => {
                if !self.state.complete_recovery().await {
                    return false;
                }

                *current = None;
                info!(%run_id, "Recovery completed, system NORMAL");
                self.publish(
                    SystemEvent::new(
                        EventType::RecoveryCompleted,
                        ComponentSource::Recovery,
                        Severity::Info,
                        ReasonCode::AllHealthy,
                    )
                    .with_detail("run_id", run_id.to_string()),
                );
                true
            }
        }
    }

    /// Abandon run `run_id`, dropping the system to SAFE_MODE.
    ///
    /// No-op (returns `false`) if `run_id` is not the active run.
    pub async fn abort_recovery(&self, run_id: Uuid, reason: &str) -> bool {
        let mut current = self.current.lock().await;
        match current.as_ref() {
            Some(run) if run.run_id == run_id => {}
            _ => {
                debug!(%run_id, "abort_recovery with stale or missing run id");
                return false;
            }
        }

        let stage = current.as_ref().map(|r| r.current_stage);
        let applied = self
            .state
            .apply_recovery_transition(
                SystemMode::SafeMode,
                None,
                ReasonCode::RecoveryFailed,
                ComponentSource::Recovery,
            )
            .await;
        if !applied {
            warn!(%run_id, "Abort could not change mode (force override active)");
        }

        *current = None;
        warn!(%run_id, ?stage, reason, "Recovery aborted");
        self.publish(
            SystemEvent::new(
                EventType::RecoveryFailed,
                ComponentSource::Recovery,
                Severity::Critical,
                ReasonCode::RecoveryFailed,
            )
            .with_detail("run_id", run_id.to_string())
            .with_detail("reason", reason),
        );
        true
    }

    fn ready_is_stable(&self, run: &RecoveryRun) -> bool {
        let required = Duration::from_secs(self.config.ready_stable_secs);
        run.ready_since
            .map(|since| since.elapsed() >= required)
            .unwrap_or(false)
    }

    fn publish(&self, event: SystemEvent) {
        if let Some(bus) = &self.bus {
            if !bus.publish(event) {
                debug!("Recovery event dropped by event bus");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{NoopGate, StateServiceConfig};

    struct AlwaysPass;

    #[async_trait]
    impl StageCheck for AlwaysPass {
        async fn check(&self, _stage: RecoveryStage) -> Result<bool> {
            Ok(true)
        }
    }

    fn orchestrator(ready_stable_secs: u64) -> RecoveryOrchestrator {
        let state = Arc::new(SystemStateService::new(
            StateServiceConfig::default(),
            Arc::new(NoopGate),
        ));
        RecoveryOrchestrator::new(
            RecoveryConfig { ready_stable_secs },
            state,
            Arc::new(AlwaysPass),
        )
    }

    #[tokio::test]
    async fn test_manual_requires_operator() {
        let orch = orchestrator(0);
        let err = orch
            .start_recovery(RecoveryTrigger::Manual, None)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(!orch.is_recovering().await);
    }

    #[tokio::test]
    async fn test_auto_allows_missing_operator() {
        let orch = orchestrator(0);
        let run_id = orch
            .start_recovery(RecoveryTrigger::Auto, None)
            .await
            .unwrap();
        assert_eq!(orch.current_run_id().await, Some(run_id));
        assert_eq!(orch.current_stage().await, Some(RecoveryStage::ConnectBroker));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_requires_stable_period() {
        let orch = orchestrator(30);
        let run_id = orch
            .start_recovery(RecoveryTrigger::Auto, None)
            .await
            .unwrap();

        for _ in 0..3 {
            assert!(orch.advance_stage(run_id).await);
        }
        assert_eq!(orch.current_stage().await, Some(RecoveryStage::Ready));

        assert!(!orch.advance_stage(run_id).await);
        assert!(orch.is_recovering().await);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(orch.advance_stage(run_id).await);
        assert!(!orch.is_recovering().await);
        assert_eq!(orch.state.mode().await, SystemMode::Normal);
    }
}

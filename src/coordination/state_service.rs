//! System State Service
//!
//! Single authority for the current `SystemMode` and `RecoveryStage`.
//!
//! Every mutation runs under one exclusive lock, so transitions are totally
//! ordered. Each applied transition is appended to the in-memory history,
//! pushed to the permission gate before the call returns, and published to
//! the event bus on a best-effort basis (a dropped publish never rolls back
//! the mode change).
//!
//! Automatic transitions follow the escalate-only policy: a target mode is
//! accepted if it is at least as severe as the current one, or if it is one
//! of the two recovery paths (`ALL_HEALTHY -> NORMAL`,
//! `BROKER_RECONNECTED -> RECOVERING`).
//!
//! A force override suppresses automatic transitions until its TTL elapses.
//! Expiry is detected lazily: every call that reads or mutates override
//! state first runs `expire_override_if_needed`, so `is_force_override`,
//! `snapshot` and the mutating calls may clear an expired override as a
//! side effect. No timer task runs.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::coordination::gate::PermissionGate;
use crate::domain::{
    ComponentSource, EventType, ForceOverrideState, ModeTransition, ReasonCode, RecoveryStage,
    Severity, SystemEvent, SystemMode,
};
use crate::error::{Result, SentinelError};
use crate::services::EventBus;

/// Configuration for the state service
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StateServiceConfig {
    /// Mode held from construction until the first transition
    #[serde(default)]
    pub initial_mode: SystemMode,
}

/// Result of submitting an event to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// Mode (and stage) updated
    Applied(ModeTransition),
    /// Ignored because a force override is active
    Suppressed,
    /// Rejected by the escalate-only policy
    Blocked {
        current: SystemMode,
        target: SystemMode,
    },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn transition(&self) -> Option<&ModeTransition> {
        match self {
            TransitionOutcome::Applied(t) => Some(t),
            _ => None,
        }
    }
}

/// Read-only view of an active override
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideView {
    pub mode: SystemMode,
    pub operator_id: String,
    pub reason: String,
    pub remaining: Duration,
}

/// Point-in-time view of the state machine
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub mode: SystemMode,
    pub stage: Option<RecoveryStage>,
    pub force_override: Option<OverrideView>,
    pub transition_count: usize,
}

struct StateInner {
    mode: SystemMode,
    stage: Option<RecoveryStage>,
    history: Vec<ModeTransition>,
    force_override: Option<ForceOverrideState>,
}

struct TransitionRequest<'a> {
    to_mode: SystemMode,
    stage: Option<RecoveryStage>,
    reason_code: ReasonCode,
    source: ComponentSource,
    event_type: EventType,
    operator_id: Option<&'a str>,
    override_ttl_secs: Option<u64>,
}

/// Authoritative mode/stage state machine
pub struct SystemStateService {
    inner: Mutex<StateInner>,
    gate: Arc<dyn PermissionGate>,
    bus: Option<Arc<EventBus>>,
    epoch: Instant,
}

impl SystemStateService {
    /// Create the service and push the initial mode to the gate
    pub fn new(config: StateServiceConfig, gate: Arc<dyn PermissionGate>) -> Self {
        let mode = config.initial_mode;
        let stage = if mode == SystemMode::Recovering {
            Some(RecoveryStage::FIRST)
        } else {
            None
        };
        gate.update_mode(mode, stage);
        info!(%mode, "System state service initialized");

        Self {
            inner: Mutex::new(StateInner {
                mode,
                stage,
                history: Vec::new(),
                force_override: None,
            }),
            gate,
            bus: None,
            epoch: Instant::now(),
        }
    }

    /// Publish derived events to this bus
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub async fn mode(&self) -> SystemMode {
        self.inner.lock().await.mode
    }

    pub async fn stage(&self) -> Option<RecoveryStage> {
        self.inner.lock().await.stage
    }

    /// Full transition history, oldest first
    pub async fn transition_history(&self) -> Vec<ModeTransition> {
        self.inner.lock().await.history.clone()
    }

    /// Whether an unexpired override is active.
    ///
    /// Not a pure read: an expired override is cleared by this call.
    pub async fn is_force_override(&self) -> bool {
        let mut inner = self.inner.lock().await;
        self.expire_override_if_needed(&mut inner)
    }

    /// Current state; clears an expired override like `is_force_override`
    pub async fn snapshot(&self) -> StateSnapshot {
        let mut inner = self.inner.lock().await;
        self.expire_override_if_needed(&mut inner);
        let now = Instant::now();

        StateSnapshot {
            mode: inner.mode,
            stage: inner.stage,
            force_override: inner.force_override.as_ref().map(|ov| OverrideView {
                mode: ov.mode,
                operator_id: ov.operator_id.clone(),
                reason: ov.reason.clone(),
                remaining: ov.remaining_at(now),
            }),
            transition_count: inner.history.len(),
        }
    }

    /// Submit a health/control event to the decision matrix
    pub async fn handle_event(&self, event: &SystemEvent) -> TransitionOutcome {
        let mut inner = self.inner.lock().await;

        if self.expire_override_if_needed(&mut inner) {
            info!(
                reason_code = %event.reason_code(),
                source = %event.source(),
                "Force override active, event ignored"
            );
            return TransitionOutcome::Suppressed;
        }

        let reason = event.reason_code();
        let current = inner.mode;
        let target = reason.target_mode();

        if !current.allows_escalation_to(target) && !reason.is_recovery_path() {
            debug!(
                %current,
                %target,
                reason_code = %reason,
                source = %event.source(),
                "Transition blocked by escalate-only policy"
            );
            return TransitionOutcome::Blocked { current, target };
        }

        let stage = if target == SystemMode::Recovering {
            inner.stage.or(Some(RecoveryStage::FIRST))
        } else {
            None
        };

        let transition = self.apply(
            &mut inner,
            TransitionRequest {
                to_mode: target,
                stage,
                reason_code: reason,
                source: event.source(),
                event_type: EventType::ModeChanged,
                operator_id: None,
                override_ttl_secs: None,
            },
        );
        TransitionOutcome::Applied(transition)
    }

    /// Operator override: set `mode` unconditionally for `ttl_seconds`.
    ///
    /// Bypasses the decision matrix and the escalate-only rule and replaces
    /// any existing override.
    pub async fn force_mode(
        &self,
        mode: SystemMode,
        ttl_seconds: u64,
        operator_id: &str,
        reason: &str,
    ) -> Result<ModeTransition> {
        if operator_id.trim().is_empty() {
            return Err(SentinelError::validation("operator_id must not be empty"));
        }
        if reason.trim().is_empty() {
            return Err(SentinelError::validation("reason must not be empty"));
        }
        if ttl_seconds == 0 {
            return Err(SentinelError::validation("ttl_seconds must be greater than 0"));
        }

        let mut inner = self.inner.lock().await;

        if let Some(previous) = inner.force_override.as_ref() {
            info!(
                previous_mode = %previous.mode,
                previous_operator = %previous.operator_id,
                "Replacing existing force override"
            );
        }

        let stage = if mode == SystemMode::Recovering {
            inner.stage.or(Some(RecoveryStage::FIRST))
        } else {
            None
        };

        let transition = self.apply(
            &mut inner,
            TransitionRequest {
                to_mode: mode,
                stage,
                reason_code: ReasonCode::ManualOverride,
                source: ComponentSource::Operator,
                event_type: EventType::ManualOverride,
                operator_id: Some(operator_id),
                override_ttl_secs: Some(ttl_seconds),
            },
        );

        inner.force_override = Some(ForceOverrideState::new(
            mode,
            Duration::from_secs(ttl_seconds),
            operator_id,
            reason,
        ));

        warn!(
            %mode,
            ttl_seconds,
            operator_id,
            reason,
            "Force override engaged"
        );

        Ok(transition)
    }

    /// End an active override early. Returns whether one was active.
    pub async fn clear_force_override(&self, operator_id: &str) -> Result<bool> {
        if operator_id.trim().is_empty() {
            return Err(SentinelError::validation("operator_id must not be empty"));
        }

        let mut inner = self.inner.lock().await;
        if !self.expire_override_if_needed(&mut inner) {
            return Ok(false);
        }

        if let Some(ov) = inner.force_override.take() {
            info!(
                mode = %ov.mode,
                set_by = %ov.operator_id,
                cleared_by = operator_id,
                "Force override cleared"
            );
        }
        Ok(true)
    }

    /// Move to another stage of an ongoing recovery
    pub async fn update_recovery_stage(&self, stage: RecoveryStage) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.mode != SystemMode::Recovering {
            return Err(SentinelError::invalid_state(format!(
                "cannot set recovery stage {} while mode is {}",
                stage, inner.mode
            )));
        }

        let previous = inner.stage;
        inner.stage = Some(stage);
        self.gate.update_mode(inner.mode, inner.stage);

        info!(?previous, %stage, "Recovery stage updated");
        Ok(())
    }

    /// Move an ongoing recovery from `from` to `to`.
    ///
    /// Fails with a state error unless the system is RECOVERING at exactly
    /// `from`, so a run that lost track of the state cannot skip stages.
    pub async fn advance_recovery_stage(
        &self,
        from: RecoveryStage,
        to: RecoveryStage,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.mode != SystemMode::Recovering || inner.stage != Some(from) {
            return Err(SentinelError::invalid_state(format!(
                "cannot move recovery stage {} -> {} while mode is {} at stage {:?}",
                from, to, inner.mode, inner.stage
            )));
        }

        inner.stage = Some(to);
        self.gate.update_mode(inner.mode, inner.stage);

        info!(%from, %to, "Recovery stage advanced");
        Ok(())
    }

    /// Leave RECOVERING for NORMAL after the READY stage passed.
    ///
    /// Applied only while RECOVERING at READY with no active override.
    pub async fn complete_recovery(&self) -> bool {
        let mut inner = self.inner.lock().await;

        if self.expire_override_if_needed(&mut inner) {
            warn!("Force override active, recovery completion suppressed");
            return false;
        }

        if inner.mode != SystemMode::Recovering || inner.stage != Some(RecoveryStage::Ready) {
            warn!(
                mode = %inner.mode,
                stage = ?inner.stage,
                "Recovery completion rejected, system is not RECOVERING at READY"
            );
            return false;
        }

        self.apply(
            &mut inner,
            TransitionRequest {
                to_mode: SystemMode::Normal,
                stage: None,
                reason_code: ReasonCode::AllHealthy,
                source: ComponentSource::Recovery,
                event_type: EventType::ModeChanged,
                operator_id: None,
                override_ttl_secs: None,
            },
        );
        true
    }

    /// Transition requested by the recovery protocol.
    ///
    /// Skips the decision matrix and the escalate-only rule (abort has to be
    /// able to leave RECOVERING for SAFE_MODE) but, like every automatic
    /// transition, is suppressed while a force override is active.
    /// Returns whether the transition was applied.
    pub async fn apply_recovery_transition(
        &self,
        mode: SystemMode,
        stage: Option<RecoveryStage>,
        reason: ReasonCode,
        source: ComponentSource,
    ) -> bool {
        let mut inner = self.inner.lock().await;

        if self.expire_override_if_needed(&mut inner) {
            warn!(
                %mode,
                reason_code = %reason,
                "Force override active, recovery transition suppressed"
            );
            return false;
        }

        let stage = if mode == SystemMode::Recovering {
            stage.or(inner.stage).or(Some(RecoveryStage::FIRST))
        } else {
            None
        };

        self.apply(
            &mut inner,
            TransitionRequest {
                to_mode: mode,
                stage,
                reason_code: reason,
                source,
                event_type: EventType::ModeChanged,
                operator_id: None,
                override_ttl_secs: None,
            },
        );
        true
    }

    /// Returns whether an override is still active, clearing it if expired
    fn expire_override_if_needed(&self, inner: &mut StateInner) -> bool {
        let expired = match inner.force_override.as_ref() {
            Some(ov) => ov.is_expired_at(Instant::now()),
            None => return false,
        };

        if expired {
            if let Some(ov) = inner.force_override.take() {
                info!(
                    mode = %ov.mode,
                    operator_id = %ov.operator_id,
                    ttl_secs = ov.ttl.as_secs(),
                    "Force override expired"
                );
            }
            return false;
        }
        true
    }

    fn apply(&self, inner: &mut StateInner, req: TransitionRequest<'_>) -> ModeTransition {
        let from_mode = inner.mode;
        inner.mode = req.to_mode;
        inner.stage = req.stage;

        let transition = ModeTransition {
            from_mode,
            to_mode: req.to_mode,
            reason_code: req.reason_code,
            source: req.source,
            wall_timestamp: chrono::Utc::now(),
            monotonic_ms: self.epoch.elapsed().as_millis() as u64,
            operator_id: req.operator_id.map(String::from),
            override_ttl_secs: req.override_ttl_secs,
        };
        inner.history.push(transition.clone());

        // Gate sees the change before the caller does
        self.gate.update_mode(inner.mode, inner.stage);

        info!(
            from = %from_mode,
            to = %req.to_mode,
            stage = ?inner.stage,
            reason_code = %req.reason_code,
            source = %req.source,
            "Mode transition"
        );

        self.publish_transition(&transition, inner.stage, req.event_type);
        transition
    }

    fn publish_transition(
        &self,
        transition: &ModeTransition,
        stage: Option<RecoveryStage>,
        event_type: EventType,
    ) {
        let Some(bus) = &self.bus else {
            return;
        };

        let severity = match transition.to_mode {
            SystemMode::Normal => Severity::Info,
            SystemMode::Halt => Severity::Critical,
            _ => Severity::Warning,
        };

        let mut event = SystemEvent::new(
            event_type,
            ComponentSource::StateService,
            severity,
            transition.reason_code,
        )
        .with_detail("from_mode", transition.from_mode.as_str())
        .with_detail("to_mode", transition.to_mode.as_str())
        .with_detail("origin", transition.source.as_str());

        if let Some(stage) = stage {
            event = event.with_detail("stage", stage.as_str());
        }
        if let Some(operator_id) = &transition.operator_id {
            event = event.with_detail("operator_id", operator_id.as_str());
        }

        if !bus.publish(event) {
            warn!(
                to = %transition.to_mode,
                "Mode change event dropped by event bus; transition stands"
            );
        }
    }
}

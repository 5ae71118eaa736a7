//! Composition root
//!
//! `Sentinel` owns one instance of every control-plane component and wires
//! them the way the rest of the backend uses them: health signals go into
//! per-dependency breakers, breaker level changes go to the bus and into the
//! state machine, and buffer overflow is itself reported as a health event.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, BreakersConfig};
use crate::coordination::{
    BreakerKind, BreakerLevel, BreakerSnapshot, CircuitBreaker, ComponentBreaker, PermissionGate,
    StateServiceConfig, SystemStateService, TransitionOutcome,
};
use crate::domain::{
    ComponentSource, EventType, ReasonCode, RecoveryStage, Severity, SystemEvent, SystemMode,
};
use crate::error::Result;
use crate::persistence::{BufferEntry, BufferSink, DbWriteBuffer, SharedDbBuffer};
use crate::services::{EmergencyCallback, EventBus};
use crate::supervisor::{RecoveryOrchestrator, RecoveryTrigger, StageCheck};

/// One breaker per monitored dependency, each behind its own lock
pub struct BreakerSet {
    broker: Mutex<CircuitBreaker>,
    market_data: Mutex<CircuitBreaker>,
    risk: Mutex<CircuitBreaker>,
    database: Mutex<CircuitBreaker>,
}

impl BreakerSet {
    pub fn new(config: &BreakersConfig) -> Self {
        Self {
            broker: Mutex::new(CircuitBreaker::broker(config.broker.clone())),
            market_data: Mutex::new(CircuitBreaker::market_data(config.market_data.clone())),
            risk: Mutex::new(CircuitBreaker::risk(config.risk.clone())),
            database: Mutex::new(CircuitBreaker::database(config.database.clone())),
        }
    }

    /// Dependencies whose breaker is not HEALTHY
    pub async fn unhealthy(&self) -> Vec<BreakerKind> {
        let mut kinds = Vec::new();
        for kind in BreakerKind::ALL {
            if self.level(kind).await != BreakerLevel::Healthy {
                kinds.push(kind);
            }
        }
        kinds
    }

    pub fn get(&self, kind: BreakerKind) -> &Mutex<CircuitBreaker> {
        match kind {
            BreakerKind::Broker => &self.broker,
            BreakerKind::MarketData => &self.market_data,
            BreakerKind::Risk => &self.risk,
            BreakerKind::Database => &self.database,
        }
    }

    pub async fn level(&self, kind: BreakerKind) -> BreakerLevel {
        self.get(kind).lock().await.level()
    }

    pub async fn snapshot(&self, kind: BreakerKind) -> BreakerSnapshot {
        self.get(kind).lock().await.snapshot()
    }
}

/// Stage checks answered from breaker levels: each stage needs its
/// dependency healthy, READY needs all of them.
pub struct BreakerStageCheck {
    breakers: Arc<BreakerSet>,
}

impl BreakerStageCheck {
    pub fn new(breakers: Arc<BreakerSet>) -> Self {
        Self { breakers }
    }
}

#[async_trait]
impl StageCheck for BreakerStageCheck {
    async fn check(&self, stage: RecoveryStage) -> Result<bool> {
        let required: &[BreakerKind] = match stage {
            RecoveryStage::ConnectBroker => &[BreakerKind::Broker],
            RecoveryStage::CatchupMarketdata => &[BreakerKind::MarketData],
            RecoveryStage::VerifyRisk => &[BreakerKind::Risk],
            RecoveryStage::Ready => &BreakerKind::ALL,
        };

        for kind in required {
            if self.breakers.level(*kind).await != BreakerLevel::Healthy {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

pub struct Sentinel {
    config: AppConfig,
    bus: Arc<EventBus>,
    state: Arc<SystemStateService>,
    recovery: Arc<RecoveryOrchestrator>,
    breakers: Arc<BreakerSet>,
    buffer: SharedDbBuffer,
}

impl Sentinel {
    /// Wire every component from `config`.
    ///
    /// Replays the write buffer's WAL if one is configured.
    pub fn build(
        config: AppConfig,
        gate: Arc<dyn PermissionGate>,
        checks: Arc<dyn StageCheck>,
    ) -> Result<Self> {
        let breakers = Arc::new(BreakerSet::new(&config.breakers));
        Self::assemble(config, gate, checks, breakers)
    }

    /// Like `build`, with recovery stages verified against the breakers
    pub fn build_with_breaker_checks(
        config: AppConfig,
        gate: Arc<dyn PermissionGate>,
    ) -> Result<Self> {
        let breakers = Arc::new(BreakerSet::new(&config.breakers));
        let checks = Arc::new(BreakerStageCheck::new(breakers.clone()));
        Self::assemble(config, gate, checks, breakers)
    }

    fn assemble(
        config: AppConfig,
        gate: Arc<dyn PermissionGate>,
        checks: Arc<dyn StageCheck>,
        breakers: Arc<BreakerSet>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(
            EventBus::new(config.event_bus.clone()).with_emergency_callback(log_emergency()),
        );

        let state = Arc::new(
            SystemStateService::new(
                StateServiceConfig {
                    initial_mode: config.state.initial_mode,
                },
                gate,
            )
            .with_event_bus(bus.clone()),
        );

        let recovery = Arc::new(
            RecoveryOrchestrator::new(config.recovery.clone(), state.clone(), checks)
                .with_event_bus(bus.clone()),
        );

        let buffer = DbWriteBuffer::new(config.db_buffer.clone())?.into_shared();

        info!(
            initial_mode = %config.state.initial_mode,
            queue_size = config.event_bus.queue_size,
            wal = ?config.db_buffer.wal_path,
            "Sentinel assembled"
        );

        Ok(Self {
            config,
            bus,
            state,
            recovery,
            breakers,
            buffer,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn state(&self) -> &Arc<SystemStateService> {
        &self.state
    }

    pub fn recovery(&self) -> &Arc<RecoveryOrchestrator> {
        &self.recovery
    }

    pub fn breakers(&self) -> &Arc<BreakerSet> {
        &self.breakers
    }

    pub fn buffer(&self) -> &SharedDbBuffer {
        &self.buffer
    }

    /// Start event dispatch
    pub async fn start(&self) {
        self.bus.start().await;
    }

    /// Stop event dispatch, waiting for the dispatcher to exit
    pub async fn shutdown(&self) {
        self.bus.stop().await;
        info!(stats = ?self.bus.stats(), "Sentinel stopped");
    }

    /// Feed an event straight into the state machine
    pub async fn submit(&self, event: &SystemEvent) -> TransitionOutcome {
        self.state.handle_event(event).await
    }

    /// Report a failed health probe for `kind`.
    ///
    /// Returns the state machine outcome when the breaker changed level.
    pub async fn report_failure(&self, kind: BreakerKind) -> Option<TransitionOutcome> {
        let event = self.breakers.get(kind).lock().await.record_failure()?;
        Some(self.route_breaker_event(event).await)
    }

    /// Report a successful health probe for `kind`.
    ///
    /// A broker reconnect that moves the system into RECOVERING also starts
    /// an AUTO recovery run. An active run is kept only when the system was
    /// already RECOVERING; re-entering from another mode supersedes it.
    pub async fn report_success(&self, kind: BreakerKind) -> Option<TransitionOutcome> {
        let event = self.breakers.get(kind).lock().await.record_success()?;
        let outcome = self.route_breaker_event(event).await;

        let (entered_recovery, reentered) = match outcome.transition() {
            Some(t) if t.to_mode == SystemMode::Recovering => {
                (true, t.from_mode != SystemMode::Recovering)
            }
            _ => (false, false),
        };
        if entered_recovery && (reentered || !self.recovery.is_recovering().await) {
            if let Err(e) = self
                .recovery
                .start_recovery(RecoveryTrigger::Auto, None)
                .await
            {
                warn!("Could not start automatic recovery: {}", e);
            }
        }

        Some(outcome)
    }

    /// Breaker level as seen from outside: never looser than the global mode
    pub async fn effective_level(&self, kind: BreakerKind) -> BreakerLevel {
        let central = BreakerLevel::from_mode(self.state.mode().await);
        self.breakers.get(kind).lock().await.effective_level(central)
    }

    /// Try to advance the active recovery run by one stage
    pub async fn drive_recovery(&self) -> Option<(Uuid, bool)> {
        let run_id = self.recovery.current_run_id().await?;
        Some((run_id, self.recovery.advance_stage(run_id).await))
    }

    /// Buffer a write that could not reach the database.
    ///
    /// On rejection the overflow is published and reported as
    /// `DB_BUFFER_FULL`; the caller still gets `Ok(false)`.
    pub async fn buffer_write(&self, entry: BufferEntry) -> Result<bool> {
        let (accepted, entries, bytes) = {
            let mut buffer = self.buffer.lock().await;
            let accepted = buffer.add(entry)?;
            (accepted, buffer.entry_count(), buffer.byte_count())
        };

        if !accepted {
            let event = SystemEvent::new(
                EventType::DbBufferOverflow,
                ComponentSource::Database,
                Severity::Critical,
                ReasonCode::DbBufferFull,
            )
            .with_detail("entry_count", entries as u64)
            .with_detail("byte_count", bytes as u64);

            self.bus.publish(event.clone());
            self.state.handle_event(&event).await;
        }

        Ok(accepted)
    }

    /// Flush the write buffer into `sink`
    pub async fn flush_buffer(&self, sink: &dyn BufferSink) -> Result<usize> {
        self.buffer.lock().await.flush_to_db(sink).await
    }

    /// Publish a breaker level change and submit it to the state machine.
    ///
    /// A breaker recovery reporting ALL_HEALTHY is submitted only when every
    /// breaker is healthy; otherwise it is published and answered with
    /// `Blocked`, since NORMAL would hide the dependencies still failing.
    async fn route_breaker_event(&self, event: SystemEvent) -> TransitionOutcome {
        if !self.bus.publish(event.clone()) {
            warn!(
                event_type = %event.event_type(),
                source = %event.source(),
                "Breaker event dropped by event bus"
            );
        }

        if event.reason_code() == ReasonCode::AllHealthy {
            let unhealthy = self.breakers.unhealthy().await;
            if !unhealthy.is_empty() {
                let current = self.state.mode().await;
                info!(
                    source = %event.source(),
                    still_failing = ?unhealthy,
                    mode = %current,
                    "Breaker recovered, mode held until every dependency is healthy"
                );
                return TransitionOutcome::Blocked {
                    current,
                    target: SystemMode::Normal,
                };
            }
        }

        self.state.handle_event(&event).await
    }
}

fn log_emergency() -> EmergencyCallback {
    Arc::new(|event: &SystemEvent| {
        error!(
            event_type = %event.event_type(),
            source = %event.source(),
            reason_code = %event.reason_code(),
            "Must-deliver event dropped"
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::NoopGate;

    #[tokio::test]
    async fn test_breaker_stage_check() {
        let breakers = Arc::new(BreakerSet::new(&BreakersConfig::default()));
        let check = BreakerStageCheck::new(breakers.clone());

        assert!(check.check(RecoveryStage::ConnectBroker).await.unwrap());

        breakers.get(BreakerKind::Risk).lock().await.record_failure();
        assert!(check.check(RecoveryStage::CatchupMarketdata).await.unwrap());
        assert!(!check.check(RecoveryStage::VerifyRisk).await.unwrap());
        assert!(!check.check(RecoveryStage::Ready).await.unwrap());
    }

    #[tokio::test]
    async fn test_effective_level_follows_mode() {
        let sentinel =
            Sentinel::build_with_breaker_checks(AppConfig::default(), Arc::new(NoopGate)).unwrap();

        // Initial SAFE_MODE_DISCONNECTED projects to TRIPPED
        assert_eq!(
            sentinel.effective_level(BreakerKind::Risk).await,
            BreakerLevel::Tripped
        );
    }
}

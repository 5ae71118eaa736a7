use ploy_sentinel::config::AppConfig;
use ploy_sentinel::coordination::{
    BreakerKind, BreakerLevel, NoopGate, TransitionOutcome, WatchGate,
};
use ploy_sentinel::domain::{ComponentSource, ReasonCode, RecoveryStage, SystemEvent, SystemMode};
use ploy_sentinel::persistence::BufferEntry;
use ploy_sentinel::runtime::Sentinel;
use std::sync::Arc;

fn config(initial_mode: SystemMode) -> AppConfig {
    let mut config = AppConfig::default();
    config.state.initial_mode = initial_mode;
    config.recovery.ready_stable_secs = 0;
    config
}

/// Broker failures degrade then disconnect the system; the reconnect starts
/// an automatic recovery that the breaker checks carry back to NORMAL.
#[tokio::test]
async fn broker_outage_and_automatic_recovery() {
    let gate = Arc::new(WatchGate::new(SystemMode::Normal));
    let sentinel =
        Sentinel::build_with_breaker_checks(config(SystemMode::Normal), gate.clone()).unwrap();

    let outcome = sentinel.report_failure(BreakerKind::Broker).await.unwrap();
    assert!(outcome.is_applied());
    assert_eq!(sentinel.state().mode().await, SystemMode::Degraded);

    assert!(sentinel.report_failure(BreakerKind::Broker).await.is_none());

    sentinel.report_failure(BreakerKind::Broker).await.unwrap();
    assert_eq!(
        sentinel.state().mode().await,
        SystemMode::SafeModeDisconnected
    );
    assert_eq!(gate.current().mode, SystemMode::SafeModeDisconnected);

    let outcome = sentinel.report_success(BreakerKind::Broker).await.unwrap();
    assert!(outcome.is_applied());
    assert_eq!(sentinel.state().mode().await, SystemMode::Recovering);
    assert!(sentinel.recovery().is_recovering().await);

    for _ in 0..3 {
        let (_, advanced) = sentinel.drive_recovery().await.unwrap();
        assert!(advanced);
    }
    assert_eq!(
        sentinel.recovery().current_stage().await,
        Some(RecoveryStage::Ready)
    );

    let (_, advanced) = sentinel.drive_recovery().await.unwrap();
    assert!(advanced);
    assert_eq!(sentinel.state().mode().await, SystemMode::Normal);
    assert_eq!(gate.current().stage, None);
    assert!(sentinel.drive_recovery().await.is_none());
}

/// Stage checks read breaker levels, so recovery stalls while the
/// dependency for the current stage is unhealthy.
#[tokio::test]
async fn recovery_waits_for_unhealthy_dependency() {
    use ploy_sentinel::coordination::ComponentBreaker;

    let sentinel =
        Sentinel::build_with_breaker_checks(config(SystemMode::Normal), Arc::new(NoopGate))
            .unwrap();

    for _ in 0..3 {
        sentinel.report_failure(BreakerKind::Broker).await;
    }
    sentinel.report_success(BreakerKind::Broker).await;

    // Local probe failure, not routed into the state machine
    sentinel
        .breakers()
        .get(BreakerKind::MarketData)
        .lock()
        .await
        .record_failure();

    let (_, advanced) = sentinel.drive_recovery().await.unwrap();
    assert!(advanced);
    assert_eq!(
        sentinel.recovery().current_stage().await,
        Some(RecoveryStage::CatchupMarketdata)
    );

    let (_, advanced) = sentinel.drive_recovery().await.unwrap();
    assert!(!advanced);
    assert_eq!(
        sentinel.recovery().current_stage().await,
        Some(RecoveryStage::CatchupMarketdata)
    );

    sentinel
        .breakers()
        .get(BreakerKind::MarketData)
        .lock()
        .await
        .record_success();
    let (_, advanced) = sentinel.drive_recovery().await.unwrap();
    assert!(advanced);
}

/// A rejected buffer write is reported as DB_BUFFER_FULL.
#[tokio::test]
async fn buffer_overflow_escalates_to_safe_mode() {
    let mut config = config(SystemMode::Normal);
    config.db_buffer.max_entries = 1;
    let sentinel = Sentinel::build_with_breaker_checks(config, Arc::new(NoopGate)).unwrap();

    let data = serde_json::Map::new();
    assert!(sentinel
        .buffer_write(BufferEntry::new("fill", "f-1", data.clone()))
        .await
        .unwrap());
    assert!(!sentinel
        .buffer_write(BufferEntry::new("fill", "f-2", data))
        .await
        .unwrap());

    assert_eq!(sentinel.state().mode().await, SystemMode::SafeMode);
    let last = sentinel.state().transition_history().await.pop().unwrap();
    assert_eq!(last.reason_code, ReasonCode::DbBufferFull);
    assert_eq!(sentinel.buffer().lock().await.entry_count(), 1);
}

/// Breaker state never loosens the globally visible level.
#[tokio::test]
async fn effective_level_combines_breaker_and_mode() {
    let sentinel =
        Sentinel::build_with_breaker_checks(config(SystemMode::Normal), Arc::new(NoopGate))
            .unwrap();
    assert_eq!(
        sentinel.effective_level(BreakerKind::Risk).await,
        BreakerLevel::Healthy
    );

    sentinel.report_failure(BreakerKind::Database).await;
    assert_eq!(sentinel.state().mode().await, SystemMode::Degraded);
    assert_eq!(
        sentinel.effective_level(BreakerKind::Risk).await,
        BreakerLevel::Unstable
    );
    assert_eq!(
        sentinel.breakers().snapshot(BreakerKind::Database).await.failure_count,
        1
    );
}

/// Invalid configuration is rejected at build time.
#[tokio::test]
async fn build_rejects_invalid_config() {
    let mut config = AppConfig::default();
    config.event_bus.queue_size = 0;

    let err = Sentinel::build_with_breaker_checks(config, Arc::new(NoopGate))
        .err()
        .unwrap();
    assert!(err.is_validation());
}

/// Start and shutdown drive the bus; cold start lands in its matrix mode.
#[tokio::test]
async fn start_submit_shutdown() {
    let sentinel = Sentinel::build_with_breaker_checks(
        config(SystemMode::SafeModeDisconnected),
        Arc::new(NoopGate),
    )
    .unwrap();

    sentinel.start().await;
    assert!(sentinel.bus().is_running().await);

    let outcome = sentinel
        .submit(&SystemEvent::health(
            ComponentSource::System,
            ReasonCode::ColdStart,
        ))
        .await;
    assert!(outcome.is_applied());
    assert_eq!(
        sentinel.state().mode().await,
        SystemMode::SafeModeDisconnected
    );

    sentinel.shutdown().await;
    assert!(!sentinel.bus().is_running().await);
}

/// Leaving RECOVERING mid-run and coming back through a broker reconnect
/// starts a fresh run at CONNECT_BROKER; the old run cannot skip ahead.
#[tokio::test]
async fn recovery_reentry_restarts_from_first_stage() {
    let gate = Arc::new(WatchGate::new(SystemMode::Normal));
    let sentinel =
        Sentinel::build_with_breaker_checks(config(SystemMode::Normal), gate.clone()).unwrap();

    for _ in 0..3 {
        sentinel.report_failure(BreakerKind::Broker).await;
    }
    sentinel.report_success(BreakerKind::Broker).await;
    let stale = sentinel.recovery().current_run_id().await.unwrap();
    for _ in 0..2 {
        let (_, advanced) = sentinel.drive_recovery().await.unwrap();
        assert!(advanced);
    }
    assert_eq!(
        sentinel.recovery().current_stage().await,
        Some(RecoveryStage::VerifyRisk)
    );

    sentinel
        .submit(&SystemEvent::health(
            ComponentSource::Risk,
            ReasonCode::RiskBreachHard,
        ))
        .await;
    assert_eq!(sentinel.state().mode().await, SystemMode::Halt);

    // Broker flaps while halted; the reconnect re-enters RECOVERING
    sentinel.report_failure(BreakerKind::Broker).await;
    let outcome = sentinel.report_success(BreakerKind::Broker).await.unwrap();
    assert!(outcome.is_applied());
    assert_eq!(sentinel.state().mode().await, SystemMode::Recovering);

    let fresh = sentinel.recovery().current_run_id().await.unwrap();
    assert_ne!(fresh, stale);
    assert_eq!(
        sentinel.recovery().current_stage().await,
        Some(RecoveryStage::ConnectBroker)
    );
    assert_eq!(
        sentinel.state().stage().await,
        Some(RecoveryStage::ConnectBroker)
    );
    assert!(!sentinel.recovery().advance_stage(stale).await);

    let (run_id, advanced) = sentinel.drive_recovery().await.unwrap();
    assert_eq!(run_id, fresh);
    assert!(advanced);
    assert_eq!(
        sentinel.state().stage().await,
        Some(RecoveryStage::CatchupMarketdata)
    );
    assert_eq!(gate.current().stage, Some(RecoveryStage::CatchupMarketdata));
}

/// One dependency recovering does not clear the mode while another breaker
/// is still failing.
#[tokio::test]
async fn partial_breaker_recovery_holds_mode() {
    let sentinel =
        Sentinel::build_with_breaker_checks(config(SystemMode::Normal), Arc::new(NoopGate))
            .unwrap();

    sentinel.report_failure(BreakerKind::MarketData).await;
    assert_eq!(sentinel.state().mode().await, SystemMode::Degraded);
    for _ in 0..3 {
        sentinel.report_failure(BreakerKind::Broker).await;
    }
    assert_eq!(
        sentinel.state().mode().await,
        SystemMode::SafeModeDisconnected
    );

    let outcome = sentinel
        .report_success(BreakerKind::MarketData)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TransitionOutcome::Blocked {
            current: SystemMode::SafeModeDisconnected,
            target: SystemMode::Normal,
        }
    );
    assert_eq!(
        sentinel.state().mode().await,
        SystemMode::SafeModeDisconnected
    );
    assert_eq!(
        sentinel.breakers().level(BreakerKind::Broker).await,
        BreakerLevel::Tripped
    );
    assert_eq!(
        sentinel.breakers().unhealthy().await,
        vec![BreakerKind::Broker]
    );
}

/// The last failing dependency recovering returns the system to NORMAL.
#[tokio::test]
async fn last_breaker_recovery_restores_normal() {
    let sentinel =
        Sentinel::build_with_breaker_checks(config(SystemMode::Normal), Arc::new(NoopGate))
            .unwrap();

    sentinel.report_failure(BreakerKind::Database).await;
    sentinel.report_failure(BreakerKind::Risk).await;
    assert_eq!(sentinel.state().mode().await, SystemMode::Degraded);

    let outcome = sentinel.report_success(BreakerKind::Database).await.unwrap();
    assert!(!outcome.is_applied());
    assert_eq!(sentinel.state().mode().await, SystemMode::Degraded);

    let outcome = sentinel.report_success(BreakerKind::Risk).await.unwrap();
    assert!(outcome.is_applied());
    assert_eq!(sentinel.state().mode().await, SystemMode::Normal);
    assert!(sentinel.breakers().unhealthy().await.is_empty());
}

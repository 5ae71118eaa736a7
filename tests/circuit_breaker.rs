use ploy_sentinel::coordination::{
    BreakerConfig, BreakerKind, BreakerLevel, CircuitBreaker, ComponentBreaker,
};
use ploy_sentinel::domain::{EventType, ReasonCode, Severity};
use std::time::Duration;

fn config(count: u32, seconds: u64) -> BreakerConfig {
    BreakerConfig {
        fail_threshold_count: count,
        fail_threshold_seconds: seconds,
    }
}

/// Three consecutive failures walk HEALTHY -> UNSTABLE -> UNSTABLE -> TRIPPED,
/// and a success from TRIPPED resets everything.
#[tokio::test]
async fn count_threshold_trips_and_success_resets() {
    let mut breaker = CircuitBreaker::broker(config(3, 30));
    assert_eq!(breaker.level(), BreakerLevel::Healthy);

    let first = breaker.record_failure().expect("HEALTHY -> UNSTABLE emits");
    assert_eq!(breaker.level(), BreakerLevel::Unstable);
    assert_eq!(first.event_type(), EventType::BreakerUnstable);
    assert_eq!(first.severity(), Severity::Warning);
    assert_eq!(first.reason_code(), ReasonCode::BrokerUnstable);

    assert!(breaker.record_failure().is_none());
    assert_eq!(breaker.level(), BreakerLevel::Unstable);

    let tripped = breaker.record_failure().expect("UNSTABLE -> TRIPPED emits");
    assert_eq!(breaker.level(), BreakerLevel::Tripped);
    assert!(breaker.is_tripped());
    assert_eq!(tripped.event_type(), EventType::BreakerTripped);
    assert_eq!(tripped.severity(), Severity::Critical);
    assert_eq!(tripped.reason_code(), ReasonCode::BrokerDisconnect);

    let recovered = breaker.record_success().expect("TRIPPED -> HEALTHY emits");
    assert_eq!(breaker.level(), BreakerLevel::Healthy);
    assert_eq!(breaker.failure_count(), 0);
    assert!(breaker.first_failure().is_none());
    assert_eq!(recovered.event_type(), EventType::BreakerRecovered);
    assert_eq!(recovered.reason_code(), ReasonCode::BrokerReconnected);
}

/// Sustained failure trips the breaker even below the count threshold.
#[tokio::test(start_paused = true)]
async fn time_threshold_trips_below_count() {
    let mut breaker = CircuitBreaker::market_data(config(3, 30));

    breaker.record_failure();
    assert_eq!(breaker.level(), BreakerLevel::Unstable);

    tokio::time::advance(Duration::from_secs(31)).await;

    let event = breaker.record_failure().expect("time threshold trips");
    assert_eq!(breaker.failure_count(), 2);
    assert_eq!(breaker.level(), BreakerLevel::Tripped);
    assert_eq!(event.reason_code(), ReasonCode::MdStale);
}

/// Failures on a tripped breaker change nothing and emit nothing.
#[tokio::test]
async fn tripped_breaker_is_quiet() {
    let mut breaker = CircuitBreaker::risk(config(1, 30));

    let event = breaker.record_failure().unwrap();
    assert_eq!(event.reason_code(), ReasonCode::RiskEngineDown);

    for _ in 0..10 {
        assert!(breaker.record_failure().is_none());
    }
    assert_eq!(breaker.failure_count(), 1);
    assert_eq!(breaker.level(), BreakerLevel::Tripped);
}

/// Success on a healthy breaker is a no-op.
#[tokio::test]
async fn success_when_healthy_is_noop() {
    let mut breaker = CircuitBreaker::database(BreakerConfig::default());
    assert!(breaker.record_success().is_none());

    breaker.record_failure();
    let recovered = breaker.record_success().unwrap();
    assert_eq!(recovered.reason_code(), ReasonCode::AllHealthy);
    assert!(breaker.record_success().is_none());
}

/// Local state can only tighten the externally visible level.
#[tokio::test]
async fn effective_level_never_loosens() {
    let mut breaker = CircuitBreaker::with_defaults(BreakerKind::Risk);

    assert_eq!(
        breaker.effective_level(BreakerLevel::Tripped),
        BreakerLevel::Tripped
    );
    assert_eq!(
        breaker.effective_level(BreakerLevel::Healthy),
        BreakerLevel::Healthy
    );

    breaker.record_failure();
    assert_eq!(
        breaker.effective_level(BreakerLevel::Healthy),
        BreakerLevel::Unstable
    );
    assert_eq!(
        breaker.effective_level(BreakerLevel::Tripped),
        BreakerLevel::Tripped
    );
}

/// Each kind reports with its own reason codes.
#[tokio::test]
async fn reason_codes_per_kind() {
    let expected = [
        (BreakerKind::Broker, ReasonCode::BrokerUnstable, ReasonCode::BrokerDisconnect),
        (BreakerKind::MarketData, ReasonCode::MdDelayed, ReasonCode::MdStale),
        (BreakerKind::Risk, ReasonCode::RiskEngineSlow, ReasonCode::RiskEngineDown),
        (BreakerKind::Database, ReasonCode::DbSlow, ReasonCode::DbWriteFail),
    ];

    for (kind, unstable, tripped) in expected {
        let mut breaker = CircuitBreaker::new(kind, config(2, 30));
        assert_eq!(breaker.kind(), kind);
        assert_eq!(breaker.record_failure().unwrap().reason_code(), unstable);
        let event = breaker.record_failure().unwrap();
        assert_eq!(event.reason_code(), tripped);
        assert_eq!(event.source(), kind.source());
    }
}

/// The snapshot reports how long the breaker has been failing.
#[tokio::test(start_paused = true)]
async fn snapshot_reports_failing_duration() {
    let mut breaker = CircuitBreaker::broker(config(5, 60));
    assert_eq!(breaker.snapshot().failing_for, None);

    breaker.record_failure();
    tokio::time::advance(Duration::from_secs(4)).await;
    breaker.record_failure();

    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.kind, BreakerKind::Broker);
    assert_eq!(snapshot.level, BreakerLevel::Unstable);
    assert_eq!(snapshot.failure_count, 2);
    assert_eq!(snapshot.failing_for, Some(Duration::from_secs(4)));
}

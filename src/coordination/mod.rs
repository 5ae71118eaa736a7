//! Coordination Layer
//!
//! Decides what the whole system is allowed to do:
//! - Per-dependency circuit breakers with count/time hysteresis
//! - The authoritative mode/stage state machine
//! - The permission gate port the state machine pushes into

pub mod circuit_breaker;
pub mod gate;
pub mod state_service;

pub use circuit_breaker::{
    BreakerConfig, BreakerKind, BreakerLevel, BreakerSnapshot, CircuitBreaker, ComponentBreaker,
};
pub use gate::{GateState, NoopGate, PermissionGate, WatchGate};
pub use state_service::{
    OverrideView, StateServiceConfig, StateSnapshot, SystemStateService, TransitionOutcome,
};

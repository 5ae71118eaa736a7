pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod runtime;
pub mod services;
pub mod supervisor;

pub use config::AppConfig;
pub use coordination::{
    BreakerConfig, BreakerKind, BreakerLevel, BreakerSnapshot, CircuitBreaker, ComponentBreaker,
    NoopGate, PermissionGate, StateServiceConfig, StateSnapshot, SystemStateService,
    TransitionOutcome, WatchGate,
};
pub use domain::{
    ComponentSource, EventType, ModeTransition, ReasonCode, RecoveryStage, Severity, SystemEvent,
    SystemMode,
};
pub use error::{Result, SentinelError};
pub use persistence::{
    BufferEntry, BufferSink, DbBufferConfig, DbWriteBuffer, PostgresSink, SharedDbBuffer,
    WriteAheadLog,
};
pub use runtime::{BreakerSet, BreakerStageCheck, Sentinel};
pub use services::{BusStats, EventBus, EventBusConfig, EventHandler};
pub use supervisor::{RecoveryConfig, RecoveryOrchestrator, RecoveryTrigger, StageCheck};

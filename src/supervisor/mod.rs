//! Supervisor Layer
//!
//! Drives the system back to NORMAL after a degradation:
//! - Staged recovery runs with run-id scoping
//! - Pluggable per-stage health checks

pub mod recovery;

pub use recovery::{
    RecoveryConfig, RecoveryOrchestrator, RecoveryRun, RecoveryTrigger, StageCheck,
};

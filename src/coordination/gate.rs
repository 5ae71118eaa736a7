//! Permission Gate port
//!
//! The gate maps `(mode, stage)` to concrete trading permissions. That policy
//! lives outside the control plane; the state service only pushes every mode
//! change into it, synchronously, before the transition call returns.

use tokio::sync::watch;
use tracing::debug;

use crate::domain::{RecoveryStage, SystemMode};

/// Receiver of mode/stage pushes
pub trait PermissionGate: Send + Sync {
    fn update_mode(&self, mode: SystemMode, stage: Option<RecoveryStage>);
}

/// Gate that ignores updates (wiring without a gate, dry runs)
#[derive(Debug, Default)]
pub struct NoopGate;

impl PermissionGate for NoopGate {
    fn update_mode(&self, mode: SystemMode, stage: Option<RecoveryStage>) {
        debug!(%mode, ?stage, "NoopGate update ignored");
    }
}

/// Gate snapshot published to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateState {
    pub mode: SystemMode,
    pub stage: Option<RecoveryStage>,
}

/// Gate backed by a watch channel so out-of-core permission logic can
/// observe the latest `(mode, stage)` without polling the state service.
pub struct WatchGate {
    tx: watch::Sender<GateState>,
}

impl WatchGate {
    pub fn new(initial: SystemMode) -> Self {
        let (tx, _) = watch::channel(GateState {
            mode: initial,
            stage: None,
        });
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<GateState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> GateState {
        *self.tx.borrow()
    }
}

impl PermissionGate for WatchGate {
    fn update_mode(&self, mode: SystemMode, stage: Option<RecoveryStage>) {
        // send_replace never fails, even without receivers
        self.tx.send_replace(GateState { mode, stage });
    }
}

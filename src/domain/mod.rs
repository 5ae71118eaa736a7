pub mod event;
pub mod mode;
pub mod reason;
pub mod transition;

pub use event::{ComponentSource, EventType, Severity, SystemEvent};
pub use mode::{RecoveryStage, SystemMode};
pub use reason::ReasonCode;
pub use transition::{ForceOverrideState, ModeTransition};

pub mod event_bus;

pub use event_bus::{BusStats, EmergencyCallback, EventBus, EventBusConfig, EventHandler};

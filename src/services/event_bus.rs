//! Internal Event Bus
//!
//! Bounded, non-blocking publish/subscribe channel for system events.
//!
//! - `publish` never waits: it tries to enqueue and, when the queue is full,
//!   drops the event, counts it, appends a `QueueFull` line to the fallback
//!   log and, for must-deliver event types, calls the emergency callback.
//! - A single dispatch task drains the queue in enqueue order and hands each
//!   event to every subscriber. Handler errors and panics are logged and never
//!   stop dispatch.

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{EventType, SystemEvent};
use crate::error::{Result, SentinelError};

/// Configuration for the event bus
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventBusConfig {
    /// Maximum number of queued, undelivered events
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Append-only text file receiving one line per dropped event
    #[serde(default)]
    pub fallback_log_path: Option<PathBuf>,
    /// Event types that trigger the emergency callback when dropped
    #[serde(default = "default_must_deliver")]
    pub must_deliver: Vec<EventType>,
}

fn default_queue_size() -> usize {
    1024
}

fn default_must_deliver() -> Vec<EventType> {
    vec![
        EventType::BreakerTripped,
        EventType::ModeChanged,
        EventType::RecoveryFailed,
    ]
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            fallback_log_path: None,
            must_deliver: default_must_deliver(),
        }
    }
}

impl EventBusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 {
            return Err(SentinelError::validation(
                "event_bus.queue_size must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Subscriber to bus events
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        "handler"
    }

    async fn handle(&self, event: &SystemEvent) -> Result<()>;
}

/// Synchronous local protective action for dropped must-deliver events.
/// Must not block.
pub type EmergencyCallback = Arc<dyn Fn(&SystemEvent) + Send + Sync>;

/// Counters for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub handler_failures: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
}

type Subscribers = Arc<RwLock<Vec<Arc<dyn EventHandler>>>>;

enum Dispatcher {
    /// Receiver parked, no task running
    Idle(mpsc::Receiver<SystemEvent>),
    Running {
        handle: JoinHandle<mpsc::Receiver<SystemEvent>>,
        shutdown: oneshot::Sender<()>,
    },
    /// Receiver lost (dispatch task failed); the channel is closed
    Detached,
}

/// Bounded event bus with drop-on-full backpressure
pub struct EventBus {
    tx: mpsc::Sender<SystemEvent>,
    dispatcher: Mutex<Dispatcher>,
    subscribers: Subscribers,
    must_deliver: HashSet<EventType>,
    fallback_log_path: Option<PathBuf>,
    emergency_callback: Option<EmergencyCallback>,
    counters: Arc<Counters>,
}

impl EventBus {
    /// Create a new event bus; dispatch starts with `start()`
    pub fn new(config: EventBusConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        Self {
            tx,
            dispatcher: Mutex::new(Dispatcher::Idle(rx)),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            must_deliver: config.must_deliver.into_iter().collect(),
            fallback_log_path: config.fallback_log_path,
            emergency_callback: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(EventBusConfig::default())
    }

    /// Register the emergency callback for dropped must-deliver events
    pub fn with_emergency_callback(mut self, callback: EmergencyCallback) -> Self {
        self.emergency_callback = Some(callback);
        self
    }

    /// Register a subscriber; takes effect for the next dispatched event
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        debug!("Event bus subscriber registered: {}", handler.name());
        subscribers.push(handler);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Events enqueued but not yet taken by the dispatch loop
    pub fn pending_count(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn drop_count(&self) -> u64 {
        self.counters.dropped.load(Ordering::SeqCst)
    }

    pub fn is_must_deliver(&self, event_type: EventType) -> bool {
        self.must_deliver.contains(&event_type)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::SeqCst),
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            dropped: self.counters.dropped.load(Ordering::SeqCst),
            handler_failures: self.counters.handler_failures.load(Ordering::SeqCst),
        }
    }

    /// Publish without blocking.
    ///
    /// Returns `false` when the event was dropped. Never panics and never
    /// propagates failures of the fallback log or emergency callback.
    pub fn publish(&self, event: SystemEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(TrySendError::Full(event)) | Err(TrySendError::Closed(event)) => {
                self.handle_drop(&event);
                false
            }
        }
    }

    fn handle_drop(&self, event: &SystemEvent) {
        let dropped = self.counters.dropped.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            source = %event.source(),
            event_type = %event.event_type(),
            reason_code = %event.reason_code(),
            dropped,
            "Event bus queue full, event dropped"
        );

        self.write_fallback_line(event);

        if self.is_must_deliver(event.event_type()) {
            self.invoke_emergency_callback(event);
        }
    }

    fn write_fallback_line(&self, event: &SystemEvent) {
        let Some(path) = &self.fallback_log_path else {
            return;
        };

        let line = format!(
            "{} QueueFull source={} event_type={} reason_code={} severity={}\n",
            Utc::now().to_rfc3339(),
            event.source(),
            event.event_type(),
            event.reason_code(),
            event.severity()
        );

        let result = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
            _ => Ok(()),
        }
        .and_then(|_| OpenOptions::new().create(true).append(true).open(path))
        .and_then(|mut file| file.write_all(line.as_bytes()));

        if let Err(e) = result {
            error!("Failed to append to fallback log {}: {}", path.display(), e);
        }
    }

    fn invoke_emergency_callback(&self, event: &SystemEvent) {
        let Some(callback) = &self.emergency_callback else {
            warn!(
                event_type = %event.event_type(),
                "Must-deliver event dropped with no emergency callback registered"
            );
            return;
        };

        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            error!(
                event_type = %event.event_type(),
                "Emergency callback panicked"
            );
        }
    }

    /// Start the dispatch task. Repeated calls are no-ops.
    pub async fn start(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        let rx = match std::mem::replace(&mut *dispatcher, Dispatcher::Detached) {
            Dispatcher::Idle(rx) => rx,
            running @ Dispatcher::Running { .. } => {
                *dispatcher = running;
                return;
            }
            Dispatcher::Detached => {
                warn!("Event bus cannot start: dispatch channel was lost");
                return;
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(dispatch_loop(
            rx,
            shutdown_rx,
            self.subscribers.clone(),
            self.counters.clone(),
        ));

        *dispatcher = Dispatcher::Running {
            handle,
            shutdown: shutdown_tx,
        };
        info!("Event bus dispatch started");
    }

    /// Stop the dispatch task and wait for it to finish. Idempotent.
    ///
    /// Events still queued stay queued and are delivered after a later `start()`.
    pub async fn stop(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        let (handle, shutdown) = match std::mem::replace(&mut *dispatcher, Dispatcher::Detached) {
            Dispatcher::Running { handle, shutdown } => (handle, shutdown),
            other => {
                *dispatcher = other;
                return;
            }
        };

        let _ = shutdown.send(());
        match handle.await {
            Ok(rx) => {
                *dispatcher = Dispatcher::Idle(rx);
                info!("Event bus dispatch stopped");
            }
            Err(e) => {
                error!("Event bus dispatch task failed: {}", e);
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.dispatcher.lock().await, Dispatcher::Running { .. })
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<SystemEvent>,
    mut shutdown: oneshot::Receiver<()>,
    subscribers: Subscribers,
    counters: Arc<Counters>,
) -> mpsc::Receiver<SystemEvent> {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            next = rx.recv() => match next {
                Some(event) => deliver(&event, &subscribers, &counters).await,
                None => break,
            },
        }
    }
    rx
}

async fn deliver(event: &SystemEvent, subscribers: &Subscribers, counters: &Counters) {
    let handlers: Vec<Arc<dyn EventHandler>> = subscribers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    for handler in handlers {
        match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                counters.handler_failures.fetch_add(1, Ordering::SeqCst);
                error!(
                    handler = handler.name(),
                    event_type = %event.event_type(),
                    "Event handler failed: {}",
                    e
                );
            }
            Err(_) => {
                counters.handler_failures.fetch_add(1, Ordering::SeqCst);
                error!(
                    handler = handler.name(),
                    event_type = %event.event_type(),
                    "Event handler panicked"
                );
            }
        }
    }

    counters.delivered.fetch_add(1, Ordering::SeqCst);
}

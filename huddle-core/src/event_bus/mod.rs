//! Bounded in-process event bus with critical/non-critical delivery semantics (§4.3).
//!
//! Grounded in `original_source/huddle_chat/services/event_bus.py` (bounded queue, retry
//! budget for critical events, per-handler failure isolation) and adapted to the teacher's
//! `tokio::sync::mpsc` + `Arc<dyn Fn>` handler-registry idiom.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

/// Default bounded queue capacity (§4.3).
pub const EVENT_BUS_CAPACITY: usize = 512;
/// Retry budget for a critical event whose handler fails (§4.3).
pub const CRITICAL_RETRY_ATTEMPTS: u32 = 2;
pub const CRITICAL_RETRY_TIMEOUT: Duration = Duration::from_millis(100);

/// Narrow controller-facing event surface (§4.11.1). `RunCommand` carries the raw command
/// line so the dispatcher can fall back to direct execution when the bus is saturated.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    SystemMessage(String),
    RefreshOutput,
    RebuildSearch,
    RunCommand(String),
}

type Handler = Arc<dyn Fn(&ControllerEvent) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Default)]
pub struct EventBusMetrics {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub retried: AtomicU64,
    pub dropped: AtomicU64,
    pub handler_failures: AtomicU64,
    pub queue_full: AtomicU64,
    pub fallback_executed: AtomicU64,
}

impl EventBusMetrics {
    pub fn snapshot(&self) -> EventBusMetricsSnapshot {
        EventBusMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            fallback_executed: self.fallback_executed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventBusMetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dropped: u64,
    pub handler_failures: u64,
    pub queue_full: u64,
    pub fallback_executed: u64,
}

/// A bounded FIFO of [`ControllerEvent`]s with a registered handler set. Non-critical
/// publishes drop silently when the queue is full; critical publishes retry the handler
/// directly with a short timeout budget instead of enqueuing (§4.3).
pub struct EventBus {
    sender: mpsc::Sender<ControllerEvent>,
    receiver: Mutex<mpsc::Receiver<ControllerEvent>>,
    handlers: Mutex<Vec<Handler>>,
    metrics: Arc<EventBusMetrics>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            handlers: Mutex::new(Vec::new()),
            metrics: Arc::new(EventBusMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<EventBusMetrics> {
        self.metrics.clone()
    }

    pub async fn register_handler<F>(&self, handler: F)
    where
        F: Fn(&ControllerEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.handlers.lock().await.push(Arc::new(handler));
    }

    /// Enqueues `event`. Non-critical events are dropped (and counted) when the queue is
    /// full rather than blocking the publisher. Critical events bypass the queue and are
    /// dispatched to handlers immediately with a bounded retry budget; returns `false` if
    /// every handler failed on every attempt, signalling the caller to run its own fallback.
    pub async fn publish(&self, event: ControllerEvent, critical: bool) -> bool {
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        if critical {
            return self.dispatch_critical(&event).await;
        }
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.metrics.queue_full.fetch_add(1, Ordering::Relaxed);
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    async fn dispatch_critical(&self, event: &ControllerEvent) -> bool {
        for attempt in 0..=CRITICAL_RETRY_ATTEMPTS {
            if attempt > 0 {
                self.metrics.retried.fetch_add(1, Ordering::Relaxed);
            }
            let ok = tokio::time::timeout(CRITICAL_RETRY_TIMEOUT, self.dispatch_once(event))
                .await
                .unwrap_or(false);
            if ok {
                self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
        self.metrics.fallback_executed.fetch_add(1, Ordering::Relaxed);
        false
    }

    async fn dispatch_once(&self, event: &ControllerEvent) -> bool {
        let handlers = self.handlers.lock().await.clone();
        if handlers.is_empty() {
            return false;
        }
        let mut all_ok = true;
        for handler in handlers {
            if handler(event).is_err() {
                self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                all_ok = false;
            }
        }
        all_ok
    }

    /// Drains queued (non-critical) events to registered handlers. Intended to run as the
    /// background pump loop started once at startup.
    pub async fn drain_once(&self) -> usize {
        let mut receiver = self.receiver.lock().await;
        let mut delivered = 0;
        while let Ok(event) = receiver.try_recv() {
            if self.dispatch_once(&event).await {
                self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            }
            delivered += 1;
        }
        delivered
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// **Scenario**: a non-critical publish beyond capacity is dropped, not blocked.
    #[tokio::test]
    async fn queue_full_drops_non_critical() {
        let bus = EventBus::with_capacity(1);
        assert!(bus.publish(ControllerEvent::RefreshOutput, false).await);
        assert!(!bus.publish(ControllerEvent::RefreshOutput, false).await);
        assert_eq!(bus.metrics().snapshot().queue_full, 1);
    }

    /// **Scenario**: a critical event retries until a handler succeeds, then stops.
    #[tokio::test]
    async fn critical_event_retries_until_handler_succeeds() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        bus.register_handler(move |_event| {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            if n < 1 {
                Err("not yet".to_string())
            } else {
                Ok(())
            }
        })
        .await;

        let ok = bus.publish(ControllerEvent::SystemMessage("hi".into()), true).await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// **Scenario**: a critical event with no successful handler reports fallback-needed.
    #[tokio::test]
    async fn critical_event_exhausts_retries_and_signals_fallback() {
        let bus = EventBus::new();
        bus.register_handler(|_event| Err("always fails".to_string())).await;

        let ok = bus.publish(ControllerEvent::RebuildSearch, true).await;
        assert!(!ok);
        assert_eq!(bus.metrics().snapshot().fallback_executed, 1);
    }

    /// **Scenario**: queued non-critical events are delivered on drain.
    #[tokio::test]
    async fn drain_delivers_queued_events() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        bus.register_handler(move |_event| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        bus.publish(ControllerEvent::RefreshOutput, false).await;
        bus.publish(ControllerEvent::RebuildSearch, false).await;

        let delivered = bus.drain_once().await;
        assert_eq!(delivered, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

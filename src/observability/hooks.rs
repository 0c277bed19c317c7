//! Observability extension points.
//!
//! The core pushes counters and lifecycle transitions to registered hooks
//! and keeps nothing itself. Hooks must be cheap and must not block.

use crate::core::{CorrelationId, ErrorKind};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// Stage of an outbound message's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleStage {
    Submitted,
    Admitted,
    Signed,
    Dispatched,
    Acknowledged,
    Failed,
}

impl std::fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleStage::Submitted => "submitted",
            LifecycleStage::Admitted => "admitted",
            LifecycleStage::Signed => "signed",
            LifecycleStage::Dispatched => "dispatched",
            LifecycleStage::Acknowledged => "acknowledged",
            LifecycleStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One lifecycle transition.
#[derive(Clone, Debug, PartialEq)]
pub struct LifecycleEvent {
    pub correlation_id: CorrelationId,
    pub stage: LifecycleStage,
    pub class: String,
    /// Set on `Failed`
    pub error: Option<ErrorKind>,
}

/// Counter and gauge updates.
#[derive(Clone, Debug, PartialEq)]
pub enum CounterEvent {
    /// An envelope left through a transport
    Sent { class: String },
    /// An outbound envelope failed terminally
    Failed { class: String, kind: ErrorKind },
    /// Current depth of a class queue
    QueueDepth { class: String, depth: usize },
    /// Resolution found at least one candidate
    ResolutionHit { intent: String },
    /// Resolution found no candidate
    ResolutionMiss { intent: String },
    /// An inbound envelope was dropped
    InboundRejected { kind: ErrorKind },
}

/// Receiver of observability events.
pub trait ObservabilityHook: Send + Sync {
    fn on_counter(&self, _event: &CounterEvent) {}

    fn on_lifecycle(&self, _event: &LifecycleEvent) {}
}

/// Fan-out over registered hooks. Cloning shares the registration list.
#[derive(Clone, Default)]
pub struct Hooks {
    hooks: Arc<RwLock<Vec<Arc<dyn ObservabilityHook>>>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: Arc<dyn ObservabilityHook>) {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counter(&self, event: CounterEvent) {
        for hook in self.snapshot() {
            hook.on_counter(&event);
        }
    }

    pub fn lifecycle(&self, correlation_id: CorrelationId, stage: LifecycleStage, class: &str) {
        self.emit_lifecycle(LifecycleEvent {
            correlation_id,
            stage,
            class: class.to_string(),
            error: None,
        });
    }

    pub fn failed(&self, correlation_id: CorrelationId, class: &str, kind: ErrorKind) {
        self.emit_lifecycle(LifecycleEvent {
            correlation_id,
            stage: LifecycleStage::Failed,
            class: class.to_string(),
            error: Some(kind),
        });
        self.counter(CounterEvent::Failed {
            class: class.to_string(),
            kind,
        });
    }

    fn emit_lifecycle(&self, event: LifecycleEvent) {
        for hook in self.snapshot() {
            hook.on_lifecycle(&event);
        }
    }

    // Hooks run without the lock held so they may register further hooks.
    fn snapshot(&self) -> Vec<Arc<dyn ObservabilityHook>> {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").field("registered", &self.len()).finish()
    }
}

/// Forwards every event to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingHook;

impl ObservabilityHook for TracingHook {
    fn on_counter(&self, event: &CounterEvent) {
        match event {
            CounterEvent::QueueDepth { class, depth } => trace!(class = %class, depth, "queue depth"),
            other => debug!(event = ?other, "counter"),
        }
    }

    fn on_lifecycle(&self, event: &LifecycleEvent) {
        debug!(
            correlation_id = %event.correlation_id,
            stage = %event.stage,
            class = %event.class,
            error = ?event.error,
            "lifecycle"
        );
    }
}

/// Collects events in memory for assertions.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingHook {
    pub counters: std::sync::Mutex<Vec<CounterEvent>>,
    pub lifecycle: std::sync::Mutex<Vec<LifecycleEvent>>,
}

#[cfg(test)]
impl RecordingHook {
    pub fn stages(&self, correlation_id: CorrelationId) -> Vec<LifecycleStage> {
        self.lifecycle
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .map(|e| e.stage)
            .collect()
    }

    pub fn counters(&self) -> Vec<CounterEvent> {
        self.counters.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl ObservabilityHook for RecordingHook {
    fn on_counter(&self, event: &CounterEvent) {
        self.counters.lock().unwrap().push(event.clone());
    }

    fn on_lifecycle(&self, event: &LifecycleEvent) {
        self.lifecycle.lock().unwrap().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_to_all_hooks() {
        let hooks = Hooks::new();
        let first = Arc::new(RecordingHook::default());
        let second = Arc::new(RecordingHook::default());
        hooks.register(first.clone());
        hooks.register(second.clone());
        hooks.register(Arc::new(TracingHook));

        let id = CorrelationId::new();
        hooks.lifecycle(id, LifecycleStage::Submitted, "realtime");
        hooks.failed(id, "realtime", ErrorKind::Overloaded);

        for hook in [&first, &second] {
            assert_eq!(
                hook.stages(id),
                vec![LifecycleStage::Submitted, LifecycleStage::Failed]
            );
            assert_eq!(
                hook.counters(),
                vec![CounterEvent::Failed {
                    class: "realtime".into(),
                    kind: ErrorKind::Overloaded
                }]
            );
        }
    }

    #[test]
    fn test_clones_share_registrations() {
        let hooks = Hooks::new();
        let clone = hooks.clone();
        clone.register(Arc::new(TracingHook));
        assert_eq!(hooks.len(), 1);
    }
}

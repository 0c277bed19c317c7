//! Observability Hooks.
//!
//! Counters and lifecycle spans are pushed to registered hooks; logging goes
//! through `tracing`.

pub mod hooks;
pub mod logging;

pub use hooks::{CounterEvent, Hooks, LifecycleEvent, LifecycleStage, ObservabilityHook, TracingHook};
pub use logging::{init_tracing, LogFormat, LoggingConfig};

//! QoS admission and scheduling.
//!
//! Envelopes are classified by their declared class, admitted or rejected
//! against deadline and queue bounds, and dispatched in an order that honours
//! priority weights while guaranteeing each class its minimum share.

pub mod class;
pub mod scheduler;

pub use class::{OverflowPolicy, QosClassConfig, QosConfig};
pub use scheduler::{Dispatch, DispatchPermit, Expired, QosScheduler, Scheduled};

//! Admission and dispatch ordering across QoS classes.
//!
//! Each class owns a bounded FIFO lane with two semaphores: `space` counts
//! free queue slots and `concurrency` caps in-flight dispatches. Dispatch
//! order is decided under a single short lock:
//!
//! 1. a queued head whose deadline has passed is surfaced as
//!    [`Scheduled::Expired`] before anything else is dispatched;
//! 2. among classes with work and a free concurrency permit, smooth weighted
//!    round-robin by priority weight picks a class;
//! 3. unless that pick would leave some class unable to get its minimum
//!    share into every `fairness_window` consecutive decisions, in which case
//!    the class whose share falls due first is served instead.
//!
//! Backpressure classes never reject a plausible-later message: a producer
//! whose deadline cannot be met behind the current queue waits for the lane
//! to drain until its own deadline passes.

use crate::core::{now_millis, CorrelationId, Error, Result};
use crate::envelope::EnvelopeHeader;
use crate::observability::{CounterEvent, Hooks};
use crate::qos::class::{OverflowPolicy, QosClassConfig, QosConfig};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Upper bound on how long [`QosScheduler::next`] sleeps without a wakeup,
/// so that heads blocked on concurrency still get their expiry reported.
const EXPIRY_POLL_MS: u64 = 25;

struct Lane {
    config: QosClassConfig,
    space: Arc<Semaphore>,
    concurrency: Arc<Semaphore>,
    /// Signalled whenever an entry leaves the queue
    drained: Notify,
}

struct Queued<T> {
    item: T,
    correlation_id: CorrelationId,
    deadline_ms: u64,
    enqueued_ms: u64,
}

struct State<T> {
    queues: Vec<VecDeque<Queued<T>>>,
    /// Smooth weighted round-robin running weights
    current: Vec<i64>,
    /// Classes of the last `fairness_window` decisions
    history: VecDeque<usize>,
    /// Decisions made so far; the slot number of the next one
    decisions: u64,
}

/// In-flight slot of a class. Dropping it frees the slot and wakes the
/// dispatcher.
pub struct DispatchPermit {
    permit: Option<OwnedSemaphorePermit>,
    available: Arc<Notify>,
}

impl Drop for DispatchPermit {
    fn drop(&mut self) {
        // Release before notifying so the woken dispatcher sees the slot.
        self.permit.take();
        self.available.notify_one();
    }
}

impl std::fmt::Debug for DispatchPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPermit").finish_non_exhaustive()
    }
}

/// An entry selected for dispatch.
#[derive(Debug)]
pub struct Dispatch<T> {
    pub item: T,
    pub correlation_id: CorrelationId,
    pub class: String,
    pub deadline_ms: u64,
    /// Time spent queued
    pub waited_ms: u64,
    pub permit: DispatchPermit,
}

/// An entry whose deadline passed while it was queued.
#[derive(Debug)]
pub struct Expired<T> {
    pub item: T,
    pub correlation_id: CorrelationId,
    pub class: String,
    pub deadline_ms: u64,
}

impl<T> Expired<T> {
    pub fn error(&self) -> Error {
        Error::DeadlineExceeded {
            correlation_id: Some(self.correlation_id),
            class: self.class.clone(),
            reason: "deadline passed while queued".to_string(),
        }
    }
}

/// Outcome of one scheduling decision.
#[derive(Debug)]
pub enum Scheduled<T> {
    Ready(Dispatch<T>),
    Expired(Expired<T>),
}

/// Multi-class admission queue with deadline and fairness enforcement.
pub struct QosScheduler<T> {
    config: QosConfig,
    lanes: Vec<Lane>,
    index: HashMap<String, usize>,
    state: Mutex<State<T>>,
    available: Arc<Notify>,
    hooks: Hooks,
}

impl<T> QosScheduler<T> {
    pub fn new(config: QosConfig) -> Result<Self> {
        Self::with_hooks(config, Hooks::new())
    }

    pub fn with_hooks(config: QosConfig, hooks: Hooks) -> Result<Self> {
        config.validate()?;
        let lanes: Vec<Lane> = config
            .classes
            .iter()
            .map(|class| Lane {
                config: class.clone(),
                space: Arc::new(Semaphore::new(class.queue_bound)),
                concurrency: Arc::new(Semaphore::new(class.max_concurrency)),
                drained: Notify::new(),
            })
            .collect();
        let index = lanes
            .iter()
            .enumerate()
            .map(|(i, lane)| (lane.config.name.clone(), i))
            .collect();
        let n = lanes.len();
        Ok(Self {
            state: Mutex::new(State {
                queues: (0..n).map(|_| VecDeque::new()).collect(),
                current: vec![0; n],
                history: VecDeque::with_capacity(config.fairness_window),
                decisions: 0,
            }),
            config,
            lanes,
            index,
            available: Arc::new(Notify::new()),
            hooks,
        })
    }

    pub fn config(&self) -> &QosConfig {
        &self.config
    }

    pub fn class(&self, name: &str) -> Option<&QosClassConfig> {
        self.index.get(name).map(|&i| &self.lanes[i].config)
    }

    /// Queued entries in `class`.
    pub fn depth(&self, class: &str) -> Option<usize> {
        let i = *self.index.get(class)?;
        Some(self.lock().queues[i].len())
    }

    /// Dispatches of `class` currently holding a permit.
    pub fn in_flight(&self, class: &str) -> Option<usize> {
        let lane = &self.lanes[*self.index.get(class)?];
        Some(lane.config.max_concurrency - lane.concurrency.available_permits())
    }

    /// Fail-fast checks for a message with `deadline_ms` in `class`.
    pub fn check_admission(&self, class: &str, deadline_ms: u64, now_ms: u64) -> Result<()> {
        let i = self.lane_index(class)?;
        let lane = &self.lanes[i];
        if deadline_ms <= now_ms {
            return Err(deadline(class, "deadline elapsed before admission"));
        }
        let depth = self.lock().queues[i].len();
        if lane.config.projected_completion_ms(now_ms, depth) > deadline_ms {
            return Err(deadline(
                class,
                format!("deadline cannot be met behind {} queued entries", depth),
            ));
        }
        if lane.config.overflow == OverflowPolicy::Reject && lane.space.available_permits() == 0 {
            return Err(overloaded(class));
        }
        Ok(())
    }

    /// Accept or reject an envelope without queueing it.
    pub fn admit(&self, header: &EnvelopeHeader, now_ms: u64) -> Result<()> {
        self.check_admission(&header.qos_class, header.deadline_ms(), now_ms)
            .map_err(|e| e.with_correlation(header.correlation_id))
    }

    /// Admit and queue without waiting. A full queue yields `Overloaded`
    /// whatever the overflow policy.
    pub fn try_enqueue(&self, header: &EnvelopeHeader, item: T, now_ms: u64) -> Result<()> {
        self.admit(header, now_ms)?;
        let i = self.lane_index(&header.qos_class)?;
        match self.lanes[i].space.try_acquire() {
            Ok(slot) => slot.forget(),
            Err(_) => {
                return Err(overloaded(&header.qos_class).with_correlation(header.correlation_id))
            }
        }
        self.push(i, header, item, now_ms);
        Ok(())
    }

    /// Admit and queue. Classes with the `backpressure` overflow policy
    /// suspend here while the queue is full or too deep for the deadline,
    /// until it drains enough or the deadline passes.
    pub async fn enqueue(&self, header: &EnvelopeHeader, item: T) -> Result<()> {
        let now_ms = now_millis();
        let i = self.lane_index(&header.qos_class).map_err(|e| e.with_correlation(header.correlation_id))?;
        let lane = &self.lanes[i];
        if lane.config.overflow == OverflowPolicy::Reject {
            return self.try_enqueue(header, item, now_ms);
        }
        let deadline_ms = header.deadline_ms();
        if deadline_ms <= now_ms {
            return Err(deadline(&header.qos_class, "deadline elapsed before admission")
                .with_correlation(header.correlation_id));
        }

        loop {
            let drained = lane.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            let now_ms = now_millis();
            if header.is_expired(now_ms) {
                return Err(suspended_too_long(header));
            }
            let wait = Duration::from_millis(deadline_ms.saturating_sub(now_ms));
            if !self.plausible(i, deadline_ms, now_ms) {
                debug!(class = %header.qos_class, correlation_id = %header.correlation_id, "producer suspended behind deep queue");
                if tokio::time::timeout(wait, drained).await.is_err() {
                    return Err(suspended_too_long(header));
                }
                continue;
            }

            let slot = match tokio::time::timeout(wait, lane.space.clone().acquire_owned()).await {
                Ok(Ok(slot)) => slot,
                Ok(Err(_)) => {
                    return Err(Error::Internal(format!(
                        "queue for class {} is closed",
                        header.qos_class
                    )))
                }
                Err(_) => return Err(suspended_too_long(header)),
            };

            // Other producers may have filled the lane while this one waited;
            // the slot is returned on drop.
            let now_ms = now_millis();
            if header.is_expired(now_ms) {
                return Err(suspended_too_long(header));
            }
            if self.plausible(i, deadline_ms, now_ms) {
                slot.forget();
                self.push(i, header, item, now_ms);
                return Ok(());
            }
        }
    }

    fn plausible(&self, i: usize, deadline_ms: u64, now_ms: u64) -> bool {
        let depth = self.lock().queues[i].len();
        self.lanes[i].config.projected_completion_ms(now_ms, depth) <= deadline_ms
    }

    /// Make one scheduling decision without waiting.
    pub fn try_next(&self, now_ms: u64) -> Option<Scheduled<T>> {
        let (scheduled, class, depth) = {
            let mut state = self.lock();

            if let Some(i) = (0..self.lanes.len()).find(|&i| {
                state.queues[i]
                    .front()
                    .is_some_and(|q| q.deadline_ms <= now_ms)
            }) {
                let queued = state.queues[i].pop_front()?;
                self.lanes[i].space.add_permits(1);
                self.lanes[i].drained.notify_waiters();
                let class = self.lanes[i].config.name.clone();
                let depth = state.queues[i].len();
                warn!(class = %class, correlation_id = %queued.correlation_id, "queued entry expired");
                let expired = Expired {
                    item: queued.item,
                    correlation_id: queued.correlation_id,
                    class: class.clone(),
                    deadline_ms: queued.deadline_ms,
                };
                (Scheduled::Expired(expired), class, depth)
            } else {
                let eligible: Vec<usize> = (0..self.lanes.len())
                    .filter(|&i| {
                        !state.queues[i].is_empty() && self.lanes[i].concurrency.available_permits() > 0
                    })
                    .collect();
                let i = self.choose(&mut state, &eligible)?;
                let permit = self.lanes[i].concurrency.clone().try_acquire_owned().ok()?;
                let queued = state.queues[i].pop_front()?;
                self.lanes[i].space.add_permits(1);
                self.lanes[i].drained.notify_waiters();
                self.record(&mut state, i);

                let class = self.lanes[i].config.name.clone();
                let depth = state.queues[i].len();
                let dispatch = Dispatch {
                    item: queued.item,
                    correlation_id: queued.correlation_id,
                    class: class.clone(),
                    deadline_ms: queued.deadline_ms,
                    waited_ms: now_ms.saturating_sub(queued.enqueued_ms),
                    permit: DispatchPermit {
                        permit: Some(permit),
                        available: self.available.clone(),
                    },
                };
                (Scheduled::Ready(dispatch), class, depth)
            }
        };
        self.hooks.counter(CounterEvent::QueueDepth { class, depth });
        Some(scheduled)
    }

    /// Wait for the next scheduling decision.
    pub async fn next(&self) -> Scheduled<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(scheduled) = self.try_next(now_millis()) {
                return scheduled;
            }
            let _ = tokio::time::timeout(Duration::from_millis(EXPIRY_POLL_MS), notified).await;
        }
    }

    fn push(&self, i: usize, header: &EnvelopeHeader, item: T, now_ms: u64) {
        let depth = {
            let mut state = self.lock();
            state.queues[i].push_back(Queued {
                item,
                correlation_id: header.correlation_id,
                deadline_ms: header.deadline_ms(),
                enqueued_ms: now_ms,
            });
            state.queues[i].len()
        };
        debug!(class = %header.qos_class, correlation_id = %header.correlation_id, depth, "admitted");
        self.hooks.counter(CounterEvent::QueueDepth {
            class: header.qos_class.clone(),
            depth,
        });
        self.available.notify_one();
    }

    fn choose(&self, state: &mut State<T>, eligible: &[usize]) -> Option<usize> {
        if eligible.is_empty() {
            return None;
        }

        let mut current = state.current.clone();
        let mut total = 0i64;
        let mut best: Option<usize> = None;
        for &i in eligible {
            let weight = i64::from(self.lanes[i].config.priority_weight);
            current[i] += weight;
            total += weight;
            if best.map_or(true, |b| current[i] > current[b]) {
                best = Some(i);
            }
        }
        let weighted = best?;

        // Serving `weighted` now must leave one free slot per outstanding
        // share before each of their deadlines.
        let mut due = self.share_deadlines(state, eligible);
        due.sort_unstable();
        let most_urgent = due.first().map(|&(_, i)| i);
        if let Some(k) = due.iter().position(|&(_, i)| i == weighted) {
            due.remove(k);
        }
        let slot = state.decisions;
        let keeps_shares = due
            .iter()
            .enumerate()
            .all(|(k, &(deadline, _))| deadline > slot + k as u64);
        if keeps_shares {
            current[weighted] -= total;
            state.current = current;
            return Some(weighted);
        }
        most_urgent
    }

    /// For every eligible class, the decision slots by which it must be
    /// served again so that each window of `fairness_window` consecutive
    /// decisions holds its minimum share. A class short of its share is due
    /// now (or at the end of the first window).
    fn share_deadlines(&self, state: &State<T>, eligible: &[usize]) -> Vec<(u64, usize)> {
        let window = self.config.fairness_window as u64;
        let slot = state.decisions;
        let first = slot - state.history.len() as u64;
        let mut due = Vec::new();
        for &i in eligible {
            let share = (self.lanes[i].config.min_share * window as f64).floor() as usize;
            if share == 0 {
                continue;
            }
            let served: Vec<u64> = state
                .history
                .iter()
                .enumerate()
                .filter(|&(_, &class)| class == i)
                .map(|(k, _)| first + k as u64)
                .collect();
            let kept = &served[served.len().saturating_sub(share)..];
            due.extend(kept.iter().map(|&at| (at + window, i)));
            let short = share - kept.len();
            due.extend(std::iter::repeat((slot.max(window - 1), i)).take(short));
        }
        due
    }

    fn record(&self, state: &mut State<T>, i: usize) {
        state.history.push_back(i);
        state.decisions += 1;
        if state.history.len() > self.config.fairness_window {
            state.history.pop_front();
        }
    }

    fn lane_index(&self, class: &str) -> Result<usize> {
        self.index
            .get(class)
            .copied()
            .ok_or_else(|| Error::malformed(format!("unknown QoS class '{}'", class)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> std::fmt::Debug for QosScheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QosScheduler")
            .field("classes", &self.index.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn deadline(class: &str, reason: impl Into<String>) -> Error {
    Error::DeadlineExceeded {
        correlation_id: None,
        class: class.to_string(),
        reason: reason.into(),
    }
}

fn suspended_too_long(header: &EnvelopeHeader) -> Error {
    deadline(&header.qos_class, "deadline passed while waiting for queue space")
        .with_correlation(header.correlation_id)
}

fn overloaded(class: &str) -> Error {
    Error::Overloaded {
        correlation_id: None,
        class: class.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::envelope::Envelope;
    use crate::observability::hooks::RecordingHook;
    use tokio_test::{assert_pending, assert_ready};

    fn header(class: &str, now_ms: u64, ttl_ms: u32) -> EnvelopeHeader {
        Envelope::request("research:climate-analysis:run@1.0.0", class)
            .unwrap()
            .with_timestamp(now_ms)
            .with_ttl(ttl_ms)
            .header
    }

    fn small_config() -> QosConfig {
        let mut config = QosConfig::default();
        for class in &mut config.classes {
            class.queue_bound = 2;
            class.service_estimate_ms = 1;
        }
        config
    }

    #[test]
    fn test_expired_at_submission_is_rejected() {
        let scheduler: QosScheduler<u32> = QosScheduler::new(QosConfig::default()).unwrap();
        let h = header("realtime", 1_000, 100);
        let err = scheduler.try_enqueue(&h, 1, 1_100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        assert_eq!(err.correlation_id(), Some(h.correlation_id));
        assert_eq!(scheduler.depth("realtime"), Some(0));
        assert!(scheduler.try_next(1_100).is_none());
    }

    #[test]
    fn test_implausible_deadline_is_rejected() {
        let mut config = QosConfig::default();
        config.classes[0].max_concurrency = 1;
        config.classes[0].queue_bound = 8;
        let scheduler: QosScheduler<u32> = QosScheduler::new(config).unwrap();
        // Each realtime entry is estimated at 50 ms.
        for n in 0..3 {
            scheduler.try_enqueue(&header("realtime", 0, 10_000), n, 0).unwrap();
        }
        let err = scheduler.admit(&header("realtime", 0, 120), 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        assert!(scheduler.admit(&header("realtime", 0, 200), 0).is_ok());
    }

    #[test]
    fn test_unknown_class_is_malformed() {
        let scheduler: QosScheduler<u32> = QosScheduler::new(QosConfig::default()).unwrap();
        let err = scheduler.admit(&header("gold", 0, 1_000), 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
    }

    #[test]
    fn test_full_queue_is_overloaded() {
        let scheduler: QosScheduler<u32> = QosScheduler::new(small_config()).unwrap();
        scheduler.try_enqueue(&header("interactive", 0, 10_000), 1, 0).unwrap();
        scheduler.try_enqueue(&header("interactive", 0, 10_000), 2, 0).unwrap();
        let h = header("interactive", 0, 10_000);
        let err = scheduler.try_enqueue(&h, 3, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overloaded);
        assert_eq!(err.correlation_id(), Some(h.correlation_id));
        assert!(scheduler.admit(&h, 0).is_err());
    }

    #[tokio::test]
    async fn test_batch_producer_suspends_until_space_frees() {
        let scheduler: QosScheduler<u32> = QosScheduler::new(small_config()).unwrap();
        let now = now_millis();
        scheduler.enqueue(&header("batch", now, 60_000), 1).await.unwrap();
        scheduler.enqueue(&header("batch", now, 60_000), 2).await.unwrap();

        let third = header("batch", now, 60_000);
        let mut pending = tokio_test::task::spawn(scheduler.enqueue(&third, 3));
        assert_pending!(pending.poll());
        assert_eq!(scheduler.depth("batch"), Some(2));

        let first = match scheduler.try_next(now_millis()) {
            Some(Scheduled::Ready(dispatch)) => dispatch,
            other => panic!("expected dispatch, got {:?}", other.map(|_| ())),
        };
        assert_eq!(first.item, 1);
        assert!(pending.is_woken());
        assert_ready!(pending.poll()).unwrap();
        drop(pending);
        assert_eq!(scheduler.depth("batch"), Some(2));
    }

    #[tokio::test]
    async fn test_default_batch_queues_to_its_bound() {
        let scheduler: QosScheduler<u32> = QosScheduler::new(QosConfig::default()).unwrap();
        let bound = scheduler.class("batch").unwrap().queue_bound;
        let now = now_millis();
        for n in 0..1_000 {
            scheduler.enqueue(&header("batch", now, 60_000), n).await.unwrap();
        }
        for n in 1_000..bound as u32 {
            scheduler.enqueue(&header("batch", now, 60_000), n).await.unwrap();
        }
        assert_eq!(scheduler.depth("batch"), Some(bound));

        let last = header("batch", now, 60_000);
        let mut pending = tokio_test::task::spawn(scheduler.enqueue(&last, u32::MAX));
        assert_pending!(pending.poll());

        match scheduler.try_next(now_millis()) {
            Some(Scheduled::Ready(dispatch)) => assert_eq!(dispatch.item, 0),
            other => panic!("expected dispatch, got {:?}", other.map(|_| ())),
        }
        assert!(pending.is_woken());
        assert_ready!(pending.poll()).unwrap();
        drop(pending);
        assert_eq!(scheduler.depth("batch"), Some(bound));
    }

    #[tokio::test]
    async fn test_batch_producer_waits_out_deep_queue() {
        let scheduler: QosScheduler<u32> = QosScheduler::new(QosConfig::default()).unwrap();
        let batch = scheduler.class("batch").unwrap().clone();
        let now = now_millis();
        for n in 0..(2 * batch.max_concurrency) as u32 {
            scheduler.enqueue(&header("batch", now, 60_000), n).await.unwrap();
        }

        // Two service rounds queued ahead, room for one.
        let ttl = (batch.service_estimate_ms * 7 / 4) as u32;
        let hurried = header("batch", now_millis(), ttl);
        let err = scheduler.admit(&hurried, now_millis()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        let mut pending = tokio_test::task::spawn(scheduler.enqueue(&hurried, 99));
        assert_pending!(pending.poll());

        for _ in 0..batch.max_concurrency {
            assert!(matches!(scheduler.try_next(now_millis()), Some(Scheduled::Ready(_))));
        }
        assert!(pending.is_woken());
        assert_ready!(pending.poll()).unwrap();
        drop(pending);
        assert_eq!(scheduler.depth("batch"), Some(batch.max_concurrency + 1));
    }

    #[tokio::test]
    async fn test_batch_producer_times_out_at_deadline() {
        let scheduler: QosScheduler<u32> = QosScheduler::new(small_config()).unwrap();
        let now = now_millis();
        scheduler.enqueue(&header("batch", now, 60_000), 1).await.unwrap();
        scheduler.enqueue(&header("batch", now, 60_000), 2).await.unwrap();

        let err = scheduler
            .enqueue(&header("batch", now_millis(), 50), 3)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn test_expired_while_queued_is_reported() {
        let scheduler: QosScheduler<u32> = QosScheduler::new(QosConfig::default()).unwrap();
        let h = header("interactive", 0, 1_000);
        scheduler.try_enqueue(&h, 7, 0).unwrap();
        match scheduler.try_next(5_000) {
            Some(Scheduled::Expired(expired)) => {
                assert_eq!(expired.item, 7);
                assert_eq!(expired.error().kind(), ErrorKind::DeadlineExceeded);
                assert_eq!(expired.error().correlation_id(), Some(h.correlation_id));
            }
            _ => panic!("expected expiry"),
        }
        assert_eq!(scheduler.depth("interactive"), Some(0));
    }

    #[test]
    fn test_concurrency_limit_holds_dispatch() {
        let mut config = QosConfig::default();
        config.classes[1].max_concurrency = 1;
        config.classes[1].queue_bound = 4;
        let scheduler: QosScheduler<u32> = QosScheduler::new(config).unwrap();
        scheduler.try_enqueue(&header("interactive", 0, 60_000), 1, 0).unwrap();
        scheduler.try_enqueue(&header("interactive", 0, 60_000), 2, 0).unwrap();

        let first = match scheduler.try_next(1) {
            Some(Scheduled::Ready(d)) => d,
            _ => panic!("expected dispatch"),
        };
        assert_eq!(scheduler.in_flight("interactive"), Some(1));
        assert!(scheduler.try_next(1).is_none());

        drop(first);
        match scheduler.try_next(1) {
            Some(Scheduled::Ready(d)) => assert_eq!(d.item, 2),
            _ => panic!("expected dispatch after release"),
        }
    }

    fn shares(config: &QosConfig) -> Vec<(String, f64)> {
        config
            .classes
            .iter()
            .map(|c| (c.name.clone(), c.min_share))
            .collect()
    }

    fn assert_min_shares(served: &[String], shares: &[(String, f64)], window: usize) {
        for end in window..=served.len() {
            let recent = &served[end - window..end];
            for (name, share) in shares {
                let count = recent.iter().filter(|c| *c == name).count();
                let floor = (share * window as f64).floor() as usize;
                assert!(
                    count >= floor,
                    "class {} served {} of {} decisions ending at {}",
                    name,
                    count,
                    window,
                    end
                );
            }
        }
    }

    #[test]
    fn test_minimum_shares_hold_under_flood() {
        let mut config = QosConfig::default();
        for class in &mut config.classes {
            class.queue_bound = 10_000;
            class.service_estimate_ms = 0;
        }
        config.classes[0].priority_weight = 100;
        config.classes[1].priority_weight = 1;
        config.classes[2].priority_weight = 1;
        let window = config.fairness_window;
        let shares = shares(&config);
        let scheduler: QosScheduler<usize> = QosScheduler::new(config).unwrap();

        for n in 0..2_000 {
            scheduler.try_enqueue(&header("realtime", 0, u32::MAX), n, 0).unwrap();
        }
        for n in 0..1_000 {
            scheduler.try_enqueue(&header("interactive", 0, u32::MAX), n, 0).unwrap();
            scheduler.try_enqueue(&header("batch", 0, u32::MAX), n, 0).unwrap();
        }

        let mut served: Vec<String> = Vec::new();
        for _ in 0..1_000 {
            match scheduler.try_next(1) {
                Some(Scheduled::Ready(d)) => served.push(d.class.clone()),
                _ => panic!("expected dispatch"),
            }
        }

        assert_min_shares(&served, &shares, window);
        let realtime = served.iter().filter(|c| *c == "realtime").count();
        assert!(realtime > 600);
    }

    #[test]
    fn test_minimum_shares_hold_with_default_classes() {
        let config = QosConfig::default();
        let window = config.fairness_window;
        let shares = shares(&config);
        let scheduler: QosScheduler<usize> = QosScheduler::new(config.clone()).unwrap();
        for class in &config.classes {
            for n in 0..class.queue_bound {
                scheduler.try_enqueue(&header(&class.name, 0, u32::MAX), n, 0).unwrap();
            }
        }

        let mut served: Vec<String> = Vec::new();
        for n in 0..600 {
            let class = match scheduler.try_next(1) {
                Some(Scheduled::Ready(d)) => d.class.clone(),
                _ => panic!("expected dispatch"),
            };
            scheduler.try_enqueue(&header(&class, 0, u32::MAX), n, 0).unwrap();
            served.push(class);
        }

        assert_min_shares(&served, &shares, window);
        // Unconstrained weights 8:4:1 would give batch under 8%.
        let batch = served.iter().filter(|c| *c == "batch").count();
        assert!(batch >= 60, "batch served {}", batch);
    }

    #[test]
    fn test_weighted_order_without_contention_for_shares() {
        let mut config = QosConfig::default();
        for class in &mut config.classes {
            class.min_share = 0.0;
        }
        let scheduler: QosScheduler<u32> = QosScheduler::new(config).unwrap();
        for n in 0..20 {
            scheduler.try_enqueue(&header("realtime", 0, 60_000), n, 0).unwrap();
            scheduler.try_enqueue(&header("batch", 0, 60_000), n, 0).unwrap();
        }
        let mut classes = Vec::new();
        for _ in 0..9 {
            match scheduler.try_next(1) {
                Some(Scheduled::Ready(d)) => classes.push(d.class.clone()),
                _ => panic!("expected dispatch"),
            }
        }
        let batch = classes.iter().filter(|c| *c == "batch").count();
        assert_eq!(batch, 1);
    }

    #[test]
    fn test_queue_depth_published() {
        let hooks = Hooks::new();
        let recorder = Arc::new(RecordingHook::default());
        hooks.register(recorder.clone());
        let scheduler: QosScheduler<u32> =
            QosScheduler::with_hooks(QosConfig::default(), hooks).unwrap();
        scheduler.try_enqueue(&header("batch", 0, 60_000), 1, 0).unwrap();
        let _ = scheduler.try_next(1);
        assert_eq!(
            recorder.counters(),
            vec![
                CounterEvent::QueueDepth { class: "batch".into(), depth: 1 },
                CounterEvent::QueueDepth { class: "batch".into(), depth: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn test_next_waits_for_work() {
        let scheduler: Arc<QosScheduler<u32>> = Arc::new(QosScheduler::new(QosConfig::default()).unwrap());
        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                match scheduler.next().await {
                    Scheduled::Ready(d) => d.item,
                    Scheduled::Expired(_) => 0,
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler
            .enqueue(&header("interactive", now_millis(), 10_000), 42)
            .await
            .unwrap();
        assert_eq!(waiter.await.unwrap(), 42);
    }
}

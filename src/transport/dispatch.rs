//! Sending through the transport layer.
//!
//! [`TransportLayer::send`] never blocks the caller: it spawns the delivery
//! and returns a [`SendTicket`] that can be awaited or cancelled. Delivery
//! walks the ranked handles, retrying `TransportUnavailable` with bounded
//! exponential backoff before falling back to the next handle.

use crate::core::{now_millis, CorrelationId, Endpoint, Error, Result, TransportKind};
use crate::transport::overlay::BROADCAST_ADDRESS;
use crate::transport::pool::HandlePool;
use crate::transport::selector::{
    DefaultSelectionPolicy, SelectionContext, SelectionPolicy, TransportHandle,
};
use crate::transport::TransportBackend;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Backoff schedule for `TransportUnavailable`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per handle, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 20,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(31) as i32);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry max_attempts must be at least 1".into()));
        }
        if self.multiplier < 1.0 {
            return Err(Error::Config("retry multiplier must be >= 1.0".into()));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::Config("initial backoff exceeds max backoff".into()));
        }
        Ok(())
    }
}

/// Transport layer settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Pooled links unused for longer are closed
    pub idle_timeout_ms: u64,
    /// Capacity of the inbound frame channel
    pub inbound_capacity: usize,
    /// Capacity of the overlay bus when the node creates its own
    pub overlay_capacity: usize,
    /// Listen address for the TCP backend; none disables it
    pub tcp_listen: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 60_000,
            inbound_capacity: super::INBOUND_CHANNEL_CAPACITY,
            overlay_capacity: 1_024,
            tcp_listen: None,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.inbound_capacity == 0 || self.overlay_capacity == 0 {
            return Err(Error::Config("transport channel capacities must be positive".into()));
        }
        Ok(())
    }
}

/// A signed frame ready to leave.
#[derive(Clone, Debug)]
pub struct OutboundFrame {
    pub frame: Bytes,
    pub correlation_id: CorrelationId,
    pub class: String,
    pub deadline_ms: u64,
}

/// Transport-level acknowledgement: the frame was accepted by a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub correlation_id: CorrelationId,
    pub peer: String,
    pub endpoint: Endpoint,
    /// Attempts across all handles
    pub attempts: u32,
    pub dispatched_ms: u64,
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    dispatched: AtomicBool,
    notify: Notify,
}

impl CancelState {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handle to an in-flight send.
///
/// Awaiting yields the receipt or the terminal failure. Dropping the ticket
/// detaches the send; it still completes in the background.
pub struct SendTicket {
    correlation_id: CorrelationId,
    state: Arc<CancelState>,
    task: JoinHandle<Result<DeliveryReceipt>>,
}

impl SendTicket {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Request cancellation. Returns `true` when no attempt has started,
    /// in which case nothing is sent. After dispatch only remaining retries
    /// are abandoned.
    pub fn cancel(&self) -> bool {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
        !self.state.dispatched.load(Ordering::SeqCst)
    }

    pub fn is_dispatched(&self) -> bool {
        self.state.dispatched.load(Ordering::SeqCst)
    }
}

impl Future for SendTicket {
    type Output = Result<DeliveryReceipt>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let correlation_id = self.correlation_id;
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) if e.is_cancelled() => Poll::Ready(Err(Error::Cancelled {
                correlation_id: Some(correlation_id),
            })),
            Poll::Ready(Err(e)) => Poll::Ready(Err(Error::Internal(format!("send task failed: {}", e)))),
        }
    }
}

impl std::fmt::Debug for SendTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendTicket")
            .field("correlation_id", &self.correlation_id)
            .field("dispatched", &self.is_dispatched())
            .finish()
    }
}

/// Backends, selection policy, link pool and retry schedule.
pub struct TransportLayer {
    backends: HashMap<TransportKind, Arc<dyn TransportBackend>>,
    policy: Arc<dyn SelectionPolicy>,
    pool: HandlePool,
    retry: RetryPolicy,
}

impl TransportLayer {
    pub fn new(config: &TransportConfig, retry: RetryPolicy) -> Self {
        Self {
            backends: HashMap::new(),
            policy: Arc::new(DefaultSelectionPolicy),
            pool: HandlePool::new(config.idle_timeout_ms),
            retry,
        }
    }

    /// Register a backend, replacing any of the same kind.
    pub fn with_backend(mut self, backend: Arc<dyn TransportBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn SelectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn has_backend(&self, kind: TransportKind) -> bool {
        self.backends.contains_key(&kind)
    }

    /// Endpoints this node is reachable at.
    pub fn local_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self
            .backends
            .values()
            .map(|b| Endpoint {
                kind: b.kind(),
                address: b.local_address(),
            })
            .collect();
        endpoints.sort_by(|a, b| a.kind.cmp(&b.kind));
        endpoints
    }

    pub fn local_endpoint(&self, kind: TransportKind) -> Option<Endpoint> {
        self.backends.get(&kind).map(|b| Endpoint {
            kind,
            address: b.local_address(),
        })
    }

    /// Ranked handles for a candidate, restricted to registered backends.
    pub fn select(&self, ctx: &SelectionContext<'_>) -> Result<Vec<TransportHandle>> {
        let handles: Vec<TransportHandle> = self
            .policy
            .rank(ctx)
            .into_iter()
            .filter(|h| self.has_backend(h.kind()))
            .collect();
        if handles.is_empty() {
            return Err(Error::unavailable(format!(
                "no registered transport reaches {}",
                ctx.candidate.agent_id
            )));
        }
        Ok(handles)
    }

    /// Start delivering `frame` over `handles`, best first.
    pub fn send(self: &Arc<Self>, handles: Vec<TransportHandle>, frame: OutboundFrame) -> SendTicket {
        let state = Arc::new(CancelState::default());
        let correlation_id = frame.correlation_id;
        let layer = Arc::clone(self);
        let task_state = Arc::clone(&state);
        let task = tokio::spawn(async move { layer.deliver_by_deadline(handles, frame, task_state).await });
        SendTicket {
            correlation_id,
            state,
            task,
        }
    }

    /// Send to a known endpoint, such as a handshake reply address.
    pub fn send_to(self: &Arc<Self>, peer: &str, endpoint: Endpoint, frame: OutboundFrame) -> SendTicket {
        self.send(vec![TransportHandle::new(peer, endpoint)], frame)
    }

    /// Send to every overlay member.
    pub fn broadcast(self: &Arc<Self>, frame: OutboundFrame) -> SendTicket {
        self.send_to(BROADCAST_ADDRESS, Endpoint::overlay(BROADCAST_ADDRESS), frame)
    }

    /// Close idle pooled links.
    pub fn evict_idle(&self, now_ms: u64) -> usize {
        self.pool.evict_idle(now_ms)
    }

    async fn deliver_by_deadline(
        &self,
        handles: Vec<TransportHandle>,
        frame: OutboundFrame,
        state: Arc<CancelState>,
    ) -> Result<DeliveryReceipt> {
        let budget = Duration::from_millis(frame.deadline_ms.saturating_sub(now_millis()));
        match tokio::time::timeout(budget, self.deliver(&handles, &frame, &state)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded {
                correlation_id: Some(frame.correlation_id),
                class: frame.class.clone(),
                reason: "deadline passed during send".to_string(),
            }),
        }
    }

    async fn deliver(
        &self,
        handles: &[TransportHandle],
        frame: &OutboundFrame,
        state: &CancelState,
    ) -> Result<DeliveryReceipt> {
        let correlation_id = frame.correlation_id;
        let mut attempts = 0u32;
        let mut last_error = None;

        for (rank, handle) in handles.iter().enumerate() {
            if rank > 0 {
                info!(
                    correlation_id = %correlation_id,
                    endpoint = %handle.endpoint,
                    "falling back to next transport"
                );
            }
            for attempt in 0..self.retry.max_attempts {
                if state.is_cancelled() {
                    return Err(Error::Cancelled {
                        correlation_id: Some(correlation_id),
                    });
                }
                state.dispatched.store(true, Ordering::SeqCst);
                attempts += 1;
                match self.dispatch_once(handle, &frame.frame).await {
                    Ok(()) => {
                        debug!(correlation_id = %correlation_id, endpoint = %handle.endpoint, attempts, "frame dispatched");
                        return Ok(DeliveryReceipt {
                            correlation_id,
                            peer: handle.peer.clone(),
                            endpoint: handle.endpoint.clone(),
                            attempts,
                            dispatched_ms: now_millis(),
                        });
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(correlation_id = %correlation_id, endpoint = %handle.endpoint, attempt, error = %e, "transport unavailable");
                        self.pool.remove(&handle.endpoint);
                        last_error = Some(e);
                        if attempt + 1 < self.retry.max_attempts {
                            tokio::select! {
                                _ = tokio::time::sleep(self.retry.backoff(attempt)) => {}
                                _ = state.notify.notified() => {}
                            }
                        }
                    }
                    Err(e) => return Err(e.with_correlation(correlation_id)),
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::unavailable("no transport handle to try"))
            .with_correlation(correlation_id))
    }

    async fn dispatch_once(&self, handle: &TransportHandle, frame: &Bytes) -> Result<()> {
        let backend = self.backends.get(&handle.kind()).ok_or_else(|| {
            Error::unavailable(format!("no {} backend registered", handle.kind()))
        })?;
        let link = self
            .pool
            .get_or_connect(backend.as_ref(), &handle.endpoint, now_millis())
            .await?;
        link.send_frame(frame.clone()).await
    }
}

impl std::fmt::Debug for TransportLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLayer")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .field("pooled", &self.pool.len())
            .field("retry", &self.retry)
            .finish()
    }
}

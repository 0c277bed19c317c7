//! Delivery log and intent subscriptions.
//!
//! Verified inbound envelopes are appended to a bounded log and fanned out
//! to live subscribers. A subscription can resume after a correlation id:
//! it first replays the retained log past that point, then follows live
//! traffic. The backlog is taken and the live receiver attached under the
//! same lock, so nothing falls between the two.

use crate::core::CorrelationId;
use crate::envelope::Envelope;
use crate::intent::IntentPattern;
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::warn;

/// Bounded log of delivered envelopes.
pub struct DeliveryLog {
    entries: Mutex<VecDeque<Arc<Envelope>>>,
    capacity: usize,
    live: broadcast::Sender<Arc<Envelope>>,
}

impl DeliveryLog {
    pub fn new(capacity: usize, subscriber_buffer: usize) -> Self {
        let (live, _) = broadcast::channel(subscriber_buffer.max(1));
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            live,
        }
    }

    /// Append and publish.
    pub fn push(&self, envelope: Arc<Envelope>) {
        let mut entries = self.lock();
        entries.push_back(envelope.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        // No live subscribers is fine; the log keeps it.
        let _ = self.live.send(envelope);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Follow `pattern` from now on.
    pub fn subscribe(self: &Arc<Self>, pattern: IntentPattern) -> Subscription {
        let rx = self.live.subscribe();
        Subscription {
            pattern,
            log: Arc::clone(self),
            backlog: VecDeque::new(),
            rx,
            last: None,
        }
    }

    /// Follow `pattern`, first replaying retained entries after
    /// `resume_after`. An id no longer retained replays the whole log.
    pub fn subscribe_from(
        self: &Arc<Self>,
        pattern: IntentPattern,
        resume_after: Option<CorrelationId>,
    ) -> Subscription {
        let (backlog, rx) = self.backlog_after(&pattern, resume_after);
        Subscription {
            pattern,
            log: Arc::clone(self),
            backlog,
            rx,
            last: resume_after,
        }
    }

    fn backlog_after(
        &self,
        pattern: &IntentPattern,
        after: Option<CorrelationId>,
    ) -> (VecDeque<Arc<Envelope>>, broadcast::Receiver<Arc<Envelope>>) {
        let entries = self.lock();
        let start = match after {
            None => 0,
            Some(id) => match entries.iter().rposition(|e| e.correlation_id() == id) {
                Some(pos) => pos + 1,
                None => {
                    warn!(correlation_id = %id, "resume point no longer retained, replaying log");
                    0
                }
            },
        };
        let backlog = entries
            .iter()
            .skip(start)
            .filter(|e| e.header.intent.pattern().matches(pattern))
            .cloned()
            .collect();
        (backlog, self.live.subscribe())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<Envelope>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for DeliveryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryLog")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Stream of delivered envelopes matching one intent pattern.
pub struct Subscription {
    pattern: IntentPattern,
    log: Arc<DeliveryLog>,
    backlog: VecDeque<Arc<Envelope>>,
    rx: broadcast::Receiver<Arc<Envelope>>,
    last: Option<CorrelationId>,
}

impl Subscription {
    pub fn pattern(&self) -> &IntentPattern {
        &self.pattern
    }

    /// Correlation id of the last envelope returned; pass it to
    /// `subscribe_from` to restart without gaps.
    pub fn position(&self) -> Option<CorrelationId> {
        self.last
    }

    /// Next matching envelope; `None` once the node is gone.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        loop {
            if let Some(envelope) = self.backlog.pop_front() {
                self.last = Some(envelope.correlation_id());
                return Some(envelope);
            }
            match self.rx.recv().await {
                Ok(envelope) => {
                    if envelope.header.intent.pattern().matches(&self.pattern) {
                        self.last = Some(envelope.correlation_id());
                        return Some(envelope);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(pattern = %self.pattern, missed, "subscriber lagged, catching up from log");
                    let (backlog, rx) = self.log.backlog_after(&self.pattern, self.last);
                    self.backlog = backlog;
                    self.rx = rx;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt into a stream that ends when the node goes away.
    pub fn into_stream(self) -> impl Stream<Item = Arc<Envelope>> {
        stream::unfold(self, |mut sub| async move {
            let envelope = sub.recv().await?;
            Some((envelope, sub))
        })
    }

    /// Next matching envelope if one is ready.
    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        loop {
            if let Some(envelope) = self.backlog.pop_front() {
                self.last = Some(envelope.correlation_id());
                return Some(envelope);
            }
            match self.rx.try_recv() {
                Ok(envelope) => {
                    if envelope.header.intent.pattern().matches(&self.pattern) {
                        self.last = Some(envelope.correlation_id());
                        return Some(envelope);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    let (backlog, rx) = self.log.backlog_after(&self.pattern, self.last);
                    self.backlog = backlog;
                    self.rx = rx;
                }
                Err(_) => return None,
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern.to_string())
            .field("backlog", &self.backlog.len())
            .finish()
    }
}

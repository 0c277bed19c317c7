//! Per-peer link pooling with idle eviction.

use crate::core::{Endpoint, Result};
use crate::transport::{Link, TransportBackend};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

struct Pooled {
    link: Arc<dyn Link>,
    last_used_ms: AtomicU64,
}

/// Open links keyed by endpoint.
#[derive(Default)]
pub struct HandlePool {
    links: DashMap<Endpoint, Pooled>,
    idle_timeout_ms: u64,
}

impl HandlePool {
    pub fn new(idle_timeout_ms: u64) -> Self {
        Self {
            links: DashMap::new(),
            idle_timeout_ms,
        }
    }

    /// Pooled link to `endpoint`, connecting through `backend` on a miss or
    /// when the pooled link has closed.
    pub async fn get_or_connect(
        &self,
        backend: &dyn TransportBackend,
        endpoint: &Endpoint,
        now_ms: u64,
    ) -> Result<Arc<dyn Link>> {
        let pooled = self.links.get(endpoint).and_then(|entry| {
            if entry.link.is_closed() {
                None
            } else {
                entry.last_used_ms.store(now_ms, Ordering::Relaxed);
                Some(entry.link.clone())
            }
        });
        if let Some(link) = pooled {
            return Ok(link);
        }

        let link = backend.connect(&endpoint.address).await?;
        debug!(endpoint = %endpoint, "link opened");
        self.links.insert(
            endpoint.clone(),
            Pooled {
                link: link.clone(),
                last_used_ms: AtomicU64::new(now_ms),
            },
        );
        Ok(link)
    }

    /// Drop the pooled link to `endpoint`.
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        self.links.remove(endpoint).is_some()
    }

    /// Drop links idle for longer than the idle timeout, and closed ones.
    pub fn evict_idle(&self, now_ms: u64) -> usize {
        let before = self.links.len();
        let idle = self.idle_timeout_ms;
        self.links.retain(|endpoint, pooled| {
            let last = pooled.last_used_ms.load(Ordering::Relaxed);
            let keep = !pooled.link.is_closed() && now_ms.saturating_sub(last) <= idle;
            if !keep {
                debug!(endpoint = %endpoint, "link evicted");
            }
            keep
        });
        before - self.links.len()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

//! Replay protection.
//!
//! A [`SequenceWindow`] accepts each sequence number at most once while
//! tolerating reordering within [`WINDOW_SIZE`]. A [`CorrelationCache`]
//! rejects duplicate exchanges and forgets them after a TTL.

use crate::core::{CorrelationId, SessionId};
use std::collections::{HashMap, VecDeque};

/// Width of the sliding acceptance window.
pub const WINDOW_SIZE: u64 = 64;

/// Sliding window over a monotonically increasing sequence space.
#[derive(Clone, Debug, Default)]
pub struct SequenceWindow {
    highest: u64,
    /// Bit `i` set means `highest - i` was seen.
    seen: u64,
}

impl SequenceWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `sequence`. Returns `false` for a replay or a sequence that
    /// has fallen behind the window. Sequence 0 is never valid.
    pub fn accept(&mut self, sequence: u64) -> bool {
        if sequence == 0 {
            return false;
        }
        if sequence > self.highest {
            let shift = sequence - self.highest;
            self.seen = if shift >= WINDOW_SIZE { 0 } else { self.seen << shift };
            self.seen |= 1;
            self.highest = sequence;
            return true;
        }
        let offset = self.highest - sequence;
        if offset >= WINDOW_SIZE {
            return false;
        }
        let bit = 1u64 << offset;
        if self.seen & bit != 0 {
            return false;
        }
        self.seen |= bit;
        true
    }

    /// Highest sequence accepted so far.
    pub fn highest(&self) -> u64 {
        self.highest
    }
}

/// Namespace a correlation id is unique within.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ReplayScope {
    Session(SessionId),
    /// Session-less traffic, scoped by signer DID.
    Signer(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    scope: ReplayScope,
    message_type: u8,
    correlation_id: CorrelationId,
}

/// Bounded, TTL-based cache of seen (scope, message type, correlation id).
#[derive(Debug)]
pub struct CorrelationCache {
    ttl_ms: u64,
    capacity: usize,
    entries: HashMap<CacheKey, u64>,
    order: VecDeque<(u64, CacheKey)>,
}

impl CorrelationCache {
    pub fn new(ttl_ms: u64, capacity: usize) -> Self {
        Self {
            ttl_ms,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record an exchange. Returns `false` if it is still cached.
    pub fn insert(
        &mut self,
        scope: ReplayScope,
        message_type: u8,
        correlation_id: CorrelationId,
        now_ms: u64,
    ) -> bool {
        self.purge(now_ms);
        let key = CacheKey {
            scope,
            message_type,
            correlation_id,
        };
        if self.entries.contains_key(&key) {
            return false;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some((_, oldest)) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        let expires = now_ms.saturating_add(self.ttl_ms);
        self.entries.insert(key.clone(), expires);
        self.order.push_back((expires, key));
        true
    }

    /// Drop entries whose TTL has passed.
    pub fn purge(&mut self, now_ms: u64) {
        while let Some((expires, _)) = self.order.front() {
            if *expires > now_ms {
                break;
            }
            if let Some((_, key)) = self.order.pop_front() {
                self.entries.remove(&key);
            }
        }
    }

    /// Forget everything recorded under `scope`.
    pub fn forget_scope(&mut self, scope: &ReplayScope) {
        self.entries.retain(|key, _| &key.scope != scope);
        self.order.retain(|(_, key)| &key.scope != scope);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Routing decision cache.
//!
//! Keys are blake3 digests of the request text plus the context fields that
//! can change a decision. Entries expire after a TTL; expired entries are
//! dropped lazily on lookup and in bulk by [`DecisionCache::sweep`]. When
//! the cache is full the oldest entry is evicted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::RoutingDecision;
use crate::classifier::RequestContext;
use crate::scheduler::SharedClock;

/// Deterministic cache key for a request.
///
/// Only `fields` are read from the context, in sorted order, so unrelated
/// context never splits the cache.
pub fn cache_key(text: &str, context: &RequestContext, fields: &[String]) -> String {
    let mut sorted: Vec<&String> = fields.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = blake3::Hasher::new();
    hasher.update(text.as_bytes());
    for field in sorted {
        if let Some(value) = context.get(field.as_str()) {
            hasher.update(b"\0");
            hasher.update(field.as_bytes());
            hasher.update(b"=");
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            hasher.update(rendered.as_bytes());
        }
    }
    hasher.finalize().to_hex().to_string()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    decision: RoutingDecision,
    inserted_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

/// TTL-bounded, size-bounded decision cache
pub struct DecisionCache {
    ttl: Duration,
    max_entries: usize,
    clock: SharedClock,
    inner: Mutex<CacheInner>,
}

impl DecisionCache {
    pub fn new(ttl: Duration, max_entries: usize, clock: SharedClock) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            clock,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Fresh decision for `key`; an expired entry is removed and misses.
    pub fn get(&self, key: &str) -> Option<RoutingDecision> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match inner.entries.get(key) {
            Some(entry) => now.saturating_duration_since(entry.inserted_at) >= self.ttl,
            None => return None,
        };
        if expired {
            inner.entries.remove(key);
            return None;
        }
        inner.entries.get(key).map(|e| e.decision.clone())
    }

    /// Store a decision. Returns how many entries were evicted to make room.
    pub fn insert(&self, key: String, decision: RoutingDecision) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut evicted = 0;

        if !inner.entries.contains_key(&key) {
            while inner.entries.len() >= self.max_entries {
                let oldest = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| (e.inserted_at, e.seq))
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        inner.entries.remove(&k);
                        evicted += 1;
                    }
                    None => break,
                }
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key,
            CacheEntry {
                decision,
                inserted_at: now,
                seq,
            },
        );
        evicted
    }

    /// Remove every expired entry; returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.entries.len();
        let ttl = self.ttl;
        inner
            .entries
            .retain(|_, e| now.saturating_duration_since(e.inserted_at) < ttl);
        before - inner.entries.len()
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

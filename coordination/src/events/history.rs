//! Bounded in-memory event history
//!
//! Keeps the most recent events so operators can inspect what the
//! coordination layer did without subscribing ahead of time.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::CoordinationEvent;

/// Ring buffer of recent events
pub struct EventHistory {
    capacity: usize,
    events: Mutex<VecDeque<CoordinationEvent>>,
}

/// Counts per event type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventStats {
    pub total: usize,
    pub by_type: HashMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl EventHistory {
    /// Create a history holding at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Append an event, dropping the oldest when full
    pub fn record(&self, event: CoordinationEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Most recent events, newest last
    pub fn recent(&self, limit: usize) -> Vec<CoordinationEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    /// Recent events of one type, newest last
    pub fn of_type(&self, event_type: &str, limit: usize) -> Vec<CoordinationEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let matching: Vec<_> = events
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    /// Events for a single task
    pub fn for_task(&self, task_id: &str) -> Vec<CoordinationEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events
            .iter()
            .filter(|e| e.task_id() == Some(task_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> EventStats {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats = EventStats {
            total: events.len(),
            ..Default::default()
        };
        for event in events.iter() {
            *stats.by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
        }
        stats.oldest = events.front().map(|e| e.timestamp());
        stats.newest = events.back().map(|e| e.timestamp());
        stats
    }
}

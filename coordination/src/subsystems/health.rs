//! Per-subsystem circuit breaker.
//!
//! Tracks consecutive failures per subsystem name. When failures reach the
//! threshold the circuit *opens* and calls are refused without being issued.
//! After the cooldown the circuit is *half-open*: exactly one probe call is
//! let through, and its outcome closes or re-opens the circuit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{SubsystemError, SubsystemResult};
use crate::scheduler::{SharedClock, SystemClock};

/// Circuit breaker state for a single subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy, calls allowed.
    Closed,
    /// Tripped, calls refused until the cooldown expires.
    Open,
    /// Cooldown expired, one probe allowed.
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerEntry {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Point-in-time view of one subsystem's breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Circuit breakers for every subsystem the orchestrator has called
pub struct SubsystemHealth {
    entries: Mutex<HashMap<String, BreakerEntry>>,
    failure_threshold: u32,
    cooldown: Duration,
    clock: SharedClock,
}

impl SubsystemHealth {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self::with_clock(failure_threshold, cooldown, std::sync::Arc::new(SystemClock))
    }

    pub fn with_clock(failure_threshold: u32, cooldown: Duration, clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            clock,
        }
    }

    fn state_of(&self, entry: &BreakerEntry) -> CircuitState {
        if entry.consecutive_failures < self.failure_threshold {
            return CircuitState::Closed;
        }
        let elapsed = entry
            .last_failure
            .map(|t| self.clock.now().saturating_duration_since(t))
            .unwrap_or(self.cooldown);
        if elapsed >= self.cooldown {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// Current state of the circuit for `name`.
    pub fn state(&self, name: &str) -> CircuitState {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(name)
            .map(|e| self.state_of(e))
            .unwrap_or(CircuitState::Closed)
    }

    /// Gate a call. Refuses while open, and while a half-open probe is
    /// already outstanding.
    pub fn check(&self, name: &str) -> SubsystemResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(name) else {
            return Ok(());
        };
        match self.state_of(entry) {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(SubsystemError::Unavailable(format!(
                "{} (circuit open)",
                name
            ))),
            CircuitState::HalfOpen if entry.probe_in_flight => Err(SubsystemError::Unavailable(
                format!("{} (probe in flight)", name),
            )),
            CircuitState::HalfOpen => {
                entry.probe_in_flight = true;
                info!(subsystem = name, "Circuit half-open, allowing probe");
                Ok(())
            }
        }
    }

    /// Record a success, closing the circuit.
    pub fn record_success(&self, name: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.remove(name) {
            if entry.consecutive_failures >= self.failure_threshold {
                info!(subsystem = name, "Circuit closed");
            }
        }
    }

    /// Record a failure; may open the circuit.
    pub fn record_failure(&self, name: &str) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(name.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.last_failure = Some(now);
        entry.probe_in_flight = false;
        if entry.consecutive_failures == self.failure_threshold {
            warn!(
                subsystem = name,
                failures = entry.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit opened"
            );
        }
    }

    /// Consecutive failures recorded for `name`.
    pub fn failure_count(&self, name: &str) -> u32 {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(name).map(|e| e.consecutive_failures).unwrap_or(0)
    }

    /// Breakers with at least one recorded failure, sorted by name
    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut snapshot: Vec<_> = entries
            .iter()
            .map(|(name, entry)| HealthSnapshot {
                name: name.clone(),
                state: self.state_of(entry),
                consecutive_failures: entry.consecutive_failures,
            })
            .collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }
}

impl Default for SubsystemHealth {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

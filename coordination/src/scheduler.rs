//! Clock and periodic-task scheduling.
//!
//! Time-dependent components (the routing cache TTL, the orchestrator's
//! queue drain) never read the wall clock or start timers themselves. They
//! receive a [`Clock`] for "what time is it" and a [`Scheduler`] for "run
//! this every N". Tests swap in [`ManualClock`] and a paused tokio runtime.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Shared reference to a clock
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(|e| e.into_inner());
        self.origin + offset
    }
}

/// Owns the background loops of a service and stops them together.
pub struct Scheduler {
    shutdown: CancellationToken,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Token cancelled when the scheduler shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run `tick` every `period` until shutdown.
    ///
    /// The first invocation happens one full period after spawning. Missed
    /// ticks are skipped rather than replayed in a burst.
    pub fn spawn_periodic<F, Fut>(&self, name: &str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let loop_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!(task = %loop_name, "periodic task stopped");
        });

        info!(task = name, period_ms = period.as_millis() as u64, "periodic task started");
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_string(), handle));
    }

    /// Number of loops currently owned.
    pub fn task_count(&self) -> usize {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Cancel every loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                tracing::warn!(task = %name, error = %e, "periodic task ended abnormally");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_ticks_until_shutdown() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler.spawn_periodic("counter", Duration::from_millis(100), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(scheduler.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(350)).await;
        scheduler.shutdown().await;
        let ticks = count.load(Ordering::SeqCst);
        assert_eq!(ticks, 3);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), ticks);
        assert_eq!(scheduler.task_count(), 0);
    }
}

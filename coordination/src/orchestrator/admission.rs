//! Concurrency limit with a FIFO overflow queue.
//!
//! A task either gets a [`Permit`] immediately or waits in the queue. The
//! queue is only drained by [`Admission::drain`], which the orchestrator
//! runs on a fixed interval. Dropping a permit frees its slot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

use super::task::TaskId;
use super::{OrchestrationError, OrchestrationResult};

#[derive(Default)]
struct AdmissionState {
    running: usize,
    queue: VecDeque<(TaskId, oneshot::Sender<Permit>)>,
}

pub struct Admission {
    max_running: usize,
    max_queue: usize,
    state: Mutex<AdmissionState>,
    peak: AtomicUsize,
}

/// A running slot; released on drop
pub struct Permit {
    admission: Arc<Admission>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut state = self
            .admission
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        state.running = state.running.saturating_sub(1);
    }
}

/// Result of asking for a slot
pub enum Ticket {
    Ready(Permit),
    /// Resolves with a permit once the queue drains this far
    Queued(oneshot::Receiver<Permit>),
}

impl Admission {
    pub fn new(max_running: usize, max_queue: usize) -> Arc<Self> {
        Arc::new(Self {
            max_running: max_running.max(1),
            max_queue,
            state: Mutex::new(AdmissionState::default()),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn try_admit(self: &Arc<Self>, task_id: &str) -> OrchestrationResult<Ticket> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.running < self.max_running && state.queue.is_empty() {
            state.running += 1;
            self.peak.fetch_max(state.running, Ordering::Relaxed);
            return Ok(Ticket::Ready(Permit {
                admission: self.clone(),
            }));
        }
        if state.queue.len() >= self.max_queue {
            return Err(OrchestrationError::QueueFull {
                capacity: self.max_queue,
            });
        }
        let (tx, rx) = oneshot::channel();
        state.queue.push_back((task_id.to_string(), tx));
        debug!(task_id, queued = state.queue.len(), "Task queued");
        Ok(Ticket::Queued(rx))
    }

    /// Hand free slots to queued tasks in FIFO order. Returns how many
    /// were admitted.
    pub fn drain(self: &Arc<Self>) -> usize {
        let mut undelivered = Vec::new();
        let mut admitted = 0;
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            while state.running < self.max_running {
                let Some((task_id, tx)) = state.queue.pop_front() else {
                    break;
                };
                state.running += 1;
                self.peak.fetch_max(state.running, Ordering::Relaxed);
                let permit = Permit {
                    admission: self.clone(),
                };
                match tx.send(permit) {
                    Ok(()) => {
                        admitted += 1;
                        debug!(task_id = %task_id, "Queued task admitted");
                    }
                    // Waiter is gone; its permit is released below, outside the lock.
                    Err(permit) => undelivered.push(permit),
                }
            }
        }
        drop(undelivered);
        admitted
    }

    /// Remove a queued task; false if it was not queued
    pub fn cancel_queued(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.queue.len();
        state.queue.retain(|(id, _)| id != task_id);
        state.queue.len() != before
    }

    pub fn running(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).running
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).queue.len()
    }

    /// Highest number of tasks ever running at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overflow_queues_then_drains() {
        let admission = Admission::new(1, 2);
        let first = match admission.try_admit("a").unwrap() {
            Ticket::Ready(permit) => permit,
            Ticket::Queued(_) => panic!("first task should run"),
        };
        let Ticket::Queued(rx) = admission.try_admit("b").unwrap() else {
            panic!("second task should queue");
        };
        assert_eq!(admission.queued(), 1);

        // No free slot yet
        assert_eq!(admission.drain(), 0);
        drop(first);
        assert_eq!(admission.running(), 0);
        assert_eq!(admission.drain(), 1);
        let _permit = rx.await.unwrap();
        assert_eq!(admission.running(), 1);
        assert_eq!(admission.peak(), 1);
    }

    #[test]
    fn test_queue_full() {
        let admission = Admission::new(1, 1);
        let _running = admission.try_admit("a").unwrap();
        let _queued = admission.try_admit("b").unwrap();
        assert!(matches!(
            admission.try_admit("c"),
            Err(OrchestrationError::QueueFull { capacity: 1 })
        ));
    }

    #[test]
    fn test_abandoned_waiter_frees_slot() {
        let admission = Admission::new(1, 4);
        let running = admission.try_admit("a").unwrap();
        let queued = admission.try_admit("b").unwrap();
        drop(queued);
        drop(running);
        assert_eq!(admission.drain(), 0);
        assert_eq!(admission.running(), 0);

        let _c = admission.try_admit("c").unwrap();
        assert!(!admission.cancel_queued("missing"));
    }
}

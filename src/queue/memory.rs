//! In-memory queue backend.
//!
//! Mirrors the pending/processing two-list shape of a Redis-backed queue:
//! `reserve` moves a message from the pending list to the processing set,
//! `ack` deletes it, `requeue` moves it back to the tail. Messages stuck in
//! processing (a consumer died mid-lease) are returned to pending by
//! [`MemoryQueue::requeue_stuck`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::warn;

use super::{JobMessage, JobQueue, QueueError, Reservation};

struct ProcessingEntry {
    /// Distinguishes byte-identical messages reserved concurrently, so a
    /// settle removes exactly its own entry.
    token: u64,
    raw: String,
    since: Instant,
}

#[derive(Default)]
struct State {
    pending: VecDeque<String>,
    processing: Vec<ProcessingEntry>,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    next_token: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        MemoryQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                next_token: AtomicU64::new(0),
            }),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn processing_len(&self) -> usize {
        self.shared.lock().processing.len()
    }

    /// Return messages that have sat in processing longer than `older_than`
    /// to the pending list. Returns how many were moved.
    pub fn requeue_stuck(&self, older_than: Duration) -> usize {
        let mut state = self.shared.lock();
        let mut moved = 0;
        let entries = std::mem::take(&mut state.processing);
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.since.elapsed() >= older_than {
                state.pending.push_back(entry.raw);
                moved += 1;
            } else {
                kept.push(entry);
            }
        }
        state.processing = kept;
        if moved > 0 {
            warn!(count = moved, "returned stuck messages to pending");
            self.shared.notify.notify_waiters();
        }
        moved
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, message: JobMessage) -> Result<(), QueueError> {
        let raw =
            serde_json::to_string(&message).map_err(|e| QueueError::Backend(e.to_string()))?;
        self.shared.lock().pending.push_back(raw);
        self.shared.notify.notify_one();
        Ok(())
    }

    async fn reserve(&self, timeout: Duration) -> Result<Box<dyn Reservation>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Arm the wakeup before checking so an enqueue between the check
            // and the await is not lost.
            let notified = self.shared.notify.notified();

            let popped = self.shared.lock().pending.pop_front();
            if let Some(raw) = popped {
                let message: JobMessage = match serde_json::from_str(&raw) {
                    Ok(m) => m,
                    Err(e) => {
                        // Drop the message rather than poison the queue.
                        warn!(error = %e, "discarding malformed queue message");
                        return Err(QueueError::Malformed(e.to_string()));
                    }
                };
                let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
                self.shared.lock().processing.push(ProcessingEntry {
                    token,
                    raw,
                    since: Instant::now(),
                });
                return Ok(Box::new(MemoryReservation {
                    shared: Arc::clone(&self.shared),
                    token,
                    message,
                    settled: false,
                }));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(QueueError::Empty);
            }
            tokio::select! {
                _ = notified => {}
                _ = sleep(remaining) => return Err(QueueError::Empty),
            }
        }
    }
}

struct MemoryReservation {
    shared: Arc<Shared>,
    token: u64,
    message: JobMessage,
    settled: bool,
}

impl MemoryReservation {
    /// Remove this reservation's entry from processing. Returns whether it
    /// was still there (false when the stale sweep already took it).
    fn remove_processing(&self) -> bool {
        let mut state = self.shared.lock();
        let before = state.processing.len();
        state.processing.retain(|e| e.token != self.token);
        state.processing.len() < before
    }
}

#[async_trait]
impl Reservation for MemoryReservation {
    fn message(&self) -> &JobMessage {
        &self.message
    }

    async fn ack(&mut self) -> Result<(), QueueError> {
        if self.settled {
            return Ok(());
        }
        self.settled = true;
        self.remove_processing();
        Ok(())
    }

    async fn requeue(&mut self, run_at: Option<DateTime<Utc>>) -> Result<(), QueueError> {
        if self.settled {
            return Ok(());
        }
        self.settled = true;
        if !self.remove_processing() {
            return Ok(());
        }
        let mut message = self.message.clone();
        if let Some(run_at) = run_at {
            message.run_at = run_at;
        }
        let raw =
            serde_json::to_string(&message).map_err(|e| QueueError::Backend(e.to_string()))?;
        self.shared.lock().pending.push_back(raw);
        self.shared.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;
    use chrono::Duration as ChronoDuration;

    fn message(run_at: DateTime<Utc>) -> JobMessage {
        JobMessage {
            job_id: JobId::new(),
            run_at,
        }
    }

    #[tokio::test]
    async fn reserve_is_fifo() {
        let queue = MemoryQueue::new();
        let first = message(Utc::now());
        let second = message(Utc::now());
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();

        let mut r1 = queue.reserve(Duration::from_millis(10)).await.unwrap();
        assert_eq!(r1.message().job_id, first.job_id);
        r1.ack().await.unwrap();

        let mut r2 = queue.reserve(Duration::from_millis(10)).await.unwrap();
        assert_eq!(r2.message().job_id, second.job_id);
        r2.ack().await.unwrap();
    }

    #[tokio::test]
    async fn reserve_times_out_on_empty_queue() {
        let queue = MemoryQueue::new();
        match queue.reserve(Duration::from_millis(5)).await {
            Err(QueueError::Empty) => {}
            Err(e) => panic!("expected Empty, got {e}"),
            Ok(_) => panic!("expected Empty, got a reservation"),
        }
    }

    #[tokio::test]
    async fn requeue_after_ack_is_a_no_op() {
        let queue = MemoryQueue::new();
        queue.enqueue(message(Utc::now())).await.unwrap();

        let mut r = queue.reserve(Duration::from_millis(10)).await.unwrap();
        r.ack().await.unwrap();
        r.ack().await.unwrap();
        r.requeue(None).await.unwrap();

        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.processing_len(), 0);
    }

    #[tokio::test]
    async fn requeue_defers_run_at() {
        let queue = MemoryQueue::new();
        let original = message(Utc::now());
        queue.enqueue(original.clone()).await.unwrap();

        let later = Utc::now() + ChronoDuration::minutes(5);
        let mut r = queue.reserve(Duration::from_millis(10)).await.unwrap();
        r.requeue(Some(later)).await.unwrap();

        let r2 = queue.reserve(Duration::from_millis(10)).await.unwrap();
        assert_eq!(r2.message().job_id, original.job_id);
        assert_eq!(r2.message().run_at, later);
    }

    #[tokio::test]
    async fn identical_messages_settle_independently() {
        let queue = MemoryQueue::new();
        let duplicate = message(Utc::now());
        queue.enqueue(duplicate.clone()).await.unwrap();
        queue.enqueue(duplicate.clone()).await.unwrap();

        let mut r1 = queue.reserve(Duration::from_millis(10)).await.unwrap();
        let mut r2 = queue.reserve(Duration::from_millis(10)).await.unwrap();
        assert_eq!(queue.processing_len(), 2);

        // Acking one lease must not take the other's processing entry.
        r1.ack().await.unwrap();
        assert_eq!(queue.processing_len(), 1);

        r2.requeue(None).await.unwrap();
        assert_eq!(queue.processing_len(), 0);
        assert_eq!(queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn stuck_messages_return_to_pending() {
        let queue = MemoryQueue::new();
        queue.enqueue(message(Utc::now())).await.unwrap();

        let r = queue.reserve(Duration::from_millis(10)).await.unwrap();
        assert_eq!(queue.processing_len(), 1);
        // Leak the reservation: simulates a consumer dying mid-lease.
        std::mem::forget(r);

        assert_eq!(queue.requeue_stuck(Duration::ZERO), 1);
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.processing_len(), 0);
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_leases() {
        let queue = MemoryQueue::new();
        queue.enqueue(message(Utc::now())).await.unwrap();
        queue.enqueue(message(Utc::now())).await.unwrap();

        let _r1 = queue.reserve(Duration::from_millis(10)).await.unwrap();
        let _r2 = queue.reserve(Duration::from_millis(10)).await.unwrap();

        assert_eq!(queue.requeue_stuck(Duration::from_secs(60)), 0);
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.processing_len(), 2);
    }
}

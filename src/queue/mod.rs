//! Job queue port and wire format.
//!
//! The queue carries references only: a job id plus the earliest time it
//! should run. All job state lives in storage, so a lost message is
//! recoverable and a duplicate message is harmless (the claim arbitrates).

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::JobId;

/// What travels through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    /// RFC 3339; consumers that dequeue early re-shelve the message.
    pub run_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no message available")]
    Empty,
    #[error("malformed queue message: {0}")]
    Malformed(String),
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// A message leased to one consumer, pending acknowledgement.
///
/// Dropping a reservation without calling either method leaves the message
/// in the processing set; the stale sweep eventually returns it to pending.
#[async_trait]
pub trait Reservation: Send {
    fn message(&self) -> &JobMessage;

    /// Remove the message for good. Idempotent.
    async fn ack(&mut self) -> Result<(), QueueError>;

    /// Put the message back at the tail, optionally with a deferred
    /// `run_at`. Idempotent, and a no-op after `ack`.
    async fn requeue(&mut self, run_at: Option<DateTime<Utc>>) -> Result<(), QueueError>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, message: JobMessage) -> Result<(), QueueError>;

    /// Block up to `timeout` for a message, moving it to the processing
    /// set. Returns [`QueueError::Empty`] on timeout.
    async fn reserve(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Box<dyn Reservation>, QueueError>;
}

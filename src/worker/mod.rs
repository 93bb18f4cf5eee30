//! Job execution.
//!
//! Each worker runs a blocking reserve loop against the queue. A reserved
//! message only references a job; the storage row is the source of truth,
//! and the atomic claim decides which worker actually runs an attempt.
//! Delivery is at-least-once: every failure path either requeues the
//! message or leaves the job in a state the stale sweep can recover.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::domain::{DeliveryLog, Job, JobStatus, Link};
use crate::queue::{JobQueue, QueueError, Reservation};
use crate::reaction::{CompositeReactionExecutor, ReactionError, ReactionResult};
use crate::store::{AreaRepository, DeliveryLogRepository, JobRepository, StoreError};
use crate::types::{AreaId, JsonMap};

/// What one pass over the queue did; `run` uses it to pace the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A job was claimed and finalized.
    Processed,
    /// Nothing was available within the reserve timeout.
    Empty,
    /// The head message is not due yet for this long.
    Deferred(Duration),
    /// The queue backend failed; back off before retrying.
    Backoff,
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    jobs: Arc<dyn JobRepository>,
    areas: Arc<dyn AreaRepository>,
    delivery_logs: Arc<dyn DeliveryLogRepository>,
    reactions: Arc<CompositeReactionExecutor>,
    clock: SharedClock,
    worker_id: String,
    reserve_timeout: Duration,
    backoff: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        jobs: Arc<dyn JobRepository>,
        areas: Arc<dyn AreaRepository>,
        delivery_logs: Arc<dyn DeliveryLogRepository>,
        reactions: Arc<CompositeReactionExecutor>,
        clock: SharedClock,
        worker_id: impl Into<String>,
        reserve_timeout: Duration,
        backoff: Duration,
    ) -> Self {
        Worker {
            queue,
            jobs,
            areas,
            delivery_logs,
            reactions,
            clock,
            worker_id: worker_id.into(),
            reserve_timeout,
            backoff,
        }
    }

    /// Reserve-execute loop until cancellation. In-flight work finishes
    /// before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(worker = %self.worker_id, "worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.poll_once() => match outcome {
                    PollOutcome::Processed | PollOutcome::Empty => {}
                    PollOutcome::Deferred(delay) => {
                        let pause = delay.min(self.reserve_timeout);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                    PollOutcome::Backoff => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.backoff) => {}
                        }
                    }
                },
            }
        }
        info!(worker = %self.worker_id, "worker stopped");
    }

    /// One reserve-and-process pass.
    pub async fn poll_once(&self) -> PollOutcome {
        let mut reservation = match self.queue.reserve(self.reserve_timeout).await {
            Ok(reservation) => reservation,
            Err(QueueError::Empty) => return PollOutcome::Empty,
            Err(QueueError::Malformed(e)) => {
                // Already discarded by the queue; nothing to recover.
                warn!(worker = %self.worker_id, error = %e, "dropped malformed message");
                return PollOutcome::Processed;
            }
            Err(e) => {
                warn!(worker = %self.worker_id, error = %e, "queue reserve failed");
                return PollOutcome::Backoff;
            }
        };

        let message = reservation.message().clone();
        let now = self.clock.now();

        // Not due yet: put it back untouched and let the loop pause.
        if message.run_at > now {
            let remaining = (message.run_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if let Err(e) = reservation.requeue(Some(message.run_at)).await {
                warn!(worker = %self.worker_id, error = %e, "requeue of deferred job failed");
                return PollOutcome::Backoff;
            }
            return PollOutcome::Deferred(remaining);
        }

        let job = match self.jobs.claim_job(message.job_id, &self.worker_id, now).await {
            Ok(job) => job,
            Err(StoreError::NotFound) => {
                // Gone or already terminal; drop the message for good.
                debug!(job_id = %message.job_id, "job not claimable, dropping message");
                let _ = reservation.ack().await;
                return PollOutcome::Processed;
            }
            Err(e) => {
                warn!(job_id = %message.job_id, error = %e, "claim failed");
                let _ = reservation.requeue(None).await;
                return PollOutcome::Backoff;
            }
        };

        self.execute_claimed(job, reservation.as_mut(), now).await;
        PollOutcome::Processed
    }

    async fn execute_claimed(
        &self,
        mut job: Job,
        reservation: &mut dyn Reservation,
        now: DateTime<Utc>,
    ) {
        let outcome = match self.resolve_link(&job).await {
            Ok(link) => self.reactions.deliver(&link, &job.input).await,
            Err(message) => Err(ReactionError::Failed {
                message,
                result: Box::new(ReactionResult::default()),
            }),
        };

        match outcome {
            Ok(result) => {
                job.status = JobStatus::Succeeded;
                job.result = Some(result_payload(&result));
                job.last_error = None;
                job.updated_at = now;
                if let Err(e) = self.jobs.update_job(&job).await {
                    warn!(job_id = %job.id, error = %e, "finalize succeeded job failed");
                }
                self.log_attempt(&job, &result, true, None, now).await;
                if let Err(e) = reservation.ack().await {
                    warn!(job_id = %job.id, error = %e, "ack failed");
                }
                debug!(job_id = %job.id, attempt = job.attempt, "job succeeded");
            }
            Err(error) => self.finalize_failure(job, error, reservation, now).await,
        }
    }

    async fn finalize_failure(
        &self,
        mut job: Job,
        error: ReactionError,
        reservation: &mut dyn Reservation,
        now: DateTime<Utc>,
    ) {
        let (message, result) = match error {
            ReactionError::Failed { message, result } => (message, *result),
            other => (other.to_string(), ReactionResult::default()),
        };
        job.last_error = Some(message.clone());

        let policy = match self.resolve_link(&job).await {
            Ok(link) => link.retry,
            Err(_) => None,
        };
        let retry = policy.filter(|p| p.should_retry(job.attempt));

        match retry {
            Some(policy) => {
                let delay = policy.delay(job.attempt);
                let run_at = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                job.status = JobStatus::Retrying;
                job.run_at = run_at;
                job.updated_at = now;
                if let Err(e) = self.jobs.update_job(&job).await {
                    warn!(job_id = %job.id, error = %e, "mark retrying failed");
                }
                self.log_attempt(&job, &result, false, Some(&message), now).await;
                if let Err(e) = reservation.requeue(Some(run_at)).await {
                    warn!(job_id = %job.id, error = %e, "requeue for retry failed");
                }
                info!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    run_at = %run_at,
                    "job failed, retrying"
                );
            }
            None => {
                job.status = JobStatus::Failed;
                job.updated_at = now;
                if let Err(e) = self.jobs.update_job(&job).await {
                    warn!(job_id = %job.id, error = %e, "mark failed failed");
                }
                self.log_attempt(&job, &result, false, Some(&message), now).await;
                if let Err(e) = reservation.ack().await {
                    warn!(job_id = %job.id, error = %e, "ack failed");
                }
                info!(job_id = %job.id, attempt = job.attempt, "job failed terminally");
            }
        }
    }

    /// The area and reaction link a job targets, from its input payload
    /// and its own link id.
    async fn resolve_link(&self, job: &Job) -> Result<Link, String> {
        let area_id = job
            .input
            .get("area_id")
            .and_then(|v| v.as_str())
            .and_then(|s| AreaId::parse(s).ok())
            .ok_or_else(|| "job input has no valid area_id".to_owned())?;
        let area = self
            .areas
            .find_area(area_id)
            .await
            .map_err(|e| format!("load area: {e}"))?;
        area.link(job.area_link_id)
            .cloned()
            .ok_or_else(|| format!("area has no link {}", job.area_link_id))
    }

    async fn log_attempt(
        &self,
        job: &Job,
        result: &ReactionResult,
        succeeded: bool,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let log = DeliveryLog {
            job_id: job.id,
            attempt: job.attempt,
            succeeded,
            endpoint: result.endpoint.clone(),
            status_code: result.status_code,
            request: result.request.clone(),
            response: result.response.clone(),
            error: error.map(str::to_owned),
            duration: result.duration,
            logged_at: now,
        };
        if let Err(e) = self.delivery_logs.append_delivery_log(log).await {
            warn!(job_id = %job.id, error = %e, "delivery log append failed");
        }
    }
}

fn result_payload(result: &ReactionResult) -> JsonMap {
    let mut payload = JsonMap::new();
    payload.insert("endpoint".into(), json!(result.endpoint));
    if let Some(code) = result.status_code {
        payload.insert("status_code".into(), json!(code));
    }
    payload.insert(
        "response".into(),
        serde_json::Value::Object(result.response.clone()),
    );
    payload.insert("duration_ms".into(), json!(result.duration.as_millis() as u64));
    payload
}

//! Jobs: one unit of reaction work, plus the retry policy and per-attempt
//! delivery log that govern its execution.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{JobId, JsonMap, LinkId, TriggerId};

/// Lifecycle of a job. `Retrying` is a failed attempt waiting for its
/// backoff to elapse; terminal states are `Succeeded`, `Failed`, `Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Whether a worker may claim a job in this state.
    pub fn claimable(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Retrying)
    }

    pub fn terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

/// One reaction to perform for one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub trigger_id: TriggerId,
    pub area_link_id: LinkId,
    pub status: JobStatus,
    /// Number of attempts started so far. Incremented by the claim.
    pub attempt: u32,
    /// Self-contained execution context assembled by the pipeline.
    #[serde(default)]
    pub input: JsonMap,
    /// Earliest time the job should run. Backoff pushes this forward.
    pub run_at: DateTime<Utc>,
    pub result: Option<JsonMap>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable record of one delivery attempt against the target service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub job_id: JobId,
    pub attempt: u32,
    pub succeeded: bool,
    pub endpoint: String,
    pub status_code: Option<u16>,
    #[serde(default)]
    pub request: JsonMap,
    #[serde(default)]
    pub response: JsonMap,
    pub error: Option<String>,
    pub duration: Duration,
    pub logged_at: DateTime<Utc>,
}

/// Backoff shape for retried jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Constant,
    Linear,
    Exponential,
}

/// How many times a failed job is retried and how long to wait between
/// attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Whether a job whose `attempt`-th try just failed gets another one.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before the attempt following `attempt` (1-indexed), capped at
    /// `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.strategy {
            RetryStrategy::Constant => self.base_delay,
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt),
            RetryStrategy::Exponential => {
                // Past shift 31 the factor already saturates to max_delay.
                let shift = (attempt - 1).min(31);
                self.base_delay.saturating_mul(1u32 << shift)
            }
        };
        raw.min(self.max_delay)
    }
}

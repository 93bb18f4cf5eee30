//! Persistence ports.
//!
//! The engine talks to storage through these traits only. The shipped
//! backend is [`memory::MemoryStore`]; a relational backend implements the
//! same traits against its own transactions.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{
    Area, DeliveryLog, Event, Job, PollingBinding, ScheduleBinding, Trigger, WebhookBinding,
};
use crate::identity::{Identity, TokenExchange};
use crate::types::{AreaId, IdentityId, JobId, JsonMap, LinkId, SourceId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("conflicting record already exists")]
    Conflict,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A new occurrence to record, before ids and dedup status are assigned.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub source_id: SourceId,
    pub fingerprint: String,
    pub payload: JsonMap,
    pub occurred_at: DateTime<Utc>,
}

/// One job to create alongside an event, targeting a reaction link.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub area_link_id: LinkId,
    pub input: JsonMap,
}

/// The rows produced by one atomic execution insert.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub event: Event,
    pub trigger: Trigger,
    pub jobs: Vec<Job>,
}

#[async_trait]
pub trait AreaRepository: Send + Sync {
    async fn find_area(&self, id: AreaId) -> Result<Area, StoreError>;
}

#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Schedule sources whose `next_run` is at or before `now`.
    async fn list_due_schedule_sources(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduleBinding>, StoreError>;

    /// Polling sources whose `next_run` is at or before `now` or unset.
    async fn list_due_polling_sources(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PollingBinding>, StoreError>;

    /// Resolve a webhook mount path to its source and area context.
    async fn find_webhook_binding(&self, path: &str) -> Result<WebhookBinding, StoreError>;

    /// Replace the source's cursor wholesale.
    async fn update_cursor(&self, id: SourceId, cursor: JsonMap) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Insert one event, one trigger, and the given jobs atomically.
    ///
    /// Returns [`StoreError::Conflict`] without writing anything when an
    /// event with the same `(source_id, fingerprint)` already exists.
    async fn create_execution(
        &self,
        event: NewEvent,
        area_id: AreaId,
        jobs: Vec<NewJob>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionRecord, StoreError>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Atomically move a claimable job to `Running` and bump its attempt.
    ///
    /// Returns [`StoreError::NotFound`] when the job does not exist or is
    /// not in a claimable state, so a second worker racing on the same
    /// message loses cleanly.
    async fn claim_job(
        &self,
        id: JobId,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn find_job(&self, id: JobId) -> Result<Job, StoreError>;
}

#[async_trait]
pub trait DeliveryLogRepository: Send + Sync {
    async fn append_delivery_log(&self, log: DeliveryLog) -> Result<(), StoreError>;

    async fn list_delivery_logs(&self, job_id: JobId) -> Result<Vec<DeliveryLog>, StoreError>;
}

#[async_trait]
pub trait IdentityRepository: Send + Sync {
    async fn find_identity(&self, id: IdentityId) -> Result<Identity, StoreError>;

    /// Persist exchanged tokens onto an identity.
    async fn update_identity_tokens(
        &self,
        id: IdentityId,
        exchange: &TokenExchange,
    ) -> Result<(), StoreError>;
}

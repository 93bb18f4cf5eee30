//! The execution pipeline: turn one observed occurrence into persisted
//! execution records and queued work.
//!
//! Every activation path (webhook, poller, timer) funnels through
//! [`ExecutionService::execute_area`]: load the area, validate its shape,
//! and hand a self-contained job per reaction to the pipeline. The insert
//! of event, trigger, and jobs is atomic; enqueueing happens after the
//! commit and is best-effort, since the stale-job sweep recovers anything
//! the queue misses.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::domain::{Area, Link};
use crate::queue::{JobMessage, JobQueue};
use crate::store::{AreaRepository, ExecutionRepository, NewEvent, NewJob, StoreError};
use crate::types::{AreaId, JsonMap, SourceId, UserId};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("area not found")]
    AreaNotFound,
    #[error("area does not belong to the requesting user")]
    NotOwned,
    #[error("area is not executable: {0}")]
    MalformedArea(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One occurrence to run an area for.
#[derive(Debug, Clone)]
pub struct ExecutionInput {
    pub source_id: SourceId,
    /// The user the activation claims to act for; must own the area.
    pub user_id: UserId,
    /// Idempotency key within the source; a repeat is silently dropped.
    pub fingerprint: String,
    pub payload: JsonMap,
    pub occurred_at: DateTime<Utc>,
}

/// Persists one execution and queues its jobs.
#[async_trait]
pub trait ExecutionPipeline: Send + Sync {
    async fn run(&self, area: &Area, input: ExecutionInput) -> Result<(), PipelineError>;
}

/// Entry point used by all activation paths.
#[async_trait]
pub trait AreaExecutor: Send + Sync {
    async fn execute_area(
        &self,
        area_id: AreaId,
        input: ExecutionInput,
    ) -> Result<(), PipelineError>;
}

/// [`ExecutionPipeline`] over the storage and queue ports.
pub struct StorePipeline {
    executions: Arc<dyn ExecutionRepository>,
    queue: Arc<dyn JobQueue>,
    clock: SharedClock,
}

impl StorePipeline {
    pub fn new(
        executions: Arc<dyn ExecutionRepository>,
        queue: Arc<dyn JobQueue>,
        clock: SharedClock,
    ) -> Self {
        StorePipeline {
            executions,
            queue,
            clock,
        }
    }
}

/// The execution context a worker needs, denormalized so a job can run
/// without re-joining catalog tables.
fn job_input(area: &Area, link: &Link, event_payload: &JsonMap) -> JsonMap {
    let component = link.config.component.as_ref();
    let mut input = JsonMap::new();
    input.insert("area_id".into(), json!(area.id));
    input.insert("user_id".into(), json!(area.user_id));
    input.insert("area_name".into(), json!(area.name));
    input.insert("reaction_id".into(), json!(link.id));
    input.insert("component_id".into(), json!(link.config.component_id));
    input.insert(
        "component_name".into(),
        json!(component.map(|c| c.name.as_str())),
    );
    input.insert(
        "provider".into(),
        json!(component.and_then(|c| c.provider_name())),
    );
    input.insert("params".into(), serde_json::Value::Object(link.config.params.clone()));
    input.insert(
        "event_payload".into(),
        serde_json::Value::Object(event_payload.clone()),
    );
    input
}

#[async_trait]
impl ExecutionPipeline for StorePipeline {
    async fn run(&self, area: &Area, mut input: ExecutionInput) -> Result<(), PipelineError> {
        if input.fingerprint.is_empty() {
            // No idempotency key from the caller; make the occurrence unique.
            input.fingerprint = uuid::Uuid::new_v4().to_string();
        }
        input
            .payload
            .insert("area_id".into(), json!(area.id));
        input
            .payload
            .insert("source_id".into(), json!(input.source_id));

        let jobs: Vec<NewJob> = area
            .reactions()
            .iter()
            .map(|link| NewJob {
                area_link_id: link.id,
                input: job_input(area, link, &input.payload),
            })
            .collect();

        let event = NewEvent {
            source_id: input.source_id,
            fingerprint: input.fingerprint,
            payload: input.payload,
            occurred_at: input.occurred_at,
        };

        let record = match self
            .executions
            .create_execution(event, area.id, jobs, self.clock.now())
            .await
        {
            Ok(record) => record,
            Err(StoreError::Conflict) => {
                debug!(area_id = %area.id, "occurrence already recorded, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // Post-commit: the rows exist either way, and the sweep re-enqueues
        // anything that never made it onto the queue.
        for job in &record.jobs {
            let message = JobMessage {
                job_id: job.id,
                run_at: job.run_at,
            };
            if let Err(e) = self.queue.enqueue(message).await {
                warn!(job_id = %job.id, error = %e, "failed to enqueue job");
            }
        }
        Ok(())
    }
}

/// [`AreaExecutor`] that loads and validates the area before running the
/// pipeline.
pub struct ExecutionService {
    areas: Arc<dyn AreaRepository>,
    pipeline: Arc<dyn ExecutionPipeline>,
}

impl ExecutionService {
    pub fn new(areas: Arc<dyn AreaRepository>, pipeline: Arc<dyn ExecutionPipeline>) -> Self {
        ExecutionService { areas, pipeline }
    }
}

#[async_trait]
impl AreaExecutor for ExecutionService {
    async fn execute_area(
        &self,
        area_id: AreaId,
        input: ExecutionInput,
    ) -> Result<(), PipelineError> {
        let area = match self.areas.find_area(area_id).await {
            Ok(area) => area,
            Err(StoreError::NotFound) => return Err(PipelineError::AreaNotFound),
            Err(e) => return Err(e.into()),
        };

        if area.user_id != input.user_id {
            return Err(PipelineError::NotOwned);
        }
        if !area.is_enabled() {
            debug!(area_id = %area.id, "area not enabled, skipping");
            return Ok(());
        }
        if area.action().is_none() {
            return Err(PipelineError::MalformedArea("no action link".into()));
        }
        if area.reactions().is_empty() {
            return Err(PipelineError::MalformedArea("no reaction links".into()));
        }

        self.pipeline.run(&area, input).await
    }
}

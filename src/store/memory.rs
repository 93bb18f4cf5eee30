//! In-memory storage backend.
//!
//! One mutex guards all tables, which makes the multi-row execution insert
//! trivially atomic. Intended for single-process deployments and tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    Area, DedupStatus, DeliveryLog, Event, Job, JobStatus, PollingBinding, ScheduleBinding, Source,
    SourceMode, Trigger, TriggerStatus, WebhookBinding,
};
use crate::identity::{Identity, TokenExchange};
use crate::types::{
    AreaId, EventId, IdentityId, JobId, JsonMap, LinkId, SourceId, TriggerId, UserId,
};

use super::{
    AreaRepository, DeliveryLogRepository, ExecutionRecord, ExecutionRepository, IdentityRepository,
    JobRepository, NewEvent, NewJob, SourceRepository, StoreError,
};

/// A source together with the area context it activates. The relational
/// equivalent is a join across sources, links, and configs.
#[derive(Debug, Clone)]
pub struct SourceBinding {
    pub source: Source,
    pub area_id: AreaId,
    pub area_link_id: LinkId,
    pub user_id: UserId,
    pub config: crate::domain::ComponentConfig,
}

#[derive(Default)]
struct Inner {
    areas: HashMap<AreaId, Area>,
    bindings: Vec<SourceBinding>,
    events: HashMap<EventId, Event>,
    event_index: HashMap<(SourceId, String), EventId>,
    triggers: HashMap<TriggerId, Trigger>,
    jobs: HashMap<JobId, Job>,
    delivery_logs: Vec<DeliveryLog>,
    identities: HashMap<IdentityId, Identity>,
}

/// All repositories over one shared mutex.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_area(&self, area: Area) {
        self.lock().areas.insert(area.id, area);
    }

    pub fn insert_binding(&self, binding: SourceBinding) {
        self.lock().bindings.push(binding);
    }

    pub fn insert_identity(&self, identity: Identity) {
        self.lock().identities.insert(identity.id, identity);
    }

    /// Snapshot of all recorded events, insertion order not guaranteed.
    pub fn events(&self) -> Vec<Event> {
        self.lock().events.values().cloned().collect()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    pub fn triggers(&self) -> Vec<Trigger> {
        self.lock().triggers.values().cloned().collect()
    }

    pub fn delivery_logs(&self) -> Vec<DeliveryLog> {
        self.lock().delivery_logs.clone()
    }

    pub fn source(&self, id: SourceId) -> Option<Source> {
        self.lock()
            .bindings
            .iter()
            .find(|b| b.source.id == id)
            .map(|b| b.source.clone())
    }
}

fn due(source: &Source, now: DateTime<Utc>) -> bool {
    match source.next_run() {
        Some(next) => next <= now,
        None => true,
    }
}

#[async_trait]
impl AreaRepository for MemoryStore {
    async fn find_area(&self, id: AreaId) -> Result<Area, StoreError> {
        self.lock().areas.get(&id).cloned().ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl SourceRepository for MemoryStore {
    async fn list_due_schedule_sources(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduleBinding>, StoreError> {
        let inner = self.lock();
        let mut hits: Vec<&SourceBinding> = inner
            .bindings
            .iter()
            .filter(|b| {
                b.source.active && b.source.mode == SourceMode::Schedule && due(&b.source, now)
            })
            .collect();
        hits.sort_by_key(|b| b.source.next_run());
        Ok(hits
            .into_iter()
            .take(limit)
            .map(|b| ScheduleBinding {
                source: b.source.clone(),
                area_id: b.area_id,
                area_link_id: b.area_link_id,
                user_id: b.user_id,
                config: b.config.clone(),
            })
            .collect())
    }

    async fn list_due_polling_sources(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PollingBinding>, StoreError> {
        let inner = self.lock();
        let mut hits: Vec<&SourceBinding> = inner
            .bindings
            .iter()
            .filter(|b| {
                b.source.active && b.source.mode == SourceMode::Polling && due(&b.source, now)
            })
            .collect();
        hits.sort_by_key(|b| b.source.next_run());
        Ok(hits
            .into_iter()
            .take(limit)
            .map(|b| PollingBinding {
                source: b.source.clone(),
                area_id: b.area_id,
                area_link_id: b.area_link_id,
                user_id: b.user_id,
                config: b.config.clone(),
            })
            .collect())
    }

    async fn find_webhook_binding(&self, path: &str) -> Result<WebhookBinding, StoreError> {
        let inner = self.lock();
        inner
            .bindings
            .iter()
            .find(|b| {
                b.source.active
                    && b.source.mode == SourceMode::Webhook
                    && b.source.webhook_path == path
            })
            .map(|b| WebhookBinding {
                source: b.source.clone(),
                area_id: b.area_id,
                area_link_id: b.area_link_id,
                user_id: b.user_id,
                config: b.config.clone(),
            })
            .ok_or(StoreError::NotFound)
    }

    async fn update_cursor(&self, id: SourceId, cursor: JsonMap) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let binding = inner
            .bindings
            .iter_mut()
            .find(|b| b.source.id == id)
            .ok_or(StoreError::NotFound)?;
        binding.source.cursor = cursor;
        Ok(())
    }
}

#[async_trait]
impl ExecutionRepository for MemoryStore {
    async fn create_execution(
        &self,
        event: NewEvent,
        area_id: AreaId,
        jobs: Vec<NewJob>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionRecord, StoreError> {
        let mut inner = self.lock();

        let key = (event.source_id, event.fingerprint.clone());
        if inner.event_index.contains_key(&key) {
            return Err(StoreError::Conflict);
        }

        let stored_event = Event {
            id: EventId::new(),
            source_id: event.source_id,
            fingerprint: event.fingerprint,
            payload: event.payload,
            occurred_at: event.occurred_at,
            received_at: now,
            dedup_status: DedupStatus::New,
        };
        let trigger = Trigger {
            id: TriggerId::new(),
            event_id: stored_event.id,
            area_id,
            status: TriggerStatus::Matched,
            fired_at: now,
        };
        let stored_jobs: Vec<Job> = jobs
            .into_iter()
            .map(|j| Job {
                id: JobId::new(),
                trigger_id: trigger.id,
                area_link_id: j.area_link_id,
                status: JobStatus::Queued,
                attempt: 0,
                input: j.input,
                run_at: now,
                result: None,
                last_error: None,
                claimed_by: None,
                created_at: now,
                updated_at: now,
            })
            .collect();

        inner.event_index.insert(key, stored_event.id);
        inner.events.insert(stored_event.id, stored_event.clone());
        inner.triggers.insert(trigger.id, trigger.clone());
        for job in &stored_jobs {
            inner.jobs.insert(job.id, job.clone());
        }

        Ok(ExecutionRecord {
            event: stored_event,
            trigger,
            jobs: stored_jobs,
        })
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn claim_job(
        &self,
        id: JobId,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if !job.status.claimable() {
            return Err(StoreError::NotFound);
        }
        job.status = JobStatus::Running;
        job.attempt += 1;
        job.claimed_by = Some(worker.to_owned());
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn find_job(&self, id: JobId) -> Result<Job, StoreError> {
        self.lock().jobs.get(&id).cloned().ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl DeliveryLogRepository for MemoryStore {
    async fn append_delivery_log(&self, log: DeliveryLog) -> Result<(), StoreError> {
        self.lock().delivery_logs.push(log);
        Ok(())
    }

    async fn list_delivery_logs(&self, job_id: JobId) -> Result<Vec<DeliveryLog>, StoreError> {
        Ok(self
            .lock()
            .delivery_logs
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IdentityRepository for MemoryStore {
    async fn find_identity(&self, id: IdentityId) -> Result<Identity, StoreError> {
        self.lock()
            .identities
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update_identity_tokens(
        &self,
        id: IdentityId,
        exchange: &TokenExchange,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let identity = inner.identities.get_mut(&id).ok_or(StoreError::NotFound)?;
        identity.access_token = exchange.access_token.clone();
        if let Some(refresh) = &exchange.refresh_token {
            identity.refresh_token = Some(refresh.clone());
        }
        identity.expires_at = exchange.expires_at;
        Ok(())
    }
}

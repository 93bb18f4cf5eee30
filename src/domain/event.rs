//! Execution records: events and the triggers that tie them to areas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AreaId, EventId, JsonMap, SourceId, TriggerId};

/// Deduplication outcome recorded on the event at insert time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStatus {
    New,
    Duplicate,
    Ignored,
}

/// One observed occurrence on a source: a webhook delivery, a polled item,
/// or a timer tick. Unique per `(source_id, fingerprint)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub source_id: SourceId,
    /// Idempotency key for this occurrence within its source.
    pub fingerprint: String,
    #[serde(default)]
    pub payload: JsonMap,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub dedup_status: DedupStatus,
}

/// Outcome of matching an event against an area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Matched,
    Skipped,
}

/// The record that an event fired (or was skipped by) a specific area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    pub event_id: EventId,
    pub area_id: AreaId,
    pub status: TriggerStatus,
    pub fired_at: DateTime<Utc>,
}

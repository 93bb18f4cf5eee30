//! Schedule-mode activation.
//!
//! A schedule source's cursor carries its own state machine: `next_run`
//! says when it fires, the frequency fields say how to advance it. Each
//! tick fires every due source and advances its cursor unconditionally, so
//! a failing area resumes on its regular interval instead of being
//! hammered every tick.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::clock::SharedClock;
use crate::domain::ScheduleBinding;
use crate::pipeline::{AreaExecutor, ExecutionInput};
use crate::store::SourceRepository;
use crate::types::JsonMap;

#[derive(Debug, Error)]
pub enum TimerConfigError {
    #[error("frequencyValue missing or not a positive integer")]
    BadFrequencyValue,
    #[error("frequencyUnit missing or unsupported")]
    BadFrequencyUnit,
    #[error("startAt must be RFC 3339")]
    BadStartAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyUnit {
    Minute,
    Hour,
    Day,
}

impl FrequencyUnit {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" | "minutes" => Some(FrequencyUnit::Minute),
            "hour" | "hours" => Some(FrequencyUnit::Hour),
            "day" | "days" => Some(FrequencyUnit::Day),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            FrequencyUnit::Minute => "minute",
            FrequencyUnit::Hour => "hour",
            FrequencyUnit::Day => "day",
        }
    }

    fn duration(self) -> Duration {
        match self {
            FrequencyUnit::Minute => Duration::minutes(1),
            FrequencyUnit::Hour => Duration::hours(1),
            FrequencyUnit::Day => Duration::days(1),
        }
    }
}

/// Declarative timer settings from link params.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerConfig {
    pub frequency_value: i64,
    pub frequency_unit: FrequencyUnit,
    pub start_at: Option<DateTime<Utc>>,
}

/// Upper bound on a schedule interval, one century in seconds. Keeps the
/// i64 interval math in range for any accepted config.
const MAX_INTERVAL_SECS: i64 = 100 * 365 * 86_400;

impl TimerConfig {
    pub fn decode(params: &JsonMap) -> Result<Self, TimerConfigError> {
        let frequency_value = match params.get("frequencyValue") {
            Some(v) => as_integer(v).ok_or(TimerConfigError::BadFrequencyValue)?,
            None => return Err(TimerConfigError::BadFrequencyValue),
        };
        if frequency_value <= 0 {
            return Err(TimerConfigError::BadFrequencyValue);
        }

        let frequency_unit = params
            .get("frequencyUnit")
            .and_then(|v| v.as_str())
            .and_then(FrequencyUnit::parse)
            .ok_or(TimerConfigError::BadFrequencyUnit)?;

        if frequency_value > MAX_INTERVAL_SECS / frequency_unit.duration().num_seconds() {
            return Err(TimerConfigError::BadFrequencyValue);
        }

        let start_at = match params.get("startAt").and_then(|v| v.as_str()) {
            Some(s) if !s.trim().is_empty() => Some(
                DateTime::parse_from_rfc3339(s.trim())
                    .map_err(|_| TimerConfigError::BadStartAt)?
                    .with_timezone(&Utc),
            ),
            _ => None,
        };

        Ok(TimerConfig {
            frequency_value,
            frequency_unit,
            start_at,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::seconds(
            self.frequency_value
                .saturating_mul(self.frequency_unit.duration().num_seconds()),
        )
    }

    /// The first aligned instant strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let interval = self.interval();
        let Some(start) = self.start_at else {
            return now + interval;
        };
        if now < start {
            return start;
        }
        let elapsed = (now - start).num_seconds();
        let step = interval.num_seconds();
        let cycles = elapsed / step + 1;
        start + Duration::seconds(cycles * step)
    }
}

/// Accepts JSON numbers and integral floats, the shapes a JSON params blob
/// can hold.
fn as_integer(value: &serde_json::Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 {
        Some(f as i64)
    } else {
        None
    }
}

pub struct TimerScheduler {
    sources: Arc<dyn SourceRepository>,
    executor: Arc<dyn AreaExecutor>,
    clock: SharedClock,
    tick_interval: StdDuration,
    batch: usize,
}

impl TimerScheduler {
    pub fn new(
        sources: Arc<dyn SourceRepository>,
        executor: Arc<dyn AreaExecutor>,
        clock: SharedClock,
        tick_interval: StdDuration,
        batch: usize,
    ) -> Self {
        TimerScheduler {
            sources,
            executor,
            clock,
            tick_interval,
            batch,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    pub async fn tick(&self) {
        let now = self.clock.now();
        let bindings = match self.sources.list_due_schedule_sources(now, self.batch).await {
            Ok(bindings) => bindings,
            Err(e) => {
                error!(error = %e, "listing due schedule sources failed");
                return;
            }
        };
        for binding in bindings {
            self.fire(binding, now).await;
        }
    }

    async fn fire(&self, binding: ScheduleBinding, now: DateTime<Utc>) {
        // A schedule source without a next_run was never armed.
        if binding.source.next_run().is_none() {
            return;
        }

        let mut payload = JsonMap::new();
        payload.insert("trigger".into(), json!("schedule"));
        payload.insert("fired_at".into(), json!(now.to_rfc3339()));

        let input = ExecutionInput {
            source_id: binding.source.id,
            user_id: binding.user_id,
            fingerprint: String::new(),
            payload,
            occurred_at: now,
        };
        let exec_err = self
            .executor
            .execute_area(binding.area_id, input)
            .await
            .err();
        if let Some(e) = &exec_err {
            error!(area_id = %binding.area_id, error = %e, "timer execution failed");
        }

        let config = match TimerConfig::decode(&binding.config.params) {
            Ok(config) => config,
            Err(e) => {
                error!(source_id = %binding.source.id, error = %e, "timer config decode failed");
                return;
            }
        };

        let next_run = config.next_after(now);
        let mut cursor = binding.source.cursor.clone();
        cursor.insert("next_run".into(), json!(next_run.to_rfc3339()));
        cursor.insert(
            "interval_seconds".into(),
            json!(config.interval().num_seconds()),
        );
        cursor.insert("frequency_value".into(), json!(config.frequency_value));
        cursor.insert(
            "frequency_unit".into(),
            json!(config.frequency_unit.label()),
        );
        cursor.insert("last_run".into(), json!(now.to_rfc3339()));
        if let Some(start) = config.start_at {
            cursor.insert("start_at".into(), json!(start.to_rfc3339()));
        }
        match exec_err {
            Some(e) => {
                cursor.insert("last_error".into(), json!(e.to_string()));
            }
            None => {
                cursor.remove("last_error");
            }
        }

        if let Err(e) = self.sources.update_cursor(binding.source.id, cursor).await {
            error!(source_id = %binding.source.id, error = %e, "timer cursor update failed");
        } else {
            debug!(source_id = %binding.source.id, next_run = %next_run, "timer cursor advanced");
        }
    }
}

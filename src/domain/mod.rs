//! Domain model for the execution engine.
//!
//! These are plain data types mirroring the persistence layer: the AREA
//! catalog views consumed read-only by the engine (`area`, `component`), the
//! activation records it owns (`source`), and the execution records it
//! creates and transitions (`event`, `job`).

pub mod area;
pub mod component;
pub mod event;
pub mod job;
pub mod source;

pub use area::{Area, AreaStatus, Link, LinkRole};
pub use component::{Component, ComponentConfig, ComponentKind, Provider};
pub use event::{DedupStatus, Event, Trigger, TriggerStatus};
pub use job::{DeliveryLog, Job, JobStatus, RetryPolicy, RetryStrategy};
pub use source::{PollingBinding, ScheduleBinding, Source, SourceMode, WebhookBinding};

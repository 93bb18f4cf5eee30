//! AreaFlow - the execution engine for AREA-style automations.
//!
//! An automation ("area") links one action component to ordered reaction
//! components. This crate ingests occurrences from webhooks, timers and
//! HTTP polling, records them atomically as event + trigger + jobs, and
//! delivers the reactions through a queue-backed worker pool.

pub mod clock;
pub mod config;
pub mod domain;
pub mod identity;
pub mod pipeline;
pub mod queue;
pub mod reaction;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod template;
pub mod types;
pub mod worker;

//! Occurrence producers: the timer scheduler and the declarative HTTP
//! poller. Both run a single tick loop over due sources and feed the
//! execution pipeline; each source's cursor is written only by its own
//! producer.

pub mod http_poll;
pub mod polling;
pub mod timer;

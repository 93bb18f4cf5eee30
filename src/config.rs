//! Engine configuration.
//!
//! Everything comes from `AREAFLOW_*` environment variables with sensible
//! defaults, so a bare `areaflow` invocation runs a complete engine.

use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_BIND: ([u8; 4], u16) = ([0, 0, 0, 0], 8080);
const DEFAULT_TICK_SECS: u64 = 15;
const DEFAULT_BATCH: usize = 50;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_RESERVE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_BACKOFF_SECS: u64 = 2;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_STUCK_AFTER_SECS: u64 = 300;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address the webhook server listens on.
    pub bind: SocketAddr,
    /// How often the timer scheduler scans for due schedule sources.
    pub timer_tick: Duration,
    /// Max schedule sources fired per tick.
    pub timer_batch: usize,
    /// How often the polling runner scans for due polling sources.
    pub polling_tick: Duration,
    /// Max polling sources polled per tick.
    pub polling_batch: usize,
    /// Number of concurrent job workers.
    pub workers: usize,
    /// How long a worker blocks waiting for a queue message.
    pub reserve_timeout: Duration,
    /// Pause after a queue backend error.
    pub worker_backoff: Duration,
    /// How often the stale-reservation sweep runs.
    pub sweep_interval: Duration,
    /// Age at which an unacknowledged reservation is returned to pending.
    pub stuck_after: Duration,
    /// Timeout for outbound HTTP (polling and reaction delivery).
    pub http_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            bind: SocketAddr::from(DEFAULT_BIND),
            timer_tick: Duration::from_secs(DEFAULT_TICK_SECS),
            timer_batch: DEFAULT_BATCH,
            polling_tick: Duration::from_secs(DEFAULT_TICK_SECS),
            polling_batch: DEFAULT_BATCH,
            workers: DEFAULT_WORKERS,
            reserve_timeout: Duration::from_secs(DEFAULT_RESERVE_TIMEOUT_SECS),
            worker_backoff: Duration::from_secs(DEFAULT_BACKOFF_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            stuck_after: Duration::from_secs(DEFAULT_STUCK_AFTER_SECS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

impl EngineConfig {
    /// Reads configuration from `AREAFLOW_*` environment variables.
    /// Unset or unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        EngineConfig {
            bind: std::env::var("AREAFLOW_BIND")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.bind),
            timer_tick: env_secs("AREAFLOW_TIMER_TICK_SECS", defaults.timer_tick),
            timer_batch: env_usize("AREAFLOW_TIMER_BATCH", defaults.timer_batch),
            polling_tick: env_secs("AREAFLOW_POLLING_TICK_SECS", defaults.polling_tick),
            polling_batch: env_usize("AREAFLOW_POLLING_BATCH", defaults.polling_batch),
            workers: env_usize("AREAFLOW_WORKERS", defaults.workers).max(1),
            reserve_timeout: env_secs("AREAFLOW_RESERVE_TIMEOUT_SECS", defaults.reserve_timeout),
            worker_backoff: env_secs("AREAFLOW_WORKER_BACKOFF_SECS", defaults.worker_backoff),
            sweep_interval: env_secs("AREAFLOW_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            stuck_after: env_secs("AREAFLOW_STUCK_AFTER_SECS", defaults.stuck_after),
            http_timeout: env_secs("AREAFLOW_HTTP_TIMEOUT_SECS", defaults.http_timeout),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.workers, 4);
        assert!(config.stuck_after > config.reserve_timeout);
    }

    #[test]
    fn unset_env_falls_back_to_defaults() {
        // None of these variables are set under `cargo test`.
        let config = EngineConfig::from_env();
        assert_eq!(config.timer_tick, Duration::from_secs(DEFAULT_TICK_SECS));
        assert_eq!(config.polling_batch, DEFAULT_BATCH);
    }
}

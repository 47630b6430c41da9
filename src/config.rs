use crate::types::{ConflictStrategy, FallbackStrategy};
use std::env;

/// Application configuration.
///
/// Every option can be overridden through the environment; defaults match the
/// documented operational baseline. Lower bounds are enforced on load so a
/// misconfigured deployment degrades to the nearest sane value instead of
/// panicking at runtime.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite store of record.
    pub db_path: String,
    /// Redis URL for the event mirror, entity locks and read-through cache.
    pub redis_url: Option<String>,
    /// Number of parallel dispatch workers.
    pub worker_count: usize,
    /// Events claimed per worker pass.
    pub batch_size: usize,
    /// Retry attempts before an event is handed to the fallback controller.
    pub retry_limit: u32,
    /// Base retry delay; attempt n waits `retry_delay_ms * (n + 1)`.
    pub retry_delay_ms: u64,
    /// Upper bound on a single retry backoff.
    pub retry_backoff_cap_ms: u64,
    /// Completed events older than this are deleted by the cleanup loop.
    pub event_ttl_days: u32,
    /// Interval between cleanup passes.
    pub cleanup_interval_min: u32,
    /// Strategy applied when the two stores diverge.
    pub conflict_strategy: ConflictStrategy,
    /// Window the periodic conflict sweep looks back over.
    pub conflict_sweep_window_min: u32,
    /// Strategy tried first when dispatch exhausts retries.
    pub fallback_strategy: FallbackStrategy,
    /// Pending fallback operations above this raise a warning alert.
    pub fallback_queue_threshold: usize,
    /// FAILED events reprocessed by a selective resync.
    pub fallback_selective_limit: usize,
    /// Interval between health snapshots.
    pub monitor_interval_sec: u32,
    /// Alerts expire after this many hours.
    pub monitor_alert_ttl_hours: u32,
    /// Dispatcher poll interval when no events are pending.
    pub poll_interval_ms: u64,
    /// PROCESSING events older than this are reclaimable by other workers.
    pub lease_timeout_sec: u32,
    /// PENDING depth above which the monitor raises a backpressure warning.
    pub backpressure_threshold: usize,
    /// Deadline for relational store calls.
    pub relational_timeout_ms: u64,
    /// Deadline for graph store calls.
    pub graph_timeout_ms: u64,
    /// Deadline for cache store calls.
    pub cache_timeout_ms: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let conflict_strategy = env::var("CONFLICT_STRATEGY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(ConflictStrategy::RelationalWins);
        let fallback_strategy = env::var("FALLBACK_STRATEGY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(FallbackStrategy::Queue);

        Self {
            db_path: env::var("ATLAS_DB_PATH").unwrap_or_else(|_| "atlas.db".to_string()),
            redis_url: env::var("REDIS_URL")
                .ok()
                .or_else(|| Some("redis://127.0.0.1:6379".to_string())),
            worker_count: env_parse("WORKER_COUNT", 5usize).max(1),
            batch_size: env_parse("BATCH_SIZE", 10usize).max(1),
            retry_limit: env_parse("RETRY_LIMIT", 3u32),
            retry_delay_ms: env_parse("RETRY_DELAY_MS", 5_000u64),
            retry_backoff_cap_ms: env_parse("RETRY_BACKOFF_CAP_MS", 300_000u64),
            event_ttl_days: env_parse("EVENT_TTL_DAYS", 30u32).max(1),
            cleanup_interval_min: env_parse("CLEANUP_INTERVAL_MIN", 60u32).max(1),
            conflict_strategy,
            conflict_sweep_window_min: env_parse("CONFLICT_SWEEP_WINDOW_MIN", 5u32).max(1),
            fallback_strategy,
            fallback_queue_threshold: env_parse("FALLBACK_QUEUE_THRESHOLD", 100usize).max(1),
            fallback_selective_limit: env_parse("FALLBACK_SELECTIVE_LIMIT", 50usize).max(1),
            monitor_interval_sec: env_parse("MONITOR_INTERVAL_SEC", 30u32).max(1),
            monitor_alert_ttl_hours: env_parse("MONITOR_ALERT_TTL_HOURS", 24u32).max(1),
            poll_interval_ms: env_parse("POLL_INTERVAL_MS", 1_000u64).max(1),
            lease_timeout_sec: env_parse("LEASE_TIMEOUT_SEC", 60u32).max(1),
            backpressure_threshold: env_parse("BACKPRESSURE_THRESHOLD", 1_000usize).max(1),
            relational_timeout_ms: env_parse("RELATIONAL_TIMEOUT_MS", 5_000u64).max(1),
            graph_timeout_ms: env_parse("GRAPH_TIMEOUT_MS", 10_000u64).max(1),
            cache_timeout_ms: env_parse("CACHE_TIMEOUT_MS", 2_000u64).max(1),
        }
    }

    /// Backoff before retry attempt `n` (zero-based), capped.
    pub fn retry_backoff_ms(&self, retry_count: u32) -> u64 {
        (self.retry_delay_ms * (retry_count as u64 + 1)).min(self.retry_backoff_cap_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            db_path: ":memory:".to_string(),
            redis_url: None,
            worker_count: 5,
            batch_size: 10,
            retry_limit: 3,
            retry_delay_ms: 5_000,
            retry_backoff_cap_ms: 300_000,
            event_ttl_days: 30,
            cleanup_interval_min: 60,
            conflict_strategy: ConflictStrategy::RelationalWins,
            conflict_sweep_window_min: 5,
            fallback_strategy: FallbackStrategy::Queue,
            fallback_queue_threshold: 100,
            fallback_selective_limit: 50,
            monitor_interval_sec: 30,
            monitor_alert_ttl_hours: 24,
            poll_interval_ms: 1_000,
            lease_timeout_sec: 60,
            backpressure_threshold: 1_000,
            relational_timeout_ms: 5_000,
            graph_timeout_ms: 10_000,
            cache_timeout_ms: 2_000,
        }
    }

    #[test]
    fn test_backoff_grows_linearly() {
        let config = base_config();
        assert_eq!(config.retry_backoff_ms(0), 5_000);
        assert_eq!(config.retry_backoff_ms(1), 10_000);
        assert_eq!(config.retry_backoff_ms(2), 15_000);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut config = base_config();
        config.retry_delay_ms = 100_000;
        assert_eq!(config.retry_backoff_ms(5), 300_000);
    }
}

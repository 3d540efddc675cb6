//! Scheduler configuration and worker identity.
//!
//! Every knob has a production default; `from_env` overlays `DOCKET_*`
//! environment variables (loading a `.env` file first when present) so hosts
//! can bind configuration without code.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

/// Per-node scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Gate for auto-wiring in a host process; `run_until_shutdown` is a
    /// no-op when false.
    pub enabled: bool,
    /// Lease owner string; blank means auto-generate at start.
    pub worker_id: String,
    /// Poll cadence; also the claim window size.
    pub process_every: Duration,
    /// Lease granted on claim; also the shutdown grace for in-flight jobs.
    pub default_lock_lifetime: Duration,
    /// Cap on concurrently-running handlers per node.
    pub max_concurrency: usize,
    /// Cap per handler name per node.
    pub default_concurrency: usize,
    /// Cap on total in-flight + queued locked jobs per node; 0 = unbounded.
    pub lock_limit: usize,
    /// Max jobs claimed per store round-trip.
    pub batch_size: i64,
    /// After this many failures, stop rescheduling; 0 = retry forever.
    pub max_retry_count: u32,
    /// Delete one-shot jobs after a successful run.
    pub cleanup_finished_jobs: bool,
    /// Create the required indexes at start instead of relying on migrations.
    pub ensure_indexes_on_startup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: String::new(),
            process_every: Duration::from_secs(5),
            default_lock_lifetime: Duration::from_secs(600),
            max_concurrency: 20,
            default_concurrency: 5,
            lock_limit: 0,
            batch_size: 5,
            max_retry_count: 5,
            cleanup_finished_jobs: true,
            ensure_indexes_on_startup: false,
        }
    }
}

impl SchedulerConfig {
    /// Create a config with a specific worker id.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Durations are plain seconds. Recognized keys:
    /// `DOCKET_ENABLED`, `DOCKET_WORKER_ID`, `DOCKET_PROCESS_EVERY_SECS`,
    /// `DOCKET_DEFAULT_LOCK_LIFETIME_SECS`, `DOCKET_MAX_CONCURRENCY`,
    /// `DOCKET_DEFAULT_CONCURRENCY`, `DOCKET_LOCK_LIMIT`,
    /// `DOCKET_BATCH_SIZE`, `DOCKET_MAX_RETRY_COUNT`,
    /// `DOCKET_CLEANUP_FINISHED_JOBS`, `DOCKET_ENSURE_INDEXES_ON_STARTUP`.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Self {
            enabled: env_parse("DOCKET_ENABLED", defaults.enabled),
            worker_id: env::var("DOCKET_WORKER_ID").unwrap_or(defaults.worker_id),
            process_every: env_secs("DOCKET_PROCESS_EVERY_SECS", defaults.process_every),
            default_lock_lifetime: env_secs(
                "DOCKET_DEFAULT_LOCK_LIFETIME_SECS",
                defaults.default_lock_lifetime,
            ),
            max_concurrency: env_parse("DOCKET_MAX_CONCURRENCY", defaults.max_concurrency),
            default_concurrency: env_parse(
                "DOCKET_DEFAULT_CONCURRENCY",
                defaults.default_concurrency,
            ),
            lock_limit: env_parse("DOCKET_LOCK_LIMIT", defaults.lock_limit),
            batch_size: env_parse("DOCKET_BATCH_SIZE", defaults.batch_size),
            max_retry_count: env_parse("DOCKET_MAX_RETRY_COUNT", defaults.max_retry_count),
            cleanup_finished_jobs: env_parse(
                "DOCKET_CLEANUP_FINISHED_JOBS",
                defaults.cleanup_finished_jobs,
            ),
            ensure_indexes_on_startup: env_parse(
                "DOCKET_ENSURE_INDEXES_ON_STARTUP",
                defaults.ensure_indexes_on_startup,
            ),
        }
    }

    /// The configured worker id, or a freshly generated one when blank.
    pub fn resolved_worker_id(&self) -> String {
        if self.worker_id.trim().is_empty() {
            generate_worker_id()
        } else {
            self.worker_id.clone()
        }
    }
}

/// Generate a `<hostname>-<pid>-<uuid>` lease owner id, truncated to 128
/// characters.
pub fn generate_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());

    format!("{}-{}-{}", host, std::process::id(), Uuid::new_v4())
        .chars()
        .take(128)
        .collect()
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

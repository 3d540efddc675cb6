//! Scheduler engine: poller, dispatcher, worker pool, and retry policy.
//!
//! Each node runs one poller and one dispatcher:
//!
//! ```text
//! Poller (every process_every)
//!     │
//!     ├─► claim_due_jobs(window_end, …)   atomic, lease = default_lock_lifetime
//!     └─► offer to delay queue (deduplicated by the enqueued-id set)
//!
//! Dispatcher
//!     │
//!     ├─► wait for the next-due job
//!     ├─► acquire global + per-name permits (blocking = backpressure)
//!     └─► spawn worker
//!             ├─► resolve handler, decode payload, execute
//!             ├─► mark success (next run via the interval parser) or
//!             │   mark failure (exponential retry delay)
//!             └─► release permits + refill signal
//! ```
//!
//! Worker completions release the refill signal, which wakes a backlogged
//! poller early; everything else sleeps on its own cadence. Cross-node
//! safety comes entirely from the store's claim/lease protocol: a crashed
//! or force-aborted worker leaves its row locked until `lock_until`, after
//! which any node reclaims it.

use std::collections::{HashMap, HashSet};
use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::builder::{JobBuilder, RepeatOptions};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::interval;
use crate::job::{PersistResult, ScheduledJob};
use crate::registry::HandlerRegistry;
use crate::store::{CancelQuery, JobStore};

/// How long a backlogged poller waits on the refill signal before re-checking.
const BACKLOG_WAIT: Duration = Duration::from_millis(200);

/// The poller gives up and stops the engine after this many consecutive
/// failed rounds.
const MAX_POLL_FAILURES: u32 = 30;

/// What `cancel` should do with the matched jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelMode {
    /// Clear the schedule (and any lease) but keep the rows.
    #[default]
    Disable,
    /// Remove the rows.
    Delete,
}

/// Options for [`Scheduler::cancel`].
#[derive(Debug, Clone, Copy)]
pub struct CancelOptions {
    pub mode: CancelMode,
    /// Cap on affected jobs; must be positive.
    pub limit: i64,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            mode: CancelMode::Disable,
            limit: 100,
        }
    }
}

impl CancelOptions {
    pub fn disable(limit: i64) -> Self {
        Self {
            mode: CancelMode::Disable,
            limit,
        }
    }

    pub fn delete(limit: i64) -> Self {
        Self {
            mode: CancelMode::Delete,
            limit,
        }
    }
}

/// Result of a cancel operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelOutcome {
    pub matched: u64,
    pub modified: u64,
    pub deleted: u64,
}

/// Per-node runtime state shared by the poller, dispatcher, and workers.
struct Inner {
    store: JobStore,
    registry: HandlerRegistry,
    config: SchedulerConfig,
    worker_id: String,
    started: AtomicBool,
    /// Ids claimed but not yet handed to a worker; deduplicates the
    /// poller/dispatcher hand-off.
    enqueued: Mutex<HashSet<Uuid>>,
    /// Node-wide cap on concurrently-running handlers.
    global_permits: Arc<Semaphore>,
    /// Per-name caps, created lazily on first dispatch of a name.
    name_permits: Mutex<HashMap<String, Arc<Semaphore>>>,
    /// Released once per worker completion; wakes a backlogged poller early.
    refill: Notify,
    /// End of the last polled window.
    cursor: Mutex<Option<DateTime<Utc>>>,
}

struct RunState {
    shutdown: CancellationToken,
    kill: CancellationToken,
    poller: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// The scheduling engine: one instance per node.
///
/// Owns all concurrency state; multiple nodes coordinate exclusively through
/// the `scheduled_jobs` table.
pub struct Scheduler {
    inner: Arc<Inner>,
    run: Mutex<Option<RunState>>,
}

impl Scheduler {
    pub fn new(pool: PgPool, registry: HandlerRegistry, config: SchedulerConfig) -> Self {
        let worker_id = config.resolved_worker_id();
        let global_permits = Arc::new(Semaphore::new(config.max_concurrency));

        Self {
            inner: Arc::new(Inner {
                store: JobStore::new(pool),
                registry,
                worker_id,
                global_permits,
                started: AtomicBool::new(false),
                enqueued: Mutex::new(HashSet::new()),
                name_permits: Mutex::new(HashMap::new()),
                refill: Notify::new(),
                cursor: Mutex::new(None),
                config,
            }),
            run: Mutex::new(None),
        }
    }

    /// The store this scheduler persists through.
    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    /// The lease owner id of this node.
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Start the poller and dispatcher. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let config = &self.inner.config;
        if config.process_every.is_zero() {
            return Err(Error::invalid_argument("process_every must be positive"));
        }
        if config.default_lock_lifetime.is_zero() {
            return Err(Error::invalid_argument(
                "default_lock_lifetime must be positive",
            ));
        }
        if config.max_concurrency == 0 {
            return Err(Error::invalid_argument("max_concurrency must be positive"));
        }

        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        if config.ensure_indexes_on_startup {
            if let Err(error) = self.inner.store.ensure_indexes().await {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(error);
            }
        }

        {
            let mut cursor = self.inner.cursor.lock().unwrap();
            if cursor.is_none() {
                *cursor = Some(Utc::now());
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let kill = CancellationToken::new();

        let dispatcher = tokio::spawn(dispatcher_loop(
            Arc::clone(&self.inner),
            rx,
            shutdown.clone(),
            kill.clone(),
        ));
        let poller = tokio::spawn(poller_loop(
            Arc::clone(&self.inner),
            tx,
            shutdown.clone(),
        ));

        *self.run.lock().unwrap() = Some(RunState {
            shutdown,
            kill,
            poller,
            dispatcher,
        });

        info!(
            worker_id = %self.inner.worker_id,
            process_every_ms = config.process_every.as_millis() as u64,
            max_concurrency = config.max_concurrency,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop polling and dispatching, let in-flight handlers finish within the
    /// lock-lifetime grace, then force-abort stragglers. Idempotent.
    pub async fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
        let run = self.run.lock().unwrap().take();
        let Some(run) = run else { return };

        run.shutdown.cancel();

        let grace = self.inner.config.default_lock_lifetime;
        if !self.wait_for_idle_workers(grace).await {
            warn!("shutdown grace elapsed; aborting in-flight jobs");
            run.kill.cancel();
            // Aborted workers release their permits almost immediately.
            self.wait_for_idle_workers(Duration::from_secs(1)).await;
        }

        let _ = run.poller.await;
        let _ = run.dispatcher.await;

        self.inner.enqueued.lock().unwrap().clear();
        info!(worker_id = %self.inner.worker_id, "scheduler stopped");
    }

    /// Start, wait for ctrl-c, stop. A no-op when the scheduler is disabled
    /// by configuration.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        if !self.inner.config.enabled {
            info!("scheduler disabled by configuration");
            return Ok(());
        }

        self.start().await?;
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        self.stop().await;
        Ok(())
    }

    /// Begin building a job definition bound to this scheduler's store.
    pub fn create(&self, name: impl Into<String>) -> JobBuilder {
        JobBuilder::bound(self.inner.store.clone(), name)
    }

    /// Begin building a one-shot job at an absolute time.
    pub fn schedule(&self, name: impl Into<String>, at: DateTime<Utc>) -> JobBuilder {
        self.create(name).schedule(at)
    }

    /// Persist a recurring singleton on a schedule expression.
    pub async fn every(
        &self,
        name: impl Into<String>,
        interval: &str,
        data: Option<serde_json::Value>,
        options: RepeatOptions,
    ) -> Result<PersistResult> {
        let mut builder = self.create(name).single().repeat_every(interval, options)?;
        if let Some(data) = data {
            builder = builder.data(data);
        }
        builder.save().await
    }

    /// Persist a recurring singleton on a plain seconds interval.
    pub async fn every_secs(
        &self,
        name: impl Into<String>,
        seconds: i64,
        data: Option<serde_json::Value>,
        options: RepeatOptions,
    ) -> Result<PersistResult> {
        let mut builder = self
            .create(name)
            .single()
            .repeat_every_secs(seconds, options)?;
        if let Some(data) = data {
            builder = builder.data(data);
        }
        builder.save().await
    }

    /// Persist a job that runs as soon as the next poll sees it.
    pub async fn now(
        &self,
        name: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Result<PersistResult> {
        let mut builder = self.create(name).schedule(Utc::now());
        if let Some(data) = data {
            builder = builder.data(data);
        }
        builder.save().await
    }

    /// Disable or delete matching jobs.
    pub async fn cancel(&self, query: &CancelQuery, options: CancelOptions) -> Result<CancelOutcome> {
        match options.mode {
            CancelMode::Disable => {
                let modified = self
                    .inner
                    .store
                    .disable_by_query(query, options.limit)
                    .await?;
                Ok(CancelOutcome {
                    matched: modified,
                    modified,
                    deleted: 0,
                })
            }
            CancelMode::Delete => {
                let deleted = self
                    .inner
                    .store
                    .delete_by_query(query, options.limit)
                    .await?;
                Ok(CancelOutcome {
                    matched: deleted,
                    modified: 0,
                    deleted,
                })
            }
        }
    }

    /// Wait until every worker permit is back, up to `timeout`. Returns true
    /// when the pool drained in time.
    async fn wait_for_idle_workers(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.inner.global_permits.available_permits()
                >= self.inner.config.max_concurrency;
            if idle {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Inner {
    /// End of the next claim window.
    fn window_end(&self) -> DateTime<Utc> {
        let cursor = self.cursor.lock().unwrap().unwrap_or_else(Utc::now);
        cursor + chrono::Duration::milliseconds(self.config.process_every.as_millis() as i64)
    }

    fn advance_cursor(&self, window_end: DateTime<Utc>) {
        *self.cursor.lock().unwrap() = Some(window_end);
    }

    /// How many more jobs this node may lock right now. Counts both queued
    /// and running jobs against `lock_limit`; unbounded when the limit is 0.
    fn remaining_lock_budget(&self) -> i64 {
        if self.config.lock_limit == 0 {
            return i64::MAX;
        }
        let running = self.config.max_concurrency - self.global_permits.available_permits();
        let in_flight = self.enqueued.lock().unwrap().len() + running;
        self.config.lock_limit.saturating_sub(in_flight) as i64
    }

    /// One poll round: claim due jobs into the delay queue until the window
    /// is drained or the lock budget is spent. Returns true on backlog (the
    /// budget ran out), telling the poller to short-sleep on the refill
    /// signal instead of a full cadence.
    async fn poll_round(
        &self,
        window_end: DateTime<Utc>,
        tx: &mpsc::UnboundedSender<ScheduledJob>,
    ) -> Result<bool> {
        loop {
            let remaining = self.remaining_lock_budget();
            if remaining == 0 {
                return Ok(true);
            }

            let want = self.config.batch_size.min(remaining);
            if want <= 0 {
                return Ok(false);
            }

            let claimed = self
                .store
                .claim_due_jobs(
                    window_end,
                    want,
                    self.config.default_lock_lifetime,
                    &self.worker_id,
                )
                .await?;
            let got = claimed.len() as i64;

            for job in claimed {
                let fresh = self.enqueued.lock().unwrap().insert(job.id);
                if fresh {
                    debug!(job_id = %job.id, name = %job.name, next_run_at = ?job.next_run_at, "claimed job");
                    if tx.send(job).is_err() {
                        // Dispatcher is gone; the engine is shutting down.
                        return Ok(false);
                    }
                }
            }

            if got < want {
                return Ok(false);
            }
        }
    }

    fn name_semaphore(&self, name: &str) -> Arc<Semaphore> {
        let mut map = self.name_permits.lock().unwrap();
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.default_concurrency)))
            .clone()
    }
}

/// Single background flow that claims due work on a fixed cadence.
async fn poller_loop(
    inner: Arc<Inner>,
    tx: mpsc::UnboundedSender<ScheduledJob>,
    shutdown: CancellationToken,
) {
    let mut consecutive_failures: u32 = 0;
    debug!(worker_id = %inner.worker_id, "poller started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let window_end = inner.window_end();
        match inner.poll_round(window_end, &tx).await {
            Ok(backlog) => {
                consecutive_failures = 0;
                inner.advance_cursor(window_end);

                if backlog {
                    debug!("lock limit reached; waiting for worker completions");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = inner.refill.notified() => {}
                        _ = tokio::time::sleep(BACKLOG_WAIT) => {}
                    }
                } else {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(inner.config.process_every) => {}
                    }
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                error!(
                    error = %e,
                    consecutive_failures,
                    "poll round failed"
                );

                if consecutive_failures >= MAX_POLL_FAILURES {
                    error!("too many consecutive poll failures; stopping scheduler");
                    inner.started.store(false, Ordering::SeqCst);
                    shutdown.cancel();
                    break;
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_backoff(consecutive_failures)) => {}
                }
            }
        }
    }

    debug!("poller exited");
}

/// Single background flow that releases claimed jobs at their due time and
/// hands them to the worker pool under both permit caps.
async fn dispatcher_loop(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<ScheduledJob>,
    shutdown: CancellationToken,
    kill: CancellationToken,
) {
    let mut queue: DelayQueue<ScheduledJob> = DelayQueue::new();
    debug!("dispatcher started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Some(job) => {
                    let delay = job
                        .next_run_at
                        .and_then(|due| (due - Utc::now()).to_std().ok())
                        .unwrap_or(Duration::ZERO);
                    queue.insert(job, delay);
                }
                None => break,
            },
            Some(expired) = poll_fn(|cx| queue.poll_expired(cx)), if !queue.is_empty() => {
                let job = expired.into_inner();
                inner.enqueued.lock().unwrap().remove(&job.id);
                if !submit(&inner, job, &shutdown, &kill).await {
                    break;
                }
            }
        }
    }

    debug!("dispatcher exited");
}

/// Acquire both permits (backpressure happens here) and spawn the worker.
/// Returns false when shutdown preempted the submission.
async fn submit(
    inner: &Arc<Inner>,
    job: ScheduledJob,
    shutdown: &CancellationToken,
    kill: &CancellationToken,
) -> bool {
    let global = tokio::select! {
        _ = shutdown.cancelled() => return false,
        permit = Arc::clone(&inner.global_permits).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return false,
        },
    };

    let name_semaphore = inner.name_semaphore(&job.name);
    let name = tokio::select! {
        _ = shutdown.cancelled() => return false,
        permit = name_semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return false,
        },
    };

    let inner = Arc::clone(inner);
    let kill = kill.clone();
    tokio::spawn(run_job(inner, job, global, name, kill));
    true
}

/// One job execution, permits held for its whole duration.
async fn run_job(
    inner: Arc<Inner>,
    job: ScheduledJob,
    global: OwnedSemaphorePermit,
    name: OwnedSemaphorePermit,
    kill: CancellationToken,
) {
    let started_at = Utc::now();

    let outcome = tokio::select! {
        _ = kill.cancelled() => None,
        result = execute(&inner, &job) => Some(result),
    };

    match outcome {
        // Force-aborted: leave the row locked; lease expiry recovers it.
        None => warn!(job_id = %job.id, name = %job.name, "job aborted during shutdown"),
        Some(Ok(())) => finish_success(&inner, &job, started_at).await,
        Some(Err(error)) => finish_failure(&inner, &job, error).await,
    }

    drop(name);
    drop(global);
    inner.refill.notify_one();
}

async fn execute(inner: &Inner, job: &ScheduledJob) -> anyhow::Result<()> {
    let handler = inner.registry.get(&job.name)?;
    let payload = job.data.clone().unwrap_or(serde_json::Value::Null);
    debug!(job_id = %job.id, name = %job.name, "executing job");
    handler.execute(payload).await
}

async fn finish_success(inner: &Inner, job: &ScheduledJob, started_at: DateTime<Utc>) {
    let finished_at = Utc::now();
    let next_run_at = match interval::compute_next_run_at(
        job.repeat_interval.as_deref(),
        job.repeat_timezone.as_deref(),
        job.next_run_at,
        Some(finished_at),
    ) {
        Ok(next) => next,
        Err(error) => {
            error!(
                job_id = %job.id,
                name = %job.name,
                error = %error,
                "failed to compute next run; repeat disabled"
            );
            None
        }
    };

    if next_run_at.is_none() && inner.config.cleanup_finished_jobs {
        match inner.store.delete_by_id(job.id).await {
            Ok(_) => info!(job_id = %job.id, name = %job.name, "job succeeded; finished row removed"),
            Err(error) => {
                error!(job_id = %job.id, error = %error, "failed to clean up finished job")
            }
        }
        return;
    }

    match inner
        .store
        .mark_success(job.id, &inner.worker_id, started_at, finished_at, next_run_at)
        .await
    {
        Ok(true) => info!(job_id = %job.id, name = %job.name, next_run_at = ?next_run_at, "job succeeded"),
        Ok(false) => warn!(job_id = %job.id, name = %job.name, "lease lost before success was recorded"),
        Err(error) => error!(job_id = %job.id, error = %error, "failed to mark job as succeeded"),
    }
}

async fn finish_failure(inner: &Inner, job: &ScheduledJob, failure: anyhow::Error) {
    let failed_at = Utc::now();
    let attempt = job.fail_count.saturating_add(1) as u32;
    let max_retry_count = inner.config.max_retry_count;

    let next_run_at = if max_retry_count > 0 && attempt >= max_retry_count {
        warn!(job_id = %job.id, name = %job.name, attempt, "retries exhausted; job disabled");
        None
    } else {
        Some(failed_at + retry_delay(attempt))
    };

    warn!(
        job_id = %job.id,
        name = %job.name,
        attempt,
        error = %failure,
        "job failed"
    );

    match inner
        .store
        .mark_failure(job.id, &inner.worker_id, failed_at, next_run_at)
        .await
    {
        Ok(true) => {}
        Ok(false) => warn!(job_id = %job.id, name = %job.name, "lease lost before failure was recorded"),
        Err(error) => error!(job_id = %job.id, error = %error, "failed to mark job as failed"),
    }
}

/// Retry delay for the k-th failed attempt: 10 s doubling per attempt,
/// capped at 10 minutes. The exponent is clamped against overflow.
fn retry_delay(attempt: u32) -> chrono::Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let seconds = 10u64.saturating_mul(1u64 << exponent).min(600);
    chrono::Duration::seconds(seconds as i64)
}

/// Poller backoff for the n-th consecutive failure: 1 s doubling, capped at
/// one minute.
fn poll_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    Duration::from_secs((1u64 << exponent).min(60))
}

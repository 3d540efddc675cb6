//! PostgreSQL-backed persistence for scheduled jobs.
//!
//! All cross-node coordination happens through this table: claims are
//! single-row `FOR UPDATE SKIP LOCKED` find-and-updates, and the mark
//! operations are guarded by `locked_by` so a worker whose lease was stolen
//! cannot overwrite newer state.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::{JobSpec, JobType, PersistResult, ScheduledJob};

/// A required index on `scheduled_jobs`.
///
/// Creation is normally the operator's job (see `migrations/`); with
/// `ensure_indexes_on_startup` the engine runs the DDL itself at boot.
#[derive(Debug, Clone, Copy)]
pub struct IndexSpec {
    pub name: &'static str,
    pub ddl: &'static str,
}

/// The three indexes the claim scan and the upsert paths rely on.
pub const INDEXES: [IndexSpec; 3] = [
    IndexSpec {
        name: "idx_due_claim",
        ddl: "CREATE INDEX IF NOT EXISTS idx_due_claim \
              ON scheduled_jobs (next_run_at ASC, lock_until ASC, priority DESC)",
    },
    IndexSpec {
        name: "idx_name_unique_key",
        ddl: "CREATE INDEX IF NOT EXISTS idx_name_unique_key \
              ON scheduled_jobs (name ASC, unique_key ASC)",
    },
    IndexSpec {
        name: "ux_single_name",
        ddl: "CREATE UNIQUE INDEX IF NOT EXISTS ux_single_name \
              ON scheduled_jobs (name) WHERE job_type = 'single'",
    },
];

/// Selector for cancel operations. At least one field must be set.
#[derive(Debug, Clone, Default)]
pub struct CancelQuery {
    pub name: Option<String>,
    pub unique_key: Option<String>,
    /// Matched against the nested `unique_fields` document (containment).
    pub unique: Option<serde_json::Map<String, serde_json::Value>>,
}

impl CancelQuery {
    /// Select all jobs with the given name.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Narrow by dedup key.
    pub fn with_unique_key(mut self, unique_key: impl Into<String>) -> Self {
        self.unique_key = Some(unique_key.into());
        self
    }

    /// Narrow by nested unique-field values.
    pub fn with_unique(mut self, unique: serde_json::Map<String, serde_json::Value>) -> Self {
        self.unique = Some(unique);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.unique_key.is_none() && self.unique.is_none()
    }
}

/// Job queue health counters.
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    /// Rows with a `next_run_at`.
    pub scheduled: i64,
    /// Rows due now.
    pub due: i64,
    /// Rows under a live lease.
    pub locked: i64,
    /// Rows with at least one recorded failure.
    pub failing: i64,
}

/// Durable persistence over the `scheduled_jobs` table.
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Persist a job spec.
    ///
    /// A normal job without a `unique_key` is always inserted; repeated
    /// saves create duplicate rows by design. Everything else upserts on
    /// `{name, type}` (single) or `{name, type, unique_key}` (normal),
    /// overwriting every spec-derived column and NULLing optionals the spec
    /// leaves absent.
    pub async fn save(&self, spec: &JobSpec) -> Result<PersistResult> {
        if spec.name.trim().is_empty() {
            return Err(Error::invalid_argument("job name must not be blank"));
        }

        if spec.job_type == JobType::Normal && spec.unique_key.is_none() {
            return self.insert(spec).await.map(PersistResult::Created);
        }

        let unique_fields = spec.unique.clone().map(serde_json::Value::Object);

        let existing: Option<Uuid> = match spec.job_type {
            JobType::Single => {
                sqlx::query_scalar(
                    r#"
                    UPDATE scheduled_jobs
                    SET unique_key = $2,
                        unique_fields = $3,
                        next_run_at = $4,
                        repeat_interval = $5,
                        repeat_timezone = $6,
                        priority = $7,
                        data = $8,
                        updated_at = NOW()
                    WHERE name = $1 AND job_type = 'single'
                    RETURNING id
                    "#,
                )
                .bind(&spec.name)
                .bind(&spec.unique_key)
                .bind(&unique_fields)
                .bind(spec.next_run_at)
                .bind(&spec.repeat_interval)
                .bind(&spec.repeat_timezone)
                .bind(spec.priority)
                .bind(&spec.data)
                .fetch_optional(&self.pool)
                .await?
            }
            JobType::Normal => {
                sqlx::query_scalar(
                    r#"
                    UPDATE scheduled_jobs
                    SET unique_fields = $3,
                        next_run_at = $4,
                        repeat_interval = $5,
                        repeat_timezone = $6,
                        priority = $7,
                        data = $8,
                        updated_at = NOW()
                    WHERE name = $1 AND job_type = 'normal' AND unique_key = $2
                    RETURNING id
                    "#,
                )
                .bind(&spec.name)
                .bind(&spec.unique_key)
                .bind(&unique_fields)
                .bind(spec.next_run_at)
                .bind(&spec.repeat_interval)
                .bind(&spec.repeat_timezone)
                .bind(spec.priority)
                .bind(&spec.data)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match existing {
            Some(id) => Ok(PersistResult::Updated(id)),
            None => self.insert(spec).await.map(PersistResult::Created),
        }
    }

    async fn insert(&self, spec: &JobSpec) -> Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO scheduled_jobs (
                id, name, job_type, unique_key, unique_fields,
                next_run_at, repeat_interval, repeat_timezone, priority, data
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&spec.name)
        .bind(spec.job_type)
        .bind(&spec.unique_key)
        .bind(spec.unique.clone().map(serde_json::Value::Object))
        .bind(spec.next_run_at)
        .bind(&spec.repeat_interval)
        .bind(&spec.repeat_timezone)
        .bind(spec.priority)
        .bind(&spec.data)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Atomically claim up to `batch_size` due jobs for `worker_id`.
    ///
    /// Each iteration is an independent single-row find-and-update (CTE +
    /// `FOR UPDATE SKIP LOCKED`), so two concurrent callers never receive the
    /// same row and a higher-priority job released mid-loop is still
    /// observed. Stops early when no claimable row remains.
    pub async fn claim_due_jobs(
        &self,
        window_end: DateTime<Utc>,
        batch_size: i64,
        lock_lifetime: std::time::Duration,
        worker_id: &str,
    ) -> Result<Vec<ScheduledJob>> {
        if batch_size <= 0 {
            return Ok(Vec::new());
        }
        if lock_lifetime.is_zero() {
            return Err(Error::invalid_argument("lock lifetime must be positive"));
        }
        if worker_id.trim().is_empty() {
            return Err(Error::invalid_argument("worker id must not be blank"));
        }

        let lock_ms = lock_lifetime.as_millis().to_string();
        let mut claimed = Vec::new();

        for _ in 0..batch_size {
            let job = sqlx::query_as::<_, ScheduledJob>(
                r#"
                WITH due AS (
                    SELECT id
                    FROM scheduled_jobs
                    WHERE next_run_at IS NOT NULL
                      AND next_run_at <= $1
                      AND (lock_until IS NULL OR lock_until <= NOW())
                    ORDER BY next_run_at ASC, priority DESC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE scheduled_jobs
                SET locked_at = NOW(),
                    lock_until = NOW() + ($2 || ' milliseconds')::INTERVAL,
                    locked_by = $3,
                    updated_at = NOW()
                WHERE id IN (SELECT id FROM due)
                RETURNING id, name, job_type, unique_key, unique_fields,
                          next_run_at, repeat_interval, repeat_timezone, priority, data,
                          locked_at, lock_until, locked_by,
                          last_run_at, last_finished_at, fail_count, failed_at,
                          created_at, updated_at
                "#,
            )
            .bind(window_end)
            .bind(&lock_ms)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

            match job {
                Some(job) => claimed.push(job),
                None => break,
            }
        }

        Ok(claimed)
    }

    /// Record a successful run and schedule (or clear) the next one.
    ///
    /// Returns false when the lease was already stolen: the caller no longer
    /// owns the row and must not treat the miss as an error.
    pub async fn mark_success(
        &self,
        id: Uuid,
        worker_id: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET last_run_at = $3,
                last_finished_at = $4,
                next_run_at = $5,
                locked_at = NULL,
                lock_until = NULL,
                locked_by = NULL,
                fail_count = 0,
                failed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(started_at)
        .bind(finished_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a failed run: bump `fail_count`, stamp `failed_at`, release the
    /// lease, and set (or clear) the retry time. Same lease guard as
    /// [`JobStore::mark_success`].
    pub async fn mark_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        failed_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET fail_count = fail_count + 1,
                failed_at = $3,
                next_run_at = $4,
                locked_at = NULL,
                lock_until = NULL,
                locked_by = NULL,
                updated_at = NOW()
            WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(failed_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Disable up to `limit` matching jobs: clear the schedule and any lease,
    /// leaving the rows in place. Returns the modified count.
    pub async fn disable_by_query(&self, query: &CancelQuery, limit: i64) -> Result<u64> {
        let ids = self.select_cancel_ids(query, limit).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET next_run_at = NULL,
                repeat_interval = NULL,
                repeat_timezone = NULL,
                locked_at = NULL,
                lock_until = NULL,
                locked_by = NULL,
                updated_at = NOW()
            WHERE id = ANY($1)
            "#,
        )
        .bind(&ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete up to `limit` matching jobs. Returns the deleted count.
    pub async fn delete_by_query(&self, query: &CancelQuery, limit: i64) -> Result<u64> {
        let ids = self.select_cancel_ids(query, limit).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn select_cancel_ids(&self, query: &CancelQuery, limit: i64) -> Result<Vec<Uuid>> {
        if query.is_empty() {
            return Err(Error::invalid_argument(
                "cancel query requires at least one selector",
            ));
        }
        if limit <= 0 {
            return Err(Error::invalid_argument("cancel limit must be positive"));
        }

        let unique_fields = query.unique.clone().map(serde_json::Value::Object);

        let ids = sqlx::query_scalar(
            r#"
            SELECT id
            FROM scheduled_jobs
            WHERE ($1::TEXT IS NULL OR name = $1)
              AND ($2::TEXT IS NULL OR unique_key = $2)
              AND ($3::JSONB IS NULL OR unique_fields @> $3)
            ORDER BY next_run_at ASC NULLS LAST, priority DESC
            LIMIT $4
            "#,
        )
        .bind(&query.name)
        .bind(&query.unique_key)
        .bind(&unique_fields)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Find the singleton definition for a name, if any.
    pub async fn find_single_by_name(&self, name: &str) -> Result<Option<ScheduledJob>> {
        let job = sqlx::query_as::<_, ScheduledJob>(
            r#"
            SELECT id, name, job_type, unique_key, unique_fields,
                   next_run_at, repeat_interval, repeat_timezone, priority, data,
                   locked_at, lock_until, locked_by,
                   last_run_at, last_finished_at, fail_count, failed_at,
                   created_at, updated_at
            FROM scheduled_jobs
            WHERE name = $1 AND job_type = 'single'
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Find a normal job by its `(name, unique_key)` pair.
    pub async fn find_normal_by_name_and_unique_key(
        &self,
        name: &str,
        unique_key: &str,
    ) -> Result<Option<ScheduledJob>> {
        let job = sqlx::query_as::<_, ScheduledJob>(
            r#"
            SELECT id, name, job_type, unique_key, unique_fields,
                   next_run_at, repeat_interval, repeat_timezone, priority, data,
                   locked_at, lock_until, locked_by,
                   last_run_at, last_finished_at, fail_count, failed_at,
                   created_at, updated_at
            FROM scheduled_jobs
            WHERE name = $1 AND job_type = 'normal' AND unique_key = $2
            LIMIT 1
            "#,
        )
        .bind(name)
        .bind(unique_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ScheduledJob>> {
        let job = sqlx::query_as::<_, ScheduledJob>(
            r#"
            SELECT id, name, job_type, unique_key, unique_fields,
                   next_run_at, repeat_interval, repeat_timezone, priority, data,
                   locked_at, lock_until, locked_by,
                   last_run_at, last_finished_at, fail_count, failed_at,
                   created_at, updated_at
            FROM scheduled_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Delete one row. Returns false when it was already gone.
    pub async fn delete_by_id(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Queue health counters.
    pub async fn stats(&self) -> Result<StoreStats> {
        let (scheduled, due, locked, failing) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE next_run_at IS NOT NULL),
                COUNT(*) FILTER (WHERE next_run_at IS NOT NULL AND next_run_at <= NOW()),
                COUNT(*) FILTER (WHERE lock_until IS NOT NULL AND lock_until > NOW()),
                COUNT(*) FILTER (WHERE fail_count > 0)
            FROM scheduled_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            scheduled,
            due,
            locked,
            failing,
        })
    }

    /// Create the required indexes when the deployment opted into
    /// startup-managed DDL.
    pub async fn ensure_indexes(&self) -> Result<()> {
        for index in INDEXES {
            sqlx::query(index.ddl).execute(&self.pool).await?;
            tracing::debug!(index = index.name, "ensured index");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cancel_query_is_detected() {
        assert!(CancelQuery::default().is_empty());
        assert!(!CancelQuery::by_name("cleanup").is_empty());
        assert!(!CancelQuery::default().with_unique_key("k").is_empty());
    }

    #[test]
    fn cancel_query_builders_compose() {
        let mut unique = serde_json::Map::new();
        unique.insert("tenant".to_string(), serde_json::json!("acme"));

        let query = CancelQuery::by_name("cleanup")
            .with_unique_key("k1")
            .with_unique(unique);
        assert_eq!(query.name.as_deref(), Some("cleanup"));
        assert_eq!(query.unique_key.as_deref(), Some("k1"));
        assert!(query.unique.is_some());
    }

    #[test]
    fn index_specs_cover_claim_upsert_and_singleton() {
        let names: Vec<_> = INDEXES.iter().map(|i| i.name).collect();
        assert_eq!(
            names,
            vec!["idx_due_claim", "idx_name_unique_key", "ux_single_name"]
        );
        assert!(INDEXES[2].ddl.contains("UNIQUE"));
        assert!(INDEXES[2].ddl.contains("WHERE job_type = 'single'"));
    }
}

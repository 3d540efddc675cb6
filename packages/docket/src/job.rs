//! Job model: the in-memory spec and the persisted row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// How many definitions of a name may coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "scheduled_job_type", rename_all = "snake_case")]
pub enum JobType {
    /// Multiple rows per name allowed; deduplicated by optional `unique_key`.
    #[default]
    Normal,
    /// Name is unique across the collection (enforced by a partial unique index).
    Single,
}

/// Predefined priority levels. Higher runs first among simultaneously-due jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Priority {
    Highest,
    High,
    #[default]
    Normal,
    Low,
    Lowest,
}

impl Priority {
    /// Convert to the signed integer stored on the row.
    pub fn as_i32(&self) -> i32 {
        match self {
            Priority::Highest => 20,
            Priority::High => 10,
            Priority::Normal => 0,
            Priority::Low => -10,
            Priority::Lowest => -20,
        }
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority.as_i32()
    }
}

// ============================================================================
// JobSpec
// ============================================================================

/// An in-memory job definition, immutable once built.
///
/// Produced by [`crate::JobBuilder`] and persisted by
/// [`crate::JobStore::save`]. The payload is carried as a generic JSON value;
/// typed decoding happens at the handler boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Non-empty identifier; selects a handler.
    pub name: String,
    pub job_type: JobType,
    /// Opaque dedup key; paired with `name` for normal-job upsert.
    pub unique_key: Option<String>,
    /// Generic mapping written to the nested `unique_fields` column for
    /// index-based selection.
    pub unique: Option<serde_json::Map<String, serde_json::Value>>,
    /// Absence means "not scheduled".
    pub next_run_at: Option<DateTime<Utc>>,
    /// Schedule expression; see [`crate::interval`].
    pub repeat_interval: Option<String>,
    /// IANA zone id for schedule evaluation.
    pub repeat_timezone: Option<String>,
    /// Higher runs first among simultaneously-due jobs. Default 0.
    pub priority: i32,
    pub data: Option<serde_json::Value>,
}

// ============================================================================
// ScheduledJob
// ============================================================================

/// A persisted job row from the `scheduled_jobs` table.
///
/// Superset of [`JobSpec`]: lease fields (`locked_at`, `lock_until`,
/// `locked_by`) are all NULL whenever the row is unlocked, and the failure
/// fields (`fail_count`, `failed_at`) are reset on every success.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,

    // Identity
    pub name: String,
    pub job_type: JobType,
    pub unique_key: Option<String>,
    pub unique_fields: Option<serde_json::Value>,

    // Scheduling
    pub next_run_at: Option<DateTime<Utc>>,
    pub repeat_interval: Option<String>,
    pub repeat_timezone: Option<String>,
    pub priority: i32,

    // Payload
    pub data: Option<serde_json::Value>,

    // Lease
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,

    // Execution history
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub fail_count: i32,
    pub failed_at: Option<DateTime<Utc>>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// A job is due at `t` when it has a `next_run_at` at or before `t`.
    pub fn is_due(&self, t: DateTime<Utc>) -> bool {
        matches!(self.next_run_at, Some(next) if next <= t)
    }

    /// A job is claimable at `t` when it is due and its lease (if any) has expired.
    pub fn is_claimable(&self, t: DateTime<Utc>) -> bool {
        self.is_due(t) && self.lock_until.map_or(true, |until| until <= t)
    }

    /// Whether the row currently carries a lease.
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// Reverse mapping back to the in-memory spec.
    ///
    /// Preserves all spec fields; the payload stays a generic JSON value
    /// (handlers decode it into their declared shape).
    pub fn to_spec(&self) -> JobSpec {
        let unique = self.unique_fields.as_ref().and_then(|value| match value {
            serde_json::Value::Object(map) => Some(map.clone()),
            _ => None,
        });

        JobSpec {
            name: self.name.clone(),
            job_type: self.job_type,
            unique_key: self.unique_key.clone(),
            unique,
            next_run_at: self.next_run_at,
            repeat_interval: self.repeat_interval.clone(),
            repeat_timezone: self.repeat_timezone.clone(),
            priority: self.priority,
            data: self.data.clone(),
        }
    }
}

// ============================================================================
// PersistResult
// ============================================================================

/// Result of a save operation, distinguishing insert from upsert-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistResult {
    /// A new row was inserted.
    Created(Uuid),
    /// An existing row was updated in place.
    Updated(Uuid),
}

impl PersistResult {
    /// Get the job id regardless of outcome.
    pub fn job_id(&self) -> Uuid {
        match self {
            PersistResult::Created(id) | PersistResult::Updated(id) => *id,
        }
    }

    /// Returns true if this save inserted a new row.
    pub fn is_created(&self) -> bool {
        matches!(self, PersistResult::Created(_))
    }
}

//! Fluent construction of job specs.
//!
//! A builder obtained from [`crate::Scheduler::create`] is bound to the
//! scheduler's store and can persist directly with [`JobBuilder::save`];
//! [`JobBuilder::new`] produces a detached builder for `build()`-only use.
//!
//! An absolute `schedule()` pins the first run: the repeat methods seed
//! `next_run_at` only while it is unset.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};
use crate::interval::{self, Interval};
use crate::job::{JobSpec, JobType, PersistResult};
use crate::store::JobStore;

/// Options for the repeat methods.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepeatOptions {
    /// When false (the default), an unscheduled job is seeded to run on the
    /// first poll; when true, the first run waits one full interval.
    pub skip_immediate: bool,
}

impl RepeatOptions {
    pub fn skip_immediate() -> Self {
        Self {
            skip_immediate: true,
        }
    }
}

/// Fluent assembly of a [`JobSpec`].
#[derive(Clone)]
pub struct JobBuilder {
    store: Option<JobStore>,
    name: String,
    job_type: JobType,
    unique_key: Option<String>,
    unique: Option<serde_json::Map<String, serde_json::Value>>,
    next_run_at: Option<DateTime<Utc>>,
    repeat_interval: Option<String>,
    repeat_timezone: Option<String>,
    priority: i32,
    data: Option<serde_json::Value>,
}

impl JobBuilder {
    /// A detached builder; `save()` requires one bound via
    /// [`crate::Scheduler::create`].
    pub fn new(name: impl Into<String>) -> Self {
        Self::detached(None, name)
    }

    pub(crate) fn bound(store: JobStore, name: impl Into<String>) -> Self {
        Self::detached(Some(store), name)
    }

    fn detached(store: Option<JobStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            job_type: JobType::Normal,
            unique_key: None,
            unique: None,
            next_run_at: None,
            repeat_interval: None,
            repeat_timezone: None,
            priority: 0,
            data: None,
        }
    }

    /// Set the payload stored with the job.
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Schedule an absolute first run. Once set, the repeat methods will not
    /// override it.
    pub fn schedule(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    /// Repeat daily at a fixed wall-clock time (`"HH:mm"` or `"HH:mm:ss"`).
    ///
    /// Seeds `next_run_at` with the next occurrence in the effective zone
    /// when no first run is scheduled yet; if today's time has already
    /// passed, that is tomorrow.
    pub fn repeat_at(mut self, time_of_day: &str) -> Result<Self> {
        let parsed = interval::parse_time_of_day(time_of_day)?;
        self.repeat_interval = Some(format!("AT {}", time_of_day.trim()));

        if self.next_run_at.is_none() {
            self.next_run_at = Some(Interval::DailyAt(parsed).next_after(Utc::now(), self.tz())?);
        }
        Ok(self)
    }

    /// Repeat on a schedule expression (any form the interval parser accepts).
    ///
    /// Seeds `next_run_at` when no first run is scheduled: immediately by
    /// default, or one interval out with `skip_immediate`.
    pub fn repeat_every(mut self, spec: &str, options: RepeatOptions) -> Result<Self> {
        let parsed = Interval::parse(spec)?;
        self.repeat_interval = Some(spec.trim().to_string());

        if self.next_run_at.is_none() {
            let now = Utc::now();
            self.next_run_at = Some(if options.skip_immediate {
                parsed.next_after(now, self.tz())?
            } else {
                now
            });
        }
        Ok(self)
    }

    /// Repeat every `seconds` seconds. The count must be a positive integer.
    ///
    /// The interval is persisted in its string form, so the reschedule path
    /// goes through the parser's numeric branch like any other expression.
    pub fn repeat_every_secs(self, seconds: i64, options: RepeatOptions) -> Result<Self> {
        if seconds <= 0 {
            return Err(Error::invalid_argument(format!(
                "repeat interval must be a positive number of seconds: {seconds}"
            )));
        }
        self.repeat_every(&seconds.to_string(), options)
    }

    /// Set the IANA zone used to evaluate the schedule.
    pub fn timezone(mut self, zone: &str) -> Result<Self> {
        zone.parse::<Tz>()
            .map_err(|_| Error::invalid_argument(format!("invalid timezone: {zone}")))?;
        self.repeat_timezone = Some(zone.to_string());
        Ok(self)
    }

    /// Set the priority; higher runs first among simultaneously-due jobs.
    /// Accepts [`crate::Priority`] or a raw integer.
    pub fn priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Make this the one scheduled definition for its name. Clears any
    /// dedup fields.
    pub fn single(mut self) -> Self {
        self.job_type = JobType::Single;
        self.unique_key = None;
        self.unique = None;
        self
    }

    /// Deduplicate normal jobs by `(name, unique_key)`.
    pub fn unique_key(mut self, unique_key: impl Into<String>) -> Self {
        self.job_type = JobType::Normal;
        self.unique_key = Some(unique_key.into());
        self
    }

    /// Attach a generic mapping for index-based selection.
    pub fn unique(mut self, unique: serde_json::Map<String, serde_json::Value>) -> Self {
        self.unique = Some(unique);
        self
    }

    /// Build the immutable spec.
    pub fn build(self) -> Result<JobSpec> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_argument("job name must not be blank"));
        }

        Ok(JobSpec {
            name: self.name,
            job_type: self.job_type,
            unique_key: self.unique_key,
            unique: self.unique,
            next_run_at: self.next_run_at,
            repeat_interval: self.repeat_interval,
            repeat_timezone: self.repeat_timezone,
            priority: self.priority,
            data: self.data,
        })
    }

    /// Build and persist.
    pub async fn save(self) -> Result<PersistResult> {
        let store = self.store.clone().ok_or_else(|| {
            Error::invalid_argument("builder is not bound to a store; use Scheduler::create")
        })?;
        store.save(&self.build()?).await
    }

    fn tz(&self) -> Tz {
        interval::resolve_timezone(self.repeat_timezone.as_deref())
    }
}

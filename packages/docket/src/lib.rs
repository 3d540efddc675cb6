//! # Docket
//!
//! A distributed, persistent job scheduler: job definitions live in a
//! PostgreSQL table, and every node polls for due work, claims it atomically
//! under a lease, runs it on a bounded worker pool, and records the outcome,
//! rescheduling recurring jobs.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!     │
//!     ▼ create("send-digest").repeat_every("1 day").save()
//! JobStore ──────────────── scheduled_jobs (PostgreSQL)
//!                                 ▲
//!          claim (SKIP LOCKED)    │    mark success / failure
//!                                 │
//! Scheduler (per node)            │
//!     ├─► Poller ─────────────────┤   claims due jobs into a delay queue
//!     ├─► Dispatcher              │   releases them at their due time
//!     └─► Worker pool ────────────┘   bounded by global + per-name permits
//!             │
//!             └─► HandlerRegistry.get(name).execute(payload)
//! ```
//!
//! ## Guarantees
//!
//! - **At-most-one concurrent execution per job**: claims are atomic
//!   single-row find-and-updates; only the lease holder may finalize a run,
//!   and stale write-backs are rejected.
//! - **At-least-one eventual completion**: a crashed or aborted worker leaves
//!   its row locked only until `lock_until`; any node reclaims it after.
//! - **No unbounded queues**: backpressure is expressed by blocking permit
//!   acquisition plus the refill signal that wakes a backlogged poller.
//!
//! Not provided: leader election, exactly-once execution, cross-node ordering
//! beyond priority, or transactions spanning handler side effects and
//! scheduler state.
//!
//! ## Example
//!
//! ```ignore
//! use docket::{FnHandler, HandlerRegistry, Scheduler, SchedulerConfig};
//!
//! #[derive(serde::Deserialize)]
//! struct DigestPayload { member_id: uuid::Uuid }
//!
//! let registry = HandlerRegistry::new([
//!     FnHandler::new("send-digest", |payload: DigestPayload| async move {
//!         send_digest(payload.member_id).await
//!     }),
//! ])?;
//!
//! let scheduler = Scheduler::new(pool, registry, SchedulerConfig::from_env());
//! scheduler
//!     .create("send-digest")
//!     .repeat_at("09:00")?
//!     .timezone("America/Chicago")?
//!     .single()
//!     .save()
//!     .await?;
//!
//! scheduler.run_until_shutdown().await?;
//! ```

pub mod builder;
pub mod config;
pub mod engine;
pub mod error;
pub mod interval;
pub mod job;
pub mod registry;
pub mod store;

pub use builder::{JobBuilder, RepeatOptions};
pub use config::{generate_worker_id, SchedulerConfig};
pub use engine::{CancelMode, CancelOptions, CancelOutcome, Scheduler};
pub use error::{Error, Result};
pub use interval::{compute_next_run_at, Interval};
pub use job::{JobSpec, JobType, PersistResult, Priority, ScheduledJob};
pub use registry::{FnHandler, HandlerRegistry, JobHandler};
pub use store::{CancelQuery, IndexSpec, JobStore, StoreStats, INDEXES};

// Handlers are written against these directly.
pub use async_trait::async_trait;

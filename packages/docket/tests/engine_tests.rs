//! End-to-end scheduler tests: execute, retry, recurrence, concurrency caps,
//! and the cancel facade.

mod common;

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as Delta, Utc};
use docket::{
    CancelOptions, CancelQuery, Error, FnHandler, HandlerRegistry, JobHandler, RepeatOptions,
    Scheduler, SchedulerConfig,
};
use sqlx::PgPool;

use common::{test_pool, wait_until};

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        worker_id: "test-node".to_string(),
        process_every: Duration::from_millis(200),
        default_lock_lifetime: Duration::from_secs(10),
        batch_size: 10,
        ..Default::default()
    }
}

fn counting_handler(name: &str, calls: Arc<AtomicU32>) -> Arc<dyn JobHandler> {
    FnHandler::new(name, move |_payload: serde_json::Value| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

fn failing_handler(name: &str, calls: Arc<AtomicU32>) -> Arc<dyn JobHandler> {
    FnHandler::new(name, move |_payload: serde_json::Value| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("simulated handler failure"))
        }
    })
}

async fn fetch_state(
    pool: &PgPool,
    name: &str,
) -> Result<Option<(i32, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>> {
    let row = sqlx::query_as(
        "SELECT fail_count, next_run_at, failed_at FROM scheduled_jobs WHERE name = $1 LIMIT 1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

async fn count_by_name(pool: &PgPool, name: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_jobs WHERE name = $1")
        .bind(name)
        .fetch_one(pool)
        .await
        .unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread")]
async fn now_job_executes_and_is_cleaned_up() -> Result<()> {
    let pool = test_pool().await?;
    let calls = Arc::new(AtomicU32::new(0));
    let registry = HandlerRegistry::new([counting_handler("ping", calls.clone())])?;
    let scheduler = Scheduler::new(pool.clone(), registry, test_config());

    scheduler
        .now("ping", Some(serde_json::json!({"id": "A1"})))
        .await?;
    scheduler.start().await?;

    let calls_seen = calls.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let calls = calls_seen.clone();
            async move { calls.load(Ordering::SeqCst) >= 1 }
        })
        .await,
        "handler never ran"
    );

    // One-shot success with cleanup enabled removes the row.
    let pool_seen = pool.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let pool = pool_seen.clone();
            async move { count_by_name(&pool, "ping").await == 0 }
        })
        .await,
        "finished row was not cleaned up"
    );

    scheduler.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_job_is_rescheduled_with_retry_delay() -> Result<()> {
    let pool = test_pool().await?;
    let calls = Arc::new(AtomicU32::new(0));
    let registry = HandlerRegistry::new([failing_handler("failing-job", calls.clone())])?;
    let scheduler = Scheduler::new(pool.clone(), registry, test_config());

    scheduler
        .now("failing-job", Some(serde_json::json!({"id": "A1"})))
        .await?;
    scheduler.start().await?;

    let pool_seen = pool.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let pool = pool_seen.clone();
            async move {
                matches!(
                    fetch_state(&pool, "failing-job").await,
                    Ok(Some((fail_count, _, _))) if fail_count >= 1
                )
            }
        })
        .await,
        "failure was never recorded"
    );

    let (fail_count, next_run_at, failed_at) =
        fetch_state(&pool, "failing-job").await?.unwrap();
    assert!(fail_count >= 1);
    let failed_at = failed_at.expect("failed_at must be stamped");
    let next_run_at = next_run_at.expect("job must be rescheduled");
    // First retry waits at least the 10 s base delay.
    assert!(next_run_at >= failed_at + Delta::seconds(10));

    scheduler.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_disable_the_job() -> Result<()> {
    let pool = test_pool().await?;
    let calls = Arc::new(AtomicU32::new(0));
    let registry = HandlerRegistry::new([failing_handler("doomed", calls.clone())])?;
    let config = SchedulerConfig {
        max_retry_count: 1,
        ..test_config()
    };
    let scheduler = Scheduler::new(pool.clone(), registry, config);

    scheduler.now("doomed", None).await?;
    scheduler.start().await?;

    let pool_seen = pool.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let pool = pool_seen.clone();
            async move {
                matches!(
                    fetch_state(&pool, "doomed").await,
                    Ok(Some((fail_count, next_run_at, _)))
                        if fail_count == 1 && next_run_at.is_none()
                )
            }
        })
        .await,
        "job was not disabled after exhausting retries"
    );

    // Disabled means no more runs.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    scheduler.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn recurring_job_reschedules_after_each_run() -> Result<()> {
    let pool = test_pool().await?;
    let calls = Arc::new(AtomicU32::new(0));
    let registry = HandlerRegistry::new([counting_handler("tick", calls.clone())])?;
    let scheduler = Scheduler::new(pool.clone(), registry, test_config());

    scheduler
        .every_secs("tick", 1, None, RepeatOptions::default())
        .await?;
    scheduler.start().await?;

    let calls_seen = calls.clone();
    assert!(
        wait_until(Duration::from_secs(15), || {
            let calls = calls_seen.clone();
            async move { calls.load(Ordering::SeqCst) >= 2 }
        })
        .await,
        "recurring job did not run twice"
    );

    // The definition row survives between runs.
    assert_eq!(count_by_name(&pool, "tick").await, 1);

    scheduler.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_handler_is_a_retryable_failure() -> Result<()> {
    let pool = test_pool().await?;
    let registry = HandlerRegistry::new([])?;
    let scheduler = Scheduler::new(pool.clone(), registry, test_config());

    scheduler.now("ghost", None).await?;
    scheduler.start().await?;

    let pool_seen = pool.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let pool = pool_seen.clone();
            async move {
                matches!(
                    fetch_state(&pool, "ghost").await,
                    Ok(Some((fail_count, next_run_at, _)))
                        if fail_count >= 1 && next_run_at.is_some()
                )
            }
        })
        .await,
        "missing handler did not mark a failure"
    );

    scheduler.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn per_name_concurrency_is_bounded() -> Result<()> {
    let pool = test_pool().await?;
    let active = Arc::new(AtomicI32::new(0));
    let peak = Arc::new(AtomicI32::new(0));
    let done = Arc::new(AtomicU32::new(0));

    let (active_seen, peak_seen, done_seen) = (active.clone(), peak.clone(), done.clone());
    let handler = FnHandler::new("serialized", move |_payload: serde_json::Value| {
        let active = active_seen.clone();
        let peak = peak_seen.clone();
        let done = done_seen.clone();
        async move {
            let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now_active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let registry = HandlerRegistry::new([handler])?;
    let config = SchedulerConfig {
        default_concurrency: 1,
        ..test_config()
    };
    let scheduler = Scheduler::new(pool.clone(), registry, config);

    scheduler.now("serialized", None).await?;
    scheduler.now("serialized", None).await?;
    scheduler.start().await?;

    let done_seen = done.clone();
    assert!(
        wait_until(Duration::from_secs(15), || {
            let done = done_seen.clone();
            async move { done.load(Ordering::SeqCst) >= 2 }
        })
        .await,
        "both runs should eventually complete"
    );
    assert_eq!(peak.load(Ordering::SeqCst), 1, "runs of one name overlapped");

    scheduler.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn lock_limit_backlog_still_drains() -> Result<()> {
    let pool = test_pool().await?;
    let calls = Arc::new(AtomicU32::new(0));
    let registry = HandlerRegistry::new([counting_handler("burst", calls.clone())])?;
    let config = SchedulerConfig {
        lock_limit: 1,
        ..test_config()
    };
    let scheduler = Scheduler::new(pool.clone(), registry, config);

    for _ in 0..3 {
        scheduler.now("burst", None).await?;
    }
    scheduler.start().await?;

    let calls_seen = calls.clone();
    assert!(
        wait_until(Duration::from_secs(15), || {
            let calls = calls_seen.clone();
            async move { calls.load(Ordering::SeqCst) >= 3 }
        })
        .await,
        "backlogged jobs did not drain"
    );

    scheduler.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn start_and_stop_are_idempotent_and_restartable() -> Result<()> {
    let pool = test_pool().await?;
    let calls = Arc::new(AtomicU32::new(0));
    let registry = HandlerRegistry::new([counting_handler("ping", calls.clone())])?;
    let scheduler = Scheduler::new(pool.clone(), registry, test_config());

    scheduler.start().await?;
    scheduler.start().await?;
    assert!(scheduler.is_started());

    scheduler.stop().await;
    scheduler.stop().await;
    assert!(!scheduler.is_started());

    // A stopped scheduler can be started again.
    scheduler.start().await?;
    scheduler.now("ping", None).await?;

    let calls_seen = calls.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let calls = calls_seen.clone();
            async move { calls.load(Ordering::SeqCst) >= 1 }
        })
        .await,
        "restarted scheduler did not execute"
    );

    scheduler.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_facade_reports_matched_counts() -> Result<()> {
    let pool = test_pool().await?;
    let registry = HandlerRegistry::new([])?;
    let scheduler = Scheduler::new(pool.clone(), registry, test_config());

    scheduler
        .schedule("cleanup", Utc::now() + Delta::seconds(30))
        .save()
        .await?;

    let outcome = scheduler
        .cancel(&CancelQuery::by_name("cleanup"), CancelOptions::disable(10))
        .await?;
    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.modified, 1);
    assert_eq!(outcome.deleted, 0);

    let outcome = scheduler
        .cancel(&CancelQuery::by_name("cleanup"), CancelOptions::delete(10))
        .await?;
    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.deleted, 1);
    assert_eq!(count_by_name(&pool, "cleanup").await, 0);

    let empty = scheduler
        .cancel(&CancelQuery::default(), CancelOptions::default())
        .await;
    assert!(matches!(empty, Err(Error::InvalidArgument(_))));
    Ok(())
}

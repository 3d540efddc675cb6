//! Test harness with a shared Postgres testcontainer.
//!
//! The container is started once on the first test and reused for the whole
//! run; each test gets its own freshly-migrated database so tests stay
//! independent.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct SharedPostgres {
    base_url: String,
    // Keep the container alive for the entire test run
    _container: ContainerAsync<Postgres>,
}

static SHARED: OnceCell<SharedPostgres> = OnceCell::const_new();

async fn shared() -> &'static SharedPostgres {
    SHARED
        .get_or_init(|| async {
            // Respect RUST_LOG; try_init avoids panicking when another test
            // file got here first.
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();

            let container = Postgres::default()
                .start()
                .await
                .expect("failed to start Postgres container");

            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");

            SharedPostgres {
                base_url: format!("postgresql://postgres:postgres@{}:{}", host, port),
                _container: container,
            }
        })
        .await
}

/// A pool onto a fresh database with migrations applied.
pub async fn test_pool() -> Result<PgPool> {
    let infra = shared().await;

    let db_name = format!("docket_test_{}", Uuid::new_v4().simple());
    let admin = PgPool::connect(&format!("{}/postgres", infra.base_url))
        .await
        .context("failed to connect for database creation")?;
    sqlx::query(&format!(r#"CREATE DATABASE "{}""#, db_name))
        .execute(&admin)
        .await
        .context("failed to create test database")?;
    admin.close().await;

    let pool = PgPool::connect(&format!("{}/{}", infra.base_url, db_name))
        .await
        .context("failed to connect to test database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    Ok(pool)
}

/// Poll `condition` until it holds or `timeout` elapses.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

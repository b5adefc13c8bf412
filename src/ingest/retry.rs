//! Savepoint-scoped retries for lock contention during ingestion.

use futures::future::BoxFuture;
use sqlx::{Connection, PgConnection, Postgres, Transaction};
use std::time::Duration;

use crate::config::env_or;

/// deadlock_detected, lock_not_available, serialization_failure
const TRANSIENT_SQLSTATES: &[&str] = &["40P01", "55P03", "40001"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_or("INGEST_MAX_RETRIES", defaults.max_retries),
            base_delay: Duration::from_millis(env_or("INGEST_BASE_BACKOFF_MS", 100)),
            max_delay: Duration::from_millis(env_or("INGEST_MAX_BACKOFF_MS", 2000)),
        }
    }

    /// Exponential delay for `attempt` (0-based) plus up to 50% jitter, capped.
    pub fn delay(&self, attempt: u32, jitter: f64) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let jitter = exponential.mul_f64(jitter.clamp(0.0, 1.0) * 0.5);
        exponential.saturating_add(jitter).min(self.max_delay)
    }
}

pub fn is_transient_code(code: &str) -> bool {
    TRANSIENT_SQLSTATES.contains(&code)
}

pub fn is_transient(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| is_transient_code(&code))
}

/// Run `op` inside a savepoint of `tx`, retrying transient failures.
///
/// A failed attempt rolls back to the savepoint so the outer transaction stays
/// usable. Non-transient errors, or running out of retries, propagate.
pub async fn run_in_savepoint<T, F>(
    tx: &mut Transaction<'_, Postgres>,
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, sqlx::Error>
where
    F: FnMut(&mut PgConnection) -> BoxFuture<'_, Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    loop {
        let mut savepoint = Connection::begin(&mut **tx).await?;
        match op(&mut *savepoint).await {
            Ok(value) => {
                savepoint.commit().await?;
                return Ok(value);
            }
            Err(e) => {
                savepoint.rollback().await?;
                if !is_transient(&e) || attempt >= policy.max_retries {
                    return Err(e);
                }
                let delay = policy.delay(attempt, rand::random::<f64>());
                attempt += 1;
                tracing::warn!(
                    batch = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient database error, retrying batch"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retries() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn raise(sqlstate: &str) -> String {
        format!("DO $$ BEGIN RAISE EXCEPTION 'forced failure' USING ERRCODE = '{sqlstate}'; END $$")
    }

    #[tokio::test]
    async fn test_savepoint_retries_deadlock_once() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let mut tx = pool.begin().await.unwrap();
        let calls = AtomicU32::new(0);

        let value = run_in_savepoint(&mut tx, &fast_retries(), "deadlock", |conn| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if attempt == 0 {
                    sqlx::query(&raise("40P01")).execute(&mut *conn).await?;
                }
                sqlx::query_scalar::<_, i32>("SELECT 7").fetch_one(&mut *conn).await
            })
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_savepoint_gives_up_on_permanent_errors() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let mut tx = pool.begin().await.unwrap();
        let calls = AtomicU32::new(0);

        let err = run_in_savepoint(&mut tx, &fast_retries(), "unique", |conn| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                sqlx::query(&raise("23505"))
                    .execute(&mut *conn)
                    .await
                    .map(|_| ())
            })
        })
        .await
        .unwrap_err();

        assert!(!is_transient(&err));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The outer transaction is still usable after the savepoint rollback.
        let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&mut *tx).await.unwrap();
        assert_eq!(one, 1);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_savepoint_stops_after_max_retries() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let mut tx = pool.begin().await.unwrap();
        let calls = AtomicU32::new(0);

        let err = run_in_savepoint(&mut tx, &fast_retries(), "lock", |conn| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                sqlx::query(&raise("55P03"))
                    .execute(&mut *conn)
                    .await
                    .map(|_| ())
            })
        })
        .await
        .unwrap_err();

        assert!(is_transient(&err));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        tx.rollback().await.unwrap();
    }

    #[test]
    fn test_transient_codes() {
        assert!(is_transient_code("40P01"));
        assert!(is_transient_code("55P03"));
        assert!(is_transient_code("40001"));
        assert!(!is_transient_code("23505"));
    }

    #[test]
    fn test_non_database_errors_are_not_transient() {
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0, 0.0), Duration::from_millis(100));
        assert_eq!(policy.delay(1, 0.0), Duration::from_millis(200));
        assert_eq!(policy.delay(2, 1.0), Duration::from_millis(600));
        assert_eq!(policy.delay(10, 0.0), Duration::from_millis(2000));
        assert_eq!(policy.delay(u32::MAX, 1.0), Duration::from_millis(2000));
    }
}

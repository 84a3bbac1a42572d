//! SQLite-backed job queue
//!
//! Jobs live in the `jobs` table. A claim is one `UPDATE ... RETURNING` on the
//! oldest due row, so two workers can never lease the same job. A lease that
//! runs out (worker crashed) makes the job claimable again, which is where the
//! at-least-once guarantee comes from.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use marquee_common::{time, Result};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ClaimedJob, FailOutcome, JobPayload, JobQueue, QueueCounts};
use crate::db::parse_uuid;
use crate::models::ImportParameters;

pub struct SqliteJobQueue {
    pool: SqlitePool,
    max_attempts: u32,
    backoff_base_ms: u64,
    max_backoff_ms: u64,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool, params: &ImportParameters) -> Self {
        Self {
            pool,
            max_attempts: params.max_attempts.max(1),
            backoff_base_ms: params.backoff_base_ms,
            max_backoff_ms: params.max_backoff_ms,
        }
    }
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay = base_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay.min(max_ms))
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, payload: &JobPayload, dedupe_key: Option<&str>) -> Result<bool> {
        let now = time::now_db();
        let body = serde_json::to_string(payload)?;

        // A finished job with the same key is re-armed; a queued one absorbs the
        // request. A running one is re-armed too so the work runs once more
        // after the current delivery.
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, queue, dedupe_key, payload, status, attempts, max_attempts,
                run_after, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 'queued', 0, ?, ?, ?, ?)
            ON CONFLICT(dedupe_key) DO UPDATE SET
                status = 'queued',
                payload = excluded.payload,
                attempts = 0,
                run_after = excluded.run_after,
                leased_until = NULL,
                last_error = NULL,
                updated_at = excluded.updated_at
            WHERE jobs.status IN ('done', 'dead', 'running')
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(payload.queue())
        .bind(dedupe_key)
        .bind(&body)
        .bind(self.max_attempts)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let queued = result.rows_affected() == 1;
        debug!(queue = payload.queue(), dedupe_key, queued, "Enqueue");
        Ok(queued)
    }

    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<ClaimedJob>> {
        loop {
            let now = time::now();
            let now_db = time::to_db(now);
            let leased_until = time::to_db(
                now + ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::seconds(300)),
            );

            let row = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'running', attempts = attempts + 1, leased_until = ?, updated_at = ?
                WHERE job_id = (
                    SELECT job_id FROM jobs
                    WHERE queue = ?
                      AND ((status = 'queued' AND run_after <= ?)
                           OR (status = 'running' AND leased_until < ?))
                    ORDER BY run_after, created_at
                    LIMIT 1
                )
                RETURNING job_id, queue, payload, attempts, max_attempts
                "#,
            )
            .bind(&leased_until)
            .bind(&now_db)
            .bind(queue)
            .bind(&now_db)
            .bind(&now_db)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let job_id = parse_uuid(row.get("job_id"))?;
            let body: String = row.get("payload");

            match serde_json::from_str::<JobPayload>(&body) {
                Ok(payload) => {
                    return Ok(Some(ClaimedJob {
                        job_id,
                        queue: row.get("queue"),
                        payload,
                        attempts: row.get::<i64, _>("attempts").max(0) as u32,
                        max_attempts: row.get::<i64, _>("max_attempts").max(0) as u32,
                    }))
                }
                Err(e) => {
                    // Unreadable payloads can never succeed
                    warn!(job_id = %job_id, queue, error = %e, "Dropping job with unreadable payload");
                    sqlx::query(
                        "UPDATE jobs SET status = 'dead', last_error = ?, leased_until = NULL, updated_at = ? WHERE job_id = ?",
                    )
                    .bind(format!("unreadable payload: {}", e))
                    .bind(time::now_db())
                    .bind(job_id.to_string())
                    .execute(&self.pool)
                    .await?;
                }
            }
        }
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'done', leased_until = NULL, last_error = NULL, updated_at = ?
            WHERE job_id = ? AND status = 'running'
            "#,
        )
        .bind(time::now_db())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<FailOutcome> {
        let now = time::now();
        let mut tx = self.pool.begin().await?;

        // Write first: takes the write lock before reading the attempt count
        let touched = sqlx::query("UPDATE jobs SET last_error = ?, updated_at = ? WHERE job_id = ? AND status = 'running'")
            .bind(error)
            .bind(time::to_db(now))
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;

        if touched.rows_affected() == 0 {
            // Re-armed by a newer enqueue while this delivery ran
            tx.rollback().await?;
            return Ok(FailOutcome::Retrying { run_after: now });
        }

        let (attempts, max_attempts): (i64, i64) =
            sqlx::query_as("SELECT attempts, max_attempts FROM jobs WHERE job_id = ?")
                .bind(job_id.to_string())
                .fetch_one(&mut *tx)
                .await?;

        let outcome = if attempts >= max_attempts {
            sqlx::query("UPDATE jobs SET status = 'dead', leased_until = NULL WHERE job_id = ?")
                .bind(job_id.to_string())
                .execute(&mut *tx)
                .await?;
            FailOutcome::Exhausted
        } else {
            let delay = backoff_delay(attempts.max(1) as u32, self.backoff_base_ms, self.max_backoff_ms);
            let run_after = now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
            sqlx::query(
                "UPDATE jobs SET status = 'queued', run_after = ?, leased_until = NULL WHERE job_id = ?",
            )
            .bind(time::to_db(run_after))
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;
            FailOutcome::Retrying { run_after }
        };

        tx.commit().await?;

        debug!(job_id = %job_id, attempts, outcome = ?outcome, "Job failed");
        Ok(outcome)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs WHERE queue = ? GROUP BY status")
                .bind(queue)
                .fetch_all(&self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.as_str() {
                "queued" => counts.queued = count,
                "running" => counts.in_flight = count,
                "dead" => counts.dead = count,
                _ => {}
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;
    use crate::queue::{DISCOVERY_QUEUE, MANIFEST_MATERIALIZE_QUEUE};

    fn discover(stream: &str) -> JobPayload {
        JobPayload::DiscoverPage {
            stream: stream.to_string(),
        }
    }

    fn params(max_attempts: u32) -> ImportParameters {
        ImportParameters {
            max_attempts,
            backoff_base_ms: 0,
            max_backoff_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1, 500, 60_000), Duration::from_millis(500));
        assert_eq!(backoff_delay(2, 500, 60_000), Duration::from_millis(1000));
        assert_eq!(backoff_delay(4, 500, 60_000), Duration::from_millis(4000));
        assert_eq!(backoff_delay(20, 500, 60_000), Duration::from_millis(60_000));
        assert_eq!(backoff_delay(u32::MAX, u64::MAX, 60_000), Duration::from_millis(60_000));
    }

    #[tokio::test]
    async fn test_claim_complete_cycle() {
        let (_dir, pool) = temp_pool().await;
        let queue = SqliteJobQueue::new(pool, &params(3));

        assert!(queue.enqueue(&discover("s"), None).await.unwrap());
        assert_eq!(queue.counts(DISCOVERY_QUEUE).await.unwrap().queued, 1);

        let job = queue.claim(DISCOVERY_QUEUE, Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.payload, discover("s"));
        assert!(queue.claim(DISCOVERY_QUEUE, Duration::from_secs(60)).await.unwrap().is_none());
        assert_eq!(queue.counts(DISCOVERY_QUEUE).await.unwrap().in_flight, 1);

        queue.complete(job.job_id).await.unwrap();
        assert!(queue.counts(DISCOVERY_QUEUE).await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_queues_are_separate() {
        let (_dir, pool) = temp_pool().await;
        let queue = SqliteJobQueue::new(pool, &params(3));
        queue.enqueue(&discover("s"), None).await.unwrap();

        assert!(queue
            .claim(MANIFEST_MATERIALIZE_QUEUE, Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_dedupe_absorbs_queued_and_rearms_finished() {
        let (_dir, pool) = temp_pool().await;
        let queue = SqliteJobQueue::new(pool, &params(3));

        assert!(queue.enqueue(&discover("s"), Some("discover:s:1")).await.unwrap());
        assert!(!queue.enqueue(&discover("s"), Some("discover:s:1")).await.unwrap());
        assert_eq!(queue.counts(DISCOVERY_QUEUE).await.unwrap().queued, 1);

        let job = queue.claim(DISCOVERY_QUEUE, Duration::from_secs(60)).await.unwrap().unwrap();
        queue.complete(job.job_id).await.unwrap();

        assert!(queue.enqueue(&discover("s"), Some("discover:s:1")).await.unwrap());
        let again = queue.claim(DISCOVERY_QUEUE, Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(again.job_id, job.job_id);
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausts() {
        let (_dir, pool) = temp_pool().await;
        let queue = SqliteJobQueue::new(pool, &params(2));
        queue.enqueue(&discover("s"), None).await.unwrap();

        let job = queue.claim(DISCOVERY_QUEUE, Duration::from_secs(60)).await.unwrap().unwrap();
        assert!(matches!(
            queue.fail(job.job_id, "timeout").await.unwrap(),
            FailOutcome::Retrying { .. }
        ));

        let job = queue.claim(DISCOVERY_QUEUE, Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(queue.fail(job.job_id, "timeout").await.unwrap(), FailOutcome::Exhausted);

        let counts = queue.counts(DISCOVERY_QUEUE).await.unwrap();
        assert_eq!(counts.dead, 1);
        assert!(counts.is_idle());
    }

    #[tokio::test]
    async fn test_backoff_delays_next_claim() {
        let (_dir, pool) = temp_pool().await;
        let queue = SqliteJobQueue::new(
            pool,
            &ImportParameters {
                max_attempts: 5,
                backoff_base_ms: 60_000,
                max_backoff_ms: 60_000,
                ..Default::default()
            },
        );
        queue.enqueue(&discover("s"), None).await.unwrap();

        let job = queue.claim(DISCOVERY_QUEUE, Duration::from_secs(60)).await.unwrap().unwrap();
        queue.fail(job.job_id, "rate limited").await.unwrap();

        assert!(queue.claim(DISCOVERY_QUEUE, Duration::from_secs(60)).await.unwrap().is_none());
        assert_eq!(queue.counts(DISCOVERY_QUEUE).await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let (_dir, pool) = temp_pool().await;
        let queue = SqliteJobQueue::new(pool, &params(3));
        queue.enqueue(&discover("s"), None).await.unwrap();

        let first = queue.claim(DISCOVERY_QUEUE, Duration::from_millis(1)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = queue.claim(DISCOVERY_QUEUE, Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.attempts, 2);
    }

    #[tokio::test]
    async fn test_unreadable_payload_goes_dead() {
        let (_dir, pool) = temp_pool().await;
        let now = time::now_db();
        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, queue, payload, status, attempts, max_attempts, run_after, created_at, updated_at)
            VALUES (?, 'discovery', '{"job":"nonsense"}', 'queued', 0, 3, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();

        let queue = SqliteJobQueue::new(pool, &params(3));
        assert!(queue.claim(DISCOVERY_QUEUE, Duration::from_secs(60)).await.unwrap().is_none());
        assert_eq!(queue.counts(DISCOVERY_QUEUE).await.unwrap().dead, 1);
    }
}

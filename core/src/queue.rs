use std::time::Duration;

use sqlx::postgres::types::PgInterval;
use sqlx::{FromRow, PgConnection, PgPool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A dequeued message: the queue row (used for acknowledgement) and the
/// delivery task it points at.
#[derive(Debug, Clone, FromRow)]
pub struct QueuedJob {
    pub delivery_job_id: Uuid,
    pub delivery_task_id: Uuid,
}

/// Durable FIFO with delayed delivery between the ingestion path and the
/// delivery workers, backed by the `webhook.delivery_job` table.
///
/// Jobs are only ever published through [`enqueue_in`], inside the store
/// transaction that creates or reschedules their task, so a committed task
/// can never lose its enqueue. Delivery is at-least-once: consuming a job
/// takes a visibility lock of `lease`; a worker that dies mid-processing
/// simply lets the lock expire and the job becomes consumable again.
/// Acknowledging deletes the row.
#[derive(Clone)]
pub struct JobQueue {
    db: PgPool,
    lease: Duration,
}

impl JobQueue {
    pub fn new(db: PgPool, lease: Duration) -> Self {
        Self { db, lease }
    }

    /// Pop the next available job, if any, and make it invisible to other
    /// consumers for the configured lease.
    pub async fn consume(&self) -> Result<Option<QueuedJob>, QueueError> {
        let job = sqlx::query_as::<_, QueuedJob>(
            "
                UPDATE webhook.delivery_job
                SET locked_until = statement_timestamp() + $1
                WHERE delivery_job__id = (
                    SELECT delivery_job__id
                    FROM webhook.delivery_job
                    WHERE available_at <= statement_timestamp()
                        AND (locked_until IS NULL OR locked_until <= statement_timestamp())
                    ORDER BY available_at ASC
                    LIMIT 1
                    FOR UPDATE
                    SKIP LOCKED
                )
                RETURNING delivery_job__id AS delivery_job_id, delivery_task__id AS delivery_task_id
            ",
        )
        .bind(pg_interval(self.lease))
        .fetch_optional(&self.db)
        .await?;

        Ok(job)
    }

    /// Acknowledge a consumed job so it is never delivered again.
    pub async fn ack(&self, job: &QueuedJob) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM webhook.delivery_job WHERE delivery_job__id = $1")
            .bind(job.delivery_job_id)
            .execute(&self.db)
            .await?;

        Ok(())
    }
}

/// Append a job row inside an existing transaction; this is how the store
/// enqueues atomically with the task mutation it accompanies.
pub(crate) async fn enqueue_in(
    conn: &mut PgConnection,
    delivery_task_id: &Uuid,
    available_in: Duration,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "
            INSERT INTO webhook.delivery_job (delivery_job__id, delivery_task__id, available_at, created_at)
            VALUES ($1, $2, statement_timestamp() + $3, statement_timestamp())
        ",
    )
    .bind(Uuid::new_v4())
    .bind(delivery_task_id)
    .bind(pg_interval(available_in))
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) fn pg_interval(duration: Duration) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: i64::try_from(duration.as_micros()).unwrap_or(i64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_interval_converts_whole_seconds() {
        let interval = pg_interval(Duration::from_secs(90));
        assert_eq!(interval.months, 0);
        assert_eq!(interval.days, 0);
        assert_eq!(interval.microseconds, 90_000_000);
    }

    #[test]
    fn pg_interval_saturates_on_absurd_durations() {
        let interval = pg_interval(Duration::from_secs(u64::MAX));
        assert_eq!(interval.microseconds, i64::MAX);
    }
}

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AttemptOutcome, DeliveryAttempt, DeliveryTask, Subscription, TaskStatus};
use crate::queue::{self, pg_interval};
use crate::retry::Decision;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("unknown {kind} value `{value}` in database")]
    UnknownEnum { kind: &'static str, value: String },
}

/// Everything recorded about one outbound POST, ready to be appended to the
/// attempt log.
#[derive(Debug, Clone, Copy)]
pub struct AttemptRecord<'a> {
    pub outcome: AttemptOutcome,
    pub http_status: Option<i32>,
    pub error_details: Option<&'a str>,
}

/// Transactional boundary around subscriptions, delivery tasks and delivery
/// attempts. No other component issues SQL against these tables.
#[derive(Clone)]
pub struct TaskStore {
    db: PgPool,
}

#[derive(FromRow)]
struct RawDeliveryTask {
    delivery_task_id: Uuid,
    subscription_id: Uuid,
    payload: Value,
    status: String,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    attempts_count: i32,
    last_http_status: Option<i32>,
    last_error: Option<String>,
}

impl TryFrom<RawDeliveryTask> for DeliveryTask {
    type Error = StoreError;

    fn try_from(raw: RawDeliveryTask) -> Result<Self, StoreError> {
        let status =
            TaskStatus::from_str(&raw.status).map_err(|_| StoreError::UnknownEnum {
                kind: "task status",
                value: raw.status.to_owned(),
            })?;
        Ok(Self {
            delivery_task_id: raw.delivery_task_id,
            subscription_id: raw.subscription_id,
            payload: raw.payload,
            status,
            created_at: raw.created_at,
            last_attempt_at: raw.last_attempt_at,
            next_attempt_at: raw.next_attempt_at,
            attempts_count: raw.attempts_count,
            last_http_status: raw.last_http_status,
            last_error: raw.last_error,
        })
    }
}

#[derive(FromRow)]
struct RawDeliveryAttempt {
    delivery_attempt_id: Uuid,
    delivery_task_id: Uuid,
    attempt_number: i32,
    timestamp: DateTime<Utc>,
    outcome: String,
    http_status: Option<i32>,
    error_details: Option<String>,
}

impl TryFrom<RawDeliveryAttempt> for DeliveryAttempt {
    type Error = StoreError;

    fn try_from(raw: RawDeliveryAttempt) -> Result<Self, StoreError> {
        let outcome =
            AttemptOutcome::from_str(&raw.outcome).map_err(|_| StoreError::UnknownEnum {
                kind: "attempt outcome",
                value: raw.outcome.to_owned(),
            })?;
        Ok(Self {
            delivery_attempt_id: raw.delivery_attempt_id,
            delivery_task_id: raw.delivery_task_id,
            attempt_number: raw.attempt_number,
            timestamp: raw.timestamp,
            outcome,
            http_status: raw.http_status,
            error_details: raw.error_details,
        })
    }
}

impl TaskStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }

    pub async fn create_subscription(
        &self,
        target_url: &str,
        secret: Option<&str>,
        event_type_filter: Option<&str>,
    ) -> Result<Subscription, StoreError> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "
                INSERT INTO webhook.subscription (subscription__id, target_url, secret, event_type_filter, created_at, updated_at)
                VALUES ($1, $2, $3, $4, statement_timestamp(), statement_timestamp())
                RETURNING subscription__id AS subscription_id, target_url, secret, event_type_filter, created_at, updated_at
            ",
        )
        .bind(Uuid::new_v4())
        .bind(target_url)
        .bind(secret)
        .bind(event_type_filter)
        .fetch_one(&self.db)
        .await?;

        Ok(subscription)
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            "
                SELECT subscription__id AS subscription_id, target_url, secret, event_type_filter, created_at, updated_at
                FROM webhook.subscription
                ORDER BY created_at ASC
            ",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(subscriptions)
    }

    pub async fn get_subscription(
        &self,
        subscription_id: &Uuid,
    ) -> Result<Option<Subscription>, StoreError> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "
                SELECT subscription__id AS subscription_id, target_url, secret, event_type_filter, created_at, updated_at
                FROM webhook.subscription
                WHERE subscription__id = $1
            ",
        )
        .bind(subscription_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(subscription)
    }

    pub async fn update_subscription(
        &self,
        subscription_id: &Uuid,
        target_url: &str,
        secret: Option<&str>,
        event_type_filter: Option<&str>,
    ) -> Result<Option<Subscription>, StoreError> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "
                UPDATE webhook.subscription
                SET target_url = $1, secret = $2, event_type_filter = $3, updated_at = statement_timestamp()
                WHERE subscription__id = $4
                RETURNING subscription__id AS subscription_id, target_url, secret, event_type_filter, created_at, updated_at
            ",
        )
        .bind(target_url)
        .bind(secret)
        .bind(event_type_filter)
        .bind(subscription_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(subscription)
    }

    /// Delete a subscription; its tasks, attempts and queued jobs cascade.
    pub async fn delete_subscription(&self, subscription_id: &Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM webhook.subscription WHERE subscription__id = $1")
            .bind(subscription_id)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Create a pending delivery task and its queue job in one transaction,
    /// so that an accepted ingestion can never lose its enqueue.
    pub async fn create_task(
        &self,
        subscription_id: &Uuid,
        payload: &Value,
    ) -> Result<Uuid, StoreError> {
        let delivery_task_id = Uuid::new_v4();
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "
                INSERT INTO webhook.delivery_task (delivery_task__id, subscription__id, payload, status, attempts_count, created_at)
                VALUES ($1, $2, $3, 'pending', 0, statement_timestamp())
            ",
        )
        .bind(delivery_task_id)
        .bind(subscription_id)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        queue::enqueue_in(&mut *tx, &delivery_task_id, Duration::ZERO).await?;

        tx.commit().await?;
        Ok(delivery_task_id)
    }

    pub async fn load_task(
        &self,
        delivery_task_id: &Uuid,
    ) -> Result<Option<DeliveryTask>, StoreError> {
        let raw = sqlx::query_as::<_, RawDeliveryTask>(
            "
                SELECT delivery_task__id AS delivery_task_id, subscription__id AS subscription_id,
                    payload, status, created_at, last_attempt_at, next_attempt_at, attempts_count,
                    last_http_status, last_error
                FROM webhook.delivery_task
                WHERE delivery_task__id = $1
            ",
        )
        .bind(delivery_task_id)
        .fetch_optional(&self.db)
        .await?;

        raw.map(DeliveryTask::try_from).transpose()
    }

    /// Take the processing lease on a task. The row count of this conditional
    /// update is what guarantees that a task is processed by at most one
    /// worker at a time, even when the queue delivers a message twice.
    pub async fn acquire_for_processing(
        &self,
        delivery_task_id: &Uuid,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "
                UPDATE webhook.delivery_task
                SET status = 'processing'
                WHERE delivery_task__id = $1 AND status IN ('pending', 'retrying')
            ",
        )
        .bind(delivery_task_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Append an attempt and apply the retry decision in a single
    /// transaction: bump `attempts_count`, insert the attempt row with that
    /// number, update the `last_*` mirrors and either settle the task or
    /// schedule its retry job.
    ///
    /// Returns false (and writes nothing) when the task has already reached a
    /// terminal state, which makes duplicate queue deliveries harmless.
    pub async fn record_attempt(
        &self,
        delivery_task_id: &Uuid,
        record: &AttemptRecord<'_>,
        decision: Decision,
    ) -> Result<bool, StoreError> {
        let (status, retry_in) = match decision {
            Decision::Success => (TaskStatus::Succeeded, None),
            Decision::Retry { delay } => (TaskStatus::Retrying, Some(delay)),
            Decision::GiveUp => (TaskStatus::Failed, None),
        };

        let mut tx = self.db.begin().await?;

        let updated = sqlx::query_as::<_, (i32, DateTime<Utc>)>(
            "
                UPDATE webhook.delivery_task
                SET attempts_count = attempts_count + 1,
                    last_attempt_at = statement_timestamp(),
                    last_http_status = $1,
                    last_error = $2,
                    status = $3,
                    next_attempt_at = CASE
                        WHEN $4::interval IS NULL THEN NULL
                        ELSE statement_timestamp() + $4::interval
                    END
                WHERE delivery_task__id = $5 AND status NOT IN ('succeeded', 'failed')
                RETURNING attempts_count, last_attempt_at
            ",
        )
        .bind(record.http_status)
        .bind(record.error_details)
        .bind(status.to_string())
        .bind(retry_in.map(pg_interval))
        .bind(delivery_task_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempt_number, attempted_at)) = updated else {
            return Ok(false);
        };

        sqlx::query(
            "
                INSERT INTO webhook.delivery_attempt (delivery_attempt__id, delivery_task__id, attempt_number, timestamp, outcome, http_status, error_details)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(Uuid::new_v4())
        .bind(delivery_task_id)
        .bind(attempt_number)
        .bind(attempted_at)
        .bind(record.outcome.to_string())
        .bind(record.http_status)
        .bind(record.error_details)
        .execute(&mut *tx)
        .await?;

        if let Decision::Retry { delay } = decision {
            queue::enqueue_in(&mut *tx, delivery_task_id, delay).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    pub async fn attempts_for_task(
        &self,
        delivery_task_id: &Uuid,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let raw = sqlx::query_as::<_, RawDeliveryAttempt>(
            "
                SELECT delivery_attempt__id AS delivery_attempt_id, delivery_task__id AS delivery_task_id,
                    attempt_number, timestamp, outcome, http_status, error_details
                FROM webhook.delivery_attempt
                WHERE delivery_task__id = $1
                ORDER BY attempt_number ASC
            ",
        )
        .bind(delivery_task_id)
        .fetch_all(&self.db)
        .await?;

        raw.into_iter().map(DeliveryAttempt::try_from).collect()
    }

    /// Latest attempts across all tasks of a subscription, newest first.
    pub async fn recent_attempts_for_subscription(
        &self,
        subscription_id: &Uuid,
        limit: i64,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let raw = sqlx::query_as::<_, RawDeliveryAttempt>(
            "
                SELECT da.delivery_attempt__id AS delivery_attempt_id, da.delivery_task__id AS delivery_task_id,
                    da.attempt_number, da.timestamp, da.outcome, da.http_status, da.error_details
                FROM webhook.delivery_attempt AS da
                INNER JOIN webhook.delivery_task AS dt ON dt.delivery_task__id = da.delivery_task__id
                WHERE dt.subscription__id = $1
                ORDER BY da.timestamp DESC
                LIMIT $2
            ",
        )
        .bind(subscription_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        raw.into_iter().map(DeliveryAttempt::try_from).collect()
    }

    /// Delete at most `batch` attempt rows older than `cutoff`; returns how
    /// many were removed.
    pub async fn delete_attempts_before(
        &self,
        cutoff: DateTime<Utc>,
        batch: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "
                DELETE FROM webhook.delivery_attempt
                WHERE delivery_attempt__id IN (
                    SELECT delivery_attempt__id
                    FROM webhook.delivery_attempt
                    WHERE timestamp < $1
                    LIMIT $2
                )
            ",
        )
        .bind(cutoff)
        .bind(batch)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete at most `batch` settled tasks whose last activity predates
    /// `cutoff`; leftover attempts and queued jobs cascade with them.
    pub async fn delete_terminal_tasks_before(
        &self,
        cutoff: DateTime<Utc>,
        batch: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "
                DELETE FROM webhook.delivery_task
                WHERE delivery_task__id IN (
                    SELECT delivery_task__id
                    FROM webhook.delivery_task
                    WHERE status IN ('succeeded', 'failed') AND last_attempt_at < $1
                    LIMIT $2
                )
            ",
        )
        .bind(cutoff)
        .bind(batch)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Re-enqueue tasks that fell through the cracks: `processing` tasks
    /// whose worker died before settling them, and live tasks whose queue job
    /// vanished. Covers the crash windows between lease and outcome, and
    /// between commit and enqueue.
    pub async fn rescue_orphans(&self, stale_after: Duration) -> Result<u64, StoreError> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "
                UPDATE webhook.delivery_task
                SET status = 'pending'
                WHERE status = 'processing'
                    AND COALESCE(last_attempt_at, created_at) < statement_timestamp() - $1::interval
            ",
        )
        .bind(pg_interval(stale_after))
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            "
                INSERT INTO webhook.delivery_job (delivery_job__id, delivery_task__id, available_at, created_at)
                SELECT gen_random_uuid(), dt.delivery_task__id, COALESCE(dt.next_attempt_at, statement_timestamp()), statement_timestamp()
                FROM webhook.delivery_task AS dt
                LEFT JOIN webhook.delivery_job AS dj ON dj.delivery_task__id = dt.delivery_task__id
                WHERE dj.delivery_job__id IS NULL
                    AND dt.status IN ('pending', 'retrying')
                    AND COALESCE(dt.last_attempt_at, dt.created_at) < statement_timestamp() - $1::interval
            ",
        )
        .bind(pg_interval(stale_after))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted.rows_affected())
    }
}

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use reqwest::Client;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use hookline_core::cache::SubscriptionCache;
use hookline_core::models::{AttemptOutcome, CachedSubscription, TaskStatus};
use hookline_core::queue::{JobQueue, QueuedJob};
use hookline_core::retry::{Decision, RetryPolicy};
use hookline_core::store::{AttemptRecord, StoreError, TaskStore};

use crate::work::work;

/// Minimum duration to wait when there are no queued jobs to pick
const MIN_POLLING_SLEEP: Duration = Duration::from_secs(1);

/// Maximum duration to wait when there are no queued jobs to pick
const MAX_POLLING_SLEEP: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct DeliveryContext {
    pub store: TaskStore,
    pub queue: JobQueue,
    pub cache: SubscriptionCache,
    pub client: Client,
    pub policy: RetryPolicy,
    pub timeout: Duration,
}

pub async fn look_for_work(
    ctx: &DeliveryContext,
    unit_id: u16,
    task_tracker: &TaskTracker,
) -> anyhow::Result<()> {
    info!("[unit={unit_id}] Begin looking for work");
    loop {
        trace!("[unit={unit_id}] Fetching next queued delivery job...");
        match ctx.queue.consume().await? {
            Some(job) => {
                if let Err(e) = process(ctx, unit_id, &job).await {
                    error!(
                        "[unit={unit_id}] Processing of delivery task {} crashed: {e}",
                        &job.delivery_task_id
                    );
                    handle_fatal(ctx, unit_id, &job, &e.to_string()).await?;
                }
            }
            None => {
                trace!("[unit={unit_id}] No queued job found");
                wait_because_no_work(unit_id).await;
            }
        }

        if task_tracker.is_closed() {
            break;
        }
    }

    Ok(())
}

/// Run one dequeued job through the delivery state machine.
///
/// Re-entry is idempotent: settled tasks, stale duplicates of scheduled
/// retries and tasks already leased by another unit are all acknowledged
/// without producing an attempt.
async fn process(ctx: &DeliveryContext, unit_id: u16, job: &QueuedJob) -> anyhow::Result<()> {
    let task = match ctx.store.load_task(&job.delivery_task_id).await? {
        Some(task) => task,
        None => {
            debug!(
                "[unit={unit_id}] Task {} no longer exists; dropping job",
                &job.delivery_task_id
            );
            ctx.queue.ack(job).await?;
            return Ok(());
        }
    };

    if task.status.is_terminal() {
        debug!(
            "[unit={unit_id}] Task {} is already settled as {}; dropping duplicate job",
            &task.delivery_task_id, &task.status
        );
        ctx.queue.ack(job).await?;
        return Ok(());
    }

    // A queued job for a retrying task is only valid once its scheduled time
    // has passed; anything earlier is a leftover duplicate
    if task.status == TaskStatus::Retrying
        && task.next_attempt_at.is_some_and(|next| next > Utc::now())
    {
        debug!(
            "[unit={unit_id}] Task {} has a retry scheduled later; dropping stale job",
            &task.delivery_task_id
        );
        ctx.queue.ack(job).await?;
        return Ok(());
    }

    if !ctx.store.acquire_for_processing(&task.delivery_task_id).await? {
        debug!(
            "[unit={unit_id}] Task {} is being processed by another worker; dropping job",
            &task.delivery_task_id
        );
        ctx.queue.ack(job).await?;
        return Ok(());
    }

    let Some(subscription) = resolve_subscription(ctx, &task.subscription_id).await? else {
        warn!(
            "[unit={unit_id}] Subscription {} of task {} is gone; marking task failed",
            &task.subscription_id, &task.delivery_task_id
        );
        settle_without_delivery(ctx, &task.delivery_task_id, "Subscription not found during delivery")
            .await?;
        ctx.queue.ack(job).await?;
        return Ok(());
    };

    if subscription.target_url.is_empty() {
        warn!(
            "[unit={unit_id}] Subscription {} of task {} has no target URL; marking task failed",
            &task.subscription_id, &task.delivery_task_id
        );
        settle_without_delivery(ctx, &task.delivery_task_id, "Subscription target_url is missing")
            .await?;
        ctx.queue.ack(job).await?;
        return Ok(());
    }

    let attempt_number = task.attempts_count + 1;
    debug!(
        "[unit={unit_id}] Attempt {attempt_number} of task {}: delivering to {}",
        &task.delivery_task_id, &subscription.target_url
    );

    // The POST runs outside any database transaction; only its classification
    // enters the outcome transaction below
    let response = work(
        &ctx.client,
        &task.delivery_task_id,
        &subscription.target_url,
        &task.payload,
        ctx.timeout,
    )
    .await;
    trace!(
        "[unit={unit_id}] Got a response for task {} in {} ms",
        &task.delivery_task_id,
        &response.elapsed_time_ms()
    );

    let decision = ctx.policy.decide(
        response.is_success(),
        u32::try_from(attempt_number).unwrap_or(u32::MAX),
    );
    let outcome = match decision {
        Decision::Success => AttemptOutcome::Success,
        Decision::Retry { .. } => AttemptOutcome::FailedAttempt,
        Decision::GiveUp => AttemptOutcome::PermanentlyFailed,
    };

    ctx.store
        .record_attempt(
            &task.delivery_task_id,
            &AttemptRecord {
                outcome,
                http_status: response.http_status(),
                error_details: response.error_details.as_deref(),
            },
            decision,
        )
        .await?;

    match decision {
        Decision::Success => debug!(
            "[unit={unit_id}] Task {} was delivered successfully (status: {:?})",
            &task.delivery_task_id,
            &response.http_code
        ),
        Decision::Retry { delay } => debug!(
            "[unit={unit_id}] Attempt {attempt_number} of task {} failed; retry scheduled in {}s",
            &task.delivery_task_id,
            &delay.as_secs()
        ),
        Decision::GiveUp => info!(
            "[unit={unit_id}] Task {} failed after {attempt_number} attempts; giving up",
            &task.delivery_task_id
        ),
    }

    ctx.queue.ack(job).await?;
    Ok(())
}

/// Look the subscription up through the cache, falling back to (and
/// repopulating from) the database on a miss.
///
/// A cached entry that cannot be delivered to is not trusted: the database
/// remains the authority, so the entry is invalidated and re-read before the
/// task is failed.
async fn resolve_subscription(
    ctx: &DeliveryContext,
    subscription_id: &Uuid,
) -> Result<Option<CachedSubscription>, StoreError> {
    if let Some(entry) = ctx.cache.get(subscription_id).await {
        if !entry.target_url.is_empty() {
            return Ok(Some(entry));
        }
        ctx.cache.invalidate(subscription_id).await;
    }

    match ctx.store.get_subscription(subscription_id).await? {
        Some(subscription) => {
            let entry = CachedSubscription::from(&subscription);
            ctx.cache.put(subscription_id, &entry).await;
            Ok(Some(entry))
        }
        None => Ok(None),
    }
}

/// Settle a task as failed with a synthetic `permanently_failed` attempt when
/// no POST can even be tried.
async fn settle_without_delivery(
    ctx: &DeliveryContext,
    delivery_task_id: &Uuid,
    error_details: &str,
) -> Result<(), StoreError> {
    ctx.store
        .record_attempt(
            delivery_task_id,
            &AttemptRecord {
                outcome: AttemptOutcome::PermanentlyFailed,
                http_status: None,
                error_details: Some(error_details),
            },
            Decision::GiveUp,
        )
        .await?;
    Ok(())
}

/// Last-resort path after an unexpected internal error: make sure the task is
/// not silently lost. If its outcome transaction already committed, the job
/// is simply acknowledged; if the task is still unsettled, a
/// `permanently_failed` attempt is written; and if even that fails, the error
/// is re-raised so the queue redelivers the job.
async fn handle_fatal(
    ctx: &DeliveryContext,
    unit_id: u16,
    job: &QueuedJob,
    details: &str,
) -> anyhow::Result<()> {
    let task = match ctx.store.load_task(&job.delivery_task_id).await {
        Ok(task) => task,
        Err(e) => {
            error!(
                "[unit={unit_id}] Could not load task {} to record a fatal error; leaving job for redelivery: {e}",
                &job.delivery_task_id
            );
            return Err(e.into());
        }
    };

    let settled = match task {
        None => true,
        Some(ref task) if task.status.is_terminal() => true,
        Some(ref task) => {
            task.status == TaskStatus::Retrying && task.next_attempt_at.is_some()
        }
    };

    if !settled {
        let message =
            format!("Fatal internal error while processing delivery task: {details}");
        if let Err(e) = settle_without_delivery(ctx, &job.delivery_task_id, &message).await {
            error!(
                "[unit={unit_id}] Could not record fatal error for task {}; leaving job for redelivery: {e}",
                &job.delivery_task_id
            );
            return Err(e.into());
        }
        info!(
            "[unit={unit_id}] Recorded fatal error for task {}",
            &job.delivery_task_id
        );
    }

    ctx.queue.ack(job).await?;
    Ok(())
}

async fn wait_because_no_work(unit_id: u16) {
    // Idle units poll at staggered rates: unit 0 stays snappy so fresh work
    // is picked up fast, higher units back off to spare the database. Units
    // never wait after finishing a job, only when the queue came up empty.
    let sleep_duration = match unit_id {
        0 => MIN_POLLING_SLEEP,
        1 | 2 => (MIN_POLLING_SLEEP + MAX_POLLING_SLEEP) / 2,
        _ => MAX_POLLING_SLEEP,
    };
    sleep(sleep_duration).await;
}

use chrono::{Duration as ChronoDuration, Utc};
use log::{error, info, trace};
use std::time::{Duration, Instant};
use tokio::time::sleep;

use hookline_core::store::{StoreError, TaskStore};

const STARTUP_GRACE_PERIOD: Duration = Duration::from_secs(20);

/// Upper bound of rows deleted per statement, to keep transactions short
const DELETE_BATCH_SIZE: i64 = 500;

/// Periodically delete delivery attempts and settled tasks older than the
/// retention horizon.
pub async fn periodically_sweep_old_logs(
    store: &TaskStore,
    period: Duration,
    retention_hours: u32,
) {
    sleep(STARTUP_GRACE_PERIOD).await;

    loop {
        if let Err(e) = sweep_old_logs(store, retention_hours).await {
            error!("Could not sweep old delivery logs: {e}");
        }

        sleep(period).await;
    }
}

async fn sweep_old_logs(store: &TaskStore, retention_hours: u32) -> Result<(), StoreError> {
    trace!("Start sweeping old delivery logs...");
    let start = Instant::now();
    let cutoff = Utc::now() - ChronoDuration::hours(i64::from(retention_hours));

    let mut total_attempts = 0;
    loop {
        let deleted = store
            .delete_attempts_before(cutoff, DELETE_BATCH_SIZE)
            .await?;
        total_attempts += deleted;
        if deleted < DELETE_BATCH_SIZE as u64 {
            break;
        }
    }

    let mut total_tasks = 0;
    loop {
        let deleted = store
            .delete_terminal_tasks_before(cutoff, DELETE_BATCH_SIZE)
            .await?;
        total_tasks += deleted;
        if deleted < DELETE_BATCH_SIZE as u64 {
            break;
        }
    }

    info!(
        "Swept {total_attempts} old delivery attempts and {total_tasks} settled delivery tasks in {:?}",
        start.elapsed()
    );
    Ok(())
}

/// Periodically re-enqueue tasks whose worker died mid-flight or whose queue
/// job was lost.
pub async fn periodically_rescue_orphans(
    store: &TaskStore,
    period: Duration,
    threshold: Duration,
) {
    sleep(STARTUP_GRACE_PERIOD).await;

    loop {
        match store.rescue_orphans(threshold).await {
            Ok(0) => trace!("No orphaned delivery tasks found"),
            Ok(rescued) => info!("Re-enqueued {rescued} orphaned delivery tasks"),
            Err(e) => error!("Could not rescue orphaned delivery tasks: {e}"),
        }

        sleep(period).await;
    }
}

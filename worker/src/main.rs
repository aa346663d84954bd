mod delivery;
mod sweeper;
mod work;

use anyhow::anyhow;
use clap::{Parser, crate_name, crate_version};
use log::{debug, error, info};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::task::TaskTracker;

use hookline_core::cache::SubscriptionCache;
use hookline_core::queue::JobQueue;
use hookline_core::retry::RetryPolicy;
use hookline_core::store::TaskStore;

use delivery::DeliveryContext;

#[derive(Debug, Clone, Parser)]
#[clap(author, about, version)]
struct Config {
    /// Database URL (with credentials)
    #[clap(long, env, hide_env_values = true)]
    database_url: String,

    /// Maximum number of connections to database (should be at least CONCURRENT plus one for the maintenance loops)
    #[clap(long, env, default_value = "5")]
    max_db_connections: u32,

    /// Redis URL for the shared subscription cache; when unset, a per-process in-memory cache is used
    #[clap(long, env, hide_env_values = true)]
    cache_url: Option<String>,

    /// How long a cached subscription entry stays valid, in seconds
    #[clap(long, env, default_value = "3600")]
    cache_expiry_seconds: u64,

    /// Number of delivery tasks to handle concurrently
    #[clap(long, env, default_value = "2", value_parser = clap::value_parser!(u16).range(1..))]
    concurrent: u16,

    /// Timeout for obtaining a HTTP response from the target, including connect phase (if exceeded, the attempt fails)
    #[clap(long, env, default_value = "10")]
    delivery_timeout_seconds: u64,

    /// Maximum number of delivery attempts before a task is marked failed
    #[clap(long, env, default_value = "5")]
    max_retries: u32,

    /// Delay before the first retry, in seconds
    #[clap(long, env, default_value = "10")]
    retry_base_delay_seconds: u64,

    /// Multiplier applied to the retry delay after each failed attempt
    #[clap(long, env, default_value = "3")]
    retry_factor: u32,

    /// Upper bound for the delay between two attempts, in seconds
    #[clap(long, env, default_value = "900")]
    max_retry_delay_seconds: u64,

    /// How long delivery attempts and settled tasks are kept, in hours
    #[clap(long, env, default_value = "72")]
    log_retention_hours: u32,

    /// How often the retention sweeper runs
    #[clap(long, env, value_parser = humantime::parse_duration, default_value = "6h")]
    sweep_interval: Duration,

    /// How often the orphan rescue scan runs
    #[clap(long, env, value_parser = humantime::parse_duration, default_value = "5m")]
    rescue_interval: Duration,

    /// How long a task may sit in pending/processing without activity before it is rescued
    #[clap(long, env, value_parser = humantime::parse_duration, default_value = "10m")]
    rescue_threshold: Duration,

    /// How long a dequeued job stays invisible to other workers before it is redelivered
    #[clap(long, env, value_parser = humantime::parse_duration, default_value = "60s")]
    queue_lease: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::parse();

    let delivery_timeout = Duration::from_secs(config.delivery_timeout_seconds);

    info!("Starting {} {}", crate_name!(), crate_version!());
    debug!("Webhook total timeout is set to {delivery_timeout:?}");

    debug!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_db_connections)
        .connect_with(
            PgConnectOptions::from_str(&config.database_url)?
                .application_name(&format!("{}-{}", crate_name!(), crate_version!())),
        )
        .await?;
    info!("Connected to database");

    let cache_ttl = Duration::from_secs(config.cache_expiry_seconds);
    let cache = match &config.cache_url {
        Some(url) => {
            let cache = SubscriptionCache::redis(url, cache_ttl).await?;
            info!("Subscription cache is backed by Redis");
            cache
        }
        None => {
            info!("Subscription cache is in-memory (per process)");
            SubscriptionCache::in_memory(cache_ttl)
        }
    };

    let ctx = DeliveryContext {
        store: TaskStore::new(pool.clone()),
        queue: JobQueue::new(pool.clone(), config.queue_lease),
        cache,
        client: reqwest::Client::builder()
            .timeout(delivery_timeout)
            .user_agent(format!("{}/{}", crate_name!(), crate_version!()))
            .build()?,
        policy: RetryPolicy {
            max_retries: config.max_retries,
            base_delay: Duration::from_secs(config.retry_base_delay_seconds),
            factor: config.retry_factor,
            max_delay: Duration::from_secs(config.max_retry_delay_seconds),
        },
        timeout: delivery_timeout,
    };

    // Control tasks (signal listener, shutdown indicator) live in a JoinSet
    // so the process can await them all at once
    let mut tasks = JoinSet::new();

    // Delivery units register on a TaskTracker; closing it is the shutdown
    // signal their loops poll between jobs
    let task_tracker = TaskTracker::new();

    // Closing the tracker on SIGHUP/SIGINT/SIGTERM lets every unit finish
    // its current attempt before the process exits
    let task_tracker_signal = task_tracker.clone();
    tasks.spawn(async move {
        let mut hangup = signal(SignalKind::hangup()).expect("Could not listen to SIGHUP");
        let mut interrupt = signal(SignalKind::interrupt()).expect("Could not listen to SIGINT");
        let mut terminate = signal(SignalKind::terminate()).expect("Could not listen to SIGTERM");

        select! {
            Some(_) = hangup.recv() => shutdown(&task_tracker_signal),
            Some(_) = interrupt.recv() => shutdown(&task_tracker_signal),
            Some(_) = terminate.recv() => shutdown(&task_tracker_signal),
        }

        fn shutdown(task_tracker: &TaskTracker) {
            info!("Finishing work before terminating...");
            task_tracker.close();
        }
    });

    // Once shutdown has been requested, report how many units are still
    // draining until the last one is done
    let task_tracker_indicator = task_tracker.clone();
    tasks.spawn(async move {
        loop {
            if task_tracker_indicator.is_closed() {
                if task_tracker_indicator.is_empty() {
                    break;
                } else {
                    info!(
                        "Waiting for {} unit(s) to finish...",
                        task_tracker_indicator.len()
                    );
                }
            }
            sleep(Duration::from_secs(1)).await
        }
    });

    // Maintenance loops; they die with the process
    let sweeper_store = ctx.store.clone();
    let sweep_interval = config.sweep_interval;
    let log_retention_hours = config.log_retention_hours;
    tokio::spawn(async move {
        sweeper::periodically_sweep_old_logs(&sweeper_store, sweep_interval, log_retention_hours)
            .await;
    });

    let rescue_store = ctx.store.clone();
    let rescue_interval = config.rescue_interval;
    let rescue_threshold = config.rescue_threshold;
    tokio::spawn(async move {
        sweeper::periodically_rescue_orphans(&rescue_store, rescue_interval, rescue_threshold)
            .await;
    });

    // Delivery units
    for unit_id in 0..config.concurrent {
        let unit_ctx = ctx.clone();
        let tt = task_tracker.clone();
        task_tracker.spawn(async move {
            // Stagger unit start so they do not all hit the queue at once
            sleep(Duration::from_millis(u64::from(unit_id) * 100)).await;

            loop {
                if let Err(e) = delivery::look_for_work(&unit_ctx, unit_id, &tt).await {
                    error!("Unit {unit_id} crashed: {e}");
                }

                if tt.is_closed() {
                    break;
                }

                sleep(Duration::from_secs(1)).await;
                info!("Restarting unit {unit_id}...");
            }

            debug!("Unit {unit_id} terminated");
        });
    }

    // Block until the control tasks wind down (signal received, units drained)
    tasks.join_all().await;

    if task_tracker.is_closed() {
        info!("Worker gracefully terminated");
        Ok(())
    } else {
        Err(anyhow!("Fatal error"))
    }
}

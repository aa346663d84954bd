mod handlers;
mod problems;

use actix_web::middleware::Logger;
use actix_web::web::{self, Data};
use actix_web::{App, HttpServer};
use clap::{Parser, crate_name};
use log::{info, trace};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

use hookline_core::cache::SubscriptionCache;
use hookline_core::store::TaskStore;

const APP_TITLE: &str = "Hookline API";

#[derive(Debug, Clone, Parser)]
#[clap(author, about, version, name = APP_TITLE)]
struct Config {
    /// IP address on which to start the HTTP server
    #[clap(long, env, default_value = "127.0.0.1")]
    ip: String,

    /// Port on which to start the HTTP server
    #[clap(long, env, default_value = "8080")]
    port: String,

    /// Database URL (with credentials)
    #[clap(long, env, hide_env_values = true)]
    database_url: String,

    /// Maximum number of connections to database
    #[clap(long, env, default_value = "5")]
    max_db_connections: u32,

    /// Redis URL for the shared subscription cache; when unset, a per-process in-memory cache is used
    #[clap(long, env, hide_env_values = true)]
    cache_url: Option<String>,

    /// How long a cached subscription entry stays valid, in seconds
    #[clap(long, env, default_value = "3600")]
    cache_expiry_seconds: u64,

    /// Name of the header carrying the HMAC signature of the raw request body
    #[clap(long, env, default_value = "X-Hub-Signature-256")]
    webhook_secret_header: String,

    /// Name of the header carrying the event type that subscription filters match against
    #[clap(long, env, default_value = "X-Event-Type")]
    webhook_event_type_header: String,
}

/// The app state
#[derive(Clone)]
pub struct State {
    store: TaskStore,
    cache: SubscriptionCache,
    signature_header: String,
    event_type_header: String,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::parse();
    trace!("Starting {APP_TITLE}");

    // Create a DB connection pool
    let pool = PgPoolOptions::new()
        .max_connections(config.max_db_connections)
        .connect_with(
            PgConnectOptions::from_str(&config.database_url)?.application_name(crate_name!()),
        )
        .await?;
    info!(
        "Started a pool of maximum {} DB connections",
        &config.max_db_connections
    );

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied");

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

    // Initialize state
    let initial_state = State {
        store: TaskStore::new(pool),
        cache,
        signature_header: config.webhook_secret_header.clone(),
        event_type_header: config.webhook_event_type_header.clone(),
    };

    // Run web server
    HttpServer::new(move || {
        App::new()
            .app_data(Data::new(initial_state.clone()))
            .app_data(web::JsonConfig::default().error_handler(|e, req| {
                problems::json_error_handler(e, req)
            }))
            .wrap(Logger::default())
            .service(
                web::scope("/api/v1")
                    .service(web::resource("/health").route(web::get().to(handlers::health)))
                    .service(
                        web::scope("/subscriptions")
                            .service(
                                web::resource("")
                                    .route(web::get().to(handlers::subscriptions::list))
                                    .route(web::post().to(handlers::subscriptions::create)),
                            )
                            .service(
                                web::resource("/{subscription_id}")
                                    .route(web::get().to(handlers::subscriptions::get))
                                    .route(web::put().to(handlers::subscriptions::edit))
                                    .route(web::delete().to(handlers::subscriptions::delete)),
                            ),
                    )
                    .service(
                        web::resource("/ingest/{subscription_id}")
                            .route(web::post().to(handlers::ingest::ingest)),
                    )
                    .service(
                        web::scope("/status")
                            .service(
                                web::resource("/delivery_tasks/{task_id}")
                                    .route(web::get().to(handlers::status::delivery_task)),
                            )
                            .service(
                                web::resource("/subscriptions/{subscription_id}/attempts")
                                    .route(web::get().to(handlers::status::subscription_attempts)),
                            ),
                    ),
            )
    })
    .bind(format!("{}:{}", config.ip, config.port))?
    .run()
    .await
    .map_err(|e| e.into())
}

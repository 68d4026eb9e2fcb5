use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::{anyhow, Context};
use dotenv::dotenv;
use gateway_core::{CircuitBreaker, Clock, SystemClock};
use partner_gateway::{
    config::{BreakerSettings, Config, RetrySettings},
    crypto::CryptoService,
    database::Database,
    handlers::{self, AppState},
    lock::RedisLock,
    metrics,
    middleware::ClientAuth,
    partner_client::{PartnerClient, RetryPolicy},
    queue::RedisJobQueue,
    repository::Store,
    services::{
        AutoEntryService, GatewayService, LocationService, ServiceContext, TicketingService,
        VoucherService,
    },
    worker::VoucherWorker,
};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn client(
    name: &str,
    breaker: &BreakerSettings,
    retry: RetryPolicy,
    attempt_timeout_secs: u64,
    clock: Arc<dyn Clock>,
) -> PartnerClient {
    let breaker = Arc::new(CircuitBreaker::new(name, breaker.to_breaker_config(), clock));
    PartnerClient::new(breaker, retry, Duration::from_secs(attempt_timeout_secs))
}

fn retry_policy(settings: &RetrySettings) -> RetryPolicy {
    RetryPolicy {
        max_retries: settings.max_retries,
        base_delay: Duration::from_millis(settings.retry_delay_ms),
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .json()
        .init();

    info!("Starting Partner Gateway...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().map_err(|e| anyhow!("Invalid configuration: {e}"))?;

    info!("Configuration loaded successfully");

    metrics::register_metrics().context("Failed to register metrics")?;

    let db = Database::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    let store: Arc<dyn Store> = Arc::new(db);

    info!("Database connected successfully");

    let redis_client = redis::Client::open(config.redis.url.clone()).context("Failed to create Redis client")?;
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Redis connected successfully");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let crypto = CryptoService::new(clock.clone(), config.envelope.crypto_workers);
    let ctx = ServiceContext::new(
        store.clone(),
        crypto,
        clock.clone(),
        config.envelope.partner_key.clone(),
    );

    let downstream = client(
        "downstream",
        &config.downstream.breaker,
        retry_policy(&config.downstream.retry),
        config.downstream.attempt_timeout_secs,
        clock.clone(),
    );
    let voucher_client = client(
        "voucher",
        &config.voucher.breaker,
        retry_policy(&config.voucher.retry),
        config.voucher.attempt_timeout_secs,
        clock.clone(),
    );
    let membership_client = client(
        "membership",
        &config.downstream.breaker,
        RetryPolicy::none(),
        config.auto_entry.timeout_secs,
        clock.clone(),
    );

    let vouchers = VoucherService::new(ctx.clone(), voucher_client);
    let locks = Arc::new(RedisLock::new(redis_conn.clone()));
    let queue = Arc::new(RedisJobQueue::new(
        redis_conn,
        config.queue.name.clone(),
        Duration::from_secs(config.queue.result_ttl_secs),
        Duration::from_millis(config.queue.lease_ms),
        clock.clone(),
    ));

    let worker = Arc::new(VoucherWorker::new(
        queue.clone(),
        locks.clone(),
        vouchers.clone(),
        config.queue.clone(),
    ));
    let _workers = worker.spawn();

    info!("Voucher workers started");

    let state = AppState {
        gateway: GatewayService::new(ctx.clone(), downstream),
        ticketing: TicketingService::new(ctx.clone(), config.ticketing.clone()),
        vouchers,
        auto_entry: AutoEntryService::new(ctx.clone(), membership_client, config.auto_entry.clone()),
        locations: LocationService::new(store.clone()),
        store: store.clone(),
        clock: clock.clone(),
        locks,
        queue,
        lock_ttl: Duration::from_millis(config.queue.lock_ttl_ms),
        slow_threshold: Duration::from_millis(config.database.slow_threshold_ms),
    };
    let auth = ClientAuth::new(store, clock, config.auth.clone());

    let server_config = config.server.clone();
    let state = web::Data::new(state);

    info!(
        "Starting HTTP server on {}:{}",
        server_config.host, server_config.port
    );

    HttpServer::new(move || {
        let auth = auth.clone();
        App::new()
            .app_data(state.clone())
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .configure(move |cfg| handlers::configure_routes(cfg, auth))
    })
    .workers(server_config.workers)
    .bind((server_config.host, server_config.port))?
    .run()
    .await?;

    Ok(())
}

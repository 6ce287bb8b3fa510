use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use db_pool::{create_pool as create_pg_pool, DbConfig as DbPoolConfig};
use transactional_outbox::{OutboxProcessor, SqlxOutboxRepository};

use mailer_service::app_state::AppState;
use mailer_service::broker::channel::BrokerChannel;
use mailer_service::broker::consumer::WorkerConsumer;
use mailer_service::broker::publisher::AmqpOutboxPublisher;
use mailer_service::config::MailerConfig;
use mailer_service::crash_recovery::CrashRecovery;
use mailer_service::db::{SqlxDeadLetterRepository, SqlxMailingEntryRepository, SqlxMailingRepository};
use mailer_service::email_client::EmailProviderClient;
use mailer_service::intake::JobIntake;
use mailer_service::metrics::{EmailMetrics, TokenManagerMetrics, WorkerMetrics};
use mailer_service::rate_limiter::RateLimiter;
use mailer_service::shutdown::{wait_for_termination_signal, ShutdownCoordinator};
use mailer_service::storage::FilesystemStorage;
use mailer_service::token_manager::TokenManager;
use mailer_service::worker::Worker;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = MailerConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to load configuration");
        std::process::exit(1);
    });

    tracing::info!(app_env = %config.app_env, port = config.port, "starting mailer-service");

    let mut db_config = DbPoolConfig::for_service("mailer-service");
    db_config.database_url = config.database.url.clone();
    db_config.max_connections = config.database.max_connections;

    let pool = create_pg_pool(db_config).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to connect to database");
        std::process::exit(1);
    });

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        tracing::error!(error = %e, "failed to run database migrations");
        std::process::exit(1);
    }

    // Repositories, shared by both the HTTP surface and the background tasks.
    let mailings: Arc<dyn mailer_service::db::MailingRepository> =
        Arc::new(SqlxMailingRepository::new(pool.clone()));
    let entries: Arc<dyn mailer_service::db::MailingEntryRepository> =
        Arc::new(SqlxMailingEntryRepository::new(pool.clone()));
    let dead_letters: Arc<dyn mailer_service::db::DeadLetterRepository> =
        Arc::new(SqlxDeadLetterRepository::new(pool.clone()));
    let storage: Arc<dyn mailer_service::storage::MailingStorage> =
        Arc::new(FilesystemStorage::new(config.storage.root.clone()));
    let outbox_repo = Arc::new(SqlxOutboxRepository::new(pool.clone()));

    // Broker: one shared reconnecting channel for the outbox publisher,
    // the worker consumer, and direct retry/DLQ republishes.
    let broker = Arc::new(BrokerChannel::new(config.broker.url.clone()));
    broker.channel().await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to establish initial broker connection");
        std::process::exit(1);
    });

    // §4.9 crash recovery runs once at boot, before the consumer starts.
    let crash_recovery = Arc::new(CrashRecovery::new(
        mailings.clone(),
        entries.clone(),
        config.worker.stale_sending_threshold,
        config.worker.stale_sending_threshold,
    ));
    if let Err(e) = crash_recovery.run().await {
        tracing::error!(error = %e, "crash recovery failed");
        std::process::exit(1);
    }

    // §4.5/§4.6: process-wide singletons, installed once before anything
    // that might send an email.
    let rate_limiter =
        RateLimiter::init(config.rate_limiter.rate_per_minute, config.rate_limiter.worker_concurrency);
    let auth_http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("failed to build auth HTTP client");
    TokenManager::init(auth_http, config.auth.clone(), TokenManagerMetrics::new());

    let intake = Arc::new(JobIntake::new(pool.clone(), mailings.clone(), outbox_repo.clone(), storage.clone()));

    let app_state = web::Data::new(AppState {
        pool: pool.clone(),
        mailings: mailings.clone(),
        entries: entries.clone(),
        dead_letters: dead_letters.clone(),
        storage: storage.clone(),
        broker: broker.clone(),
        intake: intake.clone(),
        crash_recovery: crash_recovery.clone(),
    });

    // §4.2 outbox publisher: polls unpublished rows and bridges them to
    // the broker with confirms.
    let outbox_publisher = Arc::new(AmqpOutboxPublisher::new(broker.clone()));
    let outbox_processor = Arc::new(OutboxProcessor::new(
        outbox_repo.clone(),
        outbox_publisher,
        config.outbox.batch_size,
        config.outbox.poll_interval,
        config.outbox.max_attempts,
    ));

    let publisher_handle = {
        let outbox_processor = outbox_processor.clone();
        let enabled = config.worker.enable_outbox_publisher;
        tokio::spawn(async move {
            if !enabled {
                tracing::info!("outbox publisher disabled via ENABLE_OUTBOX_PUBLISHER");
                std::future::pending::<()>().await;
                return;
            }
            if let Err(e) = outbox_processor.start().await {
                tracing::error!(error = ?e, "outbox publisher exited");
            }
        })
    };

    // §4.4 worker consumer: one channel-level consumer driving the
    // worker's per-delivery lock/process/finalize lifecycle.
    let email_client = Arc::new(
        EmailProviderClient::new(config.email_provider.clone(), EmailMetrics::new()).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to build email provider client");
            std::process::exit(1);
        }),
    );

    let worker = Arc::new(Worker::new(
        mailings.clone(),
        entries.clone(),
        dead_letters.clone(),
        storage.clone(),
        email_client,
        broker.clone(),
        config.worker.clone(),
        config.validation.clone(),
        config.retry_policy.clone(),
        WorkerMetrics::new(),
    ));

    let consumer_handle = {
        let broker = broker.clone();
        let worker = worker.clone();
        let prefetch = config.broker.prefetch;
        let enabled = config.worker.enable_worker_consumer;
        tokio::spawn(async move {
            if !enabled {
                tracing::info!("worker consumer disabled via ENABLE_WORKER_CONSUMER");
                std::future::pending::<()>().await;
                return;
            }
            let consumer = WorkerConsumer::new(broker, prefetch, worker);
            if let Err(e) = consumer.run().await {
                tracing::error!(error = ?e, "worker consumer exited");
            }
        })
    };

    let shutdown_coordinator =
        ShutdownCoordinator::new(config.shutdown.clone(), rate_limiter, broker.clone(), pool.clone());

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(middleware::Logger::default())
            .configure(mailer_service::http::register_routes)
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server exited with error");
            }
        }
        _ = wait_for_termination_signal() => {
            server_handle.stop(true).await;
        }
    }

    shutdown_coordinator.shutdown(&consumer_handle, &publisher_handle).await;

    Ok(())
}

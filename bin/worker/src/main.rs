use autoflow_integration::{
    CredentialCipher, CredentialVault, HttpTransport, IntegrationClient, RateLimiter,
};
use autoflow_worker::config::WorkerConfig;
use autoflow_worker::db::{
    PgCredentialStore, PgDataStore, PgIntegrationStore, PgRateLimitStore, PgRepository,
};
use autoflow_worker::error::WorkerError;
use autoflow_worker::mailer::SmtpMailer;
use autoflow_worker::worker::Worker;
use autoflow_workflow::action::{DisabledMailer, Mailer};
use autoflow_workflow::{
    ActionDispatcher, BuiltinServices, EventSink, ExecutionQueue, FanoutEventSink, Housekeeper,
    NatsConfig, NatsEventSink, NatsRunQueue, TracingEventSink, WorkflowEngine,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Worker stopped");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), WorkerError> {
    // Load configuration from environment
    let config = WorkerConfig::from_env().map_err(|e| WorkerError::Config {
        message: e.to_string(),
    })?;
    tracing::info!("Loaded configuration");

    // Fail fast on a bad key rather than on the first credential read
    let cipher = CredentialCipher::from_base64_key(&config.credential_key).map_err(|e| {
        WorkerError::Config {
            message: e.to_string(),
        }
    })?;

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| WorkerError::Database {
            message: e.to_string(),
        })?;

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .map_err(|e| WorkerError::Database {
            message: e.to_string(),
        })?;

    // Integrations
    let integrations = Arc::new(PgIntegrationStore::new(db_pool.clone()));
    let vault = Arc::new(CredentialVault::new(
        cipher,
        Arc::new(PgCredentialStore::new(db_pool.clone())),
    ));
    let limiter = RateLimiter::hourly(Arc::new(PgRateLimitStore::new(db_pool.clone())));
    let transport = HttpTransport::new().map_err(|e| WorkerError::Integration {
        message: e.to_string(),
    })?;
    let client = Arc::new(IntegrationClient::with_default_adapters(
        vault,
        limiter,
        integrations.clone(),
        &transport,
    ));

    let mailer: Arc<dyn Mailer> = match &config.smtp {
        Some(smtp) => {
            tracing::info!(host = %smtp.host, port = smtp.port, "Using SMTP relay");
            Arc::new(SmtpMailer::new(smtp).map_err(|e| WorkerError::Mail {
                message: e.to_string(),
            })?)
        }
        None => {
            tracing::warn!("No SMTP relay configured; send_email needs an email integration");
            Arc::new(DisabledMailer)
        }
    };

    let services = BuiltinServices::new(
        client,
        Arc::new(PgDataStore::new(db_pool.clone())),
        mailer,
        transport,
    )
    .with_settings(config.engine.clone());
    let dispatcher = ActionDispatcher::builder()
        .with_builtin_handlers(services)
        .build();

    // Lifecycle events go to the log and to JetStream
    tracing::info!(url = %config.nats_url, "Connecting to NATS...");
    let nats_config = NatsConfig::new(config.nats_url.clone());
    let nats_events = NatsEventSink::new(&nats_config)
        .await
        .map_err(|e| WorkerError::Messaging {
            message: e.to_string(),
        })?;
    let events: Arc<dyn EventSink> = Arc::new(
        FanoutEventSink::new()
            .with_sink(Arc::new(TracingEventSink))
            .with_sink(Arc::new(nats_events)),
    );

    let repository = Arc::new(PgRepository::new(db_pool.clone()));
    let engine = Arc::new(WorkflowEngine::new(
        repository.clone(),
        integrations,
        dispatcher,
        events.clone(),
    ));
    let queue = Arc::new(ExecutionQueue::new(engine, &config.queue));
    let worker = Arc::new(Worker::new(
        queue,
        Housekeeper::new(repository, events, config.housekeeping.clone()),
    ));

    // Spawn periodic housekeeping task
    let housekeeping = worker.spawn_housekeeping();

    let run_queue = NatsRunQueue::new(nats_config)
        .await
        .map_err(|e| WorkerError::Messaging {
            message: e.to_string(),
        })?;
    let mut runs = run_queue
        .subscribe()
        .await
        .map_err(|e| WorkerError::Messaging {
            message: e.to_string(),
        })?;
    tracing::info!(
        max_concurrency = config.queue.max_concurrency,
        "Worker ready, consuming run requests"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            next = runs.next() => {
                match next {
                    Some(Ok(received)) => {
                        tracing::debug!(workflow_id = %received.request.workflow_id, "Run request received");
                        worker.dispatch(received.request.clone());
                        if let Err(e) = received.ack().await {
                            tracing::warn!(error = %e, "Failed to acknowledge run request");
                        }
                    }
                    Some(Err(e)) => tracing::warn!(error = %e, "Failed to receive run request"),
                    None => {
                        tracing::warn!("Run request stream closed");
                        break;
                    }
                }
            }
        }
    }

    housekeeping.abort();
    Ok(())
}

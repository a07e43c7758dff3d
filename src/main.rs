use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use npj_agenda::{
    config::{Config, StorageBackend},
    routes,
    services::{
        calendar,
        database::{Database, PgAppointmentStore, PgNotificationStore},
        mailer,
        store::{AppointmentStore, JsonFileAppointmentStore, JsonFileNotificationStore, NotificationStore},
        ReminderScheduler,
    },
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    init_tracing(&config);
    info!("Starting npj-agenda service ({})...", config.environment);

    if config.is_production() && config.jwt_secret == Config::default().jwt_secret {
        return Err(anyhow::anyhow!("JWT_SECRET must be set in production"));
    }
    if config.is_development() {
        info!("Development mode: data directory {}", config.data_dir);
    }

    let (appointments, notifications) = open_stores(&config).await?;
    let mailer = mailer::from_config(&config)?;
    let calendar = calendar::from_config(&config);

    let app_state = Arc::new(AppState::build(
        config.clone(),
        appointments,
        notifications,
        mailer,
        calendar,
    )?);

    start_background_tasks(app_state.clone());

    let app = routes::build_router(app_state.clone());

    let addr = format!("{}:{}", config.server_host, config.server_port);
    info!("Starting server on http://{}", addr);

    axum::Server::bind(&addr.parse()?)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app_state.flush().await;
    info!("Server stopped");

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("npj_agenda={},tower_http=info", config.log_level))
    });

    if config.log_format == "json" || config.is_production() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn open_stores(
    config: &Config,
) -> anyhow::Result<(Arc<dyn AppointmentStore>, Arc<dyn NotificationStore>)> {
    match config.storage_backend {
        StorageBackend::File => {
            tokio::fs::create_dir_all(&config.data_dir).await?;
            info!("Using JSON file storage in {}", config.data_dir);

            Ok((
                Arc::new(JsonFileAppointmentStore::open(&config.data_dir).await?),
                Arc::new(JsonFileNotificationStore::open(&config.data_dir).await?),
            ))
        }
        StorageBackend::Postgres => {
            let db = match Database::new(config).await {
                Ok(db) => db,
                Err(e) => {
                    error!("Failed to create database connection: {}", e);
                    return Err(anyhow::anyhow!("Database initialization failed"));
                }
            };
            db.verify_connection().await?;
            db.ensure_schema().await?;
            info!("Database connection established successfully");

            Ok((
                Arc::new(PgAppointmentStore::new(db.clone())),
                Arc::new(PgNotificationStore::new(db)),
            ))
        }
    }
}

fn start_background_tasks(app_state: Arc<AppState>) {
    info!("Starting background tasks...");

    // Reminders that came due while the service was down
    let sweep_state = app_state.clone();
    tokio::spawn(async move {
        match sweep_state.dispatcher.dispatch_due_reminders(chrono::Utc::now()).await {
            Ok(0) => {}
            Ok(sent) => info!("Startup sweep sent {} overdue reminders", sent),
            Err(e) => error!("Startup reminder sweep failed: {}", e),
        }
    });

    let scheduler = ReminderScheduler::new(
        app_state.appointments.clone(),
        app_state.dispatcher.clone(),
        app_state.reminders.clone(),
        Duration::from_secs(app_state.config.reminder_idle_ceiling.max(1)),
    );
    tokio::spawn(scheduler.run());

    // Failed e-mail deliveries
    let retry_state = app_state.clone();
    tokio::spawn(async move {
        let mut interval = interval(Duration::from_secs(
            retry_state.config.notification_retry_interval.max(1),
        ));

        loop {
            interval.tick().await;
            if let Err(e) = retry_state.dispatcher.retry_failed().await {
                error!("Failed to retry notifications: {}", e);
            }
        }
    });

    info!("Background tasks started successfully");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

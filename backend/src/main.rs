use axum::{http::Method, routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod automations;
mod config;
mod credentials;
mod database;
mod engine;
mod error;
mod events;
mod handlers;
mod notifications;
mod poller;
mod scheduler;
mod tools;
mod users;
mod webhooks;

pub use error::{ApiError, ApiResult, AppError};

#[cfg(test)]
mod tests;

/// Shared state for every handler and control loop.
pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub config: config::Config,
    pub credentials: Arc<credentials::CredentialStore>,
    pub tools: Arc<dyn tools::ToolRegistry>,
    pub executor: Arc<engine::Executor>,
    pub dispatcher: Arc<events::Dispatcher>,
    pub poller: Arc<poller::PollingEngine>,
    pub scheduler: Arc<scheduler::SchedulerService>,
    pub gmail: Arc<webhooks::GmailClient>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let credentials = Arc::new(credentials::CredentialStore::new(
        db_pool.clone(),
        config.oauth.clone(),
    )?);

    // The tool catalog is a collaborator; the deployment registers its
    // handlers here behind the registry trait.
    let tools: Arc<dyn tools::ToolRegistry> = Arc::new(tools::StaticToolRegistry::new());

    let notifier: Arc<dyn notifications::Notifier> = match &config.smtp {
        Some(smtp) => Arc::new(notifications::EmailNotifier::new(smtp, db_pool.clone())),
        None => Arc::new(notifications::LogNotifier),
    };

    let executor = Arc::new(
        engine::Executor::new(Arc::clone(&tools), Arc::clone(&notifier)).with_timeout(
            std::time::Duration::from_secs(config.poller.action_timeout_secs),
        ),
    );

    let dispatcher = Arc::new(events::Dispatcher::new(db_pool.clone(), Arc::clone(&executor)));
    let poller = Arc::new(poller::PollingEngine::new(
        db_pool.clone(),
        Arc::clone(&tools),
        Arc::clone(&dispatcher),
        config.poller.clone(),
    ));
    let scheduler_service = Arc::new(scheduler::SchedulerService::new(
        db_pool.clone(),
        Arc::clone(&executor),
    ));

    let _cron = scheduler::start_background_jobs(
        Arc::clone(&scheduler_service),
        Arc::clone(&poller),
        Arc::clone(&dispatcher),
    )
    .await?;

    let server_addr = config.server_addr.clone();
    let app_state = Arc::new(AppState {
        db_pool,
        config,
        credentials,
        tools,
        executor,
        dispatcher,
        poller,
        scheduler: scheduler_service,
        gmail: Arc::new(webhooks::GmailClient::new()),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Relay Automation Engine v0.4" }))
        .nest("/webhooks", webhooks::webhook_routes())
        .merge(handlers::api_routes())
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&server_addr).await?;
    tracing::info!("Server running on {}", server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

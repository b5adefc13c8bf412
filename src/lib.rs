//! Firme Backend - digital-signature back office: library for app logic and testing

pub mod avatar;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod routes;
pub mod session;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    Router,
};
use std::{any::Any, net::SocketAddr, time::Duration};
use tower_http::{
    catch_panic::CatchPanicLayer, compression::CompressionLayer, cors::CorsLayer,
    limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer,
};

use crate::{
    config::{config, AppConfig, DEFAULT_SESSION_SECRET},
    error::ApiError,
};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("SESSION_SECRET must be set to a unique value in production")]
    InsecureSessionSecret,

    #[error("invalid HOST/PORT configuration: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// CORS for the configured origins; without any, the local dev server.
pub fn configure_cors(settings: &AppConfig) -> CorsLayer {
    let mut origins: Vec<HeaderValue> = settings
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if origins.is_empty() {
        origins = [
            format!("http://localhost:{}", settings.port),
            format!("http://127.0.0.1:{}", settings.port),
        ]
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| err.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());
    ApiError::Internal(format!("handler panicked: {}", detail)).into_response()
}

/// Requests running longer than `timeout` answer 408.
fn request_timeout(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)
}

/// Create and configure the application router.
pub fn create_app() -> Router {
    let settings = config();
    let cors = configure_cors(settings);
    tracing::info!("CORS configured");

    Router::new()
        .nest("/api", routes::api_router())
        .merge(routes::health_router())
        .merge(routes::pages::page_router(&settings.public_dir))
        .layer(logging::middleware::propagate_request_id_layer())
        .layer(middleware::from_fn(logging::middleware::log_request))
        .layer(logging::middleware::request_id_layer())
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(DefaultBodyLimit::max(settings.body_limit))
        .layer(RequestBodyLimitLayer::new(settings.body_limit))
        .layer(request_timeout(Duration::from_secs(
            settings.request_timeout_secs,
        )))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(cors)
}

/// Connect, migrate and seed the database. The server still starts without one.
async fn prepare_database(settings: &AppConfig) {
    let pool = match db::init_pool(None).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(
                "Failed to initialize database pool: {}. API calls will answer 503.",
                e
            );
            return;
        }
    };

    if let Err(e) = db::run_migrations(&pool, &settings.tables).await {
        tracing::error!("Failed to run database migrations: {}", e);
        return;
    }
    if let Err(e) = db::ensure_default_user(
        &pool,
        &settings.bootstrap_username,
        &settings.bootstrap_password,
    )
    .await
    {
        tracing::error!("Failed to create the default user: {}", e);
    }

    session::spawn_sweeper(pool);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}

/// Run the server (used by main).
pub async fn run() -> Result<(), StartupError> {
    dotenvy::dotenv().ok();

    let settings = config();

    // Guards MUST be held for the programme's lifetime; dropping them early
    // shuts down background log-writer threads and loses buffered log lines.
    let _log_guards = logging::init(&settings.environment);

    routes::health::init_start_time();

    if settings.is_production() && settings.session_secret == DEFAULT_SESSION_SECRET {
        return Err(StartupError::InsecureSessionSecret);
    }
    if settings.session_secret == DEFAULT_SESSION_SECRET {
        tracing::warn!("SESSION_SECRET is not set; using the development default");
    }

    tokio::fs::create_dir_all(&settings.upload_dir).await?;

    prepare_database(settings).await;

    let app = create_app();

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .map_err(|_| StartupError::InvalidAddress(format!("{}:{}", settings.host, settings.port)))?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

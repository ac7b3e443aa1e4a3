//! Fista API Gateway
//!
//! The HTTP entry point of the query orchestrator.
//! Handles:
//! - Query submission with Server-Sent Event streaming
//! - Conversation history and backend administration
//! - Rate limiting
//! - Observability (logging, metrics)

mod handlers;
mod middleware;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use fista_common::{config::AppConfig, metrics, QueryNormalizer};
use fista_search::{aggregation::AggregationEngine, connectors::ConnectorPool};
use fista_session::{ConversationStore, Orchestrator};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use middleware::{rate_limit_middleware, GlobalRateLimit};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pool: Arc<ConnectorPool>,
    pub store: Arc<ConversationStore>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Wire the connector pool, store and orchestrator from configuration
    pub async fn build(config: AppConfig) -> anyhow::Result<Self> {
        let pool = Arc::new(
            ConnectorPool::from_config(&config.backends)
                .await
                .context("Failed to build connector pool")?,
        );
        let store = Arc::new(ConversationStore::new(config.store.clone()));
        let engine = Arc::new(AggregationEngine::new(pool.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            engine,
            QueryNormalizer::from_config(&config.query),
            &config.orchestrator,
        ));

        Ok(Self {
            config: Arc::new(config),
            pool,
            store,
            orchestrator,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().context("Failed to load configuration")?;

    // Initialize tracing
    init_tracing(&config);

    info!("Starting Fista API Gateway v{}", fista_common::VERSION);

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .set_buckets(metrics::LATENCY_BUCKETS)
            .context("Invalid metrics buckets")?
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(addr = %metrics_addr, "Metrics exporter listening");
    }
    metrics::register_metrics();

    let state = AppState::build(config).await?;
    let config = state.config.clone();

    for backend in state.pool.status().await {
        info!(backend = %backend.name, enabled = backend.enabled, "Backend configured");
    }

    // Background eviction of idle conversations
    let sweeper_shutdown = CancellationToken::new();
    let sweeper = state
        .orchestrator
        .clone()
        .spawn_sweeper(config.store.sweep_interval(), sweeper_shutdown.clone());

    // Build the router
    let orchestrator = state.orchestrator.clone();
    let app = create_router(state);

    // Start the server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    let shutdown_timeout = config.shutdown_timeout();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Finalize in-flight queries so their event streams end
            if tokio::time::timeout(shutdown_timeout, orchestrator.shutdown())
                .await
                .is_err()
            {
                warn!(
                    timeout_secs = shutdown_timeout.as_secs(),
                    "Timed out waiting for active queries to finish"
                );
            }
        })
        .await?;

    sweeper_shutdown.cancel();
    let _ = sweeper.await;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // API routes
    let mut api_routes = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        // Conversation endpoints
        .route("/conversations", get(handlers::conversations::list_conversations))
        .route(
            "/conversations/{id}/messages",
            get(handlers::conversations::get_messages),
        )
        .route(
            "/conversations/{id}/queries",
            post(handlers::conversations::submit_query)
                .delete(handlers::conversations::cancel_query),
        )
        .route(
            "/conversations/{id}/status",
            get(handlers::conversations::get_status),
        )
        .route(
            "/conversations/{id}/messages/{message_id}/regenerate",
            post(handlers::conversations::regenerate),
        )
        .route(
            "/conversations/{id}/messages/{message_id}/feedback",
            post(handlers::conversations::feedback),
        )
        // Backend endpoints
        .route("/backends", get(handlers::backends::list_backends))
        .route("/backends/{name}/enable", post(handlers::backends::enable_backend))
        .route("/backends/{name}/disable", post(handlers::backends::disable_backend));

    if state.config.rate_limit.enabled {
        let rate_limit = GlobalRateLimit::from_config(&state.config.rate_limit);
        api_routes = api_routes.layer(axum::middleware::from_fn_with_state(
            rate_limit,
            rate_limit_middleware,
        ));
    }

    // Compose the app
    Router::new()
        .nest("/v1", api_routes)
        .layer(DefaultBodyLimit::max(state.config.server.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

// Modelgate API server

mod auth;
mod error;
mod health_monitor;
mod metrics;
mod middleware;
mod ratelimit;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use modelgate_core::{BreakerMap, HealthMap, LoadBalancer, ModelRegistry, Settings};
use modelgate_lifecycle::{ContainerRuntime, DockerRuntime, LifecycleManager};
use modelgate_storage::Database;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// OpenAPI documentation for the admin surface
#[derive(OpenApi)]
#[openapi(
    paths(
        routes::admin_models::list_models,
        routes::admin_models::create_model,
        routes::admin_models::update_model,
        routes::admin_models::delete_model,
        routes::admin_models::start_model,
        routes::admin_models::stop_model,
        routes::admin_models::apply_model,
        routes::admin_models::dry_run_model,
        routes::admin_models::archive_model,
        routes::admin_models::model_logs,
        routes::admin_models::model_readiness,
    ),
    components(
        schemas(
            routes::admin_models::ModelItem,
            routes::admin_models::CreateModelRequest,
            routes::admin_models::UpdateModelRequest,
            modelgate_core::EngineTuning,
        )
    ),
    tags(
        (name = "admin-models", description = "Engine lifecycle management")
    ),
    info(
        title = "Modelgate Admin API",
        version = "0.3.0",
        description = "Model lifecycle management for the inference gateway",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

fn cors_layer(settings: &Settings) -> CorsLayer {
    if settings.cors_allow_origins.trim() == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = settings
            .cors_origins()
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE])
            .allow_credentials(true)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modelgate_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("modelgate-api starting...");

    let settings = Arc::new(Settings::from_env());

    let db = Database::from_url(&settings.database_url)
        .await
        .context("Failed to connect to database")?;
    db.ensure_schema()
        .await
        .context("Failed to ensure database schema")?;
    tracing::info!("Connected to database");

    let metrics = Arc::new(Metrics::new().context("Failed to build metrics")?);

    // One shared upstream client; connection pool sized for heavy streaming
    let http = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(5))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .build()
        .context("Failed to build HTTP client")?;

    let registry = ModelRegistry::new();
    let health_map = HealthMap::new();
    let breaker = BreakerMap::new(
        settings.cb_enabled,
        settings.cb_failure_threshold,
        settings.cb_cooldown_sec,
    );
    let balancer = LoadBalancer::new();
    let limiter = RateLimiter::connect(settings.clone(), metrics.clone()).await;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect().map_err(|e| anyhow::anyhow!("container runtime: {e}"))?,
    );
    let lifecycle = Arc::new(LifecycleManager::new(
        db.clone(),
        runtime,
        registry.clone(),
        settings.clone(),
    ));

    // Restore routing state before the listener opens
    lifecycle.load_registry().await;

    // Best-effort: the artifact mounts must exist before any start
    for dir in [&settings.models_dir, &settings.hf_cache_dir] {
        if !dir.is_empty() {
            if let Err(err) = std::fs::create_dir_all(dir) {
                tracing::warn!(dir = %dir, error = %err, "could not create artifact directory");
            }
        }
    }

    let app_state = AppState {
        db: Arc::new(db),
        settings: settings.clone(),
        http,
        registry,
        health: health_map,
        breaker,
        balancer,
        limiter,
        metrics,
        lifecycle: lifecycle.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health_task = (settings.health_poll_sec > 0)
        .then(|| health_monitor::spawn(app_state.clone(), shutdown_rx));

    let app = Router::new()
        .route("/health", get(health))
        .route(
            "/metrics",
            get(metrics_handler).with_state(app_state.clone()),
        )
        .merge(routes::openai::routes(app_state.clone()))
        .merge(routes::admin_models::routes(app_state.clone()))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            middleware::body_size_limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            middleware::metrics,
        ))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .layer(cors_layer(&settings))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", settings.listen_addr);

    let shutdown = async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "shutdown signal handler failed");
        }
        tracing::info!("shutdown signal received");
        // Health monitor cancels first; in-flight requests drain below
        let _ = shutdown_tx.send(true);
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("Server error")?;

    if let Some(task) = health_task {
        let _ = task.await;
    }
    // Stop engines last so routing state stays coherent while draining
    lifecycle.stop_all_running().await;
    tracing::info!("shutdown complete");

    Ok(())
}

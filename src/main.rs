mod assemble;
mod config;
mod http;
mod images;
mod llm;
mod metrics;
mod models;
mod notify;
mod pipeline;
mod storage;
mod store;
mod templates;
mod worker;

use crate::assemble::ContentAssembler;
use crate::config::{Settings, parse_env_bool};
use crate::images::{FluxClient, ImageAcquirer};
use crate::llm::{GatewayClient, GatewayConfig};
use crate::models::StatusView;
use crate::notify::{NotificationDispatcher, Notifier};
use crate::pipeline::GenerationPipeline;
use crate::storage::{BucketClient, ImageUploader};
use crate::store::{MemoryStore, RedisStore, TaskStore};
use crate::templates::{ChromaBackend, RecommendationEngine};
use crate::worker::{WorkerContext, WorkerPool};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn TaskStore>,
    metrics: PrometheusHandle,
    metrics_key: Option<String>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let settings = Settings::from_env();

    let store: Arc<dyn TaskStore> = match std::env::var("REDIS_URL") {
        Ok(url) => {
            info!(target = "pagecraft", "using redis task store");
            Arc::new(RedisStore::connect(&url, settings.lease_timeout)?)
        }
        Err(_) => {
            warn!(
                target = "pagecraft",
                "REDIS_URL not set, using in-memory task store"
            );
            Arc::new(MemoryStore::new(settings.lease_timeout))
        }
    };

    let engine = Arc::new(RecommendationEngine::new(
        Arc::new(ChromaBackend::from_env()),
        &settings,
    ));
    let writer = Arc::new(GatewayClient::new(GatewayConfig::from_env()));
    let pipeline = Arc::new(GenerationPipeline::new(
        store.clone(),
        ImageAcquirer::new(Arc::new(FluxClient::from_env()), &settings),
        Arc::new(ImageUploader::new(Arc::new(BucketClient::from_env()))),
        ContentAssembler::new(writer, engine),
    ));
    let notifier: Arc<dyn Notifier> = Arc::new(NotificationDispatcher::from_env());

    // Ops toggle: run only the HTTP surface, e.g. while draining a deploy.
    let pool = if parse_env_bool("WORKERS_DISABLED") {
        warn!(target = "pagecraft", "worker pool disabled");
        None
    } else {
        Some(WorkerPool::spawn(WorkerContext {
            store: store.clone(),
            pipeline,
            notifier,
            settings: settings.clone(),
        }))
    };

    let metrics_handle = PrometheusBuilder::new().install_recorder()?;
    let state = AppState {
        store,
        metrics: metrics_handle,
        metrics_key: std::env::var("METRICS_KEY").ok(),
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/tasks/{id}", get(task_status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".into())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        target = "pagecraft",
        addr = %addr,
        workers = settings.pool_size,
        "pagecraft-worker listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(target = "pagecraft", "shutdown signal received");
        })
        .await?;

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    info!(target = "pagecraft", "shutdown complete");
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn render_metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(expected) = &state.metrics_key {
        let presented = headers.get("x-metrics-key").and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    state.metrics.render().into_response()
}

async fn task_status(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get(id).await {
        Ok(Some(task)) => Json(StatusView::from_task(&task)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(target = "pagecraft", task_id = %id, error = %err, "status lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

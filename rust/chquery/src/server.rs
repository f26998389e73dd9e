use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    progress::{ProgressTracker, QueryProgress},
    query::{CompileRequest, CompileResponse, FeatureSet, QueryEngine},
    state::AppState,
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let features = Arc::new(FeatureSet::new(config.features.iter().cloned()));
        let query = QueryEngine::new(Arc::clone(&config), features);
        let progress = ProgressTracker::new(config.progress_buffer);
        let state = AppState::new(Arc::clone(&config), query, progress);

        Ok(Self { config, state })
    }

    /// Shared state, for embedding the compiler next to an executor.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/v1/query/compile", post(Self::compile))
            .route("/api/v1/query/progress/:query_id", get(Self::progress))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, features = ?self.config.features, "query compiler listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn compile(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<CompileRequest>,
    ) -> Result<Json<CompileResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let response = state.query.compile_response(&request)?;
        Ok(Json(response))
    }

    async fn progress(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(query_id): Path<String>,
    ) -> Result<Json<QueryProgress>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.progress.snapshot(&query_id)?))
    }
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}

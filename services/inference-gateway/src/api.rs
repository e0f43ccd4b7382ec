//! HTTP surface: validates bodies, asks the cache for the active model, runs the
//! engine, and passes registry operations through to the store.

use crate::cache::{CacheError, CacheStatus, ModelCache};
use crate::engine::{classify, FeatureVector, InferenceError};
use crate::store::{Experiment, ModelSource, ModelStore, ModelVersion, RegisteredModel, RunInfo, Stage, StoreError, VersionId};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serve_core::metrics::record_prediction;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument};

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<ModelCache>,
    pub store: Arc<dyn ModelStore>,
}

impl AppState {
    pub fn new(cache: Arc<ModelCache>) -> Self {
        let store = cache.store().clone();
        Self { cache, store }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/predict", post(predict))
        .route("/load-model", post(load_model))
        .route("/register-model", post(register_model))
        .route("/model/:name/:version/promote", post(promote))
        .route("/model/:name", delete(delete_model))
        .route("/model/:name/:version", delete(delete_version))
        .route("/experiments", get(list_experiments))
        .route("/experiments/:name/runs", get(list_runs))
        .route("/models", get(list_models))
        .route("/models/:name/versions", get(list_versions))
        .with_state(state)
        .merge(serve_core::health_router())
}

#[derive(Debug)]
pub enum ApiError {
    NotReady,
    LoadInProgress,
    LoadFailed(String),
    Registry(String),
    Inference(InferenceError),
    NotFound(String),
    Internal(String),
}

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::NotReady => Self::NotReady,
            CacheError::LoadInProgress => Self::LoadInProgress,
            CacheError::Fetch(_) | CacheError::Timeout(_) => Self::LoadFailed(e.to_string()),
        }
    }
}

impl ApiError {
    fn registry(e: StoreError) -> Self { Self::Registry(e.to_string()) }
    fn listing(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => Self::NotFound(e.to_string()),
            StoreError::Registry(_) | StoreError::Pattern(_) => Self::Registry(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "Model not loaded".to_string()),
            Self::LoadInProgress => (StatusCode::CONFLICT, "Model load already in progress; retry later".to_string()),
            Self::LoadFailed(msg) | Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Registry(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Inference(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Inference failed: {e}")),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn root() -> Json<serde_json::Value> { Json(serde_json::json!({"message": "Welcome to the model serving gateway"})) }
async fn health() -> Json<serde_json::Value> { Json(serde_json::json!({"status": "ok"})) }
async fn status(State(state): State<AppState>) -> Json<CacheStatus> { Json(state.cache.status()) }

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub sepal_length: f64,
    pub sepal_width: f64,
    pub petal_length: f64,
    pub petal_width: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub prediction: String,
    pub probabilities: BTreeMap<String, f64>,
    pub model_version: VersionId,
}

async fn predict(State(state): State<AppState>, Json(req): Json<PredictRequest>) -> ApiResult<PredictResponse> {
    let started = Instant::now();
    let active = state.cache.get().map_err(|e| {
        record_prediction("not_ready", started.elapsed());
        ApiError::from(e)
    })?;
    let features = FeatureVector::new(req.sepal_length, req.sepal_width, req.petal_length, req.petal_width);
    match classify(active.handle.as_ref(), &features) {
        Ok(out) => {
            record_prediction("ok", started.elapsed());
            Ok(Json(PredictResponse { prediction: out.label, probabilities: out.probabilities.into_iter().collect(), model_version: active.version }))
        }
        Err(e) => {
            error!(version = %active.version, error = %e, "inference rejected validated input; model contract mismatch");
            record_prediction("error", started.elapsed());
            Err(ApiError::Inference(e))
        }
    }
}

/// `{run_id}`, `{model_name, stage}` or `{experiment_name, run_name_pattern}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LoadModelRequest {
    Run { run_id: String },
    Registry { model_name: String, stage: String },
    Latest { experiment_name: String, run_name_pattern: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadModelResponse { pub status: String, pub model_version: VersionId }

#[instrument(skip_all)]
async fn load_model(State(state): State<AppState>, Json(req): Json<LoadModelRequest>) -> ApiResult<LoadModelResponse> {
    let source = match req {
        LoadModelRequest::Run { run_id } => ModelSource::RunId(run_id),
        LoadModelRequest::Registry { model_name, stage } => {
            let stage = stage.parse::<Stage>().map_err(ApiError::registry)?;
            ModelSource::Registry { name: model_name, stage }
        }
        LoadModelRequest::Latest { experiment_name, run_name_pattern } => ModelSource::Latest { experiment: experiment_name, run_name_pattern },
    };
    // detached so a dropped connection cannot abandon a load halfway
    let cache = state.cache.clone();
    let version = tokio::spawn(async move { cache.load(&source).await })
        .await
        .map_err(|e| ApiError::Internal(format!("load task failed: {e}")))??;
    Ok(Json(LoadModelResponse { status: "loaded".into(), model_version: version }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterModelRequest { pub run_id: String, pub model_name: String }

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterModelResponse { pub model_name: String, pub version: u32, pub status: String }

async fn register_model(State(state): State<AppState>, Json(req): Json<RegisterModelRequest>) -> ApiResult<RegisterModelResponse> {
    let mv = state.store.register(&req.run_id, &req.model_name).await.map_err(ApiError::registry)?;
    Ok(Json(RegisterModelResponse { model_name: mv.name, version: mv.version, status: "READY".into() }))
}

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    pub stage: String,
    #[serde(default)]
    pub archive_existing_versions: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromoteResponse { pub model_name: String, pub version: u32, pub new_stage: Stage }

#[instrument(skip_all)]
async fn promote(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, u32)>,
    Json(req): Json<PromoteRequest>,
) -> ApiResult<PromoteResponse> {
    let stage = req.stage.parse::<Stage>().map_err(ApiError::registry)?;
    let mv = state.store.promote(&name, version, stage, req.archive_existing_versions).await.map_err(ApiError::registry)?;
    info!(model = %mv.name, version = mv.version, stage = %mv.stage, "promoted");
    Ok(Json(PromoteResponse { model_name: mv.name, version: mv.version, new_stage: mv.stage }))
}

async fn delete_model(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<serde_json::Value> {
    state.store.delete_model(&name).await.map_err(ApiError::registry)?;
    Ok(Json(serde_json::json!({"status": "deleted", "model_name": name})))
}

async fn delete_version(State(state): State<AppState>, Path((name, version)): Path<(String, u32)>) -> ApiResult<serde_json::Value> {
    state.store.delete_version(&name, version).await.map_err(ApiError::registry)?;
    Ok(Json(serde_json::json!({"status": "deleted", "model_name": name, "version": version})))
}

async fn list_experiments(State(state): State<AppState>) -> ApiResult<Vec<Experiment>> {
    Ok(Json(state.store.list_experiments().await.map_err(ApiError::listing)?))
}

async fn list_runs(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Vec<RunInfo>> {
    Ok(Json(state.store.list_runs(&name).await.map_err(ApiError::listing)?))
}

async fn list_models(State(state): State<AppState>) -> ApiResult<Vec<RegisteredModel>> {
    Ok(Json(state.store.list_models().await.map_err(ApiError::listing)?))
}

async fn list_versions(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Vec<ModelVersion>> {
    Ok(Json(state.store.list_versions(&name).await.map_err(ApiError::listing)?))
}

/// Bind and serve until ctrl-c.
pub async fn serve(bind_addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    serve_until(listener, state, async { let _ = tokio::signal::ctrl_c().await; }).await
}

/// Serve until `shutdown` resolves, then drain in-flight requests. Readiness and
/// liveness are withdrawn as soon as shutdown begins.
pub async fn serve_until<F>(listener: tokio::net::TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            serve_core::clear_ready();
            serve_core::mark_not_live();
            info!("shutdown requested; draining connections");
        })
        .await?;
    Ok(())
}

//! HTTP surface: routing, handlers and the error-to-status mapping.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use kiln_core::{
    gpu_available, GateSnapshot, GenerationError, GenerationMode, GenerationRequest, GpuMemory,
};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::state::AppState;

/// Build the API router over shared state.
pub fn router(state: Arc<AppState>, body_limit: usize) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/system", get(system))
        .route("/api/txt2img", post(txt2img))
        .route("/api/img2img", post(img2img))
        .route("/api/inpaint", post(inpaint))
        .route("/api/progress", get(progress))
        .route("/api/interrupt", post(interrupt))
        .route("/api/memory", get(memory))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Every failure leaves the server as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    Generation(GenerationError),
    BadRequest(String),
}

impl From<GenerationError> for ApiError {
    fn from(e: GenerationError) -> Self {
        Self::Generation(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Generation(e) => {
                let status = match e {
                    GenerationError::Validation(_) => StatusCode::BAD_REQUEST,
                    GenerationError::Busy => StatusCode::TOO_MANY_REQUESTS,
                    GenerationError::Pipeline(_) | GenerationError::Decode(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Serialize, Debug)]
pub struct GenerationResponse {
    pub success: bool,
    pub images: Vec<String>,
    pub duration: f64,
}

async fn txt2img(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ApiError> {
    generate(&state, GenerationMode::TextToImage, payload).await
}

async fn img2img(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ApiError> {
    generate(&state, GenerationMode::ImageToImage, payload).await
}

async fn inpaint(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ApiError> {
    generate(&state, GenerationMode::Inpaint, payload).await
}

/// Runs the generation on the blocking pool so the runtime keeps serving progress queries.
async fn generate(
    state: &AppState,
    mode: GenerationMode,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let Json(request) = payload?;
    let generator = state.generator.clone();
    let result = tokio::task::spawn_blocking(move || generator.generate(mode, &request))
        .await
        .map_err(|e| GenerationError::Pipeline(format!("generation task failed: {e}")))??;
    Ok(Json(GenerationResponse {
        success: true,
        images: result.images,
        duration: result.duration_seconds,
    }))
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub timestamp: String,
    pub gpu_available: bool,
    pub device: String,
    pub pipelines_loaded: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let pipeline = state.generator.pipeline();
    Json(HealthResponse {
        status: "healthy",
        message: "Backend server is running",
        timestamp: chrono::Local::now().to_rfc3339(),
        gpu_available: gpu_available(),
        device: pipeline.device(),
        pipelines_loaded: pipeline.loaded().all(),
    })
}

#[derive(Serialize, Debug)]
pub struct SystemResponse {
    pub gpu_available: bool,
    pub device: String,
    pub backend: &'static str,
    pub version: &'static str,
    pub is_generating: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_memory_total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_memory_allocated: Option<f64>,
}

/// The accelerator backend compiled into this binary.
fn compiled_backend() -> &'static str {
    if cfg!(feature = "cuda") {
        "cuda"
    } else if cfg!(feature = "metal") {
        "metal"
    } else {
        "cpu"
    }
}

async fn system(State(state): State<Arc<AppState>>) -> Json<SystemResponse> {
    let gpu = query_gpu(&state).await;
    Json(SystemResponse {
        gpu_available: gpu_available(),
        device: state.generator.pipeline().device(),
        backend: compiled_backend(),
        version: env!("CARGO_PKG_VERSION"),
        is_generating: state.generator.gate().is_busy(),
        gpu_name: gpu.as_ref().map(|gpu| gpu.name.clone()),
        gpu_memory_total: gpu.as_ref().map(|gpu| gpu.total_gb),
        gpu_memory_allocated: gpu.as_ref().map(|gpu| gpu.allocated_gb),
    })
}

async fn memory(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let gpu = match query_gpu(&state).await {
        Some(gpu) => json!(gpu),
        None => json!({}),
    };
    let cpu_threads = std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1);
    Json(json!({
        "gpu": gpu,
        "system": { "cpu_threads": cpu_threads },
    }))
}

async fn query_gpu(state: &AppState) -> Option<GpuMemory> {
    let telemetry = state.telemetry.clone();
    tokio::task::spawn_blocking(move || telemetry.query())
        .await
        .ok()
        .flatten()
}

async fn progress(State(state): State<Arc<AppState>>) -> Json<GateSnapshot> {
    Json(state.generator.gate().snapshot())
}

async fn interrupt(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let generator = state.generator.clone();
    // Cache clearing may touch the device.
    if let Err(e) = tokio::task::spawn_blocking(move || generator.interrupt()).await {
        warn!("interrupt task failed: {e}");
    }
    Json(json!({ "success": true }))
}

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use floorswap_engine::{FloorError, FloorJob, FloorOutcome, FloorReplaceEngine, UploadedImage};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;
const OUTPUTS_ROUTE: &str = "/outputs";
const SERVED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

struct AppState {
    engine: FloorReplaceEngine,
}

pub async fn serve(engine: FloorReplaceEngine, bind: &str) -> Result<()> {
    let outputs_dir = engine.config().outputs_dir.clone();
    std::fs::create_dir_all(&outputs_dir)
        .with_context(|| format!("failed to create {}", outputs_dir.display()))?;

    let app = router(engine);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    println!("floorswap listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await.context("server stopped")?;
    Ok(())
}

pub fn router(engine: FloorReplaceEngine) -> Router {
    let cors = cors_layer(&engine.config().cors_origins);
    let outputs = ServeDir::new(&engine.config().outputs_dir);
    let state = Arc::new(AppState { engine });

    Router::new()
        .route("/api/health", get(health))
        .route("/api/generate-floor", post(generate_floor))
        .nest_service(OUTPUTS_ROUTE, outputs)
        .with_state(state)
        .layer(middleware::from_fn(only_images_under_outputs))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
}

/// `/outputs` hands out generated images and nothing else.
async fn only_images_under_outputs(request: Request, next: Next) -> Response {
    let path = request.uri().path();
    let under_outputs = path == OUTPUTS_ROUTE
        || path
            .strip_prefix(OUTPUTS_ROUTE)
            .is_some_and(|rest| rest.starts_with('/'));
    if under_outputs && !is_served_image(path) {
        return ApiError::new(StatusCode::NOT_FOUND, "Not Found").into_response();
    }
    next.run(request).await
}

fn is_served_image(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SERVED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct GenerateFloorResponse {
    output_paths: Vec<String>,
    reference_path: String,
    reference_name: String,
    reference_sha256: String,
    prompt_used: String,
}

impl From<FloorOutcome> for GenerateFloorResponse {
    fn from(outcome: FloorOutcome) -> Self {
        let output_paths = outcome.output_urls();
        let (reference_path, reference_name, reference_sha256) = outcome
            .references
            .into_iter()
            .next()
            .map(|reference| (reference.path, reference.name, reference.sha256))
            .unwrap_or_default();
        Self {
            output_paths,
            reference_path,
            reference_name,
            reference_sha256,
            prompt_used: outcome.prompt_used,
        }
    }
}

async fn generate_floor(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<GenerateFloorResponse>, ApiError> {
    let job = read_job(multipart).await?;
    let outcome = tokio::task::spawn_blocking(move || state.engine.generate(&job))
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("generation task failed: {err}")))??;
    Ok(Json(GenerateFloorResponse::from(outcome)))
}

async fn read_job(mut multipart: Multipart) -> Result<FloorJob, ApiError> {
    let mut job = FloorJob::default();
    let mut room = None;
    let mut reference = None;
    let mut reference2 = None;

    while let Some(field) = multipart.next_field().await.map_err(ApiError::bad_request)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "room_image" | "mask_image" => {
                let filename = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(ApiError::bad_request)?;
                if bytes.is_empty() {
                    continue;
                }
                let upload = UploadedImage::new(bytes.to_vec(), filename, content_type);
                if name == "room_image" {
                    room = Some(upload);
                } else {
                    job.mask = Some(upload);
                }
            }
            _ => {
                let value = field.text().await.map_err(ApiError::bad_request)?;
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                match name.as_str() {
                    "reference_path" => reference = Some(value.to_string()),
                    "reference2_path" => reference2 = Some(value.to_string()),
                    "product_prompt" => job.product_hints = Some(value.to_string()),
                    "model" => job.model = Some(value.to_string()),
                    "temperature" => job.temperature = Some(parse_field(&name, value)?),
                    "top_p" => job.top_p = Some(parse_field(&name, value)?),
                    "seed" => job.seed = Some(parse_field(&name, value)?),
                    _ => {}
                }
            }
        }
    }

    job.room = room.ok_or_else(|| ApiError::bad_request("room_image is required"))?;
    job.reference_paths = reference
        .into_iter()
        .chain(reference2)
        .collect();
    if job.reference_paths.is_empty() {
        return Err(ApiError::bad_request("reference_path is required"));
    }
    Ok(job)
}

fn parse_field<T: FromStr>(name: &str, raw: &str) -> Result<T, ApiError> {
    raw.parse::<T>()
        .map_err(|_| ApiError::bad_request(format!("{name} must be a number, got {raw:?}")))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl ToString) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail.to_string())
    }
}

fn status_for(err: &FloorError) -> StatusCode {
    match err {
        FloorError::InvalidPath { .. }
        | FloorError::FileNotFound { .. }
        | FloorError::Decode { .. }
        | FloorError::InvalidJob(_) => StatusCode::BAD_REQUEST,
        FloorError::PathNotAllowed { .. } => StatusCode::FORBIDDEN,
        FloorError::EmptyResult { .. } => StatusCode::BAD_GATEWAY,
        FloorError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        FloorError::Authentication(_)
        | FloorError::Generation { .. }
        | FloorError::Encode(_)
        | FloorError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<FloorError> for ApiError {
    fn from(err: FloorError) -> Self {
        Self::new(status_for(&err), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

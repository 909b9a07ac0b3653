use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State, multipart::MultipartError},
    http::{HeaderValue, StatusCode},
    response::Html,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{ImageSize, InferenceResponse, LABELS, ModelMetadata, ModelRegistry},
};

/// Multipart field carrying the uploaded image.
pub const UPLOAD_FIELD: &str = "file";

/// Drawing-canvas page that posts to the inference route.
const DEMO_PAGE: &str = include_str!("../static/index.html");

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
}

#[derive(Serialize)]
struct MetadataResponse {
    model: ModelMetadata,
    labels: [&'static str; 10],
    input_size: Option<ImageSize>,
}

#[derive(Debug, Deserialize)]
struct ItemQuery {
    q: Option<String>,
}

pub fn build_router(config: Arc<AppConfig>, registry: Arc<ModelRegistry>) -> Router {
    let cors = cors_layer(&config.cors_allow_origins);
    let body_limit = DefaultBodyLimit::max(config.max_upload_bytes);
    let state = AppState { registry, config };

    Router::new()
        .route("/", get(root))
        .route("/items/:item_id", get(read_item))
        .route("/health", get(health))
        .route("/metadata", get(metadata))
        .route("/demo", get(demo))
        .route("/infer", post(infer))
        .route("/infer/", post(infer))
        .with_state(state)
        .layer(body_limit)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

async fn root() -> Json<Value> {
    Json(json!({ "Hello": "World" }))
}

async fn read_item(Path(item_id): Path<i64>, Query(query): Query<ItemQuery>) -> Json<Value> {
    Json(json!({ "item_id": item_id, "q": query.q }))
}

async fn health() -> &'static str {
    "ok"
}

async fn demo() -> Html<&'static str> {
    Html(DEMO_PAGE)
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    let processor = state.registry.classifier().processor();
    Json(MetadataResponse {
        model: state.registry.metadata(),
        labels: LABELS,
        input_size: processor.do_resize.then_some(processor.size),
    })
}

async fn infer(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<InferenceResponse>, ServiceError> {
    let (file_name, bytes) = read_upload(multipart).await?;
    info!(file_name = file_name.as_deref(), bytes = bytes.len(), "received image upload");

    let predictions = state.registry.classify_bytes(bytes).await?;
    if let Some((label, probability)) = predictions.top() {
        info!(label, probability, "inference complete");
    }
    Ok(Json(InferenceResponse { predictions }))
}

/// Returns the part named `file`, or the first part carrying a file name.
async fn read_upload(mut multipart: Multipart) -> Result<(Option<String>, Vec<u8>), ServiceError> {
    let mut fallback = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let is_upload = field.name() == Some(UPLOAD_FIELD);
        if !is_upload && (fallback.is_some() || field.file_name().is_none()) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map_err(multipart_error)?.to_vec();
        if is_upload {
            return Ok((file_name, bytes));
        }
        fallback = Some((file_name, bytes));
    }
    fallback.ok_or_else(|| {
        ServiceError::BadRequest(format!("multipart field '{UPLOAD_FIELD}' is required"))
    })
}

fn multipart_error(err: MultipartError) -> ServiceError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServiceError::PayloadTooLarge
    } else {
        ServiceError::BadRequest(err.body_text())
    }
}

use crate::pipeline::Pipeline;
use crate::response::IngestResponse;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// Bounds the number of jobs running at once
    pub permits: Arc<Semaphore>,
    pub service_name: String,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, max_concurrent_jobs: usize, service_name: impl Into<String>) -> Self {
        Self {
            pipeline,
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            service_name: service_name.into(),
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/invoke", post(invoke))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
        "availableJobSlots": state.permits.available_permits()
    }))
}

/// Run one ingestion job for a notification document. The body is taken
/// as-is so malformed documents still get a JSON job response.
#[instrument(skip(state, body), fields(body_len = body.len()))]
async fn invoke(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResponse>), (StatusCode, Json<ApiError>)> {
    let _permit = state.permits.acquire().await.map_err(|e| {
        error!(error = %e, "Job semaphore closed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError {
                error: "Service is shutting down".to_string(),
                code: "UNAVAILABLE".to_string(),
            }),
        )
    })?;

    let response = state.pipeline.handle_bytes(&body).await;
    let status = if response.is_error() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };

    Ok((status, Json(response)))
}

/// Start the invoke API server
pub async fn start_api_server(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!(address = %addr, "Starting invoke API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::MemoryObjectStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let pipeline = Pipeline::new(Arc::new(Config::default()), Arc::new(MemoryObjectStore::new()));
        AppState::new(Arc::new(pipeline), 2, "photo-ingest")
    }

    fn invoke_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/invoke")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = create_router(test_state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["availableJobSlots"], 2);
    }

    #[tokio::test]
    async fn test_skipped_is_ok() {
        let response = create_router(test_state())
            .oneshot(invoke_request(serde_json::json!({
                "bucket": "ingress-1",
                "key": "clip.mov",
                "size": 10
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "skipped");
        assert_eq!(body["reason"], "unsupported_format");
    }

    #[tokio::test]
    async fn test_error_is_server_error() {
        let response = create_router(test_state())
            .oneshot(invoke_request(serde_json::json!({
                "bucket": "ingress-1",
                "key": "missing.jpg",
                "size": 10
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["errorCategory"], "source_download");
    }

    #[tokio::test]
    async fn test_malformed_body_is_json_error() {
        let request = Request::builder()
            .method("POST")
            .uri("/invoke")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = create_router(test_state()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["errorCategory"], "validation");
        assert_eq!(body["processingPhase"], "init");
    }

    #[tokio::test]
    async fn test_body_without_content_type_is_processed() {
        let request = Request::builder()
            .method("POST")
            .uri("/invoke")
            .body(Body::from(r#"{"bucket": "ingress-1", "key": "clip.mov", "size": 10}"#))
            .unwrap();
        let response = create_router(test_state()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "skipped");
        assert_eq!(body["reason"], "unsupported_format");
    }
}

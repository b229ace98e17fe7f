//! HTTP and WebSocket surface of the control plane.

pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::auth::Authenticator;
use crate::blob::BlobStore;
use crate::error::{Error, StorageError};
use crate::events::{DashboardEvent, EventHub};
use crate::jobs::JobQueue;
use crate::runners::RunnerRegistry;
use crate::screen::ScreenHub;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub registry: Arc<RunnerRegistry>,
    pub events: Arc<EventHub>,
    pub screens: Arc<ScreenHub>,
    pub blobs: Arc<dyn BlobStore>,
    pub auth: Arc<dyn Authenticator>,
    /// Interval runners are told to heartbeat at.
    pub heartbeat_interval: Duration,
    pub max_upload_bytes: usize,
}

impl AppState {
    /// Current jobs and runners, for dashboards that (re)connect or lag.
    pub async fn snapshot(&self) -> DashboardEvent {
        DashboardEvent::Snapshot {
            jobs: self.queue.snapshot().await,
            runners: self.registry.list().await,
        }
    }
}

/// Build the full router: REST under `/api/v1`, WebSockets under `/ws`.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = DefaultBodyLimit::max(state.max_upload_bytes);

    let api = Router::new()
        .route("/jobs", post(routes::create_job).get(routes::list_jobs))
        .route("/jobs/{id}", get(routes::get_job))
        .route("/jobs/{id}/pause", post(routes::pause_job))
        .route("/jobs/{id}/resume", post(routes::resume_job))
        .route("/jobs/{id}/cancel", post(routes::cancel_job))
        .route("/tasks/{id}", get(routes::get_task))
        .route("/tasks/{id}/status", post(routes::report_status))
        .route("/tasks/{id}/logs", get(routes::get_task_logs))
        .route("/stats", get(routes::stats))
        .route("/runners", get(routes::list_runners))
        .route("/runners/tokens", post(routes::issue_token))
        .route("/runners/register", post(routes::register_runner))
        .route(
            "/runners/{id}",
            get(routes::get_runner)
                .patch(routes::rename_runner)
                .delete(routes::delete_runner),
        )
        .route("/runners/{id}/heartbeat", post(routes::heartbeat))
        .route("/runners/{id}/tasks/next", get(routes::next_task))
        .route("/runners/{id}/screen/frame", post(routes::upload_frame))
        .route("/runners/{id}/screen/status", get(routes::screen_status))
        .route("/files/upload", post(routes::upload_file))
        .route("/files/{id}/download", get(routes::download_file))
        .route("/artifacts/upload", post(routes::upload_artifact));

    Router::new()
        .nest("/api/v1", api)
        .route("/ws", get(crate::events::ws::dashboard_ws))
        .route("/ws/screen/{runner_id}", get(crate::screen::ws::screen_ws))
        .route("/health", get(health))
        .layer(body_limit)
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::NotFound { .. } | Error::Storage(StorageError::BlobNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Transport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::auth::TokenAuthority;
    use crate::blob::FsBlobStore;

    async fn app(dir: &std::path::Path) -> Router {
        let events = Arc::new(EventHub::new(16));
        let auth: Arc<dyn Authenticator> = Arc::new(TokenAuthority::new(vec!["t".to_string()]));
        router(AppState {
            queue: Arc::new(JobQueue::new(events.clone(), 1)),
            registry: Arc::new(RunnerRegistry::new(
                auth.clone(),
                events.clone(),
                Duration::from_secs(90),
            )),
            events,
            screens: Arc::new(ScreenHub::new(Duration::from_secs(10))),
            blobs: Arc::new(FsBlobStore::open(dir).await.unwrap()),
            auth,
            heartbeat_interval: Duration::from_secs(30),
            max_upload_bytes: 1024,
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_outside_api_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(dir.path())
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app(dir.path())
            .await
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn errors_carry_status_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(dir.path())
            .await
            .oneshot(
                Request::post("/api/v1/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].is_string());

        let id = uuid::Uuid::new_v4();
        let resp = app(dir.path())
            .await
            .oneshot(
                Request::get(format!("/api/v1/tasks/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(dir.path())
            .await
            .oneshot(
                Request::post("/api/v1/runners/register")
                    .header("content-type", "application/json")
                    .body(Body::from(vec![b' '; 4096]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[test]
    fn error_mapping() {
        let cases = [
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
            (Error::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (Error::not_found("job", 1), StatusCode::NOT_FOUND),
            (
                Error::Storage(StorageError::BlobNotFound("b".into())),
                StatusCode::NOT_FOUND,
            ),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}

//! REST handlers.

use std::collections::HashMap;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Multipart, Path, Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use uuid::Uuid;

use super::AppState;
use crate::blob::BlobRef;
use crate::error::{Error, Result};
use crate::jobs::model::{
    Job, JobDetail, JobPage, JobSpec, JobStatus, StatusReport, Task, TaskAssignment, TaskLogs,
};
use crate::runners::model::{
    HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse, RenameRequest, Runner,
    RunnerStatus,
};
use crate::screen::model::{FrameUpload, ScreenStatus};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;
const DOWNLOAD_CHUNK: usize = 64 * 1024;

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| Error::Validation(e.body_text()))
}

// ── Jobs ────────────────────────────────────────────────────────────────

pub async fn create_job(
    State(state): State<AppState>,
    payload: std::result::Result<Json<JobSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<Job>)> {
    let spec = json_body(payload)?;
    let job = state.queue.enqueue(spec).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    limit: Option<usize>,
    offset: Option<usize>,
    status: Option<String>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobPage>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(Error::Validation)?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let page = state
        .queue
        .list_jobs(limit, query.offset.unwrap_or(0), status)
        .await;
    Ok(Json(page))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobDetail>> {
    Ok(Json(state.queue.get_job(id).await?))
}

pub async fn pause_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Job>> {
    Ok(Json(state.queue.pause(id).await?))
}

pub async fn resume_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Job>> {
    Ok(Json(state.queue.resume(id).await?))
}

pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Job>> {
    Ok(Json(state.queue.cancel_job(id).await?))
}

// ── Tasks ───────────────────────────────────────────────────────────────

pub async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Task>> {
    Ok(Json(state.queue.get_task(id).await?))
}

pub async fn get_task_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskLogs>> {
    let task = state.queue.get_task(id).await?;
    Ok(Json(TaskLogs::from(&task)))
}

pub async fn report_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: std::result::Result<Json<StatusReport>, JsonRejection>,
) -> Result<Json<Task>> {
    let report = json_body(payload)?;
    Ok(Json(state.queue.report_status(id, report).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub jobs: HashMap<String, usize>,
    pub tasks: HashMap<String, usize>,
    pub runners: HashMap<String, usize>,
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let queue = state.queue.stats().await;
    let mut runners = HashMap::new();
    for runner in state.registry.list().await {
        *runners.entry(runner.status.to_string()).or_default() += 1;
    }
    Json(StatsResponse {
        jobs: queue.jobs,
        tasks: queue.tasks,
        runners,
    })
}

// ── Runners ─────────────────────────────────────────────────────────────

pub async fn issue_token(State(state): State<AppState>) -> impl IntoResponse {
    let token = state.auth.issue_token().await;
    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "token": token })),
    )
}

pub async fn register_runner(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>> {
    let request = json_body(payload)?;
    let registration = state.registry.register(request).await?;
    let runner_id = registration.runner.id;

    // A live runner registering again has restarted and lost its work.
    if registration
        .previous_status
        .is_some_and(|s| s != RunnerStatus::Offline)
    {
        let released = state.queue.release_runner(runner_id).await;
        if released > 0 {
            warn!(runner_id = %runner_id, released, "Runner restarted; released its tasks");
        }
    }

    Ok(Json(RegisterResponse {
        runner_id,
        heartbeat_interval_secs: state.heartbeat_interval.as_secs(),
    }))
}

async fn with_current_tasks(state: &AppState, mut runner: Runner) -> Runner {
    runner.current_tasks = state.queue.held_by(runner.id).await;
    runner
}

pub async fn list_runners(State(state): State<AppState>) -> Json<Vec<Runner>> {
    let mut runners = Vec::new();
    for runner in state.registry.list().await {
        runners.push(with_current_tasks(&state, runner).await);
    }
    Json(runners)
}

pub async fn get_runner(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Runner>> {
    let runner = state.registry.get(id).await?;
    Ok(Json(with_current_tasks(&state, runner).await))
}

pub async fn rename_runner(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: std::result::Result<Json<RenameRequest>, JsonRejection>,
) -> Result<Json<Runner>> {
    let request = json_body(payload)?;
    let runner = state.registry.rename(id, &request.name).await?;
    Ok(Json(with_current_tasks(&state, runner).await))
}

/// Forget a runner. Tasks it still holds go back to the queue.
pub async fn delete_runner(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.registry.remove(id).await?;
    let released = state.queue.release_runner(id).await;
    if released > 0 {
        info!(runner_id = %id, released, "Released tasks of deleted runner");
    }
    state.screens.remove(id).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: std::result::Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<HeartbeatResponse>> {
    let request = json_body(payload)?;
    if request.runner_id.is_some_and(|body_id| body_id != id) {
        return Err(Error::Validation(
            "runner_id in body does not match the path".into(),
        ));
    }
    state
        .registry
        .heartbeat(id, request.load, request.resources)
        .await?;
    let cancel_task_ids = state.queue.take_cancellations(id).await;
    if !cancel_task_ids.is_empty() {
        info!(runner_id = %id, count = cancel_task_ids.len(), "Delivering cancellations");
    }
    Ok(Json(HeartbeatResponse {
        success: true,
        next_heartbeat_interval: state.heartbeat_interval.as_secs(),
        cancel_task_ids,
    }))
}

/// Responds with the claimed assignment, or JSON `null` when there is none.
pub async fn next_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Option<TaskAssignment>>> {
    let runner = state.registry.get(id).await?;
    if runner.status == RunnerStatus::Offline {
        return Ok(Json(None));
    }
    Ok(Json(state.queue.claim_next(id, &runner.capabilities).await))
}

// ── Screen ──────────────────────────────────────────────────────────────

pub async fn upload_frame(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: std::result::Result<Json<FrameUpload>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let upload = json_body(payload)?;
    state.registry.get(id).await?;
    let frame = upload.into_frame(id)?;
    let sequence = state.screens.publish(frame).await;
    Ok(Json(serde_json::json!({ "sequence": sequence })))
}

pub async fn screen_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScreenStatus>> {
    state.registry.get(id).await?;
    Ok(Json(state.screens.status(id).await))
}

// ── Files & artifacts ───────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct FileUploadResponse {
    pub file_id: Uuid,
    pub hash: String,
    pub size: u64,
}

struct UploadedFile {
    name: Option<String>,
    data: Bytes,
}

/// Pull the `file` part and any text parts out of a multipart body.
async fn read_multipart(
    mut multipart: Multipart,
) -> Result<(Option<UploadedFile>, HashMap<String, String>)> {
    let mut file = None;
    let mut fields = HashMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(e.body_text()))?
    {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        if name == "file" {
            let file_name = field.file_name().map(str::to_owned);
            let data = field
                .bytes()
                .await
                .map_err(|e| Error::Validation(e.body_text()))?;
            file = Some(UploadedFile {
                name: file_name,
                data,
            });
        } else {
            let text = field
                .text()
                .await
                .map_err(|e| Error::Validation(e.body_text()))?;
            fields.insert(name, text);
        }
    }
    Ok((file, fields))
}

pub async fn upload_file(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<FileUploadResponse>)> {
    let (file, _) = read_multipart(multipart).await?;
    let file = file.ok_or_else(|| Error::Validation("missing multipart field 'file'".into()))?;
    let blob = state.blobs.save(&mut &file.data[..]).await?;
    info!(file_id = %blob.id, size = blob.size, name = ?file.name, "File uploaded");
    Ok((
        StatusCode::CREATED,
        Json(FileUploadResponse {
            file_id: blob.id,
            hash: blob.hash,
            size: blob.size,
        }),
    ))
}

pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let blob = state.blobs.open(id).await?;
    let size = blob.size;
    let stream = futures::stream::try_unfold(blob.reader, |mut reader| async move {
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((Bytes::from(buf), reader)))
    });
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
        ],
        Body::from_stream(stream),
    ))
}

pub async fn upload_artifact(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<BlobRef>)> {
    let (file, fields) = read_multipart(multipart).await?;
    let task_id: Uuid = fields
        .get("task_id")
        .ok_or_else(|| Error::Validation("missing multipart field 'task_id'".into()))?
        .parse()
        .map_err(|e| Error::Validation(format!("invalid task_id: {e}")))?;
    let file = file.ok_or_else(|| Error::Validation("missing multipart field 'file'".into()))?;

    // Reject unknown tasks before writing anything.
    state.queue.get_task(task_id).await?;
    let mut blob = state.blobs.save(&mut &file.data[..]).await?;
    blob.name = fields.get("path").cloned().or(file.name);
    state.queue.attach_artifact(task_id, blob.clone()).await?;
    Ok((StatusCode::CREATED, Json(blob)))
}

//! HTTP client for the control-plane API.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::blob::BlobRef;
use crate::error::TransportError;
use crate::jobs::model::{StatusReport, TaskAssignment};
use crate::runners::model::{
    HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse, RunnerResources,
};
use crate::screen::model::FrameUpload;

/// Talks to `/api/v1` on the control plane.
#[derive(Debug, Clone)]
pub struct MothershipClient {
    http: reqwest::Client,
    base: String,
}

impl MothershipClient {
    /// `base_url` is the server root, e.g. `http://localhost:8080`.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base: format!("{}/api/v1", base_url.trim_end_matches('/')),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, TransportError> {
        let resp = self
            .http
            .post(self.url("/runners/register"))
            .json(req)
            .send()
            .await?;
        json(resp).await
    }

    pub async fn heartbeat(
        &self,
        runner_id: Uuid,
        load: usize,
        resources: Option<RunnerResources>,
    ) -> Result<HeartbeatResponse, TransportError> {
        let body = HeartbeatRequest {
            runner_id: Some(runner_id),
            load,
            resources,
        };
        let resp = self
            .http
            .post(self.url(&format!("/runners/{runner_id}/heartbeat")))
            .json(&body)
            .send()
            .await?;
        json(resp).await
    }

    /// Claim the next task, if any.
    pub async fn next_task(&self, runner_id: Uuid) -> Result<Option<TaskAssignment>, TransportError> {
        let resp = self
            .http
            .get(self.url(&format!("/runners/{runner_id}/tasks/next")))
            .send()
            .await?;
        json(resp).await
    }

    pub async fn report_status(
        &self,
        task_id: Uuid,
        report: &StatusReport,
    ) -> Result<(), TransportError> {
        let resp = self
            .http
            .post(self.url(&format!("/tasks/{task_id}/status")))
            .json(report)
            .send()
            .await?;
        check(resp).await.map(drop)
    }

    /// Stream a stored file into `dest`. Returns the byte count.
    pub async fn download_file<W>(
        &self,
        file_id: Uuid,
        dest: &mut W,
        timeout: Duration,
    ) -> Result<u64, TransportError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let resp = self
            .http
            .get(self.url(&format!("/files/{file_id}/download")))
            .timeout(timeout)
            .send()
            .await?;
        let mut resp = check(resp).await?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            dest.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        dest.flush().await?;
        Ok(written)
    }

    pub async fn upload_artifact(
        &self,
        task_id: Uuid,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<BlobRef, TransportError> {
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let form = Form::new()
            .text("task_id", task_id.to_string())
            .text("path", path.to_string())
            .part("file", Part::bytes(bytes).file_name(file_name));
        let resp = self
            .http
            .post(self.url("/artifacts/upload"))
            .multipart(form)
            .send()
            .await?;
        json(resp).await
    }

    pub async fn upload_frame(
        &self,
        runner_id: Uuid,
        frame: &FrameUpload,
    ) -> Result<(), TransportError> {
        let resp = self
            .http
            .post(self.url(&format!("/runners/{runner_id}/screen/frame")))
            .json(frame)
            .send()
            .await?;
        check(resp).await.map(drop)
    }
}

/// Turn a non-success response into `TransportError::Status`.
async fn check(resp: Response) -> Result<Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        url,
        body,
    })
}

async fn json<T: DeserializeOwned>(resp: Response) -> Result<T, TransportError> {
    Ok(check(resp).await?.json().await?)
}

impl TransportError {
    /// The server rejected the request as stale (HTTP 409).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status == StatusCode::CONFLICT.as_u16())
    }

    /// The server does not know the resource (HTTP 404).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status == StatusCode::NOT_FOUND.as_u16())
    }
}

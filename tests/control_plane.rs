//! Integration tests for the mothership HTTP/WebSocket surface and the agent.
//!
//! Each test spins up the full router on a random port and talks to it over
//! real HTTP and WebSocket connections.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use borg::agent::{Agent, MothershipClient, spawn_heartbeat};
use borg::api::{self, AppState};
use borg::auth::{Authenticator, TokenAuthority};
use borg::blob::{BlobStore, FsBlobStore};
use borg::config::AgentConfig;
use borg::events::EventHub;
use borg::jobs::JobQueue;
use borg::runners::RunnerRegistry;
use borg::screen::ScreenHub;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const TOKEN: &str = "test-token";

struct Server {
    base: String,
    ws: String,
    http: reqwest::Client,
    _storage: TempDir,
}

/// Start the full router on a random port.
async fn start_server() -> Server {
    let storage = tempfile::tempdir().unwrap();
    let events = Arc::new(EventHub::new(64));
    let auth: Arc<dyn Authenticator> = Arc::new(TokenAuthority::new(vec![TOKEN.to_string()]));
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(storage.path()).await.unwrap());
    let state = AppState {
        queue: Arc::new(JobQueue::new(events.clone(), 2)),
        registry: Arc::new(RunnerRegistry::new(
            auth.clone(),
            events.clone(),
            Duration::from_secs(90),
        )),
        events,
        screens: Arc::new(ScreenHub::new(Duration::from_secs(60))),
        blobs,
        auth,
        heartbeat_interval: Duration::from_secs(1),
        max_upload_bytes: 1024 * 1024,
    };
    let app = api::router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Server {
        base: format!("http://{addr}"),
        ws: format!("ws://{addr}"),
        http: reqwest::Client::new(),
        _storage: storage,
    }
}

impl Server {
    fn api(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base)
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self.http.post(self.api(path)).json(&body).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.http.get(self.api(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn create_job(&self, body: Value) -> String {
        let (status, job) = self.post("/jobs", body).await;
        assert_eq!(status, StatusCode::CREATED, "{job}");
        job["id"].as_str().unwrap().to_string()
    }

    async fn register(&self, name: &str) -> String {
        let (status, body) = self
            .post("/runners/register", json!({ "name": name, "token": TOKEN }))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["runner_id"].as_str().unwrap().to_string()
    }

    /// Poll until the job reaches `want`.
    async fn wait_for_job(&self, job_id: &str, want: &str) -> Value {
        loop {
            let (_, job) = self.get(&format!("/jobs/{job_id}")).await;
            if job["status"] == want {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn shell_job(name: &str, commands: &[&str]) -> Value {
    let tasks: Vec<Value> = commands
        .iter()
        .map(|c| json!({ "mode": "shell", "command": c }))
        .collect();
    json!({ "name": name, "tasks": tasks })
}

fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {other:?}"),
    }
}

fn png(width: u32, height: u32, tag: u8) -> Vec<u8> {
    let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
    data.extend_from_slice(&13u32.to_be_bytes());
    data.extend_from_slice(b"IHDR");
    data.extend_from_slice(&width.to_be_bytes());
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(&[8, 6, 0, 0, 0, tag]);
    data
}

fn agent_config(server: &Server, work_dir: &std::path::Path) -> AgentConfig {
    AgentConfig {
        mothership_url: server.base.clone(),
        name: "agent-1".into(),
        token: secrecy::SecretString::from(TOKEN.to_string()),
        work_dir: work_dir.to_path_buf(),
        poll_interval: Duration::from_millis(100),
        request_timeout: Duration::from_secs(5),
        ..AgentConfig::default()
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_responds() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let resp = server
            .http
            .get(format!("{}/health", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn job_pause_resume_cancel() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let job_id = server.create_job(shell_job("demo", &["true", "true"])).await;

        let (status, detail) = server.get(&format!("/jobs/{job_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["status"], "pending");
        assert_eq!(detail["tasks"].as_array().unwrap().len(), 2);

        let (status, job) = server.post(&format!("/jobs/{job_id}/pause"), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "paused");

        // A paused job hands out nothing.
        let runner = server.register("r1").await;
        let (_, next) = server.get(&format!("/runners/{runner}/tasks/next")).await;
        assert!(next.is_null());

        let (_, job) = server.post(&format!("/jobs/{job_id}/resume"), json!({})).await;
        assert_eq!(job["status"], "pending");
        let (_, next) = server.get(&format!("/runners/{runner}/tasks/next")).await;
        assert_eq!(next["job_id"], job_id.as_str());

        let (_, job) = server.post(&format!("/jobs/{job_id}/cancel"), json!({})).await;
        assert_eq!(job["status"], "cancelled");
        let (status, _) = server.post(&format!("/jobs/{job_id}/pause"), json!({})).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, page) = server.get("/jobs?status=cancelled").await;
        assert_eq!(page["total"], 1);
        let (_, page) = server.get("/jobs?status=running").await;
        assert_eq!(page["total"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, body) = server.post("/jobs", json!({ "name": "empty", "tasks": [] })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = server
            .post("/jobs", json!({ "name": "x", "tasks": [{ "mode": "teleport" }] }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = server.get("/jobs?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = server.get(&format!("/jobs/{}", uuid::Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = server
            .post("/runners/register", json!({ "name": "r", "token": "wrong" }))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    })
    .await
    .expect("test timed out");
}

// ── Runners ──────────────────────────────────────────────────────────

#[tokio::test]
async fn issued_token_registers_and_heartbeats() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (status, body) = server.post("/runners/tokens", json!({})).await;
        assert_eq!(status, StatusCode::CREATED);
        let token = body["token"].as_str().unwrap().to_string();

        let (status, reg) = server
            .post("/runners/register", json!({ "name": "fresh", "token": token }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reg["heartbeat_interval_secs"], 1);
        let runner = reg["runner_id"].as_str().unwrap().to_string();

        let (status, hb) = server
            .post(&format!("/runners/{runner}/heartbeat"), json!({ "load": 0 }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(hb["success"], true);
        assert!(hb["cancel_task_ids"].as_array().unwrap().is_empty());

        let (_, info) = server.get(&format!("/runners/{runner}")).await;
        assert_eq!(info["status"], "idle");

        let (status, _) = server
            .post(
                &format!("/runners/{runner}/heartbeat"),
                json!({ "runner_id": uuid::Uuid::new_v4(), "load": 0 }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stale_report_is_a_conflict() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let job_id = server.create_job(shell_job("one", &["true"])).await;
        let owner = server.register("owner").await;
        let other = server.register("other").await;

        let (_, assignment) = server.get(&format!("/runners/{owner}/tasks/next")).await;
        let task_id = assignment["task_id"].as_str().unwrap().to_string();

        let (status, _) = server
            .post(
                &format!("/tasks/{task_id}/status"),
                json!({ "runner_id": other, "status": "running" }),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, task) = server
            .post(
                &format!("/tasks/{task_id}/status"),
                json!({ "runner_id": owner, "status": "running" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["status"], "running");

        let (status, task) = server
            .post(
                &format!("/tasks/{task_id}/status"),
                json!({ "runner_id": owner, "status": "succeeded", "exit_code": 0, "stdout": "ok\n" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["output"]["stdout"], "ok\n");
        server.wait_for_job(&job_id, "completed").await;

        // Late duplicate after the task finished.
        let (status, _) = server
            .post(
                &format!("/tasks/{task_id}/status"),
                json!({ "runner_id": owner, "status": "failed" }),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_claims_hand_out_each_task_once() {
    timeout(TEST_TIMEOUT, async {
        let server = Arc::new(start_server().await);
        let commands = vec!["true"; 5];
        server.create_job(shell_job("fanout", &commands)).await;

        let mut runners = Vec::new();
        for i in 0..10 {
            runners.push(server.register(&format!("r{i}")).await);
        }

        let mut claims = tokio::task::JoinSet::new();
        for runner in runners {
            let server = server.clone();
            claims.spawn(async move {
                let (_, next) = server.get(&format!("/runners/{runner}/tasks/next")).await;
                next["task_id"].as_str().map(str::to_string)
            });
        }

        let mut claimed = Vec::new();
        while let Some(result) = claims.join_next().await {
            if let Some(task_id) = result.unwrap() {
                claimed.push(task_id);
            }
        }
        assert_eq!(claimed.len(), 5);
        assert_eq!(claimed.iter().collect::<HashSet<_>>().len(), 5);

        let (_, stats) = server.get("/stats").await;
        assert_eq!(stats["tasks"]["assigned"], 5);
    })
    .await
    .expect("test timed out");
}

// ── Dashboard ────────────────────────────────────────────────────────

#[tokio::test]
async fn dashboard_gets_snapshot_then_events() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let existing = server.create_job(shell_job("before", &["true"])).await;

        let (mut ws, _resp) = connect_async(format!("{}/ws", server.ws))
            .await
            .expect("WS connect failed");

        let snapshot = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["jobs"][0]["id"], existing.as_str());

        let created = server.create_job(shell_job("after", &["true"])).await;
        let event = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(event["type"], "job_created");
        assert_eq!(event["job"]["id"], created.as_str());

        server.register("watched").await;
        let event = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(event["type"], "runner_registered");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn runner_rename_and_delete() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.create_job(shell_job("held", &["true"])).await;
        let first = server.register("first").await;
        let url = server.api(&format!("/runners/{first}"));

        let resp = server.http.patch(&url).json(&json!({ "name": "renamed" })).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let runner: Value = resp.json().await.unwrap();
        assert_eq!(runner["name"], "renamed");
        assert_eq!(runner["device_id"], "first");

        let resp = server.http.patch(&url).json(&json!({ "name": "" })).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let (_, assignment) = server.get(&format!("/runners/{first}/tasks/next")).await;
        let task_id = assignment["task_id"].as_str().unwrap().to_string();

        let resp = server.http.delete(&url).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let (status, _) = server.get(&format!("/runners/{first}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let resp = server.http.delete(&url).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // The deleted runner's task is claimable again.
        let (_, task) = server.get(&format!("/tasks/{task_id}")).await;
        assert_eq!(task["status"], "pending");
        let second = server.register("second").await;
        let (_, assignment) = server.get(&format!("/runners/{second}/tasks/next")).await;
        assert_eq!(assignment["task_id"], task_id.as_str());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn resources_arrive_at_registration_and_heartbeat() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (status, reg) = server
            .post(
                "/runners/register",
                json!({
                    "name": "gpu-box",
                    "token": TOKEN,
                    "resources": {
                        "cpu_cores": 16,
                        "memory_gb": 64.0,
                        "disk_space_gb": 200.0,
                        "total_disk_space_gb": 1000.0,
                        "gpu_info": [{ "name": "RTX 4090", "memory_gb": 24.0 }]
                    }
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let runner = reg["runner_id"].as_str().unwrap().to_string();

        let (status, _) = server
            .post(
                &format!("/runners/{runner}/heartbeat"),
                json!({ "load": 0, "resources": { "disk_space_gb": 150.0, "public_ips": ["198.51.100.4"] } }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (_, info) = server.get(&format!("/runners/{runner}")).await;
        let resources = &info["resources"];
        assert_eq!(resources["cpu_cores"], 16);
        assert_eq!(resources["disk_space_gb"], 150.0);
        assert_eq!(resources["total_disk_space_gb"], 1000.0);
        assert_eq!(resources["gpu_info"][0]["name"], "RTX 4090");
        assert_eq!(resources["public_ips"][0], "198.51.100.4");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn task_logs_return_captured_output() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.create_job(shell_job("noisy", &["false"])).await;
        let runner = server.register("logger").await;
        let (_, assignment) = server.get(&format!("/runners/{runner}/tasks/next")).await;
        let task_id = assignment["task_id"].as_str().unwrap().to_string();

        let (_, logs) = server.get(&format!("/tasks/{task_id}/logs")).await;
        assert_eq!(logs["status"], "assigned");
        assert_eq!(logs["stdout"], "");

        let status_path = format!("/tasks/{task_id}/status");
        server
            .post(&status_path, json!({ "runner_id": runner, "status": "running" }))
            .await;
        server
            .post(
                &status_path,
                json!({
                    "runner_id": runner,
                    "status": "failed",
                    "exit_code": 1,
                    "stdout": "partial\n",
                    "stderr": "boom\n",
                    "error": "exit status 1"
                }),
            )
            .await;

        let (status, logs) = server.get(&format!("/tasks/{task_id}/logs")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(logs["task_id"], task_id.as_str());
        assert_eq!(logs["status"], "failed");
        assert_eq!(logs["exit_code"], 1);
        assert_eq!(logs["stdout"], "partial\n");
        assert_eq!(logs["stderr"], "boom\n");

        let (status, _) = server
            .get(&format!("/tasks/{}/logs", uuid::Uuid::new_v4()))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}

// ── Screen ───────────────────────────────────────────────────────────

#[tokio::test]
async fn screen_viewer_gets_latest_frame() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let runner = server.register("screen").await;
        let frame_path = format!("/runners/{runner}/screen/frame");

        let (status, _) = server.get(&format!("/runners/{runner}/screen/status")).await;
        assert_eq!(status, StatusCode::OK);

        use base64::Engine;
        let encode = |data: &[u8]| base64::engine::general_purpose::STANDARD.encode(data);
        let first = png(800, 600, 1);
        let second = png(1024, 768, 2);
        server.post(&frame_path, json!({ "image": encode(&first) })).await;
        let (status, body) = server.post(&frame_path, json!({ "image": encode(&second) })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sequence"], 2);

        // Only the newest frame is delivered on connect.
        let (mut ws, _resp) = connect_async(format!("{}/ws/screen/{runner}", server.ws))
            .await
            .expect("WS connect failed");
        match ws.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(&data[..], &second[..]),
            other => panic!("expected Binary frame, got {other:?}"),
        }

        let third = png(640, 480, 3);
        server.post(&frame_path, json!({ "image": encode(&third) })).await;
        match ws.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(&data[..], &third[..]),
            other => panic!("expected Binary frame, got {other:?}"),
        }

        let (_, status) = server.get(&format!("/runners/{runner}/screen/status")).await;
        assert_eq!(status["live"], true);
        assert_eq!(status["sequence"], 3);
        assert_eq!(status["width"], 640);

        let (status, _) = server.post(&frame_path, json!({ "image": "" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn screen_socket_for_unknown_runner_is_refused() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let stranger = uuid::Uuid::new_v4();
        match connect_async(format!("{}/ws/screen/{stranger}", server.ws)).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
                assert_eq!(resp.status().as_u16(), 404);
            }
            Err(other) => panic!("expected HTTP 404, got {other}"),
            Ok(_) => panic!("upgrade accepted for an unknown runner"),
        }
    })
    .await
    .expect("test timed out");
}

// ── Files ────────────────────────────────────────────────────────────

#[tokio::test]
async fn file_upload_download_round_trip() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let payload = b"line one\nline two\n".to_vec();
        let form = Form::new().part("file", Part::bytes(payload.clone()).file_name("input.txt"));
        let resp = server
            .http
            .post(server.api("/files/upload"))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["size"], payload.len());
        let file_id = body["file_id"].as_str().unwrap().to_string();

        let resp = server
            .http
            .get(server.api(&format!("/files/{file_id}/download")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.bytes().await.unwrap().as_ref(), &payload[..]);

        let (status, _) = server
            .get(&format!("/files/{}/download", uuid::Uuid::new_v4()))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let form = Form::new()
            .text("task_id", uuid::Uuid::new_v4().to_string())
            .part("file", Part::bytes(vec![1, 2, 3]).file_name("out.bin"));
        let resp = server
            .http
            .post(server.api("/artifacts/upload"))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}

// ── Agent end to end ─────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn agent_runs_job_with_inputs_and_artifacts() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let work = tempfile::tempdir().unwrap();

        let form = Form::new().part("file", Part::bytes(b"from mothership".to_vec()).file_name("in"));
        let upload: Value = server
            .http
            .post(server.api("/files/upload"))
            .multipart(form)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let job_id = server
            .create_job(json!({
                "name": "e2e",
                "tasks": [
                    { "mode": "shell", "command": "echo hi" },
                    {
                        "mode": "shell",
                        "command": "cat file_0 && mkdir -p artifacts && echo done > artifacts/out.txt",
                        "required_file_ids": [upload["file_id"]]
                    }
                ]
            }))
            .await;

        let config = agent_config(&server, work.path());
        let client = Arc::new(MothershipClient::new(&server.base, config.request_timeout).unwrap());
        let agent = Arc::new(Agent::new(config, client));
        let runner_id = agent.register().await.unwrap().runner_id;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(agent.clone().run(runner_id, shutdown_rx));

        let job = server.wait_for_job(&job_id, "completed").await;
        let tasks = job["tasks"].as_array().unwrap();
        assert_eq!(tasks[0]["output"]["stdout"], "hi\n");
        assert_eq!(tasks[0]["exit_code"], 0);
        assert_eq!(tasks[1]["output"]["stdout"], "from mothership");
        assert_eq!(tasks[1]["artifacts"][0]["name"], "out.txt");

        shutdown_tx.send_replace(true);
        run.await.unwrap();
        // Task directories are removed after completion.
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    })
    .await
    .expect("test timed out");
}

#[cfg(unix)]
#[tokio::test]
async fn cancelling_a_job_stops_the_running_task() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let work = tempfile::tempdir().unwrap();
        let job_id = server.create_job(shell_job("long", &["sleep 30"])).await;

        let config = agent_config(&server, work.path());
        let client = Arc::new(MothershipClient::new(&server.base, config.request_timeout).unwrap());
        let agent = Arc::new(Agent::new(config, client.clone()));
        let runner_id = agent.register().await.unwrap().runner_id;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let heartbeat = spawn_heartbeat(
            client,
            runner_id,
            agent.active(),
            agent.resources(),
            Duration::from_millis(200),
            shutdown_rx.clone(),
        );
        let run = tokio::spawn(agent.clone().run(runner_id, shutdown_rx));

        server.wait_for_job(&job_id, "running").await;
        while agent.active().len().await == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let (status, job) = server.post(&format!("/jobs/{job_id}/cancel"), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "cancelled");

        // The next heartbeat delivers the cancellation and the process dies.
        while agent.active().len().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let (_, detail) = server.get(&format!("/jobs/{job_id}")).await;
        assert_eq!(detail["tasks"][0]["status"], "cancelled");

        shutdown_tx.send_replace(true);
        run.await.unwrap();
        heartbeat.await.unwrap();
    })
    .await
    .expect("test timed out");
}

//! Runner registry: registration, heartbeats and the liveness sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{RegisterRequest, Runner, RunnerResources, RunnerStatus};
use crate::auth::Authenticator;
use crate::error::{Error, Result};
use crate::events::{DashboardEvent, EventHub};
use crate::jobs::JobQueue;

/// Result of a registration call.
#[derive(Debug, Clone)]
pub struct Registration {
    pub runner: Runner,
    /// Status before this call when the device was already known.
    pub previous_status: Option<RunnerStatus>,
}

/// Tracks runner identity, liveness and reported load.
pub struct RunnerRegistry {
    runners: RwLock<HashMap<Uuid, Runner>>,
    auth: Arc<dyn Authenticator>,
    events: Arc<EventHub>,
    liveness_threshold: Duration,
}

impl RunnerRegistry {
    pub fn new(
        auth: Arc<dyn Authenticator>,
        events: Arc<EventHub>,
        liveness_threshold: Duration,
    ) -> Self {
        Self {
            runners: RwLock::new(HashMap::new()),
            auth,
            events,
            liveness_threshold,
        }
    }

    /// Register a runner, or refresh an existing one with the same device id.
    pub async fn register(&self, req: RegisterRequest) -> Result<Registration> {
        if req.name.trim().is_empty() {
            return Err(Error::Validation("runner name must not be empty".into()));
        }
        if req.capabilities.max_concurrent_tasks == 0 {
            return Err(Error::Validation(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if !self.auth.validate(&req.token).await {
            warn!(name = %req.name, "Runner registration rejected: invalid token");
            return Err(Error::Unauthorized("invalid runner token".into()));
        }

        let device_id = req
            .device_id
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| req.name.clone());
        let now = Utc::now();

        let mut runners = self.runners.write().await;
        if let Some(existing) = runners.values_mut().find(|r| r.device_id == device_id) {
            let previous = existing.status;
            existing.name = req.name;
            existing.hostname = req.hostname;
            existing.os = req.os;
            existing.arch = req.arch;
            existing.capabilities = req.capabilities;
            existing.resources = req.resources;
            existing.status = RunnerStatus::Online;
            existing.current_load = 0;
            existing.last_heartbeat_at = now;
            let runner = existing.clone();
            drop(runners);

            info!(runner_id = %runner.id, device_id = %device_id, previous = %previous, "Runner re-registered");
            self.events.publish(DashboardEvent::RunnerUpdated {
                runner_id: runner.id,
                status: runner.status,
                current_load: 0,
            });
            return Ok(Registration {
                runner,
                previous_status: Some(previous),
            });
        }

        let runner = Runner {
            id: Uuid::new_v4(),
            name: req.name,
            device_id,
            hostname: req.hostname,
            os: req.os,
            arch: req.arch,
            capabilities: req.capabilities,
            status: RunnerStatus::Online,
            current_load: 0,
            current_tasks: Vec::new(),
            registered_at: now,
            last_heartbeat_at: now,
            resources: req.resources,
        };
        runners.insert(runner.id, runner.clone());
        drop(runners);

        info!(runner_id = %runner.id, name = %runner.name, "Runner registered");
        self.events.publish(DashboardEvent::RunnerRegistered {
            runner: runner.clone(),
        });
        Ok(Registration {
            runner,
            previous_status: None,
        })
    }

    /// Record a heartbeat. An Offline runner comes back on its next heartbeat.
    pub async fn heartbeat(
        &self,
        runner_id: Uuid,
        load: usize,
        resources: Option<RunnerResources>,
    ) -> Result<Runner> {
        self.heartbeat_at(runner_id, load, resources, Utc::now()).await
    }

    pub(crate) async fn heartbeat_at(
        &self,
        runner_id: Uuid,
        load: usize,
        resources: Option<RunnerResources>,
        now: DateTime<Utc>,
    ) -> Result<Runner> {
        let mut runners = self.runners.write().await;
        let runner = runners
            .get_mut(&runner_id)
            .ok_or_else(|| Error::not_found("runner", runner_id))?;

        let previous = runner.status;
        runner.last_heartbeat_at = now;
        runner.current_load = load;
        runner.status = RunnerStatus::from_load(load);
        if let Some(update) = resources {
            runner.resources.merge(update);
        }
        let runner = runner.clone();
        drop(runners);

        if previous == RunnerStatus::Offline {
            info!(runner_id = %runner_id, "Runner back online");
        }
        debug!(runner_id = %runner_id, load, "Heartbeat");
        if previous != runner.status || previous == RunnerStatus::Offline {
            self.events.publish(DashboardEvent::RunnerUpdated {
                runner_id,
                status: runner.status,
                current_load: load,
            });
        }
        Ok(runner)
    }

    pub async fn get(&self, runner_id: Uuid) -> Result<Runner> {
        self.runners
            .read()
            .await
            .get(&runner_id)
            .cloned()
            .ok_or_else(|| Error::not_found("runner", runner_id))
    }

    /// Change the display name. The device id, and so the identity used for
    /// re-registration, stays the same.
    pub async fn rename(&self, runner_id: Uuid, name: &str) -> Result<Runner> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("runner name must not be empty".into()));
        }
        let mut runners = self.runners.write().await;
        let runner = runners
            .get_mut(&runner_id)
            .ok_or_else(|| Error::not_found("runner", runner_id))?;
        let old = std::mem::replace(&mut runner.name, name.to_string());
        let runner = runner.clone();
        drop(runners);

        info!(runner_id = %runner_id, old = %old, new = %runner.name, "Runner renamed");
        self.events.publish(DashboardEvent::RunnerRenamed {
            runner_id,
            name: runner.name.clone(),
        });
        Ok(runner)
    }

    /// Forget a runner. The caller is responsible for its held tasks.
    pub async fn remove(&self, runner_id: Uuid) -> Result<Runner> {
        let runner = self
            .runners
            .write()
            .await
            .remove(&runner_id)
            .ok_or_else(|| Error::not_found("runner", runner_id))?;
        info!(runner_id = %runner_id, name = %runner.name, "Runner removed");
        self.events
            .publish(DashboardEvent::RunnerRemoved { runner_id });
        Ok(runner)
    }

    /// All runners, oldest registration first.
    pub async fn list(&self) -> Vec<Runner> {
        let mut runners: Vec<Runner> = self.runners.read().await.values().cloned().collect();
        runners.sort_by_key(|r| r.registered_at);
        runners
    }

    /// Flip every runner whose last heartbeat is older than the liveness
    /// threshold to Offline. Returns the runners that changed on this pass.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let threshold = chrono::Duration::from_std(self.liveness_threshold)
            .unwrap_or(chrono::Duration::MAX);
        let mut gone = Vec::new();
        {
            let mut runners = self.runners.write().await;
            for runner in runners.values_mut() {
                if runner.status == RunnerStatus::Offline {
                    continue;
                }
                if now - runner.last_heartbeat_at > threshold {
                    runner.status = RunnerStatus::Offline;
                    runner.current_load = 0;
                    gone.push(runner.id);
                }
            }
        }
        for runner_id in &gone {
            warn!(runner_id = %runner_id, "Runner missed heartbeats, marked offline");
            self.events.publish(DashboardEvent::RunnerUpdated {
                runner_id: *runner_id,
                status: RunnerStatus::Offline,
                current_load: 0,
            });
        }
        gone
    }
}

/// Spawn the periodic liveness sweep. Runners that go Offline have their
/// tasks handed back to the queue.
pub fn spawn_liveness_sweep(
    registry: Arc<RunnerRegistry>,
    queue: Arc<JobQueue>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let gone = registry.sweep(Utc::now()).await;
            release_offline(&registry, &queue, gone).await;
        }
    })
}

/// Hand back the tasks of runners the sweep marked Offline.
///
/// A runner that heartbeated between the sweep and this call keeps its
/// tasks. Returns the number of tasks released.
async fn release_offline(registry: &RunnerRegistry, queue: &JobQueue, gone: Vec<Uuid>) -> usize {
    let mut total = 0;
    for runner_id in gone {
        match registry.get(runner_id).await {
            Ok(runner) if runner.status == RunnerStatus::Offline => {}
            Ok(_) => {
                debug!(runner_id = %runner_id, "Runner came back before release; keeping its tasks");
                continue;
            }
            // Removed runners had their tasks released on removal.
            Err(_) => continue,
        }
        let released = queue.release_runner(runner_id).await;
        if released > 0 {
            info!(runner_id = %runner_id, released, "Reclaimed tasks from offline runner");
        }
        total += released;
    }
    total
}

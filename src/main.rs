use std::sync::Arc;

use anyhow::Context;
use borg::api::{self, AppState};
use borg::auth::{Authenticator, TokenAuthority};
use borg::blob::{BlobStore, FsBlobStore};
use borg::config::MothershipConfig;
use borg::events::EventHub;
use borg::jobs::JobQueue;
use borg::runners::{RunnerRegistry, spawn_liveness_sweep};
use borg::screen::ScreenHub;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = MothershipConfig::from_env().context("invalid configuration")?;
    config.validate().context("invalid configuration")?;

    eprintln!("Borg mothership v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API:       http://{}/api/v1", config.listen_addr);
    eprintln!("   Dashboard: ws://{}/ws", config.listen_addr);
    eprintln!("   Storage:   {}", config.storage_dir.display());

    // ── Core services ────────────────────────────────────────────────────
    let events = Arc::new(EventHub::new(config.event_buffer));
    let auth = Arc::new(TokenAuthority::new(config.runner_tokens.clone()));
    if auth.is_empty().await {
        info!("No preset runner tokens; issue one with POST /api/v1/runners/tokens");
    }
    let auth: Arc<dyn Authenticator> = auth;
    let blobs: Arc<dyn BlobStore> = Arc::new(
        FsBlobStore::open(&config.storage_dir)
            .await
            .with_context(|| format!("cannot open blob store at {}", config.storage_dir.display()))?,
    );
    let queue = Arc::new(JobQueue::new(events.clone(), config.max_reassignments));
    let registry = Arc::new(RunnerRegistry::new(
        auth.clone(),
        events.clone(),
        config.liveness_threshold(),
    ));
    let screens = Arc::new(ScreenHub::new(config.screen_freshness));

    let sweep = spawn_liveness_sweep(registry.clone(), queue.clone(), config.sweep_interval);

    // ── HTTP server ──────────────────────────────────────────────────────
    let state = AppState {
        queue,
        registry,
        events,
        screens,
        blobs,
        auth,
        heartbeat_interval: config.heartbeat_interval,
        max_upload_bytes: config.max_upload_bytes,
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Mothership listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("server error")?;

    sweep.abort();
    info!("Mothership stopped");
    Ok(())
}

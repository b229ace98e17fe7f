use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use borg::agent::{Agent, CommandFrameSource, MothershipClient, spawn_heartbeat, spawn_screen_capture};
use borg::config::AgentConfig;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env().context("invalid configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("Solder agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mothership: {}", config.mothership_url);
    eprintln!("   Name:       {}", config.name);
    eprintln!("   Work dir:   {}", config.work_dir.display());
    eprintln!("   Slots:      {}", config.max_concurrent_tasks);

    let client = Arc::new(
        MothershipClient::new(&config.mothership_url, config.request_timeout)
            .context("cannot build HTTP client")?,
    );
    let agent = Arc::new(Agent::new(config.clone(), client.clone()));

    let registered = agent
        .register()
        .await
        .context("registration with mothership failed")?;
    let runner_id = registered.runner_id;
    let heartbeat_interval = match registered.heartbeat_interval_secs {
        0 => config.heartbeat_interval,
        secs => Duration::from_secs(secs),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat = spawn_heartbeat(
        client.clone(),
        runner_id,
        agent.active(),
        agent.resources(),
        heartbeat_interval,
        shutdown_rx.clone(),
    );

    let screen = match (config.screen.enabled, &config.screen.command) {
        (true, Some(command)) => Some(spawn_screen_capture(
            client.clone(),
            runner_id,
            Arc::new(CommandFrameSource::new(command.clone())),
            config.screen.interval,
            shutdown_rx.clone(),
        )),
        (true, None) => {
            warn!("Screen capture enabled but SOLDER_SCREEN_COMMAND is not set");
            None
        }
        _ => None,
    };

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
        shutdown_tx.send_replace(true);
    });

    agent.run(runner_id, shutdown_rx).await;

    let _ = heartbeat.await;
    if let Some(screen) = screen {
        let _ = screen.await;
    }
    info!("Solder stopped");
    Ok(())
}

/// Console logging, plus a daily rolling file when `SOLDER_LOG_DIR` is set.
fn init_tracing(config: &AgentConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "solder.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}

use std::path::PathBuf;

use anyhow::Context as _;
use hh_core::Config;
use tracing::{error, info};

mod api;
mod app_state;
mod bootstrap;
mod broker;
mod discovery;
mod health;
mod host;
mod http_client;
mod launch;
mod lifecycle;
mod persist;
mod ports;
mod process;
mod registry;
mod resources;
mod responses;
mod router;
mod stats;
mod tasks;
#[cfg(test)]
mod test_support;
mod ui_supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let (config, source) = Config::load(explicit.as_deref()).context("load configuration")?;
    hh_otel::init(&config.logs_dir);
    match &source {
        Some(path) => info!(target: "homehelper::bootstrap", config = %path.display(), "configuration loaded"),
        None => info!(target: "homehelper::bootstrap", "no config file found; using defaults"),
    }

    let bind = config.server.bind.clone();
    let bootstrap::BootstrapOutput {
        router,
        state,
        background_tasks,
        cancel,
    } = bootstrap::build(config).await?;

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(target: "homehelper::bootstrap", %bind, "http api listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        error!(target: "homehelper::bootstrap", "http server exited with error: {err}");
    }

    bootstrap::shutdown(&state, background_tasks, cancel).await;
    info!(target: "homehelper::bootstrap", "shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    info!(target: "homehelper::bootstrap", "shutdown signal listener active");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                error!(target: "homehelper::bootstrap", "failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!(target: "homehelper::bootstrap", "shutdown signal received");
}

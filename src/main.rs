use anyhow::Context;
use proxydeck::config::Settings;
use proxydeck::events::TracingSink;
use proxydeck::runner::TokioRunner;
use proxydeck::{ConfigStore, ProcessSupervisor, SupervisorOptions, PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load settings before logging so the configured filter applies
    let settings_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(Settings::default_path);
    let settings = Settings::load_or_default(&settings_path);

    let filter = settings
        .as_ref()
        .map(|s| s.logging.filter.clone())
        .unwrap_or_else(|_| "proxydeck=debug".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                filter
                    .parse()
                    .with_context(|| format!("Invalid log filter '{}'", filter))?,
            ),
        )
        .init();

    let settings = settings.map_err(|e| {
        error!(path = %settings_path.display(), error = %e, "Failed to load settings");
        e
    })?;

    print_startup_banner(&settings, &settings_path);

    let store = Arc::new(ConfigStore::open(settings.store.path()));
    let runner = Arc::new(TokioRunner::new(settings.supervisor.shutdown_grace_period()));
    let supervisor = ProcessSupervisor::new(
        Arc::clone(&store),
        runner,
        SupervisorOptions::from_settings(&settings.supervisor),
    );
    supervisor.add_sink(Arc::new(TracingSink));

    // A missing binary degrades to read-only mode instead of exiting
    match supervisor.init() {
        Ok(path) => {
            info!(binary = %path.display(), "Proxy binary verified");
            supervisor.auto_start_stored().await;
        }
        Err(e) => {
            warn!(error = %e, "Continuing without a proxy binary, starts are disabled");
        }
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or store reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sighup =
            signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %store.path().display(), "Received SIGHUP, reloading configurations...");
                    store.reload();
                    if supervisor.is_initialized() {
                        let report = supervisor.auto_start_stored().await;
                        if !report.started.is_empty() {
                            info!(configs = ?report.started, "Auto-started after reload");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    info!(running = supervisor.running_count(), "Stopping all proxies...");
    supervisor.cleanup();

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(settings: &Settings, settings_path: &std::path::Path) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy supervisor");
    info!(
        settings = %settings_path.display(),
        store = %settings.store.path().display(),
        runtime_dir = %settings.supervisor.runtime_dir().display(),
        "Paths"
    );
    info!(
        packaging = ?settings.supervisor.packaging,
        binary = %settings.supervisor.locator().path().display(),
        arch = %proxydeck::binary::Architecture::current(),
        grace_period_secs = settings.supervisor.shutdown_grace_period_secs,
        "Supervisor settings"
    );
}

use clap::Parser;
use portlease_daemon::{
    api,
    config::DaemonConfig,
    engine::{EngineSettings, LeaseEngine},
    error::DaemonError,
    liveness::ProcessLiveness,
    probe::LoopbackProbe,
    store::Store,
    sweeper,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig::parse();
    if let Err(e) = run(config).await {
        error!(error = %e, "portleased exited");
        std::process::exit(1);
    }
}

async fn run(config: DaemonConfig) -> Result<(), DaemonError> {
    config.validate()?;

    let state_path = config.state_path();
    let store = match Store::open_or_recover(&state_path) {
        Ok(store) => store,
        Err(e) => {
            warn!(error = %e, path = %state_path.display(),
                "State file unavailable, keeping reservations in memory only");
            Store::in_memory()?
        }
    };

    let state = store
        .path()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "in-memory".to_string());

    let settings = EngineSettings {
        range: config.range,
        default_lease_secs: config.lease_secs,
    };
    let engine = Arc::new(LeaseEngine::open(
        store,
        settings,
        Arc::new(ProcessLiveness),
        Arc::new(LoopbackProbe),
    ));

    let sweeper = sweeper::spawn(engine.clone(), config.sweep_interval());

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!(
        listen = %config.listen,
        range = %config.range,
        state = %state,
        lease_secs = config.lease_secs,
        "portleased ready"
    );

    axum::serve(listener, api::router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("portleased shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

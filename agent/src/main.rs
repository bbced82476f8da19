mod api;
mod capture;
mod location;
mod motion;
mod recorder;
mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use surveil_common::config::Config;
use tracing::{error, info};

use crate::api::ApiClient;
use crate::capture::CaptureMode;
use crate::location::LocationSource;
use crate::session::SessionHandle;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        server = config.device.server_url,
        camera = config.capture.url,
        mode = config.capture.mode,
        codec = config.recording.codec,
        "starting surveil agent"
    );

    let mode: CaptureMode = match config.capture.mode.parse() {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "invalid capture config");
            std::process::exit(1);
        }
    };

    let location = match LocationSource::from_config(&config.location) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "invalid location config");
            std::process::exit(1);
        }
    };

    let api = match ApiClient::new(
        &config.device,
        Duration::from_secs(config.telemetry.request_timeout_secs),
        Duration::from_secs(config.telemetry.upload_timeout_secs),
    ) {
        Ok(a) => Arc::new(a),
        Err(e) => {
            error!(error = %e, "failed to create API client");
            std::process::exit(1);
        }
    };

    recorder::encoder::check_ffmpeg_available(&config.recording.ffmpeg).await;

    let handle = SessionHandle::start(&config, mode, location, api);
    let mut status = handle.session().subscribe_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().to_string();
            info!(status = current, "status changed");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received, stopping");
    if handle.session().is_recording().await {
        info!("finalizing active recording");
    }
    handle.stop().await;
    info!("surveil agent stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

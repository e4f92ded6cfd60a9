//! # proxisense
//!
//! Background service running the Bluetooth proximity sensor.
//!
//! This binary provides:
//! - Periodic classic + BLE scan cycles on the default adapter
//! - Observations appended to JSON-lines files
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development, with the simulated adapter
//! cargo run --package proxisense-daemon
//!
//! # Production, against BlueZ
//! PROXISENSE_CONFIG=/etc/proxisense/config.toml ./proxisense
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::sync::Arc;

use proxisense_core::{Config, PlatformScanner};
use proxisense_daemon::{logging, state};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = state::config_path()?;
    let config = Config::load_or_init(&config_path)?;

    logging::init(&config.logging)?;
    info!(config = %config_path.display(), "Starting proxisense");

    let platform = platform().await?;
    let mut app = state::AppState::new(config, &config_path, platform)?;

    if let Err(e) = app.start().await {
        error!(code = e.error_code(), error = %e, "sensor did not start");
        app.shutdown().await?;
        return Err(e.into());
    }

    wait_for_signals(&mut app).await;

    info!("Shutting down");
    app.shutdown().await
}

#[cfg(feature = "bluetooth")]
async fn platform() -> anyhow::Result<Arc<dyn PlatformScanner>> {
    let platform = proxisense_core::BluezPlatform::connect().await?;
    Ok(Arc::new(platform))
}

#[cfg(not(feature = "bluetooth"))]
#[allow(clippy::unused_async)]
async fn platform() -> anyhow::Result<Arc<dyn PlatformScanner>> {
    warn!("built without BlueZ support, using the simulated adapter");
    let platform =
        proxisense_core::MockPlatform::new().with_script(proxisense_core::MockScript::default());
    Ok(Arc::new(platform))
}

/// Run until Ctrl-C or SIGTERM, reloading configuration on SIGHUP.
#[cfg(unix)]
async fn wait_for_signals(app: &mut state::AppState) {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut hangup), Ok(mut terminate)) =
        (signal(SignalKind::hangup()), signal(SignalKind::terminate()))
    else {
        warn!("cannot install signal handlers, waiting for Ctrl-C only");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => match app.reload().await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(code = e.error_code(), error = %e, "sensor lost, shutting down");
                    break;
                }
                Err(e) => warn!(code = e.error_code(), error = %e, "configuration reload rejected"),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_app: &mut state::AppState) {
    let _ = tokio::signal::ctrl_c().await;
}

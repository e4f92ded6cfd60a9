//! Running service state: configuration plus the live sensor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use proxisense_core::{
    Config, EventBus, JsonFileStorage, PlatformScanner, ScanOrchestrator, SensorError,
    SensorHandle, SensorStatus, Storage,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::sink::LoggingSink;

/// Configuration file location, from `PROXISENSE_CONFIG` or the platform default.
///
/// # Errors
///
/// Returns an error if no platform config directory can be determined.
pub fn config_path() -> anyhow::Result<PathBuf> {
    match std::env::var_os("PROXISENSE_CONFIG") {
        Some(path) => Ok(PathBuf::from(path)),
        None => Ok(Config::default_path()?),
    }
}

/// The sensor service.
#[derive(Debug)]
pub struct AppState {
    config: Config,
    config_path: PathBuf,
    sensor: SensorHandle,
    task: JoinHandle<()>,
}

impl AppState {
    /// Spawn the sensor with file storage under the configured data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be resolved.
    pub fn new(
        config: Config,
        config_path: impl AsRef<Path>,
        platform: Arc<dyn PlatformScanner>,
    ) -> anyhow::Result<Self> {
        let data_dir = config.storage.resolved_data_dir()?;
        info!(data_dir = %data_dir.display(), "storing observations");
        let storage = Arc::new(JsonFileStorage::new(data_dir));
        Ok(Self::with_storage(config, config_path, platform, storage))
    }

    /// Spawn the sensor over an explicit storage backend.
    pub fn with_storage(
        config: Config,
        config_path: impl AsRef<Path>,
        platform: Arc<dyn PlatformScanner>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let events = EventBus::new().with(Arc::new(LoggingSink));
        let (sensor, task) = ScanOrchestrator::spawn(platform, storage, events);
        Self {
            config,
            config_path: config_path.as_ref().to_path_buf(),
            sensor,
            task,
        }
    }

    /// Start the sensor with the loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is rejected or the host has no
    /// Bluetooth adapter.
    pub async fn start(&self) -> Result<(), SensorError> {
        self.sensor.start(self.config.sensor.clone()).await
    }

    /// Re-read the configuration file and apply it to the running sensor.
    ///
    /// An invalid file leaves the running configuration in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the new configuration
    /// is rejected.
    pub async fn reload(&mut self) -> Result<(), SensorError> {
        let config = Config::load_existing(&self.config_path)?;
        self.sensor.start(config.sensor.clone()).await?;
        self.config = config;
        info!(path = %self.config_path.display(), "configuration reloaded");
        Ok(())
    }

    /// Handle to the running sensor.
    #[must_use]
    pub const fn sensor(&self) -> &SensorHandle {
        &self.sensor
    }

    /// Configuration in force.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Current sensor state.
    ///
    /// # Errors
    ///
    /// Returns an error if the sensor task has exited.
    pub async fn status(&self) -> anyhow::Result<SensorStatus> {
        Ok(self.sensor.status().await?)
    }

    /// Stop scanning, flush storage, and end the sensor task.
    ///
    /// # Errors
    ///
    /// Returns an error if the sensor task had already exited.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.sensor.stop().await?;
        if let Err(e) = self.sensor.flush().await {
            warn!(error = %e, "could not flush pending observations");
        }
        self.sensor.shutdown().await?;
        self.task.await?;
        info!("sensor shut down");
        Ok(())
    }
}

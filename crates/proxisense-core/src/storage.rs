//! Durable sink for observations and local adapter info.
//!
//! The scan engine never writes directly: records go through a
//! [`StorageWorker`] running on its own task, which hands each append to
//! the blocking pool, so a slow disk cannot hold up scan processing.
//! Delivery is at-least-once and unordered across record kinds; failed
//! appends are logged and not retried.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Datelike;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{LocalDeviceInfo, Observation};

/// Durable append-only sink.
///
/// Calls happen on tokio's blocking pool, one at a time, so implementations
/// may do ordinary blocking file I/O.
pub trait Storage: Send + Sync {
    /// Persist one observation.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be written.
    fn append_observation(&self, observation: &Observation) -> Result<()>;

    /// Persist one local adapter record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be written.
    fn append_local_device(&self, info: &LocalDeviceInfo) -> Result<()>;
}

/// Get the default data directory.
///
/// On Linux hosts: `/var/lib/proxisense/`
/// Elsewhere: the platform data dir
#[must_use]
pub fn default_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Some(PathBuf::from("/var/lib/proxisense"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "proxisense")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }
}

/// JSON-lines files under a data directory.
///
/// Observations go to `observations/<YYYY>/<MM>.jsonl`, keyed by capture
/// month; adapter records go to `local_device.jsonl`.
#[derive(Debug)]
pub struct JsonFileStorage {
    data_dir: PathBuf,
    // Serialises appends when the storage is shared outside the worker.
    write_lock: Mutex<()>,
}

impl JsonFileStorage {
    /// Create a new storage instance rooted at `data_dir`.
    #[must_use]
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            write_lock: Mutex::new(()),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// File receiving observations captured in `year`/`month`.
    #[must_use]
    pub fn observations_path(&self, year: i32, month: u32) -> PathBuf {
        self.data_dir
            .join("observations")
            .join(format!("{year}"))
            .join(format!("{month:02}.jsonl"))
    }

    /// File receiving local adapter records.
    #[must_use]
    pub fn local_device_path(&self) -> PathBuf {
        self.data_dir.join("local_device.jsonl")
    }

    /// Read back every observation stored for a month.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_month(&self, year: i32, month: u32) -> Result<Vec<Observation>> {
        let path = self.observations_path(year, month);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }

    fn append_line(&self, path: &PathBuf, line: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl Storage for JsonFileStorage {
    fn append_observation(&self, observation: &Observation) -> Result<()> {
        let at = observation.timestamp;
        let path = self.observations_path(at.year(), at.month());
        let line = serde_json::to_string(observation)?;
        self.append_line(&path, &line)
    }

    fn append_local_device(&self, info: &LocalDeviceInfo) -> Result<()> {
        let line = serde_json::to_string(info)?;
        self.append_line(&self.local_device_path(), &line)
    }
}

/// In-memory storage, mostly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    observations: Mutex<Vec<Observation>>,
    local_devices: Mutex<Vec<LocalDeviceInfo>>,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of stored observations.
    #[must_use]
    pub fn observations(&self) -> Vec<Observation> {
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of stored adapter records.
    #[must_use]
    pub fn local_devices(&self) -> Vec<LocalDeviceInfo> {
        self.local_devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Storage for MemoryStorage {
    fn append_observation(&self, observation: &Observation) -> Result<()> {
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observation.clone());
        Ok(())
    }

    fn append_local_device(&self, info: &LocalDeviceInfo) -> Result<()> {
        self.local_devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(info.clone());
        Ok(())
    }
}

enum StorageMessage {
    Observation(Observation),
    LocalDevice(LocalDeviceInfo),
    Flush(oneshot::Sender<()>),
}

/// Handle to the storage task.
///
/// Sending never blocks. Dropping every handle lets the task drain its
/// queue and exit.
#[derive(Debug, Clone)]
pub struct StorageWorker {
    tx: mpsc::UnboundedSender<StorageMessage>,
}

impl std::fmt::Debug for StorageMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Observation(obs) => f.debug_tuple("Observation").field(&obs.address).finish(),
            Self::LocalDevice(info) => f.debug_tuple("LocalDevice").field(&info.address).finish(),
            Self::Flush(_) => f.write_str("Flush"),
        }
    }
}

fn write(storage: &dyn Storage, message: &StorageMessage) {
    match message {
        StorageMessage::Observation(obs) => {
            if let Err(e) = storage.append_observation(obs) {
                warn!(address = %obs.address, error = %e, "failed to store observation");
            }
        }
        StorageMessage::LocalDevice(info) => {
            if let Err(e) = storage.append_local_device(info) {
                warn!(error = %e, "failed to store local device info");
            }
        }
        StorageMessage::Flush(_) => {}
    }
}

impl StorageWorker {
    /// Spawn the worker task on the current runtime.
    #[must_use]
    pub fn spawn(storage: Arc<dyn Storage>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let StorageMessage::Flush(reply) = message {
                    let _ = reply.send(());
                    continue;
                }
                let storage = storage.clone();
                let written = tokio::task::spawn_blocking(move || write(storage.as_ref(), &message))
                    .await;
                if let Err(e) = written {
                    warn!(error = %e, "storage write task failed");
                }
            }
            debug!("storage worker drained");
        });
        (Self { tx }, task)
    }

    /// Queue an observation.
    pub fn append_observation(&self, observation: Observation) {
        self.send(StorageMessage::Observation(observation));
    }

    /// Queue a local adapter record.
    pub fn append_local_device(&self, info: LocalDeviceInfo) {
        self.send(StorageMessage::LocalDevice(info));
    }

    /// Resolve once everything queued before this call has been attempted.
    ///
    /// Returns immediately if the worker is gone.
    pub fn flush(&self) -> oneshot::Receiver<()> {
        let (reply, rx) = oneshot::channel();
        self.send(StorageMessage::Flush(reply));
        rx
    }

    fn send(&self, message: StorageMessage) {
        if let Err(e) = self.tx.send(message) {
            warn!(record = ?e.0, "storage worker is gone, dropping record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScanCycleId, ScanSource, RSSI_UNKNOWN};
    use chrono::{TimeZone, Utc};

    fn observation(address: &str, month: u32) -> Observation {
        let at = Utc.with_ymd_and_hms(2024, month, 3, 8, 30, 0).unwrap();
        Observation {
            timestamp: at,
            device_id: "owner".into(),
            label: String::new(),
            address: address.into(),
            name: Some("Phone".into()),
            rssi: RSSI_UNKNOWN,
            scan_cycle_id: ScanCycleId::from_start(at),
            source: ScanSource::Classic,
        }
    }

    struct FailingStorage;

    impl Storage for FailingStorage {
        fn append_observation(&self, _observation: &Observation) -> Result<()> {
            Err(crate::error::SensorError::PersistenceError("disk full".into()))
        }

        fn append_local_device(&self, _info: &LocalDeviceInfo) -> Result<()> {
            Err(crate::error::SensorError::PersistenceError("disk full".into()))
        }
    }

    #[test]
    fn test_observations_partitioned_by_month() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path().to_path_buf());

        storage.append_observation(&observation("AA:BB:CC:DD:EE:01", 4)).unwrap();
        storage.append_observation(&observation("AA:BB:CC:DD:EE:02", 4)).unwrap();
        storage.append_observation(&observation("AA:BB:CC:DD:EE:03", 5)).unwrap();

        assert!(storage.observations_path(2024, 4).ends_with("observations/2024/04.jsonl"));
        let april = storage.load_month(2024, 4).unwrap();
        assert_eq!(april.len(), 2);
        assert_eq!(april[1].address, "AA:BB:CC:DD:EE:02");
        assert_eq!(storage.load_month(2024, 5).unwrap().len(), 1);
        assert!(storage.load_month(2024, 6).unwrap().is_empty());
    }

    #[test]
    fn test_local_device_appends() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path().to_path_buf());
        let info = LocalDeviceInfo {
            timestamp: Utc::now(),
            device_id: "owner".into(),
            label: "lab".into(),
            address: "00:11:22:33:44:55".into(),
            name: "hci0".into(),
        };
        storage.append_local_device(&info).unwrap();
        storage.append_local_device(&info).unwrap();

        let content = std::fs::read_to_string(storage.local_device_path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_worker_flush_covers_queued_records() {
        let memory = Arc::new(MemoryStorage::new());
        let (worker, _task) = StorageWorker::spawn(memory.clone());

        worker.append_observation(observation("AA:BB:CC:DD:EE:01", 1));
        worker.append_observation(observation("AA:BB:CC:DD:EE:02", 1));
        worker.flush().await.unwrap();

        assert_eq!(memory.observations().len(), 2);
    }

    #[tokio::test]
    async fn test_worker_survives_storage_failures() {
        let (worker, _task) = StorageWorker::spawn(Arc::new(FailingStorage));
        worker.append_observation(observation("AA:BB:CC:DD:EE:01", 1));
        tokio_test::assert_ok!(worker.flush().await);
    }

    struct SlowStorage {
        inner: MemoryStorage,
    }

    impl Storage for SlowStorage {
        fn append_observation(&self, observation: &Observation) -> Result<()> {
            std::thread::sleep(std::time::Duration::from_millis(200));
            self.inner.append_observation(observation)
        }

        fn append_local_device(&self, info: &LocalDeviceInfo) -> Result<()> {
            self.inner.append_local_device(info)
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_slow_write_does_not_block_runtime() {
        let slow = Arc::new(SlowStorage {
            inner: MemoryStorage::new(),
        });
        let (worker, _task) = StorageWorker::spawn(slow.clone());

        worker.append_observation(observation("AA:BB:CC:DD:EE:01", 1));
        tokio::task::yield_now().await;

        // Back on the only runtime thread while the write is still in flight.
        assert!(slow.inner.observations().is_empty());

        worker.flush().await.unwrap();
        assert_eq!(slow.inner.observations().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_exits_when_handles_drop() {
        let (worker, task) = StorageWorker::spawn(Arc::new(MemoryStorage::new()));
        drop(worker);
        tokio_test::assert_ok!(task.await);
    }
}

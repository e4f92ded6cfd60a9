//! BlueZ backend over D-Bus.
//!
//! BlueZ has no platform-timed inquiry the way some stacks do: a discovery
//! session runs until it is dropped. Classic discovery is therefore bounded
//! here by [`CLASSIC_INQUIRY`], after which the session is closed and
//! `DiscoveryFinished` is reported. BLE sessions run until
//! [`stop_ble_scan`](PlatformScanner::stop_ble_scan).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, DiscoveryFilter, DiscoveryTransport};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    AdapterInfo, BleScanFilter, BleScanSettings, PlatformError, PlatformEvent, PlatformReporter,
    PlatformResult, PlatformScanner, RawDevice, ScanMode, ScanToken,
};

/// Length of one classic inquiry, matching the usual 10.24 s inquiry plus
/// name resolution slack.
pub const CLASSIC_INQUIRY: Duration = Duration::from_secs(12);

fn backend(e: &bluer::Error) -> PlatformError {
    PlatformError::Backend {
        message: e.to_string(),
    }
}

#[derive(Debug, Default)]
struct Tasks {
    classic: Option<JoinHandle<()>>,
    ble: Option<JoinHandle<()>>,
    watch: Option<JoinHandle<()>>,
}

/// [`PlatformScanner`] backed by the system's default BlueZ adapter.
#[derive(Debug)]
pub struct BluezPlatform {
    adapter: Option<Adapter>,
    info: Option<AdapterInfo>,
    powered: Arc<AtomicBool>,
    discovering: Arc<AtomicBool>,
    reporter: Mutex<Option<PlatformReporter>>,
    tasks: Mutex<Tasks>,
}

impl BluezPlatform {
    /// Connect to BlueZ and pick the default adapter.
    ///
    /// A host without an adapter is not an error here; it shows up as
    /// [`adapter`](PlatformScanner::adapter) returning `None`.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the D-Bus session cannot be opened.
    pub async fn connect() -> PlatformResult<Self> {
        let session = bluer::Session::new().await.map_err(|e| backend(&e))?;

        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(error = %e, "no default Bluetooth adapter");
                return Ok(Self::detached(None, None, false));
            }
        };

        let address = adapter.address().await.map_err(|e| backend(&e))?;
        let name = match adapter.alias().await {
            Ok(alias) => alias,
            Err(_) => adapter.name().to_string(),
        };
        let powered = adapter.is_powered().await.map_err(|e| backend(&e))?;

        info!(adapter = adapter.name(), %address, powered, "using Bluetooth adapter");

        let info = AdapterInfo {
            address: address.to_string(),
            name,
        };
        Ok(Self::detached(Some(adapter), Some(info), powered))
    }

    fn detached(adapter: Option<Adapter>, info: Option<AdapterInfo>, powered: bool) -> Self {
        Self {
            adapter,
            info,
            powered: Arc::new(AtomicBool::new(powered)),
            discovering: Arc::new(AtomicBool::new(false)),
            reporter: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reporter(&self) -> Option<PlatformReporter> {
        self.reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ready(&self) -> PlatformResult<(Adapter, PlatformReporter)> {
        let adapter = self.adapter.clone().ok_or(PlatformError::AdapterNotFound)?;
        if !self.powered.load(Ordering::SeqCst) {
            return Err(PlatformError::AdapterDisabled);
        }
        let reporter = self.reporter().ok_or_else(|| PlatformError::Backend {
            message: "platform not attached".into(),
        })?;
        Ok((adapter, reporter))
    }
}

impl Drop for BluezPlatform {
    fn drop(&mut self) {
        let tasks = self.tasks();
        for task in [&tasks.classic, &tasks.ble, &tasks.watch].into_iter().flatten() {
            task.abort();
        }
    }
}

async fn describe(adapter: &Adapter, address: Address) -> (RawDevice, Option<i16>) {
    let (name, rssi) = match adapter.device(address) {
        Ok(device) => (
            device.name().await.ok().flatten(),
            device.rssi().await.ok().flatten(),
        ),
        Err(_) => (None, None),
    };
    (RawDevice::new(address.to_string(), name), rssi)
}

async fn run_classic(
    adapter: Adapter,
    reporter: PlatformReporter,
    discovering: Arc<AtomicBool>,
    token: ScanToken,
) {
    let filter = DiscoveryFilter {
        transport: DiscoveryTransport::BrEdr,
        ..DiscoveryFilter::default()
    };
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!(error = %e, "could not set classic discovery filter");
    }

    match adapter.discover_devices().await {
        Ok(stream) => {
            reporter.report(PlatformEvent::DiscoveryStarted { token });
            tokio::pin!(stream);
            let deadline = tokio::time::sleep(CLASSIC_INQUIRY);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    () = &mut deadline => break,
                    event = stream.next() => match event {
                        Some(AdapterEvent::DeviceAdded(address)) => {
                            let (device, rssi) = describe(&adapter, address).await;
                            reporter.report(PlatformEvent::ClassicDeviceFound {
                                token,
                                device: Some(device),
                                rssi,
                            });
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        }
        Err(e) => warn!(error = %e, "classic discovery session failed"),
    }

    discovering.store(false, Ordering::SeqCst);
    reporter.report(PlatformEvent::DiscoveryFinished { token });
}

async fn run_ble(
    adapter: Adapter,
    reporter: PlatformReporter,
    token: ScanToken,
    addresses: Vec<String>,
) {
    let filter = DiscoveryFilter {
        transport: DiscoveryTransport::Le,
        duplicate_data: true,
        ..DiscoveryFilter::default()
    };
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!(error = %e, "could not set BLE discovery filter");
    }

    let stream = match adapter.discover_devices_with_changes().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "BLE discovery session failed");
            return;
        }
    };
    tokio::pin!(stream);
    while let Some(event) = stream.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        let text = address.to_string();
        if !addresses.is_empty() && !addresses.iter().any(|a| a.eq_ignore_ascii_case(&text)) {
            continue;
        }
        let (device, rssi) = describe(&adapter, address).await;
        reporter.report(PlatformEvent::BleResult {
            token,
            device: Some(device),
            rssi,
        });
    }
}

impl PlatformScanner for BluezPlatform {
    fn attach(&self, reporter: PlatformReporter) {
        *self.reporter.lock().unwrap_or_else(PoisonError::into_inner) = Some(reporter.clone());

        let Some(adapter) = self.adapter.clone() else {
            return;
        };
        let powered = Arc::clone(&self.powered);
        let watch = tokio::spawn(async move {
            let events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "cannot watch adapter power state");
                    return;
                }
            };
            tokio::pin!(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(enabled)) = event {
                    powered.store(enabled, Ordering::SeqCst);
                    debug!(enabled, "adapter power changed");
                    if !reporter.report(PlatformEvent::AdapterStateChanged { enabled }) {
                        break;
                    }
                }
            }
        });

        if let Some(old) = self.tasks().watch.replace(watch) {
            old.abort();
        }
    }

    fn adapter(&self) -> Option<AdapterInfo> {
        self.info.clone()
    }

    fn is_enabled(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::SeqCst)
    }

    fn supports_ble(&self) -> bool {
        // BlueZ adapters that reach this point expose the LE transport.
        self.adapter.is_some()
    }

    fn start_classic_discovery(&self, token: ScanToken) -> PlatformResult<()> {
        let (adapter, reporter) = self.ready()?;
        self.discovering.store(true, Ordering::SeqCst);

        let task = tokio::spawn(run_classic(
            adapter,
            reporter,
            Arc::clone(&self.discovering),
            token,
        ));
        if let Some(old) = self.tasks().classic.replace(task) {
            old.abort();
        }
        debug!(%token, "classic discovery requested");
        Ok(())
    }

    fn cancel_classic_discovery(&self) -> PlatformResult<()> {
        if let Some(task) = self.tasks().classic.take() {
            task.abort();
        }
        self.discovering.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn start_ble_scan(
        &self,
        token: ScanToken,
        filter: Option<&BleScanFilter>,
        settings: &BleScanSettings,
    ) -> PlatformResult<()> {
        let (adapter, reporter) = self.ready().map_err(|e| PlatformError::BleScanFailed {
            message: e.to_string(),
        })?;
        if settings.mode != ScanMode::LowPower {
            debug!(mode = ?settings.mode, "BlueZ chooses its own duty cycle");
        }

        let addresses = filter.map(|f| f.addresses.clone()).unwrap_or_default();
        let task = tokio::spawn(run_ble(adapter, reporter, token, addresses));
        if let Some(old) = self.tasks().ble.replace(task) {
            old.abort();
        }
        debug!(%token, "BLE scan requested");
        Ok(())
    }

    fn stop_ble_scan(&self) -> PlatformResult<()> {
        if let Some(task) = self.tasks().ble.take() {
            task.abort();
        }
        Ok(())
    }
}

//! Event observer that writes sensor activity to the log.

use proxisense_core::{EventSink, Observation, ScanCycleId};
use tracing::{debug, info, warn};

/// Logs every sensor event. Detections carry the observation as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl LoggingSink {
    fn detection(kind: &str, observation: &Observation) {
        match observation.to_json() {
            Ok(json) => info!(kind, observation = %json, "device detected"),
            Err(e) => {
                warn!(kind, address = %observation.address, error = %e, "unrenderable observation");
            }
        }
    }
}

impl EventSink for LoggingSink {
    fn on_detected(&self, observation: &Observation) {
        Self::detection("classic", observation);
    }

    fn on_ble_detected(&self, observation: &Observation) {
        Self::detection("ble", observation);
    }

    fn on_scan_started(&self, cycle: ScanCycleId) {
        debug!(%cycle, "classic scan started");
    }

    fn on_scan_ended(&self, cycle: ScanCycleId) {
        debug!(%cycle, "classic scan ended");
    }

    fn on_ble_scan_started(&self, cycle: ScanCycleId) {
        debug!(%cycle, "BLE scan started");
    }

    fn on_ble_scan_ended(&self, cycle: ScanCycleId) {
        debug!(%cycle, "BLE scan ended");
    }

    fn on_bluetooth_disabled(&self) {
        warn!("Bluetooth is disabled on this device");
    }

    fn on_bluetooth_restored(&self) {
        info!("Bluetooth is enabled again");
    }
}

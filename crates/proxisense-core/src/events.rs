//! Fan-out of sensor events to registered observers.
//!
//! Observers are fire-and-forget: they get no acknowledgement path and a
//! misbehaving observer cannot affect the scan engine. They run on the
//! orchestrator task, so implementations must return quickly.

use std::fmt;
use std::sync::Arc;

use crate::types::{Observation, ScanCycleId};

/// Everything the sensor reports to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorEvent {
    /// A classic inquiry found a device.
    Detected(Observation),
    /// A BLE scan found a device not yet seen this cycle.
    BleDetected(Observation),
    /// Classic discovery began.
    ScanStarted(ScanCycleId),
    /// Classic discovery finished or was force-ended.
    ScanEnded(ScanCycleId),
    /// BLE scanning began.
    BleScanStarted(ScanCycleId),
    /// BLE scanning stopped.
    BleScanEnded(ScanCycleId),
    /// Bluetooth is off; scanning is not possible right now.
    BluetoothDisabled,
    /// Bluetooth came back on after being reported disabled.
    BluetoothRestored,
}

/// Observer of sensor activity.
///
/// Every method has an empty default so observers implement only what they
/// care about.
pub trait EventSink: Send + Sync {
    /// A classic inquiry produced an observation.
    fn on_detected(&self, _observation: &Observation) {}

    /// A BLE scan produced an observation.
    fn on_ble_detected(&self, _observation: &Observation) {}

    /// Classic discovery started for `cycle`.
    fn on_scan_started(&self, _cycle: ScanCycleId) {}

    /// Classic discovery ended for `cycle`.
    fn on_scan_ended(&self, _cycle: ScanCycleId) {}

    /// BLE scanning started for `cycle`.
    fn on_ble_scan_started(&self, _cycle: ScanCycleId) {}

    /// BLE scanning ended for `cycle`.
    fn on_ble_scan_ended(&self, _cycle: ScanCycleId) {}

    /// Bluetooth is disabled.
    fn on_bluetooth_disabled(&self) {}

    /// Bluetooth was re-enabled.
    fn on_bluetooth_restored(&self) {}
}

/// The registered observer set.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer.
    pub fn subscribe(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Builder-style [`subscribe`](Self::subscribe).
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.subscribe(sink);
        self
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no observer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Deliver `event` to every observer in registration order.
    pub fn publish(&self, event: &SensorEvent) {
        for sink in &self.sinks {
            match event {
                SensorEvent::Detected(obs) => sink.on_detected(obs),
                SensorEvent::BleDetected(obs) => sink.on_ble_detected(obs),
                SensorEvent::ScanStarted(cycle) => sink.on_scan_started(*cycle),
                SensorEvent::ScanEnded(cycle) => sink.on_scan_ended(*cycle),
                SensorEvent::BleScanStarted(cycle) => sink.on_ble_scan_started(*cycle),
                SensorEvent::BleScanEnded(cycle) => sink.on_ble_scan_ended(*cycle),
                SensorEvent::BluetoothDisabled => sink.on_bluetooth_disabled(),
                SensorEvent::BluetoothRestored => sink.on_bluetooth_restored(),
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Observer that records every event it receives.
///
/// Handy for tests and for callers that poll instead of reacting.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<SensorEvent>>,
}

impl RecordingSink {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything received so far.
    #[must_use]
    pub fn events(&self) -> Vec<SensorEvent> {
        self.lock().clone()
    }

    /// Drain everything received so far.
    pub fn take(&self) -> Vec<SensorEvent> {
        std::mem::take(&mut *self.lock())
    }

    fn push(&self, event: SensorEvent) {
        self.lock().push(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SensorEvent>> {
        // A poisoned recorder still holds valid events.
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl EventSink for RecordingSink {
    fn on_detected(&self, observation: &Observation) {
        self.push(SensorEvent::Detected(observation.clone()));
    }

    fn on_ble_detected(&self, observation: &Observation) {
        self.push(SensorEvent::BleDetected(observation.clone()));
    }

    fn on_scan_started(&self, cycle: ScanCycleId) {
        self.push(SensorEvent::ScanStarted(cycle));
    }

    fn on_scan_ended(&self, cycle: ScanCycleId) {
        self.push(SensorEvent::ScanEnded(cycle));
    }

    fn on_ble_scan_started(&self, cycle: ScanCycleId) {
        self.push(SensorEvent::BleScanStarted(cycle));
    }

    fn on_ble_scan_ended(&self, cycle: ScanCycleId) {
        self.push(SensorEvent::BleScanEnded(cycle));
    }

    fn on_bluetooth_disabled(&self) {
        self.push(SensorEvent::BluetoothDisabled);
    }

    fn on_bluetooth_restored(&self) {
        self.push(SensorEvent::BluetoothRestored);
    }
}

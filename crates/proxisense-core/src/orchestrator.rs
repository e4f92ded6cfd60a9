//! Top-level scan coordinator.
//!
//! [`ScanOrchestrator`] runs as a single tokio task that owns the state
//! machine, the scheduler, the configuration, and the BLE deadline timer.
//! Everything that can change its state arrives as a [`Command`] on one
//! unbounded mailbox: caller requests through [`SensorHandle`], platform
//! reports through [`PlatformReporter`], and timer firings. Handlers run to
//! completion without awaiting, so they never block the platform and never
//! race each other.
//!
//! Platform trouble stops here. A bad device record is logged and dropped,
//! a refused discovery becomes a `BluetoothDisabled` event, and nothing
//! propagates back into the scheduler or the caller. The only errors a
//! caller ever sees come from `start`: invalid configuration and a missing
//! adapter.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::SensorClock;
use crate::config::{SensorConfig, DEFAULT_BLE_SCAN_WINDOW_MS};
use crate::error::{Result, SensorError};
use crate::events::{EventBus, SensorEvent};
use crate::machine::{
    AbortedCycle, AdapterStatus, NextPhase, ScanPhase, ScanRequest, ScanStateMachine,
};
use crate::platform::{
    BleScanSettings, PlatformEvent, PlatformReporter, PlatformScanner, RawDevice, ScanToken,
};
use crate::scheduler::Scheduler;
use crate::storage::{Storage, StorageWorker};
use crate::types::{LocalDeviceInfo, Observation, ScanCycleId, ScanSource, RSSI_UNKNOWN};

/// Mailbox message for the orchestrator task.
#[derive(Debug)]
pub(crate) enum Command {
    Start {
        config: SensorConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SetLabel(String),
    RequestScan,
    Tick {
        generation: u64,
    },
    BleDeadline {
        token: ScanToken,
    },
    Platform(PlatformEvent),
    Status(oneshot::Sender<SensorStatus>),
    Flush(oneshot::Sender<oneshot::Receiver<()>>),
    Shutdown(oneshot::Sender<()>),
}

/// Coarse sensor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    /// Not scheduled. `start` arms it.
    #[default]
    Stopped,
    /// Scheduled and scanning on every tick.
    Running,
    /// Adapter was absent at start. Terminal.
    Terminated,
}

/// Snapshot of the orchestrator's state.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorStatus {
    /// Lifecycle.
    pub lifecycle: Lifecycle,
    /// Current scan phase.
    pub phase: ScanPhase,
    /// Cycle in progress.
    pub cycle: Option<ScanCycleId>,
    /// Distinct BLE addresses seen in the running BLE scan.
    pub ble_seen: usize,
    /// Live scheduler spacing.
    pub interval: Option<Duration>,
    /// Whether the missing-Bluetooth condition is raised.
    pub bluetooth_missing: bool,
    /// Configuration in force.
    pub config: Option<SensorConfig>,
}

/// Cloneable handle to a running orchestrator.
#[derive(Debug, Clone)]
pub struct SensorHandle {
    mailbox: mpsc::UnboundedSender<Command>,
}

impl SensorHandle {
    /// Start scanning with `config`, or apply a new config to a running sensor.
    ///
    /// Starting again with an identical config does nothing. A changed
    /// frequency re-arms the scheduler without disturbing a cycle in progress.
    ///
    /// # Errors
    ///
    /// - `ConfigValidationError` if the config is invalid; the previous
    ///   schedule stays untouched.
    /// - `BluetoothAdapterNotFound` if the host has no adapter; the sensor
    ///   becomes terminated.
    /// - `SensorTerminated` on any start after termination.
    pub async fn start(&self, config: SensorConfig) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { config, reply })?;
        rx.await.map_err(|_| SensorError::SensorUnavailable)?
    }

    /// Disarm the scheduler and force any cycle in progress back to idle.
    ///
    /// # Errors
    ///
    /// Returns `SensorUnavailable` if the orchestrator task is gone.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply })?;
        rx.await.map_err(|_| SensorError::SensorUnavailable)
    }

    /// Replace the label stamped into later observations.
    ///
    /// # Errors
    ///
    /// Returns `SensorUnavailable` if the orchestrator task is gone.
    pub fn set_label(&self, label: impl Into<String>) -> Result<()> {
        self.send(Command::SetLabel(label.into()))
    }

    /// Ask for a scan now, outside the schedule.
    ///
    /// A discovery already running is cancelled and restarted.
    ///
    /// # Errors
    ///
    /// Returns `SensorUnavailable` if the orchestrator task is gone.
    pub fn request_scan(&self) -> Result<()> {
        self.send(Command::RequestScan)
    }

    /// Current state.
    ///
    /// Resolves after every command sent before it has been handled.
    ///
    /// # Errors
    ///
    /// Returns `SensorUnavailable` if the orchestrator task is gone.
    pub async fn status(&self) -> Result<SensorStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status(reply))?;
        rx.await.map_err(|_| SensorError::SensorUnavailable)
    }

    /// Wait until every record produced so far has been handed to storage.
    ///
    /// # Errors
    ///
    /// Returns `SensorUnavailable` if the orchestrator task is gone.
    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Flush(reply))?;
        let flushed = rx.await.map_err(|_| SensorError::SensorUnavailable)?;
        flushed.await.map_err(|_| SensorError::SensorUnavailable)
    }

    /// Stop the sensor and end the orchestrator task.
    ///
    /// # Errors
    ///
    /// Returns `SensorUnavailable` if the task was already gone.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown(reply))?;
        rx.await.map_err(|_| SensorError::SensorUnavailable)
    }

    /// A reporter feeding this sensor, for platform backends created later.
    #[must_use]
    pub fn reporter(&self) -> PlatformReporter {
        PlatformReporter::new(self.mailbox.clone())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.mailbox
            .send(command)
            .map_err(|_| SensorError::SensorUnavailable)
    }
}

/// The scan coordinator. See the module docs.
pub struct ScanOrchestrator {
    platform: Arc<dyn PlatformScanner>,
    storage: StorageWorker,
    events: EventBus,
    clock: SensorClock,
    machine: ScanStateMachine,
    scheduler: Scheduler,
    mailbox: mpsc::UnboundedSender<Command>,
    config: Option<SensorConfig>,
    lifecycle: Lifecycle,
    ble_timer: Option<JoinHandle<()>>,
    bluetooth_missing: bool,
}

impl ScanOrchestrator {
    /// Spawn the orchestrator and its storage worker on the current runtime.
    ///
    /// The platform is attached immediately; nothing is scheduled until
    /// [`SensorHandle::start`].
    pub fn spawn(
        platform: Arc<dyn PlatformScanner>,
        storage: Arc<dyn Storage>,
        events: EventBus,
    ) -> (SensorHandle, JoinHandle<()>) {
        Self::spawn_with_clock(platform, storage, events, SensorClock::new())
    }

    /// [`spawn`](Self::spawn) with an explicit clock.
    pub fn spawn_with_clock(
        platform: Arc<dyn PlatformScanner>,
        storage: Arc<dyn Storage>,
        events: EventBus,
        clock: SensorClock,
    ) -> (SensorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (storage, _storage_task) = StorageWorker::spawn(storage);

        platform.attach(PlatformReporter::new(tx.clone()));

        let ticks = tx.clone();
        let scheduler = Scheduler::new(Arc::new(move |generation| {
            ticks.send(Command::Tick { generation }).is_ok()
        }));

        let orchestrator = Self {
            platform,
            storage,
            events,
            clock,
            machine: ScanStateMachine::default(),
            scheduler,
            mailbox: tx.clone(),
            config: None,
            lifecycle: Lifecycle::Stopped,
            ble_timer: None,
            bluetooth_missing: false,
        };

        let task = tokio::spawn(orchestrator.run(rx));
        (SensorHandle { mailbox: tx }, task)
    }

    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = mailbox.recv().await {
            if self.handle(command).is_break() {
                break;
            }
        }
        debug!("orchestrator task finished");
    }

    fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Start { config, reply } => {
                let _ = reply.send(self.start(config));
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::SetLabel(label) => self.set_label(label),
            Command::RequestScan => self.request_scan(),
            Command::Tick { generation } => self.on_tick(generation),
            Command::BleDeadline { token } => self.end_ble(token, "deadline reached"),
            Command::Platform(event) => self.on_platform_event(event),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Flush(reply) => {
                let _ = reply.send(self.storage.flush());
            }
            Command::Shutdown(reply) => {
                self.stop();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // =========================================================================
    // CALLER OPERATIONS
    // =========================================================================

    fn start(&mut self, config: SensorConfig) -> Result<()> {
        if self.lifecycle == Lifecycle::Terminated {
            return Err(SensorError::SensorTerminated);
        }

        config.validate()?;

        if self.platform.adapter().is_none() {
            warn!("No bluetooth is detected on this device");
            self.stop();
            self.lifecycle = Lifecycle::Terminated;
            return Err(SensorError::BluetoothAdapterNotFound);
        }

        let running = self.lifecycle == Lifecycle::Running;
        if running && self.config.as_ref() == Some(&config) {
            debug!("start with unchanged config, nothing to do");
            return Ok(());
        }

        let frequency_changed = self
            .config
            .as_ref()
            .map_or(true, |current| current.frequency_minutes != config.frequency_minutes);

        if !config.enabled {
            self.config = Some(config);
            self.stop();
            info!("sensor disabled by configuration");
            return Ok(());
        }

        let interval = config.scan_interval();
        let frequency_minutes = config.frequency_minutes;
        self.config = Some(config);
        self.machine.set_ble_supported(self.platform.supports_ble());

        if self.platform.is_enabled() {
            self.clear_missing_bluetooth();
        } else {
            self.raise_missing_bluetooth();
        }

        if !running || frequency_changed || !self.scheduler.is_armed() {
            self.scheduler.rearm(interval);
        }
        self.lifecycle = Lifecycle::Running;
        self.record_local_device();

        info!(frequency_minutes, "Bluetooth sensor is active");
        Ok(())
    }

    fn stop(&mut self) {
        self.scheduler.disarm();
        self.abort_cycle();
        if self.lifecycle == Lifecycle::Running {
            self.lifecycle = Lifecycle::Stopped;
            info!("Bluetooth sensor stopped");
        }
    }

    fn set_label(&mut self, label: String) {
        let Some(current) = &self.config else {
            debug!("label update before first start ignored");
            return;
        };
        let updated = SensorConfig {
            label,
            ..current.clone()
        };
        match updated.validate() {
            Ok(()) => {
                debug!(label = %updated.label, "label updated");
                self.config = Some(updated);
            }
            Err(e) => warn!(error = %e, "rejected label update"),
        }
    }

    fn status(&self) -> SensorStatus {
        SensorStatus {
            lifecycle: self.lifecycle,
            phase: self.machine.phase(),
            cycle: self.machine.cycle().map(|c| c.id),
            ble_seen: self.machine.dedup_len(),
            interval: self.scheduler.interval(),
            bluetooth_missing: self.bluetooth_missing,
            config: self.config.clone(),
        }
    }

    // =========================================================================
    // SCHEDULING
    // =========================================================================

    fn on_tick(&mut self, generation: u64) {
        if self.lifecycle != Lifecycle::Running || !self.scheduler.is_current(generation) {
            debug!(generation, "dropping stale scheduler tick");
            return;
        }
        self.record_local_device();
        self.request_scan();
    }

    fn record_local_device(&self) {
        let Some(config) = &self.config else { return };
        let Some(adapter) = self.platform.adapter() else {
            warn!("Bluetooth adapter disappeared, skipping local device record");
            return;
        };
        let info = LocalDeviceInfo {
            timestamp: self.clock.now(),
            device_id: config.device_id.clone(),
            label: config.label.clone(),
            address: adapter.address,
            name: adapter.name,
        };
        debug!(address = %info.address, name = %info.name, "Bluetooth local information");
        self.storage.append_local_device(info);
    }

    fn request_scan(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            debug!("scan requested while not running");
            return;
        }

        let status = AdapterStatus {
            enabled: self.platform.is_enabled(),
            discovering: self.platform.is_discovering(),
        };

        match self.machine.request_scan(status, self.clock.now()) {
            ScanRequest::Disabled => {
                info!("Bluetooth is turned off, skipping scan");
                self.report_bluetooth_off();
            }
            ScanRequest::Busy { cycle } => {
                debug!(%cycle, "BLE phase in progress, scan request ignored");
            }
            ScanRequest::Start {
                token,
                cycle,
                cancel_first,
            } => {
                if cancel_first {
                    debug!("cancelling foreign discovery before starting ours");
                    self.cancel_discovery();
                }
                debug!(%cycle, %token, "starting classic discovery");
                self.launch_classic(token);
            }
            ScanRequest::Restart { token, cycle } => {
                info!(%cycle, %token, "interrupting ongoing discovery");
                self.cancel_discovery();
                self.launch_classic(token);
            }
        }
    }

    fn launch_classic(&mut self, token: ScanToken) {
        let Err(e) = self.platform.start_classic_discovery(token) else {
            self.clear_missing_bluetooth();
            return;
        };
        warn!(error = %e, "classic discovery did not start");
        if let Some(aborted) = self.machine.classic_start_failed(token) {
            if aborted.announced {
                self.events.publish(&SensorEvent::ScanEnded(aborted.cycle));
            }
        }
        self.report_bluetooth_off();
    }

    fn cancel_discovery(&self) {
        if let Err(e) = self.platform.cancel_classic_discovery() {
            warn!(error = %e, "failed to cancel classic discovery");
        }
    }

    // =========================================================================
    // PLATFORM EVENTS
    // =========================================================================

    fn on_platform_event(&mut self, event: PlatformEvent) {
        if self.lifecycle != Lifecycle::Running {
            debug!(?event, "platform event while not running, dropped");
            return;
        }
        match event {
            PlatformEvent::DiscoveryStarted { token } => self.on_discovery_started(token),
            PlatformEvent::ClassicDeviceFound { token, device, rssi } => {
                self.on_classic_device_found(token, device, rssi);
            }
            PlatformEvent::DiscoveryFinished { token } => self.on_discovery_finished(token),
            PlatformEvent::BleResult {
                token,
                device,
                rssi,
            } => self.on_ble_device_found(token, device, rssi),
            PlatformEvent::AdapterStateChanged { enabled } => {
                self.on_adapter_state_changed(enabled);
            }
        }
    }

    fn on_discovery_started(&mut self, token: ScanToken) {
        if let Some(cycle) = self.machine.discovery_started(token) {
            info!(%cycle, "Bluetooth scan started");
            self.events.publish(&SensorEvent::ScanStarted(cycle));
        }
    }

    fn on_classic_device_found(
        &mut self,
        token: ScanToken,
        device: Option<RawDevice>,
        rssi: Option<i16>,
    ) {
        let Some(cycle) = self.machine.classic_cycle(token) else {
            debug!(%token, "classic report for stale discovery, dropped");
            return;
        };
        let Some(observation) = self.observe(device, rssi, cycle, ScanSource::Classic) else {
            return;
        };
        self.deliver(observation);
    }

    fn on_discovery_finished(&mut self, token: ScanToken) {
        let window = self.config.as_ref().map_or(
            Duration::from_millis(DEFAULT_BLE_SCAN_WINDOW_MS),
            SensorConfig::ble_scan_window,
        );

        let Some(outcome) = self
            .machine
            .discovery_finished(token, self.clock.now(), window)
        else {
            return;
        };

        if outcome.announce_start {
            self.events.publish(&SensorEvent::ScanStarted(outcome.cycle));
        }
        info!(cycle = %outcome.cycle, "Bluetooth scan ended");
        self.events.publish(&SensorEvent::ScanEnded(outcome.cycle));

        match outcome.next {
            NextPhase::Ble { token, deadline } => {
                debug!(cycle = %outcome.cycle, %deadline, "advancing to BLE scan");
                self.start_ble(token, outcome.cycle, window);
            }
            NextPhase::Idle => debug!(cycle = %outcome.cycle, "no BLE support, cycle complete"),
        }
    }

    fn start_ble(&mut self, token: ScanToken, cycle: ScanCycleId, window: Duration) {
        let settings = BleScanSettings::low_power();
        if let Err(e) = self.platform.start_ble_scan(token, None, &settings) {
            warn!(error = %e, "BLE scan did not start");
            self.machine.ble_start_failed(token);
            return;
        }

        self.arm_ble_deadline(token, window);
        info!(%cycle, window_ms = window.as_millis(), "BLE scan started");
        self.events.publish(&SensorEvent::BleScanStarted(cycle));
    }

    fn arm_ble_deadline(&mut self, token: ScanToken, window: Duration) {
        self.cancel_ble_deadline();
        let mailbox = self.mailbox.clone();
        self.ble_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = mailbox.send(Command::BleDeadline { token });
        }));
    }

    fn cancel_ble_deadline(&mut self) {
        if let Some(timer) = self.ble_timer.take() {
            timer.abort();
        }
    }

    fn on_ble_device_found(
        &mut self,
        token: ScanToken,
        device: Option<RawDevice>,
        rssi: Option<i16>,
    ) {
        let Some(device) = device else {
            debug!("BLE result without a device, dropped");
            return;
        };
        let Some(address) = device.normalized_address() else {
            debug!(address = %device.address, "BLE result with malformed address, dropped");
            return;
        };
        let Some(cycle) = self.machine.accept_ble_result(token, &address) else {
            return;
        };
        if let Some(observation) = self.observe(Some(device), rssi, cycle, ScanSource::Ble) {
            self.deliver(observation);
        }
    }

    fn end_ble(&mut self, token: ScanToken, reason: &str) {
        let Some(cycle) = self.machine.finish_ble(token) else {
            debug!(%token, "BLE stop for inactive scan ignored");
            return;
        };
        self.cancel_ble_deadline();
        if let Err(e) = self.platform.stop_ble_scan() {
            warn!(error = %e, "failed to stop BLE scan");
        }
        info!(%cycle, reason, "BLE scan ended");
        self.events.publish(&SensorEvent::BleScanEnded(cycle));
    }

    fn on_adapter_state_changed(&mut self, enabled: bool) {
        if enabled {
            self.clear_missing_bluetooth();
        } else {
            self.raise_missing_bluetooth();
            self.abort_cycle();
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn abort_cycle(&mut self) {
        let ble_token = self.machine.ble_token();
        let Some(AbortedCycle {
            cycle,
            phase,
            announced,
        }) = self.machine.abort()
        else {
            return;
        };

        match phase {
            ScanPhase::ClassicScanning | ScanPhase::ClassicFinished => {
                self.cancel_discovery();
                if announced {
                    self.events.publish(&SensorEvent::ScanEnded(cycle));
                }
            }
            ScanPhase::BleScanning => {
                self.cancel_ble_deadline();
                if let Err(e) = self.platform.stop_ble_scan() {
                    warn!(error = %e, "failed to stop BLE scan");
                }
                debug!(%cycle, token = ?ble_token, "BLE scan stopped early");
                self.events.publish(&SensorEvent::BleScanEnded(cycle));
            }
            ScanPhase::Idle => {}
        }
        info!(%cycle, ?phase, "scan cycle aborted");
    }

    fn raise_missing_bluetooth(&mut self) {
        if self.bluetooth_missing {
            return;
        }
        self.bluetooth_missing = true;
        warn!("Bluetooth is disabled, scans paused until it is enabled");
        self.events.publish(&SensorEvent::BluetoothDisabled);
    }

    /// A scan could not run. Notifies on every refused request and raises
    /// the condition so a later re-enable clears it.
    fn report_bluetooth_off(&mut self) {
        self.bluetooth_missing = true;
        self.events.publish(&SensorEvent::BluetoothDisabled);
    }

    fn clear_missing_bluetooth(&mut self) {
        if !self.bluetooth_missing {
            return;
        }
        self.bluetooth_missing = false;
        info!("Bluetooth enabled again, scanning resumes on the next tick");
        self.events.publish(&SensorEvent::BluetoothRestored);
    }

    /// Build an observation, or `None` for a record that cannot be used.
    fn observe(
        &self,
        device: Option<RawDevice>,
        rssi: Option<i16>,
        cycle: ScanCycleId,
        source: ScanSource,
    ) -> Option<Observation> {
        let Some(device) = device else {
            debug!(%source, "No Bluetooth device was discovered during the scan");
            return None;
        };
        let Some(address) = device.normalized_address() else {
            warn!(%source, address = %device.address, "malformed device address, dropped");
            return None;
        };
        let config = self.config.as_ref()?;
        Some(Observation {
            timestamp: self.clock.now(),
            device_id: config.device_id.clone(),
            label: config.label.clone(),
            address,
            name: device.display_name(),
            rssi: rssi.unwrap_or(RSSI_UNKNOWN),
            scan_cycle_id: cycle,
            source,
        })
    }

    fn deliver(&self, observation: Observation) {
        debug!(
            source = %observation.source,
            address = %observation.address,
            rssi = observation.rssi,
            cycle = %observation.scan_cycle_id,
            "new Bluetooth device"
        );
        let event = match observation.source {
            ScanSource::Classic => SensorEvent::Detected(observation.clone()),
            ScanSource::Ble => SensorEvent::BleDetected(observation.clone()),
        };
        self.storage.append_observation(observation);
        self.events.publish(&event);
    }
}

impl Drop for ScanOrchestrator {
    fn drop(&mut self) {
        self.cancel_ble_deadline();
    }
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("lifecycle", &self.lifecycle)
            .field("phase", &self.machine.phase())
            .field("scheduler", &self.scheduler)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

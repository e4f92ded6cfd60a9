//! Scriptable in-process platform.
//!
//! Without a script the mock only records calls and waits for the caller to
//! inject events, which gives tests full control over timing. With a
//! [`MockScript`] it plays back a fixed neighbourhood of devices on every
//! scan, which is what the daemon uses when built without BlueZ support.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use super::{
    AdapterInfo, BleScanFilter, BleScanSettings, PlatformError, PlatformEvent, PlatformReporter,
    PlatformResult, PlatformScanner, RawDevice, ScanToken,
};

/// A simulated nearby device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDevice {
    /// Hardware address.
    pub address: String,
    /// Advertised name.
    pub name: Option<String>,
    /// Reported signal strength.
    pub rssi: i16,
}

impl MockDevice {
    /// Build a simulated device.
    pub fn new(address: impl Into<String>, name: Option<&str>, rssi: i16) -> Self {
        Self {
            address: address.into(),
            name: name.map(str::to_owned),
            rssi,
        }
    }

    fn raw(&self) -> RawDevice {
        RawDevice::new(self.address.clone(), self.name.clone())
    }
}

/// Devices played back on every scan.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Found during classic discovery.
    pub classic_devices: Vec<MockDevice>,
    /// Advertising during BLE scans.
    pub ble_devices: Vec<MockDevice>,
    /// How long classic discovery runs before finishing.
    pub classic_duration: Duration,
    /// How many times each BLE device advertises per scan.
    pub ble_repeats: usize,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            classic_devices: vec![
                MockDevice::new("00:1A:7D:DA:71:13", Some("Desk Speaker"), -58),
                MockDevice::new("3C:5A:B4:01:02:03", Some("Pixel 8"), -71),
            ],
            ble_devices: vec![
                MockDevice::new("C8:2B:96:10:20:30", Some("Tag"), -80),
                MockDevice::new("E4:5F:01:AA:BB:CC", None, -66),
            ],
            classic_duration: Duration::from_secs(2),
            ble_repeats: 3,
        }
    }
}

/// A platform call recorded by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCall {
    /// `start_classic_discovery`
    StartClassic(ScanToken),
    /// `cancel_classic_discovery`
    CancelClassic,
    /// `start_ble_scan`
    StartBle(ScanToken),
    /// `stop_ble_scan`
    StopBle,
}

#[derive(Debug)]
struct MockState {
    adapter: Option<AdapterInfo>,
    enabled: bool,
    discovering: bool,
    ble_supported: bool,
    fail_classic_start: bool,
    fail_ble_start: bool,
    calls: Vec<MockCall>,
    last_classic: Option<ScanToken>,
    last_ble: Option<ScanToken>,
    classic_task: Option<JoinHandle<()>>,
    ble_task: Option<JoinHandle<()>>,
}

/// In-process [`PlatformScanner`].
#[derive(Debug)]
pub struct MockPlatform {
    state: Mutex<MockState>,
    reporter: Mutex<Option<PlatformReporter>>,
    script: Option<MockScript>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    /// Enabled adapter with BLE support, driven by hand.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                adapter: Some(AdapterInfo {
                    address: "00:11:22:33:44:55".into(),
                    name: "mock0".into(),
                }),
                enabled: true,
                discovering: false,
                ble_supported: true,
                fail_classic_start: false,
                fail_ble_start: false,
                calls: Vec::new(),
                last_classic: None,
                last_ble: None,
                classic_task: None,
                ble_task: None,
            }),
            reporter: Mutex::new(None),
            script: None,
        }
    }

    /// A host with no Bluetooth hardware.
    #[must_use]
    pub fn without_adapter() -> Self {
        let mock = Self::new();
        mock.state().adapter = None;
        mock
    }

    /// Play back `script` on every scan.
    #[must_use]
    pub fn with_script(mut self, script: MockScript) -> Self {
        self.script = Some(script);
        self
    }

    /// Set BLE capability.
    #[must_use]
    pub fn with_ble_support(self, supported: bool) -> Self {
        self.state().ble_supported = supported;
        self
    }

    /// Set adapter power without notifying anyone.
    pub fn set_enabled(&self, enabled: bool) {
        self.state().enabled = enabled;
    }

    /// Pretend another application is (or is not) running discovery.
    pub fn set_discovering(&self, discovering: bool) {
        self.state().discovering = discovering;
    }

    /// Make later `start_classic_discovery` calls fail.
    pub fn fail_classic_start(&self, fail: bool) {
        self.state().fail_classic_start = fail;
    }

    /// Make later `start_ble_scan` calls fail.
    pub fn fail_ble_start(&self, fail: bool) {
        self.state().fail_ble_start = fail;
    }

    /// Power the adapter on or off and report the change.
    pub fn toggle_adapter(&self, enabled: bool) {
        self.set_enabled(enabled);
        self.emit(PlatformEvent::AdapterStateChanged { enabled });
    }

    /// Every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Drain the recorded calls.
    pub fn take_calls(&self) -> Vec<MockCall> {
        std::mem::take(&mut self.state().calls)
    }

    /// Token of the most recent classic discovery request.
    #[must_use]
    pub fn last_classic_token(&self) -> Option<ScanToken> {
        self.state().last_classic
    }

    /// Token of the most recent BLE scan request.
    #[must_use]
    pub fn last_ble_token(&self) -> Option<ScanToken> {
        self.state().last_ble
    }

    /// Inject an event as if the platform produced it.
    ///
    /// Returns `false` when nothing is attached or the sensor is gone.
    pub fn emit(&self, event: PlatformEvent) -> bool {
        if matches!(event, PlatformEvent::DiscoveryFinished { .. }) {
            self.state().discovering = false;
        }
        let reporter = self.reporter.lock().unwrap_or_else(PoisonError::into_inner).clone();
        reporter.is_some_and(|r| r.report(event))
    }

    /// Report discovery-started for the latest classic request.
    pub fn discovery_started(&self) -> bool {
        self.last_classic_token()
            .is_some_and(|token| self.emit(PlatformEvent::DiscoveryStarted { token }))
    }

    /// Report discovery-finished for the latest classic request.
    pub fn discovery_finished(&self) -> bool {
        self.last_classic_token()
            .is_some_and(|token| self.emit(PlatformEvent::DiscoveryFinished { token }))
    }

    /// Report a classic device for the latest classic request.
    pub fn classic_device_found(
        &self,
        address: &str,
        name: Option<&str>,
        rssi: Option<i16>,
    ) -> bool {
        self.last_classic_token().is_some_and(|token| {
            self.emit(PlatformEvent::ClassicDeviceFound {
                token,
                device: Some(RawDevice::new(address, name.map(str::to_owned))),
                rssi,
            })
        })
    }

    /// Report a BLE advertisement for the latest BLE scan.
    pub fn ble_result(&self, address: &str, rssi: Option<i16>) -> bool {
        self.last_ble_token().is_some_and(|token| {
            self.emit(PlatformEvent::BleResult {
                token,
                device: Some(RawDevice::new(address, None)),
                rssi,
            })
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reporter(&self) -> Option<PlatformReporter> {
        self.reporter.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn play_classic(&self, token: ScanToken) -> Option<JoinHandle<()>> {
        let script = self.script.clone()?;
        let reporter = self.reporter()?;
        Some(tokio::spawn(async move {
            reporter.report(PlatformEvent::DiscoveryStarted { token });
            let slots = u32::try_from(script.classic_devices.len() + 1).unwrap_or(1);
            let step = script.classic_duration / slots;
            for device in &script.classic_devices {
                tokio::time::sleep(step).await;
                reporter.report(PlatformEvent::ClassicDeviceFound {
                    token,
                    device: Some(device.raw()),
                    rssi: Some(device.rssi),
                });
            }
            tokio::time::sleep(step).await;
            reporter.report(PlatformEvent::DiscoveryFinished { token });
        }))
    }

    fn play_ble(&self, token: ScanToken) -> Option<JoinHandle<()>> {
        let script = self.script.clone()?;
        let reporter = self.reporter()?;
        Some(tokio::spawn(async move {
            for _ in 0..script.ble_repeats {
                for device in &script.ble_devices {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    reporter.report(PlatformEvent::BleResult {
                        token,
                        device: Some(device.raw()),
                        rssi: Some(device.rssi),
                    });
                }
            }
        }))
    }
}

impl PlatformScanner for MockPlatform {
    fn attach(&self, reporter: PlatformReporter) {
        *self.reporter.lock().unwrap_or_else(PoisonError::into_inner) = Some(reporter);
    }

    fn adapter(&self) -> Option<AdapterInfo> {
        self.state().adapter.clone()
    }

    fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    fn is_discovering(&self) -> bool {
        self.state().discovering
    }

    fn supports_ble(&self) -> bool {
        self.state().ble_supported
    }

    fn start_classic_discovery(&self, token: ScanToken) -> PlatformResult<()> {
        {
            let mut state = self.state();
            state.calls.push(MockCall::StartClassic(token));
            if state.fail_classic_start || !state.enabled {
                return Err(PlatformError::DiscoveryFailed {
                    message: "mock adapter refused discovery".into(),
                });
            }
            state.discovering = true;
            state.last_classic = Some(token);
        }
        let task = self.play_classic(token);
        self.state().classic_task = task;
        debug!(%token, "mock classic discovery started");
        Ok(())
    }

    fn cancel_classic_discovery(&self) -> PlatformResult<()> {
        let mut state = self.state();
        state.calls.push(MockCall::CancelClassic);
        state.discovering = false;
        if let Some(task) = state.classic_task.take() {
            task.abort();
        }
        Ok(())
    }

    fn start_ble_scan(
        &self,
        token: ScanToken,
        _filter: Option<&BleScanFilter>,
        _settings: &BleScanSettings,
    ) -> PlatformResult<()> {
        {
            let mut state = self.state();
            state.calls.push(MockCall::StartBle(token));
            if state.fail_ble_start {
                return Err(PlatformError::BleScanFailed {
                    message: "mock adapter refused BLE scan".into(),
                });
            }
            state.last_ble = Some(token);
        }
        let task = self.play_ble(token);
        self.state().ble_task = task;
        Ok(())
    }

    fn stop_ble_scan(&self) -> PlatformResult<()> {
        let mut state = self.state();
        state.calls.push(MockCall::StopBle);
        if let Some(task) = state.ble_task.take() {
            task.abort();
        }
        Ok(())
    }
}

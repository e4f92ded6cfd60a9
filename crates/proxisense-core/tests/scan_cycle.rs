//! End-to-end scan cycles against the mock platform on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use proxisense_core::{
    EventBus, Lifecycle, MemoryStorage, MockCall, MockPlatform, PlatformEvent, RawDevice,
    RecordingSink, ScanCycleId, ScanOrchestrator, ScanPhase, ScanSource, SensorClock,
    SensorConfig, SensorError, SensorEvent, SensorHandle,
};
use tokio::time::sleep;

const BLE_ADDRESS: &str = "AA:BB:00:00:00:01";

struct Harness {
    handle: SensorHandle,
    platform: Arc<MockPlatform>,
    storage: Arc<MemoryStorage>,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn with_platform(platform: MockPlatform) -> Self {
        let platform = Arc::new(platform);
        let storage = Arc::new(MemoryStorage::new());
        let sink = Arc::new(RecordingSink::new());
        let (handle, _task) = ScanOrchestrator::spawn_with_clock(
            platform.clone(),
            storage.clone(),
            EventBus::new().with(sink.clone()),
            SensorClock::anchored_at(epoch()),
        );
        Self {
            handle,
            platform,
            storage,
            sink,
        }
    }

    fn new() -> Self {
        Self::with_platform(MockPlatform::new())
    }

    async fn started() -> Self {
        let harness = Self::new();
        harness.handle.start(config(1.0)).await.unwrap();
        harness
    }

    /// Let the orchestrator drain everything queued so far.
    async fn settle(&self) -> proxisense_core::SensorStatus {
        self.handle.status().await.unwrap()
    }

    fn classic_starts(&self) -> usize {
        self.platform
            .calls()
            .iter()
            .filter(|c| matches!(c, MockCall::StartClassic(_)))
            .count()
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn at(ms: i64) -> DateTime<Utc> {
    epoch() + chrono::Duration::milliseconds(ms)
}

fn config(frequency_minutes: f64) -> SensorConfig {
    SensorConfig {
        enabled: true,
        frequency_minutes,
        ble_scan_window_ms: 3000,
        label: "desk".into(),
        device_id: "owner-1".into(),
    }
}

fn ble_detections(events: &[SensorEvent]) -> Vec<&SensorEvent> {
    events
        .iter()
        .filter(|e| matches!(e, SensorEvent::BleDetected(_)))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_full_cycle_timeline() {
    let h = Harness::started().await;

    // First tick one interval after start.
    sleep(Duration::from_millis(59_999)).await;
    assert_eq!(h.settle().await.phase, ScanPhase::Idle);
    sleep(Duration::from_millis(2)).await;
    let status = h.settle().await;
    assert_eq!(status.phase, ScanPhase::ClassicScanning);
    let cycle = ScanCycleId::from_start(at(60_000));
    assert_eq!(status.cycle, Some(cycle));

    h.platform.discovery_started();
    h.platform
        .classic_device_found("3c:5a:b4:01:02:03", Some("Pixel 8"), Some(-71));

    // Classic discovery ends 2s into the cycle.
    sleep(Duration::from_millis(1999)).await;
    h.platform.discovery_finished();
    assert_eq!(h.settle().await.phase, ScanPhase::BleScanning);

    sleep(Duration::from_millis(100)).await;
    h.platform.ble_result(BLE_ADDRESS, Some(-80));
    sleep(Duration::from_millis(300)).await;
    h.platform.ble_result(BLE_ADDRESS, Some(-78));
    assert_eq!(h.settle().await.ble_seen, 1);

    // Deadline lands 3s after BLE entry.
    sleep(Duration::from_millis(2599)).await;
    assert_eq!(h.settle().await.phase, ScanPhase::BleScanning);
    sleep(Duration::from_millis(2)).await;
    let status = h.settle().await;
    assert_eq!(status.phase, ScanPhase::Idle);
    assert_eq!(status.ble_seen, 0);

    let events = h.sink.take();
    assert_eq!(events.len(), 6, "{events:?}");
    assert_eq!(events[0], SensorEvent::ScanStarted(cycle));
    assert!(matches!(&events[1], SensorEvent::Detected(o) if o.address == "3C:5A:B4:01:02:03"));
    assert_eq!(events[2], SensorEvent::ScanEnded(cycle));
    assert_eq!(events[3], SensorEvent::BleScanStarted(cycle));
    assert!(matches!(&events[4], SensorEvent::BleDetected(o) if o.address == BLE_ADDRESS));
    assert_eq!(events[5], SensorEvent::BleScanEnded(cycle));

    h.handle.flush().await.unwrap();
    let stored = h.storage.observations();
    assert_eq!(stored.len(), 2);
    let ble: Vec<_> = stored.iter().filter(|o| o.source == ScanSource::Ble).collect();
    assert_eq!(ble.len(), 1);
    assert_eq!(ble[0].rssi, -80);
    assert_eq!(ble[0].scan_cycle_id, cycle);
    assert_eq!(ble[0].timestamp, at(62_100));
    assert_eq!(stored[0].name.as_deref(), Some("Pixel 8"));
    assert_eq!(stored[0].label, "desk");
    assert_eq!(stored[0].device_id, "owner-1");

    assert!(h.platform.calls().contains(&MockCall::StopBle));

    // Next cycle one interval after the first.
    sleep(Duration::from_millis(55_000)).await;
    let status = h.settle().await;
    assert_eq!(status.phase, ScanPhase::ClassicScanning);
    assert_eq!(status.cycle, Some(ScanCycleId::from_start(at(120_000))));
}

#[tokio::test(start_paused = true)]
async fn test_next_cycle_reports_previously_seen_address() {
    let h = Harness::started().await;

    sleep(Duration::from_millis(1)).await;
    for _ in 0..2 {
        sleep(Duration::from_secs(60)).await;
        h.settle().await;
        h.platform.discovery_finished();
        assert_eq!(h.settle().await.phase, ScanPhase::BleScanning);
        assert!(h.platform.ble_result(BLE_ADDRESS, None));
        assert!(h.platform.ble_result(BLE_ADDRESS, None));
        assert_eq!(h.settle().await.ble_seen, 1);
    }

    let events = h.sink.events();
    let detections = ble_detections(&events);
    assert_eq!(detections.len(), 2);
    let SensorEvent::BleDetected(first) = detections[0] else {
        unreachable!()
    };
    let SensorEvent::BleDetected(second) = detections[1] else {
        unreachable!()
    };
    assert_ne!(first.scan_cycle_id, second.scan_cycle_id);
    assert_eq!(second.rssi, proxisense_core::RSSI_UNKNOWN);
}

#[tokio::test(start_paused = true)]
async fn test_request_scan_restarts_classic_discovery() {
    let h = Harness::started().await;
    sleep(Duration::from_millis(60_001)).await;
    h.settle().await;
    let first = h.platform.last_classic_token().unwrap();
    h.platform.discovery_started();

    h.handle.request_scan().unwrap();
    let status = h.settle().await;
    let second = h.platform.last_classic_token().unwrap();
    assert_ne!(first, second);
    assert_eq!(status.phase, ScanPhase::ClassicScanning);
    assert_eq!(
        h.platform.calls(),
        vec![
            MockCall::StartClassic(first),
            MockCall::CancelClassic,
            MockCall::StartClassic(second),
        ]
    );

    // The cancelled attempt finishing late changes nothing.
    h.platform
        .emit(PlatformEvent::DiscoveryFinished { token: first });
    h.platform.emit(PlatformEvent::ClassicDeviceFound {
        token: first,
        device: Some(RawDevice::new("3C:5A:B4:01:02:03", None)),
        rssi: None,
    });
    assert_eq!(h.settle().await.phase, ScanPhase::ClassicScanning);
    assert!(!h
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, SensorEvent::ScanEnded(_) | SensorEvent::Detected(_))));

    h.platform.discovery_finished();
    assert_eq!(h.settle().await.phase, ScanPhase::BleScanning);
    let started = h
        .sink
        .events()
        .iter()
        .filter(|e| matches!(e, SensorEvent::ScanStarted(_)))
        .count();
    assert_eq!(started, 1);
}

#[tokio::test(start_paused = true)]
async fn test_request_scan_during_ble_is_ignored() {
    let h = Harness::started().await;
    sleep(Duration::from_millis(60_001)).await;
    h.settle().await;
    h.platform.discovery_finished();
    h.settle().await;
    h.platform.take_calls();

    h.handle.request_scan().unwrap();
    assert_eq!(h.settle().await.phase, ScanPhase::BleScanning);
    assert!(h.platform.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_foreign_discovery_cancelled_before_start() {
    let h = Harness::started().await;
    h.platform.set_discovering(true);

    sleep(Duration::from_millis(60_001)).await;
    h.settle().await;

    let calls = h.platform.calls();
    assert_eq!(calls[0], MockCall::CancelClassic);
    assert!(matches!(calls[1], MockCall::StartClassic(_)));
}

#[tokio::test(start_paused = true)]
async fn test_adapter_toggle_while_idle() {
    let h = Harness::started().await;
    h.sink.take();

    h.platform.toggle_adapter(false);
    let status = h.settle().await;
    assert!(status.bluetooth_missing);
    assert_eq!(h.sink.take(), vec![SensorEvent::BluetoothDisabled]);

    h.platform.toggle_adapter(true);
    let status = h.settle().await;
    assert!(!status.bluetooth_missing);
    assert_eq!(status.phase, ScanPhase::Idle);
    assert_eq!(h.sink.take(), vec![SensorEvent::BluetoothRestored]);
    assert!(h.platform.calls().is_empty());

    // The next tick scans normally.
    sleep(Duration::from_millis(60_001)).await;
    assert_eq!(h.settle().await.phase, ScanPhase::ClassicScanning);
}

#[tokio::test(start_paused = true)]
async fn test_tick_with_adapter_off_notifies_and_stays_idle() {
    let h = Harness::started().await;
    h.platform.set_enabled(false);

    sleep(Duration::from_millis(60_001)).await;
    let status = h.settle().await;

    assert_eq!(status.phase, ScanPhase::Idle);
    assert!(status.bluetooth_missing);
    assert_eq!(h.sink.events(), vec![SensorEvent::BluetoothDisabled]);
    assert_eq!(h.classic_starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reenable_after_refused_tick_restores() {
    let h = Harness::started().await;
    h.platform.set_enabled(false);
    sleep(Duration::from_millis(60_001)).await;
    h.settle().await;
    h.sink.take();

    h.platform.toggle_adapter(true);
    let status = h.settle().await;

    assert!(!status.bluetooth_missing);
    assert_eq!(h.sink.take(), vec![SensorEvent::BluetoothRestored]);
}

#[tokio::test(start_paused = true)]
async fn test_each_refused_request_notifies() {
    let h = Harness::started().await;
    h.platform.toggle_adapter(false);
    h.settle().await;
    h.sink.take();

    sleep(Duration::from_millis(60_001)).await;
    h.settle().await;
    h.handle.request_scan().unwrap();
    let status = h.settle().await;

    assert!(status.bluetooth_missing);
    assert_eq!(
        h.sink.take(),
        vec![SensorEvent::BluetoothDisabled, SensorEvent::BluetoothDisabled]
    );
}

#[tokio::test(start_paused = true)]
async fn test_adapter_disabled_during_ble_ends_scan() {
    let h = Harness::started().await;
    sleep(Duration::from_millis(60_001)).await;
    h.settle().await;
    h.platform.discovery_finished();
    h.settle().await;
    h.sink.take();

    h.platform.toggle_adapter(false);
    let status = h.settle().await;
    assert_eq!(status.phase, ScanPhase::Idle);
    let events = h.sink.take();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], SensorEvent::BluetoothDisabled);
    assert!(matches!(events[1], SensorEvent::BleScanEnded(_)));

    // The cancelled deadline never fires.
    sleep(Duration::from_secs(5)).await;
    h.settle().await;
    assert!(h.sink.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_frequency_change_rearms_from_now() {
    let h = Harness::started().await;

    sleep(Duration::from_secs(30)).await;
    h.handle.start(config(2.0)).await.unwrap();
    assert_eq!(h.settle().await.interval, Some(Duration::from_secs(120)));

    // The old schedule would have fired at 60s.
    sleep(Duration::from_millis(30_001)).await;
    h.settle().await;
    assert_eq!(h.classic_starts(), 0);

    sleep(Duration::from_secs(90)).await;
    h.settle().await;
    assert_eq!(h.classic_starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_identical_start_keeps_schedule() {
    let h = Harness::started().await;

    sleep(Duration::from_secs(30)).await;
    h.handle.start(config(1.0)).await.unwrap();

    sleep(Duration::from_millis(30_001)).await;
    h.settle().await;
    assert_eq!(h.classic_starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_label_change_keeps_schedule() {
    let h = Harness::started().await;

    sleep(Duration::from_secs(30)).await;
    let relabelled = SensorConfig {
        label: "kitchen".into(),
        ..config(1.0)
    };
    h.handle.start(relabelled).await.unwrap();

    sleep(Duration::from_millis(30_001)).await;
    h.settle().await;
    assert_eq!(h.classic_starts(), 1);

    h.platform
        .classic_device_found("3C:5A:B4:01:02:03", None, Some(-50));
    h.handle.flush().await.unwrap();
    assert_eq!(h.storage.observations()[0].label, "kitchen");
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_leaves_schedule() {
    let h = Harness::started().await;

    sleep(Duration::from_secs(30)).await;
    let err = h.handle.start(config(0.0)).await.unwrap_err();
    assert!(matches!(err, SensorError::ConfigValidationError(_)));

    let status = h.settle().await;
    assert_eq!(status.interval, Some(Duration::from_secs(60)));
    assert_eq!(status.config.unwrap().frequency_minutes, 1.0);

    sleep(Duration::from_millis(30_001)).await;
    h.settle().await;
    assert_eq!(h.classic_starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_absent_adapter_terminates() {
    let h = Harness::with_platform(MockPlatform::without_adapter());

    let err = h.handle.start(config(1.0)).await.unwrap_err();
    assert!(matches!(err, SensorError::BluetoothAdapterNotFound));

    let status = h.settle().await;
    assert_eq!(status.lifecycle, Lifecycle::Terminated);
    assert_eq!(status.interval, None);

    sleep(Duration::from_secs(600)).await;
    h.settle().await;
    assert!(h.platform.calls().is_empty());

    let err = h.handle.start(config(1.0)).await.unwrap_err();
    assert!(matches!(err, SensorError::SensorTerminated));
}

#[tokio::test(start_paused = true)]
async fn test_stop_silences_everything() {
    let h = Harness::started().await;
    sleep(Duration::from_millis(60_001)).await;
    h.settle().await;
    h.platform.discovery_started();
    h.settle().await;
    h.sink.take();

    h.handle.stop().await.unwrap();
    let status = h.settle().await;
    assert_eq!(status.lifecycle, Lifecycle::Stopped);
    assert_eq!(status.phase, ScanPhase::Idle);
    let events = h.sink.take();
    assert!(matches!(events.as_slice(), [SensorEvent::ScanEnded(_)]));
    assert!(h.platform.calls().contains(&MockCall::CancelClassic));

    // Late platform reports and timers are ignored.
    h.platform.discovery_finished();
    h.platform.toggle_adapter(false);
    sleep(Duration::from_secs(300)).await;
    h.settle().await;
    assert!(h.sink.events().is_empty());
    assert_eq!(h.classic_starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_then_start_resumes() {
    let h = Harness::started().await;
    h.handle.stop().await.unwrap();

    sleep(Duration::from_secs(90)).await;
    h.handle.start(config(1.0)).await.unwrap();
    sleep(Duration::from_millis(60_001)).await;

    assert_eq!(h.settle().await.phase, ScanPhase::ClassicScanning);
    assert_eq!(h.classic_starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_config_does_not_schedule() {
    let h = Harness::new();
    let disabled = SensorConfig {
        enabled: false,
        ..config(1.0)
    };
    h.handle.start(disabled).await.unwrap();

    sleep(Duration::from_secs(300)).await;
    let status = h.settle().await;
    assert_eq!(status.lifecycle, Lifecycle::Stopped);
    assert_eq!(h.classic_starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_reports_are_dropped() {
    let h = Harness::started().await;
    sleep(Duration::from_millis(60_001)).await;
    h.settle().await;
    let token = h.platform.last_classic_token().unwrap();

    h.platform.emit(PlatformEvent::ClassicDeviceFound {
        token,
        device: None,
        rssi: Some(-40),
    });
    h.platform.classic_device_found("not-a-mac", Some("Ghost"), None);
    h.platform.classic_device_found("3C:5A:B4:01:02:03", Some("  "), None);
    h.settle().await;

    let detections: Vec<_> = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SensorEvent::Detected(o) => Some(o),
            _ => None,
        })
        .collect();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].name, None);
    assert_eq!(detections[0].rssi, proxisense_core::RSSI_UNKNOWN);
    assert_eq!(h.settle().await.phase, ScanPhase::ClassicScanning);
}

#[tokio::test(start_paused = true)]
async fn test_no_ble_support_ends_cycle_after_classic() {
    let h = Harness::with_platform(MockPlatform::new().with_ble_support(false));
    h.handle.start(config(1.0)).await.unwrap();
    sleep(Duration::from_millis(60_001)).await;
    h.settle().await;

    h.platform.discovery_finished();
    assert_eq!(h.settle().await.phase, ScanPhase::Idle);
    assert!(!h
        .platform
        .calls()
        .iter()
        .any(|c| matches!(c, MockCall::StartBle(_))));
    let events = h.sink.events();
    assert!(matches!(events.last(), Some(SensorEvent::ScanEnded(_))));
}

#[tokio::test(start_paused = true)]
async fn test_classic_start_failure_falls_back() {
    let h = Harness::started().await;
    h.platform.fail_classic_start(true);

    sleep(Duration::from_millis(60_001)).await;
    let status = h.settle().await;

    assert_eq!(status.phase, ScanPhase::Idle);
    assert!(status.bluetooth_missing);
    assert_eq!(h.sink.take(), vec![SensorEvent::BluetoothDisabled]);

    // Recovers on the next tick once discovery works again.
    h.platform.fail_classic_start(false);
    sleep(Duration::from_secs(60)).await;
    let status = h.settle().await;
    assert_eq!(status.phase, ScanPhase::ClassicScanning);
    assert!(!status.bluetooth_missing);
    assert_eq!(h.sink.take(), vec![SensorEvent::BluetoothRestored]);
}

#[tokio::test(start_paused = true)]
async fn test_restart_failure_ends_announced_cycle() {
    let h = Harness::started().await;
    sleep(Duration::from_millis(60_001)).await;
    h.settle().await;
    h.platform.discovery_started();
    h.platform.fail_classic_start(true);

    h.handle.request_scan().unwrap();
    let status = h.settle().await;

    assert_eq!(status.phase, ScanPhase::Idle);
    let events = h.sink.events();
    assert!(matches!(events[0], SensorEvent::ScanStarted(_)));
    assert!(matches!(events[1], SensorEvent::ScanEnded(_)));
    assert_eq!(events[2], SensorEvent::BluetoothDisabled);
}

#[tokio::test(start_paused = true)]
async fn test_ble_start_failure_returns_to_idle() {
    let h = Harness::started().await;
    h.platform.fail_ble_start(true);
    sleep(Duration::from_millis(60_001)).await;
    h.settle().await;

    h.platform.discovery_finished();
    assert_eq!(h.settle().await.phase, ScanPhase::Idle);
    assert!(!h
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, SensorEvent::BleScanStarted(_))));
}

#[tokio::test(start_paused = true)]
async fn test_start_and_ticks_record_local_device() {
    let h = Harness::started().await;
    h.handle.flush().await.unwrap();
    let records = h.storage.local_devices();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].address, "00:11:22:33:44:55");
    assert_eq!(records[0].name, "mock0");
    assert_eq!(records[0].timestamp, at(0));
    assert_eq!(records[0].device_id, "owner-1");

    sleep(Duration::from_millis(120_001)).await;
    h.handle.flush().await.unwrap();

    let records = h.storage.local_devices();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].timestamp, at(60_000));
    assert_eq!(records[2].timestamp, at(120_000));
}

//! Records produced by the sensor.
//!
//! [`Observation`] is one detected device at one instant; [`LocalDeviceInfo`]
//! describes the scanning adapter itself. Both are handed to storage and
//! observers as soon as they are built and are never mutated afterwards.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// RSSI value recorded when the platform reported no reading.
pub const RSSI_UNKNOWN: i16 = -1;

/// Correlates every observation of one scan cycle.
///
/// Derived from the cycle's start time in milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ScanCycleId(i64);

impl ScanCycleId {
    /// Cycle id for a cycle starting at `started_at`.
    #[must_use]
    pub fn from_start(started_at: DateTime<Utc>) -> Self {
        Self(started_at.timestamp_millis())
    }

    /// Start time in milliseconds since the Unix epoch.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ScanCycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which discovery mechanism produced an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanSource {
    /// Classic Bluetooth inquiry.
    Classic,
    /// Bluetooth Low Energy advertisement.
    Ble,
}

impl fmt::Display for ScanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classic => f.write_str("CLASSIC"),
            Self::Ble => f.write_str("BLE"),
        }
    }
}

/// One detected device at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Capture time.
    pub timestamp: DateTime<Utc>,

    /// Owner of the scanning device.
    pub device_id: String,

    /// Label in effect when the observation was captured.
    pub label: String,

    /// Hardware address, upper-cased.
    pub address: String,

    /// Advertised name, when the device broadcast one.
    pub name: Option<String>,

    /// Signal strength in dBm, or [`RSSI_UNKNOWN`].
    pub rssi: i16,

    /// Cycle this observation belongs to.
    pub scan_cycle_id: ScanCycleId,

    /// Discovery mechanism.
    pub source: ScanSource,
}

impl Observation {
    /// Whether the platform supplied a signal strength.
    #[must_use]
    pub const fn has_rssi(&self) -> bool {
        self.rssi != RSSI_UNKNOWN
    }

    /// Render as a single JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// The scanning device's own adapter, captured once per scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDeviceInfo {
    /// Capture time.
    pub timestamp: DateTime<Utc>,

    /// Owner of the scanning device.
    pub device_id: String,

    /// Label in effect at capture.
    pub label: String,

    /// Adapter hardware address.
    pub address: String,

    /// Adapter name.
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Observation {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Observation {
            timestamp: at,
            device_id: "owner-1".into(),
            label: "desk".into(),
            address: "AA:BB:CC:DD:EE:FF".into(),
            name: None,
            rssi: RSSI_UNKNOWN,
            scan_cycle_id: ScanCycleId::from_start(at),
            source: ScanSource::Classic,
        }
    }

    #[test]
    fn test_cycle_id_is_start_millis() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let id = ScanCycleId::from_start(at);
        assert_eq!(id.as_millis(), at.timestamp_millis());
        assert_eq!(id.to_string(), at.timestamp_millis().to_string());
    }

    #[test]
    fn test_unknown_rssi() {
        let mut obs = sample();
        assert!(!obs.has_rssi());
        obs.rssi = -67;
        assert!(obs.has_rssi());
    }

    #[test]
    fn test_json_shape() {
        let json = sample().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["source"], "CLASSIC");
        assert_eq!(value["rssi"], -1);
        assert!(value["name"].is_null());
        assert_eq!(
            value["scan_cycle_id"].as_i64(),
            Some(sample().scan_cycle_id.as_millis())
        );
    }
}

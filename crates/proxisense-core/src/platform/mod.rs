//! Boundary to the host Bluetooth stack.
//!
//! The scan engine drives discovery through [`PlatformScanner`] and hears
//! back through a [`PlatformReporter`]. Platform calls return immediately;
//! results arrive later as [`PlatformEvent`]s on the orchestrator's queue.
//!
//! Every discovery request carries a [`ScanToken`]. Backends echo it in the
//! events they report, which lets the engine drop signals that belong to a
//! cancelled or superseded scan.

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::is_valid_mac_address;
use crate::orchestrator::Command;

#[cfg(feature = "bluetooth")]
pub mod bluez;
pub mod mock;

/// Errors reported by a platform backend.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The host has no Bluetooth adapter.
    #[error("no Bluetooth adapter present")]
    AdapterNotFound,

    /// The adapter is powered off.
    #[error("Bluetooth adapter is powered off")]
    AdapterDisabled,

    /// Classic discovery could not be started or cancelled.
    #[error("classic discovery failed: {message}")]
    DiscoveryFailed {
        /// Backend detail.
        message: String,
    },

    /// A BLE scan could not be started or stopped.
    #[error("BLE scan failed: {message}")]
    BleScanFailed {
        /// Backend detail.
        message: String,
    },

    /// Any other backend failure.
    #[error("Bluetooth backend error: {message}")]
    Backend {
        /// Backend detail.
        message: String,
    },
}

/// Result alias for platform calls.
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Correlates a discovery request with the events it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScanToken(u64);

impl ScanToken {
    /// Wrap a raw token value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw token value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScanToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The scanning adapter's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Adapter hardware address.
    pub address: String,
    /// Adapter name.
    pub name: String,
}

/// A device record as reported by the platform, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    /// Hardware address as reported.
    pub address: String,
    /// Advertised name, if any.
    pub name: Option<String>,
}

impl RawDevice {
    /// Build a record.
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }

    /// Upper-cased address, or `None` when it is not a MAC address.
    #[must_use]
    pub fn normalized_address(&self) -> Option<String> {
        let address = self.address.trim().to_ascii_uppercase();
        is_valid_mac_address(&address).then_some(address)
    }

    /// Name with blank values treated as absent.
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
    }
}

/// Radio duty cycle requested for a BLE scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Lowest power, longest latency.
    #[default]
    LowPower,
    /// Balanced power and latency.
    Balanced,
    /// Highest duty cycle.
    LowLatency,
}

/// Settings passed with every BLE scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BleScanSettings {
    /// Requested duty cycle.
    pub mode: ScanMode,
}

impl BleScanSettings {
    /// Low-power scanning, as used for every sensor cycle.
    #[must_use]
    pub const fn low_power() -> Self {
        Self {
            mode: ScanMode::LowPower,
        }
    }
}

/// Optional restriction on which advertisers a BLE scan reports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BleScanFilter {
    /// Only report these addresses. Empty means all.
    pub addresses: Vec<String>,
}

/// Something the platform observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// Classic discovery actually began.
    DiscoveryStarted {
        /// Discovery request this belongs to.
        token: ScanToken,
    },
    /// Classic discovery found a device.
    ClassicDeviceFound {
        /// Discovery request this belongs to.
        token: ScanToken,
        /// Device record; `None` when the platform delivered an empty report.
        device: Option<RawDevice>,
        /// Signal strength in dBm, if reported.
        rssi: Option<i16>,
    },
    /// Classic discovery ended on its own.
    DiscoveryFinished {
        /// Discovery request this belongs to.
        token: ScanToken,
    },
    /// A BLE advertisement was received.
    BleResult {
        /// BLE scan this belongs to.
        token: ScanToken,
        /// Device record; `None` when the platform delivered an empty report.
        device: Option<RawDevice>,
        /// Signal strength in dBm, if reported.
        rssi: Option<i16>,
    },
    /// The adapter was powered on or off.
    AdapterStateChanged {
        /// New power state.
        enabled: bool,
    },
}

/// Channel from a platform backend into the sensor's event queue.
///
/// Cheap to clone and never blocks, so it is safe to call from any
/// platform callback context.
#[derive(Debug, Clone)]
pub struct PlatformReporter {
    mailbox: mpsc::UnboundedSender<Command>,
}

impl PlatformReporter {
    pub(crate) const fn new(mailbox: mpsc::UnboundedSender<Command>) -> Self {
        Self { mailbox }
    }

    /// Queue an event. Returns `false` once the sensor has shut down.
    pub fn report(&self, event: PlatformEvent) -> bool {
        self.mailbox.send(Command::Platform(event)).is_ok()
    }
}

/// Host Bluetooth stack as seen by the scan engine.
///
/// Calls come from the orchestrator task and must not block. Long-running
/// work (the discovery itself) happens elsewhere and reports back through
/// the reporter handed to [`attach`](Self::attach).
pub trait PlatformScanner: Send + Sync {
    /// Receive the reporter for all later events.
    fn attach(&self, reporter: PlatformReporter);

    /// The adapter's identity, or `None` when the host has no adapter.
    fn adapter(&self) -> Option<AdapterInfo>;

    /// Whether the adapter is powered on.
    fn is_enabled(&self) -> bool;

    /// Whether classic discovery is running (ours or anyone else's).
    fn is_discovering(&self) -> bool;

    /// Whether the adapter can scan for BLE advertisements.
    fn supports_ble(&self) -> bool;

    /// Begin classic discovery tagged with `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery could not be started.
    fn start_classic_discovery(&self, token: ScanToken) -> PlatformResult<()>;

    /// Cancel any running classic discovery.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejected the cancel.
    fn cancel_classic_discovery(&self) -> PlatformResult<()>;

    /// Begin a BLE scan tagged with `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan could not be started.
    fn start_ble_scan(
        &self,
        token: ScanToken,
        filter: Option<&BleScanFilter>,
        settings: &BleScanSettings,
    ) -> PlatformResult<()>;

    /// Stop the running BLE scan.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejected the stop.
    fn stop_ble_scan(&self) -> PlatformResult<()>;
}

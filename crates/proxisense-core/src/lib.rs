//! # proxisense-core
//!
//! Bluetooth proximity sensing engine.
//!
//! This crate provides:
//! - Periodic scan cycles: one classic discovery followed by a time-bounded BLE scan
//! - Per-cycle de-duplication of BLE advertisements
//! - Observation records fanned out to storage and registered observers
//! - Configuration management and persistent JSON-lines storage
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`orchestrator`] - The scan coordinator actor and its [`SensorHandle`]
//! - [`machine`] - Scan cycle state machine
//! - [`scheduler`] - Re-armable periodic trigger
//! - [`dedup`] - BLE address de-duplication for one cycle
//! - [`platform`] - Boundary to the host Bluetooth stack, plus a scriptable mock
//! - [`events`] - Observer set for sensor events
//! - [`storage`] - Observation persistence
//! - [`config`] - Configuration loading, saving, and validation
//! - [`clock`] - Wall clock tied to the runtime's timer
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Observation records

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod machine;
pub mod orchestrator;
pub mod platform;
pub mod scheduler;
pub mod storage;
pub mod types;

// Re-export primary types for convenience
pub use clock::SensorClock;
pub use config::{
    is_valid_mac_address, Config, ConfigError, ConfigResult, LogRotation, LoggingConfig,
    SensorConfig, StorageConfig,
};
pub use error::{Error, Result, SensorError};
pub use events::{EventBus, EventSink, RecordingSink, SensorEvent};
pub use machine::{ScanPhase, ScanStateMachine};
pub use orchestrator::{Lifecycle, ScanOrchestrator, SensorHandle, SensorStatus};
#[cfg(feature = "bluetooth")]
pub use platform::bluez::BluezPlatform;
pub use platform::mock::{MockCall, MockDevice, MockPlatform, MockScript};
pub use platform::{
    PlatformError, PlatformEvent, PlatformReporter, PlatformResult, PlatformScanner, RawDevice,
    ScanToken,
};
pub use storage::{default_data_dir, JsonFileStorage, MemoryStorage, Storage};
pub use types::{LocalDeviceInfo, Observation, ScanCycleId, ScanSource, RSSI_UNKNOWN};

//! Scan cycle state machine.
//!
//! ```text
//!            requestScan                discoveryFinished
//!   Idle ─────────────────▶ ClassicScanning ─────────────────▶ ClassicFinished
//!    ▲                         │  ▲ requestScan                   │
//!    │                         │  └── (cancel + restart)          │ autoAdvance
//!    │      no BLE support     │                                  ▼
//!    ├─────────────────────────┼──────────────────────────── BleScanning
//!    │                         │                                  │
//!    └─────────────────────────┴──── deadline / explicit stop ◀───┘
//! ```
//!
//! The machine is pure bookkeeping: it performs no I/O and owns no timers.
//! The orchestrator feeds it inputs, carries out the platform calls it asks
//! for, and publishes the events it reports.
//!
//! Every classic attempt and every BLE scan gets a fresh [`ScanToken`].
//! Inputs carrying any other token are stale and ignored, which is what keeps
//! a cancelled discovery's late "finished" signal or an expired BLE deadline
//! from touching a newer scan.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::dedup::DedupCache;
use crate::platform::ScanToken;
use crate::types::ScanCycleId;

/// Where the current scan cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanPhase {
    /// No cycle in progress.
    #[default]
    Idle,
    /// Classic discovery is running.
    ClassicScanning,
    /// Classic discovery just ended; about to advance.
    ClassicFinished,
    /// BLE scan is running until its deadline.
    BleScanning,
}

/// The cycle in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCycle {
    /// Cycle id, derived from its start time.
    pub id: ScanCycleId,
    /// Classic discovery running.
    pub classic_active: bool,
    /// BLE scan running.
    pub ble_active: bool,
    /// When the BLE scan is force-stopped.
    pub ble_deadline: Option<DateTime<Utc>>,
}

/// Adapter state sampled when a scan is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterStatus {
    /// Adapter powered on.
    pub enabled: bool,
    /// Some classic discovery is already running.
    pub discovering: bool,
}

/// What to do about a scan request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRequest {
    /// Start a new cycle with classic discovery.
    Start {
        /// Token for the discovery.
        token: ScanToken,
        /// New cycle id.
        cycle: ScanCycleId,
        /// Someone else's discovery is running and must be cancelled first.
        cancel_first: bool,
    },
    /// Cancel the running discovery and start it again within the same cycle.
    Restart {
        /// Token for the new discovery.
        token: ScanToken,
        /// Unchanged cycle id.
        cycle: ScanCycleId,
    },
    /// Adapter is off; nothing changed.
    Disabled,
    /// A BLE phase is in progress; the request is dropped.
    Busy {
        /// Cycle in progress.
        cycle: ScanCycleId,
    },
}

/// Where a cycle goes once classic discovery finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextPhase {
    /// Start a BLE scan.
    Ble {
        /// Token for the BLE scan.
        token: ScanToken,
        /// Wall time of the forced stop.
        deadline: DateTime<Utc>,
    },
    /// No BLE support; the cycle is over.
    Idle,
}

/// Result of a valid discovery-finished signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassicOutcome {
    /// The cycle whose classic phase ended.
    pub cycle: ScanCycleId,
    /// Discovery-started was never seen, so its event is still owed.
    pub announce_start: bool,
    /// What comes next.
    pub next: NextPhase,
}

/// A cycle torn down before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortedCycle {
    /// Cycle id.
    pub cycle: ScanCycleId,
    /// Phase it was in.
    pub phase: ScanPhase,
    /// Whether its start had been announced.
    pub announced: bool,
}

/// Classic/BLE scan state plus the BLE dedup set.
#[derive(Debug, Default)]
pub struct ScanStateMachine {
    phase: ScanPhase,
    cycle: Option<ScanCycle>,
    ble_supported: bool,
    dedup: DedupCache,
    classic_token: Option<ScanToken>,
    ble_token: Option<ScanToken>,
    announced: bool,
    next_token: u64,
}

impl ScanStateMachine {
    /// Create an idle machine.
    #[must_use]
    pub fn new(ble_supported: bool) -> Self {
        Self {
            ble_supported,
            ..Self::default()
        }
    }

    /// Update BLE capability for later cycles.
    pub fn set_ble_supported(&mut self, supported: bool) {
        self.ble_supported = supported;
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> ScanPhase {
        self.phase
    }

    /// Cycle in progress, if any.
    #[must_use]
    pub const fn cycle(&self) -> Option<ScanCycle> {
        self.cycle
    }

    /// Distinct BLE addresses seen in the running BLE scan.
    #[must_use]
    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    /// Token of the running BLE scan.
    #[must_use]
    pub const fn ble_token(&self) -> Option<ScanToken> {
        self.ble_token
    }

    /// Handle a scan request from the scheduler or an external caller.
    pub fn request_scan(&mut self, adapter: AdapterStatus, now: DateTime<Utc>) -> ScanRequest {
        if !adapter.enabled {
            return ScanRequest::Disabled;
        }

        match self.phase {
            ScanPhase::Idle => {
                let token = self.issue_token();
                let id = ScanCycleId::from_start(now);
                self.cycle = Some(ScanCycle {
                    id,
                    classic_active: true,
                    ble_active: false,
                    ble_deadline: None,
                });
                self.phase = ScanPhase::ClassicScanning;
                self.classic_token = Some(token);
                self.announced = false;
                ScanRequest::Start {
                    token,
                    cycle: id,
                    cancel_first: adapter.discovering,
                }
            }
            ScanPhase::ClassicScanning => {
                let token = self.issue_token();
                self.classic_token = Some(token);
                ScanRequest::Restart {
                    token,
                    cycle: self.cycle_id(),
                }
            }
            ScanPhase::ClassicFinished | ScanPhase::BleScanning => ScanRequest::Busy {
                cycle: self.cycle_id(),
            },
        }
    }

    /// The platform refused to start discovery for `token`.
    ///
    /// Falls back to `Idle` so the machine is never stuck scanning.
    pub fn classic_start_failed(&mut self, token: ScanToken) -> Option<AbortedCycle> {
        if self.phase != ScanPhase::ClassicScanning || self.classic_token != Some(token) {
            return None;
        }
        self.abort()
    }

    /// Discovery for `token` actually began.
    ///
    /// Returns the cycle the first time per cycle, `None` afterwards or when
    /// `token` is stale.
    pub fn discovery_started(&mut self, token: ScanToken) -> Option<ScanCycleId> {
        if self.phase != ScanPhase::ClassicScanning || self.classic_token != Some(token) {
            debug!(%token, "ignoring discovery-started for stale attempt");
            return None;
        }
        if self.announced {
            return None;
        }
        self.announced = true;
        Some(self.cycle_id())
    }

    /// Cycle a classic device report for `token` belongs to.
    #[must_use]
    pub fn classic_cycle(&self, token: ScanToken) -> Option<ScanCycleId> {
        (self.phase == ScanPhase::ClassicScanning && self.classic_token == Some(token))
            .then(|| self.cycle_id())
    }

    /// Discovery for `token` finished; advance to BLE or back to idle.
    ///
    /// `now + ble_window` becomes the BLE deadline.
    pub fn discovery_finished(
        &mut self,
        token: ScanToken,
        now: DateTime<Utc>,
        ble_window: Duration,
    ) -> Option<ClassicOutcome> {
        if self.phase != ScanPhase::ClassicScanning || self.classic_token != Some(token) {
            debug!(%token, "ignoring discovery-finished for stale attempt");
            return None;
        }

        let cycle = self.cycle_id();
        let announce_start = !self.announced;
        self.phase = ScanPhase::ClassicFinished;
        self.classic_token = None;
        if let Some(c) = self.cycle.as_mut() {
            c.classic_active = false;
        }

        let next = if self.ble_supported {
            let token = self.issue_token();
            let deadline = chrono::Duration::from_std(ble_window)
                .ok()
                .and_then(|w| now.checked_add_signed(w))
                .unwrap_or(now);
            self.dedup.clear();
            self.phase = ScanPhase::BleScanning;
            self.ble_token = Some(token);
            if let Some(c) = self.cycle.as_mut() {
                c.ble_active = true;
                c.ble_deadline = Some(deadline);
            }
            NextPhase::Ble { token, deadline }
        } else {
            self.reset();
            NextPhase::Idle
        };

        Some(ClassicOutcome {
            cycle,
            announce_start,
            next,
        })
    }

    /// The platform refused to start the BLE scan for `token`.
    pub fn ble_start_failed(&mut self, token: ScanToken) -> Option<ScanCycleId> {
        if self.phase != ScanPhase::BleScanning || self.ble_token != Some(token) {
            return None;
        }
        let cycle = self.cycle_id();
        self.dedup.clear();
        self.reset();
        Some(cycle)
    }

    /// Filter a BLE advertisement for `token`.
    ///
    /// Returns the cycle for the first report of `address` in this scan and
    /// `None` for repeats, stale tokens, or reports outside a BLE phase.
    pub fn accept_ble_result(&mut self, token: ScanToken, address: &str) -> Option<ScanCycleId> {
        if self.phase != ScanPhase::BleScanning || self.ble_token != Some(token) {
            return None;
        }
        if self.dedup.seen(address) {
            return None;
        }
        Some(self.cycle_id())
    }

    /// End the BLE scan for `token`, by deadline or explicit stop.
    ///
    /// Succeeds at most once per scan; later calls return `None`.
    pub fn finish_ble(&mut self, token: ScanToken) -> Option<ScanCycleId> {
        if self.phase != ScanPhase::BleScanning || self.ble_token != Some(token) {
            return None;
        }
        let cycle = self.cycle_id();
        self.dedup.clear();
        self.reset();
        Some(cycle)
    }

    /// Tear down whatever cycle is in progress.
    pub fn abort(&mut self) -> Option<AbortedCycle> {
        let cycle = self.cycle?;
        let aborted = AbortedCycle {
            cycle: cycle.id,
            phase: self.phase,
            announced: self.announced,
        };
        self.dedup.clear();
        self.reset();
        Some(aborted)
    }

    fn reset(&mut self) {
        self.phase = ScanPhase::Idle;
        self.cycle = None;
        self.classic_token = None;
        self.ble_token = None;
        self.announced = false;
    }

    fn issue_token(&mut self) -> ScanToken {
        self.next_token += 1;
        ScanToken::new(self.next_token)
    }

    fn cycle_id(&self) -> ScanCycleId {
        // Only called from non-idle phases, which always hold a cycle.
        self.cycle.map(|c| c.id).unwrap_or_default()
    }
}

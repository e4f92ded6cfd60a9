//! Per-cycle suppression of repeated BLE advertisement reports.

use std::collections::HashSet;

/// Addresses already reported during the current BLE scan.
///
/// Cleared when a BLE scan starts and again when it stops, so no entry
/// outlives its cycle. Growth is bounded only by how many devices can
/// advertise within one scan window.
#[derive(Debug, Default)]
pub struct DedupCache {
    seen: HashSet<String>,
}

impl DedupCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `address` and report whether it was already present.
    ///
    /// Returns `true` for a repeat, which the caller drops.
    pub fn seen(&mut self, address: &str) -> bool {
        if self.seen.contains(address) {
            return true;
        }
        self.seen.insert(address.to_owned());
        false
    }

    /// Forget every address.
    pub fn clear(&mut self) {
        self.seen.clear();
    }

    /// Number of distinct addresses in this cycle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing has been seen yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

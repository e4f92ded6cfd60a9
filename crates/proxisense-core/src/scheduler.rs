//! Periodic scan trigger.
//!
//! Ticks land on a fixed grid anchored at the moment of arming: the first at
//! `armed_at + interval`, then every `interval` after that. A late tick does
//! not push later ticks back.
//!
//! Each arming gets a fresh generation number that travels with its ticks.
//! Re-arming aborts the old timer task, and the generation check on the
//! receiving side discards any tick the old task had already queued, so a
//! cancelled schedule can never interleave with its replacement.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Receives `(generation)` for every tick. Returning `false` ends the timer.
pub type TickFn = Arc<dyn Fn(u64) -> bool + Send + Sync>;

/// Re-armable periodic trigger.
pub struct Scheduler {
    on_tick: TickFn,
    generation: u64,
    interval: Option<Duration>,
    task: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a disarmed scheduler delivering ticks to `on_tick`.
    #[must_use]
    pub fn new(on_tick: TickFn) -> Self {
        Self {
            on_tick,
            generation: 0,
            interval: None,
            task: None,
        }
    }

    /// Start firing every `interval`, first at `now + interval`.
    ///
    /// Arming an armed scheduler replaces the previous schedule.
    /// Must be called from within a tokio runtime.
    pub fn arm(&mut self, interval: Duration) {
        // tokio intervals reject a zero period
        let interval = interval.max(MIN_INTERVAL);
        self.cancel();
        self.generation += 1;

        let generation = self.generation;
        let on_tick = Arc::clone(&self.on_tick);
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !on_tick(generation) {
                    break;
                }
            }
        }));
        self.interval = Some(interval);

        debug!(generation, interval_ms = interval.as_millis(), "scheduler armed");
    }

    /// Cancel the pending schedule and start a new one from now.
    pub fn rearm(&mut self, interval: Duration) {
        let previous = self.interval;
        self.arm(interval);
        info!(
            previous_ms = previous.map(|d| d.as_millis()),
            interval_ms = interval.as_millis(),
            "scheduler re-armed"
        );
    }

    /// Stop firing. Ticks already queued become stale.
    pub fn disarm(&mut self) {
        if self.cancel() {
            debug!(generation = self.generation, "scheduler disarmed");
        }
        self.generation += 1;
        self.interval = None;
    }

    /// Whether a tick tagged `generation` belongs to the live schedule.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.task.is_some() && generation == self.generation
    }

    /// Spacing of the live schedule.
    #[must_use]
    pub const fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Whether a schedule is live.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    fn cancel(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("generation", &self.generation)
            .field("interval", &self.interval)
            .field("armed", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

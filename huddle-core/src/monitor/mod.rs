//! Adaptive-interval polling loop that tails the active room's log (§4.4).
//!
//! Grounded in `original_source/huddle_chat/services/file_monitor.py`: the
//! idle-growth/new-data-reset interval schedule and the room-switch reset.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Interval schedule (§4.4): starts near the floor, grows by `STEP` after four
/// consecutive idle polls, caps at `CEILING`; any new bytes or an explicit refresh signal
/// resets to `FLOOR`.
pub const POLL_FLOOR: Duration = Duration::from_millis(200);
pub const POLL_START: Duration = Duration::from_millis(350);
pub const POLL_STEP: Duration = Duration::from_millis(100);
pub const POLL_CEILING: Duration = Duration::from_millis(1500);
pub const IDLE_CYCLES_BEFORE_GROWTH: u32 = 4;

/// Tracks the current poll interval and idle-cycle count for one monitored room.
pub struct PollSchedule {
    current_ms: AtomicU64,
    idle_cycles: AtomicUsize,
}

impl PollSchedule {
    pub fn new() -> Self {
        Self {
            current_ms: AtomicU64::new(POLL_START.as_millis() as u64),
            idle_cycles: AtomicUsize::new(0),
        }
    }

    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.current_ms.load(Ordering::SeqCst))
    }

    /// Call after a poll that found no new bytes: grows the interval once
    /// [`IDLE_CYCLES_BEFORE_GROWTH`] consecutive idle polls have accumulated.
    pub fn record_idle(&self) {
        let cycles = self.idle_cycles.fetch_add(1, Ordering::SeqCst) + 1;
        if cycles >= IDLE_CYCLES_BEFORE_GROWTH as usize {
            let grown = (self.current_ms.load(Ordering::SeqCst) + POLL_STEP.as_millis() as u64)
                .min(POLL_CEILING.as_millis() as u64);
            self.current_ms.store(grown, Ordering::SeqCst);
            self.idle_cycles.store(0, Ordering::SeqCst);
        }
    }

    /// Call after a poll that observed new bytes, or on an explicit refresh signal: resets
    /// to the floor interval and clears the idle counter.
    pub fn record_activity(&self) {
        self.current_ms.store(POLL_FLOOR.as_millis() as u64, Ordering::SeqCst);
        self.idle_cycles.store(0, Ordering::SeqCst);
    }

    /// Call on room switch: resets to the starting interval (not the floor), matching the
    /// original's "fresh room gets a cautious poll rate, not an aggressive one" behavior.
    pub fn reset_for_room_switch(&self) {
        self.current_ms.store(POLL_START.as_millis() as u64, Ordering::SeqCst);
        self.idle_cycles.store(0, Ordering::SeqCst);
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::new()
    }
}

/// One tail-and-reschedule step: returns the new bytes (if any) and advances `schedule`
/// accordingly. The caller supplies `tail` (typically [`crate::storage::Storage::tail_since`])
/// so this module stays storage-agnostic and trivially testable.
pub fn poll_step<E>(
    schedule: &PollSchedule,
    tail: impl FnOnce() -> Result<(Vec<E>, u64), crate::error::HuddleError>,
) -> Result<(Vec<E>, u64), crate::error::HuddleError> {
    let (events, new_offset) = tail()?;
    if events.is_empty() {
        schedule.record_idle();
    } else {
        schedule.record_activity();
    }
    Ok((events, new_offset))
}

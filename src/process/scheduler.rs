// Round-robin scheduling policy for the kproc microkernel
use alloc::collections::BTreeMap;
use core::ops::Bound;

use crate::process::pcb::{Process, ProcessId, ProcessState};

/// Picks the next process to run.
///
/// Ready processes are visited in identifier order, continuing after the
/// one selected last and wrapping around, so every ready process runs once
/// before any runs twice.
#[derive(Debug)]
pub struct Scheduler {
    cursor: Option<ProcessId>,
    time_slice: u64,
    time_slice_remaining: u64,
    total_switches: u64,
    idle_waits: u64,
}

impl Scheduler {
    pub fn new(time_slice: u64) -> Self {
        Self {
            cursor: None,
            time_slice,
            time_slice_remaining: time_slice,
            total_switches: 0,
            idle_waits: 0,
        }
    }

    /// Next ready process after the cursor, or `None` if nothing is ready.
    pub fn select(&mut self, processes: &BTreeMap<ProcessId, Process>) -> Option<ProcessId> {
        let is_ready = |(_, p): &(&ProcessId, &Process)| p.state() == ProcessState::Ready;

        let after = match self.cursor {
            Some(cursor) => processes
                .range((Bound::Excluded(cursor), Bound::Unbounded))
                .find(is_ready),
            None => None,
        };
        let (&next, _) = after.or_else(|| processes.iter().find(is_ready))?;

        self.cursor = Some(next);
        self.time_slice_remaining = self.time_slice;
        self.total_switches += 1;
        Some(next)
    }

    /// Account one timer tick to the running process. Returns true once its
    /// time slice is used up.
    pub fn tick(&mut self) -> bool {
        if self.time_slice_remaining > 0 {
            self.time_slice_remaining -= 1;
        }
        self.should_preempt()
    }

    /// Check if current process should be preempted
    pub fn should_preempt(&self) -> bool {
        self.time_slice_remaining == 0
    }

    pub(crate) fn record_idle(&mut self) {
        self.idle_waits += 1;
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            cursor: self.cursor,
            time_slice_remaining: self.time_slice_remaining,
            total_switches: self.total_switches,
            idle_waits: self.idle_waits,
        }
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cursor: Option<ProcessId>,
    pub time_slice_remaining: u64,
    pub total_switches: u64,
    pub idle_waits: u64,
}

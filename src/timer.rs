// Timer service: monotonic tick snapshots and sleep deadlines
use core::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the system timer.
///
/// The same record doubles as an absolute deadline when a process asks to
/// sleep: it is expired once the timer's tick count reaches `ticks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerInfo {
    pub ticks: u64,
    /// Ticks per second.
    pub frequency: u64,
}

impl TimerInfo {
    /// Number of machine words a snapshot occupies in user memory.
    pub const WORDS: usize = 2;

    pub const fn new(ticks: u64, frequency: u64) -> Self {
        Self { ticks, frequency }
    }

    /// Deadline `ms` milliseconds after this snapshot, rounded up to a whole tick.
    pub fn after_millis(&self, ms: u64) -> TimerInfo {
        let delta = ms.saturating_mul(self.frequency).saturating_add(999) / 1000;
        TimerInfo::new(self.ticks.saturating_add(delta), self.frequency)
    }

    /// Deadline `ticks` ticks after this snapshot.
    pub fn after_ticks(&self, ticks: u64) -> TimerInfo {
        TimerInfo::new(self.ticks.saturating_add(ticks), self.frequency)
    }

    /// Ticks left until this deadline when the timer reads `now`.
    pub fn remaining_ticks(&self, now: &TimerInfo) -> u64 {
        self.ticks.saturating_sub(now.ticks)
    }

    pub fn is_expired_at(&self, now: &TimerInfo) -> bool {
        now.ticks >= self.ticks
    }

    pub fn to_words(&self) -> [u64; Self::WORDS] {
        [self.ticks, self.frequency]
    }

    pub fn from_words(words: [u64; Self::WORDS]) -> Self {
        TimerInfo::new(words[0], words[1])
    }
}

/// Source of monotonic time for sleep timers.
pub trait Timer: Send + Sync {
    /// Current snapshot.
    fn current(&self) -> TimerInfo;

    /// Whether `deadline` has been reached.
    fn is_expired(&self, deadline: &TimerInfo) -> bool {
        deadline.is_expired_at(&self.current())
    }
}

/// Tick counter advanced by the periodic timer interrupt.
///
/// `tick` only touches an atomic, so it is safe to call from interrupt
/// context while the kernel is busy elsewhere.
#[derive(Debug)]
pub struct TickTimer {
    ticks: AtomicU64,
    frequency: u64,
}

impl TickTimer {
    pub const fn new(frequency: u64) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            frequency,
        }
    }

    /// Advance by one tick and return the new count.
    pub fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn advance(&self, ticks: u64) -> u64 {
        self.ticks.fetch_add(ticks, Ordering::Relaxed) + ticks
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }
}

impl Timer for TickTimer {
    fn current(&self) -> TimerInfo {
        TimerInfo::new(self.ticks.load(Ordering::Relaxed), self.frequency)
    }
}

/// Program PIT channel 0 to interrupt `hz` times per second.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init_pit(hz: u64) {
    use x86_64::instructions::port::Port;

    let divisor = (1_193_182 / hz.max(19)) as u16; // PIT input clock is 1.193182 MHz
    unsafe {
        let mut command = Port::<u8>::new(0x43);
        let mut channel0 = Port::<u8>::new(0x40);

        // Channel 0, low/high byte access, mode 2 (rate generator)
        command.write(0x36);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }
    log::info!("PIT programmed for {} Hz", hz);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_arithmetic_rounds_up() {
        let now = TimerInfo::new(50, 100);
        assert_eq!(now.after_millis(10).ticks, 51);
        assert_eq!(now.after_millis(15).ticks, 52);
        assert_eq!(now.after_millis(0).ticks, 50);
        assert_eq!(now.after_ticks(u64::MAX).ticks, u64::MAX);
    }

    #[test]
    fn remaining_and_expiry() {
        let deadline = TimerInfo::new(120, 100);
        assert_eq!(deadline.remaining_ticks(&TimerInfo::new(100, 100)), 20);
        assert_eq!(deadline.remaining_ticks(&TimerInfo::new(130, 100)), 0);
        assert!(!deadline.is_expired_at(&TimerInfo::new(119, 100)));
        assert!(deadline.is_expired_at(&TimerInfo::new(120, 100)));
    }

    #[test]
    fn tick_timer_counts_ticks() {
        let timer = TickTimer::new(100);
        assert_eq!(timer.current(), TimerInfo::new(0, 100));
        timer.tick();
        timer.tick();
        assert_eq!(timer.current().ticks, 2);
        assert!(timer.is_expired(&TimerInfo::new(2, 100)));
        assert!(!timer.is_expired(&TimerInfo::new(3, 100)));
        assert_eq!(timer.advance(8), 10);
    }
}

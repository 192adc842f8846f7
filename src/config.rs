// Kernel configuration for the process control core
use core::fmt;

/// Highest number of processes that may exist at once.
pub const MAX_PROCESSES: usize = 1024;

/// Default timer interrupt frequency (PIT at 100Hz).
pub const TIMER_FREQUENCY: u64 = 100;

/// Time slice for round-robin scheduling (in timer ticks)
pub const TIME_SLICE: u64 = 10;

/// Top of the user stack region. Each process gets its own slot below it.
pub const USER_STACK_TOP: u64 = 0x7FFF_FFFF_F000;

/// Base of the kernel stack region. Each process gets its own slot above it.
pub const KERNEL_STACK_BASE: u64 = 0xFFFF_8000_0010_0000;

/// Tunables for a kernel instance.
///
/// All limits are fixed when the kernel is constructed; nothing here is
/// changed at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub max_processes: usize,
    pub timer_frequency: u64,
    pub time_slice: u64,
    /// Capacity of each process's pending event queue.
    pub event_queue_capacity: usize,
    /// Capacity of the inbox carrying events out of interrupt context.
    pub inbox_capacity: usize,
    pub irq_lines: usize,
    pub user_stack_top: u64,
    pub user_stack_size: u64,
    pub kernel_stack_base: u64,
    pub kernel_stack_size: u64,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            max_processes: MAX_PROCESSES,
            timer_frequency: TIMER_FREQUENCY,
            time_slice: TIME_SLICE,
            event_queue_capacity: 64,
            inbox_capacity: 256,
            irq_lines: 256,
            user_stack_top: USER_STACK_TOP,
            user_stack_size: 0x10000,
            kernel_stack_base: KERNEL_STACK_BASE,
            kernel_stack_size: 0x4000,
        }
    }

    pub const fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }

    pub const fn with_timer_frequency(mut self, hz: u64) -> Self {
        self.timer_frequency = hz;
        self
    }

    pub const fn with_time_slice(mut self, ticks: u64) -> Self {
        self.time_slice = ticks;
        self
    }

    pub const fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    pub const fn with_irq_lines(mut self, lines: usize) -> Self {
        self.irq_lines = lines;
        self
    }

    /// Checks that the configured limits describe a usable kernel.
    ///
    /// Every process must fit a stack slot in the user region and the kernel
    /// stack region must not wrap around the address space.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_processes == 0 {
            return Err(ConfigError::NoProcesses);
        }
        if self.timer_frequency == 0 || self.time_slice == 0 {
            return Err(ConfigError::ZeroTimer);
        }
        if self.event_queue_capacity == 0 || self.inbox_capacity == 0 {
            return Err(ConfigError::ZeroQueue);
        }
        if self.user_stack_size == 0 || self.kernel_stack_size == 0 {
            return Err(ConfigError::StackLayout);
        }
        let slots = self.max_processes as u64 + 1;
        let user_span = slots.checked_mul(self.user_stack_size);
        if user_span.map_or(true, |span| span > self.user_stack_top) {
            return Err(ConfigError::StackLayout);
        }
        let kernel_span = slots.checked_mul(self.kernel_stack_size);
        if kernel_span
            .and_then(|span| self.kernel_stack_base.checked_add(span))
            .is_none()
        {
            return Err(ConfigError::StackLayout);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Reasons a [`KernelConfig`] is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    NoProcesses,
    ZeroTimer,
    ZeroQueue,
    StackLayout,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::NoProcesses => write!(f, "process limit must be non-zero"),
            ConfigError::ZeroTimer => write!(f, "timer frequency and time slice must be non-zero"),
            ConfigError::ZeroQueue => write!(f, "event queues need a non-zero capacity"),
            ConfigError::StackLayout => write!(f, "stack layout does not fit the address space"),
        }
    }
}

// Process Management Module for the kproc microkernel
pub mod context;
pub mod manager;
pub mod pcb;
pub mod scheduler;

pub use context::{
    AddressSpace, AddressSpaceAllocator, Cpu, CpuState, HaltCpu, MemoryMap, StackLayout,
};
pub use manager::ProcessManager;
pub use pcb::{
    EventKind, Process, ProcessEvent, ProcessId, ProcessState, SleepOutcome, SleepTimer,
};
pub use scheduler::{Scheduler, SchedulerStats};

// Kernel instance: process manager plus the collaborators it drives
use alloc::boxed::Box;
use alloc::sync::Arc;
use lazy_static::lazy_static;
use log::{error, info, warn};
use spin::Mutex;
use x86_64::VirtAddr;

use crate::config::{ConfigError, KernelConfig};
use crate::error::{ApiError, ProcessError};
use crate::interrupts::{InterruptController, InterruptIndex, SharedController};
use crate::memory::UserMemory;
use crate::process::{AddressSpaceAllocator, Cpu, CpuState, ProcessId, ProcessManager};
use crate::timer::{TickTimer, Timer};

/// Hardware and memory services a kernel is built from.
pub struct Platform {
    pub spaces: Box<dyn AddressSpaceAllocator>,
    pub cpu: Box<dyn Cpu>,
    pub interrupts: Box<dyn InterruptController>,
    pub memory: Box<dyn UserMemory>,
    /// `None` runs the kernel without a timer service.
    pub timer: Option<Arc<TickTimer>>,
}

/// The process control core of one CPU.
pub struct Kernel {
    pub(crate) procs: ProcessManager,
    pub(crate) interrupts: SharedController,
    pub(crate) timer: Option<Arc<TickTimer>>,
    pub(crate) memory: Box<dyn UserMemory>,
}

impl Kernel {
    pub fn new(config: KernelConfig, platform: Platform) -> Result<Self, ConfigError> {
        config.validate()?;

        let shared = platform.timer.clone().map(|timer| timer as Arc<dyn Timer>);

        Ok(Self {
            procs: ProcessManager::new(config, platform.spaces, platform.cpu, shared),
            interrupts: Arc::new(Mutex::new(platform.interrupts)),
            timer: platform.timer,
            memory: platform.memory,
        })
    }

    /// Create the first process and bind it to the CPU through `frame`.
    ///
    /// The first process runs privileged and has no parent.
    pub fn boot(&mut self, entry: VirtAddr, frame: &mut CpuState) -> Result<ProcessId, ProcessError> {
        let map = *self.procs.memory_map();
        let id = self.procs.create_privileged(entry, &map)?.id();
        self.procs.schedule(frame);
        info!("Booted process {} at {:?}", id, entry);
        Ok(id)
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.procs
    }

    pub fn processes_mut(&mut self) -> &mut ProcessManager {
        &mut self.procs
    }

    pub fn config(&self) -> &KernelConfig {
        self.procs.config()
    }

    pub fn timer(&self) -> Option<&Arc<TickTimer>> {
        self.timer.as_ref()
    }

    pub fn interrupts(&self) -> SharedController {
        Arc::clone(&self.interrupts)
    }

    /// Periodic timer interrupt.
    ///
    /// Advances the timer, wakes expired sleepers and preempts the running
    /// process once its time slice is used up. Returns true if `frame` now
    /// holds a different scheduling decision.
    pub fn timer_interrupt(&mut self, frame: &mut CpuState) -> bool {
        if let Some(timer) = &self.timer {
            timer.tick();
        }
        self.procs.deliver_events();
        self.procs.wake_expired();

        if self.procs.current_id().is_none() {
            return false;
        }
        if self.procs.tick() {
            self.procs.schedule(frame);
            return true;
        }
        false
    }

    /// Hardware interrupt on a watched line. Events are queued on their
    /// processes; the running process is not preempted.
    pub fn interrupt(&mut self, frame: &CpuState) -> usize {
        let handled = self.interrupts.lock().dispatch(frame);
        self.procs.deliver_events();
        handled
    }

    /// Remove every process. Returns how many were removed.
    pub fn shutdown(&mut self) -> usize {
        let ids: alloc::vec::Vec<ProcessId> = self.procs.iter().map(|p| p.id()).collect();
        let mut controller = self.interrupts.lock();
        for id in ids {
            controller.unhook_owner(id);
        }
        drop(controller);
        self.procs.shutdown()
    }
}

/// What interrupt context may touch while the kernel lock is held.
struct InterruptRoute {
    interrupts: SharedController,
    timer: Option<Arc<TickTimer>>,
}

lazy_static! {
    static ref KERNEL: Mutex<Option<Kernel>> = Mutex::new(None);
    static ref ROUTE: Mutex<Option<InterruptRoute>> = Mutex::new(None);
}

/// Install `kernel` as the instance serving traps. Fails, handing the
/// kernel back, if one is already installed.
pub fn install(kernel: Kernel) -> Result<(), Kernel> {
    let mut slot = KERNEL.lock();
    if slot.is_some() {
        return Err(kernel);
    }
    *ROUTE.lock() = Some(InterruptRoute {
        interrupts: kernel.interrupts(),
        timer: kernel.timer.clone(),
    });
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::timer::init_pit(kernel.config().timer_frequency);
    *slot = Some(kernel);
    info!("Kernel installed");
    Ok(())
}

/// Run `f` on the installed kernel.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> Option<R> {
    KERNEL.lock().as_mut().map(f)
}

/// Entry point for every trap, called by the architecture glue with the
/// saved register frame. CPU exceptions are left to the architecture glue.
pub fn trap_entry(frame: &mut CpuState) {
    if frame.vector == InterruptIndex::Syscall.as_u64() {
        syscall_entry(frame);
    } else if frame.vector == InterruptIndex::Timer.as_u64() {
        timer_entry(frame);
    } else if frame.irq().is_some() {
        interrupt_entry(frame);
    } else {
        warn!("Unhandled exception vector {}", frame.vector);
    }
}

/// ProcessCtl trap.
pub fn syscall_entry(frame: &mut CpuState) {
    match KERNEL.lock().as_mut() {
        Some(kernel) => kernel.syscall(frame),
        None => {
            error!("ProcessCtl before kernel install");
            frame.set_result(ApiError::NotFound.code());
        }
    }
}

/// Timer trap. When the kernel is busy (idling in the scheduler) only the
/// tick is counted; the idle loop picks up expired sleepers itself.
pub fn timer_entry(frame: &mut CpuState) {
    if let Some(mut slot) = KERNEL.try_lock() {
        if let Some(kernel) = slot.as_mut() {
            kernel.timer_interrupt(frame);
            return;
        }
    }
    if let Some(route) = ROUTE.lock().as_ref() {
        if let Some(timer) = &route.timer {
            timer.tick();
        }
    }
}

/// Hardware IRQ trap. Hooks only queue events, so the kernel lock is never
/// needed here.
pub fn interrupt_entry(frame: &mut CpuState) {
    if let Some(route) = ROUTE.lock().as_ref() {
        route.interrupts.lock().dispatch(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupts::VectorTable;
    use crate::process::context::{HaltCpu, StackLayout, IRQ_BASE};
    use crate::syscalls::{OperationCode, SELF};
    use crate::timer::TimerInfo;
    use x86_64::PhysAddr;

    struct NoMemory;

    impl UserMemory for NoMemory {
        fn read_words(&self, addr: u64, _out: &mut [u64]) -> Result<(), crate::error::MemoryFault> {
            Err(crate::error::MemoryFault::BadAddress(addr))
        }

        fn write_words(&mut self, addr: u64, _words: &[u64]) -> Result<(), crate::error::MemoryFault> {
            Err(crate::error::MemoryFault::BadAddress(addr))
        }
    }

    fn kernel(config: KernelConfig) -> Kernel {
        let platform = Platform {
            spaces: Box::new(StackLayout::new(PhysAddr::new(0x100_0000), PhysAddr::new(0x110_0000))),
            cpu: Box::new(HaltCpu),
            interrupts: Box::new(VectorTable::new(config.irq_lines)),
            memory: Box::new(NoMemory),
            timer: Some(Arc::new(TickTimer::new(config.timer_frequency))),
        };
        Kernel::new(config, platform).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = KernelConfig::new().with_max_processes(0);
        let platform = Platform {
            spaces: Box::new(StackLayout::new(PhysAddr::new(0x1000), PhysAddr::new(0x2000))),
            cpu: Box::new(HaltCpu),
            interrupts: Box::new(VectorTable::new(16)),
            memory: Box::new(NoMemory),
            timer: None,
        };
        assert!(matches!(Kernel::new(config, platform), Err(ConfigError::NoProcesses)));
    }

    #[test]
    fn boot_binds_first_process() {
        let mut k = kernel(KernelConfig::default());
        let mut frame = CpuState::default();
        let id = k.boot(VirtAddr::new(0x40_0000), &mut frame).unwrap();
        assert_eq!(id.as_u64(), 1);
        assert_eq!(frame.rip, 0x40_0000);
        assert!(k.processes().current().is_privileged());
    }

    #[test]
    fn time_slice_expiry_preempts() {
        let mut k = kernel(KernelConfig::new().with_time_slice(2));
        let mut frame = CpuState::default();
        k.boot(VirtAddr::new(0xA000), &mut frame).unwrap();
        frame.set_syscall_args(SELF, OperationCode::Spawn as u64, 0xB000, 0);
        k.syscall(&mut frame);

        assert!(!k.timer_interrupt(&mut frame));
        assert!(k.timer_interrupt(&mut frame));
        assert_eq!(frame.rip, 0xB000);
        assert_eq!(k.timer().unwrap().current(), TimerInfo::new(2, 100));
        assert_eq!(k.processes().scheduler_stats().total_switches, 2);
    }

    #[test]
    fn shutdown_clears_processes_and_hooks() {
        let mut k = kernel(KernelConfig::default());
        let mut frame = CpuState::default();
        k.boot(VirtAddr::new(0xA000), &mut frame).unwrap();
        frame.set_syscall_args(SELF, OperationCode::WatchIRQ as u64, 1, 0);
        k.syscall(&mut frame);
        assert_eq!(frame.result(), 0);

        assert_eq!(k.shutdown(), 1);
        let trapped = CpuState { vector: IRQ_BASE + 1, ..CpuState::default() };
        assert_eq!(k.interrupt(&trapped), 0);
    }

    // The only test touching the global kernel slot.
    #[test]
    fn installed_kernel_serves_traps() {
        let mut k = kernel(KernelConfig::default());
        let mut frame = CpuState::default();
        k.boot(VirtAddr::new(0xA000), &mut frame).unwrap();
        assert!(install(k).is_ok());
        assert!(install(kernel(KernelConfig::default())).is_err());

        frame.vector = InterruptIndex::Syscall.as_u64();
        frame.set_syscall_args(SELF, OperationCode::GetPID as u64, 0, 0);
        trap_entry(&mut frame);
        assert_eq!(frame.result(), 1);

        frame.vector = InterruptIndex::Timer.as_u64();
        trap_entry(&mut frame);
        let ticks = with_kernel(|k| k.timer().map(|t| t.current().ticks));
        assert_eq!(ticks, Some(Some(1)));

        frame.vector = InterruptIndex::Syscall.as_u64();
        frame.set_syscall_args(7, OperationCode::Resume as u64, 0, 0);
        trap_entry(&mut frame);
        assert_eq!(frame.result(), ApiError::NotFound.code());
    }
}

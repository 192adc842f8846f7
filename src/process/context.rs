// Saved CPU context and address space handles for kproc processes
use alloc::vec::Vec;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::KernelConfig;
use crate::error::ProcessError;
use crate::process::pcb::ProcessId;

/// First interrupt vector used by hardware IRQ lines (PIC_1_OFFSET).
pub const IRQ_BASE: u64 = 32;

pub const KERNEL_CODE_SELECTOR: u64 = 0x08;
pub const KERNEL_DATA_SELECTOR: u64 = 0x10;
pub const USER_CODE_SELECTOR: u64 = 0x1B;
pub const USER_DATA_SELECTOR: u64 = 0x23;

/// RFLAGS with the interrupt flag and the reserved bit set.
pub const DEFAULT_RFLAGS: u64 = 0x202;

const PAGE_SIZE: u64 = 4096;

/// CPU registers saved on every trap and restored when a process resumes.
///
/// The trap entry glue pushes this record; the scheduler switches processes
/// by swapping its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,    // Instruction pointer
    pub rflags: u64, // CPU flags
    pub cs: u64,     // Code segment
    pub ss: u64,     // Stack segment
    pub ds: u64,     // Data segment
    pub es: u64,     // Extra segment
    pub fs: u64,     // FS segment
    pub gs: u64,     // GS segment
    /// Interrupt vector that caused the trap.
    pub vector: u64,
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            rax: 0, rbx: 0, rcx: 0, rdx: 0,
            rsi: 0, rdi: 0, rbp: 0, rsp: 0,
            r8: 0, r9: 0, r10: 0, r11: 0,
            r12: 0, r13: 0, r14: 0, r15: 0,
            rip: 0, rflags: DEFAULT_RFLAGS,
            cs: KERNEL_CODE_SELECTOR, ss: KERNEL_DATA_SELECTOR,
            ds: KERNEL_DATA_SELECTOR, es: KERNEL_DATA_SELECTOR,
            fs: KERNEL_DATA_SELECTOR, gs: KERNEL_DATA_SELECTOR,
            vector: 0,
        }
    }
}

impl CpuState {
    /// Initial context for a process entering at `entry` on `stack`.
    pub fn initial(entry: VirtAddr, stack: VirtAddr, privileged: bool) -> Self {
        let mut state = CpuState {
            rip: entry.as_u64(),
            rsp: stack.as_u64(),
            ..CpuState::default()
        };
        if !privileged {
            state.cs = USER_CODE_SELECTOR;
            state.ss = USER_DATA_SELECTOR;
            state.ds = USER_DATA_SELECTOR;
            state.es = USER_DATA_SELECTOR;
            state.fs = USER_DATA_SELECTOR;
            state.gs = USER_DATA_SELECTOR;
        }
        state
    }

    /// IRQ line that raised this trap, or `None` for exceptions and other
    /// vectors below the IRQ base.
    pub fn irq(&self) -> Option<u32> {
        self.vector.checked_sub(IRQ_BASE).map(|line| line as u32)
    }

    /// ProcessCtl arguments: target, operation, argument, output address.
    pub fn syscall_args(&self) -> (u64, u64, u64, u64) {
        (self.rdi, self.rsi, self.rdx, self.r10)
    }

    pub fn set_syscall_args(&mut self, target: u64, operation: u64, arg: u64, output: u64) {
        self.rdi = target;
        self.rsi = operation;
        self.rdx = arg;
        self.r10 = output;
    }

    pub fn result(&self) -> u64 {
        self.rax
    }

    pub fn set_result(&mut self, value: u64) {
        self.rax = value;
    }
}

/// Memory layout a new process is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMap {
    pub user_stack_top: u64,
    pub user_stack_size: u64,
    pub kernel_stack_base: u64,
    pub kernel_stack_size: u64,
}

impl MemoryMap {
    pub fn from_config(config: &KernelConfig) -> Self {
        Self {
            user_stack_top: config.user_stack_top,
            user_stack_size: config.user_stack_size,
            kernel_stack_base: config.kernel_stack_base,
            kernel_stack_size: config.kernel_stack_size,
        }
    }

    /// Initial user stack pointer for the slot belonging to `id`.
    pub fn user_stack(&self, id: ProcessId) -> Option<u64> {
        let offset = (id.as_u64().checked_sub(1)?).checked_mul(self.user_stack_size)?;
        self.user_stack_top.checked_sub(offset)
    }

    /// Top of the kernel stack slot belonging to `id`.
    pub fn kernel_stack(&self, id: ProcessId) -> Option<u64> {
        let offset = (id.as_u64().checked_add(1)?).checked_mul(self.kernel_stack_size)?;
        self.kernel_stack_base.checked_add(offset)
    }
}

/// Resources that make up a process's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    pub page_directory: PhysAddr,
    pub user_stack: VirtAddr,
    pub kernel_stack: VirtAddr,
}

/// Builds and tears down process address spaces.
pub trait AddressSpaceAllocator: Send {
    fn allocate(&mut self, id: ProcessId, map: &MemoryMap) -> Result<AddressSpace, ProcessError>;

    fn release(&mut self, space: &AddressSpace);
}

/// Allocator handing out one page-directory frame per process from a fixed
/// pool, with stacks placed in per-identifier slots of the memory map.
#[derive(Debug)]
pub struct StackLayout {
    next_frame: u64,
    frames_end: u64,
    free_frames: Vec<PhysAddr>,
}

impl StackLayout {
    /// Pool of page-directory frames in `[start, end)`.
    pub fn new(start: PhysAddr, end: PhysAddr) -> Self {
        Self {
            next_frame: start.align_up(PAGE_SIZE).as_u64(),
            frames_end: end.as_u64(),
            free_frames: Vec::new(),
        }
    }

    /// Frames still available for new page directories.
    pub fn available(&self) -> u64 {
        self.frames_end.saturating_sub(self.next_frame) / PAGE_SIZE + self.free_frames.len() as u64
    }

    fn allocate_frame(&mut self) -> Option<PhysAddr> {
        if let Some(frame) = self.free_frames.pop() {
            return Some(frame);
        }
        if self.next_frame.checked_add(PAGE_SIZE)? > self.frames_end {
            return None;
        }
        let frame = PhysAddr::new(self.next_frame);
        self.next_frame += PAGE_SIZE;
        Some(frame)
    }
}

impl AddressSpaceAllocator for StackLayout {
    fn allocate(&mut self, id: ProcessId, map: &MemoryMap) -> Result<AddressSpace, ProcessError> {
        let user = map.user_stack(id).ok_or(ProcessError::InsufficientMemory)?;
        let kernel = map.kernel_stack(id).ok_or(ProcessError::InsufficientMemory)?;
        let user_stack = VirtAddr::try_new(user).map_err(|_| ProcessError::InvalidAddress(user))?;
        let kernel_stack =
            VirtAddr::try_new(kernel).map_err(|_| ProcessError::InvalidAddress(kernel))?;
        let page_directory = self.allocate_frame().ok_or(ProcessError::InsufficientMemory)?;

        Ok(AddressSpace {
            page_directory,
            user_stack,
            kernel_stack,
        })
    }

    fn release(&mut self, space: &AddressSpace) {
        self.free_frames.push(space.page_directory);
    }
}

/// Architecture hooks used by the scheduler.
pub trait Cpu: Send {
    /// Stall until the next interrupt has been delivered.
    fn wait_for_interrupt(&mut self);

    /// Make `space` the active address space.
    fn activate(&mut self, _space: &AddressSpace) {}
}

/// Low-power stall on the bare-metal target.
#[derive(Debug, Default)]
pub struct HaltCpu;

impl Cpu for HaltCpu {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    fn wait_for_interrupt(&mut self) {
        // Interrupts stay off while the kernel runs; open them only for the halt.
        x86_64::instructions::interrupts::enable_and_hlt();
        x86_64::instructions::interrupts::disable();
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    fn wait_for_interrupt(&mut self) {
        core::hint::spin_loop();
    }

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    fn activate(&mut self, space: &AddressSpace) {
        use x86_64::registers::control::Cr3;
        use x86_64::structures::paging::PhysFrame;

        let (current, flags) = Cr3::read();
        if current.start_address() != space.page_directory {
            if let Ok(frame) = PhysFrame::from_start_address(space.page_directory) {
                unsafe { Cr3::write(frame, flags) };
            }
        }
    }
}

// src/interrupts.rs
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use log::{debug, warn};

use crate::error::IrqError;
use crate::process::{CpuState, EventKind, ProcessEvent, ProcessId};

pub const PIC_1_OFFSET: u8 = 32;

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Syscall = 0x80, // ProcessCtl trap
}

impl InterruptIndex {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_u64(self) -> u64 {
        u64::from(self.as_u8())
    }
}

/// Events raised in interrupt context, waiting to be handed to processes.
///
/// Pushing never blocks and never touches the process registry, so hooks
/// may run while the kernel is idling inside the scheduler.
pub struct EventInbox {
    queue: ArrayQueue<(ProcessId, ProcessEvent)>,
    dropped: AtomicU64,
}

impl EventInbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue `event` for `owner`. Returns false if the inbox was full.
    pub fn push(&self, owner: ProcessId, event: ProcessEvent) -> bool {
        if self.queue.push((owner, event)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn pop(&self) -> Option<(ProcessId, ProcessEvent)> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Events lost because the inbox was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for EventInbox {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventInbox")
            .field("pending", &self.queue.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Who a hook notifies when its line fires.
#[derive(Debug, Clone)]
pub enum EventSource {
    /// Raise an event on process `id` through `inbox`.
    Process { id: ProcessId, inbox: Arc<EventInbox> },
}

impl EventSource {
    pub fn owner(&self) -> ProcessId {
        match self {
            EventSource::Process { id, .. } => *id,
        }
    }
}

/// Callback run with the trapped state and the hook's event source.
pub type InterruptHandler = fn(&CpuState, &EventSource);

/// Handler installed by `WatchIRQ`: raise an interrupt event on the owner.
pub fn interrupt_notify(state: &CpuState, source: &EventSource) {
    match source {
        EventSource::Process { id, inbox } => {
            let number = match state.irq() {
                Some(line) => u64::from(line),
                None => return,
            };
            let event = ProcessEvent {
                kind: EventKind::Interrupt,
                number,
            };
            if !inbox.push(*id, event) {
                warn!("Inbox full, IRQ {} for process {} dropped", event.number, id);
            }
        }
    }
}

/// A registered interrupt callback.
#[derive(Clone)]
pub struct IrqHook {
    pub irq: u32,
    pub handler: InterruptHandler,
    pub source: EventSource,
}

impl fmt::Debug for IrqHook {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IrqHook")
            .field("irq", &self.irq)
            .field("owner", &self.source.owner())
            .finish()
    }
}

/// Interrupt controller as seen by the process layer.
pub trait InterruptController: Send {
    fn enable(&mut self, irq: u64) -> Result<(), IrqError>;

    fn disable(&mut self, irq: u64) -> Result<(), IrqError>;

    /// Register `handler` to run with `source` whenever `irq` fires.
    fn hook(&mut self, irq: u64, handler: InterruptHandler, source: EventSource)
        -> Result<(), IrqError>;

    /// Drop every hook owned by `owner`. Returns how many were removed.
    fn unhook_owner(&mut self, owner: ProcessId) -> usize;

    /// Run the hooks for the line that raised `state`. Returns how many ran.
    fn dispatch(&self, state: &CpuState) -> usize;
}

/// Shared handle so interrupt context can reach the controller without
/// taking the kernel lock.
pub type SharedController = Arc<spin::Mutex<alloc::boxed::Box<dyn InterruptController>>>;

/// Software vector table: hook lists and enable bits per IRQ line.
///
/// On bare metal, enabling or disabling one of the 16 legacy lines also
/// updates the 8259 PIC mask registers.
pub struct VectorTable {
    enabled: Vec<bool>,
    hooks: Vec<Vec<IrqHook>>,
}

impl VectorTable {
    pub fn new(lines: usize) -> Self {
        Self {
            enabled: vec![false; lines],
            hooks: vec![Vec::new(); lines],
        }
    }

    pub fn lines(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_enabled(&self, irq: u64) -> bool {
        self.line(irq).map_or(false, |line| self.enabled[line])
    }

    pub fn hooks(&self, irq: u64) -> &[IrqHook] {
        match self.line(irq) {
            Ok(line) => &self.hooks[line],
            Err(_) => &[],
        }
    }

    fn line(&self, irq: u64) -> Result<usize, IrqError> {
        usize::try_from(irq)
            .ok()
            .filter(|line| *line < self.hooks.len())
            .ok_or(IrqError::InvalidIrq(irq))
    }

    fn set_enabled(&mut self, irq: u64, enabled: bool) -> Result<(), IrqError> {
        let line = self.line(irq)?;
        self.enabled[line] = enabled;
        set_pic_mask(line, !enabled);
        debug!("IRQ {} {}", irq, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }
}

impl InterruptController for VectorTable {
    fn enable(&mut self, irq: u64) -> Result<(), IrqError> {
        self.set_enabled(irq, true)
    }

    fn disable(&mut self, irq: u64) -> Result<(), IrqError> {
        self.set_enabled(irq, false)
    }

    fn hook(
        &mut self,
        irq: u64,
        handler: InterruptHandler,
        source: EventSource,
    ) -> Result<(), IrqError> {
        let line = self.line(irq)?;
        debug!("IRQ {} hooked for process {}", irq, source.owner());
        self.hooks[line].push(IrqHook {
            irq: line as u32,
            handler,
            source,
        });
        Ok(())
    }

    fn unhook_owner(&mut self, owner: ProcessId) -> usize {
        let mut removed = 0;
        for hooks in self.hooks.iter_mut() {
            let before = hooks.len();
            hooks.retain(|hook| hook.source.owner() != owner);
            removed += before - hooks.len();
        }
        if removed > 0 {
            debug!("Removed {} IRQ hooks of process {}", removed, owner);
        }
        removed
    }

    fn dispatch(&self, state: &CpuState) -> usize {
        let hooks = match state.irq() {
            Some(line) => self.hooks(u64::from(line)),
            None => return 0,
        };
        for hook in hooks {
            (hook.handler)(state, &hook.source);
        }
        hooks.len()
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn set_pic_mask(line: usize, masked: bool) {
    use x86_64::instructions::port::Port;

    if line >= 16 {
        return;
    }
    let (port, bit) = if line < 8 { (0x21, line) } else { (0xA1, line - 8) };
    let mut port: Port<u8> = Port::new(port);
    unsafe {
        let mask: u8 = port.read();
        let mask = if masked { mask | (1 << bit) } else { mask & !(1 << bit) };
        port.write(mask);
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn set_pic_mask(_line: usize, _masked: bool) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::context::IRQ_BASE;

    fn trapped(irq: u64) -> CpuState {
        CpuState { vector: IRQ_BASE + irq, ..CpuState::default() }
    }

    fn source(id: u64, inbox: &Arc<EventInbox>) -> EventSource {
        EventSource::Process { id: ProcessId::new(id), inbox: Arc::clone(inbox) }
    }

    #[test]
    fn notify_queues_interrupt_event() {
        let inbox = Arc::new(EventInbox::new(4));
        interrupt_notify(&trapped(5), &source(3, &inbox));
        assert_eq!(
            inbox.pop(),
            Some((ProcessId::new(3), ProcessEvent { kind: EventKind::Interrupt, number: 5 }))
        );
        assert!(inbox.is_empty());
    }

    #[test]
    fn full_inbox_counts_drops() {
        let inbox = Arc::new(EventInbox::new(1));
        let src = source(1, &inbox);
        interrupt_notify(&trapped(1), &src);
        interrupt_notify(&trapped(1), &src);
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox.dropped(), 1);
    }

    #[test]
    fn dispatch_runs_hooks_of_the_trapped_line() {
        let inbox = Arc::new(EventInbox::new(8));
        let mut table = VectorTable::new(16);
        table.hook(3, interrupt_notify, source(1, &inbox)).unwrap();
        table.hook(3, interrupt_notify, source(2, &inbox)).unwrap();
        table.hook(4, interrupt_notify, source(3, &inbox)).unwrap();

        assert_eq!(table.dispatch(&trapped(3)), 2);
        assert_eq!(table.dispatch(&trapped(7)), 0);
        let owners: Vec<u64> = core::iter::from_fn(|| inbox.pop()).map(|(id, _)| id.as_u64()).collect();
        assert_eq!(owners, [1, 2]);
    }

    #[test]
    fn exception_vectors_are_not_irqs() {
        let inbox = Arc::new(EventInbox::new(4));
        let mut table = VectorTable::new(16);
        table.hook(0, interrupt_notify, source(1, &inbox)).unwrap();

        let page_fault = CpuState { vector: 14, ..CpuState::default() };
        assert_eq!(table.dispatch(&page_fault), 0);
        interrupt_notify(&page_fault, &source(1, &inbox));
        assert!(inbox.is_empty());

        assert_eq!(table.dispatch(&trapped(0)), 1);
        assert_eq!(
            inbox.pop(),
            Some((ProcessId::new(1), ProcessEvent { kind: EventKind::Interrupt, number: 0 }))
        );
    }

    #[test]
    fn out_of_range_lines_are_rejected() {
        let inbox = Arc::new(EventInbox::new(1));
        let mut table = VectorTable::new(16);
        assert_eq!(table.enable(16), Err(IrqError::InvalidIrq(16)));
        assert_eq!(
            table.hook(u64::MAX, interrupt_notify, source(1, &inbox)),
            Err(IrqError::InvalidIrq(u64::MAX))
        );
        assert_eq!(table.dispatch(&trapped(200)), 0);
    }

    #[test]
    fn enable_and_disable_toggle_lines() {
        let mut table = VectorTable::new(16);
        assert!(!table.is_enabled(1));
        table.enable(1).unwrap();
        assert!(table.is_enabled(1));
        table.disable(1).unwrap();
        assert!(!table.is_enabled(1));
    }

    #[test]
    fn unhook_owner_removes_only_its_hooks() {
        let inbox = Arc::new(EventInbox::new(8));
        let mut table = VectorTable::new(16);
        table.hook(1, interrupt_notify, source(1, &inbox)).unwrap();
        table.hook(2, interrupt_notify, source(1, &inbox)).unwrap();
        table.hook(2, interrupt_notify, source(2, &inbox)).unwrap();

        assert_eq!(table.unhook_owner(ProcessId::new(1)), 2);
        assert!(table.hooks(1).is_empty());
        assert_eq!(table.hooks(2).len(), 1);
        assert_eq!(table.unhook_owner(ProcessId::new(1)), 0);
    }
}

// Process registry and scheduler entry point for the kproc microkernel
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{debug, info, trace, warn};
use x86_64::VirtAddr;

use crate::config::KernelConfig;
use crate::error::ProcessError;
use crate::interrupts::EventInbox;
use crate::process::context::{AddressSpaceAllocator, Cpu, CpuState, MemoryMap};
use crate::process::pcb::{Process, ProcessId, ProcessState};
use crate::process::scheduler::{Scheduler, SchedulerStats};
use crate::timer::Timer;

/// Owns every process and decides which one runs.
///
/// Exactly one process is bound to the CPU once the first one has been
/// scheduled. Its registers live in the trap frame while it runs and are
/// copied into its [`Process`] record whenever it is switched out.
pub struct ProcessManager {
    config: KernelConfig,
    map: MemoryMap,
    processes: BTreeMap<ProcessId, Process>,
    current: Option<ProcessId>,
    scheduler: Scheduler,
    spaces: Box<dyn AddressSpaceAllocator>,
    cpu: Box<dyn Cpu>,
    timer: Option<Arc<dyn Timer>>,
    inbox: Arc<EventInbox>,
    booted: bool,
}

impl ProcessManager {
    pub fn new(
        config: KernelConfig,
        spaces: Box<dyn AddressSpaceAllocator>,
        cpu: Box<dyn Cpu>,
        timer: Option<Arc<dyn Timer>>,
    ) -> Self {
        Self {
            config,
            map: MemoryMap::from_config(&config),
            processes: BTreeMap::new(),
            current: None,
            scheduler: Scheduler::new(config.time_slice),
            spaces,
            cpu,
            timer,
            inbox: Arc::new(EventInbox::new(config.inbox_capacity)),
            booted: false,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Default memory layout for new processes.
    pub fn memory_map(&self) -> &MemoryMap {
        &self.map
    }

    pub fn timer(&self) -> Option<&Arc<dyn Timer>> {
        self.timer.as_ref()
    }

    /// Queue through which interrupt context hands events to processes.
    pub fn inbox(&self) -> Arc<EventInbox> {
        Arc::clone(&self.inbox)
    }

    /// Create a new unprivileged process in the `Ready` state.
    pub fn create(&mut self, entry: VirtAddr, map: &MemoryMap) -> Result<&mut Process, ProcessError> {
        self.create_process(entry, map, false)
    }

    /// Create a new process with unrestricted hardware access.
    pub fn create_privileged(
        &mut self,
        entry: VirtAddr,
        map: &MemoryMap,
    ) -> Result<&mut Process, ProcessError> {
        self.create_process(entry, map, true)
    }

    fn create_process(
        &mut self,
        entry: VirtAddr,
        map: &MemoryMap,
        privileged: bool,
    ) -> Result<&mut Process, ProcessError> {
        let id = self.allocate_id()?;
        let space = self.spaces.allocate(id, map)?;
        let process = Process::new(id, entry, space, privileged, self.config.event_queue_capacity);

        info!(
            "Created process {} at {:?} (stack {:?}, page directory {:?})",
            id, entry, space.user_stack, space.page_directory
        );
        self.booted = true;
        Ok(self.processes.entry(id).or_insert(process))
    }

    /// Lowest free identifier that no live process still names as its parent.
    fn allocate_id(&self) -> Result<ProcessId, ProcessError> {
        if self.processes.len() >= self.config.max_processes {
            return Err(ProcessError::OutOfProcesses);
        }
        let parents: BTreeSet<ProcessId> = self.processes.values().map(Process::parent).collect();

        (1..=self.config.max_processes as u64)
            .map(ProcessId::new)
            .find(|id| !self.processes.contains_key(id) && !parents.contains(id))
            .ok_or(ProcessError::OutOfProcesses)
    }

    pub fn get(&self, id: ProcessId) -> Option<&Process> {
        self.processes.get(&id)
    }

    pub fn get_mut(&mut self, id: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&id)
    }

    /// Identifier of the process bound to the CPU, if any has been scheduled.
    pub fn current_id(&self) -> Option<ProcessId> {
        self.current
    }

    /// The process bound to the CPU.
    ///
    /// # Panics
    ///
    /// Panics if no process has been scheduled yet, or if the current process
    /// was removed and no scheduling decision has been made since. Both are
    /// kernel bugs rather than runtime errors.
    pub fn current(&self) -> &Process {
        match self.current.and_then(|id| self.processes.get(&id)) {
            Some(process) => process,
            None => panic!("no process is bound to the CPU"),
        }
    }

    /// Mutable access to the process bound to the CPU.
    ///
    /// # Panics
    ///
    /// Same conditions as [`ProcessManager::current`].
    pub fn current_mut(&mut self) -> &mut Process {
        match self.current.and_then(|id| self.processes.get_mut(&id)) {
            Some(process) => process,
            None => panic!("no process is bound to the CPU"),
        }
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    /// List all processes
    pub fn list_processes(&self) -> Vec<(ProcessId, ProcessState)> {
        self.processes
            .iter()
            .map(|(id, process)| (*id, process.state()))
            .collect()
    }

    /// Destroy a process and release its resources.
    ///
    /// Every process waiting for `id` receives `status` and becomes ready.
    /// Removing the current process is allowed; the caller must schedule
    /// right after, since the removed process can no longer run.
    pub fn remove(&mut self, id: ProcessId, status: u64) -> Result<(), ProcessError> {
        let process = self
            .processes
            .remove(&id)
            .ok_or(ProcessError::ProcessNotFound(id))?;

        for waiter in self
            .processes
            .values_mut()
            .filter(|p| p.state() == ProcessState::Waiting && p.wait_target() == Some(id))
        {
            debug!("Process {} resumes after {} exited", waiter.id(), id);
            waiter.deliver_exit(status);
        }

        self.spaces.release(process.address_space());
        if self.current == Some(id) {
            self.current = None;
        }

        info!("Terminated process {} with exit status {}", id, status);
        Ok(())
    }

    /// Switch the CPU to the next ready process.
    ///
    /// The outgoing process's registers are saved from `frame` (demoting it
    /// to `Ready` if it was still running), and `frame` is loaded with the
    /// chosen process's context. When nothing is ready, including after the
    /// last process exited, the CPU idles until an interrupt makes a process
    /// runnable.
    ///
    /// # Panics
    ///
    /// Panics if no process has ever been registered.
    pub fn schedule(&mut self, frame: &mut CpuState) -> ProcessId {
        if !self.booted {
            panic!("schedule called before any process was registered");
        }

        let previous = self.current.and_then(|id| self.processes.get_mut(&id));
        let previous_space = previous.as_ref().map(|p| p.page_directory());
        if let Some(outgoing) = previous {
            *outgoing.context_mut() = *frame;
            if outgoing.state() == ProcessState::Running {
                outgoing.set_state(ProcessState::Ready);
            }
        }

        loop {
            self.deliver_events();
            self.wake_expired();

            if let Some(next) = self.scheduler.select(&self.processes) {
                if let Some(process) = self.processes.get_mut(&next) {
                    process.set_state(ProcessState::Running);
                    *frame = *process.context();
                    if previous_space != Some(process.page_directory()) {
                        self.cpu.activate(process.address_space());
                    }
                    if self.current != Some(next) {
                        trace!("Context switch: {:?} -> {}", self.current, next);
                    }
                    self.current = Some(next);
                    return next;
                }
            }

            self.scheduler.record_idle();
            trace!("No process ready, waiting for interrupt");
            self.cpu.wait_for_interrupt();
        }
    }

    /// Account a timer tick. Returns true when the running process has used
    /// up its time slice.
    pub fn tick(&mut self) -> bool {
        self.scheduler.tick()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Hand events queued from interrupt context to their processes.
    pub fn deliver_events(&mut self) {
        while let Some((owner, event)) = self.inbox.pop() {
            match self.processes.get_mut(&owner) {
                Some(process) => {
                    if !process.raise_event(event) {
                        warn!("Event queue of process {} full, dropped {:?}", owner, event);
                    }
                }
                None => warn!("Dropped {:?} for missing process {}", event, owner),
            }
        }
    }

    /// Wake every sleeping process whose deadline has passed.
    pub fn wake_expired(&mut self) {
        let now = match &self.timer {
            Some(timer) => timer.current(),
            None => return,
        };
        for process in self.processes.values_mut() {
            if process.check_sleep_timer(&now) {
                trace!("Sleep timer of process {} expired", process.id());
            }
        }
    }

    /// Remove every process and release its resources.
    pub fn shutdown(&mut self) -> usize {
        let count = self.processes.len();
        for process in core::mem::take(&mut self.processes).into_values() {
            self.spaces.release(process.address_space());
        }
        self.current = None;
        info!("Process manager shut down, released {} processes", count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupts::EventInbox;
    use crate::process::context::{AddressSpace, StackLayout};
    use crate::process::pcb::{EventKind, ProcessEvent, SleepTimer};
    use crate::timer::{TickTimer, TimerInfo};
    use x86_64::PhysAddr;

    /// Idle CPU that advances a timer on every wait, and gives up after a bound.
    struct TickingCpu {
        timer: Arc<TickTimer>,
        waits: usize,
    }

    impl Cpu for TickingCpu {
        fn wait_for_interrupt(&mut self) {
            self.waits += 1;
            assert!(self.waits < 1000, "idle loop never found a ready process");
            self.timer.tick();
        }
    }

    fn manager_with(config: KernelConfig) -> (ProcessManager, Arc<TickTimer>) {
        let timer = Arc::new(TickTimer::new(config.timer_frequency));
        let cpu = TickingCpu { timer: Arc::clone(&timer), waits: 0 };
        let spaces = StackLayout::new(PhysAddr::new(0x100_0000), PhysAddr::new(0x200_0000));
        let shared: Arc<dyn Timer> = timer.clone();
        let manager = ProcessManager::new(config, Box::new(spaces), Box::new(cpu), Some(shared));
        (manager, timer)
    }

    fn manager() -> (ProcessManager, Arc<TickTimer>) {
        manager_with(KernelConfig::default())
    }

    fn spawn(m: &mut ProcessManager, entry: u64) -> ProcessId {
        let map = *m.memory_map();
        m.create(VirtAddr::new(entry), &map).unwrap().id()
    }

    #[test]
    fn create_assigns_increasing_ids() {
        let (mut m, _) = manager();
        let ids: Vec<u64> = (0..4).map(|i| spawn(&mut m, 0x1000 * (i + 1)).as_u64()).collect();
        assert_eq!(ids, [1, 2, 3, 4]);
        assert!(m.iter().all(|p| p.state() == ProcessState::Ready));
    }

    #[test]
    fn removed_id_is_reused_only_when_unreferenced() {
        let (mut m, _) = manager();
        let a = spawn(&mut m, 0x1000);
        let b = spawn(&mut m, 0x2000);
        let c = spawn(&mut m, 0x3000);
        m.get_mut(c).unwrap().set_parent(b);

        m.remove(a, 0).unwrap();
        m.remove(b, 0).unwrap();
        // 1 is free again, 2 is still named as the parent of 3
        assert_eq!(spawn(&mut m, 0x4000), a);
        assert_eq!(spawn(&mut m, 0x5000).as_u64(), 4);
    }

    #[test]
    fn create_fails_when_limit_reached() {
        let (mut m, _) = manager_with(KernelConfig::new().with_max_processes(2));
        spawn(&mut m, 0x1000);
        spawn(&mut m, 0x2000);
        let map = *m.memory_map();
        assert_eq!(
            m.create(VirtAddr::new(0x3000), &map).map(|p| p.id()),
            Err(ProcessError::OutOfProcesses)
        );
    }

    #[test]
    fn create_fails_when_memory_exhausted() {
        let timer: Arc<dyn Timer> = Arc::new(TickTimer::new(100));
        let spaces = StackLayout::new(PhysAddr::new(0x1000), PhysAddr::new(0x2000));
        let mut m = ProcessManager::new(
            KernelConfig::default(),
            Box::new(spaces),
            Box::new(crate::process::context::HaltCpu),
            Some(timer),
        );
        spawn(&mut m, 0x1000);
        let map = *m.memory_map();
        assert_eq!(
            m.create(VirtAddr::new(0x2000), &map).map(|p| p.id()),
            Err(ProcessError::InsufficientMemory)
        );
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn get_never_creates() {
        let (m, _) = manager();
        assert!(m.get(ProcessId::new(1)).is_none());
        assert!(m.is_empty());
    }

    #[test]
    fn schedule_switches_frames() {
        let (mut m, _) = manager();
        let a = spawn(&mut m, 0xA000);
        let b = spawn(&mut m, 0xB000);
        let mut frame = CpuState::default();

        assert_eq!(m.schedule(&mut frame), a);
        assert_eq!(frame.rip, 0xA000);
        assert_eq!(m.current().state(), ProcessState::Running);

        frame.rbx = 77;
        assert_eq!(m.schedule(&mut frame), b);
        assert_eq!(frame.rip, 0xB000);
        assert_eq!(m.get(a).unwrap().state(), ProcessState::Ready);
        assert_eq!(m.get(a).unwrap().context().rbx, 77);

        assert_eq!(m.schedule(&mut frame), a);
        assert_eq!(frame.rbx, 77);
    }

    #[test]
    fn schedule_never_selects_blocked_processes() {
        let (mut m, _) = manager();
        let a = spawn(&mut m, 0xA000);
        let b = spawn(&mut m, 0xB000);
        let mut frame = CpuState::default();
        m.get_mut(a).unwrap().wait_for(b);

        for _ in 0..5 {
            assert_eq!(m.schedule(&mut frame), b);
        }
    }

    #[test]
    fn remove_unblocks_waiters_with_status() {
        let (mut m, _) = manager();
        let a = spawn(&mut m, 0xA000);
        let b = spawn(&mut m, 0xB000);
        let c = spawn(&mut m, 0xC000);
        m.get_mut(a).unwrap().wait_for(c);
        m.get_mut(b).unwrap().wait_for(c);

        m.remove(c, 7).unwrap();
        for id in [a, b] {
            let p = m.get(id).unwrap();
            assert_eq!(p.state(), ProcessState::Ready);
            assert_eq!(p.wait_result(), 7);
            assert_eq!(p.context().result(), 7);
        }
        assert_eq!(m.remove(c, 7), Err(ProcessError::ProcessNotFound(c)));
    }

    #[test]
    fn removing_current_then_scheduling_does_not_save_it() {
        let (mut m, _) = manager();
        let a = spawn(&mut m, 0xA000);
        let b = spawn(&mut m, 0xB000);
        let mut frame = CpuState::default();
        assert_eq!(m.schedule(&mut frame), a);

        m.remove(a, 0).unwrap();
        assert_eq!(m.current_id(), None);
        assert_eq!(m.schedule(&mut frame), b);
        assert_eq!(m.current().id(), b);
    }

    #[test]
    fn idle_waits_until_sleep_timer_expires() {
        let (mut m, timer) = manager();
        let a = spawn(&mut m, 0xA000);
        let mut frame = CpuState::default();
        m.schedule(&mut frame);

        let deadline = timer.current().after_ticks(3);
        m.current_mut().sleep(SleepTimer::Until(deadline));
        assert_eq!(m.schedule(&mut frame), a);
        assert_eq!(timer.current().ticks, 3);
        assert_eq!(m.scheduler_stats().idle_waits, 3);
        assert_eq!(m.current().sleep_timer(), None);
    }

    #[test]
    fn inbox_events_are_delivered_at_schedule() {
        let (mut m, _) = manager();
        let a = spawn(&mut m, 0xA000);
        let b = spawn(&mut m, 0xB000);
        let mut frame = CpuState::default();
        m.get_mut(b).unwrap().sleep(SleepTimer::Indefinite);

        let event = ProcessEvent { kind: EventKind::Interrupt, number: 3 };
        let inbox: Arc<EventInbox> = m.inbox();
        assert!(inbox.push(b, event));
        assert!(inbox.push(ProcessId::new(99), event));

        assert_eq!(m.schedule(&mut frame), a);
        let b = m.get_mut(b).unwrap();
        assert_eq!(b.state(), ProcessState::Ready);
        assert_eq!(b.next_event(), Some(event));
        assert!(m.inbox().is_empty());
    }

    #[test]
    fn expired_deadline_never_blocks() {
        let (mut m, timer) = manager();
        let a = spawn(&mut m, 0xA000);
        let mut frame = CpuState::default();
        m.schedule(&mut frame);
        timer.advance(10);

        m.current_mut().sleep(SleepTimer::Until(TimerInfo::new(5, 100)));
        assert_eq!(m.schedule(&mut frame), a);
        assert_eq!(m.scheduler_stats().idle_waits, 0);
    }

    #[test]
    #[should_panic(expected = "before any process was registered")]
    fn scheduling_empty_registry_is_fatal() {
        let (mut m, _) = manager();
        m.schedule(&mut CpuState::default());
    }

    #[test]
    #[should_panic(expected = "idle loop never found a ready process")]
    fn removing_last_process_idles() {
        let (mut m, _) = manager();
        let a = spawn(&mut m, 0xA000);
        let mut frame = CpuState::default();
        m.schedule(&mut frame);
        m.remove(a, 0).unwrap();
        assert!(m.is_empty());
        m.schedule(&mut frame);
    }

    #[test]
    fn shutdown_releases_everything() {
        let (mut m, _) = manager();
        spawn(&mut m, 0xA000);
        spawn(&mut m, 0xB000);
        assert_eq!(m.shutdown(), 2);
        assert!(m.is_empty());
        assert_eq!(m.current_id(), None);
    }

    #[test]
    fn address_space_is_activated_on_switch() {
        struct Recording(Arc<spin::Mutex<Vec<PhysAddr>>>);
        impl Cpu for Recording {
            fn wait_for_interrupt(&mut self) {}
            fn activate(&mut self, space: &AddressSpace) {
                self.0.lock().push(space.page_directory);
            }
        }

        let log = Arc::new(spin::Mutex::new(Vec::new()));
        let spaces = StackLayout::new(PhysAddr::new(0x10_0000), PhysAddr::new(0x20_0000));
        let mut m = ProcessManager::new(
            KernelConfig::default(),
            Box::new(spaces),
            Box::new(Recording(Arc::clone(&log))),
            None,
        );
        let a = spawn(&mut m, 0xA000);
        let b = spawn(&mut m, 0xB000);
        let mut frame = CpuState::default();
        m.schedule(&mut frame);
        m.schedule(&mut frame);

        let pa = m.get(a).unwrap().page_directory();
        let pb = m.get(b).unwrap().page_directory();
        assert_eq!(*log.lock(), [pa, pb]);
    }
}

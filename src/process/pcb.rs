// Process Control Block (PCB) for the kproc microkernel
use core::fmt;

use crossbeam_queue::ArrayQueue;
use x86_64::{PhysAddr, VirtAddr};

use crate::process::context::{AddressSpace, CpuState};
use crate::timer::TimerInfo;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    pub const fn new(id: u64) -> Self {
        ProcessId(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ProcessState {
    Ready = 0,    // Runnable, waiting for the CPU
    Running = 1,  // Currently executing
    Waiting = 2,  // Blocked until another process exits
    Sleeping = 3, // Blocked until woken up or its timer expires
}

impl ProcessState {
    pub fn from_u64(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(ProcessState::Ready),
            1 => Some(ProcessState::Running),
            2 => Some(ProcessState::Waiting),
            3 => Some(ProcessState::Sleeping),
            _ => None,
        }
    }
}

/// What a sleeping process is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepTimer {
    /// Wake once the timer reaches this snapshot.
    Until(TimerInfo),
    /// Only an explicit wakeup ends the sleep.
    Indefinite,
}

/// Outcome of [`Process::sleep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// A pending wakeup was consumed; the caller keeps running.
    AlreadyWoken,
    /// The process is now sleeping and the caller must reschedule.
    WillSleep,
}

/// Kinds of events a process can be notified of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A watched hardware interrupt fired.
    Interrupt,
}

/// Structured notification raised on a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEvent {
    pub kind: EventKind,
    pub number: u64,
}

/// Process Control Block (PCB) - one schedulable execution context
pub struct Process {
    id: ProcessId,
    parent: ProcessId,
    state: ProcessState,
    privileged: bool,
    context: CpuState,
    space: AddressSpace,
    wait_target: Option<ProcessId>,
    wait_result: u64,
    sleep_timer: Option<SleepTimer>,
    wakeups: usize,
    events: ArrayQueue<ProcessEvent>,
}

impl Process {
    /// New process in the `Ready` state, entering at `entry` on its own user stack.
    pub fn new(
        id: ProcessId,
        entry: VirtAddr,
        space: AddressSpace,
        privileged: bool,
        event_capacity: usize,
    ) -> Self {
        Self {
            id,
            parent: ProcessId::new(0),
            state: ProcessState::Ready,
            privileged,
            context: CpuState::initial(entry, space.user_stack, privileged),
            space,
            wait_target: None,
            wait_result: 0,
            sleep_timer: None,
            wakeups: 0,
            events: ArrayQueue::new(event_capacity.max(1)),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Creator of this process; 0 when it has none.
    pub fn parent(&self) -> ProcessId {
        self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: ProcessId) {
        self.parent = parent;
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn context(&self) -> &CpuState {
        &self.context
    }

    pub(crate) fn context_mut(&mut self) -> &mut CpuState {
        &mut self.context
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn user_stack(&self) -> VirtAddr {
        self.space.user_stack
    }

    /// Moves the user stack; the saved stack pointer follows.
    pub fn set_user_stack(&mut self, stack: VirtAddr) {
        self.space.user_stack = stack;
        self.context.rsp = stack.as_u64();
    }

    pub fn kernel_stack(&self) -> VirtAddr {
        self.space.kernel_stack
    }

    pub fn page_directory(&self) -> PhysAddr {
        self.space.page_directory
    }

    pub fn wait_target(&self) -> Option<ProcessId> {
        self.wait_target
    }

    /// Exit status delivered by the last process this one waited for.
    pub fn wait_result(&self) -> u64 {
        self.wait_result
    }

    /// Block until `target` exits.
    pub(crate) fn wait_for(&mut self, target: ProcessId) {
        self.wait_target = Some(target);
        self.state = ProcessState::Waiting;
    }

    /// Resolve a wait: store the exit status, make it the return value of the
    /// pending `WaitPID` and make the process runnable.
    pub(crate) fn deliver_exit(&mut self, status: u64) {
        self.wait_target = None;
        self.wait_result = status;
        self.context.set_result(status);
        self.state = ProcessState::Ready;
    }

    pub fn sleep_timer(&self) -> Option<SleepTimer> {
        self.sleep_timer
    }

    pub fn pending_wakeups(&self) -> usize {
        self.wakeups
    }

    /// Put the process to sleep unless a wakeup is already pending.
    ///
    /// A pending wakeup is consumed instead of sleeping, so a wakeup that
    /// arrives before the process blocks is never lost.
    pub fn sleep(&mut self, timer: SleepTimer) -> SleepOutcome {
        if self.wakeups > 0 {
            self.wakeups -= 1;
            return SleepOutcome::AlreadyWoken;
        }
        self.sleep_timer = Some(timer);
        self.state = ProcessState::Sleeping;
        SleepOutcome::WillSleep
    }

    /// Sleep until `deadline` regardless of pending wakeups.
    pub(crate) fn sleep_until(&mut self, deadline: TimerInfo) {
        self.sleep_timer = Some(SleepTimer::Until(deadline));
        self.state = ProcessState::Sleeping;
    }

    /// Wake a sleeping process, or remember the wakeup for its next sleep.
    pub fn wakeup(&mut self) {
        if self.state == ProcessState::Sleeping {
            self.sleep_timer = None;
            self.state = ProcessState::Ready;
        } else {
            self.wakeups += 1;
        }
    }

    /// Wake the process if its sleep deadline has been reached at `now`.
    pub(crate) fn check_sleep_timer(&mut self, now: &TimerInfo) -> bool {
        match self.sleep_timer {
            Some(SleepTimer::Until(deadline))
                if self.state == ProcessState::Sleeping && deadline.is_expired_at(now) =>
            {
                self.sleep_timer = None;
                self.state = ProcessState::Ready;
                true
            }
            _ => false,
        }
    }

    /// Queue `event` for the process and wake it up.
    ///
    /// Returns false if the event queue was full and the event was dropped.
    pub fn raise_event(&mut self, event: ProcessEvent) -> bool {
        let queued = self.events.push(event).is_ok();
        self.wakeup();
        queued
    }

    pub fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.pop()
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("state", &self.state)
            .field("user_stack", &self.space.user_stack)
            .field("kernel_stack", &self.space.kernel_stack)
            .field("wait_target", &self.wait_target)
            .field("sleep_timer", &self.sleep_timer)
            .field("wakeups", &self.wakeups)
            .finish()
    }
}

// src/syscalls.rs
use core::fmt;

use log::{debug, trace, warn};
use x86_64::VirtAddr;

use crate::error::{ApiError, ProcessError};
use crate::interrupts::{interrupt_notify, EventSource};
use crate::kernel::Kernel;
use crate::memory::UserMemory;
use crate::process::{CpuState, Process, ProcessId, ProcessState, SleepOutcome, SleepTimer};
use crate::timer::{Timer, TimerInfo};

/// Target identifier naming the calling process.
pub const SELF: u64 = 0;

/// ProcessCtl operation numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum OperationCode {
    Spawn = 0,
    KillPID = 1,
    GetPID = 2,
    GetParent = 3,
    WatchIRQ = 4,
    EnableIRQ = 5,
    DisableIRQ = 6,
    InfoPID = 7,
    WaitPID = 8,
    InfoTimer = 9,
    WaitTimer = 10,
    EnterSleep = 11,
    Schedule = 12,
    Resume = 13,
    SetStack = 14,
}

impl OperationCode {
    pub fn from_u64(raw: u64) -> Option<Self> {
        use OperationCode::*;
        let code = match raw {
            0 => Spawn,
            1 => KillPID,
            2 => GetPID,
            3 => GetParent,
            4 => WatchIRQ,
            5 => EnableIRQ,
            6 => DisableIRQ,
            7 => InfoPID,
            8 => WaitPID,
            9 => InfoTimer,
            10 => WaitTimer,
            11 => EnterSleep,
            12 => Schedule,
            13 => Resume,
            14 => SetStack,
            _ => return None,
        };
        Some(code)
    }

    /// Whether the target identifier is resolved before the operation runs.
    pub fn needs_target(self) -> bool {
        !matches!(self, OperationCode::Spawn | OperationCode::GetPID)
    }
}

impl fmt::Display for OperationCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OperationCode::Spawn => "Spawn",
            OperationCode::KillPID => "KillPID",
            OperationCode::GetPID => "GetPID",
            OperationCode::GetParent => "GetParent",
            OperationCode::WatchIRQ => "WatchIRQ",
            OperationCode::EnableIRQ => "EnableIRQ",
            OperationCode::DisableIRQ => "DisableIRQ",
            OperationCode::InfoPID => "InfoPID",
            OperationCode::WaitPID => "WaitPID",
            OperationCode::InfoTimer => "InfoTimer",
            OperationCode::WaitTimer => "WaitTimer",
            OperationCode::EnterSleep => "EnterSleep",
            OperationCode::Schedule => "Schedule",
            OperationCode::Resume => "Resume",
            OperationCode::SetStack => "SetStack",
        };
        f.write_str(name)
    }
}

/// Raw ProcessCtl arguments as trapped from user mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessCtlArgs {
    pub target: u64,    // rdi
    pub operation: u64, // rsi
    pub arg: u64,       // rdx
    pub output: u64,    // r10
}

impl ProcessCtlArgs {
    pub fn from_frame(frame: &CpuState) -> Self {
        let (target, operation, arg, output) = frame.syscall_args();
        Self {
            target,
            operation,
            arg,
            output,
        }
    }
}

/// A decoded ProcessCtl request, with its argument already validated and
/// any user-supplied record copied in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOperation {
    Spawn { entry: VirtAddr },
    KillPID { status: u64 },
    GetPID,
    GetParent,
    WatchIRQ { irq: u64 },
    EnableIRQ { irq: u64 },
    DisableIRQ { irq: u64 },
    InfoPID { buffer: u64 },
    WaitPID,
    InfoTimer { buffer: u64 },
    WaitTimer { deadline: TimerInfo },
    EnterSleep { deadline: Option<TimerInfo> },
    Schedule,
    Resume,
    SetStack { stack: VirtAddr },
}

impl ProcessOperation {
    pub fn decode(code: OperationCode, arg: u64, memory: &dyn UserMemory) -> Result<Self, ApiError> {
        let address = |raw: u64| VirtAddr::try_new(raw).map_err(|_| ApiError::InvalidArgument);
        let op = match code {
            OperationCode::Spawn => ProcessOperation::Spawn { entry: address(arg)? },
            OperationCode::KillPID => ProcessOperation::KillPID { status: arg },
            OperationCode::GetPID => ProcessOperation::GetPID,
            OperationCode::GetParent => ProcessOperation::GetParent,
            OperationCode::WatchIRQ => ProcessOperation::WatchIRQ { irq: arg },
            OperationCode::EnableIRQ => ProcessOperation::EnableIRQ { irq: arg },
            OperationCode::DisableIRQ => ProcessOperation::DisableIRQ { irq: arg },
            OperationCode::InfoPID => ProcessOperation::InfoPID { buffer: arg },
            OperationCode::WaitPID => ProcessOperation::WaitPID,
            OperationCode::InfoTimer => ProcessOperation::InfoTimer { buffer: arg },
            OperationCode::WaitTimer => ProcessOperation::WaitTimer {
                deadline: read_timer(memory, arg)?,
            },
            OperationCode::EnterSleep => ProcessOperation::EnterSleep {
                deadline: match arg {
                    0 => None,
                    addr => Some(read_timer(memory, addr)?),
                },
            },
            OperationCode::Schedule => ProcessOperation::Schedule,
            OperationCode::Resume => ProcessOperation::Resume,
            OperationCode::SetStack => ProcessOperation::SetStack { stack: address(arg)? },
        };
        Ok(op)
    }

    pub fn code(&self) -> OperationCode {
        match self {
            ProcessOperation::Spawn { .. } => OperationCode::Spawn,
            ProcessOperation::KillPID { .. } => OperationCode::KillPID,
            ProcessOperation::GetPID => OperationCode::GetPID,
            ProcessOperation::GetParent => OperationCode::GetParent,
            ProcessOperation::WatchIRQ { .. } => OperationCode::WatchIRQ,
            ProcessOperation::EnableIRQ { .. } => OperationCode::EnableIRQ,
            ProcessOperation::DisableIRQ { .. } => OperationCode::DisableIRQ,
            ProcessOperation::InfoPID { .. } => OperationCode::InfoPID,
            ProcessOperation::WaitPID => OperationCode::WaitPID,
            ProcessOperation::InfoTimer { .. } => OperationCode::InfoTimer,
            ProcessOperation::WaitTimer { .. } => OperationCode::WaitTimer,
            ProcessOperation::EnterSleep { .. } => OperationCode::EnterSleep,
            ProcessOperation::Schedule => OperationCode::Schedule,
            ProcessOperation::Resume => OperationCode::Resume,
            ProcessOperation::SetStack { .. } => OperationCode::SetStack,
        }
    }
}

impl fmt::Display for ProcessOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.code(), f)
    }
}

fn read_timer(memory: &dyn UserMemory, addr: u64) -> Result<TimerInfo, ApiError> {
    let mut words = [0u64; TimerInfo::WORDS];
    memory.read_words(addr, &mut words)?;
    Ok(TimerInfo::from_words(words))
}

/// Record written to user memory by `InfoPID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub state: ProcessState,
    pub user_stack: u64,
    pub kernel_stack: u64,
    pub page_directory: u64,
    pub parent: ProcessId,
}

impl ProcessInfo {
    /// Number of machine words the record occupies in user memory.
    pub const WORDS: usize = 6;

    pub fn to_words(&self) -> [u64; Self::WORDS] {
        [
            self.id.as_u64(),
            self.state as u64,
            self.user_stack,
            self.kernel_stack,
            self.page_directory,
            self.parent.as_u64(),
        ]
    }

    pub fn from_words(words: [u64; Self::WORDS]) -> Option<Self> {
        Some(Self {
            id: ProcessId::new(words[0]),
            state: ProcessState::from_u64(words[1])?,
            user_stack: words[2],
            kernel_stack: words[3],
            page_directory: words[4],
            parent: ProcessId::new(words[5]),
        })
    }
}

impl From<&Process> for ProcessInfo {
    fn from(process: &Process) -> Self {
        Self {
            id: process.id(),
            state: process.state(),
            user_stack: process.user_stack().as_u64(),
            kernel_stack: process.kernel_stack().as_u64(),
            page_directory: process.page_directory().as_u64(),
            parent: process.parent(),
        }
    }
}

/// Outcome of a ProcessCtl call: a value, or one of [`ApiError`].
pub type ApiResult = Result<u64, ApiError>;

/// Convert a result to the word returned in `rax`.
pub fn encode_result(result: ApiResult) -> u64 {
    match result {
        Ok(value) => value,
        Err(err) => err.code(),
    }
}

/// Interpret a returned word. Values that collide with an error code read
/// as that error.
pub fn decode_result(raw: u64) -> ApiResult {
    match ApiError::from_code(raw) {
        Some(err) => Err(err),
        None => Ok(raw),
    }
}

/// When the caller's result becomes available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Result is known now.
    Ready(ApiResult),
    /// The caller is blocked; its result is stored when it is resumed.
    Deferred,
}

impl Kernel {
    /// Handle a ProcessCtl trap taken by the current process.
    ///
    /// The result lands in the caller's `rax`: in `frame` when the caller
    /// still owns the CPU afterwards, in its saved context otherwise.
    pub fn syscall(&mut self, frame: &mut CpuState) {
        let caller = self.procs.current().id();
        let args = ProcessCtlArgs::from_frame(frame);

        if let Completion::Ready(result) = self.process_ctl(args, frame) {
            let value = encode_result(result);
            if self.procs.current_id() == Some(caller) {
                frame.set_result(value);
            } else if let Some(process) = self.procs.get_mut(caller) {
                process.context_mut().set_result(value);
            }
        }
    }

    /// Dispatch one ProcessCtl request on behalf of the current process.
    ///
    /// Operations either complete or fail without side effects. Those that
    /// end in a scheduling decision leave `frame` holding the next process.
    pub fn process_ctl(&mut self, args: ProcessCtlArgs, frame: &mut CpuState) -> Completion {
        let caller = self.procs.current().id();

        let code = match OperationCode::from_u64(args.operation) {
            Some(code) => code,
            None => {
                warn!("#{} unknown ProcessCtl operation {}", caller, args.operation);
                return Completion::Ready(Err(ApiError::InvalidArgument));
            }
        };
        debug!("#{} {} -> {} ({:#x})", caller, code, args.target, args.arg);

        let target = if code.needs_target() {
            match self.resolve_target(caller, args.target) {
                Ok(id) => id,
                Err(err) => return self.failed(caller, code, err),
            }
        } else {
            caller
        };

        let op = match ProcessOperation::decode(code, args.arg, self.memory.as_ref()) {
            Ok(op) => op,
            Err(err) => return self.failed(caller, code, err),
        };

        match self.execute(caller, target, op, frame) {
            Completion::Ready(Err(err)) => self.failed(caller, code, err),
            done => done,
        }
    }

    fn failed(&self, caller: ProcessId, code: OperationCode, err: ApiError) -> Completion {
        debug!("#{} {} failed: {}", caller, code, err);
        Completion::Ready(Err(err))
    }

    fn resolve_target(&self, caller: ProcessId, raw: u64) -> Result<ProcessId, ApiError> {
        if raw == SELF {
            return Ok(caller);
        }
        let id = ProcessId::new(raw);
        match self.procs.get(id) {
            Some(_) => Ok(id),
            None => Err(ApiError::NotFound),
        }
    }

    fn target_mut(&mut self, id: ProcessId) -> Result<&mut Process, ApiError> {
        self.procs.get_mut(id).ok_or(ApiError::NotFound)
    }

    fn execute(
        &mut self,
        caller: ProcessId,
        target: ProcessId,
        op: ProcessOperation,
        frame: &mut CpuState,
    ) -> Completion {
        let result = match op {
            ProcessOperation::Spawn { entry } => self.spawn(caller, entry),
            ProcessOperation::KillPID { status } => self.kill(target, status, frame),
            ProcessOperation::GetPID => Ok(caller.as_u64()),
            ProcessOperation::GetParent => Ok(self.procs.current().parent().as_u64()),
            ProcessOperation::WatchIRQ { irq } => self.watch_irq(target, irq),
            ProcessOperation::EnableIRQ { irq } => {
                self.interrupts.lock().enable(irq).map(|_| 0).map_err(ApiError::from)
            }
            ProcessOperation::DisableIRQ { irq } => {
                self.interrupts.lock().disable(irq).map(|_| 0).map_err(ApiError::from)
            }
            ProcessOperation::InfoPID { buffer } => self.info_pid(target, buffer),
            ProcessOperation::WaitPID => return self.wait_pid(caller, target, frame),
            ProcessOperation::InfoTimer { buffer } => self.info_timer(buffer),
            ProcessOperation::WaitTimer { deadline } => self.wait_timer(deadline, frame),
            ProcessOperation::EnterSleep { deadline } => self.enter_sleep(deadline, frame),
            ProcessOperation::Schedule => {
                self.procs.schedule(frame);
                Ok(0)
            }
            ProcessOperation::Resume => self.target_mut(target).map(|process| {
                process.wakeup();
                0
            }),
            ProcessOperation::SetStack { stack } => self.set_stack(caller, target, stack, frame),
        };
        Completion::Ready(result)
    }

    fn spawn(&mut self, caller: ProcessId, entry: VirtAddr) -> ApiResult {
        let map = *self.procs.memory_map();
        let child = self.procs.create(entry, &map)?;
        child.set_parent(caller);
        Ok(child.id().as_u64())
    }

    fn kill(&mut self, target: ProcessId, status: u64, frame: &mut CpuState) -> ApiResult {
        self.procs.remove(target, status)?;
        self.interrupts.lock().unhook_owner(target);
        self.procs.schedule(frame);
        Ok(0)
    }

    fn watch_irq(&mut self, target: ProcessId, irq: u64) -> ApiResult {
        let source = EventSource::Process {
            id: target,
            inbox: self.procs.inbox(),
        };
        self.interrupts.lock().hook(irq, interrupt_notify, source)?;
        Ok(0)
    }

    fn info_pid(&mut self, target: ProcessId, buffer: u64) -> ApiResult {
        let info = match self.procs.get(target) {
            Some(process) => ProcessInfo::from(process),
            None => return Err(ApiError::NotFound),
        };
        self.memory.write_words(buffer, &info.to_words())?;
        Ok(0)
    }

    fn wait_pid(&mut self, caller: ProcessId, target: ProcessId, frame: &mut CpuState) -> Completion {
        if caller == target {
            return Completion::Ready(Err(ProcessError::WaitOnSelf.into()));
        }
        self.procs.current_mut().wait_for(target);
        self.procs.schedule(frame);
        Completion::Deferred
    }

    fn info_timer(&mut self, buffer: u64) -> ApiResult {
        let now = match &self.timer {
            Some(timer) => timer.current(),
            None => return Err(ApiError::NotFound),
        };
        self.memory.write_words(buffer, &now.to_words())?;
        Ok(0)
    }

    /// Whether `deadline` has passed, or `NotFound` without a timer service.
    fn deadline_passed(&self, deadline: &TimerInfo) -> Result<bool, ApiError> {
        match &self.timer {
            Some(timer) => Ok(timer.is_expired(deadline)),
            None => Err(ApiError::NotFound),
        }
    }

    fn wait_timer(&mut self, deadline: TimerInfo, frame: &mut CpuState) -> ApiResult {
        if self.deadline_passed(&deadline)? {
            return Ok(0);
        }
        self.procs.current_mut().sleep_until(deadline);
        self.procs.schedule(frame);
        Ok(0)
    }

    fn enter_sleep(&mut self, deadline: Option<TimerInfo>, frame: &mut CpuState) -> ApiResult {
        let timer = match deadline {
            Some(deadline) => {
                if self.deadline_passed(&deadline)? {
                    return Ok(0);
                }
                SleepTimer::Until(deadline)
            }
            None => SleepTimer::Indefinite,
        };
        match self.procs.current_mut().sleep(timer) {
            SleepOutcome::AlreadyWoken => trace!("Pending wakeup consumed, not sleeping"),
            SleepOutcome::WillSleep => {
                self.procs.schedule(frame);
            }
        }
        Ok(0)
    }

    fn set_stack(
        &mut self,
        caller: ProcessId,
        target: ProcessId,
        stack: VirtAddr,
        frame: &mut CpuState,
    ) -> ApiResult {
        self.target_mut(target)?.set_user_stack(stack);
        if target == caller {
            frame.rsp = stack.as_u64();
        }
        Ok(0)
    }
}

// Error types for process management and the ProcessCtl interface
use core::fmt;

use crate::process::ProcessId;

/// Process management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// No process with this identifier is registered.
    ProcessNotFound(ProcessId),
    /// Every identifier up to the configured limit is taken.
    OutOfProcesses,
    /// Stacks or a page directory could not be allocated.
    InsufficientMemory,
    /// A process may not wait for its own termination.
    WaitOnSelf,
    /// The address is not a canonical virtual address.
    InvalidAddress(u64),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessError::ProcessNotFound(id) => write!(f, "process {} not found", id),
            ProcessError::OutOfProcesses => write!(f, "no free process identifier"),
            ProcessError::InsufficientMemory => write!(f, "out of memory for process resources"),
            ProcessError::WaitOnSelf => write!(f, "process cannot wait for itself"),
            ProcessError::InvalidAddress(addr) => write!(f, "invalid address 0x{:x}", addr),
        }
    }
}

/// Interrupt controller errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// The line is outside the range the controller manages.
    InvalidIrq(u64),
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IrqError::InvalidIrq(irq) => write!(f, "invalid IRQ line {}", irq),
        }
    }
}

/// A copy between kernel and user memory was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFault {
    /// Null, misaligned, or outside the user half of the address space.
    BadAddress(u64),
    /// The buffer would wrap past the end of the address space.
    Overflow(u64),
}

impl fmt::Display for MemoryFault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryFault::BadAddress(addr) => write!(f, "bad user address 0x{:x}", addr),
            MemoryFault::Overflow(addr) => write!(f, "user buffer at 0x{:x} overflows", addr),
        }
    }
}

/// Result kinds visible across the system call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    /// The target process or the timer service does not exist.
    NotFound,
    /// Malformed operation, argument or user buffer.
    InvalidArgument,
    /// Process creation ran out of identifiers or memory.
    OutOfMemory,
}

impl ApiError {
    /// Raw result word for this error. Errors occupy the top of the word
    /// range, read as small negative numbers.
    pub const fn code(self) -> u64 {
        match self {
            ApiError::NotFound => -1i64 as u64,
            ApiError::InvalidArgument => -2i64 as u64,
            ApiError::OutOfMemory => -3i64 as u64,
        }
    }

    pub const fn from_code(code: u64) -> Option<Self> {
        match code as i64 {
            -1 => Some(ApiError::NotFound),
            -2 => Some(ApiError::InvalidArgument),
            -3 => Some(ApiError::OutOfMemory),
            _ => None,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApiError::NotFound => write!(f, "Not found"),
            ApiError::InvalidArgument => write!(f, "Invalid argument"),
            ApiError::OutOfMemory => write!(f, "Out of memory"),
        }
    }
}

impl From<ProcessError> for ApiError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::ProcessNotFound(_) => ApiError::NotFound,
            ProcessError::OutOfProcesses | ProcessError::InsufficientMemory => ApiError::OutOfMemory,
            ProcessError::WaitOnSelf | ProcessError::InvalidAddress(_) => ApiError::InvalidArgument,
        }
    }
}

impl From<IrqError> for ApiError {
    fn from(_: IrqError) -> Self {
        ApiError::InvalidArgument
    }
}

impl From<MemoryFault> for ApiError {
    fn from(_: MemoryFault) -> Self {
        ApiError::InvalidArgument
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip() {
        for err in [ApiError::NotFound, ApiError::InvalidArgument, ApiError::OutOfMemory] {
            assert_eq!(ApiError::from_code(err.code()), Some(err));
        }
        assert_eq!(ApiError::from_code(0), None);
        assert_eq!(ApiError::from_code(42), None);
    }

    #[test]
    fn process_errors_map_to_api_kinds() {
        assert_eq!(ApiError::from(ProcessError::ProcessNotFound(ProcessId::new(3))), ApiError::NotFound);
        assert_eq!(ApiError::from(ProcessError::OutOfProcesses), ApiError::OutOfMemory);
        assert_eq!(ApiError::from(ProcessError::WaitOnSelf), ApiError::InvalidArgument);
        assert_eq!(ApiError::from(IrqError::InvalidIrq(300)), ApiError::InvalidArgument);
        assert_eq!(ApiError::from(MemoryFault::BadAddress(0)), ApiError::InvalidArgument);
    }
}

// Process control core for the kproc microkernel
//
// Owns the process lifecycle (spawn, schedule, sleep, wait, kill), the
// timer and interrupt glue it depends on, and the ProcessCtl system call
// through which user mode drives all of it.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod interrupts;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod process;
pub mod syscalls;
pub mod timer;


pub use config::KernelConfig;
pub use error::{ApiError, ProcessError};
pub use kernel::{Kernel, Platform};
pub use process::{Process, ProcessId, ProcessManager, ProcessState};
pub use syscalls::{ApiResult, ProcessOperation, SELF};

// Copying ProcessCtl records in and out of user memory
use core::mem::size_of;

use crate::error::MemoryFault;

/// First address above the canonical lower half used by user mode.
pub const USER_CANONICAL_END: u64 = 0x0000_8000_0000_0000;

const WORD: u64 = size_of::<u64>() as u64;

/// Check that `words` machine words at `addr` lie inside user memory.
///
/// The buffer must be non-null, word aligned, and end at or below
/// [`USER_CANONICAL_END`]. An empty buffer is always accepted.
pub fn validate_user_buffer(addr: u64, words: usize) -> Result<(), MemoryFault> {
    if words == 0 {
        return Ok(());
    }
    if addr == 0 || addr % WORD != 0 {
        return Err(MemoryFault::BadAddress(addr));
    }
    let end = (words as u64)
        .checked_mul(WORD)
        .and_then(|len| addr.checked_add(len))
        .ok_or(MemoryFault::Overflow(addr))?;
    if addr >= USER_CANONICAL_END || end > USER_CANONICAL_END {
        return Err(MemoryFault::BadAddress(addr));
    }
    Ok(())
}

/// Word-granular access to the calling process's memory.
///
/// The dispatcher never keeps a reference into user memory: records are
/// copied in before an operation runs and copied out before it returns.
pub trait UserMemory: Send {
    fn read_words(&self, addr: u64, out: &mut [u64]) -> Result<(), MemoryFault>;

    fn write_words(&mut self, addr: u64, words: &[u64]) -> Result<(), MemoryFault>;
}

/// Accesses user buffers in the currently active address space.
#[derive(Debug, Default)]
pub struct DirectMemory;

impl UserMemory for DirectMemory {
    fn read_words(&self, addr: u64, out: &mut [u64]) -> Result<(), MemoryFault> {
        validate_user_buffer(addr, out.len())?;
        let src = addr as *const u64;
        for (i, word) in out.iter_mut().enumerate() {
            // SAFETY: the range was validated as aligned user memory.
            *word = unsafe { core::ptr::read_volatile(src.add(i)) };
        }
        Ok(())
    }

    fn write_words(&mut self, addr: u64, words: &[u64]) -> Result<(), MemoryFault> {
        validate_user_buffer(addr, words.len())?;
        let dst = addr as *mut u64;
        for (i, word) in words.iter().enumerate() {
            // SAFETY: the range was validated as aligned user memory.
            unsafe { core::ptr::write_volatile(dst.add(i), *word) };
        }
        Ok(())
    }
}

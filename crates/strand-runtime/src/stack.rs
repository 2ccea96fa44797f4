//! Coroutine stacks backed by mmap
//!
//! Each stack is an anonymous private mapping with a PROT_NONE guard page at
//! the low end, so overflow faults instead of corrupting a neighbor.

use strand_core::constants::GUARD_SIZE;
use strand_core::error::StackError;

/// Smallest stack we will hand out; anything below this cannot hold the
/// entry trampoline frame plus a useful call chain.
const MIN_STACK_SIZE: usize = 4 * 4096;

/// An owned, guard-paged coroutine stack.
pub struct Stack {
    base: *mut u8,
    total: usize,
}

// The mapping is owned exclusively and only ever executed on by the
// coroutine the runtime is currently running.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a new stack of `size` usable bytes (plus one guard page).
    pub fn new(size: usize) -> Result<Self, StackError> {
        if size < MIN_STACK_SIZE {
            return Err(StackError::TooSmall(size));
        }

        let total = size + GUARD_SIZE;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::AllocationFailed(errno()));
        }

        // Guard page at the low end; a downward-growing overflow hits it
        let rt = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if rt != 0 {
            let e = errno();
            unsafe { libc::munmap(base, total) };
            return Err(StackError::ProtectionFailed(e));
        }

        Ok(Stack {
            base: base as *mut u8,
            total,
        })
    }

    /// High end of the usable region (stacks grow downward).
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes (excluding the guard page).
    #[inline]
    pub fn size(&self) -> usize {
        self.total - GUARD_SIZE
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_alloc_and_top() {
        let stack = Stack::new(128 * 1024).unwrap();
        assert_eq!(stack.size(), 128 * 1024);
        assert!(!stack.top().is_null());
        // Top must sit above the base by the full mapping
        assert_eq!(stack.top() as usize % 8, 0);
    }

    #[test]
    fn test_stack_too_small() {
        assert!(matches!(Stack::new(1024), Err(StackError::TooSmall(1024))));
    }
}

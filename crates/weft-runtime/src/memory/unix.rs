//! Unix stack implementation using mmap

use super::{round_to_pages, Stack};
use std::sync::OnceLock;
use weft_core::constants::PAGE_SIZE;
use weft_core::{kwarn, FiberError};

/// System page size, falling back to the compile-time constant
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret > 0 { ret as usize } else { PAGE_SIZE }
    })
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const STACK_FLAGS: libc::c_int =
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK;
    } else {
        const STACK_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;
    }
}

impl Stack {
    /// Map a new stack with at least `size` usable bytes
    ///
    /// The size is rounded up to whole pages and a guard page is mapped
    /// below it. Pages are only backed by memory once touched.
    pub fn new(size: usize) -> Result<Stack, FiberError> {
        let usable = round_to_pages(size);
        let mapped = usable
            .checked_add(Self::guard_size())
            .ok_or(FiberError::StackAllocation(libc::ENOMEM))?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                STACK_FLAGS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(FiberError::StackAllocation(errno()));
        }

        // Guard page stays inaccessible; overflow faults here
        let ret = unsafe { libc::mprotect(base, Self::guard_size(), libc::PROT_NONE) };
        if ret != 0 {
            let err = errno();
            unsafe { libc::munmap(base, mapped) };
            return Err(FiberError::StackAllocation(err));
        }

        Ok(Stack { base: base as *mut u8, mapped, usable })
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.mapped) };
        if ret != 0 {
            kwarn!("munmap of fiber stack {:p} failed: errno {}", self.base, errno());
        }
    }
}

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::ENOMEM)
}

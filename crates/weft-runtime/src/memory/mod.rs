//! Fiber stack memory
//!
//! Each stackful fiber owns one `Stack`: an anonymous mapping with a
//! PROT_NONE guard page at the low end, so running off the bottom faults
//! instead of scribbling over a neighbour.
//!
//! Platform-specific implementations do the actual mapping.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::page_size;
    }
}

use weft_core::constants::GUARD_PAGES;

/// Round `size` up to a whole number of pages
#[inline]
pub fn round_to_pages(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page).max(1) * page
}

/// A mapped fiber stack
///
/// Layout (low to high): `[guard pages][usable stack]`. The stack grows
/// down from `top()`.
pub struct Stack {
    /// Start of the mapping (first guard page)
    base: *mut u8,

    /// Length of the whole mapping, guard included
    mapped: usize,

    /// Usable bytes above the guard
    usable: usize,
}

// Safety: the mapping is owned exclusively by this value; the raw pointer
// is only an address.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Number of guard bytes below the usable stack
    #[inline]
    pub fn guard_size() -> usize {
        GUARD_PAGES * page_size()
    }

    /// Usable size in bytes (page-rounded)
    #[inline]
    pub fn size(&self) -> usize {
        self.usable
    }

    /// Lowest usable address
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        // Safety: guard_size() < mapped
        unsafe { self.base.add(self.mapped - self.usable) }
    }

    /// One past the highest usable address; initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        // Safety: stays within (one past) the mapping
        unsafe { self.base.add(self.mapped) }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("size", &self.usable)
            .finish()
    }
}

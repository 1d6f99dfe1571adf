//! aarch64 context switching
//!
//! AAPCS64 callee-saved state: sp, x19-x28, fp (x29), lr (x30) and the low
//! halves of v8-v15. `switch` returns through lr, so a prepared context
//! simply puts the trampoline there.

use super::EntryFn;
use std::arch::naked_asm;

/// Saved register set of a suspended execution context
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub sp: u64,       // 0
    pub x: [u64; 10],  // 8: x19..x28
    pub fp: u64,       // 88
    pub lr: u64,       // 96
    pub d: [u64; 8],   // 104: d8..d15
}

impl Context {
    /// An empty context. Only valid as the `from` side of a switch.
    pub const fn new() -> Self {
        Context { sp: 0, x: [0; 10], fp: 0, lr: 0, d: [0; 8] }
    }

    /// Make this context start at `entry(arg)` on the stack ending at `stack_top`
    ///
    /// # Safety
    ///
    /// `stack_top` must be the (exclusive) upper end of a writable stack
    /// that outlives every switch into this context.
    pub unsafe fn prepare(&mut self, stack_top: *mut u8, entry: EntryFn, arg: usize) {
        *self = Context::new();
        self.sp = ((stack_top as usize) & !0xF) as u64;
        self.lr = entry_trampoline as usize as u64;
        self.x[0] = entry as usize as u64; // x19
        self.x[1] = arg as u64; // x20
    }
}

/// First instruction of every fresh context
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        // entry functions never return
        "brk #0",
    );
}

/// Save the running context into `from` and continue in `to`
///
/// # Safety
///
/// Same contract as the x86_64 backend.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        // Save into from (x0)
        "mov x9, sp",
        "str x9, [x0, #0]",
        "stp x19, x20, [x0, #8]",
        "stp x21, x22, [x0, #24]",
        "stp x23, x24, [x0, #40]",
        "stp x25, x26, [x0, #56]",
        "stp x27, x28, [x0, #72]",
        "stp x29, x30, [x0, #88]",
        "stp d8, d9, [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        // Load from to (x1)
        "ldr x9, [x1, #0]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #8]",
        "ldp x21, x22, [x1, #24]",
        "ldp x23, x24, [x1, #40]",
        "ldp x25, x26, [x1, #56]",
        "ldp x27, x28, [x1, #72]",
        "ldp x29, x30, [x1, #88]",
        "ldp d8, d9, [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        "ret",
    );
}

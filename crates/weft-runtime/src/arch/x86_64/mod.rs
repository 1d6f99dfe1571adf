//! x86_64 context switching
//!
//! System V AMD64: only rsp, rbx, rbp and r12-r15 survive a call, so that
//! is all a voluntary switch has to carry. rip is stored as the resume
//! label inside `switch`.

use super::EntryFn;
use std::arch::naked_asm;

/// Saved register set of a suspended execution context
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    /// An empty context. Only valid as the `from` side of a switch.
    pub const fn new() -> Self {
        Context { rsp: 0, rip: 0, rbx: 0, rbp: 0, r12: 0, r13: 0, r14: 0, r15: 0 }
    }

    /// Make this context start at `entry(arg)` on the stack ending at `stack_top`
    ///
    /// # Safety
    ///
    /// `stack_top` must be the (exclusive) upper end of a writable stack
    /// that outlives every switch into this context.
    pub unsafe fn prepare(&mut self, stack_top: *mut u8, entry: EntryFn, arg: usize) {
        // rsp is 16-aligned when the trampoline's `call` executes, so the
        // entry function sees the usual rsp % 16 == 8 on its first instruction
        let sp = (stack_top as usize) & !0xF;

        *self = Context::new();
        self.rsp = sp as u64;
        self.rip = entry_trampoline as usize as u64;
        self.r12 = entry as usize as u64;
        self.r13 = arg as u64;
    }
}

/// First instruction of every fresh context
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // entry functions never return
        "ud2",
    );
}

/// Save the running context into `from` and continue in `to`
///
/// Returns when something later switches back into `from`.
///
/// # Safety
///
/// `from` must be writable. `to` must hold a context saved by an earlier
/// switch or set up by `Context::prepare`, and its stack must still be
/// mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        // Save callee-saved registers to from (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from to (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point of a saved context
        "1:",
        "ret",
    );
}

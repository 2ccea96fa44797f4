//! x86_64 context switching implementation
//!
//! Uses inline assembly for the voluntary context switch.
//! Stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved register state of a suspended coroutine.
///
/// The assembly below addresses fields by byte offset, so the layout is
/// load-bearing: rsp at 0x00, rip at 0x08, then rbx, rbp, r12-r15.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedContext {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl SavedContext {
    pub const fn zeroed() -> Self {
        SavedContext {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Initialize a fresh coroutine context.
///
/// Sets up the stack so that the first switch to `regs` begins execution in
/// the entry trampoline, which calls `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `regs` must point to valid `SavedContext` memory and `stack_top` must be
/// the high end of a mapped stack region.
#[inline]
pub unsafe fn init_context(
    regs: *mut SavedContext,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // System V AMD64: rsp must be 16-byte aligned before a call. The
    // trampoline starts with an aligned stack, and its `call` gives the
    // entry function the return-address offset the ABI expects.
    let sp = stack_top as usize;
    let aligned_sp = sp & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Trampoline that calls the entry function with its argument.
///
/// The entry function performs the final switch back to its resumer and
/// never returns; `ud2` traps if it somehow does.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2");
}

/// Perform a voluntary context switch.
///
/// Saves callee-saved registers to `old_regs` and loads from `new_regs`.
/// Returns (to the saved resume point) when something later switches back
/// to `old_regs`.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(
    _old_regs: *mut SavedContext,
    _new_regs: *const SavedContext,
) {
    naked_asm!(
        // Save callee-saved registers to old_regs (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new_regs (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}

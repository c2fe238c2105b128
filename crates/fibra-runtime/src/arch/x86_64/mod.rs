//! x86_64 context switching
//!
//! Only the System V callee-saved registers are switched. The switch is a
//! regular function call, so the caller has already spilled everything else.

use super::EntryFn;
use std::arch::naked_asm;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedContext {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Prime `ctx` so that switching to it calls `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `ctx` must be valid for writes and `stack_top` must be the exclusive
/// upper end of a mapped stack.
#[inline]
pub unsafe fn init_context(ctx: *mut SavedContext, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // The trampoline `call`s the entry, which pushes the return address and
    // leaves rsp at 8 mod 16 on entry as the ABI requires.
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    *ctx = SavedContext::default();
    ctx.rsp = sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.r12 = entry as usize as u64;
    ctx.r13 = arg as u64;
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // entry is `-> !`
        "ud2",
    );
}

/// Save callee-saved registers into `save` and resume `load`.
///
/// Returns when some other switch loads `save` again.
///
/// # Safety
///
/// `load` must hold a context primed by `init_context` or saved by a
/// previous switch whose stack is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut SavedContext, _load: *const SavedContext) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        "1:",
        "ret",
    );
}

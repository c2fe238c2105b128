//! aarch64 context switching
//!
//! AAPCS64 callee-saved set: x19-x28, fp (x29), lr (x30), sp and the low
//! halves of v8-v15.

use super::EntryFn;
use std::arch::naked_asm;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedContext {
    pub sp: u64,        // 0
    pub lr: u64,        // 8
    pub x19_x28: [u64; 10], // 16..96
    pub fp: u64,        // 96
    pub d8_d15: [u64; 8], // 104..168
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
    let ctx = &mut *ctx;
    *ctx = SavedContext::default();
    ctx.sp = ((stack_top as usize) & !0xF) as u64;
    ctx.lr = fiber_trampoline as usize as u64;
    ctx.x19_x28[0] = entry as usize as u64;
    ctx.x19_x28[1] = arg as u64;
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "brk #1",
    );
}

/// Save callee-saved registers into `save` and resume `load`.
///
/// # Safety
///
/// `load` must hold a context primed by `init_context` or saved by a
/// previous switch whose stack is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut SavedContext, _load: *const SavedContext) {
    naked_asm!(
        "mov x9, sp",
        "str x9, [x0, #0]",
        "str x30, [x0, #8]",
        "stp x19, x20, [x0, #16]",
        "stp x21, x22, [x0, #32]",
        "stp x23, x24, [x0, #48]",
        "stp x25, x26, [x0, #64]",
        "stp x27, x28, [x0, #80]",
        "str x29, [x0, #96]",
        "stp d8, d9, [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        "ldr x9, [x1, #0]",
        "mov sp, x9",
        "ldr x30, [x1, #8]",
        "ldp x19, x20, [x1, #16]",
        "ldp x21, x22, [x1, #32]",
        "ldp x23, x24, [x1, #48]",
        "ldp x25, x26, [x1, #64]",
        "ldp x27, x28, [x1, #80]",
        "ldr x29, [x1, #96]",
        "ldp d8, d9, [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        "ret",
    );
}

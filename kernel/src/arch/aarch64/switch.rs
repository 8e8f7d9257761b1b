//! Context-switch primitives and the user-mode signal wrapper page.

use core::arch::{asm, global_asm};

use crate::arch::context::CpuContext;

global_asm!(
    r#"
// void cpu_switch_to(CpuContext *prev /* x0 */, const CpuContext *next /* x1 */)
//
// Field offsets: x19..x28 at 0..72, fp 80, lr 88, sp 96, pgd 104.
.global cpu_switch_to
cpu_switch_to:
    stp     x19, x20, [x0, #0]
    stp     x21, x22, [x0, #16]
    stp     x23, x24, [x0, #32]
    stp     x25, x26, [x0, #48]
    stp     x27, x28, [x0, #64]
    stp     x29, x30, [x0, #80]
    mov     x9, sp
    str     x9, [x0, #96]

    ldp     x19, x20, [x1, #0]
    ldp     x21, x22, [x1, #16]
    ldp     x23, x24, [x1, #32]
    ldp     x25, x26, [x1, #48]
    ldp     x27, x28, [x1, #64]
    ldp     x29, x30, [x1, #80]
    ldr     x9, [x1, #96]
    mov     sp, x9

    // Switch the user address space.
    ldr     x9, [x1, #104]
    dsb     ish
    msr     ttbr0_el1, x9
    tlbi    vmalle1is
    dsb     ish
    isb
    ret

// void store_context(CpuContext *ctx /* x0 */)
//
// The stored lr points past this call: restoring the context makes the
// caller return a second time.
.global store_context
store_context:
    stp     x19, x20, [x0, #0]
    stp     x21, x22, [x0, #16]
    stp     x23, x24, [x0, #32]
    stp     x25, x26, [x0, #48]
    stp     x27, x28, [x0, #64]
    stp     x29, x30, [x0, #80]
    mov     x9, sp
    str     x9, [x0, #96]
    ret

// void load_context(const CpuContext *ctx /* x0 */)
.global load_context
load_context:
    ldp     x19, x20, [x0, #0]
    ldp     x21, x22, [x0, #16]
    ldp     x23, x24, [x0, #32]
    ldp     x25, x26, [x0, #48]
    ldp     x27, x28, [x0, #64]
    ldp     x29, x30, [x0, #80]
    ldr     x9, [x0, #96]
    mov     sp, x9
    ret

// User-visible signal wrapper. Mapped read-only + executable at a fixed
// user VA; runs the handler in x0, then requests signal_return (svc 50).
.section .text
.align 12
.global __signal_wrapper
__signal_wrapper:
    blr     x0
    mov     x8, #50
    svc     #0
1:  b       1b
"#
);

extern "C" {
    static __signal_wrapper: u8;
}

/// Link-time address of the signal wrapper page (kernel virtual).
pub fn signal_wrapper_addr() -> usize {
    // SAFETY: the symbol is defined by the assembly above; only its address
    // is taken.
    unsafe { &__signal_wrapper as *const u8 as usize }
}

/// Enter EL0 for the first time on this thread.
///
/// # Safety
/// `ctx` must describe a fully built user address space (`pgd`, user `sp`,
/// entry point in `lr`) and `kernel_sp` must be the top of this thread's
/// kernel stack. Does not return.
pub unsafe fn enter_user_space(ctx: &CpuContext, kernel_sp: u64) -> ! {
    // SAFETY: caller contract; interrupts become enabled in EL0 because
    // spsr is cleared.
    unsafe {
        asm!(
            "msr elr_el1, {entry}",
            "msr spsr_el1, xzr",
            "msr sp_el0, {user_sp}",
            "mov sp, {kernel_sp}",
            "dsb ish",
            "msr ttbr0_el1, {pgd}",
            "tlbi vmalle1is",
            "dsb ish",
            "isb",
            "eret",
            entry = in(reg) ctx.lr,
            user_sp = in(reg) ctx.sp,
            kernel_sp = in(reg) kernel_sp,
            pgd = in(reg) ctx.pgd,
            options(noreturn),
        )
    }
}

/// Return to EL0 at `pc` with `x0 = arg`, keeping the given user stack and
/// program status. Used to run a registered signal handler through the
/// wrapper page.
///
/// # Safety
/// `pc` must be mapped executable in the current user address space.
pub unsafe fn eret_to_user(pc: u64, user_sp: u64, spsr: u64, arg: u64) -> ! {
    // SAFETY: caller contract.
    unsafe {
        asm!(
            "msr elr_el1, {pc}",
            "msr sp_el0, {sp}",
            "msr spsr_el1, {spsr}",
            "mov x0, {arg}",
            "eret",
            pc = in(reg) pc,
            sp = in(reg) user_sp,
            spsr = in(reg) spsr,
            arg = in(reg) arg,
            options(noreturn),
        )
    }
}

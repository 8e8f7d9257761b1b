//! EL1 exception vector table.
//!
//! Every vector saves the full register file into a [`Trapframe`] on the
//! kernel stack and calls one of the Rust routers:
//! `el0_sync_router` (syscalls and user faults), `el1_sync_router` (faults
//! taken while the kernel touches user memory), `irq_router`, and
//! `invalid_exception_router`.
//!
//! [`Trapframe`]: crate::arch::trap::Trapframe

use core::arch::global_asm;

global_asm!(
    r#"
// Build a 272-byte trapframe: x0-x30, spsr_el1, elr_el1, sp_el0.
.macro kernel_entry
    sub     sp, sp, #272
    stp     x0, x1, [sp, #0]
    stp     x2, x3, [sp, #16]
    stp     x4, x5, [sp, #32]
    stp     x6, x7, [sp, #48]
    stp     x8, x9, [sp, #64]
    stp     x10, x11, [sp, #80]
    stp     x12, x13, [sp, #96]
    stp     x14, x15, [sp, #112]
    stp     x16, x17, [sp, #128]
    stp     x18, x19, [sp, #144]
    stp     x20, x21, [sp, #160]
    stp     x22, x23, [sp, #176]
    stp     x24, x25, [sp, #192]
    stp     x26, x27, [sp, #208]
    stp     x28, x29, [sp, #224]
    str     x30, [sp, #240]
    mrs     x10, spsr_el1
    mrs     x11, elr_el1
    mrs     x12, sp_el0
    stp     x10, x11, [sp, #248]
    str     x12, [sp, #264]
.endm

.macro kernel_exit
    ldp     x10, x11, [sp, #248]
    ldr     x12, [sp, #264]
    msr     spsr_el1, x10
    msr     elr_el1, x11
    msr     sp_el0, x12
    ldp     x0, x1, [sp, #0]
    ldp     x2, x3, [sp, #16]
    ldp     x4, x5, [sp, #32]
    ldp     x6, x7, [sp, #48]
    ldp     x8, x9, [sp, #64]
    ldp     x10, x11, [sp, #80]
    ldp     x12, x13, [sp, #96]
    ldp     x14, x15, [sp, #112]
    ldp     x16, x17, [sp, #128]
    ldp     x18, x19, [sp, #144]
    ldp     x20, x21, [sp, #160]
    ldp     x22, x23, [sp, #176]
    ldp     x24, x25, [sp, #192]
    ldp     x26, x27, [sp, #208]
    ldp     x28, x29, [sp, #224]
    ldr     x30, [sp, #240]
    add     sp, sp, #272
    eret
.endm

.align 11
.global __exception_vectors
__exception_vectors:
    // Current EL with SP_EL0: never used
    .align 7
    b       __vector_invalid
    .align 7
    b       __vector_invalid
    .align 7
    b       __vector_invalid
    .align 7
    b       __vector_invalid

    // Current EL with SP_ELx
    .align 7
    b       __vector_el1h_sync
    .align 7
    b       __vector_irq
    .align 7
    b       __vector_invalid
    .align 7
    b       __vector_invalid

    // Lower EL, AArch64
    .align 7
    b       __vector_el0_sync
    .align 7
    b       __vector_irq
    .align 7
    b       __vector_invalid
    .align 7
    b       __vector_invalid

    // Lower EL, AArch32: unsupported
    .align 7
    b       __vector_invalid
    .align 7
    b       __vector_invalid
    .align 7
    b       __vector_invalid
    .align 7
    b       __vector_invalid

__vector_el0_sync:
    kernel_entry
    mov     x0, sp
    mrs     x1, esr_el1
    bl      el0_sync_router
    kernel_exit

__vector_el1h_sync:
    kernel_entry
    mov     x0, sp
    mrs     x1, esr_el1
    bl      el1_sync_router
    kernel_exit

__vector_irq:
    kernel_entry
    mov     x0, sp
    bl      irq_router
    kernel_exit

__vector_invalid:
    kernel_entry
    mov     x0, sp
    mrs     x1, esr_el1
    bl      invalid_exception_router
    kernel_exit
"#
);

//! Boot stub: park secondary cores, drop to EL1, build the boot translation
//! tables (1 GiB blocks at 0x2000/0x3000), turn the MMU on and jump into the
//! high half.

use core::arch::global_asm;

global_asm!(
    r#"
.equ KERNEL_VIRT_OFFSET, 0xffff000000000000

.equ BOOT_PGD_ADDR, 0x2000
.equ BOOT_PUD_ADDR, 0x3000

// TCR_EL1: 48-bit VA on both halves, 4 KiB granules
.equ TCR_VALUE, ((64 - 48) | ((64 - 48) << 16) | (0b00 << 14) | (0b10 << 30))
// MAIR_EL1: attr0 = device-nGnRnE, attr1 = normal non-cacheable
.equ MAIR_VALUE, ((0x00 << 0) | (0x44 << 8))

// Descriptor bits
.equ PD_TABLE, 0b11
.equ PD_BLOCK, 0b01
.equ PD_ACCESS, (1 << 10)
// First GiB: normal memory, MAIR index 1
.equ BOOT_BLOCK_NORMAL, (PD_ACCESS | (1 << 2) | PD_BLOCK)
// Second GiB (local peripherals): device memory, MAIR index 0, never executable
.equ BOOT_BLOCK_DEVICE, ((1 << 54) | (1 << 53) | PD_ACCESS | PD_BLOCK)

.section ".text.boot"
.global _start
_start:
    // Only the primary core boots; the rest sleep forever.
    mrs     x1, mpidr_el1
    and     x1, x1, #3
    cbz     x1, 2f
1:  wfe
    b       1b

2:  // x0 holds the physical DTB pointer from the firmware; keep it.
    mov     x19, x0

    // Drop from EL2 to EL1h with interrupts masked.
    mov     x1, #(1 << 31)              // HCR_EL2.RW: EL1 is AArch64
    msr     hcr_el2, x1
    mov     x1, #0x3c5                  // EL1h, DAIF masked
    msr     spsr_el2, x1
    adr     x1, 3f
    msr     elr_el2, x1
    eret

3:  // Boot translation tables: PGD[0] -> PUD, PUD maps two 1 GiB blocks.
    ldr     x1, =BOOT_PGD_ADDR
    ldr     x2, =BOOT_PUD_ADDR
    mov     x3, #PD_TABLE
    orr     x4, x2, x3
    str     x4, [x1]

    ldr     x4, =BOOT_BLOCK_NORMAL
    str     x4, [x2]
    mov     x5, #0x40000000
    ldr     x4, =BOOT_BLOCK_DEVICE
    orr     x4, x4, x5
    str     x4, [x2, #8]

    msr     ttbr0_el1, x1
    msr     ttbr1_el1, x1

    ldr     x1, =TCR_VALUE
    msr     tcr_el1, x1
    ldr     x1, =MAIR_VALUE
    msr     mair_el1, x1

    mrs     x1, sctlr_el1
    orr     x1, x1, #1
    msr     sctlr_el1, x1
    isb

    // Continue at the linked (high half) address.
    ldr     x1, =__boot_high
    br      x1

__boot_high:
    ldr     x1, =__exception_vectors
    msr     vbar_el1, x1

    // Boot stack sits just below the kernel load address.
    ldr     x1, =(KERNEL_VIRT_OFFSET + 0x80000)
    mov     sp, x1

    mov     x0, x19
    bl      _start_rust
__boot_hang:
    wfe
    b       __boot_hang
"#
);

/// First Rust code. Clears BSS and enters the kernel proper.
///
/// # Safety
/// Called exactly once from the boot stub, with the MMU on and the boot
/// stack established. Must run before anything touches BSS state.
#[no_mangle]
pub unsafe extern "C" fn _start_rust(dtb_phys: usize) -> ! {
    extern "C" {
        static mut __bss_start: u8;
        static mut __bss_end: u8;
    }

    // SAFETY: the linker script defines the BSS bounds; the boot stack is
    // outside BSS, so zeroing it does not touch live frames.
    unsafe {
        let start = &raw mut __bss_start;
        let end = &raw mut __bss_end;
        let len = end as usize - start as usize;
        core::ptr::write_bytes(start, 0, len);
    }

    crate::kernel_main(dtb_phys)
}

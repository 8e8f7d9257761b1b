//! Architecture support.
//!
//! The kernel targets one architecture (AArch64, Raspberry Pi 3 class) but
//! the core subsystems are written against the small surface in this module
//! so they also compile for the host, where unit tests run. Host fallbacks
//! are inert: no interrupts, a fake counter, panicking context primitives.

pub mod context;
pub mod trap;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(not(target_arch = "aarch64"))]
use core::sync::atomic::{AtomicU64, Ordering};

/// Mask IRQs at the CPU (DAIF.I set).
#[inline]
pub fn irq_disable() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("msr daifset, #2");
    }
}

/// Unmask IRQs at the CPU (DAIF.I clear).
#[inline]
pub fn irq_enable() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("msr daifclr, #2");
    }
}

/// Wait for the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "aarch64")]
    cortex_a::asm::wfi();
    #[cfg(not(target_arch = "aarch64"))]
    core::hint::spin_loop();
}

/// Stop the CPU. Used by the panic handler.
pub fn halt() -> ! {
    irq_disable();
    loop {
        wait_for_interrupt();
    }
}

/// Invalidate all EL1 TLB entries. Issued after any page-table mutation.
#[inline]
pub fn tlb_invalidate_all() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("dsb ish", "tlbi vmalle1is", "dsb ish", "isb");
    }
}

/// Faulting virtual address of the last data/instruction abort.
#[inline]
pub fn fault_address() -> usize {
    #[cfg(target_arch = "aarch64")]
    {
        use cortex_a::registers::FAR_EL1;
        use tock_registers::interfaces::Readable;
        FAR_EL1.get() as usize
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        0
    }
}

#[cfg(not(target_arch = "aarch64"))]
static FAKE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Frequency of the generic timer in ticks per second.
#[inline]
pub fn timer_freq() -> u64 {
    #[cfg(target_arch = "aarch64")]
    {
        use cortex_a::registers::CNTFRQ_EL0;
        use tock_registers::interfaces::Readable;
        CNTFRQ_EL0.get()
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        62_500_000
    }
}

/// Current counter value of the generic timer.
#[inline]
pub fn timer_count() -> u64 {
    #[cfg(target_arch = "aarch64")]
    {
        use cortex_a::registers::CNTPCT_EL0;
        use tock_registers::interfaces::Readable;
        CNTPCT_EL0.get()
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        FAKE_COUNTER.fetch_add(1, Ordering::Relaxed)
    }
}

/// Program the timer comparator to fire at the absolute tick `cval`.
#[inline]
pub fn timer_set_compare(cval: u64) {
    #[cfg(target_arch = "aarch64")]
    {
        use cortex_a::registers::CNTP_CVAL_EL0;
        use tock_registers::interfaces::Writeable;
        CNTP_CVAL_EL0.set(cval);
    }
    #[cfg(not(target_arch = "aarch64"))]
    let _ = cval;
}

/// Enable the EL1 physical timer and route its IRQ to core 0.
pub fn timer_enable() {
    #[cfg(target_arch = "aarch64")]
    aarch64::timer::enable();
}

/// Mask the core timer IRQ at the local interrupt controller.
pub fn timer_disable() {
    #[cfg(target_arch = "aarch64")]
    aarch64::timer::disable();
}

/// Allow EL0 to read the counter registers (required by user programs that
/// time themselves).
pub fn timer_allow_el0_access() {
    #[cfg(target_arch = "aarch64")]
    aarch64::timer::allow_el0_access();
}

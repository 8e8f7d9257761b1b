//! EL1 physical timer control and the BCM2836 local interrupt controller.
//!
//! The CPU-side registers go through `cortex-a`; the per-core routing and
//! pending-source registers are a small MMIO block at 0x4000_0000 described
//! with `tock_registers`.

use cortex_a::registers::CNTP_CTL_EL0;
use tock_registers::{
    interfaces::{Readable, Writeable},
    register_bitfields, register_structs,
    registers::{ReadOnly, ReadWrite},
};

use crate::config::KERNEL_VIRT_OFFSET;
use crate::drivers::mmio::MMIODerefWrapper;

register_bitfields! {
    u32,

    /// Core 0 timer interrupt routing
    CORE0_TIMER_IRQCNTL [
        /// Route the EL1 physical timer (nCNTPNSIRQ) to core 0 IRQ
        CNTPNSIRQ_IRQ OFFSET(1) NUMBITS(1) []
    ],

    /// Core 0 pending interrupt sources
    CORE0_IRQ_SOURCE [
        /// A GPU interrupt is pending (AUX/UART arrives through here)
        GPU OFFSET(8) NUMBITS(1) [],
        /// The EL1 physical timer fired
        CNTPNSIRQ OFFSET(1) NUMBITS(1) []
    ]
}

register_structs! {
    #[allow(non_snake_case)]
    pub LocalIntcRegisterBlock {
        (0x00 => _reserved1),
        (0x40 => CORE0_TIMER_IRQCNTL: ReadWrite<u32, CORE0_TIMER_IRQCNTL::Register>),
        (0x44 => _reserved2),
        (0x60 => CORE0_IRQ_SOURCE: ReadOnly<u32, CORE0_IRQ_SOURCE::Register>),
        (0x64 => @END),
    }
}

// SAFETY: fixed BCM2836 local-peripheral address inside the boot-mapped
// second gigabyte, aliased into the kernel half.
static LOCAL_INTC: MMIODerefWrapper<LocalIntcRegisterBlock> =
    unsafe { MMIODerefWrapper::new(KERNEL_VIRT_OFFSET + 0x4000_0000) };

/// Enable the EL1 physical timer and route nCNTPNSIRQ to core 0.
pub fn enable() {
    CNTP_CTL_EL0.write(CNTP_CTL_EL0::ENABLE::SET);
    LOCAL_INTC
        .CORE0_TIMER_IRQCNTL
        .write(CORE0_TIMER_IRQCNTL::CNTPNSIRQ_IRQ::SET);
}

/// Mask the timer IRQ at the local controller.
pub fn disable() {
    LOCAL_INTC.CORE0_TIMER_IRQCNTL.set(0);
}

/// Let EL0 read the virtual counter (CNTKCTL_EL1.EL0PCTEN).
pub fn allow_el0_access() {
    // SAFETY: read-modify-write of a privileged config register.
    unsafe {
        let mut val: u64;
        core::arch::asm!("mrs {v}, cntkctl_el1", v = out(reg) val);
        val |= 1;
        core::arch::asm!("msr cntkctl_el1, {v}", v = in(reg) val);
    }
}

/// Did the core timer raise the pending IRQ?
pub fn timer_irq_pending() -> bool {
    LOCAL_INTC
        .CORE0_IRQ_SOURCE
        .is_set(CORE0_IRQ_SOURCE::CNTPNSIRQ)
}

/// Is a GPU-routed interrupt (AUX among them) pending?
pub fn gpu_irq_pending() -> bool {
    LOCAL_INTC.CORE0_IRQ_SOURCE.is_set(CORE0_IRQ_SOURCE::GPU)
}

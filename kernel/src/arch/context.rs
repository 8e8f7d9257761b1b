//! Kernel-side CPU context: the callee-saved state switched between threads.

/// Callee-saved register file plus stack pointer and the owning address
/// space. Layout must match the `cpu_switch_to`/`store_context`/
/// `load_context` assembly in `arch::aarch64::switch`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuContext {
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    /// Frame pointer (x29)
    pub fp: u64,
    /// Link register (x30): where the thread resumes
    pub lr: u64,
    /// Kernel stack pointer
    pub sp: u64,
    /// Physical address of the root page table (goes into TTBR0_EL1)
    pub pgd: u64,
}

/// The snapshot taken before delivering a signal; restored by the
/// `signal_return` trap. Same shape as a normal context.
pub type SignalContext = CpuContext;

#[cfg(target_arch = "aarch64")]
extern "C" {
    /// Save the current callee-saved state into `prev` and resume `next`,
    /// switching TTBR0_EL1 to `next.pgd` and invalidating the TLB.
    pub fn cpu_switch_to(prev: *mut CpuContext, next: *const CpuContext);

    /// Store the current callee-saved state into `ctx`. The stored `lr`
    /// makes a later `load_context`/`cpu_switch_to` resume just after this
    /// call, so the caller observes a second return.
    pub fn store_context(ctx: *mut CpuContext);

    /// Restore a context previously captured with `store_context`.
    pub fn load_context(ctx: *const CpuContext);
}

#[cfg(not(target_arch = "aarch64"))]
mod host {
    use super::CpuContext;

    /// # Safety
    /// Host stand-in; never actually switches.
    pub unsafe fn cpu_switch_to(_prev: *mut CpuContext, _next: *const CpuContext) {
        unimplemented!("context switch is only available on the target");
    }

    /// # Safety
    /// Host stand-in; never actually stores.
    pub unsafe fn store_context(_ctx: *mut CpuContext) {
        unimplemented!("context capture is only available on the target");
    }

    /// # Safety
    /// Host stand-in; never actually loads.
    pub unsafe fn load_context(_ctx: *const CpuContext) {
        unimplemented!("context restore is only available on the target");
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub use host::{cpu_switch_to, load_context, store_context};

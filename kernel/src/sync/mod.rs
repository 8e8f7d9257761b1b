//! The kernel lock: a recursive interrupt-masking lock.
//!
//! Single-CPU kernel, so mutual exclusion means "IRQs off". `lock()`
//! disables IRQs and bumps a nesting counter; `unlock()` re-enables them
//! only when the count returns to zero, and only once init has finished
//! (before that the boot path runs with interrupts masked throughout).
//! Legal from IRQ context.
//!
//! Data that needs finer structure still lives behind `spin::Mutex`; the
//! convention is to take the kernel lock first, so a spinning acquire can
//! never be interrupted by a handler that wants the same mutex.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;

static LOCK_COUNT: AtomicUsize = AtomicUsize::new(0);
static INIT_DONE: AtomicBool = AtomicBool::new(false);

/// Disable IRQs and enter a critical section. Nests.
#[inline]
pub fn lock() {
    arch::irq_disable();
    LOCK_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Leave a critical section; re-enable IRQs at nesting depth zero.
///
/// Panics on underflow: an unlock without a matching lock is a kernel bug.
#[inline]
pub fn unlock() {
    let prev = LOCK_COUNT.fetch_sub(1, Ordering::Relaxed);
    if prev == 0 {
        panic!("kernel lock count went negative");
    }
    if prev == 1 && INIT_DONE.load(Ordering::Relaxed) {
        arch::irq_enable();
    }
}

/// Current nesting depth. Diagnostic only.
pub fn depth() -> usize {
    LOCK_COUNT.load(Ordering::Relaxed)
}

/// Flip the post-init latch: from now on, dropping to depth zero re-enables
/// IRQs.
pub fn set_init_done() {
    INIT_DONE.store(true, Ordering::Relaxed);
}

/// RAII form of [`lock`]/[`unlock`] for straight-line critical sections.
pub struct KernelLockGuard(());

impl KernelLockGuard {
    pub fn acquire() -> Self {
        lock();
        Self(())
    }
}

impl Drop for KernelLockGuard {
    fn drop(&mut self) {
        unlock();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // Single test: the nesting counter is process-global and the harness
    // runs tests concurrently.
    #[test]
    fn nesting_counts_balance_and_guard_unlocks() {
        let base = depth();
        lock();
        lock();
        assert_eq!(depth(), base + 2);
        unlock();
        assert_eq!(depth(), base + 1);
        unlock();
        assert_eq!(depth(), base);

        {
            let _g = KernelLockGuard::acquire();
            assert_eq!(depth(), base + 1);
        }
        assert_eq!(depth(), base);
    }
}

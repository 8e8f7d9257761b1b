//! Boot-time bump allocator and the reservation table.
//!
//! Everything allocated before the buddy exists comes from a fixed region
//! the linker script places inside the kernel image (`__early_heap_start`..
//! `__early_heap_end`): frame metadata, buddy bitmaps, the reservation list
//! itself. Grants are 8-byte aligned, zeroed, and never reclaimed.

use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{BOOT_PGD_ADDR, BOOT_TABLES_END};
#[cfg(target_arch = "aarch64")]
use crate::mm::virt_to_phys;

/// A range the buddy must never hand out.
#[derive(Debug, Clone, Copy)]
pub struct ReservedRegion {
    /// Physical start address
    pub start: usize,
    /// Length in bytes
    pub size: usize,
    /// What the range holds (for the boot log)
    pub tag: &'static str,
}

const ALIGNMENT: usize = 8;

/// Monotonic bump allocator over a fixed `[start, end)` region.
pub struct BumpAllocator {
    start: usize,
    next: usize,
    end: usize,
}

impl BumpAllocator {
    pub const fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            next: start,
            end,
        }
    }

    /// Grant `size` bytes, 8-byte aligned. `None` once exhausted.
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        let size = size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1);
        if self.next.checked_add(size)? > self.end {
            return None;
        }
        let granted = self.next;
        self.next += size;
        Some(granted)
    }

    /// Does `addr` fall inside this allocator's region?
    pub fn owns(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.next - self.start
    }
}

static EARLY_HEAP: Mutex<Option<BumpAllocator>> = Mutex::new(None);

/// Initialize the bump heap from the linker-provided region.
#[cfg(target_arch = "aarch64")]
pub fn init() {
    extern "C" {
        static __early_heap_start: u8;
        static __early_heap_end: u8;
    }
    // SAFETY: addresses of linker symbols only.
    let (start, end) = unsafe {
        (
            &__early_heap_start as *const u8 as usize,
            &__early_heap_end as *const u8 as usize,
        )
    };
    *EARLY_HEAP.lock() = Some(BumpAllocator::new(start, end));
}

/// Grant zeroed boot-time memory. Panics when exhausted: running out of the
/// early heap means the kernel image layout is wrong, not a runtime
/// condition.
pub fn alloc(size: usize) -> *mut u8 {
    let mut heap = EARLY_HEAP.lock();
    let bump = heap.as_mut().expect("early heap used before init");
    let granted = match bump.alloc(size) {
        Some(addr) => addr,
        None => panic!("early heap exhausted ({} bytes requested)", size),
    };
    // SAFETY: the granted range is inside the linker-reserved region and
    // has never been handed out before.
    unsafe { core::ptr::write_bytes(granted as *mut u8, 0, size) };
    granted as *mut u8
}

/// Does `addr` lie inside the early-heap region? Frees of such addresses
/// are silently dropped: bump grants are permanent.
pub fn owns(addr: usize) -> bool {
    let heap = EARLY_HEAP.lock();
    match heap.as_ref() {
        Some(bump) => bump.owns(addr),
        None => false,
    }
}

/// The reservations boot always knows about: the spin tables and boot stack
/// below the kernel, the boot translation tables, and the kernel image
/// (which contains the early heap).
pub fn boot_reservations() -> Vec<ReservedRegion> {
    let mut regions = Vec::new();

    regions.push(ReservedRegion {
        start: 0,
        size: BOOT_PGD_ADDR,
        tag: "spin tables",
    });
    regions.push(ReservedRegion {
        start: BOOT_PGD_ADDR,
        size: BOOT_TABLES_END - BOOT_PGD_ADDR,
        tag: "boot page tables",
    });

    #[cfg(target_arch = "aarch64")]
    {
        extern "C" {
            static __kernel_start: u8;
            static __kernel_end: u8;
        }
        // SAFETY: addresses of linker symbols only.
        let (start, end) = unsafe {
            (
                &__kernel_start as *const u8 as usize,
                &__kernel_end as *const u8 as usize,
            )
        };
        let start = virt_to_phys(start);
        let end = virt_to_phys(end);
        // The boot stack grows down from the kernel load address.
        regions.push(ReservedRegion {
            start: BOOT_TABLES_END,
            size: start.saturating_sub(BOOT_TABLES_END),
            tag: "boot stack",
        });
        regions.push(ReservedRegion {
            start,
            size: end - start,
            tag: "kernel image + early heap",
        });
    }

    regions
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn grants_are_aligned_and_monotonic() {
        let mut bump = BumpAllocator::new(0x1000, 0x2000);
        let a = bump.alloc(10).expect("first grant fits");
        let b = bump.alloc(1).expect("second grant fits");
        assert_eq!(a, 0x1000);
        assert_eq!(b, 0x1010, "10 bytes round up to 16");
        assert_eq!(bump.used(), 0x18);
        assert!(bump.owns(a));
        assert!(!bump.owns(0x2000));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut bump = BumpAllocator::new(0, 32);
        assert!(bump.alloc(24).is_some());
        assert!(bump.alloc(16).is_none(), "only 8 bytes remain");
        assert!(bump.alloc(8).is_some());
    }
}

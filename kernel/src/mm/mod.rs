//! Memory management: address types, the two-tier physical allocator, page
//! tables, VMAs and the fault handler.
//!
//! Bring-up order matters: the early bump heap serves every allocation until
//! [`init`] has built the frame allocator, after which the global allocator
//! facade routes small requests to the pools and the rest to the buddy.

pub mod buddy;
pub mod early;
pub mod fault;
pub mod kalloc;
pub mod page_table;
pub mod pool;
pub mod vma;

use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, Once};

use crate::config::{KERNEL_VIRT_OFFSET, MEMORY_END, PAGE_SIZE};
pub use buddy::FrameAllocator;
pub use early::ReservedRegion;
pub use vma::{VmArea, VmaProt};

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub usize);

impl PhysicalAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Kernel-half virtual alias of this physical address.
    pub const fn to_virt(self) -> usize {
        self.0 + KERNEL_VIRT_OFFSET
    }

    /// Index of the frame containing this address.
    pub const fn frame_index(self) -> usize {
        self.0 / PAGE_SIZE
    }
}

/// Strip the kernel-half offset from a high virtual address. Identity for
/// already-physical values, so boot-time callers may pass either.
pub const fn virt_to_phys(va: usize) -> usize {
    if va >= KERNEL_VIRT_OFFSET {
        va - KERNEL_VIRT_OFFSET
    } else {
        va
    }
}

static FRAME_ALLOCATOR: Once<Mutex<FrameAllocator>> = Once::new();
static MM_READY: AtomicBool = AtomicBool::new(false);

/// Has [`init`] completed? Gates the global-allocator facade.
#[inline]
pub fn ready() -> bool {
    MM_READY.load(Ordering::Acquire)
}

/// The system frame allocator. Valid after [`init`].
pub fn frame_allocator() -> &'static Mutex<FrameAllocator> {
    FRAME_ALLOCATOR
        .get()
        .expect("frame allocator used before mm::init")
}

/// Zero one physical page through its kernel alias.
///
/// # Safety
/// `addr` must be a frame owned by the caller and mapped in the kernel half.
pub unsafe fn zero_page(addr: PhysicalAddress) {
    // SAFETY: caller contract.
    unsafe { core::ptr::write_bytes(addr.to_virt() as *mut u8, 0, PAGE_SIZE) }
}

/// Build the physical allocator from the boot reservations and hand the
/// global allocator over to it.
///
/// `extra_reserved` carries the ranges only boot knows about: the initramfs
/// and the device-tree blob plus its `/memreserve/` entries.
pub fn init(extra_reserved: &[ReservedRegion]) {
    let mut reserved = early::boot_reservations();
    reserved.extend_from_slice(extra_reserved);

    for r in &reserved {
        log::info!(
            "reserved {:#x}..{:#x} ({})",
            r.start,
            r.start + r.size,
            r.tag
        );
    }

    let allocator = FrameAllocator::new(MEMORY_END, &reserved);
    log::info!(
        "buddy: managing {:#x} bytes, {} frames",
        MEMORY_END,
        MEMORY_END / PAGE_SIZE
    );

    FRAME_ALLOCATOR.call_once(|| Mutex::new(allocator));
    MM_READY.store(true, Ordering::Release);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn virt_phys_round_trip() {
        let pa = PhysicalAddress::new(0x1234_5000);
        assert_eq!(virt_to_phys(pa.to_virt()), pa.as_usize());
        assert_eq!(pa.frame_index(), 0x12345);
        // Boot-time physical values pass through unchanged.
        assert_eq!(virt_to_phys(0x8_0000), 0x8_0000);
    }
}

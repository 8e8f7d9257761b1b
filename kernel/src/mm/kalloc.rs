//! Global allocator facade.
//!
//! Three phases: before `mm::init` every request is served by the early
//! bump heap; afterwards requests up to the largest pool size go to the
//! small-object pools and everything else to the buddy. `dealloc` routes by
//! address: early-heap grants are permanent, pool pages free by slot, buddy
//! blocks by head frame.
//!
//! Only the bare-metal build installs this as `#[global_allocator]`; host
//! builds use the system allocator and exercise the buddy and pools as
//! plain values.

use core::alloc::{GlobalAlloc, Layout};

use crate::config::POOL_SIZES;
use crate::mm::{self, early, virt_to_phys};
use crate::sync;

pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Pool slots are size-aligned, so folding the alignment into the
        // size satisfies any layout up to page alignment.
        let size = layout.size().max(layout.align()).max(1);

        if !mm::ready() {
            return early::alloc(size);
        }

        sync::lock();
        let result = {
            let mut fa = mm::frame_allocator().lock();
            if size <= POOL_SIZES[POOL_SIZES.len() - 1] {
                fa.alloc_small(size)
            } else {
                fa.alloc(size)
            }
        };
        sync::unlock();

        match result {
            Ok(pa) => mm::PhysicalAddress::new(pa).to_virt() as *mut u8,
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let addr = ptr as usize;
        if early::owns(addr) || !mm::ready() {
            // Bump grants are never reclaimed.
            return;
        }

        let pa = virt_to_phys(addr);
        sync::lock();
        let result = {
            let mut fa = mm::frame_allocator().lock();
            if fa.is_pool_page(pa) {
                fa.free_small(pa)
            } else {
                fa.free(pa)
            }
        };
        sync::unlock();

        if let Err(e) = result {
            panic!("kernel free failed: {}", e);
        }
    }
}

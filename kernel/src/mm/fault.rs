//! Demand paging and copy-on-write.
//!
//! Every data/instruction abort from user space (or taken while the kernel
//! dereferences a user buffer) lands here. An address outside every VMA is
//! a segmentation fault and kills the thread. A translation fault installs
//! the missing leaf. A permission fault on a writable VMA is a COW write:
//! shared frames are copied, sole-owner frames simply remapped writable.

use crate::arch;
use crate::arch::trap::{EsrInfo, FaultKind, Trapframe};
use crate::config::PAGE_SIZE;
use crate::mm::page_table::{cow_leaf_attrs, leaf_attrs, map_one_page};
use crate::mm::vma::{self, page_round_down};
use crate::mm::{self, PhysicalAddress, VmaProt};
use crate::sched;
use crate::sync;

/// What a COW write must do, given the faulting frame's reference count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowAction {
    /// Shared with another mapping: copy the page, move our reference
    CopyAndMap,
    /// Sole owner: just remap writable
    MapWritable,
}

/// Decide the COW action from a frame reference count.
#[inline]
pub fn cow_action(refcount: u32) -> CowAction {
    if refcount > 1 {
        CowAction::CopyAndMap
    } else {
        CowAction::MapWritable
    }
}

/// Entry point from the exception routers for memory aborts.
pub fn handle_memory_abort(tpf: &mut Trapframe, esr: EsrInfo) {
    let far = arch::fault_address();

    sync::lock();
    let located = sched::with_current(|t| {
        vma::find_vma(&t.vmas, far).map(|idx| (idx, t.vmas[idx].clone(), t.ctx.pgd as usize))
    });
    sync::unlock();

    let Some((vma_idx, area, pgd)) = located else {
        log::warn!("pid {}: segfault at {:#x}", sched::current_pid(), far);
        sched::exit_current();
        return;
    };

    let offset = page_round_down(far - area.virt_addr);

    match esr.fault_kind() {
        FaultKind::Translation => {
            #[cfg(feature = "verbose-fault-log")]
            log::trace!("translation fault at {:#x}", far);
            demand_map(pgd, area.virt_addr + offset, area.phys_addr + offset, area.prot);
        }
        FaultKind::Permission if area.prot.contains(VmaProt::WRITE) => {
            cow_write(tpf, vma_idx, &area, pgd, offset);
        }
        FaultKind::Permission => {
            log::warn!(
                "pid {}: write to read-only mapping at {:#x}",
                sched::current_pid(),
                far
            );
            sched::exit_current();
        }
        FaultKind::Other => {
            log::warn!(
                "pid {}: unhandled abort at {:#x} (esr {:#x})",
                sched::current_pid(),
                far,
                esr.0
            );
            sched::exit_current();
        }
    }
}

/// Install one missing leaf for a translation fault.
fn demand_map(pgd: usize, va: usize, pa: usize, prot: VmaProt) {
    sync::lock();
    {
        let mut fa = mm::frame_allocator().lock();
        // SAFETY: pgd is the current thread's live root table.
        let mapped = unsafe { map_one_page(&mut fa, pgd, va, pa, leaf_attrs(prot)) };
        if let Err(e) = mapped {
            panic!("demand mapping {:#x} failed: {}", va, e);
        }
    }
    sync::unlock();
    arch::tlb_invalidate_all();
}

/// Resolve a write to a COW-shared page.
fn cow_write(_tpf: &mut Trapframe, vma_idx: usize, area: &vma::VmArea, pgd: usize, offset: usize) {
    sync::lock();

    let page_pa = area.phys_addr + offset;
    let action = {
        let fa = mm::frame_allocator().lock();
        cow_action(fa.refcount(page_pa))
    };

    let new_phys = match action {
        CowAction::CopyAndMap => {
            let new_page = {
                let mut fa = mm::frame_allocator().lock();
                fa.ref_dec(page_pa);
                let new_page = match fa.alloc(PAGE_SIZE) {
                    Ok(p) => p,
                    Err(e) => panic!("copy-on-write allocation failed: {}", e),
                };
                fa.ref_inc(new_page);
                new_page
            };
            #[cfg(feature = "verbose-fault-log")]
            log::trace!("cow copy {:#x} -> {:#x}", page_pa, new_page);
            // SAFETY: both frames are live and visible through the kernel
            // half; the copy is outside any allocator lock.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    PhysicalAddress::new(page_pa).to_virt() as *const u8,
                    PhysicalAddress::new(new_page).to_virt() as *mut u8,
                    PAGE_SIZE,
                );
            }
            sched::with_current(|t| t.vmas[vma_idx].phys_addr = new_page);
            new_page
        }
        CowAction::MapWritable => area.phys_addr,
    };

    {
        let mut fa = mm::frame_allocator().lock();
        // SAFETY: pgd is the current thread's live root table.
        let mapped = unsafe {
            map_one_page(
                &mut fa,
                pgd,
                area.virt_addr + offset,
                new_phys + offset,
                leaf_attrs(area.prot),
            )
        };
        if let Err(e) = mapped {
            panic!("cow remap failed: {}", e);
        }
    }

    sync::unlock();
    arch::tlb_invalidate_all();
}

/// Write-protect one shared leaf in both parent and child during fork. The
/// next write from either side takes the COW path above. Locks the frame
/// allocator internally, so the caller must not hold it.
pub fn share_page_readonly(
    parent_pgd: usize,
    child_pgd: usize,
    va: usize,
    pa: usize,
    prot: VmaProt,
) -> crate::error::KernelResult<()> {
    let mut fa = mm::frame_allocator().lock();
    fa.ref_inc(pa);
    let attrs = cow_leaf_attrs(prot);
    // SAFETY: both roots are live table trees owned by the forking pair.
    unsafe {
        map_one_page(&mut fa, parent_pgd, va, pa, attrs)?;
        map_one_page(&mut fa, child_pgd, va, pa, attrs)?;
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn shared_frames_are_copied_sole_frames_remapped() {
        assert_eq!(cow_action(2), CowAction::CopyAndMap);
        assert_eq!(cow_action(17), CowAction::CopyAndMap);
        assert_eq!(cow_action(1), CowAction::MapWritable);
        // A refcount of zero means the frame is not COW-managed at all;
        // remapping writable is still the no-copy action.
        assert_eq!(cow_action(0), CowAction::MapWritable);
    }
}

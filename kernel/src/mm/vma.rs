//! Virtual memory areas: the per-thread description of an address space.
//!
//! A VMA maps a page-rounded virtual range onto a contiguous physical
//! range with uniform permissions. `is_alloced` marks ranges whose frames
//! the process owns (or shares copy-on-write); those carry reference
//! counts and return to the buddy when the last reference drops.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::PAGE_SIZE;
use crate::mm::FrameAllocator;

bitflags! {
    /// VMA permission bits, `rwx` order as user space passes them
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaProt: u64 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
    }
}

/// One contiguous mapping of a thread's address space.
#[derive(Debug, Clone)]
pub struct VmArea {
    pub virt_addr: usize,
    pub phys_addr: usize,
    /// Page-multiple length
    pub area_size: usize,
    pub prot: VmaProt,
    /// The backing frames are owned (refcounted) by this mapping
    pub is_alloced: bool,
}

impl VmArea {
    #[inline]
    pub fn end(&self) -> usize {
        self.virt_addr + self.area_size
    }

    #[inline]
    pub fn contains(&self, va: usize) -> bool {
        va >= self.virt_addr && va < self.end()
    }

    #[inline]
    pub fn overlaps(&self, start: usize, len: usize) -> bool {
        start < self.end() && start + len > self.virt_addr
    }
}

/// Round `size` up to whole pages.
#[inline]
pub fn page_round_up(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Align `addr` down to its page base.
#[inline]
pub fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Append a mapping to `vmas`. Size is rounded up to whole pages.
pub fn add_vma(
    vmas: &mut Vec<VmArea>,
    va: usize,
    size: usize,
    pa: usize,
    prot: VmaProt,
    is_alloced: bool,
) {
    vmas.push(VmArea {
        virt_addr: va,
        phys_addr: pa,
        area_size: page_round_up(size),
        prot,
        is_alloced,
    });
}

/// Index of the VMA containing `va`, if any.
pub fn find_vma(vmas: &[VmArea], va: usize) -> Option<usize> {
    vmas.iter().position(|vma| vma.contains(va))
}

/// Drop every mapping, releasing owned frames whose reference counts reach
/// zero. The backing block is freed as a whole once no page in it is
/// referenced.
pub fn release_vmas(fa: &mut FrameAllocator, vmas: &mut Vec<VmArea>) {
    for vma in vmas.drain(..) {
        if !vma.is_alloced {
            continue;
        }
        let mut any_referenced = false;
        for page in 0..vma.area_size / PAGE_SIZE {
            if fa.ref_dec(vma.phys_addr + page * PAGE_SIZE) != 0 {
                any_referenced = true;
            }
        }
        if !any_referenced {
            if let Err(e) = fa.free(vma.phys_addr) {
                panic!("releasing VMA backing store failed: {}", e);
            }
        }
    }
}

/// Pick a start address for an anonymous mapping: the page-aligned hint,
/// moved past any colliding region until `len` bytes are free.
pub fn mmap_pick_base(vmas: &[VmArea], hint: usize, len: usize) -> usize {
    let mut base = page_round_up(hint);
    let len = page_round_up(len);
    loop {
        match vmas.iter().find(|vma| vma.overlaps(base, len)) {
            Some(vma) => base = vma.end(),
            None => return base,
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn vma(va: usize, size: usize) -> VmArea {
        VmArea {
            virt_addr: va,
            phys_addr: 0,
            area_size: size,
            prot: VmaProt::READ | VmaProt::WRITE,
            is_alloced: false,
        }
    }

    #[test]
    fn sizes_round_to_pages() {
        let mut vmas = Vec::new();
        add_vma(&mut vmas, 0x5000, 1, 0, VmaProt::READ, false);
        assert_eq!(vmas[0].area_size, PAGE_SIZE);
        add_vma(&mut vmas, 0x10000, PAGE_SIZE + 1, 0, VmaProt::READ, false);
        assert_eq!(vmas[1].area_size, 2 * PAGE_SIZE);
    }

    #[test]
    fn containment_is_half_open() {
        let vmas = [vma(0x1000, 0x2000)];
        assert_eq!(find_vma(&vmas, 0x0FFF), None);
        assert_eq!(find_vma(&vmas, 0x1000), Some(0));
        assert_eq!(find_vma(&vmas, 0x2FFF), Some(0));
        assert_eq!(find_vma(&vmas, 0x3000), None);
    }

    #[test]
    fn mmap_base_skips_collisions() {
        let vmas = [vma(0x0, 0x3000), vma(0x5000, 0x1000)];
        // Hint inside the first region: pushed to its end.
        assert_eq!(mmap_pick_base(&vmas, 0x1000, 0x1000), 0x3000);
        // Fits in the gap.
        assert_eq!(mmap_pick_base(&vmas, 0x3000, 0x2000), 0x3000);
        // Too big for the gap: lands after the second region.
        assert_eq!(mmap_pick_base(&vmas, 0x3000, 0x3000), 0x6000);
        // Unaligned hints round up first.
        assert_eq!(mmap_pick_base(&vmas, 0x6001, 0x1000), 0x7000);
    }

    #[test]
    fn release_frees_only_last_reference() {
        let mut fa = FrameAllocator::new(32 * PAGE_SIZE, &[]);
        let initial = fa.snapshot();
        let block = fa.alloc(PAGE_SIZE).expect("backing page");
        fa.ref_inc(block);
        fa.ref_inc(block); // shared with a second mapping

        let mut first = alloc::vec![VmArea {
            virt_addr: 0,
            phys_addr: block,
            area_size: PAGE_SIZE,
            prot: VmaProt::READ,
            is_alloced: true,
        }];
        let mut second = first.clone();

        release_vmas(&mut fa, &mut first);
        assert_eq!(fa.refcount(block), 1, "one owner left, block stays");
        release_vmas(&mut fa, &mut second);
        assert_eq!(
            fa.snapshot(),
            initial,
            "last release returns the block to the buddy"
        );
    }
}

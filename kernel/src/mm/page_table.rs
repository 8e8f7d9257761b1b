//! 4-level page tables (PGD → PUD → PMD → PTE, 512 entries each, 4 KiB
//! granule). User mappings are installed one leaf at a time; intermediate
//! tables come from the buddy on demand.

use bitflags::bitflags;

use crate::config::{PAGE_SIZE, PERIPHERAL_END};
use crate::error::KernelResult;
use crate::mm::vma::VmaProt;
use crate::mm::{FrameAllocator, PhysicalAddress};

bitflags! {
    /// AArch64 stage-1 descriptor bits used by this kernel
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryAttrs: u64 {
        /// Valid block entry (low bits 0b01)
        const BLOCK = 0b01;
        /// Valid table / level-3 page entry (low bits 0b11)
        const TABLE = 0b11;
        /// Unprivileged (EL0) access allowed
        const UK_ACCESS = 1 << 6;
        /// Read-only at every level that honors it
        const RDONLY = 1 << 7;
        /// Access flag; faults if clear
        const ACCESS = 1 << 10;
        /// Privileged execute-never
        const KNX = 1 << 53;
        /// Unprivileged execute-never
        const UNX = 1 << 54;
    }
}

/// MAIR attribute indices programmed by the boot stub
pub const MAIR_IDX_DEVICE_NGNRNE: u64 = 0;
pub const MAIR_IDX_NORMAL_NOCACHE: u64 = 1;

/// Physical-address field of a descriptor
pub const ENTRY_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

const TABLE_ENTRIES: usize = 512;

/// Descriptor attributes for a user leaf with the given VMA permissions.
/// The kernel never executes user pages; write and user-access bits follow
/// the VMA.
pub fn leaf_attrs(prot: VmaProt) -> u64 {
    let mut attrs = EntryAttrs::KNX | EntryAttrs::ACCESS | EntryAttrs::TABLE;
    if !prot.contains(VmaProt::EXEC) {
        attrs |= EntryAttrs::UNX;
    }
    if !prot.contains(VmaProt::WRITE) {
        attrs |= EntryAttrs::RDONLY;
    }
    if prot.contains(VmaProt::READ) {
        attrs |= EntryAttrs::UK_ACCESS;
    }
    attrs.bits() | (MAIR_IDX_NORMAL_NOCACHE << 2)
}

/// Leaf attributes for a copy-on-write share: like [`leaf_attrs`] but
/// forced read-only so the first write faults.
pub fn cow_leaf_attrs(prot: VmaProt) -> u64 {
    leaf_attrs(prot.difference(VmaProt::WRITE))
}

/// Table-descriptor attributes for intermediate levels.
fn table_attrs() -> u64 {
    (EntryAttrs::ACCESS | EntryAttrs::TABLE).bits() | (MAIR_IDX_NORMAL_NOCACHE << 2)
}

#[inline]
fn table_index(va: usize, level: usize) -> usize {
    (va >> (39 - 9 * level)) & 0x1FF
}

/// Install a single leaf mapping `va -> pa` under the root table at
/// `pgd_phys`, creating intermediate tables from the buddy as needed.
///
/// # Safety
/// `pgd_phys` must be the root of a live 4-level table tree whose pages are
/// visible through the kernel half. The caller flushes the TLB afterwards.
pub unsafe fn map_one_page(
    fa: &mut FrameAllocator,
    pgd_phys: usize,
    va: usize,
    pa: usize,
    attrs: u64,
) -> KernelResult<()> {
    let mut table = PhysicalAddress::new(pgd_phys).to_virt() as *mut u64;
    for level in 0..4 {
        let idx = table_index(va, level);
        // SAFETY: `table` points at a 512-entry table per the caller
        // contract; idx < 512.
        unsafe {
            if level == 3 {
                *table.add(idx) = pa as u64 | attrs;
                return Ok(());
            }
            if *table.add(idx) == 0 {
                let next = fa.alloc(PAGE_SIZE)?;
                core::ptr::write_bytes(
                    PhysicalAddress::new(next).to_virt() as *mut u8,
                    0,
                    PAGE_SIZE,
                );
                *table.add(idx) = next as u64 | table_attrs();
            }
            let next_phys = *table.add(idx) & ENTRY_ADDR_MASK;
            table = PhysicalAddress::new(next_phys as usize).to_virt() as *mut u64;
        }
    }
    Ok(())
}

/// Free every intermediate table reachable from `table_phys`, leaving leaf
/// frames alone (they are owned by VMAs). Called with the root and level 0.
///
/// # Safety
/// As for [`map_one_page`]; the tree must not be live in TTBR0 of a running
/// thread other than the caller's, which must flush the TLB afterwards.
pub unsafe fn free_page_tables(fa: &mut FrameAllocator, table_phys: usize, level: usize) {
    let table = PhysicalAddress::new(table_phys).to_virt() as *mut u64;
    for idx in 0..TABLE_ENTRIES {
        // SAFETY: caller contract; idx < 512.
        unsafe {
            let entry = *table.add(idx);
            if entry == 0 || entry & EntryAttrs::TABLE.bits() != EntryAttrs::TABLE.bits() {
                continue;
            }
            let child = (entry & ENTRY_ADDR_MASK) as usize;
            if level < 2 {
                free_page_tables(fa, child, level + 1);
            }
            *table.add(idx) = 0;
            if let Err(e) = fa.free(child) {
                panic!("freeing page-table page failed: {}", e);
            }
        }
    }
}

/// Refine the boot map: replace the two 1 GiB PUD blocks with 2 MiB PMD
/// entries so the peripheral window `[PERIPHERAL_END, 1 GiB)` gets device
/// attributes while ordinary RAM stays normal memory.
///
/// # Safety
/// Must run once, early, while the identity map is still authoritative.
pub unsafe fn init_kernel_2mb_map() {
    use crate::config::{BOOT_PGD_ADDR, KERNEL_VIRT_OFFSET};

    const TWO_MB: u64 = 0x20_0000;
    let pud = (KERNEL_VIRT_OFFSET + BOOT_PGD_ADDR + 0x1000) as *mut u64;
    let pmd0 = (KERNEL_VIRT_OFFSET + BOOT_PGD_ADDR + 0x2000) as *mut u64;
    let pmd1 = (KERNEL_VIRT_OFFSET + BOOT_PGD_ADDR + 0x3000) as *mut u64;

    let normal = (EntryAttrs::ACCESS | EntryAttrs::BLOCK).bits() | (MAIR_IDX_NORMAL_NOCACHE << 2);
    let device = (EntryAttrs::UNX | EntryAttrs::KNX | EntryAttrs::ACCESS | EntryAttrs::BLOCK)
        .bits()
        | (MAIR_IDX_DEVICE_NGNRNE << 2);

    // SAFETY: the boot tables live at fixed reserved addresses.
    unsafe {
        for i in 0..TABLE_ENTRIES as u64 {
            let addr = TWO_MB * i;
            *pmd0.add(i as usize) = addr
                | if (addr as usize) >= PERIPHERAL_END {
                    device
                } else {
                    normal
                };
            *pmd1.add(i as usize) = (0x4000_0000 + addr) | device;
        }
        *pud = (BOOT_PGD_ADDR as u64 + 0x2000) | table_attrs();
        *pud.add(1) = (BOOT_PGD_ADDR as u64 + 0x3000) | table_attrs();
    }
    crate::arch::tlb_invalidate_all();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn leaf_attrs_follow_vma_permissions() {
        let rwx = leaf_attrs(VmaProt::READ | VmaProt::WRITE | VmaProt::EXEC);
        assert_eq!(rwx & EntryAttrs::UNX.bits(), 0, "executable: UNX clear");
        assert_eq!(rwx & EntryAttrs::RDONLY.bits(), 0, "writable: RDONLY clear");
        assert_ne!(rwx & EntryAttrs::UK_ACCESS.bits(), 0, "readable: EL0 access");
        assert_ne!(rwx & EntryAttrs::KNX.bits(), 0, "kernel never executes user pages");

        let ro = leaf_attrs(VmaProt::READ);
        assert_ne!(ro & EntryAttrs::UNX.bits(), 0);
        assert_ne!(ro & EntryAttrs::RDONLY.bits(), 0);

        let none = leaf_attrs(VmaProt::empty());
        assert_eq!(none & EntryAttrs::UK_ACCESS.bits(), 0);
    }

    #[test]
    fn cow_attrs_strip_write_only() {
        let shared = cow_leaf_attrs(VmaProt::READ | VmaProt::WRITE | VmaProt::EXEC);
        assert_ne!(shared & EntryAttrs::RDONLY.bits(), 0, "COW share is read-only");
        assert_eq!(shared & EntryAttrs::UNX.bits(), 0, "exec bit survives");
    }

    #[test]
    fn table_indices_decompose_the_va() {
        let va = 0xFFFF_FFFF_F000 - PAGE_SIZE; // top user stack page
        let idx: alloc::vec::Vec<usize> = (0..4).map(|l| table_index(va, l)).collect();
        // Reassemble: each index contributes 9 bits.
        let rebuilt = (idx[0] << 39) | (idx[1] << 30) | (idx[2] << 21) | (idx[3] << 12);
        assert_eq!(rebuilt, va & !(PAGE_SIZE - 1));
    }
}

//! Device-tree consumption: the boot reservations and the initramfs range.
//!
//! The blob arrives as a physical pointer in x0. We read exactly what the
//! memory-management bring-up needs: the `/memreserve/` entries, the blob's
//! own extent, and `/chosen`'s `linux,initrd-start`/`linux,initrd-end`.

use alloc::vec::Vec;

use crate::mm::ReservedRegion;

/// What boot learned from the device tree.
pub struct BootInfo {
    /// Ranges the allocator must not touch (the blob itself included)
    pub reserved: Vec<ReservedRegion>,
    /// Physical extent of the initramfs CPIO archive, if announced
    pub initrd: Option<(usize, usize)>,
}

impl BootInfo {
    pub fn empty() -> Self {
        Self {
            reserved: Vec::new(),
            initrd: None,
        }
    }
}

/// Parse the blob at `dtb_phys`. Failures degrade to an empty result: a
/// board without a usable DTB still boots, it just has no initramfs and no
/// extra reservations.
#[cfg(target_arch = "aarch64")]
pub fn read_boot_info(dtb_phys: usize) -> BootInfo {
    use fdt_rs::base::DevTree;
    use fdt_rs::prelude::*;

    let mut info = BootInfo::empty();
    if dtb_phys == 0 {
        return info;
    }
    let dtb_virt = crate::mm::PhysicalAddress::new(dtb_phys).to_virt();

    // SAFETY: the firmware hands a pointer to a complete in-memory blob;
    // from_raw_pointer validates the header before trusting any length.
    let tree = match unsafe { DevTree::from_raw_pointer(dtb_virt as *const u8) } {
        Ok(tree) => tree,
        Err(_) => {
            log::warn!("dtb: bad header at {:#x}", dtb_phys);
            return info;
        }
    };

    info.reserved.push(ReservedRegion {
        start: dtb_phys,
        size: tree.totalsize(),
        tag: "device tree blob",
    });

    for entry in tree.reserved_entries() {
        let start = u64::from(entry.address) as usize;
        let size = u64::from(entry.size) as usize;
        if size != 0 {
            info.reserved.push(ReservedRegion {
                start,
                size,
                tag: "dtb memreserve",
            });
        }
    }

    let mut initrd_start = None;
    let mut initrd_end = None;
    for prop in tree.props() {
        if let Ok(name) = prop.name() {
            match name {
                "linux,initrd-start" => initrd_start = prop_address(&prop),
                "linux,initrd-end" => initrd_end = prop_address(&prop),
                _ => {}
            }
        }
    }
    if let (Some(start), Some(end)) = (initrd_start, initrd_end) {
        if end > start {
            info.reserved.push(ReservedRegion {
                start,
                size: end - start,
                tag: "initramfs",
            });
            info.initrd = Some((start, end));
        }
    }

    info
}

/// Cells may be 32 or 64 bit depending on the generator.
#[cfg(target_arch = "aarch64")]
fn prop_address(prop: &fdt_rs::base::DevTreeProp<'_, '_>) -> Option<usize> {
    use fdt_rs::prelude::*;

    match prop.length() {
        8 => prop.u64(0).ok().map(|v| v as usize),
        _ => prop.u32(0).ok().map(|v| v as usize),
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub fn read_boot_info(_dtb_phys: usize) -> BootInfo {
    BootInfo::empty()
}

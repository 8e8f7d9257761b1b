//! Cross-subsystem scenarios run on the host: allocator round trips, path
//! resolution, and FAT32 over a RAM disk through the public API.

use lichen_kernel::config::PAGE_SIZE;
use lichen_kernel::fs::blockdev::{BlockDevice, RamDisk, BLOCK_SIZE};
use lichen_kernel::fs::fat32::Fat32Fs;
use lichen_kernel::fs::path::path_to_absolute;
use lichen_kernel::mm::{FrameAllocator, ReservedRegion};

#[test]
fn buddy_malloc_free_pairs_restore_boot_state() {
    // Scenario: two page allocations, freed in order, leave the free lists
    // exactly as they started.
    let mut fa = FrameAllocator::new(64 * PAGE_SIZE, &[]);
    let boot_state = fa.snapshot();

    let first = fa.alloc(0x1000).expect("first malloc");
    let second = fa.alloc(0x1000).expect("second malloc");
    assert_ne!(first, second);
    fa.free(first).expect("free first");
    fa.free(second).expect("free second");

    assert_eq!(fa.snapshot(), boot_state);
}

#[test]
fn buddy_reservations_stay_out_of_every_free_list() {
    // Boot-style reservations: page tables, a kernel image, an initramfs.
    let reserved = [
        ReservedRegion {
            start: 0,
            size: 0x6000,
            tag: "page tables",
        },
        ReservedRegion {
            start: 0x10000,
            size: 0x8000,
            tag: "kernel",
        },
        ReservedRegion {
            start: 0x20000,
            size: 0x1800,
            tag: "initramfs",
        },
    ];
    let mut fa = FrameAllocator::new(128 * PAGE_SIZE, &reserved);

    let mut reserved_pages = std::collections::HashSet::new();
    reserved_pages.extend(0..6);
    reserved_pages.extend(16..24);
    reserved_pages.extend(32..34);

    // No allocation that fits may ever produce a reserved page.
    let mut held = Vec::new();
    while let Ok(addr) = fa.alloc(PAGE_SIZE) {
        let frame = addr / PAGE_SIZE;
        assert!(
            !reserved_pages.contains(&frame),
            "allocator handed out reserved frame {}",
            frame
        );
        held.push(addr);
    }
    assert_eq!(held.len(), 128 - reserved_pages.len());
}

#[test]
fn pool_objects_share_one_page_then_spill() {
    for size in [32usize, 64, 128, 256, 512, 1024] {
        let mut fa = FrameAllocator::new(64 * PAGE_SIZE, &[]);
        let per_page = PAGE_SIZE / size;
        let mut addrs = Vec::new();
        for _ in 0..per_page {
            addrs.push(fa.alloc_small(size).expect("pool slot"));
        }
        let page = addrs[0] / PAGE_SIZE;
        assert!(addrs.iter().all(|a| a / PAGE_SIZE == page));
        let spill = fa.alloc_small(size).expect("second pool page");
        assert_ne!(spill / PAGE_SIZE, page, "k+1th object needs a new page");
    }
}

#[test]
fn path_normalization_matches_the_contract() {
    assert_eq!(path_to_absolute("../a", "/x/y"), "/x/a");
    assert_eq!(path_to_absolute("./a", "/"), "/a");
    assert_eq!(path_to_absolute("b/../c", "/x"), "/x/c");
}

/// Minimal bootable FAT32 image: partition at LBA 1, one FAT sector, root
/// directory at cluster 2.
fn tiny_fat32() -> std::sync::Arc<RamDisk> {
    let disk = RamDisk::new(64);

    let mut mbr = [0u8; BLOCK_SIZE];
    mbr[446 + 4] = 0x0B;
    mbr[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    disk.write_block(0, &mbr).expect("mbr");

    let mut bpb = [0u8; BLOCK_SIZE];
    bpb[11..13].copy_from_slice(&(BLOCK_SIZE as u16).to_le_bytes());
    bpb[13] = 1;
    bpb[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved sectors
    bpb[16] = 1; // FATs
    bpb[32..36].copy_from_slice(&64u32.to_le_bytes());
    bpb[36..40].copy_from_slice(&1u32.to_le_bytes()); // sectors per FAT
    bpb[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
    disk.write_block(1, &bpb).expect("bpb");

    let mut fat = [0u8; BLOCK_SIZE];
    for (i, val) in [0x0FFF_FFF8u32, 0x0FFF_FFFF, 0x0FFF_FFFF].iter().enumerate() {
        fat[i * 4..i * 4 + 4].copy_from_slice(&val.to_le_bytes());
    }
    disk.write_block(2, &fat).expect("fat");

    disk
}

#[test]
fn fat32_cache_write_read_sync_property() {
    let disk = tiny_fat32();
    let fs = Fat32Fs::probe(disk.clone()).expect("probe");

    let block = 40;
    let mut x = [0u8; BLOCK_SIZE];
    for (i, b) in x.iter_mut().enumerate() {
        *b = (i * 7 % 256) as u8;
    }

    // writeblock(b, X); readblock(b, Y) => Y == X before any sync.
    fs.write_block(block, &x).expect("cached write");
    let mut y = [0u8; BLOCK_SIZE];
    fs.read_block(block, &mut y).expect("cached read");
    assert_eq!(x[..], y[..]);

    // The device must not have seen the write yet.
    let mut raw = [0u8; BLOCK_SIZE];
    disk.read_block(block, &mut raw).expect("device read");
    assert!(raw.iter().all(|&b| b == 0));

    // After syncfs the device reads back X.
    fs.sync_cache().expect("sync");
    disk.read_block(block, &mut raw).expect("device read");
    assert_eq!(raw[..], x[..]);
}

#[test]
fn fat32_geometry_comes_from_the_boot_sector() {
    let fs = Fat32Fs::probe(tiny_fat32()).expect("probe");
    let meta = fs.metadata();
    assert_eq!(meta.fat_region_block, 2);
    assert_eq!(meta.data_region_block, 3);
    assert_eq!(meta.root_cluster, 2);
    assert_eq!(meta.sectors_per_cluster, 1);
}

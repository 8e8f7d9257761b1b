//! Buddy allocator: power-of-two, page-granular physical frame allocator.
//!
//! One [`Frame`] record exists per physical page. Each level `L` keeps a
//! bitmap of free blocks of `PAGE_SIZE << L` bytes plus a doubly-linked
//! free list threaded through the head frames (LIFO: inserts at the front,
//! allocation pops the front). Freeing coalesces with the buddy block
//! (`index ^ 1`) as far up as possible.
//!
//! The frame records double as pool-page bookkeeping (slot bitmap, slot
//! size, free-slot count; see [`pool`]) and carry the copy-on-write
//! reference count for frames backing user VMAs. At most one of
//! {free, head-of-buddy-block, pool-page, reserved} holds per frame.
//!
//! [`pool`]: crate::mm::pool

use alloc::vec;
use alloc::vec::Vec;

use crate::config::{MAX_LEVEL, PAGE_SIZE, POOL_SIZES};
use crate::error::MemoryError;
use crate::mm::ReservedRegion;

/// Link terminator for the intrusive frame lists.
pub(super) const NIL: u32 = u32::MAX;

/// Per-frame bookkeeping.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Byte size of the live allocation this frame heads; 0 otherwise
    pub size: u32,
    /// Intrusive list links (buddy free list or pool page list)
    pub(super) prev: u32,
    pub(super) next: u32,
    /// Free-slot bitmap when this frame serves a small-object pool
    /// (bit set = slot free; up to `PAGE_SIZE / 32` = 128 slots)
    pub(super) slot_bitmap: u128,
    /// Slot size this pool page dispenses; 0 when not a pool page
    pub slot_size: u16,
    /// Number of free slots remaining
    pub slot_free: u16,
    /// Copy-on-write reference count (meaningful for user VMA frames)
    pub refcount: u32,
}

impl Frame {
    const fn empty() -> Self {
        Self {
            size: 0,
            prev: NIL,
            next: NIL,
            slot_bitmap: 0,
            slot_size: 0,
            slot_free: 0,
            refcount: 0,
        }
    }
}

/// One buddy level: free-block bitmap plus free-list head.
struct Level {
    bitmap: Vec<u8>,
    head: u32,
}

impl Level {
    fn new(blocks: usize) -> Self {
        Self {
            bitmap: vec![0; blocks.div_ceil(8)],
            head: NIL,
        }
    }

    #[inline]
    fn test(&self, block: usize) -> bool {
        self.bitmap[block / 8] & (1 << (block % 8)) != 0
    }

    #[inline]
    fn set(&mut self, block: usize) {
        self.bitmap[block / 8] |= 1 << (block % 8);
    }

    #[inline]
    fn clear(&mut self, block: usize) {
        self.bitmap[block / 8] &= !(1 << (block % 8));
    }
}

/// The physical frame allocator: buddy levels plus the small-object pools
/// that borrow its frames (implemented in [`pool`]).
///
/// [`pool`]: crate::mm::pool
pub struct FrameAllocator {
    frames: Vec<Frame>,
    levels: Vec<Level>,
    /// Heads of the per-size pool page lists
    pub(super) pools: [u32; POOL_SIZES.len()],
    frame_count: usize,
}

impl FrameAllocator {
    /// Build the allocator for `[0, total_bytes)`, keeping every page that
    /// touches a reservation out of circulation, then merging the rest
    /// bottom-up into the largest possible blocks.
    pub fn new(total_bytes: usize, reserved: &[ReservedRegion]) -> Self {
        let frame_count = total_bytes / PAGE_SIZE;
        let mut allocator = Self {
            frames: vec![Frame::empty(); frame_count],
            levels: (0..=MAX_LEVEL)
                .map(|l| Level::new(frame_count >> l))
                .collect(),
            pools: [NIL; POOL_SIZES.len()],
            frame_count,
        };

        // Every page starts free at level 0.
        for idx in 0..frame_count {
            allocator.levels[0].set(idx);
        }

        for region in reserved {
            allocator.reserve(region.start, region.start + region.size);
        }

        allocator.merge_bottom_up();
        allocator.build_free_lists();
        allocator
    }

    /// Mark every page overlapping `[start, end)` as permanently allocated.
    fn reserve(&mut self, start: usize, end: usize) {
        if end <= start {
            return;
        }
        let first = start / PAGE_SIZE;
        let last = (end - 1) / PAGE_SIZE;
        for idx in first..=last.min(self.frame_count - 1) {
            self.levels[0].clear(idx);
            self.frames[idx].size = PAGE_SIZE as u32;
        }
    }

    /// Pairwise-merge free siblings upward to populate the higher levels.
    fn merge_bottom_up(&mut self) {
        for level in 0..MAX_LEVEL {
            let blocks = self.blocks_at(level);
            let mut block = 0;
            while block + 1 < blocks {
                if self.levels[level].test(block) && self.levels[level].test(block + 1) {
                    self.levels[level].clear(block);
                    self.levels[level].clear(block + 1);
                    self.levels[level + 1].set(block / 2);
                }
                block += 2;
            }
        }
    }

    /// Populate the free lists from the bitmaps. Iterates high-to-low so
    /// the list heads end up at the lowest block index.
    fn build_free_lists(&mut self) {
        for level in 0..=MAX_LEVEL {
            for block in (0..self.blocks_at(level)).rev() {
                if self.levels[level].test(block) {
                    let frame = (block << level) as u32;
                    Self::list_push_front(&mut self.frames, &mut self.levels[level].head, frame);
                }
            }
        }
    }

    #[inline]
    fn blocks_at(&self, level: usize) -> usize {
        self.frame_count >> level
    }

    /// Smallest level whose block size holds `size` bytes.
    fn find_level(size: usize) -> usize {
        let mut level = 0;
        let mut block = PAGE_SIZE;
        while block < size && level < MAX_LEVEL {
            block <<= 1;
            level += 1;
        }
        level
    }

    fn list_push_front(frames: &mut [Frame], head: &mut u32, idx: u32) {
        frames[idx as usize].prev = NIL;
        frames[idx as usize].next = *head;
        if *head != NIL {
            frames[*head as usize].prev = idx;
        }
        *head = idx;
    }

    fn list_remove(frames: &mut [Frame], head: &mut u32, idx: u32) {
        let prev = frames[idx as usize].prev;
        let next = frames[idx as usize].next;
        if prev != NIL {
            frames[prev as usize].next = next;
        } else {
            *head = next;
        }
        if next != NIL {
            frames[next as usize].prev = prev;
        }
        frames[idx as usize].prev = NIL;
        frames[idx as usize].next = NIL;
    }

    pub(super) fn push_pool_page(&mut self, pool: usize, frame: u32) {
        Self::list_push_front(&mut self.frames, &mut self.pools[pool], frame);
    }

    pub(super) fn remove_pool_page(&mut self, pool: usize, frame: u32) {
        Self::list_remove(&mut self.frames, &mut self.pools[pool], frame);
    }

    /// Allocate `size` bytes, rounded up to a power of two of at least one
    /// page. Returns the physical base address.
    pub fn alloc(&mut self, size: usize) -> Result<usize, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize { requested: 0 });
        }
        if size > PAGE_SIZE << MAX_LEVEL {
            return Err(MemoryError::OutOfMemory { requested: size });
        }
        let rounded = size.next_power_of_two().max(PAGE_SIZE);
        let level = Self::find_level(rounded);

        for current in level..=MAX_LEVEL {
            if self.levels[current].head == NIL {
                continue;
            }
            // Pop the front block of the first non-empty level.
            let frame = self.levels[current].head;
            let mut block = frame as usize >> current;
            Self::list_remove(&mut self.frames, &mut self.levels[current].head, frame);
            self.levels[current].clear(block);

            // Split down to the requested level, returning the upper half
            // to each intermediate free list.
            let mut at = current;
            while at > level {
                at -= 1;
                let left = block << 1;
                let right = left + 1;
                self.levels[at].set(right);
                Self::list_push_front(
                    &mut self.frames,
                    &mut self.levels[at].head,
                    (right << at) as u32,
                );
                block = left;
            }

            let head_frame = block << level;
            self.frames[head_frame].size = rounded as u32;
            return Ok(head_frame * PAGE_SIZE);
        }

        Err(MemoryError::OutOfMemory { requested: size })
    }

    /// Free the block whose head is at `addr`, coalescing with its buddy as
    /// far up as possible.
    pub fn free(&mut self, addr: usize) -> Result<(), MemoryError> {
        let idx = addr / PAGE_SIZE;
        if addr % PAGE_SIZE != 0 || idx >= self.frame_count {
            return Err(MemoryError::InvalidFree { addr });
        }
        let size = self.frames[idx].size;
        if size == 0 {
            return Err(MemoryError::InvalidFree { addr });
        }
        self.frames[idx].size = 0;

        let mut level = Self::find_level(size as usize);
        let mut block = idx >> level;
        self.levels[level].set(block);
        Self::list_push_front(
            &mut self.frames,
            &mut self.levels[level].head,
            (block << level) as u32,
        );

        while level < MAX_LEVEL {
            let buddy = block ^ 1;
            if buddy >= self.blocks_at(level) || !self.levels[level].test(buddy) {
                break;
            }
            self.levels[level].clear(block);
            Self::list_remove(
                &mut self.frames,
                &mut self.levels[level].head,
                (block << level) as u32,
            );
            self.levels[level].clear(buddy);
            Self::list_remove(
                &mut self.frames,
                &mut self.levels[level].head,
                (buddy << level) as u32,
            );

            block >>= 1;
            level += 1;
            self.levels[level].set(block);
            Self::list_push_front(
                &mut self.frames,
                &mut self.levels[level].head,
                (block << level) as u32,
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Copy-on-write reference counts
    // ------------------------------------------------------------------

    /// Bump the reference count of the frame containing `addr`.
    pub fn ref_inc(&mut self, addr: usize) {
        self.frames[addr / PAGE_SIZE].refcount += 1;
    }

    /// Drop one reference; returns the remaining count.
    pub fn ref_dec(&mut self, addr: usize) -> u32 {
        let frame = &mut self.frames[addr / PAGE_SIZE];
        frame.refcount = frame.refcount.saturating_sub(1);
        frame.refcount
    }

    /// Current reference count of the frame containing `addr`.
    pub fn refcount(&self, addr: usize) -> u32 {
        self.frames[addr / PAGE_SIZE].refcount
    }

    /// Is the frame containing `addr` currently serving a pool?
    pub fn is_pool_page(&self, addr: usize) -> bool {
        self.frames[addr / PAGE_SIZE].slot_size != 0
    }

    pub(super) fn frame_mut(&mut self, idx: usize) -> &mut Frame {
        &mut self.frames[idx]
    }

    pub(super) fn frame(&self, idx: usize) -> &Frame {
        &self.frames[idx]
    }

    // ------------------------------------------------------------------
    // Diagnostics (the shell's `freelist` view and the test suite)
    // ------------------------------------------------------------------

    /// Head frame indices on the free list of `level`, front first.
    pub fn free_list(&self, level: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.levels[level].head;
        while cur != NIL {
            out.push(cur as usize);
            cur = self.frames[cur as usize].next;
        }
        out
    }

    /// The free-block bitmap of `level` as booleans.
    pub fn bitmap(&self, level: usize) -> Vec<bool> {
        (0..self.blocks_at(level))
            .map(|b| self.levels[level].test(b))
            .collect()
    }

    /// Full allocator state: per-level free lists and bitmaps. Two equal
    /// snapshots mean the allocator is in an identical state.
    pub fn snapshot(&self) -> Vec<(Vec<usize>, Vec<bool>)> {
        (0..=MAX_LEVEL)
            .map(|l| (self.free_list(l), self.bitmap(l)))
            .collect()
    }

    /// Log the free lists, optionally with the bitmaps. Allocation-free,
    /// so it is safe to call while holding the allocator lock.
    pub fn log_free_lists(&self, show_bitmap: bool) {
        for level in 0..=MAX_LEVEL {
            crate::print!("[freelist] level {}: [", level);
            let mut cur = self.levels[level].head;
            let mut first = true;
            while cur != NIL {
                if !first {
                    crate::print!(", ");
                }
                first = false;
                crate::print!("{}", cur);
                cur = self.frames[cur as usize].next;
            }
            crate::println!("]");
            if show_bitmap {
                crate::print!("[bitmap] level {}: ", level);
                for block in 0..self.blocks_at(level) {
                    crate::print!("{}", u8::from(self.levels[level].test(block)));
                }
                crate::println!();
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    /// 128 pages, no reservations: everything merges into one level-7
    /// block.
    fn small_allocator() -> FrameAllocator {
        FrameAllocator::new(128 * PAGE_SIZE, &[])
    }

    const TOP: usize = 7; // log2(128)

    #[test]
    fn fresh_allocator_is_fully_merged() {
        let fa = small_allocator();
        for level in (0..=MAX_LEVEL).filter(|&l| l != TOP) {
            assert!(
                fa.free_list(level).is_empty(),
                "level {} should be empty before any split",
                level
            );
        }
        assert_eq!(fa.free_list(TOP), vec![0]);
    }

    #[test]
    fn alloc_free_round_trip_restores_exact_state() {
        let mut fa = small_allocator();
        let initial = fa.snapshot();
        for size in [1, PAGE_SIZE, 2 * PAGE_SIZE, PAGE_SIZE << MAX_LEVEL] {
            let addr = fa.alloc(size).expect("allocation should succeed");
            fa.free(addr).expect("free of a live block should succeed");
            assert_eq!(
                fa.snapshot(),
                initial,
                "free(alloc({:#x})) must restore the initial free lists",
                size
            );
        }
    }

    #[test]
    fn split_leaves_one_sibling_per_level() {
        let mut fa = small_allocator();
        // 0x4000 = 4 pages = level 2, carved out of the level-7 block:
        // one sibling remains free at each of levels 2..=6.
        let addr = fa.alloc(0x4000).expect("level-2 allocation");
        assert_eq!(addr, 0);
        for level in 2..TOP {
            assert_eq!(
                fa.free_list(level).len(),
                1,
                "exactly one split sibling at level {}",
                level
            );
        }
        assert_eq!(fa.free_list(0), Vec::<usize>::new());
        assert_eq!(fa.free_list(1), Vec::<usize>::new());
        assert_eq!(fa.free_list(TOP), Vec::<usize>::new());
    }

    #[test]
    fn buddies_coalesce_back_to_parent() {
        let mut fa = small_allocator();
        let a = fa.alloc(PAGE_SIZE).expect("first page");
        let b = fa.alloc(PAGE_SIZE).expect("second page");
        assert_eq!(b, a ^ PAGE_SIZE, "LIFO discipline hands out the buddy");
        fa.free(a).expect("free first");
        // The pair is split: freeing one must not yet merge.
        assert_eq!(fa.free_list(0).len(), 1);
        fa.free(b).expect("free second");
        assert!(
            fa.free_list(0).is_empty() && fa.free_list(1).is_empty(),
            "buddy pair must coalesce out of the low levels"
        );
    }

    #[test]
    fn lifo_front_insertion() {
        let mut fa = small_allocator();
        let a = fa.alloc(PAGE_SIZE).expect("a");
        let b = fa.alloc(PAGE_SIZE).expect("b");
        let c = fa.alloc(PAGE_SIZE).expect("c");
        fa.free(a).expect("free a");
        // No coalescing possible while b and c are live; a is at the front.
        assert_eq!(fa.free_list(0)[0], a / PAGE_SIZE);
        let again = fa.alloc(PAGE_SIZE).expect("realloc");
        assert_eq!(again, a, "LIFO: the most recently freed block comes back");
        for addr in [again, b, c] {
            fa.free(addr).expect("cleanup");
        }
    }

    #[test]
    fn reserved_pages_never_allocated() {
        let reserved = [
            ReservedRegion {
                start: 0,
                size: 0x6000,
                tag: "tables",
            },
            ReservedRegion {
                start: 0x10000,
                size: 0x2500,
                tag: "image",
            },
        ];
        let fa = FrameAllocator::new(64 * PAGE_SIZE, &reserved);
        let mut reserved_frames = alloc::vec::Vec::new();
        reserved_frames.extend(0..6); // 0x0..0x6000
        reserved_frames.extend(16..19); // 0x10000..0x12500 touches 3 pages
        for level in 0..=MAX_LEVEL {
            for head in fa.free_list(level) {
                let span = 1 << level;
                for frame in head..head + span {
                    assert!(
                        !reserved_frames.contains(&frame),
                        "reserved frame {} on level-{} free list",
                        frame,
                        level
                    );
                }
            }
        }
    }

    #[test]
    fn exhaustive_alloc_until_oom() {
        let mut fa = FrameAllocator::new(8 * PAGE_SIZE, &[]);
        let mut held = Vec::new();
        while let Ok(addr) = fa.alloc(PAGE_SIZE) {
            held.push(addr);
        }
        assert_eq!(held.len(), 8);
        assert!(matches!(
            fa.alloc(PAGE_SIZE),
            Err(MemoryError::OutOfMemory { .. })
        ));
        let initial_after_drain: Vec<usize> = Vec::new();
        assert_eq!(fa.free_list(0), initial_after_drain);
        for addr in held {
            fa.free(addr).expect("give back");
        }
        // Everything coalesces into the single level-3 block again.
        assert_eq!(fa.free_list(3), vec![0]);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut fa = small_allocator();
        let addr = fa.alloc(PAGE_SIZE).expect("page");
        fa.free(addr).expect("first free");
        assert!(matches!(
            fa.free(addr),
            Err(MemoryError::InvalidFree { .. })
        ));
        // Freeing a non-head interior address is also invalid.
        let big = fa.alloc(4 * PAGE_SIZE).expect("level-2 block");
        assert!(matches!(
            fa.free(big + PAGE_SIZE),
            Err(MemoryError::InvalidFree { .. })
        ));
        fa.free(big).expect("head free is fine");
    }

    #[test]
    fn zero_and_oversized_requests_fail() {
        let mut fa = small_allocator();
        assert!(matches!(fa.alloc(0), Err(MemoryError::InvalidSize { .. })));
        assert!(matches!(
            fa.alloc((PAGE_SIZE << MAX_LEVEL) + 1),
            Err(MemoryError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn refcounts_track_per_frame() {
        let mut fa = small_allocator();
        let addr = fa.alloc(PAGE_SIZE).expect("page");
        assert_eq!(fa.refcount(addr), 0);
        fa.ref_inc(addr);
        fa.ref_inc(addr);
        assert_eq!(fa.refcount(addr), 2);
        assert_eq!(fa.ref_dec(addr), 1);
        assert_eq!(fa.ref_dec(addr), 0);
        fa.free(addr).expect("cleanup");
    }
}

//! Small-object pools carved from buddy pages.
//!
//! One pool per size in [`POOL_SIZES`]. A pool keeps a list of pages it has
//! claimed from the buddy; each page dispenses `PAGE_SIZE / slot_size`
//! slots tracked by a per-frame slot bitmap (bit set = slot free). A page
//! whose slots all come back is returned to the buddy.

use crate::config::{PAGE_SIZE, POOL_SIZES};
use crate::error::MemoryError;
use crate::mm::buddy::{FrameAllocator, NIL};

impl FrameAllocator {
    /// Index of the smallest pool serving `size` bytes, if any.
    pub fn pool_index(size: usize) -> Option<usize> {
        POOL_SIZES.iter().position(|&s| s >= size)
    }

    /// Allocate a small object. Falls back on claiming a fresh page from
    /// the buddy when no listed page has a free slot.
    pub fn alloc_small(&mut self, size: usize) -> Result<usize, MemoryError> {
        let pool = match Self::pool_index(size) {
            Some(p) => p,
            None => return Err(MemoryError::InvalidSize { requested: size }),
        };
        let slot_size = POOL_SIZES[pool];
        let slots = PAGE_SIZE / slot_size;

        // First listed page with a free slot. Full pages stay on the list;
        // they regain slots when objects come back.
        let mut page = self.pools[pool];
        while page != NIL {
            if self.frame(page as usize).slot_free > 0 {
                break;
            }
            page = self.frame(page as usize).next;
        }

        if page == NIL {
            let addr = self.alloc(PAGE_SIZE)?;
            page = (addr / PAGE_SIZE) as u32;
            self.push_pool_page(pool, page);
            let frame = self.frame_mut(page as usize);
            frame.slot_bitmap = if slots == 128 {
                u128::MAX
            } else {
                (1u128 << slots) - 1
            };
            frame.slot_size = slot_size as u16;
            frame.slot_free = slots as u16;
        }

        let frame = self.frame_mut(page as usize);
        let slot = frame.slot_bitmap.trailing_zeros() as usize;
        debug_assert!(slot < slots);
        frame.slot_bitmap &= !(1u128 << slot);
        frame.slot_free -= 1;

        Ok(page as usize * PAGE_SIZE + slot * slot_size)
    }

    /// Return a small object. The slot is reconstructed from the offset
    /// within its page; giving back the last slot releases the page.
    pub fn free_small(&mut self, addr: usize) -> Result<(), MemoryError> {
        let page = addr / PAGE_SIZE;
        let frame = self.frame(page);
        let slot_size = frame.slot_size as usize;
        if slot_size == 0 {
            return Err(MemoryError::InvalidFree { addr });
        }
        let slot = (addr % PAGE_SIZE) / slot_size;
        if frame.slot_bitmap & (1u128 << slot) != 0 {
            // Slot already free
            return Err(MemoryError::InvalidFree { addr });
        }

        let slots = (PAGE_SIZE / slot_size) as u16;
        let frame = self.frame_mut(page);
        frame.slot_bitmap |= 1u128 << slot;
        frame.slot_free += 1;

        if frame.slot_free == slots {
            let pool = Self::pool_index(slot_size).expect("slot size came from POOL_SIZES");
            let frame = self.frame_mut(page);
            frame.slot_bitmap = 0;
            frame.slot_size = 0;
            frame.slot_free = 0;
            self.remove_pool_page(pool, page as u32);
            self.free(page * PAGE_SIZE)?;
        }
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn allocator() -> FrameAllocator {
        FrameAllocator::new(64 * PAGE_SIZE, &[])
    }

    #[test]
    fn pool_index_picks_smallest_fit() {
        assert_eq!(FrameAllocator::pool_index(1), Some(0));
        assert_eq!(FrameAllocator::pool_index(32), Some(0));
        assert_eq!(FrameAllocator::pool_index(33), Some(1));
        assert_eq!(FrameAllocator::pool_index(1024), Some(5));
        assert_eq!(FrameAllocator::pool_index(1025), None);
    }

    #[test]
    fn slots_fill_one_page_then_grow() {
        for &size in &POOL_SIZES {
            let mut fa = allocator();
            let slots = PAGE_SIZE / size;
            let initial = fa.snapshot();

            let mut addrs = Vec::new();
            for _ in 0..slots {
                addrs.push(fa.alloc_small(size).expect("slot within first page"));
            }
            let first_page = addrs[0] / PAGE_SIZE;
            for (i, &a) in addrs.iter().enumerate() {
                assert_eq!(a / PAGE_SIZE, first_page, "slot {} left the page", i);
                assert_eq!(a % size, 0, "slot {} misaligned", i);
            }
            let mut sorted = addrs.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), slots, "slots must be distinct");

            // One more object forces a second page from the buddy.
            let overflow = fa.alloc_small(size).expect("second page slot");
            assert_ne!(overflow / PAGE_SIZE, first_page);

            for a in addrs.into_iter().chain(core::iter::once(overflow)) {
                fa.free_small(a).expect("slot free");
            }
            assert_eq!(
                fa.snapshot(),
                initial,
                "empty pools must return their pages to the buddy (size {})",
                size
            );
        }
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut fa = allocator();
        let a = fa.alloc_small(64).expect("a");
        let b = fa.alloc_small(64).expect("b");
        fa.free_small(a).expect("free a");
        let c = fa.alloc_small(64).expect("c");
        assert_eq!(c, a, "lowest free slot first");
        fa.free_small(b).expect("cleanup b");
        fa.free_small(c).expect("cleanup c");
    }

    #[test]
    fn double_free_of_slot_is_rejected() {
        let mut fa = allocator();
        let a = fa.alloc_small(128).expect("a");
        let b = fa.alloc_small(128).expect("b, keeps the page alive");
        fa.free_small(a).expect("first free");
        assert!(matches!(
            fa.free_small(a),
            Err(MemoryError::InvalidFree { .. })
        ));
        // An address in a page no pool owns is invalid too.
        let plain = fa.alloc(PAGE_SIZE).expect("plain page");
        assert!(matches!(
            fa.free_small(plain + 8),
            Err(MemoryError::InvalidFree { .. })
        ));
        fa.free(plain).expect("cleanup page");
        fa.free_small(b).expect("cleanup b");
    }
}

//! Typed MMIO access.
//!
//! Peripheral drivers describe their register blocks with
//! `tock_registers::register_structs!` and reach them through this wrapper,
//! which derefs to the block at its kernel-half alias. The wrapper stores
//! only the base address, so it is `Sync` and lives in statics regardless
//! of the interior mutability of the registers behind it.

use core::marker::PhantomData;
use core::ops;

pub struct MMIODerefWrapper<T> {
    base_addr: usize,
    phantom: PhantomData<fn() -> T>,
}

impl<T> MMIODerefWrapper<T> {
    /// Create an instance.
    ///
    /// # Safety
    /// `base_addr` must be the virtual address of a live device register
    /// block laid out exactly as `T`, mapped as device memory.
    pub const unsafe fn new(base_addr: usize) -> Self {
        Self {
            base_addr,
            phantom: PhantomData,
        }
    }
}

impl<T> ops::Deref for MMIODerefWrapper<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: per the constructor contract.
        unsafe { &*(self.base_addr as *const _) }
    }
}

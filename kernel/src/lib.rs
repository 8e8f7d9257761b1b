//! LichenOS kernel library.
//!
//! A small preemptive kernel for Raspberry Pi 3-class boards: buddy +
//! slab physical memory, demand paging with copy-on-write fork, a
//! round-robin scheduler driven by the generic timer, signals, and a VFS
//! with tmpfs, initramfs and FAT32 backends.
//!
//! The library builds for `aarch64-unknown-none` (the kernel image) and
//! for the host, where the hardware layer is stubbed out and the standard
//! test harness exercises the core subsystems.

#![no_std]

extern crate alloc;

// Host target: link std so unit tests can allocate and assert normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootstrap;
pub mod config;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod irq;
pub mod klog;
pub mod mm;
pub mod sched;
pub mod signal;
pub mod sync;
pub mod syscall;
pub mod timer;

pub use bootstrap::kernel_main;

// On bare metal the kernel's own two-tier allocator backs `alloc`; the
// early bump heap serves until the buddy is initialized.
#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::kalloc::KernelAllocator = mm::kalloc::KernelAllocator;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

//! Fixed configuration of the kernel: memory map, table sizes, tick rate.
//!
//! Everything here is board- or policy-level and changes together, so it
//! lives in one place instead of being scattered across subsystems.

/// Size of one page / physical frame
pub const PAGE_SIZE: usize = 4096;

/// Physical memory managed by the buddy allocator: `[0, MEMORY_END)`
pub const MEMORY_END: usize = 0x3C00_0000;

/// Highest buddy level; the largest block is `PAGE_SIZE << MAX_LEVEL`
/// (256 MiB; the kernel allocates its thread table in one piece)
pub const MAX_LEVEL: usize = 16;

/// Slot sizes served by the small-object pools, ascending
pub const POOL_SIZES: [usize; 6] = [32, 64, 128, 256, 512, 1024];

/// Kernel high-half virtual offset
pub const KERNEL_VIRT_OFFSET: usize = 0xFFFF_0000_0000_0000;

/// Boot translation tables set up by the boot stub: PGD, PUD, two PMDs
pub const BOOT_PGD_ADDR: usize = 0x2000;
pub const BOOT_TABLES_END: usize = 0x8000;

/// Memory-mapped peripherals, identity-mapped into every user process
pub const PERIPHERAL_START: usize = 0x3C00_0000;
pub const PERIPHERAL_END: usize = 0x3F00_0000;

/// User image base
pub const USER_SPACE: usize = 0x0;

/// Top of the user stack (exclusive); the stack occupies the pages below
pub const USER_STACK_BASE: usize = 0xFFFF_FFFF_F000;

/// User stack size
pub const USTACK_SIZE: usize = 0x10000;

/// Per-thread kernel stack size
pub const KSTACK_SIZE: usize = 0x10000;

/// Fixed virtual address of the signal-handler wrapper page
pub const USER_SIGNAL_WRAPPER_VA: usize = 0xFFFF_FFF0_0000;

/// Highest pid; the process table has `PID_MAX + 1` slots
pub const PID_MAX: usize = 1024;

/// Highest signal number
pub const SIGNAL_MAX: usize = 64;

/// Highest file descriptor; the fd table has `MAX_FD + 1` slots
pub const MAX_FD: usize = 15;

/// Longest path accepted by the VFS
pub const MAX_PATH_NAME: usize = 255;

/// Longest single path component stored by tmpfs
pub const FILE_NAME_MAX: usize = 15;

/// Directory capacity of tmpfs and initramfs directories
pub const MAX_DIR_ENTRY: usize = 16;

/// Directory capacity mirrored in memory for a FAT32 directory
pub const FAT32_MAX_DIR_ENTRY: usize = 64;

/// Deferred-task priority of UART interrupts
pub const UART_IRQ_PRIORITY: i32 = 10;

/// Deferred-task priority of the core timer
pub const TIMER_IRQ_PRIORITY: i32 = 0;

/// "No deferred task running" priority sentinel
pub const IDLE_IRQ_PRIORITY: i32 = 999;

/// The scheduler tick fires every `timer_freq >> SCHED_TICK_SHIFT` counts
pub const SCHED_TICK_SHIFT: u32 = 5;

/// Comparator slack used when the timer queue is empty (seconds)
pub const TIMER_IDLE_SECONDS: u64 = 10_000;

//! Kernel-wide error types.
//!
//! Each subsystem has its own small error enum; `KernelError` ties them
//! together so `?` propagates across layers. Syscall paths translate these
//! into the negative return values user space sees.

use core::fmt;

/// Top-level kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory allocator errors
    Memory(MemoryError),
    /// Scheduler / process table errors
    Sched(SchedError),
    /// Filesystem errors
    Fs(FsError),
    /// Range-checked syscall arguments (pid, signal number, fd, ...)
    BadArgument {
        what: &'static str,
    },
    /// Subsystem used before its init() ran
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Physical memory allocator errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// Buddy or pool exhaustion
    OutOfMemory { requested: usize },
    /// Freeing an address that is not the head of a live allocation
    InvalidFree { addr: usize },
    /// Request outside the representable size range (0 or > max block)
    InvalidSize { requested: usize },
}

/// Scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// All process-table slots are occupied
    TableFull,
    /// Pid out of range or slot not live
    NoSuchThread { pid: usize },
}

/// Filesystem errors, mapped to negative syscall returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path component does not exist
    NotFound,
    /// Component name exceeds the fixed limit
    NameTooLong,
    /// Directory has no free entry slot
    DirectoryFull,
    /// Create target already exists
    Exists,
    /// Lookup descended into a non-directory
    NotADirectory,
    /// Write/create/mkdir on a read-only filesystem
    ReadOnly,
    /// Seek or read past the end of the backing store
    OutOfRange,
    /// Operation not provided by this node's operations table
    NotSupported,
    /// Unknown filesystem name in mount()
    UnknownFilesystem,
    /// Block-device failure or bad on-disk structure
    Io,
    /// FAT has no free cluster left
    NoFreeCluster,
    /// File descriptor table is full or fd not open
    BadFileDescriptor,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Result type alias for filesystem operations
pub type FsResult<T> = Result<T, FsError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(e) => write!(f, "memory error: {}", e),
            Self::Sched(e) => write!(f, "scheduler error: {:?}", e),
            Self::Fs(e) => write!(f, "filesystem error: {:?}", e),
            Self::BadArgument { what } => write!(f, "bad argument: {}", what),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: requested {} bytes", requested)
            }
            Self::InvalidFree { addr } => write!(f, "invalid free of {:#x}", addr),
            Self::InvalidSize { requested } => write!(f, "invalid size {:#x}", requested),
        }
    }
}

impl From<MemoryError> for KernelError {
    fn from(err: MemoryError) -> Self {
        Self::Memory(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::Sched(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

impl FsError {
    /// The value returned to user space in x0 for this error.
    ///
    /// The syscall ABI is flat: every filesystem failure is -1.
    pub fn to_errno(self) -> i64 {
        -1
    }
}

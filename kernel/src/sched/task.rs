//! Thread control block.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::context::CpuContext;
use crate::config::KSTACK_SIZE;
use crate::fs::file::FdTable;
use crate::mm::vma::VmArea;
use crate::mm::PhysicalAddress;
use crate::signal::SignalState;

/// Process identifier; also the thread-table index.
pub type Pid = usize;

/// Lifecycle of a thread-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Slot free; every other field is meaningless
    Idle,
    /// On the run ring, waiting for the CPU
    Ready,
    /// Currently executing
    Running,
    /// Exited; awaiting the idle thread's reaper
    Zombie,
}

/// One slot of the fixed process table.
pub struct Thread {
    pub pid: Pid,
    pub state: ThreadState,
    pub ctx: CpuContext,
    /// Physical base of the kernel stack; 0 while Idle
    pub kernel_stack: usize,
    /// Bytes of the loaded user image (sizes exec/fork copies)
    pub user_data_size: usize,
    pub vmas: Vec<VmArea>,
    pub signals: SignalState,
    pub fd_table: FdTable,
    pub cwd: String,
}

impl Thread {
    /// An empty Idle slot.
    pub fn idle_slot(pid: Pid) -> Self {
        Self {
            pid,
            state: ThreadState::Idle,
            ctx: CpuContext::default(),
            kernel_stack: 0,
            user_data_size: 0,
            vmas: Vec::new(),
            signals: SignalState::new(),
            fd_table: FdTable::new(),
            cwd: String::new(),
        }
    }

    /// Top of this thread's kernel stack (kernel virtual, grows down).
    pub fn kernel_stack_top(&self) -> u64 {
        (PhysicalAddress::new(self.kernel_stack).to_virt() + KSTACK_SIZE) as u64
    }
}

//! Fixed process table, run ring, context switch, reaper.
//!
//! Round-robin over a ring of live pids: `schedule()` demotes a Running
//! current thread to Ready, walks the ring forward past non-Ready entries,
//! and switches to the first Ready one. Zombies stay on the ring until the
//! idle thread reaps them.
//!
//! Everything here runs under the kernel lock; the `spin::Mutex` around the
//! table orders access against the host test harness, which has no
//! interrupt masking.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use super::task::{Pid, Thread, ThreadState};
use crate::arch::context::{self, CpuContext};
use crate::config::{KSTACK_SIZE, PAGE_SIZE, PID_MAX};
use crate::error::{KernelResult, SchedError};
use crate::fs::file::FdTable;
use crate::mm::{self, page_table, vma};
use crate::signal::SignalState;
use crate::sync;

pub struct Scheduler {
    threads: Vec<Thread>,
    /// Ring of live pids in round-robin order
    ring: VecDeque<Pid>,
    current: Pid,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            threads: (0..=PID_MAX).map(Thread::idle_slot).collect(),
            ring: VecDeque::new(),
            current: 0,
        }
    }

    pub fn current_pid(&self) -> Pid {
        self.current
    }

    pub fn thread(&self, pid: Pid) -> &Thread {
        &self.threads[pid]
    }

    pub fn thread_mut(&mut self, pid: Pid) -> &mut Thread {
        &mut self.threads[pid]
    }

    /// Hand the CPU to `pid` without a context switch. Boot-path only.
    pub fn set_current(&mut self, pid: Pid) {
        self.current = pid;
    }

    /// Lowest-index free slot.
    fn lowest_idle(&self) -> Option<Pid> {
        self.threads
            .iter()
            .position(|t| t.state == ThreadState::Idle)
    }

    /// Number of threads that could run right now.
    pub fn runnable(&self) -> usize {
        self.threads
            .iter()
            .filter(|t| matches!(t.state, ThreadState::Ready | ThreadState::Running))
            .count()
    }

    /// Round-robin selection: demote a Running current to Ready, then take
    /// the next Ready pid strictly after it on the ring (wrapping; the
    /// current thread itself is eligible again only after a full lap).
    pub fn pick_next(&mut self) -> Option<Pid> {
        if self.threads[self.current].state == ThreadState::Running {
            self.threads[self.current].state = ThreadState::Ready;
        }
        let len = self.ring.len();
        if len == 0 {
            return None;
        }
        let pos = self
            .ring
            .iter()
            .position(|&p| p == self.current)
            .unwrap_or(len - 1);
        for step in 1..=len {
            let candidate = self.ring[(pos + step) % len];
            if self.threads[candidate].state == ThreadState::Ready {
                self.threads[candidate].state = ThreadState::Running;
                self.current = candidate;
                return Some(candidate);
            }
        }
        None
    }

    /// Claim a slot and put it on the ring in Ready state. The caller has
    /// already allocated the kernel stack and root page table.
    fn activate(
        &mut self,
        pid: Pid,
        entry: u64,
        kernel_stack: usize,
        pgd: usize,
        user_data_size: usize,
    ) {
        let top = (mm::PhysicalAddress::new(kernel_stack).to_virt() + KSTACK_SIZE) as u64;
        let t = &mut self.threads[pid];
        t.state = ThreadState::Ready;
        t.kernel_stack = kernel_stack;
        t.user_data_size = user_data_size;
        t.ctx = CpuContext {
            lr: entry,
            sp: top,
            fp: top,
            pgd: pgd as u64,
            ..CpuContext::default()
        };
        t.vmas = Vec::new();
        t.signals = SignalState::new();
        t.fd_table = FdTable::new();
        t.cwd = String::from("/");
        self.ring.push_back(pid);
    }

    fn remove_from_ring(&mut self, pid: Pid) {
        self.ring.retain(|&p| p != pid);
    }
}

lazy_static! {
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

/// Create the idle thread (pid 0) and make it current. Called once at boot,
/// before interrupts are live.
pub fn init() {
    let pid = thread_create(idle_entry as usize as u64, 0).expect("idle thread creation");
    let mut s = SCHEDULER.lock();
    s.current = pid;
    log::info!("scheduler: idle thread is pid {}", pid);
}

extern "C" fn idle_entry() {
    idle_loop();
}

/// The idle thread: reap zombies, yield, repeat.
pub fn idle_loop() -> ! {
    loop {
        kill_zombies();
        schedule();
    }
}

// The IRQ router takes SCHEDULER on a single CPU, so every acquisition
// must run with IRQs masked; otherwise a tick taken while the mutex is
// held spins forever.

pub fn current_pid() -> Pid {
    let _g = sync::KernelLockGuard::acquire();
    SCHEDULER.lock().current_pid()
}

/// Run `f` on the current thread's slot, with IRQs masked.
pub fn with_current<R>(f: impl FnOnce(&mut Thread) -> R) -> R {
    let _g = sync::KernelLockGuard::acquire();
    let mut s = SCHEDULER.lock();
    let pid = s.current;
    f(s.thread_mut(pid))
}

/// Run `f` on an arbitrary slot, with IRQs masked.
pub fn with_thread<R>(pid: Pid, f: impl FnOnce(&mut Thread) -> R) -> KernelResult<R> {
    if pid > PID_MAX {
        return Err(SchedError::NoSuchThread { pid }.into());
    }
    let _g = sync::KernelLockGuard::acquire();
    let mut s = SCHEDULER.lock();
    Ok(f(s.thread_mut(pid)))
}

/// Threads currently Ready or Running.
pub fn runnable_count() -> usize {
    let _g = sync::KernelLockGuard::acquire();
    SCHEDULER.lock().runnable()
}

/// Allocate a fresh thread: lowest-index Idle slot, kernel stack and zeroed
/// root page table from the buddy, default signal handlers, appended to the
/// run ring.
pub fn thread_create(entry: u64, user_data_size: usize) -> KernelResult<Pid> {
    sync::lock();
    let result = (|| {
        let pid = {
            let s = SCHEDULER.lock();
            s.lowest_idle().ok_or(SchedError::TableFull)?
        };
        let (kernel_stack, pgd) = {
            let mut fa = mm::frame_allocator().lock();
            let kernel_stack = fa.alloc(KSTACK_SIZE)?;
            let pgd = fa.alloc(PAGE_SIZE)?;
            (kernel_stack, pgd)
        };
        // SAFETY: the page was just allocated for us.
        unsafe { mm::zero_page(mm::PhysicalAddress::new(pgd)) };
        SCHEDULER
            .lock()
            .activate(pid, entry, kernel_stack, pgd, user_data_size);
        Ok(pid)
    })();
    sync::unlock();
    result
}

/// Yield the CPU: pick the next Ready thread and switch to it.
pub fn schedule() {
    sync::lock();
    let switch = {
        let mut s = SCHEDULER.lock();
        let prev = s.current;
        match s.pick_next() {
            Some(next) if next != prev => {
                let prev_ptr = &mut s.threads[prev].ctx as *mut CpuContext;
                let next_ptr = &s.threads[next].ctx as *const CpuContext;
                Some((prev_ptr, next_ptr))
            }
            _ => None,
        }
    };
    if let Some((prev, next)) = switch {
        // SAFETY: single CPU with IRQs masked; both pointers target slots
        // of the fixed-size thread table, which is never reallocated, and
        // the switch target was just marked Running so nobody else selects
        // it.
        unsafe { context::cpu_switch_to(prev, next) };
    }
    sync::unlock();
}

/// Terminate the calling thread. Does not return to user mode; the slot is
/// reclaimed later by the reaper.
pub fn exit_current() {
    sync::lock();
    {
        let mut s = SCHEDULER.lock();
        let pid = s.current;
        s.thread_mut(pid).state = ThreadState::Zombie;
    }
    sync::unlock();
    schedule();
}

/// Reap every Zombie: off the ring, VMAs released, page tables and kernel
/// stack returned to the buddy, slot back to Idle.
pub fn kill_zombies() {
    sync::lock();
    {
        let mut s = SCHEDULER.lock();
        let zombies: Vec<Pid> = s
            .threads
            .iter()
            .filter(|t| t.state == ThreadState::Zombie)
            .map(|t| t.pid)
            .collect();
        for pid in zombies {
            s.remove_from_ring(pid);
            let (mut vmas, kernel_stack, pgd) = {
                let t = s.thread_mut(pid);
                let vmas = core::mem::take(&mut t.vmas);
                let stack = t.kernel_stack;
                let pgd = t.ctx.pgd as usize;
                t.fd_table = FdTable::new();
                t.kernel_stack = 0;
                t.state = ThreadState::Idle;
                (vmas, stack, pgd)
            };
            let mut fa = mm::frame_allocator().lock();
            vma::release_vmas(&mut fa, &mut vmas);
            // SAFETY: the thread is off the ring and will never run again;
            // its table tree belongs to no live TTBR0.
            unsafe { page_table::free_page_tables(&mut fa, pgd, 0) };
            if let Err(e) = fa.free(pgd).and_then(|_| fa.free(kernel_stack)) {
                panic!("reaping pid {} failed: {}", pid, e);
            }
            crate::arch::tlb_invalidate_all();
        }
    }
    sync::unlock();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    /// Put `n` fake Ready threads on a private scheduler, pid 0 current.
    fn fake_scheduler(n: usize) -> Scheduler {
        let mut s = Scheduler::new();
        for pid in 0..n {
            s.threads[pid].state = ThreadState::Ready;
            s.ring.push_back(pid);
        }
        s.threads[0].state = ThreadState::Running;
        s.current = 0;
        s
    }

    #[test]
    fn round_robin_visits_everyone_between_repeats() {
        let n = 5;
        let mut s = fake_scheduler(n);
        let mut last_seen = alloc::vec![0usize; n];
        for step in 1..=50usize {
            let picked = s.pick_next().expect("always a ready thread");
            if last_seen[picked] != 0 {
                assert_eq!(
                    step - last_seen[picked],
                    n,
                    "thread {} ran again before the others had a turn",
                    picked
                );
            }
            last_seen[picked] = step;
        }
    }

    #[test]
    fn non_ready_threads_are_skipped() {
        let mut s = fake_scheduler(4);
        s.threads[2].state = ThreadState::Zombie;
        let mut picks = alloc::vec::Vec::new();
        for _ in 0..6 {
            picks.push(s.pick_next().expect("ready threads remain"));
        }
        assert!(!picks.contains(&2), "zombie must never be selected");
        assert_eq!(picks, alloc::vec![1, 3, 0, 1, 3, 0]);
    }

    #[test]
    fn sole_ready_thread_is_repicked() {
        let mut s = fake_scheduler(3);
        s.threads[1].state = ThreadState::Zombie;
        s.threads[2].state = ThreadState::Zombie;
        assert_eq!(s.pick_next(), Some(0));
        assert_eq!(s.pick_next(), Some(0));
    }

    #[test]
    fn empty_ring_yields_none() {
        let mut s = Scheduler::new();
        assert_eq!(s.pick_next(), None);
    }

    #[test]
    fn lowest_idle_slot_is_chosen() {
        let mut s = fake_scheduler(3);
        assert_eq!(s.lowest_idle(), Some(3));
        s.threads[1].state = ThreadState::Idle;
        assert_eq!(s.lowest_idle(), Some(1));
    }

    #[test]
    fn reaped_pid_leaves_the_ring() {
        let mut s = fake_scheduler(3);
        s.remove_from_ring(1);
        assert_eq!(s.ring, alloc::collections::VecDeque::from([0, 2]));
    }

    #[test]
    fn runnable_counts_ready_and_running() {
        let mut s = fake_scheduler(4);
        assert_eq!(s.runnable(), 4);
        s.threads[3].state = ThreadState::Zombie;
        assert_eq!(s.runnable(), 3);
    }
}

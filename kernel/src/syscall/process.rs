//! Process-management system calls: getpid, exec, fork, exit, kill,
//! mbox_call, mmap.

use alloc::string::String;
use alloc::vec::Vec;

use super::{user_cstr, user_slice};
use crate::arch::context::{store_context, CpuContext};
use crate::arch::trap::Trapframe;
use crate::config::{
    KSTACK_SIZE, PAGE_SIZE, PERIPHERAL_START, PID_MAX, USER_SIGNAL_WRAPPER_VA, USER_SPACE,
    USER_STACK_BASE,
};
use crate::fs::{self, path::path_to_absolute, OpenFlags};
use crate::mm::vma::{self, VmaProt};
use crate::mm::{self, fault, page_table, PhysicalAddress};
use crate::sched::{self, exec, scheduler::SCHEDULER, ThreadState};
use crate::signal::SignalState;
use crate::sync;

pub fn sys_getpid(tpf: &mut Trapframe) {
    tpf.set_return(sched::current_pid() as u64);
}

/// Replace the calling process's image with the named executable. The old
/// address space is torn down, fds reset onto the UART, handlers reset, and
/// the trapframe rewritten to resume at `USER_SPACE`.
pub fn sys_exec(tpf: &mut Trapframe, name_ptr: u64) {
    // SAFETY: name comes from the syscall ABI.
    let Some(name) = (unsafe { user_cstr(name_ptr) }) else {
        tpf.set_return(-1i64 as u64);
        return;
    };
    let abs = sched::with_current(|t| path_to_absolute(&name, &t.cwd));
    log::info!("exec {}", abs);

    let mut image = match fs::open(&abs, OpenFlags::empty()) {
        Ok(f) => f,
        Err(_) => {
            tpf.set_return(-1i64 as u64);
            return;
        }
    };
    let size = match image.size() {
        Ok(s) => s as usize,
        Err(_) => {
            tpf.set_return(-1i64 as u64);
            return;
        }
    };

    sync::lock();
    {
        let mut s = SCHEDULER.lock();
        let pid = s.current_pid();
        let pgd = {
            let t = s.thread_mut(pid);
            t.cwd = String::from("/");
            t.fd_table.clear();
            t.user_data_size = size;
            t.ctx.pgd as usize
        };

        {
            let t = s.thread_mut(pid);
            {
                let mut fa = mm::frame_allocator().lock();
                // Drop the old mappings and the whole translation tree;
                // the root page is reused zeroed.
                vma::release_vmas(&mut fa, &mut t.vmas);
                // SAFETY: this is the calling thread's own tree; the TLB
                // is flushed before any user access can happen.
                unsafe {
                    page_table::free_page_tables(&mut fa, pgd, 0);
                    mm::zero_page(PhysicalAddress::new(pgd));
                }
            }
            crate::arch::tlb_invalidate_all();

            if let Err(e) = exec::load_user_image(t, &mut image, size) {
                panic!("exec: image load failed: {}", e);
            }
            if let Err(e) = exec::add_stack_vmas(t) {
                panic!("exec: stack allocation failed: {}", e);
            }
            exec::add_fixed_vmas(t);
            t.signals.reset_handlers();
        }

        exec::open_standard_fds(s.thread_mut(pid));
    }
    sync::unlock();

    tpf.elr_el1 = USER_SPACE as u64;
    tpf.sp_el0 = USER_STACK_BASE as u64;
    tpf.set_return(0);
}

/// Fork the calling process. Parent and child share every data page
/// read-only (copy-on-write); the child's kernel stack is a byte copy of
/// the parent's, so both return from this function -- the parent with the
/// child pid, the child with 0 through its own relocated trapframe.
pub fn sys_fork(tpf: &mut Trapframe) {
    sync::lock();

    let parent_pid = sched::current_pid();
    let parent_size = sched::with_current(|t| t.user_data_size);

    let child_pid = match sched::thread_create(0, parent_size) {
        Ok(pid) => pid,
        Err(e) => {
            log::warn!("fork: {}", e);
            sync::unlock();
            tpf.set_return(-1i64 as u64);
            return;
        }
    };

    let mut s = SCHEDULER.lock();

    let (parent_vmas, parent_pgd, parent_kstack, parent_signals, parent_fds) = {
        let p = s.thread_mut(parent_pid);
        (
            p.vmas.clone(),
            p.ctx.pgd as usize,
            p.kernel_stack,
            SignalState::inherited(&p.signals),
            p.fd_table.clone(),
        )
    };
    let child_kstack = s.thread_mut(child_pid).kernel_stack;
    let child_pgd = s.thread_mut(child_pid).ctx.pgd as usize;
    let stack_offset = child_kstack as i64 - parent_kstack as i64;

    {
        let child = s.thread_mut(child_pid);
        for area in parent_vmas.iter() {
            // The peripheral window and the signal wrapper are
            // reinstalled fresh below, never shared.
            if area.virt_addr == USER_SIGNAL_WRAPPER_VA || area.virt_addr == PERIPHERAL_START {
                continue;
            }
            vma::add_vma(
                &mut child.vmas,
                area.virt_addr,
                area.area_size,
                area.phys_addr,
                area.prot,
                true,
            );
            for page in 0..area.area_size / PAGE_SIZE {
                let va = area.virt_addr + page * PAGE_SIZE;
                let pa = area.phys_addr + page * PAGE_SIZE;
                if let Err(e) =
                    fault::share_page_readonly(parent_pgd, child_pgd, va, pa, area.prot)
                {
                    panic!("fork: sharing {:#x} failed: {}", va, e);
                }
            }
        }
        exec::add_fixed_vmas(child);
        child.fd_table = parent_fds;
        child.signals = parent_signals;
    }
    crate::arch::tlb_invalidate_all();

    let parent_ctx_ptr = &mut s.thread_mut(parent_pid).ctx as *mut CpuContext;
    drop(s);

    // Capture the parent's callee-saved state. This call returns twice:
    // now in the parent, and again in the child once the scheduler loads
    // the patched copy of this context.
    // SAFETY: the pointer targets the parent's fixed table slot.
    unsafe { store_context(parent_ctx_ptr) };

    if sched::current_pid() == parent_pid {
        // First return. Duplicate the kernel stack *after* the capture so
        // every spill slot the second return reads is part of the copy,
        // then wire the child's context with its stack registers moved
        // onto the duplicate.
        // SAFETY: both stacks are KSTACK_SIZE buddy blocks owned by the
        // two threads; the child cannot run before the scheduler lock
        // below is released.
        unsafe {
            core::ptr::copy_nonoverlapping(
                PhysicalAddress::new(parent_kstack).to_virt() as *const u8,
                PhysicalAddress::new(child_kstack).to_virt() as *mut u8,
                KSTACK_SIZE,
            );
        }
        let mut s = SCHEDULER.lock();
        let parent_ctx = s.thread_mut(parent_pid).ctx;
        let child = s.thread_mut(child_pid);
        child.ctx = parent_ctx;
        child.ctx.pgd = child_pgd as u64;
        child.ctx.sp = (parent_ctx.sp as i64 + stack_offset) as u64;
        child.ctx.fp = (parent_ctx.fp as i64 + stack_offset) as u64;
        drop(s);
        sync::unlock();
        tpf.set_return(child_pid as u64);
    } else {
        // Second return, on the child's copied stack. The trapframe
        // pointer still aims into the parent's stack; shift it onto ours
        // and report pid 0.
        let child_tpf = (tpf as *mut Trapframe as i64 + stack_offset) as *mut Trapframe;
        sync::unlock();
        // SAFETY: the copied stack holds a bit-identical trapframe at the
        // same offset.
        unsafe { (*child_tpf).set_return(0) };
    }
}

pub fn sys_exit(_tpf: &mut Trapframe, _status: u64) {
    // The status argument is accepted and ignored.
    sched::exit_current();
}

/// Forward a property-channel message from user space to the mailbox.
pub fn sys_mbox_call(tpf: &mut Trapframe, _channel: u8, mbox_ptr: u64) {
    // First word of the message is its byte length.
    // SAFETY: syscall ABI pointer; faults are survivable.
    let len = unsafe { core::ptr::read(mbox_ptr as *const u32) } as usize;
    let words = (len / 4).min(36);
    let mut msg: Vec<u32> = Vec::with_capacity(words);
    // SAFETY: bounded by the message's own declared length.
    let bytes = unsafe { user_slice(mbox_ptr, (words * 4) as u64) };
    for chunk in bytes.chunks_exact(4) {
        msg.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }

    let ok = crate::drivers::mailbox::property_call(&mut msg);

    // SAFETY: same buffer, writing the reply back.
    let bytes = unsafe { super::user_slice_mut(mbox_ptr, (words * 4) as u64) };
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(msg.iter()) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    tpf.set_return(ok as u64);
}

/// Zombify `pid`. Out-of-range or non-live targets are ignored.
pub fn sys_kill(tpf: &mut Trapframe, pid: u64) {
    let pid = pid as usize;
    if pid > PID_MAX {
        tpf.set_return(-1i64 as u64);
        return;
    }
    sync::lock();
    let killed_self = {
        let mut s = SCHEDULER.lock();
        let current = s.current_pid();
        let t = s.thread_mut(pid);
        match t.state {
            ThreadState::Ready | ThreadState::Running => {
                t.state = ThreadState::Zombie;
                pid == current
            }
            _ => false,
        }
    };
    sync::unlock();
    tpf.set_return(0);
    if killed_self {
        sched::schedule();
    }
}

/// Anonymous mmap: reserve a region (page-rounded, moved past collisions),
/// back it with buddy frames and let demand paging map it.
pub fn sys_mmap(tpf: &mut Trapframe, args: [u64; 6]) {
    let (addr, len, prot) = (args[0] as usize, args[1] as usize, args[2]);
    if len == 0 {
        tpf.set_return(-1i64 as u64);
        return;
    }
    let len = vma::page_round_up(len);
    let prot = VmaProt::from_bits_truncate(prot);

    sync::lock();
    let result = {
        let mut s = SCHEDULER.lock();
        let pid = s.current_pid();
        let t = s.thread_mut(pid);
        let base = vma::mmap_pick_base(&t.vmas, addr, len);
        let backing = {
            let mut fa = mm::frame_allocator().lock();
            fa.alloc(len).map(|backing| {
                for page in 0..len / PAGE_SIZE {
                    fa.ref_inc(backing + page * PAGE_SIZE);
                }
                backing
            })
        };
        backing.map(|backing| {
            vma::add_vma(&mut t.vmas, base, len, backing, prot, true);
            base
        })
    };
    sync::unlock();

    match result {
        Ok(base) => tpf.set_return(base as u64),
        Err(e) => {
            log::warn!("mmap: {}", e);
            tpf.set_return(-1i64 as u64);
        }
    }
}

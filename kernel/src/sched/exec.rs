//! Building user address spaces: image load, stack, fixed mappings.
//!
//! Nothing here installs leaf page-table entries for image or stack pages;
//! they are described by VMAs and materialize on first touch through the
//! translation-fault path.

use crate::config::{
    PAGE_SIZE, PERIPHERAL_END, PERIPHERAL_START, USER_SIGNAL_WRAPPER_VA, USER_SPACE,
    USER_STACK_BASE, USTACK_SIZE,
};
use crate::error::KernelResult;
use crate::fs::{self, file::OpenFlags};
use crate::mm::vma::{self, VmaProt};
use crate::mm::PhysicalAddress;
use crate::sched::task::Thread;

/// rwx = 7: the flat user image and stack are fully permissive.
fn user_prot() -> VmaProt {
    VmaProt::READ | VmaProt::WRITE | VmaProt::EXEC
}

/// Allocate one refcounted user frame. The frame-allocator lock is scoped
/// to the call: nothing that can allocate through the global allocator
/// (VMA pushes, filesystem reads) may run while it is held.
fn alloc_user_frame() -> KernelResult<usize> {
    let mut fa = crate::mm::frame_allocator().lock();
    let page = fa.alloc(PAGE_SIZE)?;
    fa.ref_inc(page);
    Ok(page)
}

/// Load the user image: one owned, refcounted VMA per page, filled from the
/// file through the kernel alias of each fresh frame.
pub fn load_user_image(
    t: &mut Thread,
    file: &mut fs::file::File,
    size: usize,
) -> KernelResult<()> {
    let pages = size / PAGE_SIZE + 1;
    for i in 0..pages {
        let page = alloc_user_frame()?;
        // SAFETY: the frame was just allocated; its kernel alias is valid.
        let buf = unsafe {
            core::ptr::write_bytes(PhysicalAddress::new(page).to_virt() as *mut u8, 0, PAGE_SIZE);
            core::slice::from_raw_parts_mut(
                PhysicalAddress::new(page).to_virt() as *mut u8,
                PAGE_SIZE,
            )
        };
        let _ = file.read(buf);
        vma::add_vma(
            &mut t.vmas,
            USER_SPACE + i * PAGE_SIZE,
            PAGE_SIZE,
            page,
            user_prot(),
            true,
        );
    }
    Ok(())
}

/// Allocate the user stack, one owned VMA per page below `USER_STACK_BASE`.
pub fn add_stack_vmas(t: &mut Thread) -> KernelResult<()> {
    for i in 0..USTACK_SIZE / PAGE_SIZE {
        let page = alloc_user_frame()?;
        vma::add_vma(
            &mut t.vmas,
            USER_STACK_BASE - USTACK_SIZE + i * PAGE_SIZE,
            PAGE_SIZE,
            page,
            user_prot(),
            true,
        );
    }
    Ok(())
}

/// The two fixed mappings every process gets: the identity-mapped
/// peripheral window (read/write, no execute) and the read-only executable
/// signal-wrapper page.
pub fn add_fixed_vmas(t: &mut Thread) {
    vma::add_vma(
        &mut t.vmas,
        PERIPHERAL_START,
        PERIPHERAL_END - PERIPHERAL_START,
        PERIPHERAL_START,
        VmaProt::READ | VmaProt::WRITE,
        false,
    );
    vma::add_vma(
        &mut t.vmas,
        USER_SIGNAL_WRAPPER_VA,
        2 * PAGE_SIZE,
        crate::signal::wrapper_phys(),
        VmaProt::READ | VmaProt::EXEC,
        false,
    );
}

/// Open the UART device on fds 0, 1 and 2.
pub fn open_standard_fds(t: &mut Thread) {
    for fd in 0..3 {
        if t.fd_table.get(fd).is_none() {
            if let Ok(file) = fs::open("/dev/uart", OpenFlags::empty()) {
                let _ = t.fd_table.install_at(fd, file);
            }
        }
    }
}

/// Launch the first user program from the boot path. On success this does
/// not return: the CPU drops to EL0 at `USER_SPACE`.
#[cfg(target_arch = "aarch64")]
pub fn exec_first(path: &str) -> KernelResult<()> {
    use crate::arch::aarch64::switch;
    use crate::sched::scheduler::{self, SCHEDULER};
    use crate::{sync, timer};

    let mut file = fs::open(path, OpenFlags::empty())?;
    let size = file.size()? as usize;

    let pid = scheduler::thread_create(0, size)?;
    sync::lock();
    {
        let mut s = SCHEDULER.lock();
        {
            let t = s.thread_mut(pid);
            // Out of memory while building init is unrecoverable.
            if let Err(e) = load_user_image(t, &mut file, size) {
                panic!("init image load failed: {}", e);
            }
            if let Err(e) = add_stack_vmas(t) {
                panic!("init stack allocation failed: {}", e);
            }
            add_fixed_vmas(t);
            t.ctx.lr = USER_SPACE as u64;
            t.ctx.sp = USER_STACK_BASE as u64;
            t.ctx.fp = USER_STACK_BASE as u64;
            t.state = crate::sched::ThreadState::Running;
        }
        open_standard_fds(s.thread_mut(pid));
        s.set_current(pid);
    }
    timer::add_task(1, crate::sched::schedule_tick, 0, crate::config::TIMER_IRQ_PRIORITY);
    sync::unlock();

    let (ctx, kstack_top) = {
        let s = SCHEDULER.lock();
        (s.thread(pid).ctx, s.thread(pid).kernel_stack_top())
    };
    log::info!("entering user space: {} (pid {})", path, pid);
    // SAFETY: the address space was fully described above; demand paging
    // fills in the leaves.
    unsafe { switch::enter_user_space(&ctx, kstack_top) }
}

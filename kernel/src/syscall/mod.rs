//! System-call dispatch and the synchronous-exception routers.
//!
//! User mode traps in via `svc #0` with the call number in x8 and
//! arguments in x0..x5; results return in x0 through the trapframe.
//! Interrupts are re-enabled on entry. Pointer arguments are raw EL0
//! addresses dereferenced through the live user mapping; a bad pointer
//! faults into the demand-paging/segfault path like any other access.

pub mod filesystem;
pub mod process;

use alloc::string::String;

use crate::arch::trap::Trapframe;
use crate::config::MAX_PATH_NAME;

/// System call numbers (x8)
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Getpid = 0,
    UartRead = 1,
    UartWrite = 2,
    Exec = 3,
    Fork = 4,
    Exit = 5,
    MboxCall = 6,
    Kill = 7,
    Signal = 8,
    SigKill = 9,
    Mmap = 10,
    Open = 11,
    Close = 12,
    Write = 13,
    Read = 14,
    Mkdir = 15,
    Mount = 16,
    Chdir = 17,
    Lseek64 = 18,
    Ioctl = 19,
    SignalReturn = 50,
}

impl TryFrom<u64> for Syscall {
    type Error = u64;

    fn try_from(nr: u64) -> Result<Self, u64> {
        Ok(match nr {
            0 => Self::Getpid,
            1 => Self::UartRead,
            2 => Self::UartWrite,
            3 => Self::Exec,
            4 => Self::Fork,
            5 => Self::Exit,
            6 => Self::MboxCall,
            7 => Self::Kill,
            8 => Self::Signal,
            9 => Self::SigKill,
            10 => Self::Mmap,
            11 => Self::Open,
            12 => Self::Close,
            13 => Self::Write,
            14 => Self::Read,
            15 => Self::Mkdir,
            16 => Self::Mount,
            17 => Self::Chdir,
            18 => Self::Lseek64,
            19 => Self::Ioctl,
            50 => Self::SignalReturn,
            other => return Err(other),
        })
    }
}

/// Synchronous exceptions from EL0: syscalls and user memory aborts.
#[cfg(target_arch = "aarch64")]
#[no_mangle]
pub extern "C" fn el0_sync_router(tpf: &mut Trapframe, esr: u64) {
    use crate::arch::trap::{EsrInfo, EC_SVC64};

    crate::arch::irq_enable();
    let esr = EsrInfo(esr);
    match esr.ec() {
        EC_SVC64 => dispatch(tpf),
        _ if esr.is_memory_abort() => crate::mm::fault::handle_memory_abort(tpf, esr),
        _ => panic!(
            "unexpected EL0 exception: esr={:#x} elr={:#x}",
            esr.0, tpf.elr_el1
        ),
    }
    if tpf.from_el0() {
        crate::signal::check_signal(tpf);
    }
}

/// Synchronous exceptions at EL1: aborts taken while the kernel touches a
/// user buffer whose page has not faulted in yet.
#[cfg(target_arch = "aarch64")]
#[no_mangle]
pub extern "C" fn el1_sync_router(tpf: &mut Trapframe, esr: u64) {
    use crate::arch::trap::EsrInfo;

    let esr = EsrInfo(esr);
    if esr.is_memory_abort() {
        crate::mm::fault::handle_memory_abort(tpf, esr);
    } else {
        panic!(
            "kernel exception: esr={:#x} elr={:#x}",
            esr.0, tpf.elr_el1
        );
    }
}

/// Decode x8 and hand off to the implementation.
pub fn dispatch(tpf: &mut Trapframe) {
    let nr = tpf.x[8];
    let args = [tpf.x[0], tpf.x[1], tpf.x[2], tpf.x[3], tpf.x[4], tpf.x[5]];
    match Syscall::try_from(nr) {
        Ok(Syscall::Getpid) => process::sys_getpid(tpf),
        Ok(Syscall::UartRead) => filesystem::sys_uartread(tpf, args[0], args[1]),
        Ok(Syscall::UartWrite) => filesystem::sys_uartwrite(tpf, args[0], args[1]),
        Ok(Syscall::Exec) => process::sys_exec(tpf, args[0]),
        Ok(Syscall::Fork) => process::sys_fork(tpf),
        Ok(Syscall::Exit) => process::sys_exit(tpf, args[0]),
        Ok(Syscall::MboxCall) => process::sys_mbox_call(tpf, args[0] as u8, args[1]),
        Ok(Syscall::Kill) => process::sys_kill(tpf, args[0]),
        Ok(Syscall::Signal) => {
            let _ = crate::signal::register(args[0] as usize, args[1]);
        }
        Ok(Syscall::SigKill) => {
            let _ = crate::signal::post(args[0] as usize, args[1] as usize);
        }
        Ok(Syscall::Mmap) => process::sys_mmap(tpf, args),
        Ok(Syscall::Open) => filesystem::sys_open(tpf, args[0], args[1]),
        Ok(Syscall::Close) => filesystem::sys_close(tpf, args[0]),
        Ok(Syscall::Write) => filesystem::sys_write(tpf, args[0], args[1], args[2]),
        Ok(Syscall::Read) => filesystem::sys_read(tpf, args[0], args[1], args[2]),
        Ok(Syscall::Mkdir) => filesystem::sys_mkdir(tpf, args[0], args[1]),
        Ok(Syscall::Mount) => filesystem::sys_mount(tpf, args),
        Ok(Syscall::Chdir) => filesystem::sys_chdir(tpf, args[0]),
        Ok(Syscall::Lseek64) => filesystem::sys_lseek64(tpf, args[0], args[1], args[2]),
        Ok(Syscall::Ioctl) => filesystem::sys_ioctl(tpf, args[0], args[1], args[2]),
        Ok(Syscall::SignalReturn) => crate::signal::signal_return(tpf),
        Err(nr) => {
            log::warn!("unknown syscall {}", nr);
            tpf.set_return(-1i64 as u64);
        }
    }
}

/// View a user buffer through the current mapping.
///
/// # Safety
/// `ptr` must be a user address valid for `len` bytes in the current
/// address space; a stale mapping faults back into the kernel.
pub unsafe fn user_slice_mut<'a>(ptr: u64, len: u64) -> &'a mut [u8] {
    // SAFETY: caller contract.
    unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) }
}

/// As [`user_slice_mut`], read-only.
///
/// # Safety
/// As above.
pub unsafe fn user_slice<'a>(ptr: u64, len: u64) -> &'a [u8] {
    // SAFETY: caller contract.
    unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) }
}

/// Copy a NUL-terminated user string, bounded by the path limit.
///
/// # Safety
/// `ptr` must point at a NUL-terminated string in the current address
/// space.
pub unsafe fn user_cstr(ptr: u64) -> Option<String> {
    let mut out = String::new();
    for i in 0..=MAX_PATH_NAME as u64 {
        // SAFETY: caller contract; read byte-by-byte up to the bound.
        let b = unsafe { core::ptr::read((ptr + i) as *const u8) };
        if b == 0 {
            return Some(out);
        }
        out.push(b as char);
    }
    None
}

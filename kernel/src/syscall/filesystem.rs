//! File and console system calls.
//!
//! Descriptor-based operations briefly take the file out of the caller's
//! table, run the I/O without any kernel lock held (device reads may
//! sleep on interrupts), then put it back.

use super::{user_cstr, user_slice, user_slice_mut};
use crate::arch::trap::Trapframe;
use crate::config::MAX_FD;
use crate::drivers::uart;
use crate::fs::{self, file::File, path::path_to_absolute, OpenFlags};
use crate::sched;

const EFAIL: u64 = -1i64 as u64;

/// Resolve a user path argument against the caller's cwd.
fn user_path(ptr: u64) -> Option<alloc::string::String> {
    // SAFETY: syscall ABI pointer.
    let raw = unsafe { user_cstr(ptr) }?;
    Some(sched::with_current(|t| path_to_absolute(&raw, &t.cwd)))
}

/// Borrow fd `fd` out of the table for lock-free I/O.
fn take_fd(fd: u64) -> Option<(usize, File)> {
    let fd = fd as usize;
    if fd > MAX_FD {
        return None;
    }
    sched::with_current(|t| t.fd_table.remove(fd)).map(|f| (fd, f))
}

fn put_fd(fd: usize, file: File) {
    sched::with_current(|t| {
        let _ = t.fd_table.install_at(fd, file);
    });
}

pub fn sys_uartread(tpf: &mut Trapframe, buf: u64, len: u64) {
    // SAFETY: syscall ABI buffer.
    let buf = unsafe { user_slice_mut(buf, len) };
    for b in buf.iter_mut() {
        *b = uart::getc_async();
    }
    tpf.set_return(len);
}

pub fn sys_uartwrite(tpf: &mut Trapframe, buf: u64, len: u64) {
    // SAFETY: syscall ABI buffer.
    let buf = unsafe { user_slice(buf, len) };
    for &b in buf.iter() {
        uart::putc_async(b);
    }
    tpf.set_return(len);
}

pub fn sys_open(tpf: &mut Trapframe, path: u64, flags: u64) {
    let Some(abs) = user_path(path) else {
        tpf.set_return(EFAIL);
        return;
    };
    let flags = OpenFlags::from_bits_truncate(flags as u32);
    match fs::open(&abs, flags) {
        Ok(file) => {
            let installed = sched::with_current(|t| t.fd_table.install(file));
            match installed {
                Ok(fd) => tpf.set_return(fd as u64),
                Err(_) => tpf.set_return(EFAIL),
            }
        }
        Err(_) => tpf.set_return(EFAIL),
    }
}

pub fn sys_close(tpf: &mut Trapframe, fd: u64) {
    match take_fd(fd) {
        Some((_, file)) => {
            let _ = file.close();
            tpf.set_return(0);
        }
        None => tpf.set_return(EFAIL),
    }
}

pub fn sys_write(tpf: &mut Trapframe, fd: u64, buf: u64, count: u64) {
    let Some((fd, mut file)) = take_fd(fd) else {
        tpf.set_return(EFAIL);
        return;
    };
    // SAFETY: syscall ABI buffer.
    let data = unsafe { user_slice(buf, count) };
    let result = file.write(data);
    put_fd(fd, file);
    match result {
        Ok(n) => tpf.set_return(n as u64),
        Err(e) => tpf.set_return(e.to_errno() as u64),
    }
}

pub fn sys_read(tpf: &mut Trapframe, fd: u64, buf: u64, count: u64) {
    let Some((fd, mut file)) = take_fd(fd) else {
        tpf.set_return(EFAIL);
        return;
    };
    // SAFETY: syscall ABI buffer.
    let data = unsafe { user_slice_mut(buf, count) };
    let result = file.read(data);
    put_fd(fd, file);
    match result {
        Ok(n) => tpf.set_return(n as u64),
        Err(e) => tpf.set_return(e.to_errno() as u64),
    }
}

pub fn sys_mkdir(tpf: &mut Trapframe, path: u64, _mode: u64) {
    let Some(abs) = user_path(path) else {
        tpf.set_return(EFAIL);
        return;
    };
    match fs::mkdir(&abs) {
        Ok(_) => tpf.set_return(0),
        Err(e) => tpf.set_return(e.to_errno() as u64),
    }
}

/// mount(src, target, filesystem, flags, data): only the target and the
/// filesystem name participate.
pub fn sys_mount(tpf: &mut Trapframe, args: [u64; 6]) {
    let Some(target) = user_path(args[1]) else {
        tpf.set_return(EFAIL);
        return;
    };
    // SAFETY: syscall ABI string.
    let Some(fs_name) = (unsafe { user_cstr(args[2]) }) else {
        tpf.set_return(EFAIL);
        return;
    };
    match fs::mount(&target, &fs_name) {
        Ok(()) => tpf.set_return(0),
        Err(e) => tpf.set_return(e.to_errno() as u64),
    }
}

pub fn sys_chdir(tpf: &mut Trapframe, path: u64) {
    let Some(abs) = user_path(path) else {
        tpf.set_return(EFAIL);
        return;
    };
    sched::with_current(|t| t.cwd = abs);
    tpf.set_return(0);
}

pub fn sys_lseek64(tpf: &mut Trapframe, fd: u64, offset: u64, whence: u64) {
    let Some((fd, mut file)) = take_fd(fd) else {
        tpf.set_return(EFAIL);
        return;
    };
    let result = file.lseek64(offset as i64, whence as i32);
    put_fd(fd, file);
    match result {
        Ok(pos) => tpf.set_return(pos as u64),
        Err(e) => tpf.set_return(e.to_errno() as u64),
    }
}

pub fn sys_ioctl(tpf: &mut Trapframe, fd: u64, request: u64, arg: u64) {
    let Some((fd, mut file)) = take_fd(fd) else {
        tpf.set_return(EFAIL);
        return;
    };
    let result = file.ioctl(request, arg as usize);
    put_fd(fd, file);
    match result {
        Ok(v) => tpf.set_return(v as u64),
        Err(e) => tpf.set_return(e.to_errno() as u64),
    }
}

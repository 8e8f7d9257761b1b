//! Character-device file-ops tables: `/dev/uart` and `/dev/framebuffer`.
//!
//! Devices are ordinary vnodes created by `mknod`, which swaps their
//! file-ops for one of the tables registered here.

use alloc::sync::Arc;

use super::{FileOperations, FsError, FsResult, Vnode};
use crate::drivers::{framebuffer, uart};
use crate::fs::file::File;

/// Byte stream over the asynchronous mini-UART.
struct DevUartOps;

static DEV_UART: DevUartOps = DevUartOps;

impl FileOperations for DevUartOps {
    fn read(&self, _file: &mut File, buf: &mut [u8]) -> FsResult<usize> {
        for b in buf.iter_mut() {
            *b = uart::getc_async();
        }
        Ok(buf.len())
    }

    fn write(&self, _file: &mut File, buf: &[u8]) -> FsResult<usize> {
        for &b in buf {
            uart::putc_async(b);
        }
        Ok(buf.len())
    }

    fn getsize(&self, _vnode: &Arc<Vnode>) -> FsResult<i64> {
        Err(FsError::NotSupported)
    }

    fn lseek64(&self, _file: &mut File, _offset: i64, _whence: i32) -> FsResult<i64> {
        Err(FsError::NotSupported)
    }
}

/// Register the UART device table; returns the id `mknod` takes.
pub fn init_dev_uart() -> usize {
    super::register_device(&DEV_UART)
}

/// Linear-framebuffer device: writes land in GPU memory at the cursor,
/// `ioctl(0)` reports the geometry.
struct DevFramebufferOps;

static DEV_FRAMEBUFFER: DevFramebufferOps = DevFramebufferOps;

/// Geometry block returned by `ioctl(0)`, ABI-shared with user space.
#[repr(C)]
pub struct FramebufferInfo {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub isrgb: u32,
}

impl FileOperations for DevFramebufferOps {
    fn read(&self, _file: &mut File, _buf: &mut [u8]) -> FsResult<usize> {
        Err(FsError::NotSupported)
    }

    fn write(&self, file: &mut File, buf: &[u8]) -> FsResult<usize> {
        let fb = framebuffer::info().ok_or(FsError::NotSupported)?;
        let limit = (fb.pitch * fb.height) as u64;
        if file.f_pos >= limit {
            return Ok(0);
        }
        let n = buf.len().min((limit - file.f_pos) as usize);
        crate::sync::lock();
        // SAFETY: the linear framebuffer spans `pitch * height` bytes from
        // `lfb`; the range was just bounds-checked.
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                (fb.lfb + file.f_pos as usize) as *mut u8,
                n,
            );
        }
        crate::sync::unlock();
        file.f_pos += n as u64;
        Ok(n)
    }

    fn getsize(&self, _vnode: &Arc<Vnode>) -> FsResult<i64> {
        let fb = framebuffer::info().ok_or(FsError::NotSupported)?;
        Ok((fb.pitch * fb.height) as i64)
    }

    fn ioctl(&self, _file: &mut File, request: u64, arg: usize) -> FsResult<i64> {
        if request != 0 {
            return Err(FsError::NotSupported);
        }
        let fb = framebuffer::info().ok_or(FsError::NotSupported)?;
        let out = arg as *mut FramebufferInfo;
        // SAFETY: `arg` is a user pointer validated by the active user
        // mapping; a bad address faults and kills the caller, matching the
        // rest of the syscall surface.
        unsafe {
            (*out).width = fb.width;
            (*out).height = fb.height;
            (*out).pitch = fb.pitch;
            (*out).isrgb = fb.isrgb;
        }
        Ok(0)
    }
}

/// Bring up the framebuffer via the mailbox and register its device table.
pub fn init_dev_framebuffer() -> FsResult<usize> {
    framebuffer::init().map_err(|_| FsError::Io)?;
    Ok(super::register_device(&DEV_FRAMEBUFFER))
}

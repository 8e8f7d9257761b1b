//! Open files and the per-process descriptor table.

use alloc::sync::Arc;

use bitflags::bitflags;

use super::{FsError, FsResult, Vnode};
use crate::config::MAX_FD;

/// `lseek64` whence: absolute positioning (the only supported mode).
pub const SEEK_SET: i32 = 0;

bitflags! {
    /// Open flags, numerically compatible with the user-space ABI
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const CREATE = 0o100;
    }
}

/// An open file: a vnode plus a cursor. Cloning (fork) duplicates the
/// cursor, so parent and child seek independently.
#[derive(Clone)]
pub struct File {
    pub vnode: Arc<Vnode>,
    pub f_pos: u64,
    pub flags: OpenFlags,
}

impl File {
    /// Open a vnode. The node's file-ops get a veto via their `open` hook.
    pub fn open(vnode: Arc<Vnode>, flags: OpenFlags) -> FsResult<File> {
        vnode.file_ops().open(&vnode)?;
        Ok(File {
            vnode,
            f_pos: 0,
            flags,
        })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let ops = self.vnode.file_ops();
        ops.read(self, buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        let ops = self.vnode.file_ops();
        ops.write(self, buf)
    }

    pub fn lseek64(&mut self, offset: i64, whence: i32) -> FsResult<i64> {
        let ops = self.vnode.file_ops();
        ops.lseek64(self, offset, whence)
    }

    pub fn size(&self) -> FsResult<i64> {
        self.vnode.file_ops().getsize(&self.vnode)
    }

    pub fn ioctl(&mut self, request: u64, arg: usize) -> FsResult<i64> {
        let ops = self.vnode.file_ops();
        ops.ioctl(self, request, arg)
    }

    pub fn close(mut self) -> FsResult<()> {
        let ops = self.vnode.file_ops();
        ops.close(&mut self)
    }
}

/// Fixed-size descriptor table (`MAX_FD + 1` slots).
#[derive(Clone)]
pub struct FdTable {
    files: [Option<File>; MAX_FD + 1],
}

impl FdTable {
    pub fn new() -> Self {
        const EMPTY: Option<File> = None;
        Self {
            files: [EMPTY; MAX_FD + 1],
        }
    }

    /// Place `file` in the lowest free slot.
    pub fn install(&mut self, file: File) -> FsResult<usize> {
        for (fd, slot) in self.files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(fd);
            }
        }
        Err(FsError::BadFileDescriptor)
    }

    /// Place `file` at a specific descriptor.
    pub fn install_at(&mut self, fd: usize, file: File) -> FsResult<()> {
        if fd > MAX_FD {
            return Err(FsError::BadFileDescriptor);
        }
        self.files[fd] = Some(file);
        Ok(())
    }

    pub fn get(&self, fd: usize) -> Option<&File> {
        self.files.get(fd).and_then(|f| f.as_ref())
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut File> {
        self.files.get_mut(fd).and_then(|f| f.as_mut())
    }

    /// Take the file out of `fd`, leaving the slot free.
    pub fn remove(&mut self, fd: usize) -> Option<File> {
        self.files.get_mut(fd).and_then(|f| f.take())
    }

    /// Close everything (exec).
    pub fn clear(&mut self) {
        for slot in self.files.iter_mut() {
            if let Some(file) = slot.take() {
                let _ = file.close();
            }
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

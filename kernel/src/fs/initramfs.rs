//! initramfs: a read-only view of the boot CPIO (newc) archive.
//!
//! Mounting walks the archive once and registers every regular file as a
//! vnode whose data is a slice into the archive itself; nothing is copied.
//! Directory records are skipped (the view is flat, like the archive), and
//! all mutation is refused.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Once, RwLock};

use super::{
    FileOperations, Filesystem, FsError, FsResult, Mount, NodeData, NodeKind, Vnode,
    VnodeOperations,
};
use crate::fs::file::File;

/// initramfs vnode payload: a name and a window into the archive.
pub struct InitramfsInode {
    pub name: String,
    pub kind: NodeKind,
    pub data: &'static [u8],
    pub entries: RwLock<Vec<Arc<Vnode>>>,
}

pub struct Initramfs;

pub static INITRAMFS: Initramfs = Initramfs;

static ARCHIVE: Once<&'static [u8]> = Once::new();

/// Point the driver at the CPIO archive found by boot. Must precede the
/// mount.
pub fn set_archive(data: &'static [u8]) {
    ARCHIVE.call_once(|| data);
}

struct InitramfsVnodeOps;
struct InitramfsFileOps;

static VOPS: InitramfsVnodeOps = InitramfsVnodeOps;
static FOPS: InitramfsFileOps = InitramfsFileOps;

fn new_vnode(name: &str, kind: NodeKind, data: &'static [u8]) -> Arc<Vnode> {
    Vnode::new(
        &VOPS,
        &FOPS,
        NodeData::Initramfs(InitramfsInode {
            name: String::from(name),
            kind,
            data,
            entries: RwLock::new(Vec::new()),
        }),
    )
}

fn inode(vnode: &Vnode) -> &InitramfsInode {
    match &vnode.internal {
        NodeData::Initramfs(i) => i,
        _ => unreachable!("initramfs operation on a foreign vnode"),
    }
}

impl Filesystem for Initramfs {
    fn name(&self) -> &'static str {
        "initramfs"
    }

    fn setup_mount(&'static self) -> FsResult<Arc<Mount>> {
        let archive = ARCHIVE.get().ok_or(FsError::NotFound)?;
        let root = new_vnode("", NodeKind::Directory, &[]);
        {
            let root_inode = inode(&root);
            let mut entries = root_inode.entries.write();
            for record in CpioReader::new(archive) {
                let record = record?;
                if record.is_directory() {
                    continue;
                }
                entries.push(new_vnode(record.name, NodeKind::Regular, record.data));
            }
        }
        Ok(Arc::new(Mount { root, fs: self }))
    }
}

impl VnodeOperations for InitramfsVnodeOps {
    fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> FsResult<Arc<Vnode>> {
        let dir_inode = inode(dir);
        if dir_inode.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        dir_inode
            .entries
            .read()
            .iter()
            .find(|child| inode(child).name == name)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    fn create(&self, _dir: &Arc<Vnode>, _name: &str) -> FsResult<Arc<Vnode>> {
        Err(FsError::ReadOnly)
    }

    fn mkdir(&self, _dir: &Arc<Vnode>, _name: &str) -> FsResult<Arc<Vnode>> {
        Err(FsError::ReadOnly)
    }
}

impl FileOperations for InitramfsFileOps {
    fn read(&self, file: &mut File, buf: &mut [u8]) -> FsResult<usize> {
        let data = inode(&file.vnode).data;
        let pos = file.f_pos as usize;
        if pos >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        file.f_pos += n as u64;
        Ok(n)
    }

    fn write(&self, _file: &mut File, _buf: &[u8]) -> FsResult<usize> {
        Err(FsError::ReadOnly)
    }

    fn getsize(&self, vnode: &Arc<Vnode>) -> FsResult<i64> {
        Ok(inode(vnode).data.len() as i64)
    }
}

// ---------------------------------------------------------------------------
// CPIO newc parsing
// ---------------------------------------------------------------------------

const NEWC_MAGIC: &[u8; 6] = b"070701";
const NEWC_HEADER_LEN: usize = 110;
const NEWC_TRAILER: &str = "TRAILER!!!";

/// Offsets of the 8-hex-digit fields we consume.
const MODE_OFFSET: usize = 14;
const FILESIZE_OFFSET: usize = 54;
const NAMESIZE_OFFSET: usize = 94;

/// One archive member.
pub struct CpioRecord<'a> {
    pub name: &'a str,
    pub mode: u32,
    pub data: &'a [u8],
}

impl CpioRecord<'_> {
    pub fn is_directory(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }
}

/// Iterator over the members of a newc archive, stopping at the trailer.
pub struct CpioReader<'a> {
    archive: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> CpioReader<'a> {
    pub fn new(archive: &'a [u8]) -> Self {
        Self {
            archive,
            offset: 0,
            done: false,
        }
    }

    fn parse_next(&mut self) -> FsResult<Option<CpioRecord<'a>>> {
        let header = self
            .archive
            .get(self.offset..self.offset + NEWC_HEADER_LEN)
            .ok_or(FsError::Io)?;
        if &header[..6] != NEWC_MAGIC {
            return Err(FsError::Io);
        }

        let mode = hex_field(&header[MODE_OFFSET..MODE_OFFSET + 8])?;
        let filesize = hex_field(&header[FILESIZE_OFFSET..FILESIZE_OFFSET + 8])? as usize;
        let namesize = hex_field(&header[NAMESIZE_OFFSET..NAMESIZE_OFFSET + 8])? as usize;

        let name_start = self.offset + NEWC_HEADER_LEN;
        let name_bytes = self
            .archive
            .get(name_start..name_start + namesize)
            .ok_or(FsError::Io)?;
        // namesize includes the terminating NUL.
        let name = core::str::from_utf8(&name_bytes[..namesize.saturating_sub(1)])
            .map_err(|_| FsError::Io)?;

        if name == NEWC_TRAILER {
            return Ok(None);
        }

        let data_start = align4(name_start + namesize);
        let data = self
            .archive
            .get(data_start..data_start + filesize)
            .ok_or(FsError::Io)?;

        self.offset = align4(data_start + filesize);
        Ok(Some(CpioRecord { name, mode, data }))
    }
}

impl<'a> Iterator for CpioReader<'a> {
    type Item = FsResult<CpioRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.parse_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[inline]
fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn hex_field(bytes: &[u8]) -> FsResult<u32> {
    let s = core::str::from_utf8(bytes).map_err(|_| FsError::Io)?;
    u32::from_str_radix(s, 16).map_err(|_| FsError::Io)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// Build a newc record by hand: header, name (NUL-terminated, padded),
    /// data (padded).
    fn push_record(out: &mut Vec<u8>, name: &str, mode: u32, data: &[u8]) {
        let namesize = name.len() + 1;
        let mut header = alloc::format!(
            "070701{ino:08X}{mode:08X}{uid:08X}{gid:08X}{nlink:08X}{mtime:08X}\
             {filesize:08X}{devmaj:08X}{devmin:08X}{rdevmaj:08X}{rdevmin:08X}\
             {namesize:08X}{check:08X}",
            ino = 1,
            mode = mode,
            uid = 0,
            gid = 0,
            nlink = 1,
            mtime = 0,
            filesize = data.len(),
            devmaj = 0,
            devmin = 0,
            rdevmaj = 0,
            rdevmin = 0,
            namesize = namesize,
            check = 0,
        )
        .into_bytes();
        assert_eq!(header.len(), NEWC_HEADER_LEN);
        out.append(&mut header);
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }

    fn sample_archive() -> Vec<u8> {
        let mut a = Vec::new();
        push_record(&mut a, "hello.txt", 0o100644, b"hello world\n");
        push_record(&mut a, "bin", 0o040755, b"");
        push_record(&mut a, "bin/prog", 0o100755, &[0xDE, 0xAD, 0xBE, 0xEF, 0x01]);
        push_record(&mut a, "TRAILER!!!", 0, b"");
        a
    }

    #[test]
    fn walks_records_and_stops_at_trailer() {
        let archive = sample_archive();
        let records: Vec<_> = CpioReader::new(&archive)
            .map(|r| r.expect("well-formed archive"))
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].name, "hello.txt");
        assert_eq!(records[0].data, b"hello world\n");
        assert!(!records[0].is_directory());
        assert!(records[1].is_directory());
        assert_eq!(records[2].name, "bin/prog");
        assert_eq!(records[2].data.len(), 5);
    }

    #[test]
    fn bad_magic_is_an_error() {
        let mut archive = sample_archive();
        archive[0] = b'x';
        let first = CpioReader::new(&archive).next().expect("one item");
        assert_eq!(first.err(), Some(FsError::Io));
    }

    #[test]
    fn truncated_archive_is_an_error() {
        let archive = sample_archive();
        let cut = &archive[..40];
        let first = CpioReader::new(cut).next().expect("one item");
        assert_eq!(first.err(), Some(FsError::Io));
    }
}

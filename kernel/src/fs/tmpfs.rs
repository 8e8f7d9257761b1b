//! tmpfs: the in-memory filesystem backing the root mount.
//!
//! Directories hold a fixed number of children; every regular file is
//! backed by a single 4 KiB page, so file size is capped at `PAGE_SIZE`.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use super::{
    FileOperations, Filesystem, FsError, FsResult, Mount, NodeData, NodeKind, Vnode,
    VnodeOperations,
};
use crate::config::{FILE_NAME_MAX, MAX_DIR_ENTRY, PAGE_SIZE};
use crate::fs::file::File;

/// tmpfs vnode payload.
pub struct TmpfsInode {
    pub name: String,
    pub kind: NodeKind,
    /// Children, directories only
    pub entries: RwLock<Vec<Arc<Vnode>>>,
    /// Backing page and its used length, files only
    data: Mutex<TmpfsData>,
}

struct TmpfsData {
    page: Box<[u8]>,
    size: usize,
}

/// The tmpfs driver (stateless; all state hangs off the vnodes).
pub struct Tmpfs;

pub static TMPFS: Tmpfs = Tmpfs;

struct TmpfsVnodeOps;
struct TmpfsFileOps;

static VOPS: TmpfsVnodeOps = TmpfsVnodeOps;
static FOPS: TmpfsFileOps = TmpfsFileOps;

/// Build a fresh tmpfs vnode. Files get their 4 KiB page immediately.
pub fn new_vnode(name: &str, kind: NodeKind) -> Arc<Vnode> {
    Vnode::new(
        &VOPS,
        &FOPS,
        NodeData::Tmpfs(TmpfsInode {
            name: String::from(name),
            kind,
            entries: RwLock::new(Vec::new()),
            data: Mutex::new(TmpfsData {
                page: match kind {
                    NodeKind::Regular => vec![0u8; PAGE_SIZE].into_boxed_slice(),
                    NodeKind::Directory => Vec::new().into_boxed_slice(),
                },
                size: 0,
            }),
        }),
    )
}

fn inode(vnode: &Vnode) -> &TmpfsInode {
    match &vnode.internal {
        NodeData::Tmpfs(i) => i,
        _ => unreachable!("tmpfs operation on a foreign vnode"),
    }
}

impl Filesystem for Tmpfs {
    fn name(&self) -> &'static str {
        "tmpfs"
    }

    fn setup_mount(&'static self) -> FsResult<Arc<Mount>> {
        Ok(Arc::new(Mount {
            root: new_vnode("", NodeKind::Directory),
            fs: self,
        }))
    }
}

impl VnodeOperations for TmpfsVnodeOps {
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

    fn create(&self, dir: &Arc<Vnode>, name: &str) -> FsResult<Arc<Vnode>> {
        insert_child(dir, name, NodeKind::Regular)
    }

    fn mkdir(&self, dir: &Arc<Vnode>, name: &str) -> FsResult<Arc<Vnode>> {
        insert_child(dir, name, NodeKind::Directory)
    }
}

fn insert_child(dir: &Arc<Vnode>, name: &str, kind: NodeKind) -> FsResult<Arc<Vnode>> {
    if name.len() > FILE_NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    let dir_inode = inode(dir);
    if dir_inode.kind != NodeKind::Directory {
        return Err(FsError::NotADirectory);
    }
    let mut entries = dir_inode.entries.write();
    if entries
        .iter()
        .any(|child| inode(child).name == name && inode(child).kind == kind)
    {
        return Err(FsError::Exists);
    }
    if entries.len() >= MAX_DIR_ENTRY {
        return Err(FsError::DirectoryFull);
    }
    let child = new_vnode(name, kind);
    entries.push(child.clone());
    Ok(child)
}

impl FileOperations for TmpfsFileOps {
    fn read(&self, file: &mut File, buf: &mut [u8]) -> FsResult<usize> {
        let data = inode(&file.vnode).data.lock();
        let pos = file.f_pos as usize;
        if pos >= data.size {
            return Ok(0);
        }
        let n = buf.len().min(data.size - pos);
        buf[..n].copy_from_slice(&data.page[pos..pos + n]);
        file.f_pos += n as u64;
        Ok(n)
    }

    fn write(&self, file: &mut File, buf: &[u8]) -> FsResult<usize> {
        let mut data = inode(&file.vnode).data.lock();
        if data.page.is_empty() {
            return Err(FsError::NotSupported);
        }
        let pos = file.f_pos as usize;
        if pos >= PAGE_SIZE {
            return Ok(0);
        }
        let n = buf.len().min(PAGE_SIZE - pos);
        data.page[pos..pos + n].copy_from_slice(&buf[..n]);
        file.f_pos += n as u64;
        if file.f_pos as usize > data.size {
            data.size = file.f_pos as usize;
        }
        Ok(n)
    }

    fn getsize(&self, vnode: &Arc<Vnode>) -> FsResult<i64> {
        Ok(inode(vnode).data.lock().size as i64)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::file::SEEK_SET;
    use crate::fs::OpenFlags;

    fn root() -> Arc<Vnode> {
        new_vnode("", NodeKind::Directory)
    }

    fn open_at(dir: &Arc<Vnode>, name: &str) -> File {
        let vnode = VOPS.lookup(dir, name).expect("lookup after create");
        File::open(vnode, OpenFlags::empty()).expect("open")
    }

    #[test]
    fn write_seek_read_round_trip() {
        let root = root();
        VOPS.create(&root, "a").expect("create");
        let mut f = open_at(&root, "a");
        assert_eq!(f.write(b"abc").expect("write"), 3);
        assert_eq!(f.lseek64(0, SEEK_SET).expect("rewind"), 0);
        let mut buf = [0u8; 3];
        assert_eq!(f.read(&mut buf).expect("read"), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn lseek_past_size_is_refused() {
        let root = root();
        VOPS.create(&root, "a").expect("create");
        let mut f = open_at(&root, "a");
        f.write(b"xy").expect("write");
        assert_eq!(
            f.lseek64(100, SEEK_SET),
            Err(FsError::OutOfRange),
            "seek beyond datasize must fail"
        );
        assert_eq!(f.lseek64(1, SEEK_SET).expect("in-range seek"), 1);
    }

    #[test]
    fn file_size_is_capped_at_one_page() {
        let root = root();
        VOPS.create(&root, "big").expect("create");
        let mut f = open_at(&root, "big");
        let chunk = [7u8; PAGE_SIZE + 100];
        assert_eq!(f.write(&chunk).expect("clamped write"), PAGE_SIZE);
        assert_eq!(f.write(b"more").expect("write at cap"), 0);
        assert_eq!(f.size().expect("size"), PAGE_SIZE as i64);
    }

    #[test]
    fn reads_clamp_to_size_before_advancing() {
        let root = root();
        VOPS.create(&root, "short").expect("create");
        let mut f = open_at(&root, "short");
        f.write(b"12345").expect("write");
        f.lseek64(3, SEEK_SET).expect("seek");
        let mut buf = [0u8; 16];
        assert_eq!(f.read(&mut buf).expect("tail read"), 2);
        assert_eq!(&buf[..2], b"45");
        assert_eq!(f.read(&mut buf).expect("eof read"), 0);
    }

    #[test]
    fn name_length_and_capacity_limits() {
        let root = root();
        assert_eq!(
            VOPS.create(&root, "a-very-long-file-name").err(),
            Some(FsError::NameTooLong)
        );
        for i in 0..MAX_DIR_ENTRY {
            let name = alloc::format!("f{}", i);
            VOPS.create(&root, &name).expect("create within capacity");
        }
        assert_eq!(VOPS.create(&root, "overflow").err(), Some(FsError::DirectoryFull));
    }

    #[test]
    fn duplicate_names_and_non_directories_are_rejected() {
        let root = root();
        VOPS.create(&root, "dup").expect("first create");
        assert_eq!(VOPS.create(&root, "dup").err(), Some(FsError::Exists));
        let file = VOPS.lookup(&root, "dup").expect("lookup");
        assert_eq!(VOPS.lookup(&file, "x").err(), Some(FsError::NotADirectory));
        assert_eq!(VOPS.mkdir(&file, "x").err(), Some(FsError::NotADirectory));
    }

    #[test]
    fn directories_nest() {
        let root = root();
        let docs = VOPS.mkdir(&root, "docs").expect("mkdir");
        VOPS.create(&docs, "file1").expect("create nested");
        assert!(VOPS.lookup(&docs, "file1").is_ok());
        assert_eq!(VOPS.lookup(&root, "file1").err(), Some(FsError::NotFound));
    }
}

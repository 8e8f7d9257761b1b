//! Virtual file system.
//!
//! A mount tree rooted at a tmpfs. Every vnode carries two explicit
//! operations tables (`&'static dyn` vtables, one for path operations, one
//! for file I/O) over a tagged payload: tmpfs, initramfs or FAT32 state.
//! Character devices are ordinary vnodes whose file-ops table has been
//! swapped for a registered device table. Path resolution crosses a mount
//! boundary exactly when the current vnode carries a mount.

pub mod blockdev;
pub mod dev;
pub mod fat32;
pub mod file;
pub mod initramfs;
pub mod path;
pub mod tmpfs;

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Once, RwLock};

pub use crate::error::{FsError, FsResult};
pub use file::{FdTable, File, OpenFlags};

/// What a vnode is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    Regular,
}

/// Per-filesystem payload of a vnode.
pub enum NodeData {
    Tmpfs(tmpfs::TmpfsInode),
    Initramfs(initramfs::InitramfsInode),
    Fat32(fat32::Fat32Inode),
}

/// One node of the VFS tree.
pub struct Vnode {
    /// A filesystem mounted on this (directory) vnode; lookups follow it
    mount: RwLock<Option<Arc<Mount>>>,
    /// Path operations (lookup / create / mkdir)
    pub v_ops: &'static dyn VnodeOperations,
    /// File operations; swapped out for device nodes by `mknod`
    f_ops: RwLock<&'static dyn FileOperations>,
    pub internal: NodeData,
}

impl Vnode {
    pub fn new(
        v_ops: &'static dyn VnodeOperations,
        f_ops: &'static dyn FileOperations,
        internal: NodeData,
    ) -> Arc<Self> {
        Arc::new(Self {
            mount: RwLock::new(None),
            v_ops,
            f_ops: RwLock::new(f_ops),
            internal,
        })
    }

    pub fn kind(&self) -> NodeKind {
        match &self.internal {
            NodeData::Tmpfs(i) => i.kind,
            NodeData::Initramfs(i) => i.kind,
            NodeData::Fat32(i) => i.kind,
        }
    }

    /// Component name within the parent directory.
    pub fn name(&self) -> alloc::string::String {
        match &self.internal {
            NodeData::Tmpfs(i) => i.name.clone(),
            NodeData::Initramfs(i) => i.name.clone(),
            NodeData::Fat32(i) => i.name.clone(),
        }
    }

    pub fn mounted(&self) -> Option<Arc<Mount>> {
        self.mount.read().clone()
    }

    pub fn attach_mount(&self, mount: Arc<Mount>) {
        *self.mount.write() = Some(mount);
    }

    pub fn file_ops(&self) -> &'static dyn FileOperations {
        *self.f_ops.read()
    }

    pub fn set_file_ops(&self, ops: &'static dyn FileOperations) {
        *self.f_ops.write() = ops;
    }
}

/// A mounted filesystem instance.
pub struct Mount {
    pub root: Arc<Vnode>,
    pub fs: &'static dyn Filesystem,
}

/// A mountable filesystem driver.
pub trait Filesystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build a fresh mount (root vnode plus any backing state).
    fn setup_mount(&'static self) -> FsResult<Arc<Mount>>;

    /// Flush dirty state to backing storage.
    fn sync(&self) -> FsResult<()> {
        Ok(())
    }
}

/// Path operations of a vnode.
pub trait VnodeOperations: Send + Sync {
    fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> FsResult<Arc<Vnode>>;
    fn create(&self, dir: &Arc<Vnode>, name: &str) -> FsResult<Arc<Vnode>>;
    fn mkdir(&self, dir: &Arc<Vnode>, name: &str) -> FsResult<Arc<Vnode>>;
}

/// File I/O operations of a vnode.
pub trait FileOperations: Send + Sync {
    fn read(&self, file: &mut File, buf: &mut [u8]) -> FsResult<usize>;
    fn write(&self, file: &mut File, buf: &[u8]) -> FsResult<usize>;
    fn getsize(&self, vnode: &Arc<Vnode>) -> FsResult<i64>;

    fn open(&self, _vnode: &Arc<Vnode>) -> FsResult<()> {
        Ok(())
    }

    fn close(&self, _file: &mut File) -> FsResult<()> {
        Ok(())
    }

    /// SEEK_SET only; a target at or past the current size is refused.
    fn lseek64(&self, file: &mut File, offset: i64, whence: i32) -> FsResult<i64> {
        if whence != file::SEEK_SET || offset < 0 {
            return Err(FsError::NotSupported);
        }
        if offset >= self.getsize(&file.vnode)? {
            return Err(FsError::OutOfRange);
        }
        file.f_pos = offset as u64;
        Ok(offset)
    }

    fn ioctl(&self, _file: &mut File, _request: u64, _arg: usize) -> FsResult<i64> {
        Err(FsError::NotSupported)
    }
}

// ---------------------------------------------------------------------------
// Registration tables and the mount tree root
// ---------------------------------------------------------------------------

static REG_FS: RwLock<Vec<&'static dyn Filesystem>> = RwLock::new(Vec::new());
static REG_DEV: RwLock<Vec<&'static dyn FileOperations>> = RwLock::new(Vec::new());
static ROOTFS: Once<Arc<Mount>> = Once::new();

/// Register a filesystem driver; returns its table index.
pub fn register_filesystem(fs: &'static dyn Filesystem) -> usize {
    let mut table = REG_FS.write();
    table.push(fs);
    table.len() - 1
}

/// Register a character-device operations table; returns the device id
/// `mknod` takes.
pub fn register_device(ops: &'static dyn FileOperations) -> usize {
    let mut table = REG_DEV.write();
    table.push(ops);
    table.len() - 1
}

fn find_filesystem(name: &str) -> FsResult<&'static dyn Filesystem> {
    REG_FS
        .read()
        .iter()
        .copied()
        .find(|fs| fs.name() == name)
        .ok_or(FsError::UnknownFilesystem)
}

fn device_ops(id: usize) -> FsResult<&'static dyn FileOperations> {
    REG_DEV
        .read()
        .get(id)
        .copied()
        .ok_or(FsError::NotFound)
}

fn root_vnode() -> FsResult<Arc<Vnode>> {
    ROOTFS
        .get()
        .map(|m| m.root.clone())
        .ok_or(FsError::NotFound)
}

/// Descend through any filesystems mounted on this vnode.
fn follow_mounts(mut node: Arc<Vnode>) -> Arc<Vnode> {
    loop {
        let next = match node.mounted() {
            Some(m) => m.root.clone(),
            None => return node,
        };
        node = next;
    }
}

// ---------------------------------------------------------------------------
// VFS entry points
// ---------------------------------------------------------------------------

/// Resolve an absolute path to a vnode.
pub fn lookup(pathname: &str) -> FsResult<Arc<Vnode>> {
    let mut node = follow_mounts(root_vnode()?);
    for comp in pathname.split('/').filter(|c| !c.is_empty()) {
        let child = node.v_ops.lookup(&node, comp)?;
        node = follow_mounts(child);
    }
    Ok(node)
}

/// Split a path into parent directory and final component.
fn split_parent(pathname: &str) -> FsResult<(&str, &str)> {
    let idx = pathname.rfind('/').ok_or(FsError::NotFound)?;
    let base = &pathname[idx + 1..];
    if base.is_empty() {
        return Err(FsError::NotFound);
    }
    Ok((&pathname[..idx], base))
}

/// Open a file, creating the final component when `CREATE` is set and the
/// lookup misses.
pub fn open(pathname: &str, flags: OpenFlags) -> FsResult<File> {
    match lookup(pathname) {
        Ok(vnode) => File::open(vnode, flags),
        Err(FsError::NotFound) if flags.contains(OpenFlags::CREATE) => {
            let (dirname, base) = split_parent(pathname)?;
            let dir = lookup(dirname)?;
            let vnode = dir.v_ops.create(&dir, base)?;
            File::open(vnode, flags)
        }
        Err(e) => Err(e),
    }
}

/// Create a regular file at `pathname`.
pub fn create(pathname: &str) -> FsResult<Arc<Vnode>> {
    let (dirname, base) = split_parent(pathname)?;
    let dir = lookup(dirname)?;
    dir.v_ops.create(&dir, base)
}

/// Create a directory at `pathname`.
pub fn mkdir(pathname: &str) -> FsResult<Arc<Vnode>> {
    let (dirname, base) = split_parent(pathname)?;
    let dir = lookup(dirname)?;
    dir.v_ops.mkdir(&dir, base)
}

/// Mount the named filesystem on `target`.
pub fn mount(target: &str, fs_name: &str) -> FsResult<()> {
    let fs = find_filesystem(fs_name)?;
    let node = lookup(target)?;
    let mount = fs.setup_mount()?;
    node.attach_mount(mount);
    Ok(())
}

/// Create a device node: a plain file whose file-ops table is replaced by
/// the registered device table `id`.
pub fn mknod(pathname: &str, id: usize) -> FsResult<()> {
    let ops = device_ops(id)?;
    let file = open(pathname, OpenFlags::CREATE)?;
    file.vnode.set_file_ops(ops);
    file.close()
}

/// Flush every registered filesystem.
pub fn sync_all() -> FsResult<()> {
    for fs in REG_FS.read().iter() {
        fs.sync()?;
    }
    Ok(())
}

/// Build the boot-time mount tree: tmpfs root, `/initramfs`, `/dev` with
/// the UART and framebuffer devices, and a handful of seed directories.
pub fn init_rootfs() {
    register_filesystem(&tmpfs::TMPFS);
    let root = tmpfs::TMPFS
        .setup_mount()
        .expect("root tmpfs cannot fail to mount");
    ROOTFS.call_once(|| root);

    let _ = mkdir("/initramfs");
    register_filesystem(&initramfs::INITRAMFS);
    if let Err(e) = mount("/initramfs", "initramfs") {
        log::warn!("initramfs not mounted: {:?}", e);
    }

    let _ = mkdir("/dev");
    let uart_id = dev::init_dev_uart();
    if let Err(e) = mknod("/dev/uart", uart_id) {
        log::warn!("/dev/uart: {:?}", e);
    }
    match dev::init_dev_framebuffer() {
        Ok(fb_id) => {
            if let Err(e) = mknod("/dev/framebuffer", fb_id) {
                log::warn!("/dev/framebuffer: {:?}", e);
            }
        }
        Err(e) => log::warn!("framebuffer unavailable: {:?}", e),
    }

    let _ = mkdir("/home");
    let _ = mkdir("/home/user");
    let _ = mkdir("/tmp");
}

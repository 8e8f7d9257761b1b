//! FAT32 on a block device, with a write-back block cache.
//!
//! Mounting parses the MBR (partition 0, type 0x0B) and the FAT32 boot
//! sector, then traverses the on-disk root directory into an in-memory
//! vnode tree (short 8.3 names only; `.`/`..`, long-name and deleted
//! entries are skipped). All block I/O goes through the cache: reads fill
//! it, writes only dirty it, and `sync` flushes dirty blocks to the device
//! and empties it.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use super::blockdev::{BlockDevice, BLOCK_SIZE};
use super::{
    FileOperations, Filesystem, FsError, FsResult, Mount, NodeData, NodeKind, Vnode,
    VnodeOperations,
};
use crate::config::FAT32_MAX_DIR_ENTRY;
use crate::fs::file::File;

/// 32-byte directory entries per block
const DIRENTS_PER_BLOCK: usize = BLOCK_SIZE / DIRENT_SIZE;
const DIRENT_SIZE: usize = 32;

/// FAT entries per 512-byte FAT sector
const ENTRIES_PER_FAT_BLOCK: u32 = (BLOCK_SIZE / 4) as u32;

/// Cluster-number space is 28 bits; values at or above this are end-of-chain
const EOC_THRESHOLD: u32 = 0x0FFF_FFF8;
/// Marker written to terminate a chain
const EOC: u32 = 0x0FFF_FFFF;
const FREE_CLUSTER: u32 = 0;

const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_LONG_NAME: u8 = 0x0F;

const DIRENT_FREE: u8 = 0x00;
const DIRENT_DELETED: u8 = 0xE5;

/// Geometry recovered from the MBR and boot sector.
#[derive(Debug, Clone, Copy)]
pub struct Fat32Metadata {
    pub fat_region_block: u32,
    pub data_region_block: u32,
    pub root_cluster: u32,
    pub sectors_per_cluster: u32,
    pub sectors_per_fat: u32,
    pub fat_count: u32,
    pub total_sectors: u32,
}

struct CacheBlock {
    idx: u32,
    data: [u8; BLOCK_SIZE],
    dirty: bool,
}

/// One mounted FAT32 volume: device handle, geometry, block cache.
pub struct Fat32Fs {
    dev: Arc<dyn BlockDevice>,
    meta: Fat32Metadata,
    cache: Mutex<Vec<CacheBlock>>,
}

/// FAT32 vnode payload. The in-memory tree mirrors the on-disk directory
/// structure built at mount time and extended by create/mkdir.
pub struct Fat32Inode {
    pub fs: Arc<Fat32Fs>,
    pub name: String,
    pub kind: NodeKind,
    pub entries: RwLock<Vec<Arc<Vnode>>>,
    /// First cluster of the directory holding this node's dirent
    pub dirent_cluster: u32,
    /// First data cluster of this node
    pub first_cluster: u32,
    pub size: Mutex<u32>,
}

struct Fat32VnodeOps;
struct Fat32FileOps;

static VOPS: Fat32VnodeOps = Fat32VnodeOps;
static FOPS: Fat32FileOps = Fat32FileOps;

fn inode(vnode: &Vnode) -> &Fat32Inode {
    match &vnode.internal {
        NodeData::Fat32(i) => i,
        _ => unreachable!("fat32 operation on a foreign vnode"),
    }
}

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

impl Fat32Fs {
    /// Parse the MBR and boot sector of partition 0 (type 0x0B).
    pub fn probe(dev: Arc<dyn BlockDevice>) -> FsResult<Arc<Fat32Fs>> {
        let mut mbr = [0u8; BLOCK_SIZE];
        dev.read_block(0, &mut mbr)?;
        if mbr[510] != 0x55 || mbr[511] != 0xAA {
            log::warn!("fat32: invalid MBR signature");
            return Err(FsError::Io);
        }

        // Partition entry 0 starts at offset 446.
        let ptype = mbr[446 + 4];
        if ptype != 0x0B {
            log::warn!("fat32: unsupported partition type {:#x}", ptype);
            return Err(FsError::Io);
        }
        let first_lba = le32(&mbr, 446 + 8);

        let mut bpb = [0u8; BLOCK_SIZE];
        dev.read_block(first_lba, &mut bpb)?;
        let reserved_sectors = le16(&bpb, 14) as u32;
        let fat_count = bpb[16] as u32;
        let sectors_per_cluster = bpb[13] as u32;
        let total_sectors = le32(&bpb, 32);
        let sectors_per_fat = le32(&bpb, 36);
        let root_cluster = le32(&bpb, 44);

        let meta = Fat32Metadata {
            fat_region_block: first_lba + reserved_sectors,
            data_region_block: first_lba + reserved_sectors + sectors_per_fat * fat_count,
            root_cluster,
            sectors_per_cluster,
            sectors_per_fat,
            fat_count,
            total_sectors,
        };
        log::info!(
            "fat32: fat@{} data@{} root cluster {} ({} sectors/cluster)",
            meta.fat_region_block,
            meta.data_region_block,
            meta.root_cluster,
            meta.sectors_per_cluster
        );

        Ok(Arc::new(Fat32Fs {
            dev,
            meta,
            cache: Mutex::new(Vec::new()),
        }))
    }

    pub fn metadata(&self) -> Fat32Metadata {
        self.meta
    }

    // ------------------------------------------------------------------
    // Block cache
    // ------------------------------------------------------------------

    /// Read through the cache: hit, or load from the device and insert.
    pub fn read_block(&self, idx: u32, buf: &mut [u8; BLOCK_SIZE]) -> FsResult<()> {
        let mut cache = self.cache.lock();
        if let Some(block) = cache.iter().find(|b| b.idx == idx) {
            buf.copy_from_slice(&block.data);
            return Ok(());
        }
        self.dev.read_block(idx, buf)?;
        cache.push(CacheBlock {
            idx,
            data: *buf,
            dirty: false,
        });
        Ok(())
    }

    /// Write into the cache only, marking the block dirty.
    pub fn write_block(&self, idx: u32, buf: &[u8; BLOCK_SIZE]) -> FsResult<()> {
        let mut cache = self.cache.lock();
        match cache.iter_mut().find(|b| b.idx == idx) {
            Some(block) => {
                block.data.copy_from_slice(buf);
                block.dirty = true;
            }
            None => cache.push(CacheBlock {
                idx,
                data: *buf,
                dirty: true,
            }),
        }
        Ok(())
    }

    /// Flush dirty blocks to the device and drop the whole cache.
    pub fn sync_cache(&self) -> FsResult<()> {
        let mut cache = self.cache.lock();
        for block in cache.iter() {
            if block.dirty {
                self.dev.write_block(block.idx, &block.data)?;
            }
        }
        cache.clear();
        Ok(())
    }

    // ------------------------------------------------------------------
    // FAT geometry
    // ------------------------------------------------------------------

    fn cluster_to_data_block(&self, cluster: u32) -> u32 {
        self.meta.data_region_block
            + (cluster - self.meta.root_cluster) * self.meta.sectors_per_cluster
    }

    fn cluster_to_fat_block(&self, cluster: u32) -> u32 {
        self.meta.fat_region_block + cluster / ENTRIES_PER_FAT_BLOCK
    }

    /// Follow the FAT one step.
    fn next_cluster(&self, cluster: u32) -> FsResult<u32> {
        let mut fat = [0u8; BLOCK_SIZE];
        self.read_block(self.cluster_to_fat_block(cluster), &mut fat)?;
        let entry = le32(&fat, (cluster % ENTRIES_PER_FAT_BLOCK) as usize * 4);
        Ok(entry & 0x0FFF_FFFF)
    }

    /// Point `cluster`'s FAT entry at `value`.
    fn set_fat_entry(&self, cluster: u32, value: u32) -> FsResult<()> {
        let block_idx = self.cluster_to_fat_block(cluster);
        let mut fat = [0u8; BLOCK_SIZE];
        self.read_block(block_idx, &mut fat)?;
        let off = (cluster % ENTRIES_PER_FAT_BLOCK) as usize * 4;
        fat[off..off + 4].copy_from_slice(&value.to_le_bytes());
        self.write_block(block_idx, &fat)
    }

    /// Claim the first free FAT entry, marking it end-of-chain. Fails once
    /// the whole FAT has been scanned.
    fn alloc_cluster(&self) -> FsResult<u32> {
        let total_entries = self.meta.sectors_per_fat * ENTRIES_PER_FAT_BLOCK;
        let mut fat = [0u8; BLOCK_SIZE];
        let mut cluster = 0;
        while cluster < total_entries {
            let block_idx = self.cluster_to_fat_block(cluster);
            self.read_block(block_idx, &mut fat)?;
            for slot in 0..ENTRIES_PER_FAT_BLOCK {
                if le32(&fat, slot as usize * 4) == FREE_CLUSTER {
                    let found = cluster + slot;
                    let off = slot as usize * 4;
                    fat[off..off + 4].copy_from_slice(&EOC.to_le_bytes());
                    self.write_block(block_idx, &fat)?;
                    return Ok(found);
                }
            }
            cluster += ENTRIES_PER_FAT_BLOCK;
        }
        Err(FsError::NoFreeCluster)
    }
}

impl Filesystem for Fat32Fs {
    fn name(&self) -> &'static str {
        "fat32"
    }

    fn setup_mount(&'static self) -> FsResult<Arc<Mount>> {
        // The driver is registered as a leaked Arc; recover a counted
        // handle for the inodes.
        // SAFETY-free: this clones from a live &'static, no lifetime games.
        let fs = unsafe { arc_from_static(self) };
        let root = new_vnode(
            fs.clone(),
            "",
            NodeKind::Directory,
            0,
            fs.meta.root_cluster,
            0,
        );
        traverse_directory(&fs, &root, fs.meta.root_cluster)?;
        Ok(Arc::new(Mount { root, fs: self }))
    }

    fn sync(&self) -> FsResult<()> {
        self.sync_cache()
    }
}

/// Recover an owning handle from the leaked registration reference.
///
/// # Safety
/// `fs` must originate from `Arc::into_raw` leakage performed by
/// [`register`]; the strong count is bumped so the clone is sound.
unsafe fn arc_from_static(fs: &'static Fat32Fs) -> Arc<Fat32Fs> {
    // SAFETY: see above.
    unsafe {
        Arc::increment_strong_count(fs as *const Fat32Fs);
        Arc::from_raw(fs as *const Fat32Fs)
    }
}

/// Probe the device and register the volume with the VFS. Returns the
/// leaked driver reference used for mounting.
pub fn register(dev: Arc<dyn BlockDevice>) -> FsResult<&'static Fat32Fs> {
    let fs = Fat32Fs::probe(dev)?;
    let leaked: &'static Fat32Fs = {
        let raw = Arc::into_raw(fs);
        // SAFETY: just leaked; never dropped.
        unsafe { &*raw }
    };
    super::register_filesystem(leaked);
    Ok(leaked)
}

fn new_vnode(
    fs: Arc<Fat32Fs>,
    name: &str,
    kind: NodeKind,
    dirent_cluster: u32,
    first_cluster: u32,
    size: u32,
) -> Arc<Vnode> {
    Vnode::new(
        &VOPS,
        &FOPS,
        NodeData::Fat32(Fat32Inode {
            fs,
            name: String::from(name),
            kind,
            entries: RwLock::new(Vec::new()),
            dirent_cluster,
            first_cluster,
            size: Mutex::new(size),
        }),
    )
}

/// Decode an 8.3 short name ("FOO     BAR" -> "FOO.BAR").
fn sfn_to_name(entry: &[u8]) -> String {
    let mut name = String::new();
    for &b in entry[..8].iter().take_while(|&&b| b != b' ') {
        name.push(b as char);
    }
    if entry[11] & ATTR_DIRECTORY == 0 {
        let ext: Vec<u8> = entry[8..11]
            .iter()
            .copied()
            .take_while(|&b| b != b' ')
            .collect();
        if !ext.is_empty() {
            name.push('.');
            for b in ext {
                name.push(b as char);
            }
        }
    }
    name
}

/// Encode a name into the 11-byte SFN field. `.` and `..` get their
/// special forms.
fn name_to_sfn(name: &str) -> [u8; 11] {
    let mut sfn = [b' '; 11];
    if name == "." {
        sfn[0] = b'.';
        return sfn;
    }
    if name == ".." {
        sfn[0] = b'.';
        sfn[1] = b'.';
        return sfn;
    }
    let (stem, ext) = match name.find('.') {
        Some(dot) => (&name[..dot], &name[dot + 1..]),
        None => (name, ""),
    };
    for (i, b) in stem.bytes().take(8).enumerate() {
        sfn[i] = b;
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        sfn[8 + i] = b;
    }
    sfn
}

/// Walk a directory's cluster chain, building child vnodes; recurses into
/// subdirectories.
fn traverse_directory(fs: &Arc<Fat32Fs>, parent: &Arc<Vnode>, first_cluster: u32) -> FsResult<()> {
    let mut cluster = first_cluster;
    let mut buf = [0u8; BLOCK_SIZE];
    while cluster < EOC_THRESHOLD {
        fs.read_block(fs.cluster_to_data_block(cluster), &mut buf)?;
        for slot in 0..DIRENTS_PER_BLOCK {
            let entry = &buf[slot * DIRENT_SIZE..(slot + 1) * DIRENT_SIZE];
            if entry[0] == DIRENT_FREE {
                break;
            }
            if entry[0] == DIRENT_DELETED {
                continue;
            }
            let attr = entry[11];
            if attr == ATTR_LONG_NAME || (attr != ATTR_ARCHIVE && attr != ATTR_DIRECTORY) {
                // Long-name and special entries are out of scope.
                continue;
            }
            let name = sfn_to_name(entry);
            if name == "." || name == ".." {
                continue;
            }
            let child_cluster =
                ((le16(entry, 20) as u32) << 16) | le16(entry, 26) as u32;
            let size = le32(entry, 28);
            let kind = if attr & ATTR_DIRECTORY != 0 {
                NodeKind::Directory
            } else {
                NodeKind::Regular
            };
            let child = new_vnode(fs.clone(), &name, kind, cluster, child_cluster, size);
            if kind == NodeKind::Directory {
                traverse_directory(fs, &child, child_cluster)?;
            }
            inode(parent).entries.write().push(child);
        }
        cluster = fs.next_cluster(cluster)?;
    }
    Ok(())
}

/// Write a fresh dirent into `entry`.
fn fill_dirent(entry: &mut [u8], name: &str, attr: u8, first_cluster: u32, size: u32) {
    entry.fill(0);
    entry[..11].copy_from_slice(&name_to_sfn(name));
    entry[11] = attr;
    entry[20..22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
    entry[26..28].copy_from_slice(&(first_cluster as u16).to_le_bytes());
    entry[28..32].copy_from_slice(&size.to_le_bytes());
}

/// Find a free dirent slot in the directory chain starting at
/// `dir_cluster`, extending the chain with a fresh zeroed cluster when
/// every block is full. Returns (cluster, block index, slot).
fn find_free_dirent(fs: &Arc<Fat32Fs>, dir_cluster: u32) -> FsResult<(u32, u32, usize)> {
    let mut cluster = dir_cluster;
    let mut buf = [0u8; BLOCK_SIZE];
    loop {
        let block_idx = fs.cluster_to_data_block(cluster);
        fs.read_block(block_idx, &mut buf)?;
        for slot in 0..DIRENTS_PER_BLOCK {
            let first = buf[slot * DIRENT_SIZE];
            if first == DIRENT_FREE || first == DIRENT_DELETED {
                return Ok((cluster, block_idx, slot));
            }
        }
        let next = fs.next_cluster(cluster)?;
        if next >= EOC_THRESHOLD {
            // Chain exhausted: link in a fresh directory cluster.
            let grown = fs.alloc_cluster()?;
            fs.set_fat_entry(cluster, grown)?;
            let zero = [0u8; BLOCK_SIZE];
            fs.write_block(fs.cluster_to_data_block(grown), &zero)?;
            cluster = grown;
        } else {
            cluster = next;
        }
    }
}

/// Shared implementation of create and mkdir.
fn create_node(dir: &Arc<Vnode>, name: &str, kind: NodeKind) -> FsResult<Arc<Vnode>> {
    let dir_inode = inode(dir);
    if dir_inode.kind != NodeKind::Directory {
        return Err(FsError::NotADirectory);
    }
    {
        let entries = dir_inode.entries.read();
        if entries.iter().any(|c| inode(c).name == name) {
            return Err(FsError::Exists);
        }
        if entries.len() >= FAT32_MAX_DIR_ENTRY {
            return Err(FsError::DirectoryFull);
        }
    }

    let fs = &dir_inode.fs;
    let new_cluster = fs.alloc_cluster()?;
    let (dirent_cluster, block_idx, slot) = find_free_dirent(fs, dir_inode.first_cluster)?;

    let attr = match kind {
        NodeKind::Directory => ATTR_DIRECTORY,
        NodeKind::Regular => ATTR_ARCHIVE,
    };
    let mut buf = [0u8; BLOCK_SIZE];
    fs.read_block(block_idx, &mut buf)?;
    fill_dirent(
        &mut buf[slot * DIRENT_SIZE..(slot + 1) * DIRENT_SIZE],
        name,
        attr,
        new_cluster,
        0,
    );
    fs.write_block(block_idx, &buf)?;

    if kind == NodeKind::Directory {
        // Seed the new directory with its `.` and `..` entries.
        let mut first = [0u8; BLOCK_SIZE];
        fill_dirent(&mut first[..DIRENT_SIZE], ".", ATTR_DIRECTORY, new_cluster, 0);
        fill_dirent(
            &mut first[DIRENT_SIZE..2 * DIRENT_SIZE],
            "..",
            ATTR_DIRECTORY,
            dir_inode.first_cluster,
            0,
        );
        fs.write_block(fs.cluster_to_data_block(new_cluster), &first)?;
    } else {
        let zero = [0u8; BLOCK_SIZE];
        fs.write_block(fs.cluster_to_data_block(new_cluster), &zero)?;
    }

    let child = new_vnode(fs.clone(), name, kind, dirent_cluster, new_cluster, 0);
    dir_inode.entries.write().push(child.clone());
    Ok(child)
}

impl VnodeOperations for Fat32VnodeOps {
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
        create_node(dir, name, NodeKind::Regular)
    }

    fn mkdir(&self, dir: &Arc<Vnode>, name: &str) -> FsResult<Arc<Vnode>> {
        create_node(dir, name, NodeKind::Directory)
    }
}

/// Walk `steps` links down a chain. End-of-chain short-circuits.
fn walk_chain(fs: &Fat32Fs, mut cluster: u32, steps: u64) -> FsResult<u32> {
    for _ in 0..steps {
        if cluster >= EOC_THRESHOLD {
            break;
        }
        cluster = fs.next_cluster(cluster)?;
    }
    Ok(cluster)
}

impl FileOperations for Fat32FileOps {
    fn read(&self, file: &mut File, buf: &mut [u8]) -> FsResult<usize> {
        let node = inode(&file.vnode);
        let fs = &node.fs;
        let size = *node.size.lock() as u64;

        // Clamp before anything moves the cursor.
        if file.f_pos >= size {
            return Ok(0);
        }
        let mut remaining = (buf.len() as u64).min(size - file.f_pos) as usize;

        let mut cluster = walk_chain(fs, node.first_cluster, file.f_pos / BLOCK_SIZE as u64)?;
        let mut copied = 0usize;
        let mut block = [0u8; BLOCK_SIZE];
        while remaining > 0 && cluster < EOC_THRESHOLD {
            fs.read_block(fs.cluster_to_data_block(cluster), &mut block)?;
            let offset = (file.f_pos % BLOCK_SIZE as u64) as usize;
            let take = remaining.min(BLOCK_SIZE - offset);
            buf[copied..copied + take].copy_from_slice(&block[offset..offset + take]);
            copied += take;
            remaining -= take;
            file.f_pos += take as u64;
            if remaining > 0 {
                cluster = fs.next_cluster(cluster)?;
            }
        }
        Ok(copied)
    }

    fn write(&self, file: &mut File, buf: &[u8]) -> FsResult<usize> {
        let node = inode(&file.vnode);
        let fs = &node.fs;

        let mut cluster = walk_chain(fs, node.first_cluster, file.f_pos / BLOCK_SIZE as u64)?;
        let mut written = 0usize;
        let mut block = [0u8; BLOCK_SIZE];
        while written < buf.len() && cluster < EOC_THRESHOLD {
            let block_idx = fs.cluster_to_data_block(cluster);
            fs.read_block(block_idx, &mut block)?;
            let offset = (file.f_pos % BLOCK_SIZE as u64) as usize;
            let take = (buf.len() - written).min(BLOCK_SIZE - offset);
            block[offset..offset + take].copy_from_slice(&buf[written..written + take]);
            fs.write_block(block_idx, &block)?;
            written += take;
            file.f_pos += take as u64;
            if written < buf.len() {
                // End-of-chain ends the I/O; the bytes written so far are
                // reported as a short count.
                cluster = fs.next_cluster(cluster)?;
            }
        }

        // Growth: record the new size in this file's directory entry.
        let mut size = node.size.lock();
        if file.f_pos > *size as u64 {
            *size = file.f_pos as u32;
            update_dirent_size(fs, node, *size)?;
        }
        Ok(written)
    }

    fn getsize(&self, vnode: &Arc<Vnode>) -> FsResult<i64> {
        Ok(*inode(vnode).size.lock() as i64)
    }
}

/// Rewrite `fileSize` in the dirent naming `node`, found in the directory
/// chain starting at `node.dirent_cluster`.
fn update_dirent_size(fs: &Arc<Fat32Fs>, node: &Fat32Inode, new_size: u32) -> FsResult<()> {
    let mut cluster = node.dirent_cluster;
    let mut buf = [0u8; BLOCK_SIZE];
    while cluster < EOC_THRESHOLD {
        let block_idx = fs.cluster_to_data_block(cluster);
        fs.read_block(block_idx, &mut buf)?;
        for slot in 0..DIRENTS_PER_BLOCK {
            let entry = &mut buf[slot * DIRENT_SIZE..(slot + 1) * DIRENT_SIZE];
            if entry[0] == DIRENT_FREE {
                return Ok(());
            }
            if entry[0] == DIRENT_DELETED || entry[11] != ATTR_ARCHIVE {
                continue;
            }
            if sfn_to_name(entry) == node.name {
                entry[28..32].copy_from_slice(&new_size.to_le_bytes());
                fs.write_block(block_idx, &buf)?;
                return Ok(());
            }
        }
        cluster = fs.next_cluster(cluster)?;
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::blockdev::RamDisk;
    use crate::fs::file::SEEK_SET;
    use crate::fs::OpenFlags;

    const PART_LBA: u32 = 8;
    const RESERVED: u32 = 1;
    const SECTORS_PER_FAT: u32 = 4;
    const ROOT_CLUSTER: u32 = 2;

    /// Hand-build a tiny FAT32 volume: MBR, boot sector, one FAT, a root
    /// directory with `README.TXT` ("hello fat32\n") and a `SUB` directory.
    fn build_image() -> Arc<RamDisk> {
        let disk = RamDisk::new(256);
        let fat_region = PART_LBA + RESERVED;
        let data_region = fat_region + SECTORS_PER_FAT;

        let mut mbr = [0u8; BLOCK_SIZE];
        mbr[446 + 4] = 0x0B;
        mbr[446 + 8..446 + 12].copy_from_slice(&PART_LBA.to_le_bytes());
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        disk.write_block(0, &mbr).expect("mbr");

        let mut bpb = [0u8; BLOCK_SIZE];
        bpb[11..13].copy_from_slice(&(BLOCK_SIZE as u16).to_le_bytes());
        bpb[13] = 1; // sectors per cluster
        bpb[14..16].copy_from_slice(&(RESERVED as u16).to_le_bytes());
        bpb[16] = 1; // one FAT
        bpb[32..36].copy_from_slice(&256u32.to_le_bytes());
        bpb[36..40].copy_from_slice(&SECTORS_PER_FAT.to_le_bytes());
        bpb[44..48].copy_from_slice(&ROOT_CLUSTER.to_le_bytes());
        bpb[510] = 0x55;
        bpb[511] = 0xAA;
        disk.write_block(PART_LBA, &bpb).expect("bpb");

        // FAT: clusters 0 and 1 reserved, root (2) EOC, README (3) EOC,
        // SUB (4) EOC.
        let mut fat = [0u8; BLOCK_SIZE];
        for (i, val) in [0x0FFF_FFF8u32, EOC, EOC, EOC, EOC].iter().enumerate() {
            fat[i * 4..i * 4 + 4].copy_from_slice(&val.to_le_bytes());
        }
        disk.write_block(fat_region, &fat).expect("fat");

        // Root directory (cluster 2 -> data_region + 0).
        let mut root = [0u8; BLOCK_SIZE];
        fill_dirent(&mut root[..32], "README.TXT", ATTR_ARCHIVE, 3, 12);
        fill_dirent(&mut root[32..64], "SUB", ATTR_DIRECTORY, 4, 0);
        disk.write_block(data_region, &root).expect("root dir");

        // README.TXT data (cluster 3).
        let mut readme = [0u8; BLOCK_SIZE];
        readme[..12].copy_from_slice(b"hello fat32\n");
        disk.write_block(data_region + 1, &readme).expect("readme");

        // SUB directory: '.' and '..' only (cluster 4).
        let mut sub = [0u8; BLOCK_SIZE];
        fill_dirent(&mut sub[..32], ".", ATTR_DIRECTORY, 4, 0);
        fill_dirent(&mut sub[32..64], "..", ATTR_DIRECTORY, 2, 0);
        disk.write_block(data_region + 2, &sub).expect("sub dir");

        disk
    }

    fn mount_image(disk: Arc<RamDisk>) -> (Arc<Fat32Fs>, Arc<Vnode>) {
        let fs = Fat32Fs::probe(disk).expect("probe");
        let root = new_vnode(
            fs.clone(),
            "",
            NodeKind::Directory,
            0,
            fs.meta.root_cluster,
            0,
        );
        traverse_directory(&fs, &root, fs.meta.root_cluster).expect("traverse");
        (fs, root)
    }

    #[test]
    fn probe_reads_geometry() {
        let (fs, _root) = mount_image(build_image());
        let meta = fs.metadata();
        assert_eq!(meta.fat_region_block, PART_LBA + RESERVED);
        assert_eq!(meta.data_region_block, PART_LBA + RESERVED + SECTORS_PER_FAT);
        assert_eq!(meta.root_cluster, ROOT_CLUSTER);
    }

    #[test]
    fn probe_rejects_bad_signature_and_type() {
        let disk = RamDisk::new(8);
        assert!(Fat32Fs::probe(disk).is_err(), "zeroed MBR must be refused");

        let disk = build_image();
        let mut mbr = [0u8; BLOCK_SIZE];
        disk.read_block(0, &mut mbr).expect("read mbr");
        mbr[446 + 4] = 0x83; // not FAT32
        disk.write_block(0, &mbr).expect("write mbr");
        assert!(Fat32Fs::probe(disk).is_err());
    }

    #[test]
    fn mount_builds_the_tree_and_reads_files() {
        let (_fs, root) = mount_image(build_image());
        let readme = VOPS.lookup(&root, "README.TXT").expect("lookup");
        let mut f = File::open(readme, OpenFlags::empty()).expect("open");
        let mut buf = [0u8; 64];
        assert_eq!(f.read(&mut buf).expect("read"), 12);
        assert_eq!(&buf[..12], b"hello fat32\n");

        let sub = VOPS.lookup(&root, "SUB").expect("subdir");
        assert_eq!(inode(&sub).kind, NodeKind::Directory);
        assert!(
            inode(&sub).entries.read().is_empty(),
            "dot entries are skipped"
        );
    }

    #[test]
    fn cache_returns_writes_before_sync_and_flushes_after() {
        let disk = build_image();
        let (fs, _root) = mount_image(disk.clone());

        let probe_block = fs.metadata().data_region_block + 20;
        let mut pattern = [0u8; BLOCK_SIZE];
        pattern[0] = 0xAB;
        pattern[511] = 0xCD;
        fs.write_block(probe_block, &pattern).expect("cached write");

        // Cache hit: the data comes back although the device still holds
        // zeros.
        let mut readback = [0u8; BLOCK_SIZE];
        fs.read_block(probe_block, &mut readback).expect("cached read");
        assert_eq!(readback[..], pattern[..]);
        let mut raw = [0u8; BLOCK_SIZE];
        disk.read_block(probe_block, &mut raw).expect("raw read");
        assert_eq!(raw[0], 0, "device untouched before sync");

        fs.sync_cache().expect("sync");
        disk.read_block(probe_block, &mut raw).expect("raw read");
        assert_eq!(raw[..], pattern[..], "sync flushes the dirty block");
    }

    #[test]
    fn create_write_read_back_and_grow_size() {
        let (_fs, root) = mount_image(build_image());
        let file = VOPS.create(&root, "NEW.TXT").expect("create");
        let mut f = File::open(file, OpenFlags::empty()).expect("open");

        let mut payload = [0u8; 300];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        assert_eq!(f.write(&payload).expect("write"), 300);
        assert_eq!(f.size().expect("size"), 300);

        f.lseek64(0, SEEK_SET).expect("rewind");
        let mut back = [0u8; 300];
        assert_eq!(f.read(&mut back).expect("read"), 300);
        assert_eq!(back[..], payload[..]);

        // A single-cluster file ends its chain after 512 bytes: a larger
        // write is cut short at end-of-chain.
        f.lseek64(0, SEEK_SET).expect("rewind");
        let big = [0x5Au8; 700];
        assert_eq!(f.write(&big).expect("short write"), 512);
        assert_eq!(f.size().expect("size"), 512);

        // The new file is visible on re-traversal after a cache sync.
        let (_fs2, root2) = {
            let found = VOPS.lookup(&root, "NEW.TXT").expect("lookup");
            let node = inode(&found);
            node.fs.sync_cache().expect("sync");
            // Rebuild the tree from disk to prove the dirent landed.
            let disk_fs = node.fs.clone();
            let fresh_root = new_vnode(
                disk_fs.clone(),
                "",
                NodeKind::Directory,
                0,
                disk_fs.meta.root_cluster,
                0,
            );
            traverse_directory(&disk_fs, &fresh_root, disk_fs.meta.root_cluster)
                .expect("re-traverse");
            (disk_fs, fresh_root)
        };
        let again = VOPS.lookup(&root2, "NEW.TXT").expect("persisted dirent");
        assert_eq!(*inode(&again).size.lock(), 512);
    }

    #[test]
    fn mkdir_seeds_dot_entries() {
        let (fs, root) = mount_image(build_image());
        let dir = VOPS.mkdir(&root, "DOCS").expect("mkdir");
        let node = inode(&dir);
        assert_eq!(node.kind, NodeKind::Directory);

        let mut block = [0u8; BLOCK_SIZE];
        fs.read_block(fs.cluster_to_data_block(node.first_cluster), &mut block)
            .expect("dir data");
        assert_eq!(&block[..1], b".");
        assert_eq!(&block[32..34], b"..");
        // `..` points back at the parent directory's first cluster.
        let parent_cluster =
            ((le16(&block[32..64], 20) as u32) << 16) | le16(&block[32..64], 26) as u32;
        assert_eq!(parent_cluster, ROOT_CLUSTER);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let (_fs, root) = mount_image(build_image());
        VOPS.create(&root, "A.TXT").expect("first");
        assert_eq!(VOPS.create(&root, "A.TXT").err(), Some(FsError::Exists));
    }

    #[test]
    fn sfn_codec_round_trips() {
        let mut entry = [0u8; 32];
        entry[..11].copy_from_slice(&name_to_sfn("KERNEL8.IMG"));
        entry[11] = ATTR_ARCHIVE;
        assert_eq!(sfn_to_name(&entry), "KERNEL8.IMG");

        entry[..11].copy_from_slice(&name_to_sfn("NOEXT"));
        assert_eq!(sfn_to_name(&entry), "NOEXT");

        // Directories never get the dot-extension treatment.
        entry[..11].copy_from_slice(&name_to_sfn("SUBDIR"));
        entry[11] = ATTR_DIRECTORY;
        assert_eq!(sfn_to_name(&entry), "SUBDIR");
    }

    #[test]
    fn full_fat_fails_cluster_allocation() {
        let disk = build_image();
        let fat_region = PART_LBA + RESERVED;
        // Saturate every FAT entry across all FAT sectors.
        let mut full = [0u8; BLOCK_SIZE];
        for slot in 0..ENTRIES_PER_FAT_BLOCK as usize {
            full[slot * 4..slot * 4 + 4].copy_from_slice(&EOC.to_le_bytes());
        }
        for s in 0..SECTORS_PER_FAT {
            disk.write_block(fat_region + s, &full).expect("fill fat");
        }
        let (fs, root) = mount_image(disk);
        assert_eq!(fs.alloc_cluster().err(), Some(FsError::NoFreeCluster));
        assert_eq!(
            VOPS.create(&root, "NOPE.TXT").err(),
            Some(FsError::NoFreeCluster)
        );
    }
}

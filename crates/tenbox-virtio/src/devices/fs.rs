use std::collections::HashMap;
use std::fs::{File, Metadata, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::mmio::{QueueHandle, VirtioDevice};
use crate::queue::{ChainReader, ChainWriter};
use crate::{VIRTIO_F_VERSION_1, VIRTIO_ID_FS};

// FUSE opcodes the server implements.
const FUSE_LOOKUP: u32 = 1;
const FUSE_FORGET: u32 = 2;
const FUSE_GETATTR: u32 = 3;
const FUSE_SETATTR: u32 = 4;
const FUSE_MKDIR: u32 = 9;
const FUSE_UNLINK: u32 = 10;
const FUSE_RMDIR: u32 = 11;
const FUSE_RENAME: u32 = 12;
const FUSE_OPEN: u32 = 14;
const FUSE_READ: u32 = 15;
const FUSE_WRITE: u32 = 16;
const FUSE_STATFS: u32 = 17;
const FUSE_RELEASE: u32 = 18;
const FUSE_FSYNC: u32 = 20;
const FUSE_FLUSH: u32 = 25;
const FUSE_INIT: u32 = 26;
const FUSE_OPENDIR: u32 = 27;
const FUSE_READDIR: u32 = 28;
const FUSE_RELEASEDIR: u32 = 29;
const FUSE_FSYNCDIR: u32 = 30;
const FUSE_ACCESS: u32 = 34;
const FUSE_CREATE: u32 = 35;
const FUSE_DESTROY: u32 = 38;
const FUSE_BATCH_FORGET: u32 = 42;
const FUSE_READDIRPLUS: u32 = 44;
const FUSE_RENAME2: u32 = 45;

const FUSE_KERNEL_VERSION: u32 = 7;
const FUSE_KERNEL_MINOR_VERSION: u32 = 31;

const FUSE_BIG_WRITES: u32 = 1 << 5;
const FUSE_PARALLEL_DIROPS: u32 = 1 << 18;

// Negative errno values on the FUSE wire.
pub const FUSE_OK: i32 = 0;
pub const FUSE_ENOENT: i32 = -2;
pub const FUSE_EIO: i32 = -5;
pub const FUSE_EACCES: i32 = -13;
pub const FUSE_EEXIST: i32 = -17;
pub const FUSE_ENOTDIR: i32 = -20;
pub const FUSE_EISDIR: i32 = -21;
pub const FUSE_EINVAL: i32 = -22;
pub const FUSE_ENOSPC: i32 = -28;
pub const FUSE_EROFS: i32 = -30;
pub const FUSE_ENOSYS: i32 = -38;
pub const FUSE_ENOTEMPTY: i32 = -39;

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

const FATTR_SIZE: u32 = 1 << 3;

const IN_HEADER_SIZE: usize = 40;
const OUT_HEADER_SIZE: usize = 16;
const ATTR_SIZE: usize = 88;
const ENTRY_OUT_SIZE: usize = 128;
const ATTR_OUT_SIZE: usize = 104;
const DIRENT_SIZE: usize = 24;

pub const VIRTUAL_ROOT_INODE: u64 = 1;

const QUEUE_SIZE: u16 = 128;
const MAX_WRITE: u32 = 1024 * 1024;

#[derive(Clone)]
struct ShareInfo {
    tag: String,
    host_path: PathBuf,
    readonly: bool,
    root_inode: u64,
}

struct InodeInfo {
    host_path: PathBuf,
    nlookup: u64,
    is_dir: bool,
    share_tag: String,
}

enum HostHandle {
    File(File),
    Dir,
}

struct OpenHandle {
    handle: HostHandle,
    path: PathBuf,
    share_tag: String,
}

struct FuseAttr {
    ino: u64,
    size: u64,
    mtime: u64,
    mode: u32,
    nlink: u32,
}

impl FuseAttr {
    fn encode(&self) -> [u8; ATTR_SIZE] {
        let mut out = [0u8; ATTR_SIZE];
        out[0..8].copy_from_slice(&self.ino.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
        out[16..24].copy_from_slice(&self.size.div_ceil(512).to_le_bytes()); // blocks
        out[24..32].copy_from_slice(&self.mtime.to_le_bytes()); // atime
        out[32..40].copy_from_slice(&self.mtime.to_le_bytes()); // mtime
        out[40..48].copy_from_slice(&self.mtime.to_le_bytes()); // ctime
        out[60..64].copy_from_slice(&self.mode.to_le_bytes());
        out[64..68].copy_from_slice(&self.nlink.to_le_bytes());
        out[80..84].copy_from_slice(&4096u32.to_le_bytes()); // blksize
        out
    }
}

fn unix_mtime(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn io_error_to_fuse(err: &std::io::Error) -> i32 {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound => FUSE_ENOENT,
        ErrorKind::PermissionDenied => FUSE_EACCES,
        ErrorKind::AlreadyExists => FUSE_EEXIST,
        ErrorKind::InvalidInput => FUSE_EINVAL,
        _ => {
            // Common raw codes not surfaced as ErrorKind on every platform.
            match err.raw_os_error() {
                Some(20) => FUSE_ENOTDIR,
                Some(21) => FUSE_EISDIR,
                Some(28) => FUSE_ENOSPC,
                Some(39) | Some(66) | Some(145) => FUSE_ENOTEMPTY,
                _ => FUSE_EIO,
            }
        }
    }
}

struct Request<'a> {
    opcode: u32,
    unique: u64,
    nodeid: u64,
    data: &'a [u8],
}

/// FUSE-over-virtio filesystem proxy. The mount tag exposes a virtual root
/// (inode 1) whose entries are the configured share tags; each share maps
/// to a host directory, optionally read-only.
pub struct VirtioFs {
    mount_tag: String,
    shares: HashMap<String, ShareInfo>,
    inodes: HashMap<u64, InodeInfo>,
    path_to_inode: HashMap<PathBuf, u64>,
    handles: HashMap<u64, OpenHandle>,
    next_inode: u64,
    next_fh: u64,
    virtual_root_mtime: u64,
    queues: [Option<QueueHandle>; 2],
}

impl VirtioFs {
    pub fn new(mount_tag: &str) -> Self {
        VirtioFs {
            mount_tag: mount_tag.to_string(),
            shares: HashMap::new(),
            inodes: HashMap::new(),
            path_to_inode: HashMap::new(),
            handles: HashMap::new(),
            next_inode: 2,
            next_fh: 1,
            virtual_root_mtime: now_secs(),
            queues: [None, None],
        }
    }

    pub fn add_share(&mut self, tag: &str, host_path: &Path, readonly: bool) -> bool {
        if tag.is_empty() || self.shares.contains_key(tag) || !host_path.is_dir() {
            return false;
        }
        let root_inode = self.next_inode;
        self.next_inode += 1;
        self.inodes.insert(
            root_inode,
            InodeInfo {
                host_path: host_path.to_path_buf(),
                nlookup: 1,
                is_dir: true,
                share_tag: tag.to_string(),
            },
        );
        self.path_to_inode.insert(host_path.to_path_buf(), root_inode);
        self.shares.insert(
            tag.to_string(),
            ShareInfo {
                tag: tag.to_string(),
                host_path: host_path.to_path_buf(),
                readonly,
                root_inode,
            },
        );
        self.virtual_root_mtime = now_secs();
        info!(tag, path = %host_path.display(), readonly, "virtio-fs share added");
        true
    }

    pub fn remove_share(&mut self, tag: &str) -> bool {
        let Some(share) = self.shares.remove(tag) else {
            return false;
        };
        // Drop every inode and handle belonging to the share.
        let dead: Vec<u64> = self
            .inodes
            .iter()
            .filter(|(_, info)| info.share_tag == tag)
            .map(|(ino, _)| *ino)
            .collect();
        for ino in dead {
            if let Some(info) = self.inodes.remove(&ino) {
                self.path_to_inode.remove(&info.host_path);
            }
        }
        self.handles.retain(|_, h| h.share_tag != tag);
        self.virtual_root_mtime = now_secs();
        info!(tag = %share.tag, "virtio-fs share removed");
        true
    }

    pub fn share_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.shares.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn has_share(&self, tag: &str) -> bool {
        self.shares.contains_key(tag)
    }

    pub fn open_handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Lookup count of an inode, if it is still known. Diagnostic.
    pub fn nlookup(&self, inode: u64) -> Option<u64> {
        self.inodes.get(&inode).map(|i| i.nlookup)
    }

    fn is_share_root(&self, nodeid: u64) -> bool {
        self.shares.values().any(|s| s.root_inode == nodeid)
    }

    fn share_readonly(&self, tag: &str) -> bool {
        self.shares.get(tag).map(|s| s.readonly).unwrap_or(false)
    }

    fn attr_for_path(&self, path: &Path, inode: u64, readonly: bool) -> Result<FuseAttr, i32> {
        let meta = std::fs::metadata(path).map_err(|e| io_error_to_fuse(&e))?;
        let mode = if meta.is_dir() {
            S_IFDIR | if readonly { 0o555 } else { 0o755 }
        } else {
            S_IFREG | if readonly { 0o444 } else { 0o644 }
        };
        Ok(FuseAttr {
            ino: inode,
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime: unix_mtime(&meta),
            mode,
            nlink: 1,
        })
    }

    fn virtual_root_attr(&self) -> FuseAttr {
        FuseAttr {
            ino: VIRTUAL_ROOT_INODE,
            size: 0,
            mtime: self.virtual_root_mtime,
            mode: S_IFDIR | 0o555,
            nlink: 2 + self.shares.len() as u32,
        }
    }

    fn get_or_create_inode(&mut self, path: &Path, is_dir: bool, share_tag: &str) -> u64 {
        if let Some(ino) = self.path_to_inode.get(path) {
            let ino = *ino;
            if let Some(info) = self.inodes.get_mut(&ino) {
                info.nlookup += 1;
            }
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.inodes.insert(
            ino,
            InodeInfo {
                host_path: path.to_path_buf(),
                nlookup: 1,
                is_dir,
                share_tag: share_tag.to_string(),
            },
        );
        self.path_to_inode.insert(path.to_path_buf(), ino);
        ino
    }

    fn error_response(unique: u64, error: i32) -> Vec<u8> {
        let mut out = vec![0u8; OUT_HEADER_SIZE];
        out[0..4].copy_from_slice(&(OUT_HEADER_SIZE as u32).to_le_bytes());
        out[4..8].copy_from_slice(&error.to_le_bytes());
        out[8..16].copy_from_slice(&unique.to_le_bytes());
        out
    }

    fn ok_response(unique: u64, body: &[u8]) -> Vec<u8> {
        let len = OUT_HEADER_SIZE + body.len();
        let mut out = vec![0u8; len];
        out[0..4].copy_from_slice(&(len as u32).to_le_bytes());
        out[8..16].copy_from_slice(&unique.to_le_bytes());
        out[OUT_HEADER_SIZE..].copy_from_slice(body);
        out
    }

    fn entry_out(&self, nodeid: u64, valid: u64, attr: &FuseAttr) -> [u8; ENTRY_OUT_SIZE] {
        let mut out = [0u8; ENTRY_OUT_SIZE];
        out[0..8].copy_from_slice(&nodeid.to_le_bytes());
        out[8..16].copy_from_slice(&1u64.to_le_bytes()); // generation
        out[16..24].copy_from_slice(&valid.to_le_bytes()); // entry_valid
        out[24..32].copy_from_slice(&valid.to_le_bytes()); // attr_valid
        out[40..40 + ATTR_SIZE].copy_from_slice(&attr.encode());
        out
    }

    fn handle_init(&mut self, req: &Request) -> Vec<u8> {
        let max_readahead = if req.data.len() >= 16 {
            u32::from_le_bytes(req.data[8..12].try_into().unwrap())
        } else {
            0
        };
        info!(tag = %self.mount_tag, "virtio-fs FUSE init");

        let mut body = [0u8; 64];
        body[0..4].copy_from_slice(&FUSE_KERNEL_VERSION.to_le_bytes());
        body[4..8].copy_from_slice(&FUSE_KERNEL_MINOR_VERSION.to_le_bytes());
        body[8..12].copy_from_slice(&max_readahead.to_le_bytes());
        body[12..16].copy_from_slice(&(FUSE_BIG_WRITES | FUSE_PARALLEL_DIROPS).to_le_bytes());
        body[16..18].copy_from_slice(&16u16.to_le_bytes()); // max_background
        body[18..20].copy_from_slice(&12u16.to_le_bytes()); // congestion_threshold
        body[20..24].copy_from_slice(&MAX_WRITE.to_le_bytes());
        body[24..28].copy_from_slice(&1u32.to_le_bytes()); // time_gran
        Self::ok_response(req.unique, &body)
    }

    fn handle_lookup(&mut self, req: &Request) -> Vec<u8> {
        let name_len = req.data.iter().position(|b| *b == 0).unwrap_or(req.data.len());
        let Ok(name) = std::str::from_utf8(&req.data[..name_len]) else {
            return Self::error_response(req.unique, FUSE_EINVAL);
        };

        if req.nodeid == VIRTUAL_ROOT_INODE {
            let Some(share) = self.shares.get(name).cloned() else {
                return Self::error_response(req.unique, FUSE_ENOENT);
            };
            return match self.attr_for_path(&share.host_path, share.root_inode, share.readonly) {
                Ok(attr) => {
                    Self::ok_response(req.unique, &self.entry_out(share.root_inode, 0, &attr))
                }
                Err(err) => Self::error_response(req.unique, err),
            };
        }

        let Some(parent) = self.inodes.get(&req.nodeid) else {
            return Self::error_response(req.unique, FUSE_ENOENT);
        };
        let child_path = parent.host_path.join(name);
        let share_tag = parent.share_tag.clone();

        let meta = match std::fs::metadata(&child_path) {
            Ok(meta) => meta,
            Err(e) => return Self::error_response(req.unique, io_error_to_fuse(&e)),
        };
        let inode = self.get_or_create_inode(&child_path, meta.is_dir(), &share_tag);
        let readonly = self.share_readonly(&share_tag);
        match self.attr_for_path(&child_path, inode, readonly) {
            Ok(attr) => Self::ok_response(req.unique, &self.entry_out(inode, 1, &attr)),
            Err(err) => Self::error_response(req.unique, err),
        }
    }

    fn forget_one(&mut self, nodeid: u64, nlookup: u64) {
        if nodeid == VIRTUAL_ROOT_INODE || self.is_share_root(nodeid) {
            return;
        }
        if let Some(info) = self.inodes.get_mut(&nodeid) {
            if info.nlookup > nlookup {
                info.nlookup -= nlookup;
            } else {
                let path = info.host_path.clone();
                self.path_to_inode.remove(&path);
                self.inodes.remove(&nodeid);
            }
        }
    }

    fn handle_forget(&mut self, req: &Request) {
        if req.data.len() >= 8 {
            let nlookup = u64::from_le_bytes(req.data[0..8].try_into().unwrap());
            self.forget_one(req.nodeid, nlookup);
        }
    }

    fn handle_batch_forget(&mut self, req: &Request) {
        if req.data.len() < 8 {
            return;
        }
        let count = u32::from_le_bytes(req.data[0..4].try_into().unwrap()) as usize;
        let mut off = 8;
        for _ in 0..count {
            if off + 16 > req.data.len() {
                break;
            }
            let nodeid = u64::from_le_bytes(req.data[off..off + 8].try_into().unwrap());
            let nlookup = u64::from_le_bytes(req.data[off + 8..off + 16].try_into().unwrap());
            self.forget_one(nodeid, nlookup);
            off += 16;
        }
    }

    fn attr_out_response(&self, unique: u64, valid: u64, attr: &FuseAttr) -> Vec<u8> {
        let mut body = [0u8; ATTR_OUT_SIZE];
        body[0..8].copy_from_slice(&valid.to_le_bytes());
        body[16..16 + ATTR_SIZE].copy_from_slice(&attr.encode());
        Self::ok_response(unique, &body)
    }

    fn handle_getattr(&mut self, req: &Request) -> Vec<u8> {
        if req.nodeid == VIRTUAL_ROOT_INODE {
            let attr = self.virtual_root_attr();
            return self.attr_out_response(req.unique, 0, &attr);
        }
        let valid = if self.is_share_root(req.nodeid) { 0 } else { 1 };
        let Some(info) = self.inodes.get(&req.nodeid) else {
            return Self::error_response(req.unique, FUSE_ENOENT);
        };
        let readonly = self.share_readonly(&info.share_tag);
        match self.attr_for_path(&info.host_path.clone(), req.nodeid, readonly) {
            Ok(attr) => self.attr_out_response(req.unique, valid, &attr),
            Err(err) => Self::error_response(req.unique, err),
        }
    }

    fn handle_setattr(&mut self, req: &Request) -> Vec<u8> {
        if req.data.len() < 88 {
            return Self::error_response(req.unique, FUSE_EINVAL);
        }
        if req.nodeid == VIRTUAL_ROOT_INODE || self.is_share_root(req.nodeid) {
            return Self::error_response(req.unique, FUSE_EACCES);
        }
        let Some(info) = self.inodes.get(&req.nodeid) else {
            return Self::error_response(req.unique, FUSE_ENOENT);
        };
        let path = info.host_path.clone();
        let share_tag = info.share_tag.clone();
        if self.share_readonly(&share_tag) {
            return Self::error_response(req.unique, FUSE_EROFS);
        }

        let valid = u32::from_le_bytes(req.data[0..4].try_into().unwrap());
        let size = u64::from_le_bytes(req.data[16..24].try_into().unwrap());
        let atime = u64::from_le_bytes(req.data[32..40].try_into().unwrap());
        let mtime = u64::from_le_bytes(req.data[40..48].try_into().unwrap());

        if valid & FATTR_SIZE != 0 {
            let file = OpenOptions::new().write(true).open(&path);
            match file {
                Ok(file) => {
                    if let Err(e) = file.set_len(size) {
                        return Self::error_response(req.unique, io_error_to_fuse(&e));
                    }
                }
                Err(e) => return Self::error_response(req.unique, io_error_to_fuse(&e)),
            }
        }

        const FATTR_ATIME: u32 = 1 << 4;
        const FATTR_MTIME: u32 = 1 << 5;
        if valid & (FATTR_ATIME | FATTR_MTIME) != 0 {
            let atime = filetime::FileTime::from_unix_time(atime as i64, 0);
            let mtime = filetime::FileTime::from_unix_time(mtime as i64, 0);
            if let Err(e) = filetime::set_file_times(&path, atime, mtime) {
                debug!(error = %e, "virtio-fs set_file_times failed");
            }
        }

        match self.attr_for_path(&path, req.nodeid, false) {
            Ok(attr) => self.attr_out_response(req.unique, 1, &attr),
            Err(err) => Self::error_response(req.unique, err),
        }
    }

    fn alloc_handle(&mut self, handle: HostHandle, path: &Path, share_tag: &str) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(
            fh,
            OpenHandle {
                handle,
                path: path.to_path_buf(),
                share_tag: share_tag.to_string(),
            },
        );
        fh
    }

    fn open_out_body(fh: u64) -> [u8; 16] {
        let mut body = [0u8; 16];
        body[0..8].copy_from_slice(&fh.to_le_bytes());
        body
    }

    fn handle_open(&mut self, req: &Request) -> Vec<u8> {
        if req.data.len() < 4 {
            return Self::error_response(req.unique, FUSE_EINVAL);
        }
        if req.nodeid == VIRTUAL_ROOT_INODE || self.is_share_root(req.nodeid) {
            return Self::error_response(req.unique, FUSE_EISDIR);
        }
        let Some(info) = self.inodes.get(&req.nodeid) else {
            return Self::error_response(req.unique, FUSE_ENOENT);
        };
        if info.is_dir {
            return Self::error_response(req.unique, FUSE_EISDIR);
        }
        let path = info.host_path.clone();
        let share_tag = info.share_tag.clone();

        let flags = u32::from_le_bytes(req.data[0..4].try_into().unwrap());
        let access = flags & 0x3;
        if access != 0 && self.share_readonly(&share_tag) {
            return Self::error_response(req.unique, FUSE_EROFS);
        }

        let mut opts = OpenOptions::new();
        match access {
            0 => opts.read(true),
            1 => opts.write(true),
            _ => opts.read(true).write(true),
        };
        match opts.open(&path) {
            Ok(file) => {
                let fh = self.alloc_handle(HostHandle::File(file), &path, &share_tag);
                Self::ok_response(req.unique, &Self::open_out_body(fh))
            }
            Err(e) => Self::error_response(req.unique, io_error_to_fuse(&e)),
        }
    }

    fn handle_read(&mut self, req: &Request) -> Vec<u8> {
        if req.data.len() < 24 {
            return Self::error_response(req.unique, FUSE_EINVAL);
        }
        let fh = u64::from_le_bytes(req.data[0..8].try_into().unwrap());
        let offset = u64::from_le_bytes(req.data[8..16].try_into().unwrap());
        let size = u32::from_le_bytes(req.data[16..20].try_into().unwrap()).min(MAX_WRITE);

        let Some(handle) = self.handles.get_mut(&fh) else {
            return Self::error_response(req.unique, FUSE_EINVAL);
        };
        let HostHandle::File(file) = &mut handle.handle else {
            return Self::error_response(req.unique, FUSE_EISDIR);
        };

        let mut buf = vec![0u8; size as usize];
        let n = match file.seek(SeekFrom::Start(offset)).and_then(|_| {
            let mut total = 0usize;
            loop {
                match file.read(&mut buf[total..]) {
                    Ok(0) => break Ok(total),
                    Ok(n) => total += n,
                    Err(e) => break Err(e),
                }
            }
        }) {
            Ok(n) => n,
            Err(e) => return Self::error_response(req.unique, io_error_to_fuse(&e)),
        };
        buf.truncate(n);
        Self::ok_response(req.unique, &buf)
    }

    fn handle_write(&mut self, req: &Request) -> Vec<u8> {
        if req.data.len() < 40 {
            return Self::error_response(req.unique, FUSE_EINVAL);
        }
        let fh = u64::from_le_bytes(req.data[0..8].try_into().unwrap());
        let offset = u64::from_le_bytes(req.data[8..16].try_into().unwrap());
        let size = u32::from_le_bytes(req.data[16..20].try_into().unwrap()) as usize;

        let payload = &req.data[40..];
        if payload.len() < size {
            return Self::error_response(req.unique, FUSE_EINVAL);
        }

        let readonly = self
            .handles
            .get(&fh)
            .map(|h| self.share_readonly(&h.share_tag))
            .unwrap_or(false);
        if readonly {
            return Self::error_response(req.unique, FUSE_EROFS);
        }

        let Some(handle) = self.handles.get_mut(&fh) else {
            return Self::error_response(req.unique, FUSE_EINVAL);
        };
        let HostHandle::File(file) = &mut handle.handle else {
            return Self::error_response(req.unique, FUSE_EISDIR);
        };

        match file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(&payload[..size]))
        {
            Ok(()) => {
                let mut body = [0u8; 8];
                body[0..4].copy_from_slice(&(size as u32).to_le_bytes());
                Self::ok_response(req.unique, &body)
            }
            Err(e) => Self::error_response(req.unique, io_error_to_fuse(&e)),
        }
    }

    fn handle_release(&mut self, req: &Request) {
        if req.data.len() >= 8 {
            let fh = u64::from_le_bytes(req.data[0..8].try_into().unwrap());
            self.handles.remove(&fh);
        }
    }

    fn handle_opendir(&mut self, req: &Request) -> Vec<u8> {
        let (path, share_tag) = if req.nodeid == VIRTUAL_ROOT_INODE {
            (PathBuf::new(), String::new())
        } else {
            let Some(info) = self.inodes.get(&req.nodeid) else {
                return Self::error_response(req.unique, FUSE_ENOENT);
            };
            if !info.is_dir {
                return Self::error_response(req.unique, FUSE_ENOTDIR);
            }
            (info.host_path.clone(), info.share_tag.clone())
        };
        let fh = self.alloc_handle(HostHandle::Dir, &path, &share_tag);
        Self::ok_response(req.unique, &Self::open_out_body(fh))
    }

    /// Directory listing shared by READDIR and READDIRPLUS: name, inode,
    /// is_dir for every entry after `offset`.
    fn list_dir(&mut self, nodeid: u64) -> Result<Vec<(String, u64, bool)>, i32> {
        if nodeid == VIRTUAL_ROOT_INODE {
            return Ok(self
                .share_tags()
                .iter()
                .map(|tag| {
                    let share = &self.shares[tag];
                    (tag.clone(), share.root_inode, true)
                })
                .collect());
        }

        let Some(info) = self.inodes.get(&nodeid) else {
            return Err(FUSE_ENOENT);
        };
        if !info.is_dir {
            return Err(FUSE_ENOTDIR);
        }
        let dir_path = info.host_path.clone();
        let share_tag = info.share_tag.clone();

        let entries = std::fs::read_dir(&dir_path).map_err(|e| io_error_to_fuse(&e))?;
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let child = dir_path.join(&name);
            // Directory enumeration itself does not take a lookup
            // reference; READDIRPLUS adds one below.
            let ino = match self.path_to_inode.get(&child) {
                Some(ino) => *ino,
                None => {
                    let ino = self.get_or_create_inode(&child, is_dir, &share_tag);
                    if let Some(info) = self.inodes.get_mut(&ino) {
                        info.nlookup -= 1;
                    }
                    ino
                }
            };
            out.push((name, ino, is_dir));
        }
        Ok(out)
    }

    fn handle_readdir(&mut self, req: &Request, plus: bool) -> Vec<u8> {
        if req.data.len() < 24 {
            return Self::error_response(req.unique, FUSE_EINVAL);
        }
        let offset = u64::from_le_bytes(req.data[8..16].try_into().unwrap());
        let size = u32::from_le_bytes(req.data[16..20].try_into().unwrap()) as usize;

        let entries = match self.list_dir(req.nodeid) {
            Ok(entries) => entries,
            Err(err) => return Self::error_response(req.unique, err),
        };

        let mut body = Vec::new();
        for (idx, (name, ino, is_dir)) in entries.iter().enumerate().skip(offset as usize) {
            let name_bytes = name.as_bytes();
            let dirent_len = DIRENT_SIZE + name_bytes.len();
            let padded = (dirent_len + 7) & !7;
            let record_len = if plus { ENTRY_OUT_SIZE + padded } else { padded };
            if body.len() + record_len > size {
                break;
            }

            if plus {
                // READDIRPLUS references the inode like a LOOKUP would;
                // share roots are pinned and take no extra reference.
                let attr = if self.is_share_root(*ino) {
                    let Some(path) = self.inodes.get(ino).map(|i| i.host_path.clone()) else {
                        continue;
                    };
                    match self.attr_for_path(&path, *ino, false) {
                        Ok(attr) => attr,
                        Err(_) => continue,
                    }
                } else {
                    let Some(info) = self.inodes.get_mut(ino) else { continue };
                    info.nlookup += 1;
                    let path = info.host_path.clone();
                    let tag = info.share_tag.clone();
                    let readonly = self.share_readonly(&tag);
                    match self.attr_for_path(&path, *ino, readonly) {
                        Ok(attr) => attr,
                        Err(_) => {
                            if let Some(info) = self.inodes.get_mut(ino) {
                                info.nlookup -= 1;
                            }
                            continue;
                        }
                    }
                };
                body.extend_from_slice(&self.entry_out(*ino, 1, &attr));
            }

            let mut dirent = [0u8; DIRENT_SIZE];
            dirent[0..8].copy_from_slice(&ino.to_le_bytes());
            dirent[8..16].copy_from_slice(&((idx as u64) + 1).to_le_bytes()); // next offset
            dirent[16..20].copy_from_slice(&(name_bytes.len() as u32).to_le_bytes());
            let dtype: u32 = if *is_dir { 4 } else { 8 }; // DT_DIR / DT_REG
            dirent[20..24].copy_from_slice(&dtype.to_le_bytes());
            body.extend_from_slice(&dirent);
            body.extend_from_slice(name_bytes);
            body.resize(body.len() + (padded - dirent_len), 0);
        }

        Self::ok_response(req.unique, &body)
    }

    fn mutating_parent_check(&self, nodeid: u64) -> Option<i32> {
        if nodeid == VIRTUAL_ROOT_INODE {
            // The guest cannot create or remove share tags.
            return Some(FUSE_EACCES);
        }
        let info = self.inodes.get(&nodeid)?;
        if self.share_readonly(&info.share_tag) {
            return Some(FUSE_EROFS);
        }
        None
    }

    fn handle_create(&mut self, req: &Request) -> Vec<u8> {
        if req.data.len() < 16 {
            return Self::error_response(req.unique, FUSE_EINVAL);
        }
        if let Some(err) = self.mutating_parent_check(req.nodeid) {
            return Self::error_response(req.unique, err);
        }
        let name_len = req.data[16..]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(req.data.len() - 16);
        let Ok(name) = std::str::from_utf8(&req.data[16..16 + name_len]) else {
            return Self::error_response(req.unique, FUSE_EINVAL);
        };

        let Some(parent) = self.inodes.get(&req.nodeid) else {
            return Self::error_response(req.unique, FUSE_ENOENT);
        };
        let path = parent.host_path.join(name);
        let share_tag = parent.share_tag.clone();

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) => return Self::error_response(req.unique, io_error_to_fuse(&e)),
        };

        let inode = self.get_or_create_inode(&path, false, &share_tag);
        let fh = self.alloc_handle(HostHandle::File(file), &path, &share_tag);
        let attr = match self.attr_for_path(&path, inode, false) {
            Ok(attr) => attr,
            Err(err) => return Self::error_response(req.unique, err),
        };

        let mut body = Vec::with_capacity(ENTRY_OUT_SIZE + 16);
        body.extend_from_slice(&self.entry_out(inode, 1, &attr));
        body.extend_from_slice(&Self::open_out_body(fh));
        Self::ok_response(req.unique, &body)
    }

    fn handle_mkdir(&mut self, req: &Request) -> Vec<u8> {
        if req.data.len() < 8 {
            return Self::error_response(req.unique, FUSE_EINVAL);
        }
        if let Some(err) = self.mutating_parent_check(req.nodeid) {
            return Self::error_response(req.unique, err);
        }
        let name_len = req.data[8..]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(req.data.len() - 8);
        let Ok(name) = std::str::from_utf8(&req.data[8..8 + name_len]) else {
            return Self::error_response(req.unique, FUSE_EINVAL);
        };

        let Some(parent) = self.inodes.get(&req.nodeid) else {
            return Self::error_response(req.unique, FUSE_ENOENT);
        };
        let path = parent.host_path.join(name);
        let share_tag = parent.share_tag.clone();

        if let Err(e) = std::fs::create_dir(&path) {
            return Self::error_response(req.unique, io_error_to_fuse(&e));
        }
        let inode = self.get_or_create_inode(&path, true, &share_tag);
        match self.attr_for_path(&path, inode, false) {
            Ok(attr) => Self::ok_response(req.unique, &self.entry_out(inode, 1, &attr)),
            Err(err) => Self::error_response(req.unique, err),
        }
    }

    fn remove_entry(&mut self, req: &Request, dir: bool) -> Vec<u8> {
        if let Some(err) = self.mutating_parent_check(req.nodeid) {
            return Self::error_response(req.unique, err);
        }
        let name_len = req.data.iter().position(|b| *b == 0).unwrap_or(req.data.len());
        let Ok(name) = std::str::from_utf8(&req.data[..name_len]) else {
            return Self::error_response(req.unique, FUSE_EINVAL);
        };
        let Some(parent) = self.inodes.get(&req.nodeid) else {
            return Self::error_response(req.unique, FUSE_ENOENT);
        };
        let path = parent.host_path.join(name);

        let result = if dir {
            std::fs::remove_dir(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => Self::error_response(req.unique, FUSE_OK),
            Err(e) => Self::error_response(req.unique, io_error_to_fuse(&e)),
        }
    }

    fn handle_rename(&mut self, req: &Request, rename2: bool) -> Vec<u8> {
        let fixed = if rename2 { 16 } else { 8 };
        if req.data.len() < fixed {
            return Self::error_response(req.unique, FUSE_EINVAL);
        }
        if let Some(err) = self.mutating_parent_check(req.nodeid) {
            return Self::error_response(req.unique, err);
        }
        let newdir = u64::from_le_bytes(req.data[0..8].try_into().unwrap());
        if let Some(err) = self.mutating_parent_check(newdir) {
            return Self::error_response(req.unique, err);
        }

        let names = &req.data[fixed..];
        let first_end = names.iter().position(|b| *b == 0).unwrap_or(names.len());
        let second = &names[(first_end + 1).min(names.len())..];
        let second_end = second.iter().position(|b| *b == 0).unwrap_or(second.len());

        let (Ok(old_name), Ok(new_name)) = (
            std::str::from_utf8(&names[..first_end]),
            std::str::from_utf8(&second[..second_end]),
        ) else {
            return Self::error_response(req.unique, FUSE_EINVAL);
        };

        let (Some(old_parent), Some(new_parent)) =
            (self.inodes.get(&req.nodeid), self.inodes.get(&newdir))
        else {
            return Self::error_response(req.unique, FUSE_ENOENT);
        };
        let old_path = old_parent.host_path.join(old_name);
        let new_path = new_parent.host_path.join(new_name);

        match std::fs::rename(&old_path, &new_path) {
            Ok(()) => {
                // Keep the inode table pointing at the moved path.
                if let Some(ino) = self.path_to_inode.remove(&old_path) {
                    if let Some(info) = self.inodes.get_mut(&ino) {
                        info.host_path = new_path.clone();
                    }
                    self.path_to_inode.insert(new_path, ino);
                }
                Self::error_response(req.unique, FUSE_OK)
            }
            Err(e) => Self::error_response(req.unique, io_error_to_fuse(&e)),
        }
    }

    fn handle_statfs(&mut self, req: &Request) -> Vec<u8> {
        // Synthesized filesystem geometry; the share is not a real block
        // device from the guest's point of view.
        let mut body = [0u8; 80];
        let blocks: u64 = 1 << 28; // 1 TiB of 4 KiB blocks
        let bfree: u64 = 1 << 27;
        body[0..8].copy_from_slice(&blocks.to_le_bytes());
        body[8..16].copy_from_slice(&bfree.to_le_bytes());
        body[16..24].copy_from_slice(&bfree.to_le_bytes()); // bavail
        body[24..32].copy_from_slice(&(1u64 << 20).to_le_bytes()); // files
        body[32..40].copy_from_slice(&(1u64 << 19).to_le_bytes()); // ffree
        body[40..44].copy_from_slice(&4096u32.to_le_bytes()); // bsize
        body[44..48].copy_from_slice(&255u32.to_le_bytes()); // namelen
        body[48..52].copy_from_slice(&4096u32.to_le_bytes()); // frsize
        Self::ok_response(req.unique, &body)
    }

    fn handle_fsync(&mut self, req: &Request) -> Vec<u8> {
        if req.data.len() >= 8 {
            let fh = u64::from_le_bytes(req.data[0..8].try_into().unwrap());
            if let Some(OpenHandle { handle: HostHandle::File(file), .. }) =
                self.handles.get_mut(&fh)
            {
                if let Err(e) = file.sync_all() {
                    return Self::error_response(req.unique, io_error_to_fuse(&e));
                }
            }
        }
        Self::error_response(req.unique, FUSE_OK)
    }

    fn dispatch(&mut self, req: &Request) -> Option<Vec<u8>> {
        match req.opcode {
            FUSE_INIT => Some(self.handle_init(req)),
            FUSE_LOOKUP => Some(self.handle_lookup(req)),
            FUSE_FORGET => {
                self.handle_forget(req);
                None // FORGET has no reply
            }
            FUSE_BATCH_FORGET => {
                self.handle_batch_forget(req);
                None
            }
            FUSE_GETATTR => Some(self.handle_getattr(req)),
            FUSE_SETATTR => Some(self.handle_setattr(req)),
            FUSE_OPEN => Some(self.handle_open(req)),
            FUSE_READ => Some(self.handle_read(req)),
            FUSE_WRITE => Some(self.handle_write(req)),
            FUSE_RELEASE | FUSE_RELEASEDIR => {
                self.handle_release(req);
                Some(Self::error_response(req.unique, FUSE_OK))
            }
            FUSE_OPENDIR => Some(self.handle_opendir(req)),
            FUSE_READDIR => Some(self.handle_readdir(req, false)),
            FUSE_READDIRPLUS => Some(self.handle_readdir(req, true)),
            FUSE_STATFS => Some(self.handle_statfs(req)),
            FUSE_CREATE => Some(self.handle_create(req)),
            FUSE_MKDIR => Some(self.handle_mkdir(req)),
            FUSE_UNLINK => Some(self.remove_entry(req, false)),
            FUSE_RMDIR => Some(self.remove_entry(req, true)),
            FUSE_RENAME => Some(self.handle_rename(req, false)),
            FUSE_RENAME2 => Some(self.handle_rename(req, true)),
            FUSE_FLUSH | FUSE_ACCESS | FUSE_DESTROY => {
                Some(Self::error_response(req.unique, FUSE_OK))
            }
            FUSE_FSYNC | FUSE_FSYNCDIR => Some(self.handle_fsync(req)),
            other => {
                debug!(opcode = other, "virtio-fs unimplemented FUSE opcode");
                Some(Self::error_response(req.unique, FUSE_ENOSYS))
            }
        }
    }

    fn process_queue(&mut self, handle: &QueueHandle) {
        while let Some((head, chain)) = handle.pop_chain() {
            if chain.is_empty() {
                continue;
            }
            let in_buf = ChainReader::new(handle.mem(), &chain).read_all();
            if in_buf.len() < IN_HEADER_SIZE {
                warn!(len = in_buf.len(), "virtio-fs request too small");
                handle.push_used(head, 0);
                continue;
            }

            let req = Request {
                opcode: u32::from_le_bytes(in_buf[4..8].try_into().unwrap()),
                unique: u64::from_le_bytes(in_buf[8..16].try_into().unwrap()),
                nodeid: u64::from_le_bytes(in_buf[16..24].try_into().unwrap()),
                data: &in_buf[IN_HEADER_SIZE..],
            };

            match self.dispatch(&req) {
                Some(out) => {
                    let mut writer = ChainWriter::new(handle.mem(), &chain);
                    writer.write(&out);
                    handle.push_used(head, writer.written());
                }
                None => handle.push_used(head, 0),
            }
        }
        handle.interrupt().signal_used_buffer();
    }
}

impl VirtioDevice for VirtioFs {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_FS
    }

    fn device_features(&self) -> u64 {
        VIRTIO_F_VERSION_1
    }

    fn num_queues(&self) -> usize {
        // Queue 0 is the hiprio queue, queue 1 the request queue.
        2
    }

    fn queue_max_size(&self, _queue: usize) -> u16 {
        QUEUE_SIZE
    }

    fn read_config(&mut self, offset: u64, data: &mut [u8]) {
        // { tag[36], num_request_queues u32 }
        let mut cfg = [0u8; 40];
        let tag = self.mount_tag.as_bytes();
        let n = tag.len().min(36);
        cfg[..n].copy_from_slice(&tag[..n]);
        cfg[36..40].copy_from_slice(&1u32.to_le_bytes());
        data.fill(0);
        if let Ok(off) = usize::try_from(offset) {
            if off < cfg.len() {
                let n = data.len().min(cfg.len() - off);
                data[..n].copy_from_slice(&cfg[off..off + n]);
            }
        }
    }

    fn on_queue_ready(&mut self, queue: usize, handle: QueueHandle) {
        if queue < 2 {
            self.queues[queue] = Some(handle);
        }
    }

    fn on_queue_notify(&mut self, queue: usize) {
        if queue < 2 {
            if let Some(handle) = self.queues[queue].clone() {
                self.process_queue(&handle);
            }
        }
    }

    fn on_reset(&mut self) {
        info!("virtio-fs reset, closing open handles");
        self.handles.clear();
        self.queues = [None, None];
    }
}

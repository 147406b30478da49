use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tenbox_memory::{GuestMemory, GuestRam};
use tenbox_platform::{Device, IrqLine, IrqSink};
use tenbox_virtio::devices::fs::{
    VirtioFs, FUSE_EACCES, FUSE_ENOENT, FUSE_EROFS, FUSE_OK, VIRTUAL_ROOT_INODE,
};
use tenbox_virtio::{VirtioMmio, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};

const REG_QUEUE_SEL: u64 = 0x030;
const REG_QUEUE_NUM: u64 = 0x038;
const REG_QUEUE_READY: u64 = 0x044;
const REG_QUEUE_NOTIFY: u64 = 0x050;
const REG_STATUS: u64 = 0x070;
const REG_QUEUE_DESC_LOW: u64 = 0x080;
const REG_QUEUE_DRIVER_LOW: u64 = 0x090;
const REG_QUEUE_DEVICE_LOW: u64 = 0x0A0;
const REG_CONFIG: u64 = 0x100;

const FUSE_LOOKUP: u32 = 1;
const FUSE_FORGET: u32 = 2;
const FUSE_GETATTR: u32 = 3;
const FUSE_OPEN: u32 = 14;
const FUSE_READ: u32 = 15;
const FUSE_WRITE: u32 = 16;
const FUSE_RELEASE: u32 = 18;
const FUSE_INIT: u32 = 26;
const FUSE_OPENDIR: u32 = 27;
const FUSE_READDIR: u32 = 28;
const FUSE_CREATE: u32 = 35;
const FUSE_MKDIR: u32 = 9;
const FUSE_UNLINK: u32 = 10;

const IN_HDR: usize = 40;
const OUT_HDR: usize = 16;
const ENTRY_OUT: usize = 128;

const DESC: u64 = 0x1000;
const AVAIL: u64 = 0x2000;
const USED: u64 = 0x3000;
const REQ: u64 = 0x10000;
const RESP: u64 = 0x20000;

#[derive(Default)]
struct CountingSink(AtomicUsize);

impl IrqSink for CountingSink {
    fn raise_irq(&self, _irq: u32) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    mmio: VirtioMmio,
    fs: Arc<Mutex<VirtioFs>>,
    mem: GuestRam,
    avail_idx: u16,
    unique: u64,
}

fn harness(fs: VirtioFs) -> Harness {
    let mem = GuestMemory::new(0x100000).view();
    let fs = Arc::new(Mutex::new(fs));
    let irqs = Arc::new(CountingSink::default());
    let mut mmio = VirtioMmio::new(fs.clone(), mem.clone(), IrqLine::new(10, irqs));

    mmio.mmio_write(REG_STATUS, 4, 0x0F);
    mmio.mmio_write(REG_QUEUE_SEL, 4, 1);
    mmio.mmio_write(REG_QUEUE_NUM, 4, 8);
    mmio.mmio_write(REG_QUEUE_DESC_LOW, 4, DESC);
    mmio.mmio_write(REG_QUEUE_DRIVER_LOW, 4, AVAIL);
    mmio.mmio_write(REG_QUEUE_DEVICE_LOW, 4, USED);
    mmio.mmio_write(REG_QUEUE_READY, 4, 1);

    Harness { mmio, fs, mem, avail_idx: 0, unique: 0 }
}

struct FuseReply {
    error: i32,
    body: Vec<u8>,
}

impl Harness {
    /// Send one FUSE request and return (error, body).
    fn fuse(&mut self, opcode: u32, nodeid: u64, data: &[u8]) -> FuseReply {
        self.unique += 1;
        let mut req = vec![0u8; IN_HDR];
        let total = (IN_HDR + data.len()) as u32;
        req[0..4].copy_from_slice(&total.to_le_bytes());
        req[4..8].copy_from_slice(&opcode.to_le_bytes());
        req[8..16].copy_from_slice(&self.unique.to_le_bytes());
        req[16..24].copy_from_slice(&nodeid.to_le_bytes());
        req.extend_from_slice(data);
        self.mem.write(REQ, &req).unwrap();

        self.mem.write_u64_le(DESC, REQ).unwrap();
        self.mem.write_u32_le(DESC + 8, req.len() as u32).unwrap();
        self.mem.write_u16_le(DESC + 12, VIRTQ_DESC_F_NEXT).unwrap();
        self.mem.write_u16_le(DESC + 14, 1).unwrap();
        self.mem.write_u64_le(DESC + 16, RESP).unwrap();
        self.mem.write_u32_le(DESC + 24, 0x10000).unwrap();
        self.mem.write_u16_le(DESC + 28, VIRTQ_DESC_F_WRITE).unwrap();
        self.mem.write_u16_le(DESC + 30, 0).unwrap();

        let slot = self.avail_idx % 8;
        self.mem.write_u16_le(AVAIL + 4 + u64::from(slot) * 2, 0).unwrap();
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.mem.write_u16_le(AVAIL + 2, self.avail_idx).unwrap();
        self.mmio.mmio_write(REG_QUEUE_NOTIFY, 4, 1);

        let slot = u64::from((self.avail_idx - 1) % 8);
        let written = self.mem.read_u32_le(USED + 4 + slot * 8 + 4).unwrap() as usize;
        if written < OUT_HDR {
            return FuseReply { error: 0, body: Vec::new() };
        }
        let raw = self.mem.read_vec(RESP, written).unwrap();
        FuseReply {
            error: i32::from_le_bytes(raw[4..8].try_into().unwrap()),
            body: raw[OUT_HDR..].to_vec(),
        }
    }

    fn init(&mut self) {
        let mut data = [0u8; 16];
        data[0..4].copy_from_slice(&7u32.to_le_bytes());
        data[4..8].copy_from_slice(&31u32.to_le_bytes());
        let reply = self.fuse(FUSE_INIT, 0, &data);
        assert_eq!(reply.error, FUSE_OK);
        assert_eq!(u32::from_le_bytes(reply.body[0..4].try_into().unwrap()), 7);
    }

    fn lookup(&mut self, parent: u64, name: &str) -> Result<u64, i32> {
        let mut data = name.as_bytes().to_vec();
        data.push(0);
        let reply = self.fuse(FUSE_LOOKUP, parent, &data);
        if reply.error != FUSE_OK {
            return Err(reply.error);
        }
        Ok(u64::from_le_bytes(reply.body[0..8].try_into().unwrap()))
    }

    fn open(&mut self, nodeid: u64, flags: u32) -> Result<u64, i32> {
        let mut data = [0u8; 8];
        data[0..4].copy_from_slice(&flags.to_le_bytes());
        let reply = self.fuse(FUSE_OPEN, nodeid, &data);
        if reply.error != FUSE_OK {
            return Err(reply.error);
        }
        Ok(u64::from_le_bytes(reply.body[0..8].try_into().unwrap()))
    }

    fn read(&mut self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, i32> {
        let mut data = [0u8; 40];
        data[0..8].copy_from_slice(&fh.to_le_bytes());
        data[8..16].copy_from_slice(&offset.to_le_bytes());
        data[16..20].copy_from_slice(&size.to_le_bytes());
        let reply = self.fuse(FUSE_READ, 0, &data);
        if reply.error != FUSE_OK {
            return Err(reply.error);
        }
        Ok(reply.body)
    }

    fn write(&mut self, fh: u64, offset: u64, payload: &[u8]) -> Result<u32, i32> {
        let mut data = vec![0u8; 40];
        data[0..8].copy_from_slice(&fh.to_le_bytes());
        data[8..16].copy_from_slice(&offset.to_le_bytes());
        data[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(payload);
        let reply = self.fuse(FUSE_WRITE, 0, &data);
        if reply.error != FUSE_OK {
            return Err(reply.error);
        }
        Ok(u32::from_le_bytes(reply.body[0..4].try_into().unwrap()))
    }
}

fn two_share_fs(dir_a: &std::path::Path, dir_b: &std::path::Path) -> VirtioFs {
    let mut fs = VirtioFs::new("shared");
    assert!(fs.add_share("projects", dir_a, false));
    assert!(fs.add_share("readonly", dir_b, true));
    fs
}

#[test]
fn config_carries_mount_tag() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness({
        let mut fs = VirtioFs::new("shared");
        fs.add_share("s", dir.path(), false);
        fs
    });
    let mut tag = Vec::new();
    for i in 0..6 {
        tag.push(h.mmio.mmio_read(REG_CONFIG + i, 1) as u8);
    }
    assert_eq!(&tag, b"shared");
    assert_eq!(h.mmio.mmio_read(REG_CONFIG + 36, 4), 1);
}

#[test]
fn lookup_of_share_tag_and_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"hello fuse").unwrap();
    let ro = tempfile::tempdir().unwrap();

    let mut h = harness(two_share_fs(dir.path(), ro.path()));
    h.init();

    let share_root = h.lookup(VIRTUAL_ROOT_INODE, "projects").unwrap();
    assert!(share_root >= 2);
    assert_eq!(h.lookup(VIRTUAL_ROOT_INODE, "missing"), Err(FUSE_ENOENT));

    let file = h.lookup(share_root, "hello.txt").unwrap();
    let fh = h.open(file, 0).unwrap();
    assert_eq!(h.read(fh, 0, 100).unwrap(), b"hello fuse");
    assert_eq!(h.read(fh, 6, 100).unwrap(), b"fuse");

    let reply = {
        let mut data = [0u8; 24];
        data[0..8].copy_from_slice(&fh.to_le_bytes());
        h.fuse(FUSE_RELEASE, file, &data)
    };
    assert_eq!(reply.error, FUSE_OK);
    assert_eq!(h.fs.lock().unwrap().open_handle_count(), 0);
}

#[test]
fn repeated_lookup_increments_nlookup_and_forget_removes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"x").unwrap();
    let ro = tempfile::tempdir().unwrap();

    let mut h = harness(two_share_fs(dir.path(), ro.path()));
    h.init();
    let root = h.lookup(VIRTUAL_ROOT_INODE, "projects").unwrap();

    let a = h.lookup(root, "f").unwrap();
    let b = h.lookup(root, "f").unwrap();
    assert_eq!(a, b);
    assert_eq!(h.fs.lock().unwrap().nlookup(a), Some(2));

    // FORGET with the full count removes the inode.
    let mut data = [0u8; 8];
    data[0..8].copy_from_slice(&2u64.to_le_bytes());
    h.fuse(FUSE_FORGET, a, &data);
    assert_eq!(h.fs.lock().unwrap().nlookup(a), None);

    // Share roots survive forget.
    h.fuse(FUSE_FORGET, root, &data);
    assert_eq!(h.lookup(VIRTUAL_ROOT_INODE, "projects").unwrap(), root);
}

#[test]
fn create_write_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let ro = tempfile::tempdir().unwrap();
    let mut h = harness(two_share_fs(dir.path(), ro.path()));
    h.init();
    let root = h.lookup(VIRTUAL_ROOT_INODE, "projects").unwrap();

    let mut data = vec![0u8; 16];
    data[0..4].copy_from_slice(&2u32.to_le_bytes()); // O_RDWR
    data.extend_from_slice(b"new.txt\0");
    let reply = h.fuse(FUSE_CREATE, root, &data);
    assert_eq!(reply.error, FUSE_OK);
    let fh = u64::from_le_bytes(reply.body[ENTRY_OUT..ENTRY_OUT + 8].try_into().unwrap());

    assert_eq!(h.write(fh, 0, b"payload").unwrap(), 7);
    assert_eq!(h.read(fh, 0, 16).unwrap(), b"payload");
    assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"payload");
}

#[test]
fn virtual_root_rejects_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let ro = tempfile::tempdir().unwrap();
    let mut h = harness(two_share_fs(dir.path(), ro.path()));
    h.init();

    let mut data = vec![0u8; 8];
    data.extend_from_slice(b"newdir\0");
    let reply = h.fuse(FUSE_MKDIR, VIRTUAL_ROOT_INODE, &data);
    assert_eq!(reply.error, FUSE_EACCES);

    let reply = h.fuse(FUSE_UNLINK, VIRTUAL_ROOT_INODE, b"projects\0");
    assert_eq!(reply.error, FUSE_EACCES);
}

#[test]
fn readonly_share_rejects_writes_with_erofs() {
    let dir = tempfile::tempdir().unwrap();
    let ro = tempfile::tempdir().unwrap();
    std::fs::write(ro.path().join("f"), b"data").unwrap();

    let mut h = harness(two_share_fs(dir.path(), ro.path()));
    h.init();
    let root = h.lookup(VIRTUAL_ROOT_INODE, "readonly").unwrap();

    // Open for write fails.
    let file = h.lookup(root, "f").unwrap();
    assert_eq!(h.open(file, 1), Err(FUSE_EROFS));
    // Creation fails.
    let mut data = vec![0u8; 16];
    data.extend_from_slice(b"x\0");
    assert_eq!(h.fuse(FUSE_CREATE, root, &data).error, FUSE_EROFS);
    // Reading still works.
    let fh = h.open(file, 0).unwrap();
    assert_eq!(h.read(fh, 0, 10).unwrap(), b"data");
}

#[test]
fn readdir_of_virtual_root_lists_share_tags() {
    let dir = tempfile::tempdir().unwrap();
    let ro = tempfile::tempdir().unwrap();
    let mut h = harness(two_share_fs(dir.path(), ro.path()));
    h.init();

    let reply = h.fuse(FUSE_OPENDIR, VIRTUAL_ROOT_INODE, &[0u8; 8]);
    assert_eq!(reply.error, FUSE_OK);

    let mut data = [0u8; 40];
    data[16..20].copy_from_slice(&4096u32.to_le_bytes());
    let reply = h.fuse(FUSE_READDIR, VIRTUAL_ROOT_INODE, &data);
    assert_eq!(reply.error, FUSE_OK);

    // Parse dirent names out of the listing.
    let mut names = Vec::new();
    let mut off = 0usize;
    while off + 24 <= reply.body.len() {
        let namelen =
            u32::from_le_bytes(reply.body[off + 16..off + 20].try_into().unwrap()) as usize;
        names.push(String::from_utf8_lossy(&reply.body[off + 24..off + 24 + namelen]).into_owned());
        off += (24 + namelen + 7) & !7;
    }
    assert_eq!(names, vec!["projects".to_string(), "readonly".to_string()]);
}

#[test]
fn getattr_distinguishes_directories_and_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), vec![0u8; 1234]).unwrap();
    let ro = tempfile::tempdir().unwrap();

    let mut h = harness(two_share_fs(dir.path(), ro.path()));
    h.init();

    let reply = h.fuse(FUSE_GETATTR, VIRTUAL_ROOT_INODE, &[0u8; 16]);
    assert_eq!(reply.error, FUSE_OK);
    let mode = u32::from_le_bytes(reply.body[16 + 60..16 + 64].try_into().unwrap());
    assert_eq!(mode & 0o170000, 0o040000);

    let root = h.lookup(VIRTUAL_ROOT_INODE, "projects").unwrap();
    let file = h.lookup(root, "f").unwrap();
    let reply = h.fuse(FUSE_GETATTR, file, &[0u8; 16]);
    let size = u64::from_le_bytes(reply.body[16 + 8..16 + 16].try_into().unwrap());
    let mode = u32::from_le_bytes(reply.body[16 + 60..16 + 64].try_into().unwrap());
    assert_eq!(size, 1234);
    assert_eq!(mode & 0o170000, 0o100000);
}

#[test]
fn share_management_updates_listing() {
    let dir = tempfile::tempdir().unwrap();
    let ro = tempfile::tempdir().unwrap();
    let extra = tempfile::tempdir().unwrap();
    let mut h = harness(two_share_fs(dir.path(), ro.path()));
    h.init();

    {
        let mut fs = h.fs.lock().unwrap();
        assert!(fs.add_share("extra", extra.path(), false));
        assert!(!fs.add_share("extra", extra.path(), false));
        assert_eq!(fs.share_tags(), vec!["extra", "projects", "readonly"]);
        assert!(fs.remove_share("projects"));
        assert!(!fs.has_share("projects"));
    }
    assert_eq!(h.lookup(VIRTUAL_ROOT_INODE, "projects"), Err(FUSE_ENOENT));
    assert!(h.lookup(VIRTUAL_ROOT_INODE, "extra").is_ok());
}

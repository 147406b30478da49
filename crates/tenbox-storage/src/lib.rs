//! Disk images for virtio-blk: raw files and qcow2 (v2/v3) with
//! copy-on-write metadata, an LRU-cached L2 layer and compressed-cluster
//! reads. All on-disk qcow2 integers are big-endian; conversion happens at
//! the [`StorageBackend`] boundary and nowhere else.

mod backend;
mod qcow2;
mod raw;

pub use backend::{FileBackend, MemBackend, StorageBackend};
pub use qcow2::Qcow2Disk;
pub use raw::RawDisk;

use std::path::Path;

use thiserror::Error;

pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt image: {0}")]
    CorruptImage(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("access out of bounds: offset {offset:#x} len {len} capacity {capacity:#x}")]
    OutOfBounds { offset: u64, len: usize, capacity: u64 },
    #[error("offset overflow")]
    OffsetOverflow,
}

pub type Result<T> = std::result::Result<T, DiskError>;

/// A readable/writable virtual disk as the block device sees it.
pub trait VirtualDisk: Send {
    fn capacity_bytes(&self) -> u64;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Raw,
    Qcow2,
}

/// A disk image file, format detected from the magic bytes.
pub enum DiskImage {
    Raw(RawDisk<FileBackend>),
    Qcow2(Qcow2Disk<FileBackend>),
}

impl DiskImage {
    pub fn open_auto(path: &Path) -> Result<Self> {
        let mut backend = FileBackend::open(path)?;
        let format = detect_format(&mut backend)?;
        match format {
            DiskFormat::Qcow2 => Ok(DiskImage::Qcow2(Qcow2Disk::open(backend)?)),
            DiskFormat::Raw => Ok(DiskImage::Raw(RawDisk::open(backend)?)),
        }
    }

    pub fn format(&self) -> DiskFormat {
        match self {
            DiskImage::Raw(_) => DiskFormat::Raw,
            DiskImage::Qcow2(_) => DiskFormat::Qcow2,
        }
    }
}

impl VirtualDisk for DiskImage {
    fn capacity_bytes(&self) -> u64 {
        match self {
            DiskImage::Raw(d) => d.capacity_bytes(),
            DiskImage::Qcow2(d) => d.capacity_bytes(),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            DiskImage::Raw(d) => d.read_at(offset, buf),
            DiskImage::Qcow2(d) => d.read_at(offset, buf),
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            DiskImage::Raw(d) => d.write_at(offset, buf),
            DiskImage::Qcow2(d) => d.write_at(offset, buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            DiskImage::Raw(d) => d.flush(),
            DiskImage::Qcow2(d) => d.flush(),
        }
    }
}

pub fn detect_format<B: StorageBackend>(backend: &mut B) -> Result<DiskFormat> {
    let mut magic = [0u8; 4];
    if backend.len()? >= 4 {
        backend.read_at(0, &mut magic)?;
    }
    if u32::from_be_bytes(magic) == qcow2::QCOW2_MAGIC {
        Ok(DiskFormat::Qcow2)
    } else {
        Ok(DiskFormat::Raw)
    }
}

pub(crate) fn check_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if end > capacity {
        return Err(DiskError::OutOfBounds { offset, len, capacity });
    }
    Ok(())
}

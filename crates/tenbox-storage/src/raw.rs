use crate::{check_range, DiskError, Result, StorageBackend, VirtualDisk};

/// A raw image: the file is the disk.
pub struct RawDisk<B: StorageBackend> {
    backend: B,
    capacity: u64,
}

impl<B: StorageBackend> RawDisk<B> {
    pub fn open(mut backend: B) -> Result<Self> {
        let capacity = backend.len()?;
        if capacity < crate::SECTOR_SIZE as u64 {
            return Err(DiskError::CorruptImage("raw image smaller than one sector"));
        }
        Ok(RawDisk { backend, capacity })
    }

    pub fn create(mut backend: B, capacity: u64) -> Result<Self> {
        backend.set_len(capacity)?;
        Self::open(backend)
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

impl<B: StorageBackend> VirtualDisk for RawDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.capacity)?;
        self.backend.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.capacity)?;
        self.backend.write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }
}

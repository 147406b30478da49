use flate2::{Decompress, FlushDecompress};
use lru::LruCache;
use std::num::NonZeroUsize;
use tracing::debug;

use crate::{DiskError, Result, StorageBackend, VirtualDisk};

pub(crate) const QCOW2_MAGIC: u32 = 0x514649FB;

const OFLAG_COPIED: u64 = 1 << 63;
const OFLAG_COMPRESSED: u64 = 1 << 62;
/// Host offset bits of a standard L1/L2 entry (bits 9..55).
const OFFSET_MASK: u64 = 0x00FF_FFFF_FFFF_FE00;

const L2_CACHE_ENTRIES: usize = 16;

struct L2Table {
    /// Entries in host byte order.
    entries: Vec<u64>,
    dirty: bool,
}

/// qcow2 v2/v3 image. Backing files, encryption and internal snapshots
/// are rejected at open. Cluster allocation appends at the cluster-aligned
/// end of file; refcount structures are not maintained (tools that care
/// can rebuild them).
pub struct Qcow2Disk<B: StorageBackend> {
    backend: B,
    version: u32,
    virtual_size: u64,
    cluster_bits: u32,
    cluster_size: u64,
    l2_entries: u64,
    l1_table_offset: u64,
    l1_table: Vec<u64>,
    /// Cluster-aligned end of file, where the next allocation goes.
    file_end: u64,
    l2_cache: LruCache<u64, L2Table>,
}

impl<B: StorageBackend> Qcow2Disk<B> {
    pub fn open(mut backend: B) -> Result<Self> {
        let mut header = [0u8; 104];
        let file_len = backend.len()?;
        if file_len < 72 {
            return Err(DiskError::CorruptImage("qcow2 header too short"));
        }
        let header_len = header.len().min(file_len as usize);
        backend.read_at(0, &mut header[..header_len])?;

        let be32 = |off: usize| u32::from_be_bytes(header[off..off + 4].try_into().unwrap());
        let be64 = |off: usize| u64::from_be_bytes(header[off..off + 8].try_into().unwrap());

        if be32(0) != QCOW2_MAGIC {
            return Err(DiskError::CorruptImage("qcow2 bad magic"));
        }
        let version = be32(4);
        if version != 2 && version != 3 {
            return Err(DiskError::Unsupported("qcow2 version"));
        }
        if be64(8) != 0 {
            return Err(DiskError::Unsupported("qcow2 backing file"));
        }
        if be32(32) != 0 {
            return Err(DiskError::Unsupported("qcow2 encryption"));
        }

        let cluster_bits = be32(20);
        if !(9..=21).contains(&cluster_bits) {
            return Err(DiskError::CorruptImage("qcow2 invalid cluster_bits"));
        }
        let cluster_size = 1u64 << cluster_bits;
        let virtual_size = be64(24);
        let l1_size = be32(36) as usize;
        let l1_table_offset = be64(40);

        // The whole L1 table is held in memory for the life of the disk.
        let mut l1_raw = vec![0u8; l1_size * 8];
        if !l1_raw.is_empty() {
            backend.read_at(l1_table_offset, &mut l1_raw)?;
        }
        let l1_table: Vec<u64> = l1_raw
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect();
        for entry in &l1_table {
            if *entry & OFLAG_COMPRESSED != 0 {
                return Err(DiskError::Unsupported("qcow2 compressed l1 entry"));
            }
        }

        let file_end = (file_len + cluster_size - 1) & !(cluster_size - 1);

        debug!(
            version,
            cluster_size,
            virtual_size,
            l1_size,
            file_end,
            "opened qcow2 image"
        );

        Ok(Qcow2Disk {
            backend,
            version,
            virtual_size,
            cluster_bits,
            cluster_size,
            l2_entries: cluster_size / 8,
            l1_table_offset,
            l1_table,
            file_end,
            l2_cache: LruCache::new(NonZeroUsize::new(L2_CACHE_ENTRIES).unwrap()),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    pub fn into_backend(mut self) -> Result<B> {
        self.flush()?;
        Ok(self.backend)
    }

    fn l1_l2_index(&self, voff: u64) -> (usize, usize) {
        let l1 = voff / (self.l2_entries * self.cluster_size);
        let l2 = (voff / self.cluster_size) % self.l2_entries;
        (l1 as usize, l2 as usize)
    }

    fn write_back_l2(backend: &mut B, l2_offset: u64, table: &L2Table) -> Result<()> {
        let mut raw = Vec::with_capacity(table.entries.len() * 8);
        for e in &table.entries {
            raw.extend_from_slice(&e.to_be_bytes());
        }
        backend.write_at(l2_offset, &raw)
    }

    /// Load (or find cached) the L2 table at `l2_offset` and run `f` on it.
    fn with_l2_table<R>(
        &mut self,
        l2_offset: u64,
        f: impl FnOnce(&mut L2Table) -> R,
    ) -> Result<R> {
        if !self.l2_cache.contains(&l2_offset) {
            // Evict the LRU entry first so the capacity bound holds, and
            // write it back if dirty.
            if self.l2_cache.len() == L2_CACHE_ENTRIES {
                if let Some((victim_off, victim)) = self.l2_cache.pop_lru() {
                    if victim.dirty {
                        Self::write_back_l2(&mut self.backend, victim_off, &victim)?;
                    }
                }
            }

            let mut raw = vec![0u8; (self.l2_entries * 8) as usize];
            self.backend.read_at(l2_offset, &mut raw)?;
            let entries = raw
                .chunks_exact(8)
                .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
                .collect();
            self.l2_cache.put(l2_offset, L2Table { entries, dirty: false });
        }
        Ok(f(self.l2_cache.get_mut(&l2_offset).unwrap()))
    }

    /// Allocate one zeroed cluster at the end of the file.
    fn allocate_cluster(&mut self) -> Result<u64> {
        let offset = self.file_end;
        self.file_end += self.cluster_size;
        self.backend.set_len(self.file_end)?;
        // set_len gives zeros on files; the mem backend zero-fills too.
        Ok(offset)
    }

    /// Resolve the mapping of the cluster containing `voff`.
    fn resolve(&mut self, voff: u64) -> Result<Mapping> {
        let (l1_idx, l2_idx) = self.l1_l2_index(voff);
        let Some(&l1_entry) = self.l1_table.get(l1_idx) else {
            return Ok(Mapping::Unallocated);
        };
        if l1_entry == 0 {
            return Ok(Mapping::Unallocated);
        }

        let l2_offset = l1_entry & OFFSET_MASK;
        let l2_entry = self.with_l2_table(l2_offset, |t| t.entries[l2_idx])?;
        if l2_entry == 0 {
            return Ok(Mapping::Unallocated);
        }

        if l2_entry & OFLAG_COMPRESSED != 0 {
            let nb_bits = self.cluster_bits - 8;
            let nb_csectors = (l2_entry & ((1u64 << nb_bits) - 1)) + 1;
            let host_offset =
                ((l2_entry & !OFLAG_COMPRESSED) >> nb_bits) & ((1u64 << (62 - nb_bits)) - 1);
            return Ok(Mapping::Compressed {
                host_offset,
                compressed_size: nb_csectors * 512,
            });
        }

        Ok(Mapping::Normal { host_offset: l2_entry & OFFSET_MASK })
    }

    fn read_compressed_cluster(
        &mut self,
        host_offset: u64,
        compressed_size: u64,
    ) -> Result<Vec<u8>> {
        let mut compressed = vec![0u8; compressed_size as usize];
        // Compressed data may run up to the end of file; clamp the tail.
        let file_len = self.backend.len()?;
        let avail = file_len.saturating_sub(host_offset).min(compressed_size);
        if avail == 0 {
            return Err(DiskError::CorruptImage("qcow2 compressed cluster truncated"));
        }
        compressed.truncate(avail as usize);
        self.backend.read_at(host_offset, &mut compressed)?;

        let mut out = vec![0u8; self.cluster_size as usize];
        // qcow2 stores raw deflate streams; some writers wrap them in a
        // zlib header, so try that second.
        if !inflate_into(&compressed, &mut out, false) && !inflate_into(&compressed, &mut out, true)
        {
            return Err(DiskError::CorruptImage("qcow2 compressed cluster undecodable"));
        }
        Ok(out)
    }

    /// Read the current contents of the cluster containing `voff` into a
    /// full cluster buffer (zeros when unallocated). Used to seed a COW
    /// destination for partial writes.
    fn read_whole_cluster(&mut self, cluster_voff: u64) -> Result<Vec<u8>> {
        match self.resolve(cluster_voff)? {
            Mapping::Unallocated => Ok(vec![0u8; self.cluster_size as usize]),
            Mapping::Normal { host_offset } => {
                let mut buf = vec![0u8; self.cluster_size as usize];
                self.backend.read_at(host_offset, &mut buf)?;
                Ok(buf)
            }
            Mapping::Compressed { host_offset, compressed_size } => {
                self.read_compressed_cluster(host_offset, compressed_size)
            }
        }
    }

    /// Return the L2 table offset covering `l1_idx`, allocating a fresh L2
    /// table (and persisting the L1 entry) when absent.
    fn ensure_l2_table(&mut self, l1_idx: usize) -> Result<u64> {
        if l1_idx >= self.l1_table.len() {
            return Err(DiskError::OutOfBounds {
                offset: l1_idx as u64,
                len: 8,
                capacity: self.l1_table.len() as u64,
            });
        }
        let l1_entry = self.l1_table[l1_idx];
        if l1_entry != 0 {
            return Ok(l1_entry & OFFSET_MASK);
        }

        let l2_offset = self.allocate_cluster()?;
        let new_entry = l2_offset | OFLAG_COPIED;
        self.l1_table[l1_idx] = new_entry;
        // The L1 entry goes to disk immediately; losing it would leak the
        // cluster and orphan every mapping in the new table.
        self.backend
            .write_at(self.l1_table_offset + l1_idx as u64 * 8, &new_entry.to_be_bytes())?;

        let entries = vec![0u64; self.l2_entries as usize];
        if self.l2_cache.len() == L2_CACHE_ENTRIES {
            if let Some((victim_off, victim)) = self.l2_cache.pop_lru() {
                if victim.dirty {
                    Self::write_back_l2(&mut self.backend, victim_off, &victim)?;
                }
            }
        }
        self.l2_cache.put(l2_offset, L2Table { entries, dirty: true });
        Ok(l2_offset)
    }
}

enum Mapping {
    Unallocated,
    Normal { host_offset: u64 },
    Compressed { host_offset: u64, compressed_size: u64 },
}

fn inflate_into(compressed: &[u8], out: &mut [u8], zlib_wrapped: bool) -> bool {
    let mut inflater = Decompress::new(zlib_wrapped);
    matches!(
        inflater.decompress(compressed, out, FlushDecompress::Finish),
        Ok(flate2::Status::StreamEnd) | Ok(flate2::Status::Ok) | Ok(flate2::Status::BufError)
            if inflater.total_out() > 0
    )
}

impl<B: StorageBackend> VirtualDisk for Qcow2Disk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.virtual_size
    }

    fn read_at(&mut self, mut offset: u64, buf: &mut [u8]) -> Result<()> {
        crate::check_range(offset, buf.len(), self.virtual_size)?;

        let mut dst = buf;
        while !dst.is_empty() {
            let in_cluster = offset & (self.cluster_size - 1);
            let chunk = dst.len().min((self.cluster_size - in_cluster) as usize);

            match self.resolve(offset)? {
                Mapping::Unallocated => dst[..chunk].fill(0),
                Mapping::Normal { host_offset } => {
                    self.backend.read_at(host_offset + in_cluster, &mut dst[..chunk])?;
                }
                Mapping::Compressed { host_offset, compressed_size } => {
                    let cluster = self.read_compressed_cluster(host_offset, compressed_size)?;
                    dst[..chunk]
                        .copy_from_slice(&cluster[in_cluster as usize..in_cluster as usize + chunk]);
                }
            }

            offset += chunk as u64;
            dst = &mut dst[chunk..];
        }
        Ok(())
    }

    fn write_at(&mut self, mut offset: u64, buf: &[u8]) -> Result<()> {
        crate::check_range(offset, buf.len(), self.virtual_size)?;

        let mut src = buf;
        while !src.is_empty() {
            let in_cluster = offset & (self.cluster_size - 1);
            let chunk = src.len().min((self.cluster_size - in_cluster) as usize);
            let (l1_idx, l2_idx) = self.l1_l2_index(offset);

            let l2_offset = self.ensure_l2_table(l1_idx)?;
            let l2_entry = self.with_l2_table(l2_offset, |t| t.entries[l2_idx])?;

            let needs_cow = l2_entry == 0 || l2_entry & OFLAG_COMPRESSED != 0;
            let data_offset = if needs_cow {
                // Copy-on-write: preserve bytes the write does not cover
                // when the cluster had prior contents.
                let seed = if chunk < self.cluster_size as usize && l2_entry != 0 {
                    Some(self.read_whole_cluster(offset & !(self.cluster_size - 1))?)
                } else {
                    None
                };

                let data_offset = self.allocate_cluster()?;
                if let Some(seed) = seed {
                    self.backend.write_at(data_offset, &seed)?;
                }

                self.with_l2_table(l2_offset, |t| {
                    t.entries[l2_idx] = data_offset | OFLAG_COPIED;
                    t.dirty = true;
                })?;
                data_offset
            } else {
                l2_entry & OFFSET_MASK
            };

            self.backend.write_at(data_offset + in_cluster, &src[..chunk])?;

            offset += chunk as u64;
            src = &src[chunk..];
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // Write dirty L2 tables back in big-endian without disturbing LRU
        // order.
        let dirty: Vec<u64> = self
            .l2_cache
            .iter()
            .filter(|(_, t)| t.dirty)
            .map(|(off, _)| *off)
            .collect();
        for l2_offset in dirty {
            let mut raw = Vec::new();
            if let Some(table) = self.l2_cache.peek_mut(&l2_offset) {
                raw.reserve(table.entries.len() * 8);
                for e in &table.entries {
                    raw.extend_from_slice(&e.to_be_bytes());
                }
                table.dirty = false;
            }
            self.backend.write_at(l2_offset, &raw)?;
        }
        self.backend.flush()
    }
}

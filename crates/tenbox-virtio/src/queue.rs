use std::sync::atomic::{fence, Ordering};

use tenbox_memory::GuestRam;
use tracing::warn;

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

const DESC_SIZE: u64 = 16;
const USED_ELEM_SIZE: u64 = 8;

/// One element of a walked descriptor chain, still expressed as a GPA;
/// devices copy through [`GuestRam`] rather than forming references into
/// guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainElem {
    pub gpa: u64,
    pub len: u32,
    pub writable: bool,
}

/// Device-side state of one split virtqueue. The rings themselves live in
/// guest RAM; this struct only tracks the addresses, the queue size and
/// the device's consume cursor into the available ring.
pub struct VirtQueue {
    size: u16,
    desc_gpa: u64,
    driver_gpa: u64,
    device_gpa: u64,
    last_avail_idx: u16,
    ready: bool,
}

impl VirtQueue {
    pub fn new(size: u16) -> Self {
        VirtQueue {
            size,
            desc_gpa: 0,
            driver_gpa: 0,
            device_gpa: 0,
            last_avail_idx: 0,
            ready: false,
        }
    }

    /// Capture a staged configuration; the driver wrote `QueueReady=1`.
    pub fn configure(&mut self, size: u16, desc_gpa: u64, driver_gpa: u64, device_gpa: u64) {
        self.size = size;
        self.desc_gpa = desc_gpa;
        self.driver_gpa = driver_gpa;
        self.device_gpa = device_gpa;
        self.last_avail_idx = 0;
        self.ready = true;
    }

    pub fn reset(&mut self) {
        self.desc_gpa = 0;
        self.driver_gpa = 0;
        self.device_gpa = 0;
        self.last_avail_idx = 0;
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn has_available(&self, mem: &GuestRam) -> bool {
        if !self.ready {
            return false;
        }
        match mem.read_u16_le(self.driver_gpa + 2) {
            Ok(avail_idx) => avail_idx != self.last_avail_idx,
            Err(_) => false,
        }
    }

    /// Pop the next available head index, advancing the consume cursor.
    pub fn pop_avail(&mut self, mem: &GuestRam) -> Option<u16> {
        if !self.has_available(mem) {
            return None;
        }
        // Pair with the driver's publish of `avail.idx`.
        fence(Ordering::Acquire);
        let slot = self.driver_gpa + 4 + u64::from(self.last_avail_idx % self.size) * 2;
        let head = mem.read_u16_le(slot).ok()?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Some(head)
    }

    /// Walk the chain rooted at `head`, bounded by the queue size so a
    /// looped `next` pointer cannot spin forever. Returns `None` for
    /// chains the device cannot safely touch (bad index, bad GPA).
    pub fn walk_chain(&self, mem: &GuestRam, head: u16) -> Option<Vec<ChainElem>> {
        let mut chain = Vec::new();
        let mut idx = head;

        for _ in 0..self.size {
            if idx >= self.size {
                warn!(idx, size = self.size, "virtqueue descriptor index out of range");
                return None;
            }
            let base = self.desc_gpa + u64::from(idx) * DESC_SIZE;
            let addr = mem.read_u64_le(base).ok()?;
            let len = mem.read_u32_le(base + 8).ok()?;
            let flags = mem.read_u16_le(base + 12).ok()?;
            let next = mem.read_u16_le(base + 14).ok()?;

            if len > 0 && !mem.is_valid(addr, len as usize) {
                warn!(gpa = format_args!("{addr:#x}"), len, "virtqueue descriptor outside guest RAM");
                return None;
            }

            chain.push(ChainElem {
                gpa: addr,
                len,
                writable: flags & VIRTQ_DESC_F_WRITE != 0,
            });

            if flags & VIRTQ_DESC_F_NEXT == 0 {
                return if chain.is_empty() { None } else { Some(chain) };
            }
            idx = next;
        }

        warn!(head, "virtqueue descriptor chain exceeds queue size");
        None
    }

    /// Publish a completed buffer. The ring element store is fenced before
    /// the `used.idx` increment so the guest never observes the new index
    /// with a stale element.
    pub fn push_used(&self, mem: &GuestRam, head: u16, total_len: u32) {
        let used_idx = match mem.read_u16_le(self.device_gpa + 2) {
            Ok(idx) => idx,
            Err(_) => return,
        };
        let slot = self.device_gpa + 4 + u64::from(used_idx % self.size) * USED_ELEM_SIZE;
        let _ = mem.write_u32_le(slot, u32::from(head));
        let _ = mem.write_u32_le(slot + 4, total_len);

        fence(Ordering::Release);

        let _ = mem.write_u16_le(self.device_gpa + 2, used_idx.wrapping_add(1));
    }
}

/// Sequential reader over the readable (device-read) elements of a chain.
pub struct ChainReader<'a> {
    mem: &'a GuestRam,
    elems: Vec<ChainElem>,
    elem: usize,
    offset: u32,
}

impl<'a> ChainReader<'a> {
    pub fn new(mem: &'a GuestRam, chain: &[ChainElem]) -> Self {
        ChainReader {
            mem,
            elems: chain.iter().filter(|e| !e.writable).copied().collect(),
            elem: 0,
            offset: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        let mut total = 0usize;
        for (i, e) in self.elems.iter().enumerate().skip(self.elem) {
            let consumed = if i == self.elem { self.offset } else { 0 };
            total += (e.len - consumed) as usize;
        }
        total
    }

    /// Read up to `buf.len()` bytes; returns the number read.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut done = 0;
        while done < buf.len() && self.elem < self.elems.len() {
            let e = self.elems[self.elem];
            let avail = e.len - self.offset;
            if avail == 0 {
                self.elem += 1;
                self.offset = 0;
                continue;
            }
            let take = ((buf.len() - done) as u32).min(avail);
            if self
                .mem
                .read(e.gpa + u64::from(self.offset), &mut buf[done..done + take as usize])
                .is_err()
            {
                break;
            }
            done += take as usize;
            self.offset += take;
        }
        done
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> bool {
        self.read(buf) == buf.len()
    }

    pub fn read_all(&mut self) -> Vec<u8> {
        let mut out = vec![0u8; self.remaining()];
        let n = self.read(&mut out);
        out.truncate(n);
        out
    }
}

/// Sequential writer over the writable (device-write) elements of a chain.
pub struct ChainWriter<'a> {
    mem: &'a GuestRam,
    elems: Vec<ChainElem>,
    elem: usize,
    offset: u32,
    written: u32,
}

impl<'a> ChainWriter<'a> {
    pub fn new(mem: &'a GuestRam, chain: &[ChainElem]) -> Self {
        ChainWriter {
            mem,
            elems: chain.iter().filter(|e| e.writable).copied().collect(),
            elem: 0,
            offset: 0,
            written: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.elems.iter().map(|e| e.len as usize).sum()
    }

    /// Write as much of `buf` as fits; returns the number written.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let mut done = 0;
        while done < buf.len() && self.elem < self.elems.len() {
            let e = self.elems[self.elem];
            let avail = e.len - self.offset;
            if avail == 0 {
                self.elem += 1;
                self.offset = 0;
                continue;
            }
            let take = ((buf.len() - done) as u32).min(avail);
            if self
                .mem
                .write(e.gpa + u64::from(self.offset), &buf[done..done + take as usize])
                .is_err()
            {
                break;
            }
            done += take as usize;
            self.offset += take;
            self.written += take;
        }
        done
    }

    /// Total bytes written so far, for the used-ring length field.
    pub fn written(&self) -> u32 {
        self.written
    }
}

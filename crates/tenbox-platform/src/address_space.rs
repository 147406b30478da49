use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::Device;

pub type SharedDevice = Arc<Mutex<dyn Device>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceError {
    PioOverlap { base: u16, size: u16 },
    MmioOverlap { base: u64, size: u64 },
}

impl fmt::Display for AddressSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpaceError::PioOverlap { base, size } => {
                write!(f, "PIO range {base:#x}+{size:#x} overlaps an existing range")
            }
            AddressSpaceError::MmioOverlap { base, size } => {
                write!(f, "MMIO range {base:#x}+{size:#x} overlaps an existing range")
            }
        }
    }
}

impl std::error::Error for AddressSpaceError {}

struct PioEntry {
    base: u16,
    size: u16,
    device: SharedDevice,
}

struct MmioEntry {
    base: u64,
    size: u64,
    device: SharedDevice,
}

/// Registry of half-open PIO and MMIO ranges. Ranges are registered during
/// VM construction and never move; dispatch is a linear scan since a VM
/// has a few dozen devices at most.
#[derive(Default)]
pub struct AddressSpace {
    pio: Vec<PioEntry>,
    mmio: Vec<MmioEntry>,
    // Misses are logged once per distinct location.
    logged_pio_misses: Mutex<HashSet<u16>>,
    logged_mmio_misses: Mutex<HashSet<u64>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pio_device(
        &mut self,
        base: u16,
        size: u16,
        device: SharedDevice,
    ) -> Result<(), AddressSpaceError> {
        let end = u32::from(base) + u32::from(size);
        for e in &self.pio {
            let e_end = u32::from(e.base) + u32::from(e.size);
            if u32::from(base) < e_end && u32::from(e.base) < end {
                return Err(AddressSpaceError::PioOverlap { base, size });
            }
        }
        self.pio.push(PioEntry { base, size, device });
        Ok(())
    }

    pub fn add_mmio_device(
        &mut self,
        base: u64,
        size: u64,
        device: SharedDevice,
    ) -> Result<(), AddressSpaceError> {
        let end = base + size;
        for e in &self.mmio {
            if base < e.base + e.size && e.base < end {
                return Err(AddressSpaceError::MmioOverlap { base, size });
            }
        }
        self.mmio.push(MmioEntry { base, size, device });
        Ok(())
    }

    fn find_pio(&self, port: u16) -> Option<(&PioEntry, u16)> {
        self.pio
            .iter()
            .find(|e| port >= e.base && u32::from(port) < u32::from(e.base) + u32::from(e.size))
            .map(|e| (e, port - e.base))
    }

    fn find_mmio(&self, addr: u64) -> Option<(&MmioEntry, u64)> {
        self.mmio
            .iter()
            .find(|e| addr >= e.base && addr < e.base + e.size)
            .map(|e| (e, addr - e.base))
    }

    /// Guest `in` instruction. A miss reads all-ones.
    pub fn pio_read(&self, port: u16, size: u8) -> u32 {
        match self.find_pio(port) {
            Some((entry, offset)) => entry.device.lock().unwrap().pio_read(offset, size),
            None => {
                if self.logged_pio_misses.lock().unwrap().insert(port) {
                    warn!(port = format_args!("{port:#x}"), size, "PIO read miss");
                }
                0xFFFF_FFFF
            }
        }
    }

    /// Guest `out` instruction. A miss is discarded.
    pub fn pio_write(&self, port: u16, size: u8, value: u32) {
        match self.find_pio(port) {
            Some((entry, offset)) => entry.device.lock().unwrap().pio_write(offset, size, value),
            None => {
                if self.logged_pio_misses.lock().unwrap().insert(port) {
                    warn!(port = format_args!("{port:#x}"), size, value, "PIO write miss");
                }
            }
        }
    }

    /// Guest MMIO read. A miss reads all-ones in the accessed width.
    pub fn mmio_read(&self, addr: u64, size: u8) -> u64 {
        match self.find_mmio(addr) {
            Some((entry, offset)) => entry.device.lock().unwrap().mmio_read(offset, size),
            None => {
                if self.logged_mmio_misses.lock().unwrap().insert(addr) {
                    warn!(gpa = format_args!("{addr:#x}"), size, "MMIO read miss");
                }
                match size {
                    1 => 0xFF,
                    2 => 0xFFFF,
                    4 => 0xFFFF_FFFF,
                    _ => u64::MAX,
                }
            }
        }
    }

    /// Guest MMIO write. A miss is discarded.
    pub fn mmio_write(&self, addr: u64, size: u8, value: u64) {
        match self.find_mmio(addr) {
            Some((entry, offset)) => entry.device.lock().unwrap().mmio_write(offset, size, value),
            None => {
                if self.logged_mmio_misses.lock().unwrap().insert(addr) {
                    warn!(gpa = format_args!("{addr:#x}"), size, value, "MMIO write miss");
                }
            }
        }
    }
}

//! Shared device-model plumbing: the [`Device`] capability trait, the
//! [`AddressSpace`] PIO/MMIO registry, IRQ capability objects, and the
//! host-side port traits the VM hands to its embedder.

mod address_space;
mod irq;
pub mod ports;

pub use address_space::{AddressSpace, AddressSpaceError, SharedDevice};
pub use irq::{IrqLine, IrqSink};

/// Common capability set for emulated devices. Each side defaults to the
/// bus's miss behavior (reads all-ones on PIO, zero on MMIO; writes
/// discarded) so legacy stubs only implement what they care about.
pub trait Device: Send {
    fn pio_read(&mut self, _offset: u16, _size: u8) -> u32 {
        0xFFFF_FFFF
    }

    fn pio_write(&mut self, _offset: u16, _size: u8, _value: u32) {}

    fn mmio_read(&mut self, _offset: u64, _size: u8) -> u64 {
        0
    }

    fn mmio_write(&mut self, _offset: u64, _size: u8, _value: u64) {}
}

/// Absorbs accesses to harmless legacy ports (POST 0x80, DMA page 0x87,
/// secondary COM ranges) so guest probing stays off the log.
#[derive(Default)]
pub struct PortSink;

impl Device for PortSink {}

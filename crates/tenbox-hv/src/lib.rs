//! The hypervisor substrate boundary. Everything above this crate talks
//! in terms of [`Partition`] and [`Vcpu`]; the platform-specific adapter
//! (Windows Hypervisor Platform) lives in [`whp`] and is the only module
//! that touches the vendor API.

pub mod testing;
#[cfg(windows)]
pub mod whp;

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HvError {
    #[error("no hardware hypervisor is available on this host")]
    NotAvailable,
    #[error("partition setup failed: {0}")]
    PartitionSetup(String),
    #[error("guest memory mapping failed: {0}")]
    MemoryMap(String),
    #[error("vCPU operation failed: {0}")]
    Vcpu(String),
}

pub type Result<T> = std::result::Result<T, HvError>;

/// Registers the boot path and exit handling need by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    Rip,
    Rflags,
    Cr0,
    Cr3,
    Cr4,
    Efer,
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Tr,
    Ldtr,
    Gdtr,
    Idtr,
}

/// Segment descriptor as the substrate consumes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentValue {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub attributes: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableValue {
    pub base: u64,
    pub limit: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    U64(u64),
    Segment(SegmentValue),
    Table(TableValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationMode {
    Physical,
    Logical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge,
    Level,
}

/// A fixed interrupt toward the guest's local APICs, as derived from an
/// I/O APIC redirection entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptRequest {
    pub vector: u8,
    pub destination: u32,
    pub destination_mode: DestinationMode,
    pub trigger_mode: TriggerMode,
}

/// What a single `run` returned, after the substrate handled decode and
/// dispatch internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit fully handled; run again.
    Continue,
    /// Guest executed HLT; yield before running again.
    Halt,
    /// Orderly guest shutdown (triple fault treated as reboot lives here
    /// too, distinguished by the VM layer).
    Shutdown,
    /// Unrecoverable exit; tear the VM down as crashed.
    Error,
}

/// PIO/MMIO callbacks the substrate invokes while emulating an exiting
/// instruction. Implemented by the VM's address space.
pub trait IoHandler: Send + Sync {
    fn pio_read(&self, port: u16, size: u8) -> u32;
    fn pio_write(&self, port: u16, size: u8, value: u32);
    fn mmio_read(&self, gpa: u64, size: u8) -> u64;
    fn mmio_write(&self, gpa: u64, size: u8, value: u64);
}

pub trait Vcpu: Send {
    fn index(&self) -> u32;
    /// Run until the next exit and handle it. Blocks inside the substrate.
    fn run_once(&mut self) -> RunOutcome;
    fn set_registers(&mut self, regs: &[(Register, RegisterValue)]) -> Result<()>;
}

pub trait Partition: Send + Sync {
    /// Map `[gpa, gpa+len)` to host memory at `hva`, readable, writable
    /// and executable.
    fn map_memory(&self, gpa: u64, hva: *mut u8, len: u64) -> Result<()>;
    fn create_vcpu(&self, index: u32, handler: Arc<dyn IoHandler>) -> Result<Box<dyn Vcpu>>;
    fn request_interrupt(&self, request: InterruptRequest) -> Result<()>;
    /// Make a blocked `run_once` on the given vCPU return promptly.
    fn cancel_run(&self, index: u32);
}

/// Factory for the host platform's hypervisor.
pub trait Hypervisor: Send + Sync {
    fn is_present(&self) -> bool;
    fn create_partition(&self, cpu_count: u32) -> Result<Arc<dyn Partition>>;
}

/// The platform default: WHP on Windows, absent elsewhere.
pub fn host_hypervisor() -> Option<Arc<dyn Hypervisor>> {
    #[cfg(windows)]
    {
        Some(Arc::new(whp::WhpHypervisor::new()))
    }
    #[cfg(not(windows))]
    {
        None
    }
}

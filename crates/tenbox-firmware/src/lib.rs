//! Linux boot: bzImage parsing, zero-page construction, initrd placement,
//! the E820 map, ACPI table synthesis and the initial 32-bit
//! protected-mode register file for the BSP.

use tenbox_acpi::VirtioMmioSlot;
use tenbox_hv::{Register, RegisterValue, SegmentValue, TableValue};
use tenbox_memory::{align_down, GuestRam, PAGE_SIZE};
use thiserror::Error;
use tracing::info;

/// Fixed boot-time guest memory layout.
pub mod layout {
    pub const GDT_BASE: u64 = 0x1000;
    pub const BOOT_PARAMS: u64 = 0x7000;
    pub const CMDLINE_BASE: u64 = 0x10000;
    pub const CMDLINE_MAX: usize = 0x10000;
    pub const KERNEL_BASE: u64 = 0x100000;
}

// boot_params (zero page) offsets.
mod bp {
    pub const ACPI_RSDP_ADDR: usize = 0x070;
    pub const E820_ENTRIES: usize = 0x1E8;
    pub const SETUP_SECTS: usize = 0x1F1;
    pub const HEADER_MAGIC: usize = 0x202;
    pub const VERSION: usize = 0x206;
    pub const TYPE_OF_LOADER: usize = 0x210;
    pub const LOADFLAGS: usize = 0x211;
    pub const RAMDISK_IMAGE: usize = 0x218;
    pub const RAMDISK_SIZE: usize = 0x21C;
    pub const CMD_LINE_PTR: usize = 0x228;
    pub const SETUP_HEADER_END: usize = 0x290;
    pub const E820_TABLE: usize = 0x2D0;
}

const E820_RAM: u32 = 1;
const LOADED_HIGH: u8 = 0x01;
const MIN_BOOT_PROTOCOL: u16 = 0x0206;

#[derive(Debug, Error)]
pub enum BootError {
    #[error("kernel image too small ({0} bytes)")]
    KernelTooSmall(usize),
    #[error("not a bzImage: missing HdrS signature")]
    BadSignature,
    #[error("boot protocol {0:#06x} too old (need >= 2.06)")]
    ProtocolTooOld(u16),
    #[error("kernel does not fit in guest RAM")]
    KernelTooLarge,
    #[error("not enough RAM below the MMIO hole for the initrd")]
    InitrdDoesNotFit,
    #[error("guest memory: {0}")]
    Memory(#[from] tenbox_memory::GuestMemoryError),
}

pub struct BootConfig<'a> {
    pub kernel: &'a [u8],
    pub initrd: Option<&'a [u8]>,
    pub cmdline: &'a str,
    pub cpu_count: u32,
    pub virtio_slots: &'a [VirtioMmioSlot],
}

pub struct LoadedKernel {
    pub kernel_size: u64,
    pub rsdp_addr: u64,
}

/// Load a bzImage and prepare the zero page. The caller then applies
/// [`initial_boot_registers`] to the BSP.
pub fn load_linux(ram: &GuestRam, config: &BootConfig) -> Result<LoadedKernel, BootError> {
    let kernel = config.kernel;
    if kernel.len() < 1024 {
        return Err(BootError::KernelTooSmall(kernel.len()));
    }
    if &kernel[bp::HEADER_MAGIC..bp::HEADER_MAGIC + 4] != b"HdrS" {
        return Err(BootError::BadSignature);
    }
    let version = u16::from_le_bytes(kernel[bp::VERSION..bp::VERSION + 2].try_into().unwrap());
    info!(
        version = format_args!("{}.{:02}", version >> 8, version & 0xFF),
        "Linux boot protocol"
    );
    if version < MIN_BOOT_PROTOCOL {
        return Err(BootError::ProtocolTooOld(version));
    }

    let mut setup_sects = kernel[bp::SETUP_SECTS];
    if setup_sects == 0 {
        setup_sects = 4;
    }
    let setup_size = (usize::from(setup_sects) + 1) * 512;
    if kernel.len() < setup_size {
        return Err(BootError::KernelTooSmall(kernel.len()));
    }
    let image = &kernel[setup_size..];
    let kernel_size = image.len() as u64;

    if layout::KERNEL_BASE + kernel_size > ram.low_size() {
        return Err(BootError::KernelTooLarge);
    }
    ram.write(layout::KERNEL_BASE, image)?;
    info!(
        gpa = format_args!("{:#x}", layout::KERNEL_BASE),
        size = kernel_size,
        "kernel loaded"
    );

    // Zero page: start clean, copy the setup header out of the image.
    let mut zero_page = vec![0u8; 4096];
    let header_end = setup_size.min(bp::SETUP_HEADER_END);
    if header_end > bp::SETUP_SECTS {
        zero_page[bp::SETUP_SECTS..header_end].copy_from_slice(&kernel[bp::SETUP_SECTS..header_end]);
    }
    zero_page[bp::TYPE_OF_LOADER] = 0xFF;
    zero_page[bp::LOADFLAGS] |= LOADED_HIGH;

    if !config.cmdline.is_empty() {
        let bytes = config.cmdline.as_bytes();
        let len = bytes.len().min(layout::CMDLINE_MAX - 1);
        ram.write(layout::CMDLINE_BASE, &bytes[..len])?;
        ram.write_u8(layout::CMDLINE_BASE + len as u64, 0)?;
        zero_page[bp::CMD_LINE_PTR..bp::CMD_LINE_PTR + 4]
            .copy_from_slice(&(layout::CMDLINE_BASE as u32).to_le_bytes());
    }

    // Initrd goes as high as possible while staying page-aligned, below
    // the MMIO hole, and addressable through the 32-bit ramdisk field.
    if let Some(initrd) = config.initrd {
        let top = ram.low_size();
        let addr = align_down(top.saturating_sub(initrd.len() as u64), PAGE_SIZE);
        if addr <= layout::KERNEL_BASE + kernel_size {
            return Err(BootError::InitrdDoesNotFit);
        }
        ram.write(addr, initrd)?;
        zero_page[bp::RAMDISK_IMAGE..bp::RAMDISK_IMAGE + 4]
            .copy_from_slice(&(addr as u32).to_le_bytes());
        zero_page[bp::RAMDISK_SIZE..bp::RAMDISK_SIZE + 4]
            .copy_from_slice(&(initrd.len() as u32).to_le_bytes());
        info!(gpa = format_args!("{addr:#x}"), size = initrd.len(), "initrd loaded");
    }

    // E820: conventional memory, low RAM above 1 MiB, optional high RAM.
    let mut entries: Vec<(u64, u64)> = vec![(0, 0xA0000), (0x100000, ram.low_size() - 0x100000)];
    if ram.high_size() > 0 {
        entries.push((tenbox_memory::MMIO_HOLE_END, ram.high_size()));
    }
    for (i, (addr, size)) in entries.iter().enumerate() {
        let off = bp::E820_TABLE + i * 20;
        zero_page[off..off + 8].copy_from_slice(&addr.to_le_bytes());
        zero_page[off + 8..off + 16].copy_from_slice(&size.to_le_bytes());
        zero_page[off + 16..off + 20].copy_from_slice(&E820_RAM.to_le_bytes());
    }
    zero_page[bp::E820_ENTRIES] = entries.len() as u8;

    let rsdp_addr = tenbox_acpi::build_tables(ram, config.cpu_count, config.virtio_slots)?;
    zero_page[bp::ACPI_RSDP_ADDR..bp::ACPI_RSDP_ADDR + 8]
        .copy_from_slice(&rsdp_addr.to_le_bytes());

    ram.write(layout::BOOT_PARAMS, &zero_page)?;

    Ok(LoadedKernel { kernel_size, rsdp_addr })
}

/// Write the boot GDT into guest RAM and return the BSP's initial register
/// file: 32-bit protected mode, flat code/data, RIP at the kernel entry,
/// RSI pointing at the zero page.
pub fn initial_boot_registers(
    ram: &GuestRam,
) -> Result<Vec<(Register, RegisterValue)>, BootError> {
    // Selectors: 0x00 null, 0x08 unused, 0x10 code32, 0x18 data32.
    let gdt: [u64; 4] = [0, 0, 0x00CF_9B00_0000_FFFF, 0x00CF_9300_0000_FFFF];
    for (i, entry) in gdt.iter().enumerate() {
        ram.write_u64_le(layout::GDT_BASE + i as u64 * 8, *entry)?;
    }

    let code = SegmentValue { base: 0, limit: 0xFFFF_FFFF, selector: 0x10, attributes: 0xC09B };
    let data = SegmentValue { base: 0, limit: 0xFFFF_FFFF, selector: 0x18, attributes: 0xC093 };
    let null = SegmentValue::default();

    let mut regs = vec![
        (
            Register::Gdtr,
            RegisterValue::Table(TableValue { base: layout::GDT_BASE, limit: 8 * 4 - 1 }),
        ),
        (Register::Idtr, RegisterValue::Table(TableValue::default())),
        (Register::Cs, RegisterValue::Segment(code)),
        (Register::Ds, RegisterValue::Segment(data)),
        (Register::Es, RegisterValue::Segment(data)),
        (Register::Ss, RegisterValue::Segment(data)),
        (Register::Fs, RegisterValue::Segment(null)),
        (Register::Gs, RegisterValue::Segment(null)),
        (
            Register::Tr,
            RegisterValue::Segment(SegmentValue { attributes: 0x008B, ..null }),
        ),
        (
            Register::Ldtr,
            RegisterValue::Segment(SegmentValue { attributes: 0x0082, ..null }),
        ),
        (Register::Rip, RegisterValue::U64(layout::KERNEL_BASE)),
        (Register::Rsi, RegisterValue::U64(layout::BOOT_PARAMS)),
        (Register::Rflags, RegisterValue::U64(0x2)),
        // PE | ET
        (Register::Cr0, RegisterValue::U64(0x11)),
    ];
    for gpr in [
        Register::Rax,
        Register::Rbx,
        Register::Rcx,
        Register::Rdx,
        Register::Rdi,
        Register::Rbp,
        Register::Rsp,
    ] {
        regs.push((gpr, RegisterValue::U64(0)));
    }
    Ok(regs)
}

//! ACPI tables synthesized at boot: RSDP, XSDT, MADT, FADT and a DSDT
//! whose `\_SB` scope carries one `LNRO0005` device node per virtio-mmio
//! window so the kernel's virtio_mmio driver probes them. Tables are pure
//! byte vectors; [`build_tables`] places them at the fixed layout.

use tenbox_memory::GuestRam;

/// Fixed guest-physical placement of the tables.
pub mod layout {
    pub const RSDP: u64 = 0x4000;
    pub const XSDT: u64 = 0x4100;
    pub const MADT: u64 = 0x4200;
    pub const FADT: u64 = 0x4300;
    // FADT rev 5 is 268 bytes and ends at 0x440C; the DSDT at 0x4500 is
    // clear of it.
    pub const DSDT: u64 = 0x4500;
}

pub const SCI_IRQ: u16 = 9;
pub const LOCAL_APIC_ADDRESS: u32 = 0xFEE0_0000;
pub const IO_APIC_ADDRESS: u32 = 0xFEC0_0000;
pub const PM1A_EVT_PORT: u16 = 0x600;
pub const PM1A_CNT_PORT: u16 = 0x604;
/// SLP_TYP value of `\_S5`; must match the PM1 control handler.
pub const SLP_TYP_S5: u8 = 5;

pub const HEADER_SIZE: usize = 36;
pub const MADT_LOCAL_APIC_SIZE: usize = 8;
pub const MADT_IO_APIC_SIZE: usize = 12;
pub const MADT_INT_OVERRIDE_SIZE: usize = 10;
const FADT_SIZE: usize = 268;
const RSDP_SIZE: usize = 36;

const OEM_ID: &[u8; 6] = b"TENBOX";
const OEM_TABLE_ID: &[u8; 8] = b"TENBOX  ";
const CREATOR_ID: &[u8; 4] = b"TNBX";

/// One virtio-mmio window to expose through the DSDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioMmioSlot {
    pub base: u64,
    pub size: u32,
    pub irq: u32,
}

/// Two's-complement byte checksum: the sum of a table including this value
/// is zero.
pub fn checksum(data: &[u8]) -> u8 {
    let sum: u8 = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    sum.wrapping_neg()
}

fn fill_header(table: &mut [u8], signature: &[u8; 4], revision: u8) {
    table[0..4].copy_from_slice(signature);
    let len = table.len() as u32;
    table[4..8].copy_from_slice(&len.to_le_bytes());
    table[8] = revision;
    table[10..16].copy_from_slice(OEM_ID);
    table[16..24].copy_from_slice(OEM_TABLE_ID);
    table[24..28].copy_from_slice(&1u32.to_le_bytes());
    table[28..32].copy_from_slice(CREATOR_ID);
    table[32..36].copy_from_slice(&1u32.to_le_bytes());
}

fn seal(table: &mut [u8]) {
    table[9] = 0;
    table[9] = checksum(table);
}

pub fn build_rsdp(xsdt_address: u64) -> Vec<u8> {
    let mut rsdp = vec![0u8; RSDP_SIZE];
    rsdp[0..8].copy_from_slice(b"RSD PTR ");
    rsdp[9..15].copy_from_slice(OEM_ID);
    rsdp[15] = 2; // revision
    // rsdt_address stays zero; everything goes through the XSDT.
    rsdp[20..24].copy_from_slice(&(RSDP_SIZE as u32).to_le_bytes());
    rsdp[24..32].copy_from_slice(&xsdt_address.to_le_bytes());

    rsdp[8] = checksum(&rsdp[..20]);
    rsdp[32] = checksum(&rsdp);
    rsdp
}

pub fn build_xsdt(entries: &[u64]) -> Vec<u8> {
    let mut xsdt = vec![0u8; HEADER_SIZE + entries.len() * 8];
    for (i, entry) in entries.iter().enumerate() {
        xsdt[HEADER_SIZE + i * 8..HEADER_SIZE + i * 8 + 8].copy_from_slice(&entry.to_le_bytes());
    }
    fill_header(&mut xsdt, b"XSDT", 1);
    seal(&mut xsdt);
    xsdt
}

pub fn build_madt(num_cpus: u32) -> Vec<u8> {
    let body_len = 8
        + num_cpus as usize * MADT_LOCAL_APIC_SIZE
        + MADT_IO_APIC_SIZE
        + MADT_INT_OVERRIDE_SIZE;
    let mut madt = vec![0u8; HEADER_SIZE + body_len];

    let mut p = HEADER_SIZE;
    madt[p..p + 4].copy_from_slice(&LOCAL_APIC_ADDRESS.to_le_bytes());
    madt[p + 4..p + 8].copy_from_slice(&1u32.to_le_bytes()); // PCAT_COMPAT
    p += 8;

    for cpu in 0..num_cpus {
        madt[p] = 0; // Processor Local APIC
        madt[p + 1] = MADT_LOCAL_APIC_SIZE as u8;
        madt[p + 2] = cpu as u8; // ACPI processor id
        madt[p + 3] = cpu as u8; // APIC id
        madt[p + 4..p + 8].copy_from_slice(&1u32.to_le_bytes()); // enabled
        p += MADT_LOCAL_APIC_SIZE;
    }

    madt[p] = 1; // I/O APIC
    madt[p + 1] = MADT_IO_APIC_SIZE as u8;
    madt[p + 2] = num_cpus as u8; // I/O APIC id after the CPUs
    madt[p + 4..p + 8].copy_from_slice(&IO_APIC_ADDRESS.to_le_bytes());
    // GSI base 0
    p += MADT_IO_APIC_SIZE;

    // SCI override: active-low, level-triggered.
    madt[p] = 2;
    madt[p + 1] = MADT_INT_OVERRIDE_SIZE as u8;
    madt[p + 2] = 0; // ISA
    madt[p + 3] = SCI_IRQ as u8;
    madt[p + 4..p + 8].copy_from_slice(&u32::from(SCI_IRQ).to_le_bytes());
    madt[p + 8..p + 10].copy_from_slice(&0x000Fu16.to_le_bytes());

    fill_header(&mut madt, b"APIC", 3);
    seal(&mut madt);
    madt
}

pub fn build_fadt(dsdt_address: u64) -> Vec<u8> {
    let mut fadt = vec![0u8; FADT_SIZE];

    // Legacy 32-bit DSDT pointer.
    fadt[40..44].copy_from_slice(&(dsdt_address as u32).to_le_bytes());
    fadt[46..48].copy_from_slice(&SCI_IRQ.to_le_bytes());
    // SMI_CMD stays 0: ACPI is already in hardware mode, the kernel skips
    // the SMM enable dance.
    fadt[56..60].copy_from_slice(&u32::from(PM1A_EVT_PORT).to_le_bytes());
    fadt[64..68].copy_from_slice(&u32::from(PM1A_CNT_PORT).to_le_bytes());
    fadt[88] = 4; // PM1_EVT_LEN
    fadt[89] = 2; // PM1_CNT_LEN
    fadt[131] = 1; // FADT minor version
    fadt[140..148].copy_from_slice(&dsdt_address.to_le_bytes()); // X_DSDT

    // X_PM1a_EVT_BLK generic address: system I/O, 32 bits, dword access.
    fadt[148] = 1;
    fadt[149] = 32;
    fadt[151] = 3;
    fadt[152..160].copy_from_slice(&u64::from(PM1A_EVT_PORT).to_le_bytes());

    // X_PM1a_CNT_BLK: system I/O, 16 bits, word access.
    fadt[172] = 1;
    fadt[173] = 16;
    fadt[175] = 2;
    fadt[176..184].copy_from_slice(&u64::from(PM1A_CNT_PORT).to_le_bytes());

    fill_header(&mut fadt, b"FACP", 5);
    seal(&mut fadt);
    fadt
}

// AML sizes for one virtio-mmio device node:
//   _HID(15) + _UID(7) + _CRS(32) = 54 byte body
//   ExtOp(1) + DeviceOp(1) + PkgLen(1) + NameSeg(4) + body = 61 per entry
const DEV_BODY: usize = 54;
const DEV_ENTRY: usize = 61;
const S5_SIZE: usize = 16;

pub fn build_dsdt(slots: &[VirtioMmioSlot]) -> Vec<u8> {
    let scope_body = slots.len() * DEV_ENTRY;
    let scope_namelen = 5; // \_SB_
    let scope_remaining = scope_namelen + scope_body;
    let scope_pkglen_size = if scope_remaining + 1 <= 63 { 1 } else { 2 };
    let scope_pkglen = scope_pkglen_size + scope_remaining;
    let scope_total = 1 + scope_pkglen_size + scope_remaining;
    let total = HEADER_SIZE + S5_SIZE + scope_total;

    let mut dsdt = Vec::with_capacity(total);
    dsdt.resize(HEADER_SIZE, 0);

    // Name(\_S5_, Package(4) { 5, 5, 0, 0 })
    dsdt.push(0x08); // NameOp
    dsdt.extend_from_slice(b"_S5_");
    dsdt.push(0x12); // PackageOp
    dsdt.push(0x0A); // PkgLen
    dsdt.push(0x04); // NumElements
    for value in [SLP_TYP_S5, SLP_TYP_S5, 0, 0] {
        dsdt.push(0x0A); // BytePrefix
        dsdt.push(value);
    }

    // Scope(\_SB_)
    dsdt.push(0x10); // ScopeOp
    if scope_pkglen_size == 1 {
        dsdt.push(scope_pkglen as u8);
    } else {
        dsdt.push(((scope_pkglen & 0x0F) as u8) | 0x40);
        dsdt.push((scope_pkglen >> 4) as u8);
    }
    dsdt.push(0x5C); // RootChar
    dsdt.extend_from_slice(b"_SB_");

    for (i, slot) in slots.iter().enumerate() {
        dsdt.push(0x5B); // ExtOpPrefix
        dsdt.push(0x82); // DeviceOp
        dsdt.push((1 + 4 + DEV_BODY) as u8); // PkgLen
        dsdt.push(b'V');
        dsdt.push(b'R');
        dsdt.push(b"0123456789ABCDEF"[i / 16]);
        dsdt.push(b"0123456789ABCDEF"[i % 16]);

        // Name(_HID, "LNRO0005")
        dsdt.push(0x08);
        dsdt.extend_from_slice(b"_HID");
        dsdt.push(0x0D); // StringPrefix
        dsdt.extend_from_slice(b"LNRO0005");
        dsdt.push(0x00);

        // Name(_UID, i)
        dsdt.push(0x08);
        dsdt.extend_from_slice(b"_UID");
        dsdt.push(0x0A);
        dsdt.push(i as u8);

        // Name(_CRS, Buffer(23) { Memory32Fixed + ExtendedInterrupt + End })
        dsdt.push(0x08);
        dsdt.extend_from_slice(b"_CRS");
        dsdt.push(0x11); // BufferOp
        dsdt.push(0x1A); // PkgLen = 26
        dsdt.push(0x0A);
        dsdt.push(0x17); // buffer size 23

        // Memory32Fixed(ReadWrite, base, size)
        dsdt.push(0x86);
        dsdt.push(0x09);
        dsdt.push(0x00);
        dsdt.push(0x01); // read-write
        dsdt.extend_from_slice(&(slot.base as u32).to_le_bytes());
        dsdt.extend_from_slice(&slot.size.to_le_bytes());

        // Interrupt(ResourceConsumer, Level, ActiveHigh, Exclusive) { irq }
        dsdt.push(0x89);
        dsdt.push(0x06);
        dsdt.push(0x00);
        dsdt.push(0x01);
        dsdt.push(0x01); // one interrupt
        dsdt.extend_from_slice(&slot.irq.to_le_bytes());

        // End tag
        dsdt.push(0x79);
        dsdt.push(0x00);
    }

    debug_assert_eq!(dsdt.len(), total);
    fill_header(&mut dsdt, b"DSDT", 2);
    seal(&mut dsdt);
    dsdt
}

/// Build every table and write it at the fixed layout. Returns the RSDP
/// GPA for `boot_params.acpi_rsdp_addr`.
pub fn build_tables(
    ram: &GuestRam,
    num_cpus: u32,
    slots: &[VirtioMmioSlot],
) -> Result<u64, tenbox_memory::GuestMemoryError> {
    let madt = build_madt(num_cpus);
    let dsdt = build_dsdt(slots);
    let fadt = build_fadt(layout::DSDT);
    // The FADT must be the XSDT's first entry.
    let xsdt = build_xsdt(&[layout::FADT, layout::MADT]);
    let rsdp = build_rsdp(layout::XSDT);

    ram.write(layout::MADT, &madt)?;
    ram.write(layout::DSDT, &dsdt)?;
    ram.write(layout::FADT, &fadt)?;
    ram.write(layout::XSDT, &xsdt)?;
    ram.write(layout::RSDP, &rsdp)?;
    Ok(layout::RSDP)
}

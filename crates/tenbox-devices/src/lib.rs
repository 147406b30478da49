//! Legacy PC chipset devices: UART, PIT, RTC, ACPI PM1, I/O APIC and the
//! assorted stubs a Linux guest pokes during bring-up.

mod acpi_pm;
mod ioapic;
mod pit;
mod rtc;
mod stubs;
mod uart;

pub use acpi_pm::AcpiPm;
pub use ioapic::IoApic;
pub use pit::{Pit8254, SystemControlB, TscClock};
pub use rtc::CmosRtc;
pub use stubs::{I8259Pic, PciHostBridge};
pub use uart::Uart16550;

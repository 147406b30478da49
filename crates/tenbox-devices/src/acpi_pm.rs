use tenbox_platform::{Device, IrqLine};
use tracing::info;

const PWRBTN_BIT: u16 = 1 << 8;
const SLP_EN_BIT: u32 = 1 << 13;

pub type ShutdownCallback = Box<dyn Fn() + Send>;

/// ACPI PM1a event block (status + enable, 4 bytes at 0x600) and control
/// block (2 bytes at 0x604). SLP_TYP 5 with SLP_EN is an S5 power-off.
pub struct AcpiPm {
    pm1_sts: u16,
    pm1_en: u16,
    pm1_cnt: u16,
    shutdown: Option<ShutdownCallback>,
    sci: Option<IrqLine>,
}

impl AcpiPm {
    pub const BASE_PORT: u16 = 0x600;
    pub const REG_COUNT: u16 = 6;
    pub const EVT_PORT: u16 = 0x600;
    pub const CNT_PORT: u16 = 0x604;
    /// Must match the `\_S5` package emitted into the DSDT.
    pub const SLP_TYP_S5: u32 = 5;

    pub fn new() -> Self {
        AcpiPm {
            pm1_sts: 0,
            pm1_en: 0,
            // SCI_EN is always set: SMI_CMD=0 in the FADT means ACPI is
            // already in hardware mode.
            pm1_cnt: 1,
            shutdown: None,
            sci: None,
        }
    }

    pub fn set_shutdown_callback(&mut self, cb: ShutdownCallback) {
        self.shutdown = Some(cb);
    }

    pub fn set_sci_line(&mut self, line: IrqLine) {
        self.sci = Some(line);
    }

    /// Host-initiated power button press. Forces PWRBTN_EN so the guest's
    /// SCI handler sees `status & enable` non-zero even before it armed
    /// the button itself.
    pub fn trigger_power_button(&mut self) {
        self.pm1_sts |= PWRBTN_BIT;
        self.pm1_en |= PWRBTN_BIT;
        if let Some(sci) = &self.sci {
            sci.raise();
        }
    }

    fn raise_sci_if_pending(&self) {
        if self.pm1_sts & self.pm1_en != 0 {
            if let Some(sci) = &self.sci {
                sci.raise();
            }
        }
    }
}

impl Default for AcpiPm {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for AcpiPm {
    fn pio_read(&mut self, offset: u16, size: u8) -> u32 {
        match offset {
            0 => {
                if size == 4 {
                    u32::from(self.pm1_sts) | (u32::from(self.pm1_en) << 16)
                } else {
                    u32::from(self.pm1_sts)
                }
            }
            2 => u32::from(self.pm1_en),
            4 => u32::from(self.pm1_cnt),
            _ => 0,
        }
    }

    fn pio_write(&mut self, offset: u16, size: u8, value: u32) {
        match offset {
            0 => {
                // Status bits are write-one-to-clear.
                self.pm1_sts &= !(value as u16);
                if size == 4 {
                    self.pm1_en = (value >> 16) as u16;
                    self.raise_sci_if_pending();
                }
            }
            2 => {
                self.pm1_en = value as u16;
                self.raise_sci_if_pending();
            }
            4 => {
                self.pm1_cnt = (value as u16) | 1;
                if value & SLP_EN_BIT != 0 {
                    let slp_typ = (value >> 10) & 7;
                    info!(slp_typ, "ACPI sleep requested");
                    if slp_typ == Self::SLP_TYP_S5 {
                        if let Some(shutdown) = &self.shutdown {
                            shutdown();
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

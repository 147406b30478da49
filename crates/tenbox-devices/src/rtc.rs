use chrono::{Datelike, Local, Timelike};
use tenbox_platform::Device;

const REG_SECONDS: u8 = 0x00;
const REG_MINUTES: u8 = 0x02;
const REG_HOURS: u8 = 0x04;
const REG_DAY_OF_WEEK: u8 = 0x06;
const REG_DAY_OF_MONTH: u8 = 0x07;
const REG_MONTH: u8 = 0x08;
const REG_YEAR: u8 = 0x09;
const REG_STATUS_A: u8 = 0x0A;
const REG_STATUS_B: u8 = 0x0B;
const REG_STATUS_C: u8 = 0x0C;
const REG_STATUS_D: u8 = 0x0D;
const REG_CENTURY: u8 = 0x32;

/// MC146818 CMOS/RTC. Time registers read the host wall clock in BCD;
/// writes to the data port are ignored.
#[derive(Default)]
pub struct CmosRtc {
    index: u8,
}

impl CmosRtc {
    pub const BASE_PORT: u16 = 0x70;
    pub const REG_COUNT: u16 = 2;

    pub fn new() -> Self {
        Self::default()
    }

    fn to_bcd(val: u32) -> u8 {
        (((val / 10) << 4) | (val % 10)) as u8
    }

    fn read_register(&self, reg: u8) -> u8 {
        let now = Local::now();
        match reg {
            REG_SECONDS => Self::to_bcd(now.second()),
            REG_MINUTES => Self::to_bcd(now.minute()),
            REG_HOURS => Self::to_bcd(now.hour()),
            REG_DAY_OF_WEEK => Self::to_bcd(now.weekday().number_from_sunday()),
            REG_DAY_OF_MONTH => Self::to_bcd(now.day()),
            REG_MONTH => Self::to_bcd(now.month()),
            REG_YEAR => Self::to_bcd(now.year() as u32 % 100),
            REG_CENTURY => Self::to_bcd(now.year() as u32 / 100),
            // UIP clear, divider 32.768 kHz, rate 1024 Hz.
            REG_STATUS_A => 0x26,
            // 24-hour mode, BCD.
            REG_STATUS_B => 0x02,
            REG_STATUS_C => 0x00,
            // Valid RAM and time.
            REG_STATUS_D => 0x80,
            _ => 0x00,
        }
    }
}

impl Device for CmosRtc {
    fn pio_read(&mut self, offset: u16, _size: u8) -> u32 {
        if offset == 0 {
            u32::from(self.index)
        } else {
            u32::from(self.read_register(self.index))
        }
    }

    fn pio_write(&mut self, offset: u16, _size: u8, value: u32) {
        if offset == 0 {
            // Top bit is the NMI gate, not part of the register index.
            self.index = (value as u8) & 0x7F;
        }
    }
}

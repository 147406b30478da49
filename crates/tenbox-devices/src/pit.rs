use std::time::Instant;

use tenbox_platform::Device;
use tracing::info;

const PIT_FREQUENCY_HZ: f64 = 1_193_182.0;

/// Monotonic tick source for the PIT. On x86-64 hosts this is the real
/// TSC, so the PIT stays in lockstep with the guest-visible TSC; elsewhere
/// it falls back to a nanosecond clock.
#[derive(Clone, Copy)]
pub struct TscClock {
    freq_hz: u64,
}

impl TscClock {
    pub fn measure() -> Self {
        let freq_hz = Self::freq_from_cpuid().unwrap_or_else(Self::calibrate);
        info!(freq_hz, "PIT tick source frequency");
        TscClock { freq_hz }
    }

    #[cfg(target_arch = "x86_64")]
    fn freq_from_cpuid() -> Option<u64> {
        // CPUID 0x15: TSC / core crystal clock ratio.
        let leaf = unsafe { std::arch::x86_64::__cpuid(0x15) };
        let (denom, numer, crystal) = (leaf.eax, leaf.ebx, leaf.ecx);
        if denom != 0 && numer != 0 && crystal != 0 {
            Some(u64::from(crystal) * u64::from(numer) / u64::from(denom))
        } else {
            None
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn freq_from_cpuid() -> Option<u64> {
        None
    }

    #[cfg(target_arch = "x86_64")]
    fn calibrate() -> u64 {
        let wall_start = Instant::now();
        let tsc_start = unsafe { std::arch::x86_64::_rdtsc() };
        std::thread::sleep(std::time::Duration::from_millis(50));
        let tsc_end = unsafe { std::arch::x86_64::_rdtsc() };
        let elapsed = wall_start.elapsed().as_secs_f64();
        ((tsc_end - tsc_start) as f64 / elapsed) as u64
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn calibrate() -> u64 {
        1_000_000_000
    }

    #[cfg(target_arch = "x86_64")]
    pub fn now(&self) -> u64 {
        unsafe { std::arch::x86_64::_rdtsc() }
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn now(&self) -> u64 {
        use std::sync::OnceLock;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_nanos() as u64
    }

    pub fn freq_hz(&self) -> u64 {
        self.freq_hz
    }

    #[cfg(test)]
    fn with_freq(freq_hz: u64) -> Self {
        TscClock { freq_hz }
    }
}

#[derive(Default, Clone, Copy)]
struct Channel {
    reload: u16,
    mode: u8,
    access: u8, // 1 = lo, 2 = hi, 3 = lo-then-hi
    latch_pending: bool,
    latched_value: u16,
    write_lo_next: bool,
    read_lo_next: bool,
    armed: bool,
    start_tick: u64,
}

/// i8254 PIT. The current count is derived from the elapsed host ticks
/// scaled to the 1.193182 MHz PIT clock, so Linux's boot-time calibration
/// loops observe a counter consistent with the TSC.
pub struct Pit8254 {
    clock: TscClock,
    channels: [Channel; 3],
}

impl Pit8254 {
    pub const BASE_PORT: u16 = 0x40;
    pub const REG_COUNT: u16 = 4;

    pub fn new(clock: TscClock) -> Self {
        Pit8254 {
            clock,
            channels: [Channel::default(); 3],
        }
    }

    fn elapsed_pit_ticks(&self, ch: usize) -> u64 {
        let c = &self.channels[ch];
        if !c.armed {
            return 0;
        }
        let elapsed = self.clock.now().wrapping_sub(c.start_tick);
        (elapsed as f64 * PIT_FREQUENCY_HZ / self.clock.freq_hz() as f64) as u64
    }

    fn current_count(&self, ch: usize) -> u16 {
        let c = &self.channels[ch];
        let reload = if c.reload == 0 { 65536u64 } else { u64::from(c.reload) };
        let ticks = self.elapsed_pit_ticks(ch);

        if c.mode == 0 {
            if ticks >= reload {
                return 0;
            }
            return (reload - ticks) as u16;
        }

        (reload - (ticks % reload)) as u16
    }

    fn output_high(&self, ch: usize) -> bool {
        let c = &self.channels[ch];
        let reload = if c.reload == 0 { 65536u64 } else { u64::from(c.reload) };
        let ticks = self.elapsed_pit_ticks(ch);

        match c.mode {
            0 => c.armed && ticks >= reload,
            2 => ticks % reload != reload - 1,
            3 => ticks % reload < reload / 2,
            _ => true,
        }
    }

    pub fn is_channel2_output_high(&self) -> bool {
        self.output_high(2)
    }
}

impl Device for Pit8254 {
    fn pio_read(&mut self, offset: u16, _size: u8) -> u32 {
        if offset >= 3 {
            return 0xFF;
        }

        let ch_idx = usize::from(offset);
        let count = if self.channels[ch_idx].latch_pending {
            self.channels[ch_idx].latched_value
        } else {
            self.current_count(ch_idx)
        };

        let ch = &mut self.channels[ch_idx];
        match ch.access {
            1 => {
                ch.latch_pending = false;
                u32::from(count & 0xFF)
            }
            2 => {
                ch.latch_pending = false;
                u32::from(count >> 8)
            }
            _ => {
                if ch.read_lo_next {
                    ch.read_lo_next = false;
                    u32::from(count & 0xFF)
                } else {
                    ch.read_lo_next = true;
                    ch.latch_pending = false;
                    u32::from(count >> 8)
                }
            }
        }
    }

    fn pio_write(&mut self, offset: u16, _size: u8, value: u32) {
        let val = value as u8;

        if offset == 3 {
            // Command register.
            let ch_num = usize::from((val >> 6) & 0x03);
            if ch_num == 3 {
                return; // read-back, unimplemented
            }
            let access = (val >> 4) & 0x03;
            if access == 0 {
                let latched = self.current_count(ch_num);
                let ch = &mut self.channels[ch_num];
                ch.latch_pending = true;
                ch.latched_value = latched;
                return;
            }
            let ch = &mut self.channels[ch_num];
            ch.access = access;
            ch.mode = (val >> 1) & 0x07;
            ch.armed = false;
            ch.write_lo_next = true;
            ch.read_lo_next = true;
            return;
        }

        if offset >= 3 {
            return;
        }

        let now = self.clock.now();
        let ch = &mut self.channels[usize::from(offset)];
        match ch.access {
            1 => {
                ch.reload = (ch.reload & 0xFF00) | u16::from(val);
                ch.armed = true;
                ch.start_tick = now;
            }
            2 => {
                ch.reload = (ch.reload & 0x00FF) | (u16::from(val) << 8);
                ch.armed = true;
                ch.start_tick = now;
            }
            _ => {
                if ch.write_lo_next {
                    ch.reload = (ch.reload & 0xFF00) | u16::from(val);
                    ch.write_lo_next = false;
                } else {
                    ch.reload = (ch.reload & 0x00FF) | (u16::from(val) << 8);
                    ch.write_lo_next = true;
                    ch.armed = true;
                    ch.start_tick = now;
                }
            }
        }
    }
}

/// System control port B (0x61). Bit 5 mirrors PIT channel 2's output,
/// which Linux uses for PIT-based delay calibration.
pub struct SystemControlB {
    value: u8,
    pit: std::sync::Arc<std::sync::Mutex<Pit8254>>,
}

impl SystemControlB {
    pub const PORT: u16 = 0x61;
    pub const REG_COUNT: u16 = 1;

    pub fn new(pit: std::sync::Arc<std::sync::Mutex<Pit8254>>) -> Self {
        SystemControlB { value: 0, pit }
    }
}

impl Device for SystemControlB {
    fn pio_read(&mut self, _offset: u16, _size: u8) -> u32 {
        let mut out = self.value;
        if self.pit.lock().unwrap().is_channel2_output_high() {
            out |= 0x20;
        } else {
            out &= !0x20;
        }
        u32::from(out)
    }

    fn pio_write(&mut self, _offset: u16, _size: u8, value: u32) {
        self.value = value as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pit() -> Pit8254 {
        // 1 GHz fake frequency keeps the arithmetic exact in tests.
        Pit8254::new(TscClock::with_freq(1_000_000_000))
    }

    #[test]
    fn latch_command_freezes_count_until_read() {
        let mut pit = pit();
        // Channel 0, access lo/hi, mode 2.
        pit.pio_write(3, 1, 0b0011_0100);
        pit.pio_write(0, 1, 0x34);
        pit.pio_write(0, 1, 0x12);

        // Latch (access bits 00).
        pit.pio_write(3, 1, 0b0000_0000);
        let lo = pit.pio_read(0, 1) as u16;
        let hi = pit.pio_read(0, 1) as u16;
        let latched = (hi << 8) | lo;
        assert!(latched <= 0x1234);
        assert!(latched > 0x1200, "latched count should be near the reload");
    }

    #[test]
    fn lo_hi_write_order_arms_on_high_byte() {
        let mut pit = pit();
        pit.pio_write(3, 1, 0b0011_0110); // ch0, lo/hi, mode 3
        pit.pio_write(0, 1, 0xFF);
        assert!(!pit.channels[0].armed);
        pit.pio_write(0, 1, 0xFF);
        assert!(pit.channels[0].armed);
        assert_eq!(pit.channels[0].reload, 0xFFFF);
    }

    #[test]
    fn command_for_channel_two_selects_channel_two() {
        let mut pit = pit();
        pit.pio_write(3, 1, 0b1011_0110); // ch2, lo/hi, mode 3
        pit.pio_write(2, 1, 0x00);
        pit.pio_write(2, 1, 0x10);
        assert!(pit.channels[2].armed);
        assert_eq!(pit.channels[2].mode, 3);
    }

    #[test]
    fn mode0_counts_down_to_zero() {
        let mut pit = pit();
        pit.pio_write(3, 1, 0b0001_0000); // ch0, lo only, mode 0
        pit.pio_write(0, 1, 2);
        // With a 1 GHz tick source, two PIT ticks take ~1.7 µs.
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert_eq!(pit.current_count(0), 0);
        assert!(pit.output_high(0));
    }

    #[test]
    fn port61_reflects_channel2_output() {
        let pit = std::sync::Arc::new(std::sync::Mutex::new(pit()));
        let mut ctl = SystemControlB::new(pit.clone());
        // An unarmed channel in mode 0 reports its output low.
        assert_eq!(ctl.pio_read(0, 1) & 0x20, 0);
        // Arm channel 2 in mode 0 with a tiny reload; once expired the
        // output goes high and port 0x61 bit 5 follows.
        {
            let mut p = pit.lock().unwrap();
            p.pio_write(3, 1, 0b1001_0000); // ch2, lo only, mode 0
            p.pio_write(2, 1, 2);
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert_eq!(ctl.pio_read(0, 1) & 0x20, 0x20);
        ctl.pio_write(0, 1, 0x01);
        assert_eq!(ctl.pio_read(0, 1) & 0x01, 0x01);
    }
}

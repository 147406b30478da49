use std::collections::VecDeque;
use std::sync::Mutex;

use tenbox_platform::{Device, IrqLine};

const THR: u16 = 0;
const RBR: u16 = 0;
const IER: u16 = 1;
const IIR: u16 = 2;
const FCR: u16 = 2;
const LCR: u16 = 3;
const MCR: u16 = 4;
const LSR: u16 = 5;
const MSR: u16 = 6;
const SCR: u16 = 7;

const LSR_DR: u8 = 0x01;
const LSR_THRE: u8 = 0x20;
const LSR_TEMT: u8 = 0x40;

const RX_FIFO_SIZE: usize = 256;

pub type TxCallback = Box<dyn Fn(u8) + Send>;

/// 16550 UART at COM1. TX bytes go straight to the host callback so LSR
/// can always report the transmitter empty; RX is a 256-byte FIFO fed from
/// the console input thread.
pub struct Uart16550 {
    ier: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
    dll: u8,
    dlh: u8,
    thre_pending: bool,
    rx: Mutex<VecDeque<u8>>,
    irq: Option<IrqLine>,
    tx: Option<TxCallback>,
}

impl Uart16550 {
    pub const COM1_BASE: u16 = 0x3F8;
    pub const REG_COUNT: u16 = 8;

    pub fn new() -> Self {
        Uart16550 {
            ier: 0,
            lcr: 0,
            mcr: 0,
            scr: 0,
            dll: 0,
            dlh: 0,
            thre_pending: false,
            rx: Mutex::new(VecDeque::new()),
            irq: None,
            tx: None,
        }
    }

    pub fn set_irq_line(&mut self, irq: IrqLine) {
        self.irq = Some(irq);
    }

    pub fn set_tx_callback(&mut self, tx: TxCallback) {
        self.tx = Some(tx);
    }

    /// Queue one host byte for the guest. The FIFO drops input beyond 256
    /// bytes; the caller raises IRQ 4 after a batch.
    pub fn push_input(&self, byte: u8) {
        let mut rx = self.rx.lock().unwrap();
        if rx.len() < RX_FIFO_SIZE {
            rx.push_back(byte);
        }
    }

    pub fn has_input(&self) -> bool {
        !self.rx.lock().unwrap().is_empty()
    }

    fn pop_rx(&self) -> u8 {
        self.rx.lock().unwrap().pop_front().unwrap_or(0)
    }

    fn dlab(&self) -> bool {
        self.lcr & 0x80 != 0
    }

    fn raise_irq_if_needed(&self) {
        let rx_ready = self.ier & 0x01 != 0 && self.has_input();
        let tx_ready = self.ier & 0x02 != 0 && self.thre_pending;
        if (rx_ready || tx_ready) && self.irq.is_some() {
            self.irq.as_ref().unwrap().raise();
        }
    }
}

impl Default for Uart16550 {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Uart16550 {
    fn pio_read(&mut self, offset: u16, _size: u8) -> u32 {
        if self.dlab() && offset <= 1 {
            return u32::from(if offset == 0 { self.dll } else { self.dlh });
        }

        let val = match offset {
            RBR => {
                let b = self.pop_rx();
                self.raise_irq_if_needed();
                b
            }
            IER => self.ier,
            IIR => {
                // Priority: receive data available outranks THR empty.
                if self.has_input() && self.ier & 0x01 != 0 {
                    0x04
                } else if self.thre_pending && self.ier & 0x02 != 0 {
                    self.thre_pending = false;
                    0x02
                } else {
                    0x01
                }
            }
            LCR => self.lcr,
            MCR => self.mcr,
            LSR => {
                let mut v = LSR_THRE | LSR_TEMT;
                if self.has_input() {
                    v |= LSR_DR;
                }
                v
            }
            MSR => 0,
            SCR => self.scr,
            _ => 0,
        };
        u32::from(val)
    }

    fn pio_write(&mut self, offset: u16, _size: u8, value: u32) {
        let val = value as u8;

        if self.dlab() && offset <= 1 {
            if offset == 0 {
                self.dll = val;
            } else {
                self.dlh = val;
            }
            return;
        }

        match offset {
            THR => {
                if let Some(tx) = &self.tx {
                    tx(val);
                }
                self.thre_pending = true;
                self.raise_irq_if_needed();
            }
            IER => {
                let old = self.ier;
                self.ier = val;
                // Enabling the transmit interrupt with an empty THR must
                // immediately report THRE, or the guest stalls waiting.
                if val & 0x02 != 0 && old & 0x02 == 0 {
                    self.thre_pending = true;
                }
                self.raise_irq_if_needed();
            }
            FCR => {}
            LCR => self.lcr = val,
            MCR => self.mcr = val,
            SCR => self.scr = val,
            _ => {}
        }
    }
}

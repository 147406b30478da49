use crate::mmio::{QueueHandle, VirtioDevice};
use crate::queue::ChainWriter;
use crate::{VIRTIO_F_VERSION_1, VIRTIO_ID_INPUT};

// Linux evdev event types.
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;
pub const EV_MSC: u16 = 0x04;
pub const EV_REP: u16 = 0x14;

pub const SYN_REPORT: u16 = 0x00;
pub const MSC_SCAN: u16 = 0x04;
pub const REL_WHEEL: u16 = 0x08;

pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;

pub const BTN_LEFT: u16 = 0x110;
pub const BTN_RIGHT: u16 = 0x111;
pub const BTN_MIDDLE: u16 = 0x112;
pub const BTN_TOUCH: u16 = 0x14a;

pub const ABS_AXIS_MAX: u32 = 32767;

const INPUT_PROP_DIRECT: u16 = 0x01;

// Config select values (virtio 1.2, 5.8.2).
const CFG_ID_NAME: u8 = 0x01;
const CFG_ID_SERIAL: u8 = 0x02;
const CFG_ID_DEVIDS: u8 = 0x03;
const CFG_PROP_BITS: u8 = 0x10;
const CFG_EV_BITS: u8 = 0x11;
const CFG_ABS_INFO: u8 = 0x12;

const EVENT_QUEUE: usize = 0;
const STATUS_QUEUE: usize = 1;
const QUEUE_SIZE: u16 = 64;

const CONFIG_DATA_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Keyboard,
    Tablet,
}

fn set_bit(bitmap: &mut [u8], bit: u16) {
    bitmap[usize::from(bit) / 8] |= 1 << (bit % 8);
}

/// Virtio input device: either the keyboard or the absolute-pointer
/// tablet. Event injection comes from the runtime's input channel.
pub struct VirtioInput {
    kind: InputKind,
    select: u8,
    subsel: u8,
    size: u8,
    data: [u8; CONFIG_DATA_SIZE],
    event_queue: Option<QueueHandle>,
    status_queue: Option<QueueHandle>,
}

impl VirtioInput {
    pub fn new(kind: InputKind) -> Self {
        VirtioInput {
            kind,
            select: 0,
            subsel: 0,
            size: 0,
            data: [0u8; CONFIG_DATA_SIZE],
            event_queue: None,
            status_queue: None,
        }
    }

    pub fn kind(&self) -> InputKind {
        self.kind
    }

    fn rebuild_config_data(&mut self) {
        self.data = [0u8; CONFIG_DATA_SIZE];
        self.size = 0;

        match self.select {
            CFG_ID_NAME => {
                let name: &[u8] = match self.kind {
                    InputKind::Keyboard => b"virtio-keyboard",
                    InputKind::Tablet => b"virtio-tablet",
                };
                self.data[..name.len()].copy_from_slice(name);
                self.size = name.len() as u8;
            }
            CFG_ID_SERIAL => {
                let serial = b"tenbox-0";
                self.data[..serial.len()].copy_from_slice(serial);
                self.size = serial.len() as u8;
            }
            CFG_ID_DEVIDS => {
                // bustype BUS_VIRTUAL, vendor 1, product 1/2, version 1
                self.data[0..2].copy_from_slice(&0x06u16.to_le_bytes());
                self.data[2..4].copy_from_slice(&0x0001u16.to_le_bytes());
                let product: u16 = if self.kind == InputKind::Keyboard { 1 } else { 2 };
                self.data[4..6].copy_from_slice(&product.to_le_bytes());
                self.data[6..8].copy_from_slice(&0x0001u16.to_le_bytes());
                self.size = 8;
            }
            CFG_PROP_BITS => {
                if self.kind == InputKind::Tablet {
                    set_bit(&mut self.data, INPUT_PROP_DIRECT);
                    self.size = 1;
                }
            }
            CFG_EV_BITS => match self.kind {
                InputKind::Keyboard => match u16::from(self.subsel) {
                    EV_KEY => {
                        // Standard keys 1..127 plus the extended range to
                        // 248 so udev classifies this as a real keyboard.
                        for k in 1u16..=248 {
                            set_bit(&mut self.data, k);
                        }
                        self.size = (248 / 8) + 1;
                    }
                    EV_SYN => {
                        set_bit(&mut self.data, SYN_REPORT);
                        self.size = 1;
                    }
                    EV_REP => {
                        set_bit(&mut self.data, 0);
                        set_bit(&mut self.data, 1);
                        self.size = 1;
                    }
                    EV_MSC => {
                        set_bit(&mut self.data, MSC_SCAN);
                        self.size = 1;
                    }
                    _ => {}
                },
                InputKind::Tablet => match u16::from(self.subsel) {
                    EV_ABS => {
                        set_bit(&mut self.data, ABS_X);
                        set_bit(&mut self.data, ABS_Y);
                        self.size = 1;
                    }
                    EV_KEY => {
                        set_bit(&mut self.data, BTN_LEFT);
                        set_bit(&mut self.data, BTN_RIGHT);
                        set_bit(&mut self.data, BTN_MIDDLE);
                        set_bit(&mut self.data, BTN_TOUCH);
                        self.size = ((BTN_TOUCH / 8) + 1) as u8;
                    }
                    EV_SYN => {
                        set_bit(&mut self.data, SYN_REPORT);
                        self.size = 1;
                    }
                    _ => {}
                },
            },
            CFG_ABS_INFO => {
                if self.kind == InputKind::Tablet
                    && (u16::from(self.subsel) == ABS_X || u16::from(self.subsel) == ABS_Y)
                {
                    // min=0, max=32767, fuzz/flat/res zero.
                    self.data[4..8].copy_from_slice(&ABS_AXIS_MAX.to_le_bytes());
                    self.size = 20;
                }
            }
            _ => {}
        }
    }

    fn config_bytes(&self) -> [u8; 8 + CONFIG_DATA_SIZE] {
        let mut cfg = [0u8; 8 + CONFIG_DATA_SIZE];
        cfg[0] = self.select;
        cfg[1] = self.subsel;
        cfg[2] = self.size;
        cfg[8..].copy_from_slice(&self.data);
        cfg
    }

    /// Write one 8-byte evdev event into the event queue. When the ring is
    /// exhausted and `notify` is set (the SYN_REPORT terminator), the used
    /// interrupt fires anyway so the guest recycles its buffers.
    pub fn inject_event(&mut self, ev_type: u16, code: u16, value: u32, notify: bool) {
        let Some(handle) = self.event_queue.clone() else {
            return;
        };

        let Some((head, chain)) = handle.pop_chain() else {
            if notify {
                handle.interrupt().signal_used_buffer();
            }
            return;
        };
        if chain.is_empty() {
            if notify {
                handle.interrupt().signal_used_buffer();
            }
            return;
        }

        let mut event = [0u8; 8];
        event[0..2].copy_from_slice(&ev_type.to_le_bytes());
        event[2..4].copy_from_slice(&code.to_le_bytes());
        event[4..8].copy_from_slice(&value.to_le_bytes());

        let mut writer = ChainWriter::new(handle.mem(), &chain);
        writer.write(&event);
        handle.push_used(head, writer.written());
        if notify {
            handle.interrupt().signal_used_buffer();
        }
    }
}

impl VirtioDevice for VirtioInput {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_INPUT
    }

    fn device_features(&self) -> u64 {
        VIRTIO_F_VERSION_1
    }

    fn num_queues(&self) -> usize {
        2
    }

    fn queue_max_size(&self, _queue: usize) -> u16 {
        QUEUE_SIZE
    }

    fn read_config(&mut self, offset: u64, data: &mut [u8]) {
        let cfg = self.config_bytes();
        data.fill(0);
        if let Ok(off) = usize::try_from(offset) {
            if off < cfg.len() {
                let n = data.len().min(cfg.len() - off);
                data[..n].copy_from_slice(&cfg[off..off + n]);
            }
        }
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        // Only select (0) and subsel (1) are writable.
        for (i, b) in data.iter().enumerate() {
            match offset + i as u64 {
                0 => self.select = *b,
                1 => self.subsel = *b,
                _ => {}
            }
        }
        self.rebuild_config_data();
    }

    fn on_queue_ready(&mut self, queue: usize, handle: QueueHandle) {
        match queue {
            EVENT_QUEUE => self.event_queue = Some(handle),
            STATUS_QUEUE => self.status_queue = Some(handle),
            _ => {}
        }
    }

    fn on_queue_notify(&mut self, queue: usize) {
        // The status queue (LED state etc.) is consumed and discarded.
        if queue == STATUS_QUEUE {
            if let Some(handle) = self.status_queue.clone() {
                let mut any = false;
                while let Some((head, _chain)) = handle.pop_chain() {
                    handle.push_used(head, 0);
                    any = true;
                }
                if any {
                    handle.interrupt().signal_used_buffer();
                }
            }
        }
        // Event queue notifies just replenish buffers for inject_event.
    }

    fn on_reset(&mut self) {
        self.event_queue = None;
        self.status_queue = None;
    }
}

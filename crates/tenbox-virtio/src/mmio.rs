use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tenbox_memory::GuestRam;
use tenbox_platform::{Device, IrqLine};
use tracing::{debug, info};

use crate::queue::VirtQueue;

/// Size of one virtio-mmio register window.
pub const VIRTIO_MMIO_SIZE: u64 = 0x200;

pub const VIRTIO_MMIO_INT_VRING: u32 = 1 << 0;
pub const VIRTIO_MMIO_INT_CONFIG: u32 = 1 << 1;

pub const VIRTIO_STATUS_DRIVER_OK: u32 = 0x4;

const MAGIC_VALUE: u32 = 0x7472_6976; // "virt"
const VERSION: u32 = 2;
const VENDOR_ID: u32 = 0x554D_4551; // "QEMU", the conventional virtio-mmio vendor

// Register offsets (virtio 1.2, section 4.2.2).
const REG_MAGIC_VALUE: u64 = 0x000;
const REG_VERSION: u64 = 0x004;
const REG_DEVICE_ID: u64 = 0x008;
const REG_VENDOR_ID: u64 = 0x00C;
const REG_DEVICE_FEATURES: u64 = 0x010;
const REG_DEVICE_FEATURES_SEL: u64 = 0x014;
const REG_DRIVER_FEATURES: u64 = 0x020;
const REG_DRIVER_FEATURES_SEL: u64 = 0x024;
const REG_QUEUE_SEL: u64 = 0x030;
const REG_QUEUE_NUM_MAX: u64 = 0x034;
const REG_QUEUE_NUM: u64 = 0x038;
const REG_QUEUE_READY: u64 = 0x044;
const REG_QUEUE_NOTIFY: u64 = 0x050;
const REG_INTERRUPT_STATUS: u64 = 0x060;
const REG_INTERRUPT_ACK: u64 = 0x064;
const REG_STATUS: u64 = 0x070;
const REG_QUEUE_DESC_LOW: u64 = 0x080;
const REG_QUEUE_DESC_HIGH: u64 = 0x084;
const REG_QUEUE_DRIVER_LOW: u64 = 0x090;
const REG_QUEUE_DRIVER_HIGH: u64 = 0x094;
const REG_QUEUE_DEVICE_LOW: u64 = 0x0A0;
const REG_QUEUE_DEVICE_HIGH: u64 = 0x0A4;
const REG_CONFIG_GENERATION: u64 = 0x0FC;
const REG_CONFIG: u64 = 0x100;

/// Interrupt capability handed to a backend. Copyable; carries the shared
/// interrupt-status word and the IRQ line instead of a transport pointer.
#[derive(Clone)]
pub struct VirtioInterrupt {
    status: Arc<AtomicU32>,
    config_generation: Arc<AtomicU32>,
    irq: IrqLine,
}

impl VirtioInterrupt {
    pub fn new(irq: IrqLine) -> Self {
        VirtioInterrupt {
            status: Arc::new(AtomicU32::new(0)),
            config_generation: Arc::new(AtomicU32::new(0)),
            irq,
        }
    }

    /// A used buffer was pushed; set bit 0 and raise the device IRQ.
    pub fn signal_used_buffer(&self) {
        self.status.fetch_or(VIRTIO_MMIO_INT_VRING, Ordering::SeqCst);
        self.irq.raise();
    }

    /// Device configuration changed; bump the generation, set bit 1 and
    /// raise the IRQ.
    pub fn signal_config_change(&self) {
        self.config_generation.fetch_add(1, Ordering::SeqCst);
        self.status.fetch_or(VIRTIO_MMIO_INT_CONFIG, Ordering::SeqCst);
        self.irq.raise();
    }

    pub fn read_status(&self) -> u32 {
        self.status.load(Ordering::SeqCst)
    }

    pub fn ack(&self, mask: u32) {
        self.status.fetch_and(!mask, Ordering::SeqCst);
    }

    pub fn config_generation(&self) -> u32 {
        self.config_generation.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.status.store(0, Ordering::SeqCst);
    }
}

/// A ready queue handed to a backend, bundled with the memory view and the
/// interrupt so backend threads can push used buffers on their own.
#[derive(Clone)]
pub struct QueueHandle {
    queue: Arc<Mutex<VirtQueue>>,
    mem: GuestRam,
    interrupt: VirtioInterrupt,
}

impl QueueHandle {
    pub fn mem(&self) -> &GuestRam {
        &self.mem
    }

    pub fn interrupt(&self) -> &VirtioInterrupt {
        &self.interrupt
    }

    pub fn lock(&self) -> MutexGuard<'_, VirtQueue> {
        self.queue.lock().unwrap()
    }

    /// Pop one available chain, returning the head and its elements.
    pub fn pop_chain(&self) -> Option<(u16, Vec<crate::queue::ChainElem>)> {
        let mut q = self.lock();
        let head = q.pop_avail(&self.mem)?;
        match q.walk_chain(&self.mem, head) {
            Some(chain) => Some((head, chain)),
            None => {
                // Consume the malformed chain so the ring keeps draining.
                q.push_used(&self.mem, head, 0);
                Some((head, Vec::new()))
            }
        }
    }

    pub fn push_used(&self, head: u16, total_len: u32) {
        self.lock().push_used(&self.mem, head, total_len);
    }
}

/// Backend half of a virtio device. The transport drives this through an
/// `Arc<Mutex<dyn VirtioDevice>>`; backend threads (network pump, sound
/// timer) lock the same object.
pub trait VirtioDevice: Send {
    fn device_id(&self) -> u32;
    fn device_features(&self) -> u64;
    fn num_queues(&self) -> usize;
    fn queue_max_size(&self, queue: usize) -> u16;

    fn read_config(&mut self, offset: u64, data: &mut [u8]);
    fn write_config(&mut self, _offset: u64, _data: &[u8]) {}

    /// Called once when the transport is created.
    fn on_attach(&mut self, _interrupt: VirtioInterrupt, _mem: GuestRam) {}
    /// Called when the driver marks a queue ready.
    fn on_queue_ready(&mut self, _queue: usize, _handle: QueueHandle) {}
    /// A guest write to QueueNotify for `queue`.
    fn on_queue_notify(&mut self, queue: usize);
    /// The driver accepted a feature set (after each DriverFeatures write).
    fn on_driver_features(&mut self, _features: u64) {}
    /// Status register written (non-zero values).
    fn on_status(&mut self, _status: u32) {}
    /// Full transport reset (Status=0).
    fn on_reset(&mut self) {}
}

#[derive(Default, Clone, Copy)]
struct StagedQueue {
    num: u32,
    desc_addr: u64,
    driver_addr: u64,
    device_addr: u64,
}

/// Virtio-mmio transport: one 0x200-byte register window per device.
pub struct VirtioMmio {
    device: Arc<Mutex<dyn VirtioDevice>>,
    mem: GuestRam,
    interrupt: VirtioInterrupt,
    status: u32,
    device_features_sel: u32,
    driver_features_sel: u32,
    driver_features: u64,
    queue_sel: u32,
    queues: Vec<Arc<Mutex<VirtQueue>>>,
    staged: Vec<StagedQueue>,
}

impl VirtioMmio {
    pub fn new(device: Arc<Mutex<dyn VirtioDevice>>, mem: GuestRam, irq: IrqLine) -> Self {
        let interrupt = VirtioInterrupt::new(irq);
        let (num_queues, max_sizes) = {
            let dev = device.lock().unwrap();
            let n = dev.num_queues();
            let sizes: Vec<u16> = (0..n).map(|i| dev.queue_max_size(i)).collect();
            (n, sizes)
        };

        let queues = max_sizes
            .iter()
            .map(|s| Arc::new(Mutex::new(VirtQueue::new(*s))))
            .collect();

        device
            .lock()
            .unwrap()
            .on_attach(interrupt.clone(), mem.clone());

        VirtioMmio {
            device,
            mem,
            interrupt,
            status: 0,
            device_features_sel: 0,
            driver_features_sel: 0,
            driver_features: 0,
            queue_sel: 0,
            queues,
            staged: vec![StagedQueue::default(); num_queues],
        }
    }

    pub fn interrupt(&self) -> &VirtioInterrupt {
        &self.interrupt
    }

    fn reset(&mut self) {
        self.status = 0;
        self.device_features_sel = 0;
        self.driver_features_sel = 0;
        self.driver_features = 0;
        self.queue_sel = 0;
        self.interrupt.reset();
        for (q, s) in self.queues.iter().zip(self.staged.iter_mut()) {
            q.lock().unwrap().reset();
            *s = StagedQueue::default();
        }
        self.device.lock().unwrap().on_reset();
    }

    fn selected_staged(&mut self) -> Option<&mut StagedQueue> {
        self.staged.get_mut(self.queue_sel as usize)
    }
}

impl Device for VirtioMmio {
    fn mmio_read(&mut self, offset: u64, size: u8) -> u64 {
        if offset >= REG_CONFIG {
            let mut buf = [0u8; 8];
            let len = usize::from(size).min(8);
            self.device
                .lock()
                .unwrap()
                .read_config(offset - REG_CONFIG, &mut buf[..len]);
            return u64::from_le_bytes(buf);
        }

        let val: u32 = match offset {
            REG_MAGIC_VALUE => MAGIC_VALUE,
            REG_VERSION => VERSION,
            REG_DEVICE_ID => self.device.lock().unwrap().device_id(),
            REG_VENDOR_ID => VENDOR_ID,
            REG_DEVICE_FEATURES => {
                let features = self.device.lock().unwrap().device_features();
                match self.device_features_sel {
                    0 => features as u32,
                    1 => (features >> 32) as u32,
                    _ => 0,
                }
            }
            REG_QUEUE_NUM_MAX => {
                let dev = self.device.lock().unwrap();
                if (self.queue_sel as usize) < self.queues.len() {
                    u32::from(dev.queue_max_size(self.queue_sel as usize))
                } else {
                    0
                }
            }
            REG_QUEUE_READY => self
                .queues
                .get(self.queue_sel as usize)
                .map(|q| u32::from(q.lock().unwrap().is_ready()))
                .unwrap_or(0),
            REG_INTERRUPT_STATUS => self.interrupt.read_status(),
            REG_STATUS => self.status,
            REG_CONFIG_GENERATION => self.interrupt.config_generation(),
            _ => {
                debug!(offset = format_args!("{offset:#x}"), "virtio-mmio unhandled read");
                0
            }
        };
        u64::from(val)
    }

    fn mmio_write(&mut self, offset: u64, size: u8, value: u64) {
        if offset >= REG_CONFIG {
            let len = usize::from(size).min(8);
            let bytes = value.to_le_bytes();
            self.device
                .lock()
                .unwrap()
                .write_config(offset - REG_CONFIG, &bytes[..len]);
            return;
        }

        let val = value as u32;
        match offset {
            REG_DEVICE_FEATURES_SEL => self.device_features_sel = val,
            REG_DRIVER_FEATURES_SEL => self.driver_features_sel = val,
            REG_DRIVER_FEATURES => {
                if self.driver_features_sel == 0 {
                    self.driver_features =
                        (self.driver_features & 0xFFFF_FFFF_0000_0000) | u64::from(val);
                } else if self.driver_features_sel == 1 {
                    self.driver_features = (self.driver_features & 0x0000_0000_FFFF_FFFF)
                        | (u64::from(val) << 32);
                }
                self.device
                    .lock()
                    .unwrap()
                    .on_driver_features(self.driver_features);
            }
            REG_QUEUE_SEL => self.queue_sel = val,
            REG_QUEUE_NUM => {
                if let Some(s) = self.selected_staged() {
                    s.num = val;
                }
            }
            REG_QUEUE_DESC_LOW => {
                if let Some(s) = self.selected_staged() {
                    s.desc_addr = (s.desc_addr & 0xFFFF_FFFF_0000_0000) | u64::from(val);
                }
            }
            REG_QUEUE_DESC_HIGH => {
                if let Some(s) = self.selected_staged() {
                    s.desc_addr = (s.desc_addr & 0x0000_0000_FFFF_FFFF) | (u64::from(val) << 32);
                }
            }
            REG_QUEUE_DRIVER_LOW => {
                if let Some(s) = self.selected_staged() {
                    s.driver_addr = (s.driver_addr & 0xFFFF_FFFF_0000_0000) | u64::from(val);
                }
            }
            REG_QUEUE_DRIVER_HIGH => {
                if let Some(s) = self.selected_staged() {
                    s.driver_addr =
                        (s.driver_addr & 0x0000_0000_FFFF_FFFF) | (u64::from(val) << 32);
                }
            }
            REG_QUEUE_DEVICE_LOW => {
                if let Some(s) = self.selected_staged() {
                    s.device_addr = (s.device_addr & 0xFFFF_FFFF_0000_0000) | u64::from(val);
                }
            }
            REG_QUEUE_DEVICE_HIGH => {
                if let Some(s) = self.selected_staged() {
                    s.device_addr =
                        (s.device_addr & 0x0000_0000_FFFF_FFFF) | (u64::from(val) << 32);
                }
            }
            REG_QUEUE_READY => {
                let sel = self.queue_sel as usize;
                if sel < self.queues.len() {
                    if val == 1 {
                        let staged = self.staged[sel];
                        let max = self.device.lock().unwrap().queue_max_size(sel);
                        let size = if staged.num == 0 { max } else { staged.num as u16 };
                        self.queues[sel].lock().unwrap().configure(
                            size,
                            staged.desc_addr,
                            staged.driver_addr,
                            staged.device_addr,
                        );
                        info!(
                            queue = sel,
                            size,
                            desc = format_args!("{:#x}", staged.desc_addr),
                            driver = format_args!("{:#x}", staged.driver_addr),
                            device = format_args!("{:#x}", staged.device_addr),
                            "virtio queue ready"
                        );
                        let handle = QueueHandle {
                            queue: self.queues[sel].clone(),
                            mem: self.mem.clone(),
                            interrupt: self.interrupt.clone(),
                        };
                        self.device.lock().unwrap().on_queue_ready(sel, handle);
                    } else {
                        self.queues[sel].lock().unwrap().set_ready(false);
                    }
                }
            }
            REG_QUEUE_NOTIFY => {
                let q = val as usize;
                let ready = self
                    .queues
                    .get(q)
                    .map(|queue| queue.lock().unwrap().is_ready())
                    .unwrap_or(false);
                if ready {
                    self.device.lock().unwrap().on_queue_notify(q);
                }
            }
            REG_INTERRUPT_ACK => self.interrupt.ack(val),
            REG_STATUS => {
                if val == 0 {
                    self.reset();
                } else {
                    self.status = val;
                    self.device.lock().unwrap().on_status(val);
                }
            }
            _ => {
                debug!(
                    offset = format_args!("{offset:#x}"),
                    value = val,
                    "virtio-mmio unhandled write"
                );
            }
        }
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tenbox_memory::{GuestMemory, GuestRam};
use tenbox_platform::{Device, IrqLine, IrqSink};
use tenbox_virtio::{QueueHandle, VirtioDevice, VirtioInterrupt, VirtioMmio};

const REG_MAGIC: u64 = 0x000;
const REG_VERSION: u64 = 0x004;
const REG_DEVICE_ID: u64 = 0x008;
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
const REG_QUEUE_DRIVER_LOW: u64 = 0x090;
const REG_QUEUE_DEVICE_LOW: u64 = 0x0A0;
const REG_CONFIG_GENERATION: u64 = 0x0FC;
const REG_CONFIG: u64 = 0x100;

#[derive(Default)]
struct CountingSink(AtomicUsize);

impl IrqSink for CountingSink {
    fn raise_irq(&self, _irq: u32) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct StubDevice {
    notified: Vec<usize>,
    ready: Vec<usize>,
    resets: usize,
    driver_features: u64,
    interrupt: Option<VirtioInterrupt>,
    handles: Vec<QueueHandle>,
}

impl VirtioDevice for StubDevice {
    fn device_id(&self) -> u32 {
        42
    }

    fn device_features(&self) -> u64 {
        0xAAAA_BBBB_CCCC_DDDD
    }

    fn num_queues(&self) -> usize {
        2
    }

    fn queue_max_size(&self, _queue: usize) -> u16 {
        64
    }

    fn read_config(&mut self, offset: u64, data: &mut [u8]) {
        for (i, b) in data.iter_mut().enumerate() {
            *b = (offset as u8).wrapping_add(i as u8);
        }
    }

    fn on_attach(&mut self, interrupt: VirtioInterrupt, _mem: GuestRam) {
        self.interrupt = Some(interrupt);
    }

    fn on_queue_ready(&mut self, queue: usize, handle: QueueHandle) {
        self.ready.push(queue);
        self.handles.push(handle);
    }

    fn on_queue_notify(&mut self, queue: usize) {
        self.notified.push(queue);
    }

    fn on_driver_features(&mut self, features: u64) {
        self.driver_features = features;
    }

    fn on_reset(&mut self) {
        self.resets += 1;
    }
}

fn setup() -> (VirtioMmio, Arc<Mutex<StubDevice>>, Arc<CountingSink>, GuestRam) {
    let mem = GuestMemory::new(0x20000).view();
    let dev = Arc::new(Mutex::new(StubDevice::default()));
    let sink = Arc::new(CountingSink::default());
    let mmio = VirtioMmio::new(dev.clone(), mem.clone(), IrqLine::new(5, sink.clone()));
    (mmio, dev, sink, mem)
}

fn setup_queue(mmio: &mut VirtioMmio, queue: u32) {
    let base = 0x1000 + u64::from(queue) * 0x3000;
    mmio.mmio_write(REG_QUEUE_SEL, 4, u64::from(queue));
    mmio.mmio_write(REG_QUEUE_NUM, 4, 8);
    mmio.mmio_write(REG_QUEUE_DESC_LOW, 4, base);
    mmio.mmio_write(REG_QUEUE_DRIVER_LOW, 4, base + 0x1000);
    mmio.mmio_write(REG_QUEUE_DEVICE_LOW, 4, base + 0x2000);
    mmio.mmio_write(REG_QUEUE_READY, 4, 1);
}

#[test]
fn identity_registers() {
    let (mut mmio, _dev, _sink, _mem) = setup();
    assert_eq!(mmio.mmio_read(REG_MAGIC, 4), 0x7472_6976);
    assert_eq!(mmio.mmio_read(REG_VERSION, 4), 2);
    assert_eq!(mmio.mmio_read(REG_DEVICE_ID, 4), 42);
}

#[test]
fn device_features_are_selected_in_32_bit_halves() {
    let (mut mmio, _dev, _sink, _mem) = setup();
    mmio.mmio_write(REG_DEVICE_FEATURES_SEL, 4, 0);
    assert_eq!(mmio.mmio_read(REG_DEVICE_FEATURES, 4), 0xCCCC_DDDD);
    mmio.mmio_write(REG_DEVICE_FEATURES_SEL, 4, 1);
    assert_eq!(mmio.mmio_read(REG_DEVICE_FEATURES, 4), 0xAAAA_BBBB);
    mmio.mmio_write(REG_DEVICE_FEATURES_SEL, 4, 2);
    assert_eq!(mmio.mmio_read(REG_DEVICE_FEATURES, 4), 0);
}

#[test]
fn driver_features_combine_both_halves() {
    let (mut mmio, dev, _sink, _mem) = setup();
    mmio.mmio_write(REG_DRIVER_FEATURES_SEL, 4, 0);
    mmio.mmio_write(REG_DRIVER_FEATURES, 4, 0x1122_3344);
    mmio.mmio_write(REG_DRIVER_FEATURES_SEL, 4, 1);
    mmio.mmio_write(REG_DRIVER_FEATURES, 4, 0x5566_7788);
    assert_eq!(dev.lock().unwrap().driver_features, 0x5566_7788_1122_3344);
}

#[test]
fn queue_ready_captures_staged_config_and_hands_out_handle() {
    let (mut mmio, dev, _sink, _mem) = setup();
    setup_queue(&mut mmio, 0);
    assert_eq!(mmio.mmio_read(REG_QUEUE_READY, 4), 1);
    assert_eq!(dev.lock().unwrap().ready, vec![0]);
    assert_eq!(mmio.mmio_read(REG_QUEUE_NUM_MAX, 4), 64);
}

#[test]
fn notify_reaches_backend_only_for_ready_queues() {
    let (mut mmio, dev, _sink, _mem) = setup();
    mmio.mmio_write(REG_QUEUE_NOTIFY, 4, 0);
    assert!(dev.lock().unwrap().notified.is_empty());

    setup_queue(&mut mmio, 0);
    mmio.mmio_write(REG_QUEUE_NOTIFY, 4, 0);
    assert_eq!(dev.lock().unwrap().notified, vec![0]);

    // Out-of-range queue index is ignored.
    mmio.mmio_write(REG_QUEUE_NOTIFY, 4, 7);
    assert_eq!(dev.lock().unwrap().notified, vec![0]);
}

#[test]
fn interrupt_status_sets_and_acks() {
    let (mut mmio, dev, sink, _mem) = setup();
    let interrupt = dev.lock().unwrap().interrupt.clone().unwrap();

    interrupt.signal_used_buffer();
    assert_eq!(mmio.mmio_read(REG_INTERRUPT_STATUS, 4), 1);
    assert_eq!(sink.0.load(Ordering::SeqCst), 1);

    interrupt.signal_config_change();
    assert_eq!(mmio.mmio_read(REG_INTERRUPT_STATUS, 4), 3);
    assert_eq!(mmio.mmio_read(REG_CONFIG_GENERATION, 4), 1);

    mmio.mmio_write(REG_INTERRUPT_ACK, 4, 1);
    assert_eq!(mmio.mmio_read(REG_INTERRUPT_STATUS, 4), 2);
    mmio.mmio_write(REG_INTERRUPT_ACK, 4, 2);
    assert_eq!(mmio.mmio_read(REG_INTERRUPT_STATUS, 4), 0);
}

#[test]
fn status_zero_resets_transport_and_queues() {
    let (mut mmio, dev, _sink, _mem) = setup();
    mmio.mmio_write(REG_STATUS, 4, 0x0F);
    setup_queue(&mut mmio, 0);
    setup_queue(&mut mmio, 1);

    let interrupt = dev.lock().unwrap().interrupt.clone().unwrap();
    interrupt.signal_used_buffer();

    mmio.mmio_write(REG_STATUS, 4, 0);

    assert_eq!(mmio.mmio_read(REG_STATUS, 4), 0);
    assert_eq!(mmio.mmio_read(REG_INTERRUPT_STATUS, 4), 0);
    for q in 0..2u64 {
        mmio.mmio_write(REG_QUEUE_SEL, 4, q);
        assert_eq!(mmio.mmio_read(REG_QUEUE_READY, 4), 0);
    }
    assert_eq!(dev.lock().unwrap().resets, 1);
}

#[test]
fn config_space_reads_pass_through_with_width() {
    let (mut mmio, _dev, _sink, _mem) = setup();
    // StubDevice returns offset+i per byte.
    assert_eq!(mmio.mmio_read(REG_CONFIG, 1), 0x00);
    assert_eq!(mmio.mmio_read(REG_CONFIG + 4, 4), u64::from(u32::from_le_bytes([4, 5, 6, 7])));
}

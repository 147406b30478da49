use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tenbox_memory::{GuestMemory, GuestRam};
use tenbox_platform::ports::DisplayFrame;
use tenbox_platform::{Device, IrqLine, IrqSink};
use tenbox_virtio::devices::gpu::{
    VirtioGpu, VIRTIO_GPU_CMD_GET_DISPLAY_INFO, VIRTIO_GPU_CMD_MOVE_CURSOR,
    VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING, VIRTIO_GPU_CMD_RESOURCE_CREATE_2D,
    VIRTIO_GPU_CMD_RESOURCE_FLUSH, VIRTIO_GPU_CMD_SET_SCANOUT,
    VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D, VIRTIO_GPU_CMD_UPDATE_CURSOR, VIRTIO_GPU_EVENT_DISPLAY,
    VIRTIO_GPU_FLAG_FENCE, VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID, VIRTIO_GPU_RESP_OK_DISPLAY_INFO,
    VIRTIO_GPU_RESP_OK_NODATA,
};
use tenbox_virtio::{VirtioMmio, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};

const REG_QUEUE_SEL: u64 = 0x030;
const REG_QUEUE_NUM: u64 = 0x038;
const REG_QUEUE_READY: u64 = 0x044;
const REG_QUEUE_NOTIFY: u64 = 0x050;
const REG_INTERRUPT_STATUS: u64 = 0x060;
const REG_STATUS: u64 = 0x070;
const REG_QUEUE_DESC_LOW: u64 = 0x080;
const REG_QUEUE_DRIVER_LOW: u64 = 0x090;
const REG_QUEUE_DEVICE_LOW: u64 = 0x0A0;
const REG_CONFIG: u64 = 0x100;

const CTRL_HDR: usize = 24;

fn queue_base(q: u64) -> (u64, u64, u64) {
    let base = 0x10000 + q * 0x3000;
    (base, base + 0x1000, base + 0x2000)
}

#[derive(Default)]
struct CountingSink(AtomicUsize);

impl IrqSink for CountingSink {
    fn raise_irq(&self, _irq: u32) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Setup {
    mmio: VirtioMmio,
    gpu: Arc<Mutex<VirtioGpu>>,
    mem: GuestRam,
    avail_idx: [u16; 2],
}

fn setup() -> Setup {
    let mem = GuestMemory::new(0x200000).view();
    let gpu = Arc::new(Mutex::new(VirtioGpu::new(1024, 768)));
    let irqs = Arc::new(CountingSink::default());
    let mut mmio = VirtioMmio::new(gpu.clone(), mem.clone(), IrqLine::new(9, irqs));

    mmio.mmio_write(REG_STATUS, 4, 0x0F);
    for q in 0..2u64 {
        let (desc, avail, used) = queue_base(q);
        mmio.mmio_write(REG_QUEUE_SEL, 4, q);
        mmio.mmio_write(REG_QUEUE_NUM, 4, 8);
        mmio.mmio_write(REG_QUEUE_DESC_LOW, 4, desc);
        mmio.mmio_write(REG_QUEUE_DRIVER_LOW, 4, avail);
        mmio.mmio_write(REG_QUEUE_DEVICE_LOW, 4, used);
        mmio.mmio_write(REG_QUEUE_READY, 4, 1);
    }

    Setup { mmio, gpu, mem, avail_idx: [0, 0] }
}

impl Setup {
    /// Submit one request + response chain on a queue and return the
    /// response bytes.
    fn roundtrip(&mut self, q: usize, request: &[u8], resp_len: u32) -> Vec<u8> {
        let req_addr = 0x100000;
        let resp_addr = 0x110000;
        self.mem.write(req_addr, request).unwrap();

        let (desc, avail, used) = queue_base(q as u64);
        self.mem.write_u64_le(desc, req_addr).unwrap();
        self.mem.write_u32_le(desc + 8, request.len() as u32).unwrap();
        self.mem.write_u16_le(desc + 12, VIRTQ_DESC_F_NEXT).unwrap();
        self.mem.write_u16_le(desc + 14, 1).unwrap();
        self.mem.write_u64_le(desc + 16, resp_addr).unwrap();
        self.mem.write_u32_le(desc + 24, resp_len).unwrap();
        self.mem.write_u16_le(desc + 28, VIRTQ_DESC_F_WRITE).unwrap();
        self.mem.write_u16_le(desc + 30, 0).unwrap();

        let slot = self.avail_idx[q] % 8;
        self.mem.write_u16_le(avail + 4 + u64::from(slot) * 2, 0).unwrap();
        self.avail_idx[q] = self.avail_idx[q].wrapping_add(1);
        self.mem.write_u16_le(avail + 2, self.avail_idx[q]).unwrap();

        self.mmio.mmio_write(REG_QUEUE_NOTIFY, 4, q as u64);

        let written = self
            .mem
            .read_u32_le(used + 4 + u64::from(self.avail_idx[q] - 1) % 8 * 8 + 4)
            .unwrap();
        self.mem.read_vec(resp_addr, (written.max(4)) as usize).unwrap()
    }

    fn simple_cmd(&mut self, cmd: u32, tail: &[u8]) -> u32 {
        let mut req = vec![0u8; CTRL_HDR];
        req[0..4].copy_from_slice(&cmd.to_le_bytes());
        req.extend_from_slice(tail);
        let resp = self.roundtrip(0, &req, 4096);
        u32::from_le_bytes(resp[0..4].try_into().unwrap())
    }

    fn create_resource(&mut self, id: u32, w: u32, h: u32) {
        let mut tail = Vec::new();
        tail.extend_from_slice(&id.to_le_bytes());
        tail.extend_from_slice(&1u32.to_le_bytes()); // format B8G8R8A8
        tail.extend_from_slice(&w.to_le_bytes());
        tail.extend_from_slice(&h.to_le_bytes());
        assert_eq!(
            self.simple_cmd(VIRTIO_GPU_CMD_RESOURCE_CREATE_2D, &tail),
            VIRTIO_GPU_RESP_OK_NODATA
        );
    }

    fn attach_backing(&mut self, id: u32, gpa: u64, len: u32) {
        let mut tail = Vec::new();
        tail.extend_from_slice(&id.to_le_bytes());
        tail.extend_from_slice(&1u32.to_le_bytes()); // nr_entries
        tail.extend_from_slice(&gpa.to_le_bytes());
        tail.extend_from_slice(&len.to_le_bytes());
        tail.extend_from_slice(&0u32.to_le_bytes()); // padding
        assert_eq!(
            self.simple_cmd(VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING, &tail),
            VIRTIO_GPU_RESP_OK_NODATA
        );
    }

    fn set_scanout(&mut self, id: u32, w: u32, h: u32) {
        let mut tail = Vec::new();
        tail.extend_from_slice(&[0u8; 8]); // rect x/y
        tail.extend_from_slice(&w.to_le_bytes());
        tail.extend_from_slice(&h.to_le_bytes());
        tail.extend_from_slice(&0u32.to_le_bytes()); // scanout_id
        tail.extend_from_slice(&id.to_le_bytes());
        assert_eq!(
            self.simple_cmd(VIRTIO_GPU_CMD_SET_SCANOUT, &tail),
            VIRTIO_GPU_RESP_OK_NODATA
        );
    }

    fn transfer(&mut self, id: u32, x: u32, y: u32, w: u32, h: u32, offset: u64) {
        let mut tail = Vec::new();
        tail.extend_from_slice(&x.to_le_bytes());
        tail.extend_from_slice(&y.to_le_bytes());
        tail.extend_from_slice(&w.to_le_bytes());
        tail.extend_from_slice(&h.to_le_bytes());
        tail.extend_from_slice(&offset.to_le_bytes());
        tail.extend_from_slice(&id.to_le_bytes());
        tail.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            self.simple_cmd(VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D, &tail),
            VIRTIO_GPU_RESP_OK_NODATA
        );
    }

    fn flush_resource(&mut self, id: u32, w: u32, h: u32) {
        let mut tail = Vec::new();
        tail.extend_from_slice(&[0u8; 8]);
        tail.extend_from_slice(&w.to_le_bytes());
        tail.extend_from_slice(&h.to_le_bytes());
        tail.extend_from_slice(&id.to_le_bytes());
        tail.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            self.simple_cmd(VIRTIO_GPU_CMD_RESOURCE_FLUSH, &tail),
            VIRTIO_GPU_RESP_OK_NODATA
        );
    }
}

#[test]
fn get_display_info_reports_one_enabled_scanout() {
    let mut s = setup();
    let mut req = vec![0u8; CTRL_HDR];
    req[0..4].copy_from_slice(&VIRTIO_GPU_CMD_GET_DISPLAY_INFO.to_le_bytes());
    let resp = s.roundtrip(0, &req, 4096);

    assert_eq!(
        u32::from_le_bytes(resp[0..4].try_into().unwrap()),
        VIRTIO_GPU_RESP_OK_DISPLAY_INFO
    );
    let p = CTRL_HDR;
    assert_eq!(u32::from_le_bytes(resp[p + 8..p + 12].try_into().unwrap()), 1024);
    assert_eq!(u32::from_le_bytes(resp[p + 12..p + 16].try_into().unwrap()), 768);
    assert_eq!(u32::from_le_bytes(resp[p + 16..p + 20].try_into().unwrap()), 1);
}

#[test]
fn transfer_and_flush_emit_display_frame() {
    let frames: Arc<Mutex<Vec<DisplayFrame>>> = Arc::new(Mutex::new(Vec::new()));
    let mut s = setup();
    {
        let frames = frames.clone();
        s.gpu
            .lock()
            .unwrap()
            .set_frame_callback(Box::new(move |f| frames.lock().unwrap().push(f)));
    }

    s.create_resource(1, 16, 16);
    let backing = 0x150000u64;
    let pixels: Vec<u8> = (0..16 * 16 * 4u32).map(|i| i as u8).collect();
    s.mem.write(backing, &pixels).unwrap();
    s.attach_backing(1, backing, pixels.len() as u32);
    s.set_scanout(1, 16, 16);
    s.transfer(1, 0, 0, 16, 16, 0);
    s.flush_resource(1, 16, 16);

    let frames = frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert_eq!((frame.width, frame.height), (16, 16));
    assert_eq!((frame.dirty_x, frame.dirty_y), (0, 0));
    assert_eq!(frame.pixels, pixels);
}

#[test]
fn flush_of_non_scanout_resource_emits_nothing() {
    let frames: Arc<Mutex<Vec<DisplayFrame>>> = Arc::new(Mutex::new(Vec::new()));
    let mut s = setup();
    {
        let frames = frames.clone();
        s.gpu
            .lock()
            .unwrap()
            .set_frame_callback(Box::new(move |f| frames.lock().unwrap().push(f)));
    }
    s.create_resource(1, 16, 16);
    s.create_resource(2, 16, 16);
    s.set_scanout(1, 16, 16);
    s.flush_resource(2, 16, 16);
    assert!(frames.lock().unwrap().is_empty());
}

#[test]
fn unknown_resource_is_an_error() {
    let mut s = setup();
    let mut tail = Vec::new();
    tail.extend_from_slice(&[0u8; 16]);
    tail.extend_from_slice(&7u32.to_le_bytes());
    tail.extend_from_slice(&0u32.to_le_bytes());
    assert_eq!(
        s.simple_cmd(VIRTIO_GPU_CMD_RESOURCE_FLUSH, &tail),
        VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID
    );
}

#[test]
fn fenced_request_echoes_fence_in_response() {
    let mut s = setup();
    let mut req = vec![0u8; CTRL_HDR];
    req[0..4].copy_from_slice(&VIRTIO_GPU_CMD_GET_DISPLAY_INFO.to_le_bytes());
    req[4..8].copy_from_slice(&VIRTIO_GPU_FLAG_FENCE.to_le_bytes());
    req[8..16].copy_from_slice(&0x1234_5678u64.to_le_bytes());
    req[16..20].copy_from_slice(&9u32.to_le_bytes());

    let resp = s.roundtrip(0, &req, 4096);
    assert_ne!(u32::from_le_bytes(resp[4..8].try_into().unwrap()) & VIRTIO_GPU_FLAG_FENCE, 0);
    assert_eq!(u64::from_le_bytes(resp[8..16].try_into().unwrap()), 0x1234_5678);
    assert_eq!(u32::from_le_bytes(resp[16..20].try_into().unwrap()), 9);
}

#[test]
fn cursor_commands_forward_position_and_image() {
    let cursors = Arc::new(Mutex::new(Vec::new()));
    let mut s = setup();
    {
        let cursors = cursors.clone();
        s.gpu
            .lock()
            .unwrap()
            .set_cursor_callback(Box::new(move |c| cursors.lock().unwrap().push(c)));
    }

    s.create_resource(5, 8, 8);

    // UPDATE_CURSOR binds resource 5 at (10, 20), hotspot (1, 2).
    let mut req = vec![0u8; CTRL_HDR + 32];
    req[0..4].copy_from_slice(&VIRTIO_GPU_CMD_UPDATE_CURSOR.to_le_bytes());
    req[CTRL_HDR + 4..CTRL_HDR + 8].copy_from_slice(&10u32.to_le_bytes());
    req[CTRL_HDR + 8..CTRL_HDR + 12].copy_from_slice(&20u32.to_le_bytes());
    req[CTRL_HDR + 16..CTRL_HDR + 20].copy_from_slice(&5u32.to_le_bytes());
    req[CTRL_HDR + 20..CTRL_HDR + 24].copy_from_slice(&1u32.to_le_bytes());
    req[CTRL_HDR + 24..CTRL_HDR + 28].copy_from_slice(&2u32.to_le_bytes());
    s.roundtrip(1, &req, 64);

    // MOVE_CURSOR repositions only.
    let mut req = vec![0u8; CTRL_HDR + 32];
    req[0..4].copy_from_slice(&VIRTIO_GPU_CMD_MOVE_CURSOR.to_le_bytes());
    req[CTRL_HDR + 4..CTRL_HDR + 8].copy_from_slice(&30u32.to_le_bytes());
    req[CTRL_HDR + 8..CTRL_HDR + 12].copy_from_slice(&40u32.to_le_bytes());
    s.roundtrip(1, &req, 64);

    let cursors = cursors.lock().unwrap();
    assert_eq!(cursors.len(), 2);
    assert!(cursors[0].image_updated);
    assert_eq!((cursors[0].x, cursors[0].y), (10, 20));
    assert_eq!((cursors[0].hot_x, cursors[0].hot_y), (1, 2));
    assert_eq!((cursors[0].width, cursors[0].height), (8, 8));
    assert!(!cursors[1].image_updated);
    assert_eq!((cursors[1].x, cursors[1].y), (30, 40));
}

#[test]
fn set_display_size_aligns_width_and_raises_display_event() {
    let mut s = setup();
    s.gpu.lock().unwrap().set_display_size(1923, 1080);

    let events = s.mmio.mmio_read(REG_CONFIG, 4) as u32;
    assert_ne!(events & VIRTIO_GPU_EVENT_DISPLAY, 0);
    assert_ne!(s.mmio.mmio_read(REG_INTERRUPT_STATUS, 4) & 2, 0);

    let mut req = vec![0u8; CTRL_HDR];
    req[0..4].copy_from_slice(&VIRTIO_GPU_CMD_GET_DISPLAY_INFO.to_le_bytes());
    let resp = s.roundtrip(0, &req, 4096);
    let p = CTRL_HDR;
    assert_eq!(u32::from_le_bytes(resp[p + 8..p + 12].try_into().unwrap()), 1920);
    assert_eq!(u32::from_le_bytes(resp[p + 12..p + 16].try_into().unwrap()), 1080);
}

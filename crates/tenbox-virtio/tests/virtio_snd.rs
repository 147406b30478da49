use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tenbox_memory::{GuestMemory, GuestRam};
use tenbox_platform::ports::{AudioChunk, AudioPort};
use tenbox_platform::{Device, IrqLine, IrqSink};
use tenbox_virtio::devices::snd::{
    VirtioSnd, VIRTIO_SND_D_OUTPUT, VIRTIO_SND_PCM_FMT_S16, VIRTIO_SND_PCM_RATE_48000,
    VIRTIO_SND_R_PCM_INFO, VIRTIO_SND_R_PCM_PREPARE, VIRTIO_SND_R_PCM_SET_PARAMS,
    VIRTIO_SND_R_PCM_START, VIRTIO_SND_R_PCM_STOP, VIRTIO_SND_S_NOT_SUPP, VIRTIO_SND_S_OK,
};
use tenbox_virtio::{VirtioMmio, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};

const REG_QUEUE_SEL: u64 = 0x030;
const REG_QUEUE_NUM: u64 = 0x038;
const REG_QUEUE_READY: u64 = 0x044;
const REG_QUEUE_NOTIFY: u64 = 0x050;
const REG_STATUS: u64 = 0x070;
const REG_QUEUE_DESC_LOW: u64 = 0x080;
const REG_QUEUE_DRIVER_LOW: u64 = 0x090;
const REG_QUEUE_DEVICE_LOW: u64 = 0x0A0;
const REG_CONFIG: u64 = 0x100;

const CONTROL_QUEUE: u64 = 0;
const TX_QUEUE: u64 = 2;

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

#[derive(Default)]
struct CapturingAudio {
    chunks: Mutex<Vec<AudioChunk>>,
}

impl AudioPort for CapturingAudio {
    fn submit_pcm(&self, chunk: AudioChunk) {
        self.chunks.lock().unwrap().push(chunk);
    }
}

struct Setup {
    mmio: VirtioMmio,
    _snd: Arc<Mutex<VirtioSnd>>,
    audio: Arc<CapturingAudio>,
    mem: GuestRam,
    avail_idx: [u16; 4],
}

fn setup() -> Setup {
    let mem = GuestMemory::new(0x100000).view();
    let snd = Arc::new(Mutex::new(VirtioSnd::new()));
    let audio = Arc::new(CapturingAudio::default());
    snd.lock().unwrap().set_audio_port(audio.clone());
    let irqs = Arc::new(CountingSink::default());
    let mut mmio = VirtioMmio::new(snd.clone(), mem.clone(), IrqLine::new(11, irqs));

    mmio.mmio_write(REG_STATUS, 4, 0x0F);
    for q in 0..4u64 {
        let (desc, avail, used) = queue_base(q);
        mmio.mmio_write(REG_QUEUE_SEL, 4, q);
        mmio.mmio_write(REG_QUEUE_NUM, 4, 8);
        mmio.mmio_write(REG_QUEUE_DESC_LOW, 4, desc);
        mmio.mmio_write(REG_QUEUE_DRIVER_LOW, 4, avail);
        mmio.mmio_write(REG_QUEUE_DEVICE_LOW, 4, used);
        mmio.mmio_write(REG_QUEUE_READY, 4, 1);
    }

    Setup { mmio, _snd: snd, audio, mem, avail_idx: [0; 4] }
}

impl Setup {
    fn submit(&mut self, q: u64, head: u16, request: &[u8], resp_len: u32) {
        let (desc, avail, _) = queue_base(q);
        let req_addr = 0x80000 + u64::from(head) * 0x1000;
        let resp_addr = req_addr + 0x800;
        self.mem.write(req_addr, request).unwrap();

        let base = desc + u64::from(head) * 32;
        self.mem.write_u64_le(base, req_addr).unwrap();
        self.mem.write_u32_le(base + 8, request.len() as u32).unwrap();
        self.mem.write_u16_le(base + 12, VIRTQ_DESC_F_NEXT).unwrap();
        self.mem.write_u16_le(base + 14, head * 2 + 1).unwrap();
        let next = desc + u64::from(head) * 32 + 16;
        self.mem.write_u64_le(next, resp_addr).unwrap();
        self.mem.write_u32_le(next + 8, resp_len).unwrap();
        self.mem.write_u16_le(next + 12, VIRTQ_DESC_F_WRITE).unwrap();
        self.mem.write_u16_le(next + 14, 0).unwrap();

        let qi = q as usize;
        let slot = self.avail_idx[qi] % 8;
        self.mem
            .write_u16_le(avail + 4 + u64::from(slot) * 2, head * 2)
            .unwrap();
        self.avail_idx[qi] = self.avail_idx[qi].wrapping_add(1);
        self.mem.write_u16_le(avail + 2, self.avail_idx[qi]).unwrap();
        self.mmio.mmio_write(REG_QUEUE_NOTIFY, 4, q);
    }

    fn control(&mut self, request: &[u8]) -> Vec<u8> {
        self.submit(CONTROL_QUEUE, 0, request, 1024);
        let resp_addr = 0x80000 + 0x800;
        self.mem.read_vec(resp_addr, 1024).unwrap()
    }

    fn set_params(&mut self) {
        let mut req = vec![0u8; 24];
        req[0..4].copy_from_slice(&VIRTIO_SND_R_PCM_SET_PARAMS.to_le_bytes());
        req[8..12].copy_from_slice(&16384u32.to_le_bytes()); // buffer_bytes
        req[12..16].copy_from_slice(&4096u32.to_le_bytes()); // period_bytes
        req[20] = 2; // channels
        req[21] = VIRTIO_SND_PCM_FMT_S16;
        req[22] = VIRTIO_SND_PCM_RATE_48000;
        let resp = self.control(&req);
        assert_eq!(u32::from_le_bytes(resp[0..4].try_into().unwrap()), VIRTIO_SND_S_OK);
    }

    fn stream_cmd(&mut self, code: u32) {
        let mut req = vec![0u8; 8];
        req[0..4].copy_from_slice(&code.to_le_bytes());
        let resp = self.control(&req);
        assert_eq!(u32::from_le_bytes(resp[0..4].try_into().unwrap()), VIRTIO_SND_S_OK);
    }

    fn tx_used_count(&self) -> u16 {
        let (_, _, used) = queue_base(TX_QUEUE);
        self.mem.read_u16_le(used + 2).unwrap()
    }
}

#[test]
fn config_reports_one_stream_one_chmap_no_jacks() {
    let mut s = setup();
    assert_eq!(s.mmio.mmio_read(REG_CONFIG, 4), 0); // jacks
    assert_eq!(s.mmio.mmio_read(REG_CONFIG + 4, 4), 1); // streams
    assert_eq!(s.mmio.mmio_read(REG_CONFIG + 8, 4), 1); // chmaps
}

#[test]
fn pcm_info_reports_s16_48khz_stereo_output() {
    let mut s = setup();
    let mut req = vec![0u8; 16];
    req[0..4].copy_from_slice(&VIRTIO_SND_R_PCM_INFO.to_le_bytes());
    req[4..8].copy_from_slice(&0u32.to_le_bytes()); // start_id
    req[8..12].copy_from_slice(&1u32.to_le_bytes()); // count
    let resp = s.control(&req);

    assert_eq!(u32::from_le_bytes(resp[0..4].try_into().unwrap()), VIRTIO_SND_S_OK);
    let info = &resp[4..36];
    let formats = u64::from_le_bytes(info[8..16].try_into().unwrap());
    let rates = u64::from_le_bytes(info[16..24].try_into().unwrap());
    assert_eq!(formats, 1 << VIRTIO_SND_PCM_FMT_S16);
    assert_eq!(rates, 1 << VIRTIO_SND_PCM_RATE_48000);
    assert_eq!(info[24], VIRTIO_SND_D_OUTPUT);
    assert_eq!(info[25], 2);
    assert_eq!(info[26], 2);
}

#[test]
fn unknown_control_code_is_not_supported() {
    let mut s = setup();
    let mut req = vec![0u8; 8];
    req[0..4].copy_from_slice(&0x7777u32.to_le_bytes());
    let resp = s.control(&req);
    assert_eq!(u32::from_le_bytes(resp[0..4].try_into().unwrap()), VIRTIO_SND_S_NOT_SUPP);
}

#[test]
fn running_stream_meters_pcm_to_the_audio_port() {
    let mut s = setup();
    s.set_params();
    s.stream_cmd(VIRTIO_SND_R_PCM_PREPARE);
    s.stream_cmd(VIRTIO_SND_R_PCM_START);

    // One TX buffer: xfer header (stream 0) + 512 samples.
    let samples: Vec<i16> = (0..512i16).collect();
    let mut tx = vec![0u8; 4];
    tx.extend(samples.iter().flat_map(|v| v.to_le_bytes()));
    s.submit(TX_QUEUE, 1, &tx, 8);

    // The period timer should consume and return the buffer.
    let deadline = Instant::now() + Duration::from_secs(5);
    while s.tx_used_count() == 0 {
        assert!(Instant::now() < deadline, "TX buffer never completed");
        std::thread::sleep(Duration::from_millis(5));
    }

    s.stream_cmd(VIRTIO_SND_R_PCM_STOP);

    let chunks = s.audio.chunks.lock().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].sample_rate, 48_000);
    assert_eq!(chunks[0].channels, 2);
    assert_eq!(chunks[0].pcm, samples);
}

#[test]
fn stop_flushes_outstanding_tx_buffers() {
    let mut s = setup();
    s.set_params();
    s.stream_cmd(VIRTIO_SND_R_PCM_PREPARE);

    // Queue TX while prepared but not running: nothing drains it yet.
    let tx = vec![0u8; 4 + 256];
    s.submit(TX_QUEUE, 1, &tx, 8);
    assert_eq!(s.tx_used_count(), 0);

    // STOP completes the stranded buffer.
    s.stream_cmd(VIRTIO_SND_R_PCM_STOP);
    assert_eq!(s.tx_used_count(), 1);
}

#[test]
fn tx_before_prepare_completes_immediately() {
    let mut s = setup();
    let tx = vec![0u8; 4 + 64];
    s.submit(TX_QUEUE, 1, &tx, 8);
    assert_eq!(s.tx_used_count(), 1);
    assert!(s.audio.chunks.lock().unwrap().is_empty());
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use tenbox_platform::ports::{AudioChunk, AudioPort};
use tracing::info;

use crate::mmio::{QueueHandle, VirtioDevice};
use crate::queue::{ChainReader, ChainWriter};
use crate::{VIRTIO_F_VERSION_1, VIRTIO_ID_SOUND};

// Control request codes (virtio 1.2, 5.14.6).
pub const VIRTIO_SND_R_JACK_INFO: u32 = 0x0001;
pub const VIRTIO_SND_R_PCM_INFO: u32 = 0x0100;
pub const VIRTIO_SND_R_PCM_SET_PARAMS: u32 = 0x0101;
pub const VIRTIO_SND_R_PCM_PREPARE: u32 = 0x0102;
pub const VIRTIO_SND_R_PCM_RELEASE: u32 = 0x0103;
pub const VIRTIO_SND_R_PCM_START: u32 = 0x0104;
pub const VIRTIO_SND_R_PCM_STOP: u32 = 0x0105;
pub const VIRTIO_SND_R_CHMAP_INFO: u32 = 0x0200;

pub const VIRTIO_SND_S_OK: u32 = 0x8000;
pub const VIRTIO_SND_S_BAD_MSG: u32 = 0x8001;
pub const VIRTIO_SND_S_NOT_SUPP: u32 = 0x8002;

pub const VIRTIO_SND_D_OUTPUT: u8 = 0;
pub const VIRTIO_SND_PCM_FMT_S16: u8 = 5;
pub const VIRTIO_SND_PCM_RATE_48000: u8 = 7;
const VIRTIO_SND_CHMAP_FL: u8 = 3;
const VIRTIO_SND_CHMAP_FR: u8 = 4;

const CONTROL_QUEUE: usize = 0;
const EVENT_QUEUE: usize = 1;
const TX_QUEUE: usize = 2;
const RX_QUEUE: usize = 3;
const QUEUE_SIZE: u16 = 128;

const HDR_SIZE: usize = 4;
const PCM_XFER_SIZE: usize = 4;
const PCM_STATUS_SIZE: u32 = 8;
const PCM_INFO_SIZE: usize = 32;
const CHMAP_INFO_SIZE: usize = 24;

/// Playback falls this far behind wall clock before the pacing resets.
const RESET_BEHIND_MS: i64 = 200;

#[derive(Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Idle,
    Prepared,
    Running,
}

#[derive(Clone, Copy)]
struct PcmParams {
    sample_rate: u32,
    channels: u8,
    format: u8,
    buffer_bytes: u32,
    period_bytes: u32,
}

impl Default for PcmParams {
    fn default() -> Self {
        PcmParams {
            sample_rate: 48_000,
            channels: 2,
            format: VIRTIO_SND_PCM_FMT_S16,
            buffer_bytes: 0,
            period_bytes: 0,
        }
    }
}

struct PendingTx {
    head: u16,
    pcm: Vec<i16>,
}

/// State the period-timer thread shares with the device. Kept outside the
/// device mutex so stopping the timer from a control request cannot
/// deadlock against a timer tick.
struct SndShared {
    pending: Mutex<VecDeque<PendingTx>>,
    params: Mutex<PcmParams>,
    tx_queue: Mutex<Option<QueueHandle>>,
    running: AtomicBool,
    sleep_lock: Mutex<()>,
    sleep_cv: Condvar,
    audio: Mutex<Option<Arc<dyn AudioPort>>>,
}

impl SndShared {
    fn sleep_ms(&self, ms: u64) {
        let guard = self.sleep_lock.lock().unwrap();
        let _ = self
            .sleep_cv
            .wait_timeout(guard, std::time::Duration::from_millis(ms))
            .unwrap();
    }

    fn return_buffer(&self, head: u16) {
        if let Some(handle) = self.tx_queue.lock().unwrap().clone() {
            handle.push_used(head, PCM_STATUS_SIZE);
            handle.interrupt().signal_used_buffer();
        }
    }
}

/// Virtio sound device: a single 48 kHz S16 stereo output stream. TX
/// buffers queue up in the device and a period-timer thread meters them
/// out to the host audio port at real-time rate.
pub struct VirtioSnd {
    shared: Arc<SndShared>,
    state: StreamState,
    timer: Option<JoinHandle<()>>,
    queues: [Option<QueueHandle>; 4],
}

impl VirtioSnd {
    pub fn new() -> Self {
        VirtioSnd {
            shared: Arc::new(SndShared {
                pending: Mutex::new(VecDeque::new()),
                params: Mutex::new(PcmParams::default()),
                tx_queue: Mutex::new(None),
                running: AtomicBool::new(false),
                sleep_lock: Mutex::new(()),
                sleep_cv: Condvar::new(),
                audio: Mutex::new(None),
            }),
            state: StreamState::Idle,
            timer: None,
            queues: [None, None, None, None],
        }
    }

    pub fn set_audio_port(&mut self, port: Arc<dyn AudioPort>) {
        *self.shared.audio.lock().unwrap() = Some(port);
    }

    fn start_period_timer(&mut self) {
        self.stop_period_timer();
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        self.timer = Some(std::thread::spawn(move || period_timer_loop(&shared)));
    }

    fn stop_period_timer(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.sleep_cv.notify_all();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }

    /// Complete every queued TX buffer immediately (stream stop/release).
    fn flush_pending_tx(&mut self) {
        let drained: Vec<PendingTx> = {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        if let Some(handle) = self.shared.tx_queue.lock().unwrap().clone() {
            for buf in &drained {
                handle.push_used(buf.head, PCM_STATUS_SIZE);
            }
            handle.interrupt().signal_used_buffer();
        }
    }

    fn handle_pcm_info(&self, req: &[u8], resp: &mut Vec<u8>) {
        // virtio_snd_query_info: code, start_id, count, size
        if req.len() < 16 {
            resp.extend_from_slice(&VIRTIO_SND_S_BAD_MSG.to_le_bytes());
            return;
        }
        let start_id = u32::from_le_bytes(req[4..8].try_into().unwrap());
        let count = u32::from_le_bytes(req[8..12].try_into().unwrap());

        resp.extend_from_slice(&VIRTIO_SND_S_OK.to_le_bytes());
        if start_id >= 1 || count == 0 {
            return;
        }

        let mut entry = [0u8; PCM_INFO_SIZE];
        // features = 0, hda_fn_nid = 0
        entry[8..16].copy_from_slice(&(1u64 << VIRTIO_SND_PCM_FMT_S16).to_le_bytes());
        entry[16..24].copy_from_slice(&(1u64 << VIRTIO_SND_PCM_RATE_48000).to_le_bytes());
        entry[24] = VIRTIO_SND_D_OUTPUT;
        entry[25] = 2; // channels_min
        entry[26] = 2; // channels_max
        resp.extend_from_slice(&entry);
    }

    fn handle_pcm_set_params(&self, req: &[u8], resp: &mut Vec<u8>) {
        // virtio_snd_pcm_set_params: pcm_hdr(8) + buffer_bytes + period_bytes
        // + features + channels + format + rate + pad
        if req.len() < 24 {
            resp.extend_from_slice(&VIRTIO_SND_S_BAD_MSG.to_le_bytes());
            return;
        }
        let stream_id = u32::from_le_bytes(req[4..8].try_into().unwrap());
        if stream_id != 0 {
            resp.extend_from_slice(&VIRTIO_SND_S_BAD_MSG.to_le_bytes());
            return;
        }

        let mut params = self.shared.params.lock().unwrap();
        params.buffer_bytes = u32::from_le_bytes(req[8..12].try_into().unwrap());
        params.period_bytes = u32::from_le_bytes(req[12..16].try_into().unwrap());
        params.channels = req[20];
        params.format = req[21];
        params.sample_rate = rate_enum_to_hz(req[22]);
        info!(
            rate = params.sample_rate,
            channels = params.channels,
            format = params.format,
            buffer = params.buffer_bytes,
            period = params.period_bytes,
            "virtio-snd set params"
        );
        resp.extend_from_slice(&VIRTIO_SND_S_OK.to_le_bytes());
    }

    fn handle_stream_cmd(&mut self, code: u32, req: &[u8], resp: &mut Vec<u8>) {
        let stream_id = if req.len() >= 8 {
            u32::from_le_bytes(req[4..8].try_into().unwrap())
        } else {
            0
        };
        if stream_id != 0 {
            resp.extend_from_slice(&VIRTIO_SND_S_BAD_MSG.to_le_bytes());
            return;
        }

        match code {
            VIRTIO_SND_R_PCM_PREPARE => {
                self.stop_period_timer();
                self.state = StreamState::Prepared;
            }
            VIRTIO_SND_R_PCM_START => {
                self.state = StreamState::Running;
                self.start_period_timer();
            }
            VIRTIO_SND_R_PCM_STOP => {
                self.stop_period_timer();
                self.flush_pending_tx();
                self.state = StreamState::Prepared;
            }
            VIRTIO_SND_R_PCM_RELEASE => {
                self.stop_period_timer();
                self.flush_pending_tx();
                self.state = StreamState::Idle;
            }
            _ => {}
        }
        resp.extend_from_slice(&VIRTIO_SND_S_OK.to_le_bytes());
    }

    fn handle_chmap_info(&self, req: &[u8], resp: &mut Vec<u8>) {
        if req.len() < 16 {
            resp.extend_from_slice(&VIRTIO_SND_S_BAD_MSG.to_le_bytes());
            return;
        }
        let start_id = u32::from_le_bytes(req[4..8].try_into().unwrap());
        let count = u32::from_le_bytes(req[8..12].try_into().unwrap());

        resp.extend_from_slice(&VIRTIO_SND_S_OK.to_le_bytes());
        if start_id >= 1 || count == 0 {
            return;
        }

        let mut entry = [0u8; CHMAP_INFO_SIZE];
        entry[4] = VIRTIO_SND_D_OUTPUT;
        entry[5] = 2;
        entry[6] = VIRTIO_SND_CHMAP_FL;
        entry[7] = VIRTIO_SND_CHMAP_FR;
        resp.extend_from_slice(&entry);
    }

    fn process_control_queue(&mut self, handle: &QueueHandle) {
        while let Some((head, chain)) = handle.pop_chain() {
            if chain.is_empty() {
                continue;
            }
            let req = ChainReader::new(handle.mem(), &chain).read_all();
            if req.len() < HDR_SIZE {
                handle.push_used(head, 0);
                continue;
            }
            let code = u32::from_le_bytes(req[0..4].try_into().unwrap());

            let mut resp = Vec::new();
            match code {
                VIRTIO_SND_R_JACK_INFO => {
                    // No jacks to describe.
                    resp.extend_from_slice(&VIRTIO_SND_S_OK.to_le_bytes());
                }
                VIRTIO_SND_R_PCM_INFO => self.handle_pcm_info(&req, &mut resp),
                VIRTIO_SND_R_PCM_SET_PARAMS => self.handle_pcm_set_params(&req, &mut resp),
                VIRTIO_SND_R_PCM_PREPARE
                | VIRTIO_SND_R_PCM_START
                | VIRTIO_SND_R_PCM_STOP
                | VIRTIO_SND_R_PCM_RELEASE => self.handle_stream_cmd(code, &req, &mut resp),
                VIRTIO_SND_R_CHMAP_INFO => self.handle_chmap_info(&req, &mut resp),
                _ => resp.extend_from_slice(&VIRTIO_SND_S_NOT_SUPP.to_le_bytes()),
            }

            let mut writer = ChainWriter::new(handle.mem(), &chain);
            writer.write(&resp);
            handle.push_used(head, writer.written());
        }
        handle.interrupt().signal_used_buffer();
    }

    fn process_tx_queue(&mut self, handle: &QueueHandle) {
        let format_is_s16 =
            self.shared.params.lock().unwrap().format == VIRTIO_SND_PCM_FMT_S16;
        // TX before PREPARE has nowhere to go; complete it immediately.
        let accept = self.state != StreamState::Idle;

        let mut completed_immediately = false;
        while let Some((head, chain)) = handle.pop_chain() {
            if chain.is_empty() {
                continue;
            }

            // Write the status (OK, zero latency) up front; the buffer is
            // pushed used later, once the timer has consumed it.
            let status = VIRTIO_SND_S_OK.to_le_bytes();
            let mut writer = ChainWriter::new(handle.mem(), &chain);
            writer.write(&status);
            writer.write(&0u32.to_le_bytes());

            if !accept {
                handle.push_used(head, PCM_STATUS_SIZE);
                completed_immediately = true;
                continue;
            }

            let mut pcm = Vec::new();
            if format_is_s16 {
                let raw = ChainReader::new(handle.mem(), &chain).read_all();
                if raw.len() > PCM_XFER_SIZE {
                    pcm = raw[PCM_XFER_SIZE..]
                        .chunks_exact(2)
                        .map(|c| i16::from_le_bytes([c[0], c[1]]))
                        .collect();
                }
            }

            self.shared.pending.lock().unwrap().push_back(PendingTx { head, pcm });
        }
        if completed_immediately {
            handle.interrupt().signal_used_buffer();
        }
    }
}

impl Default for VirtioSnd {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VirtioSnd {
    fn drop(&mut self) {
        self.stop_period_timer();
    }
}

fn rate_enum_to_hz(rate: u8) -> u32 {
    match rate {
        1 => 8_000,
        2 => 11_025,
        3 => 16_000,
        4 => 22_050,
        5 => 32_000,
        6 => 44_100,
        7 => 48_000,
        10 => 96_000,
        _ => 48_000,
    }
}

fn period_timer_loop(shared: &SndShared) {
    let mut start = Instant::now();
    let mut bytes_processed: u64 = 0;

    while shared.running.load(Ordering::SeqCst) {
        let params = *shared.params.lock().unwrap();
        if params.sample_rate == 0 || params.period_bytes == 0 || params.channels == 0 {
            shared.sleep_ms(10);
            continue;
        }
        let bytes_per_second = u64::from(params.sample_rate) * u64::from(params.channels) * 2;

        // Positive drift: playback is ahead of wall clock, sleep it off.
        let elapsed_ms = start.elapsed().as_millis() as i64;
        let audio_ms = (bytes_processed * 1000 / bytes_per_second) as i64;
        let drift_ms = audio_ms - elapsed_ms;
        if drift_ms > 0 {
            shared.sleep_ms(drift_ms.min(10) as u64);
            continue;
        }
        if drift_ms < -RESET_BEHIND_MS {
            start = Instant::now();
            bytes_processed = 0;
            continue;
        }

        let Some(buf) = shared.pending.lock().unwrap().pop_front() else {
            shared.sleep_ms(1);
            continue;
        };

        let pcm_bytes = (buf.pcm.len() * 2) as u64;
        if !buf.pcm.is_empty() {
            if let Some(audio) = shared.audio.lock().unwrap().clone() {
                audio.submit_pcm(AudioChunk {
                    sample_rate: params.sample_rate,
                    channels: u16::from(params.channels),
                    pcm: buf.pcm,
                });
            }
        }
        bytes_processed += if pcm_bytes > 0 { pcm_bytes } else { u64::from(params.period_bytes) };

        shared.return_buffer(buf.head);
    }
}

impl VirtioDevice for VirtioSnd {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_SOUND
    }

    fn device_features(&self) -> u64 {
        VIRTIO_F_VERSION_1
    }

    fn num_queues(&self) -> usize {
        4
    }

    fn queue_max_size(&self, _queue: usize) -> u16 {
        QUEUE_SIZE
    }

    fn read_config(&mut self, offset: u64, data: &mut [u8]) {
        // { jacks, streams, chmaps }
        let mut cfg = [0u8; 12];
        cfg[4..8].copy_from_slice(&1u32.to_le_bytes());
        cfg[8..12].copy_from_slice(&1u32.to_le_bytes());
        data.fill(0);
        if let Ok(off) = usize::try_from(offset) {
            if off < cfg.len() {
                let n = data.len().min(cfg.len() - off);
                data[..n].copy_from_slice(&cfg[off..off + n]);
            }
        }
    }

    fn on_queue_ready(&mut self, queue: usize, handle: QueueHandle) {
        if queue == TX_QUEUE {
            *self.shared.tx_queue.lock().unwrap() = Some(handle.clone());
        }
        if queue < 4 {
            self.queues[queue] = Some(handle);
        }
    }

    fn on_queue_notify(&mut self, queue: usize) {
        match queue {
            CONTROL_QUEUE => {
                if let Some(handle) = self.queues[CONTROL_QUEUE].clone() {
                    self.process_control_queue(&handle);
                }
            }
            TX_QUEUE => {
                if let Some(handle) = self.queues[TX_QUEUE].clone() {
                    self.process_tx_queue(&handle);
                }
            }
            // Event buffers are just parked; RX (capture) is not offered.
            EVENT_QUEUE | RX_QUEUE => {}
            _ => {}
        }
    }

    fn on_reset(&mut self) {
        self.stop_period_timer();
        self.state = StreamState::Idle;
        *self.shared.params.lock().unwrap() = PcmParams::default();
        self.shared.pending.lock().unwrap().clear();
        *self.shared.tx_queue.lock().unwrap() = None;
        self.queues = [None, None, None, None];
    }
}

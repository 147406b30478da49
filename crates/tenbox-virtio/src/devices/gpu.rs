use std::collections::HashMap;

use tenbox_memory::GuestRam;
use tenbox_platform::ports::{CursorInfo, DisplayFrame};
use tracing::debug;

use crate::mmio::{QueueHandle, VirtioDevice, VirtioInterrupt};
use crate::queue::{ChainReader, ChainWriter};
use crate::{VIRTIO_F_VERSION_1, VIRTIO_ID_GPU};

// Control commands (virtio 1.2, 5.7.6).
pub const VIRTIO_GPU_CMD_GET_DISPLAY_INFO: u32 = 0x0100;
pub const VIRTIO_GPU_CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
pub const VIRTIO_GPU_CMD_RESOURCE_UNREF: u32 = 0x0102;
pub const VIRTIO_GPU_CMD_SET_SCANOUT: u32 = 0x0103;
pub const VIRTIO_GPU_CMD_RESOURCE_FLUSH: u32 = 0x0104;
pub const VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
pub const VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;
pub const VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING: u32 = 0x0107;
pub const VIRTIO_GPU_CMD_UPDATE_CURSOR: u32 = 0x0300;
pub const VIRTIO_GPU_CMD_MOVE_CURSOR: u32 = 0x0301;

pub const VIRTIO_GPU_RESP_OK_NODATA: u32 = 0x1100;
pub const VIRTIO_GPU_RESP_OK_DISPLAY_INFO: u32 = 0x1101;
pub const VIRTIO_GPU_RESP_ERR_UNSPEC: u32 = 0x1200;
pub const VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID: u32 = 0x1202;
pub const VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER: u32 = 0x1203;

pub const VIRTIO_GPU_FLAG_FENCE: u32 = 1;
pub const VIRTIO_GPU_EVENT_DISPLAY: u32 = 1 << 0;

const CTRL_HDR_SIZE: usize = 24;
const MAX_DIMENSION: u32 = 16384;
const MAX_BACKING_ENTRIES: u32 = 16384;
const MAX_BACKING_ENTRY_LEN: u32 = 64 * 1024 * 1024;
const BYTES_PER_PIXEL: u32 = 4;

const CONTROL_QUEUE: usize = 0;
const CURSOR_QUEUE: usize = 1;
const QUEUE_SIZE: u16 = 256;

pub type FrameCallback = Box<dyn Fn(DisplayFrame) + Send>;
pub type CursorCallback = Box<dyn Fn(CursorInfo) + Send>;
pub type ScanoutStateCallback = Box<dyn Fn(bool, u32, u32) + Send>;

struct GpuResource {
    width: u32,
    height: u32,
    format: u32,
    host_pixels: Vec<u8>,
    backing: Vec<(u64, u32)>,
}

fn read_le_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_le_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Virtio 2D GPU: one scanout mirrored to the host display port.
pub struct VirtioGpu {
    display_width: u32,
    display_height: u32,
    events_read: u32,
    resources: HashMap<u32, GpuResource>,
    scanout_resource_id: u32,
    scanout_width: u32,
    scanout_height: u32,
    cursor_resource_id: u32,
    cursor_x: i32,
    cursor_y: i32,
    cursor_hot_x: u32,
    cursor_hot_y: u32,
    mem: Option<GuestRam>,
    interrupt: Option<VirtioInterrupt>,
    queues: [Option<QueueHandle>; 2],
    frame_callback: Option<FrameCallback>,
    cursor_callback: Option<CursorCallback>,
    scanout_state_callback: Option<ScanoutStateCallback>,
}

impl VirtioGpu {
    pub fn new(width: u32, height: u32) -> Self {
        VirtioGpu {
            display_width: width,
            display_height: height,
            events_read: 0,
            resources: HashMap::new(),
            scanout_resource_id: 0,
            scanout_width: 0,
            scanout_height: 0,
            cursor_resource_id: 0,
            cursor_x: 0,
            cursor_y: 0,
            cursor_hot_x: 0,
            cursor_hot_y: 0,
            mem: None,
            interrupt: None,
            queues: [None, None],
            frame_callback: None,
            cursor_callback: None,
            scanout_state_callback: None,
        }
    }

    pub fn set_frame_callback(&mut self, cb: FrameCallback) {
        self.frame_callback = Some(cb);
    }

    pub fn set_cursor_callback(&mut self, cb: CursorCallback) {
        self.cursor_callback = Some(cb);
    }

    pub fn set_scanout_state_callback(&mut self, cb: ScanoutStateCallback) {
        self.scanout_state_callback = Some(cb);
    }

    /// Resize the advertised display mode. Width is aligned down to 8
    /// pixels for DRM drivers; the guest learns about the change through
    /// the DISPLAY event plus a config-change interrupt.
    pub fn set_display_size(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return;
        }
        let width = width & !7;
        if width == self.display_width && height == self.display_height {
            return;
        }
        self.display_width = width;
        self.display_height = height;
        self.events_read |= VIRTIO_GPU_EVENT_DISPLAY;
        if let Some(interrupt) = &self.interrupt {
            interrupt.signal_config_change();
        }
    }

    fn copy_from_backing(&self, backing: &[(u64, u32)], mut offset: u64, mut len: u32, out: &mut [u8]) {
        let Some(mem) = &self.mem else { return };
        let mut out_pos = 0usize;
        let mut page_start = 0u64;
        for (gpa, page_len) in backing {
            if len == 0 {
                break;
            }
            let page_end = page_start + u64::from(*page_len);
            if offset < page_end {
                let skip = offset - page_start;
                let avail = (u64::from(*page_len) - skip) as u32;
                let n = avail.min(len);
                if mem
                    .read(*gpa + skip, &mut out[out_pos..out_pos + n as usize])
                    .is_err()
                {
                    out[out_pos..out_pos + n as usize].fill(0);
                }
                out_pos += n as usize;
                offset += u64::from(n);
                len -= n;
            }
            page_start = page_end;
        }
    }

    fn response_nodata(code: u32) -> Vec<u8> {
        let mut resp = vec![0u8; CTRL_HDR_SIZE];
        resp[0..4].copy_from_slice(&code.to_le_bytes());
        resp
    }

    fn cmd_get_display_info(&self) -> Vec<u8> {
        // Header + 16 pmodes of 24 bytes each.
        let mut resp = vec![0u8; CTRL_HDR_SIZE + 16 * 24];
        resp[0..4].copy_from_slice(&VIRTIO_GPU_RESP_OK_DISPLAY_INFO.to_le_bytes());
        let p = CTRL_HDR_SIZE;
        resp[p + 8..p + 12].copy_from_slice(&self.display_width.to_le_bytes());
        resp[p + 12..p + 16].copy_from_slice(&self.display_height.to_le_bytes());
        resp[p + 16..p + 20].copy_from_slice(&1u32.to_le_bytes()); // enabled
        resp
    }

    fn cmd_resource_create_2d(&mut self, req: &[u8]) -> Vec<u8> {
        if req.len() < CTRL_HDR_SIZE + 16 {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }
        let resource_id = read_le_u32(req, CTRL_HDR_SIZE);
        let format = read_le_u32(req, CTRL_HDR_SIZE + 4);
        let width = read_le_u32(req, CTRL_HDR_SIZE + 8);
        let height = read_le_u32(req, CTRL_HDR_SIZE + 12);

        if resource_id == 0
            || width == 0
            || height == 0
            || width > MAX_DIMENSION
            || height > MAX_DIMENSION
        {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }

        let pixels = vec![0u8; (width as usize) * (height as usize) * BYTES_PER_PIXEL as usize];
        self.resources.insert(
            resource_id,
            GpuResource {
                width,
                height,
                format,
                host_pixels: pixels,
                backing: Vec::new(),
            },
        );
        Self::response_nodata(VIRTIO_GPU_RESP_OK_NODATA)
    }

    fn cmd_resource_unref(&mut self, req: &[u8]) -> Vec<u8> {
        if req.len() < CTRL_HDR_SIZE + 4 {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }
        let resource_id = read_le_u32(req, CTRL_HDR_SIZE);
        if self.resources.remove(&resource_id).is_none() {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID);
        }
        if self.scanout_resource_id == resource_id {
            self.scanout_resource_id = 0;
        }
        Self::response_nodata(VIRTIO_GPU_RESP_OK_NODATA)
    }

    fn cmd_set_scanout(&mut self, req: &[u8]) -> Vec<u8> {
        if req.len() < CTRL_HDR_SIZE + 24 {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }
        let scanout_id = read_le_u32(req, CTRL_HDR_SIZE + 16);
        let resource_id = read_le_u32(req, CTRL_HDR_SIZE + 20);
        if scanout_id != 0 {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }

        let old_resource = self.scanout_resource_id;
        let (old_w, old_h) = (self.scanout_width, self.scanout_height);

        if resource_id == 0 {
            self.scanout_resource_id = 0;
            self.scanout_width = 0;
            self.scanout_height = 0;
            if old_resource != 0 {
                if let Some(cb) = &self.scanout_state_callback {
                    cb(false, 0, 0);
                }
            }
            return Self::response_nodata(VIRTIO_GPU_RESP_OK_NODATA);
        }

        let Some(res) = self.resources.get(&resource_id) else {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID);
        };
        self.scanout_resource_id = resource_id;
        self.scanout_width = res.width;
        self.scanout_height = res.height;

        let activated = old_resource == 0;
        let resized = self.scanout_width != old_w || self.scanout_height != old_h;
        if activated || resized {
            if let Some(cb) = &self.scanout_state_callback {
                cb(true, self.scanout_width, self.scanout_height);
            }
        }
        Self::response_nodata(VIRTIO_GPU_RESP_OK_NODATA)
    }

    fn cmd_transfer_to_host_2d(&mut self, req: &[u8]) -> Vec<u8> {
        if req.len() < CTRL_HDR_SIZE + 32 {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }
        let rx = read_le_u32(req, CTRL_HDR_SIZE);
        let ry = read_le_u32(req, CTRL_HDR_SIZE + 4);
        let mut rw = read_le_u32(req, CTRL_HDR_SIZE + 8);
        let mut rh = read_le_u32(req, CTRL_HDR_SIZE + 12);
        let src_offset = read_le_u64(req, CTRL_HDR_SIZE + 16);
        let resource_id = read_le_u32(req, CTRL_HDR_SIZE + 24);

        let Some(res) = self.resources.get(&resource_id) else {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID);
        };
        if rx >= res.width || ry >= res.height {
            return Self::response_nodata(VIRTIO_GPU_RESP_OK_NODATA);
        }
        rw = rw.min(res.width - rx);
        rh = rh.min(res.height - ry);

        let stride = res.width * BYTES_PER_PIXEL;
        let total_backing: u64 = res.backing.iter().map(|(_, len)| u64::from(*len)).sum();
        let backing = res.backing.clone();
        let pixels_len = res.host_pixels.len();

        // Blit row by row from backing pages into the host pixel buffer,
        // clamped to both the resource extents and the backing length.
        let mut rows: Vec<(u64, usize, u32)> = Vec::new();
        for row in 0..rh {
            let src_row = src_offset + u64::from(row) * u64::from(stride);
            let dst = (u64::from(ry + row) * u64::from(stride)
                + u64::from(rx) * u64::from(BYTES_PER_PIXEL)) as usize;
            let row_bytes = rw * BYTES_PER_PIXEL;
            if src_row + u64::from(row_bytes) > total_backing {
                break;
            }
            if dst + row_bytes as usize > pixels_len {
                break;
            }
            rows.push((src_row, dst, row_bytes));
        }

        for (src_row, dst, row_bytes) in rows {
            let mut tmp = vec![0u8; row_bytes as usize];
            self.copy_from_backing(&backing, src_row, row_bytes, &mut tmp);
            let res = self.resources.get_mut(&resource_id).unwrap();
            res.host_pixels[dst..dst + row_bytes as usize].copy_from_slice(&tmp);
        }

        Self::response_nodata(VIRTIO_GPU_RESP_OK_NODATA)
    }

    fn cmd_resource_flush(&mut self, req: &[u8]) -> Vec<u8> {
        if req.len() < CTRL_HDR_SIZE + 24 {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }
        let dx = read_le_u32(req, CTRL_HDR_SIZE);
        let dy = read_le_u32(req, CTRL_HDR_SIZE + 4);
        let mut dw = read_le_u32(req, CTRL_HDR_SIZE + 8);
        let mut dh = read_le_u32(req, CTRL_HDR_SIZE + 12);
        let resource_id = read_le_u32(req, CTRL_HDR_SIZE + 16);

        let Some(res) = self.resources.get(&resource_id) else {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID);
        };

        if resource_id == self.scanout_resource_id && self.frame_callback.is_some() {
            if dx >= res.width || dy >= res.height {
                return Self::response_nodata(VIRTIO_GPU_RESP_OK_NODATA);
            }
            dw = dw.min(res.width - dx);
            dh = dh.min(res.height - dy);
            let full_stride = res.width * BYTES_PER_PIXEL;

            let mut frame = DisplayFrame {
                width: dw,
                height: dh,
                stride: dw * BYTES_PER_PIXEL,
                format: res.format,
                resource_width: res.width,
                resource_height: res.height,
                dirty_x: dx,
                dirty_y: dy,
                pixels: Vec::new(),
            };

            if dx == 0 && dy == 0 && dw == res.width && dh == res.height {
                frame.pixels = res.host_pixels.clone();
            } else {
                frame.pixels = vec![0u8; (dw as usize) * (dh as usize) * BYTES_PER_PIXEL as usize];
                for row in 0..dh {
                    let src = (u64::from(dy + row) * u64::from(full_stride)
                        + u64::from(dx) * u64::from(BYTES_PER_PIXEL)) as usize;
                    let dst = (row * dw * BYTES_PER_PIXEL) as usize;
                    let row_bytes = (dw * BYTES_PER_PIXEL) as usize;
                    if src + row_bytes > res.host_pixels.len() {
                        break;
                    }
                    frame.pixels[dst..dst + row_bytes]
                        .copy_from_slice(&res.host_pixels[src..src + row_bytes]);
                }
            }

            if let Some(cb) = &self.frame_callback {
                cb(frame);
            }
        }

        Self::response_nodata(VIRTIO_GPU_RESP_OK_NODATA)
    }

    fn cmd_attach_backing(&mut self, req: &[u8]) -> Vec<u8> {
        if req.len() < CTRL_HDR_SIZE + 8 {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }
        let resource_id = read_le_u32(req, CTRL_HDR_SIZE);
        let nr_entries = read_le_u32(req, CTRL_HDR_SIZE + 4);

        if !self.resources.contains_key(&resource_id) {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID);
        }
        if nr_entries > MAX_BACKING_ENTRIES {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }

        let entries_off = CTRL_HDR_SIZE + 8;
        let needed = nr_entries as usize * 16;
        if req.len() < entries_off + needed {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }

        let mut backing = Vec::with_capacity(nr_entries as usize);
        for i in 0..nr_entries as usize {
            let gpa = read_le_u64(req, entries_off + i * 16);
            let len = read_le_u32(req, entries_off + i * 16 + 8);
            if len == 0 || len > MAX_BACKING_ENTRY_LEN {
                return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
            }
            backing.push((gpa, len));
        }

        self.resources.get_mut(&resource_id).unwrap().backing = backing;
        Self::response_nodata(VIRTIO_GPU_RESP_OK_NODATA)
    }

    fn cmd_detach_backing(&mut self, req: &[u8]) -> Vec<u8> {
        if req.len() < CTRL_HDR_SIZE + 4 {
            return Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }
        let resource_id = read_le_u32(req, CTRL_HDR_SIZE);
        match self.resources.get_mut(&resource_id) {
            Some(res) => {
                res.backing.clear();
                Self::response_nodata(VIRTIO_GPU_RESP_OK_NODATA)
            }
            None => Self::response_nodata(VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID),
        }
    }

    fn process_control_queue(&mut self, handle: &QueueHandle) {
        while let Some((head, chain)) = handle.pop_chain() {
            if chain.is_empty() {
                continue;
            }
            let req = ChainReader::new(handle.mem(), &chain).read_all();
            if req.len() < CTRL_HDR_SIZE {
                handle.push_used(head, 0);
                continue;
            }
            let cmd = read_le_u32(&req, 0);
            let flags = read_le_u32(&req, 4);
            let fence_id = read_le_u64(&req, 8);
            let ctx_id = read_le_u32(&req, 16);

            let mut resp = match cmd {
                VIRTIO_GPU_CMD_GET_DISPLAY_INFO => self.cmd_get_display_info(),
                VIRTIO_GPU_CMD_RESOURCE_CREATE_2D => self.cmd_resource_create_2d(&req),
                VIRTIO_GPU_CMD_RESOURCE_UNREF => self.cmd_resource_unref(&req),
                VIRTIO_GPU_CMD_SET_SCANOUT => self.cmd_set_scanout(&req),
                VIRTIO_GPU_CMD_RESOURCE_FLUSH => self.cmd_resource_flush(&req),
                VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D => self.cmd_transfer_to_host_2d(&req),
                VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING => self.cmd_attach_backing(&req),
                VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING => self.cmd_detach_backing(&req),
                other => {
                    debug!(cmd = format_args!("{other:#x}"), "virtio-gpu unknown command");
                    Self::response_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC)
                }
            };

            // A fenced request gets its fence echoed in the response so the
            // guest's dma_fence wait completes.
            if flags & VIRTIO_GPU_FLAG_FENCE != 0 && resp.len() >= CTRL_HDR_SIZE {
                let resp_flags = read_le_u32(&resp, 4) | VIRTIO_GPU_FLAG_FENCE;
                resp[4..8].copy_from_slice(&resp_flags.to_le_bytes());
                resp[8..16].copy_from_slice(&fence_id.to_le_bytes());
                resp[16..20].copy_from_slice(&ctx_id.to_le_bytes());
            }

            let mut writer = ChainWriter::new(handle.mem(), &chain);
            writer.write(&resp);
            handle.push_used(head, writer.written());
        }
        handle.interrupt().signal_used_buffer();
    }

    fn process_cursor_queue(&mut self, handle: &QueueHandle) {
        while let Some((head, chain)) = handle.pop_chain() {
            if chain.is_empty() {
                continue;
            }
            let req = ChainReader::new(handle.mem(), &chain).read_all();
            handle.push_used(head, 0);

            // virtio_gpu_update_cursor: hdr + pos(16) + resource_id + hot_x + hot_y + pad
            if req.len() < CTRL_HDR_SIZE + 32 {
                continue;
            }
            let cmd = read_le_u32(&req, 0);
            let is_update = cmd == VIRTIO_GPU_CMD_UPDATE_CURSOR;
            let is_move = cmd == VIRTIO_GPU_CMD_MOVE_CURSOR;
            if !is_update && !is_move {
                continue;
            }

            self.cursor_x = read_le_u32(&req, CTRL_HDR_SIZE + 4) as i32;
            self.cursor_y = read_le_u32(&req, CTRL_HDR_SIZE + 8) as i32;
            if is_update {
                self.cursor_resource_id = read_le_u32(&req, CTRL_HDR_SIZE + 16);
                self.cursor_hot_x = read_le_u32(&req, CTRL_HDR_SIZE + 20);
                self.cursor_hot_y = read_le_u32(&req, CTRL_HDR_SIZE + 24);
            }

            if let Some(cb) = &self.cursor_callback {
                let mut info = CursorInfo {
                    x: self.cursor_x,
                    y: self.cursor_y,
                    hot_x: self.cursor_hot_x,
                    hot_y: self.cursor_hot_y,
                    visible: self.cursor_resource_id != 0,
                    image_updated: is_update,
                    ..CursorInfo::default()
                };
                if is_update && self.cursor_resource_id != 0 {
                    if let Some(res) = self.resources.get(&self.cursor_resource_id) {
                        info.width = res.width;
                        info.height = res.height;
                        info.pixels = res.host_pixels.clone();
                    }
                }
                cb(info);
            }
        }
        handle.interrupt().signal_used_buffer();
    }
}

impl VirtioDevice for VirtioGpu {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_GPU
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
        // { events_read, events_clear, num_scanouts, num_capsets }
        let mut cfg = [0u8; 16];
        cfg[0..4].copy_from_slice(&self.events_read.to_le_bytes());
        cfg[8..12].copy_from_slice(&1u32.to_le_bytes());
        data.fill(0);
        if let Ok(off) = usize::try_from(offset) {
            if off < cfg.len() {
                let n = data.len().min(cfg.len() - off);
                data[..n].copy_from_slice(&cfg[off..off + n]);
            }
        }
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        // Only events_clear (offset 4) is writable.
        if offset == 4 && data.len() >= 4 {
            let clear = u32::from_le_bytes(data[..4].try_into().unwrap());
            self.events_read &= !clear;
        }
    }

    fn on_attach(&mut self, interrupt: VirtioInterrupt, mem: GuestRam) {
        self.interrupt = Some(interrupt);
        self.mem = Some(mem);
    }

    fn on_queue_ready(&mut self, queue: usize, handle: QueueHandle) {
        if queue < 2 {
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
            CURSOR_QUEUE => {
                if let Some(handle) = self.queues[CURSOR_QUEUE].clone() {
                    self.process_cursor_queue(&handle);
                }
            }
            _ => {}
        }
    }

    fn on_reset(&mut self) {
        self.resources.clear();
        self.scanout_resource_id = 0;
        self.scanout_width = 0;
        self.scanout_height = 0;
        self.cursor_resource_id = 0;
        self.queues = [None, None];
    }
}

use tenbox_storage::VirtualDisk;
use tracing::warn;

use crate::mmio::{QueueHandle, VirtioDevice, VirtioInterrupt};
use crate::queue::{ChainElem, ChainReader};
use crate::{VIRTIO_F_VERSION_1, VIRTIO_ID_BLOCK};

pub const VIRTIO_BLK_F_SIZE_MAX: u64 = 1 << 1;
pub const VIRTIO_BLK_F_SEG_MAX: u64 = 1 << 2;
pub const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
pub const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

pub const VIRTIO_BLK_SECTOR_SIZE: u64 = 512;

const QUEUE_SIZE: u16 = 128;
const DEVICE_ID_STRING: &[u8] = b"tenbox-vblk";

/// Virtio block device over a [`VirtualDisk`]. One request queue; disk
/// I/O runs synchronously on the notifying vCPU thread.
pub struct VirtioBlk {
    disk: Box<dyn VirtualDisk>,
    capacity_sectors: u64,
    queue: Option<QueueHandle>,
    warned_types: Vec<u32>,
}

impl VirtioBlk {
    pub fn new(disk: Box<dyn VirtualDisk>) -> Self {
        let capacity_sectors = disk.capacity_bytes() / VIRTIO_BLK_SECTOR_SIZE;
        VirtioBlk {
            disk,
            capacity_sectors,
            queue: None,
            warned_types: Vec::new(),
        }
    }

    fn config_bytes(&self) -> [u8; 24] {
        let mut cfg = [0u8; 24];
        cfg[0..8].copy_from_slice(&self.capacity_sectors.to_le_bytes());
        cfg[8..12].copy_from_slice(&(1u32 << 20).to_le_bytes()); // size_max
        cfg[12..16].copy_from_slice(&126u32.to_le_bytes()); // seg_max
        cfg[20..24].copy_from_slice(&512u32.to_le_bytes()); // blk_size
        cfg
    }

    fn process_request(&mut self, handle: &QueueHandle, head: u16, chain: &[ChainElem]) {
        let mem = handle.mem();

        if chain.len() < 2 {
            warn!(len = chain.len(), "virtio-blk chain too short");
            handle.push_used(head, 0);
            return;
        }

        let mut header = [0u8; 16];
        let mut reader = ChainReader::new(mem, &chain[..1]);
        if !reader.read_exact(&mut header) {
            handle.push_used(head, 0);
            return;
        }
        let req_type = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let sector = u64::from_le_bytes(header[8..16].try_into().unwrap());

        let status_elem = *chain.last().unwrap();
        if !status_elem.writable || status_elem.len < 1 {
            warn!("virtio-blk missing writable status descriptor");
            handle.push_used(head, 0);
            return;
        }
        let data = &chain[1..chain.len() - 1];

        let mut status = VIRTIO_BLK_S_OK;
        let mut data_len: u32 = 0;

        match req_type {
            VIRTIO_BLK_T_IN => {
                let mut offset = sector * VIRTIO_BLK_SECTOR_SIZE;
                for elem in data.iter().filter(|e| e.writable) {
                    let mut buf = vec![0u8; elem.len as usize];
                    if self.disk.read_at(offset, &mut buf).is_err()
                        || mem.write(elem.gpa, &buf).is_err()
                    {
                        status = VIRTIO_BLK_S_IOERR;
                        break;
                    }
                    offset += u64::from(elem.len);
                    data_len += elem.len;
                }
            }
            VIRTIO_BLK_T_OUT => {
                let mut offset = sector * VIRTIO_BLK_SECTOR_SIZE;
                for elem in data.iter().filter(|e| !e.writable) {
                    let buf = match mem.read_vec(elem.gpa, elem.len as usize) {
                        Ok(buf) => buf,
                        Err(_) => {
                            status = VIRTIO_BLK_S_IOERR;
                            break;
                        }
                    };
                    if self.disk.write_at(offset, &buf).is_err() {
                        status = VIRTIO_BLK_S_IOERR;
                        break;
                    }
                    offset += u64::from(elem.len);
                    data_len += elem.len;
                }
            }
            VIRTIO_BLK_T_FLUSH => {
                if self.disk.flush().is_err() {
                    status = VIRTIO_BLK_S_IOERR;
                }
            }
            VIRTIO_BLK_T_GET_ID => {
                for elem in data.iter().filter(|e| e.writable) {
                    let mut buf = vec![0u8; elem.len as usize];
                    let n = buf.len().min(20).min(DEVICE_ID_STRING.len());
                    buf[..n].copy_from_slice(&DEVICE_ID_STRING[..n]);
                    if mem.write(elem.gpa, &buf).is_err() {
                        status = VIRTIO_BLK_S_IOERR;
                        break;
                    }
                    data_len += elem.len;
                }
            }
            other => {
                if !self.warned_types.contains(&other) {
                    self.warned_types.push(other);
                    warn!(req_type = other, "virtio-blk unsupported request type");
                }
                status = VIRTIO_BLK_S_UNSUPP;
            }
        }

        let _ = mem.write_u8(status_elem.gpa, status);
        handle.push_used(head, data_len + 1);
    }
}

impl VirtioDevice for VirtioBlk {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_BLOCK
    }

    fn device_features(&self) -> u64 {
        VIRTIO_BLK_F_SIZE_MAX
            | VIRTIO_BLK_F_SEG_MAX
            | VIRTIO_BLK_F_BLK_SIZE
            | VIRTIO_BLK_F_FLUSH
            | VIRTIO_F_VERSION_1
    }

    fn num_queues(&self) -> usize {
        1
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

    fn on_attach(&mut self, _interrupt: VirtioInterrupt, _mem: tenbox_memory::GuestRam) {}

    fn on_queue_ready(&mut self, queue: usize, handle: QueueHandle) {
        if queue == 0 {
            self.queue = Some(handle);
        }
    }

    fn on_queue_notify(&mut self, queue: usize) {
        if queue != 0 {
            return;
        }
        let Some(handle) = self.queue.clone() else {
            return;
        };
        let mut processed = false;
        while let Some((head, chain)) = handle.pop_chain() {
            processed = true;
            if !chain.is_empty() {
                self.process_request(&handle, head, &chain);
            }
        }
        if processed {
            handle.interrupt().signal_used_buffer();
        }
    }

    fn on_reset(&mut self) {
        self.queue = None;
    }
}

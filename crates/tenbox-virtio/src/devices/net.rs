use tracing::debug;

use crate::mmio::{QueueHandle, VirtioDevice};
use crate::queue::{ChainReader, ChainWriter};
use crate::{VIRTIO_F_VERSION_1, VIRTIO_ID_NET};

pub const VIRTIO_NET_F_MAC: u64 = 1 << 5;
pub const VIRTIO_NET_F_STATUS: u64 = 1 << 16;

/// virtio 1.x net header (num_buffers always present under VERSION_1).
pub const VIRTIO_NET_HDR_SIZE: usize = 12;

const RX_QUEUE: usize = 0;
const TX_QUEUE: usize = 1;
const QUEUE_SIZE: u16 = 256;

pub const DEFAULT_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

pub type TxCallback = Box<dyn Fn(&[u8]) + Send>;

/// Virtio network device. TX frames are handed to the backend callback;
/// RX frames are injected from the network thread via [`VirtioNet::inject_rx`].
pub struct VirtioNet {
    mac: [u8; 6],
    link_up: bool,
    tx_callback: Option<TxCallback>,
    rx_queue: Option<QueueHandle>,
    tx_queue: Option<QueueHandle>,
}

impl VirtioNet {
    pub fn new(link_up: bool) -> Self {
        VirtioNet {
            mac: DEFAULT_MAC,
            link_up,
            tx_callback: None,
            rx_queue: None,
            tx_queue: None,
        }
    }

    pub fn set_tx_callback(&mut self, cb: TxCallback) {
        self.tx_callback = Some(cb);
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    /// Flip the link-status word; fires a config-change interrupt only on
    /// an actual transition.
    pub fn set_link_up(&mut self, up: bool) {
        if self.link_up == up {
            return;
        }
        self.link_up = up;
        if let Some(rx) = &self.rx_queue {
            rx.interrupt().signal_config_change();
        } else if let Some(tx) = &self.tx_queue {
            tx.interrupt().signal_config_change();
        }
    }

    /// Deliver one Ethernet frame to the guest. Fails (false) when the RX
    /// queue is not ready or has no buffers; the caller may drop or retry.
    pub fn inject_rx(&mut self, frame: &[u8]) -> bool {
        let Some(handle) = self.rx_queue.clone() else {
            return false;
        };
        let Some((head, chain)) = handle.pop_chain() else {
            return false;
        };
        if chain.is_empty() {
            handle.interrupt().signal_used_buffer();
            return false;
        }

        let mut writer = ChainWriter::new(handle.mem(), &chain);
        let header = [0u8; VIRTIO_NET_HDR_SIZE];
        writer.write(&header);
        writer.write(frame);
        let written = writer.written();

        handle.push_used(head, written);
        handle.interrupt().signal_used_buffer();
        written as usize >= VIRTIO_NET_HDR_SIZE + frame.len()
    }

    fn process_tx(&mut self, handle: &QueueHandle) {
        while let Some((head, chain)) = handle.pop_chain() {
            if chain.is_empty() {
                continue;
            }
            let mut reader = ChainReader::new(handle.mem(), &chain);
            let buf = reader.read_all();
            handle.push_used(head, 0);

            if buf.len() <= VIRTIO_NET_HDR_SIZE {
                debug!(len = buf.len(), "virtio-net runt TX buffer");
                continue;
            }
            let frame = &buf[VIRTIO_NET_HDR_SIZE..];
            if frame.len() >= 14 {
                if let Some(tx) = &self.tx_callback {
                    tx(frame);
                }
            }
        }
        handle.interrupt().signal_used_buffer();
    }
}

impl VirtioDevice for VirtioNet {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_NET
    }

    fn device_features(&self) -> u64 {
        VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS | VIRTIO_F_VERSION_1
    }

    fn num_queues(&self) -> usize {
        2
    }

    fn queue_max_size(&self, _queue: usize) -> u16 {
        QUEUE_SIZE
    }

    fn read_config(&mut self, offset: u64, data: &mut [u8]) {
        let mut cfg = [0u8; 8];
        cfg[0..6].copy_from_slice(&self.mac);
        cfg[6..8].copy_from_slice(&u16::from(self.link_up).to_le_bytes());
        data.fill(0);
        if let Ok(off) = usize::try_from(offset) {
            if off < cfg.len() {
                let n = data.len().min(cfg.len() - off);
                data[..n].copy_from_slice(&cfg[off..off + n]);
            }
        }
    }

    fn on_queue_ready(&mut self, queue: usize, handle: QueueHandle) {
        match queue {
            RX_QUEUE => self.rx_queue = Some(handle),
            TX_QUEUE => self.tx_queue = Some(handle),
            _ => {}
        }
    }

    fn on_queue_notify(&mut self, queue: usize) {
        // RX notifies just replenish buffers; frames arrive via inject_rx.
        if queue == TX_QUEUE {
            if let Some(handle) = self.tx_queue.clone() {
                self.process_tx(&handle);
            }
        }
    }

    fn on_reset(&mut self) {
        self.rx_queue = None;
        self.tx_queue = None;
    }
}

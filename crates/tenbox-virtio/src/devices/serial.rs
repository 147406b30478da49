use tracing::{debug, info};

use crate::mmio::{QueueHandle, VirtioDevice};
use crate::queue::{ChainReader, ChainWriter};
use crate::{VIRTIO_F_VERSION_1, VIRTIO_ID_CONSOLE, VIRTIO_STATUS_DRIVER_OK};

pub const VIRTIO_CONSOLE_F_MULTIPORT: u64 = 1 << 1;

// Control message events.
pub const VIRTIO_CONSOLE_DEVICE_READY: u16 = 0;
pub const VIRTIO_CONSOLE_DEVICE_ADD: u16 = 1;
pub const VIRTIO_CONSOLE_PORT_READY: u16 = 3;
pub const VIRTIO_CONSOLE_PORT_OPEN: u16 = 6;
pub const VIRTIO_CONSOLE_PORT_NAME: u16 = 7;

const CONTROL_RX_QUEUE: usize = 2;
const CONTROL_TX_QUEUE: usize = 3;
const QUEUE_SIZE: u16 = 256;
const CONTROL_SIZE: usize = 8;

pub type DataCallback = Box<dyn Fn(u32, &[u8]) + Send>;
pub type PortOpenCallback = Box<dyn Fn(u32, bool) + Send>;

#[derive(Default)]
struct PortState {
    name: String,
    guest_connected: bool,
}

/// Multiport virtio console. Queue layout: 0/1 are port 0's RX/TX, 2/3
/// are the control queues, then each additional port `i` uses
/// `4 + 2(i-1)` / `5 + 2(i-1)`.
pub struct VirtioSerial {
    max_ports: u32,
    ports: Vec<PortState>,
    queues: Vec<Option<QueueHandle>>,
    data_callback: Option<DataCallback>,
    port_open_callback: Option<PortOpenCallback>,
    driver_ready: bool,
}

impl VirtioSerial {
    pub fn new(max_ports: u32) -> Self {
        let max_ports = max_ports.max(1);
        let num_queues = 4 + (max_ports as usize - 1) * 2;
        VirtioSerial {
            max_ports,
            ports: (0..max_ports).map(|_| PortState::default()).collect(),
            queues: vec![None; num_queues],
            data_callback: None,
            port_open_callback: None,
            driver_ready: false,
        }
    }

    pub fn set_data_callback(&mut self, cb: DataCallback) {
        self.data_callback = Some(cb);
    }

    pub fn set_port_open_callback(&mut self, cb: PortOpenCallback) {
        self.port_open_callback = Some(cb);
    }

    pub fn set_port_name(&mut self, port: u32, name: &str) {
        if let Some(p) = self.ports.get_mut(port as usize) {
            p.name = name.to_string();
        }
    }

    pub fn is_port_connected(&self, port: u32) -> bool {
        self.ports
            .get(port as usize)
            .map(|p| p.guest_connected)
            .unwrap_or(false)
    }

    fn rx_queue_index(port: u32) -> usize {
        if port == 0 {
            0
        } else {
            4 + (port as usize - 1) * 2
        }
    }

    fn tx_queue_to_port(&self, queue: usize) -> Option<u32> {
        if queue == 1 {
            return Some(0);
        }
        if queue >= 5 && (queue - 5) % 2 == 0 {
            let port = 1 + ((queue - 5) / 2) as u32;
            if port < self.max_ports {
                return Some(port);
            }
        }
        None
    }

    fn send_control(&self, port: u32, event: u16, value: u16, extra: &[u8]) {
        let Some(handle) = self.queues[CONTROL_RX_QUEUE].clone() else {
            return;
        };
        let Some((head, chain)) = handle.pop_chain() else {
            debug!(port, event, "virtio-serial: no control buffers");
            return;
        };
        if chain.is_empty() {
            handle.interrupt().signal_used_buffer();
            return;
        }

        let mut msg = Vec::with_capacity(CONTROL_SIZE + extra.len());
        msg.extend_from_slice(&port.to_le_bytes());
        msg.extend_from_slice(&event.to_le_bytes());
        msg.extend_from_slice(&value.to_le_bytes());
        msg.extend_from_slice(extra);

        let mut writer = ChainWriter::new(handle.mem(), &chain);
        writer.write(&msg);
        handle.push_used(head, writer.written());
        handle.interrupt().signal_used_buffer();
    }

    fn handle_control_tx(&mut self, handle: &QueueHandle) {
        while let Some((head, chain)) = handle.pop_chain() {
            if chain.is_empty() {
                continue;
            }
            let mut ctrl = [0u8; CONTROL_SIZE];
            let complete = ChainReader::new(handle.mem(), &chain).read_exact(&mut ctrl);
            handle.push_used(head, 0);
            if !complete {
                continue;
            }

            let id = u32::from_le_bytes(ctrl[0..4].try_into().unwrap());
            let event = u16::from_le_bytes(ctrl[4..6].try_into().unwrap());
            let value = u16::from_le_bytes(ctrl[6..8].try_into().unwrap());
            debug!(id, event, value, "virtio-serial control");

            match event {
                VIRTIO_CONSOLE_DEVICE_READY => {
                    if value == 1 {
                        for port in 0..self.max_ports {
                            self.send_control(port, VIRTIO_CONSOLE_DEVICE_ADD, 1, &[]);
                        }
                    }
                }
                VIRTIO_CONSOLE_PORT_READY => {
                    if value == 1 && (id as usize) < self.ports.len() {
                        let name = self.ports[id as usize].name.clone();
                        if !name.is_empty() {
                            self.send_control(id, VIRTIO_CONSOLE_PORT_NAME, 1, name.as_bytes());
                        }
                        self.send_control(id, VIRTIO_CONSOLE_PORT_OPEN, 1, &[]);
                    }
                }
                VIRTIO_CONSOLE_PORT_OPEN => {
                    if let Some(port) = self.ports.get_mut(id as usize) {
                        let opened = value == 1;
                        port.guest_connected = opened;
                        info!(port = id, opened, "virtio-serial port open state");
                        if let Some(cb) = &self.port_open_callback {
                            cb(id, opened);
                        }
                    }
                }
                _ => {}
            }
        }
        handle.interrupt().signal_used_buffer();
    }

    fn handle_port_tx(&mut self, port: u32, handle: &QueueHandle) {
        while let Some((head, chain)) = handle.pop_chain() {
            if chain.is_empty() {
                continue;
            }
            let data = ChainReader::new(handle.mem(), &chain).read_all();
            handle.push_used(head, 0);
            if !data.is_empty() {
                if let Some(cb) = &self.data_callback {
                    cb(port, &data);
                }
            }
        }
        handle.interrupt().signal_used_buffer();
    }

    /// Deliver host bytes to a guest port's receive queue. Returns true if
    /// everything fit into posted buffers.
    pub fn send_data(&mut self, port: u32, data: &[u8]) -> bool {
        if data.is_empty() || port >= self.max_ports {
            return false;
        }
        if !self.is_port_connected(port) {
            debug!(port, "virtio-serial: port not connected, dropping data");
            return false;
        }
        let Some(handle) = self.queues[Self::rx_queue_index(port)].clone() else {
            return false;
        };

        let mut offset = 0usize;
        while offset < data.len() {
            let Some((head, chain)) = handle.pop_chain() else {
                debug!(port, "virtio-serial: out of receive buffers");
                break;
            };
            if chain.is_empty() {
                continue;
            }
            let mut writer = ChainWriter::new(handle.mem(), &chain);
            offset += writer.write(&data[offset..]);
            handle.push_used(head, writer.written());
        }

        handle.interrupt().signal_used_buffer();
        offset == data.len()
    }
}

impl VirtioDevice for VirtioSerial {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_CONSOLE
    }

    fn device_features(&self) -> u64 {
        VIRTIO_CONSOLE_F_MULTIPORT | VIRTIO_F_VERSION_1
    }

    fn num_queues(&self) -> usize {
        self.queues.len()
    }

    fn queue_max_size(&self, _queue: usize) -> u16 {
        QUEUE_SIZE
    }

    fn read_config(&mut self, offset: u64, data: &mut [u8]) {
        // { cols u16, rows u16, max_nr_ports u32, emerg_wr u32 }
        let mut cfg = [0u8; 12];
        cfg[4..8].copy_from_slice(&self.max_ports.to_le_bytes());
        data.fill(0);
        if let Ok(off) = usize::try_from(offset) {
            if off < cfg.len() {
                let n = data.len().min(cfg.len() - off);
                data[..n].copy_from_slice(&cfg[off..off + n]);
            }
        }
    }

    fn on_queue_ready(&mut self, queue: usize, handle: QueueHandle) {
        if let Some(slot) = self.queues.get_mut(queue) {
            *slot = Some(handle);
        }
    }

    fn on_queue_notify(&mut self, queue: usize) {
        if queue == CONTROL_TX_QUEUE {
            if let Some(handle) = self.queues[CONTROL_TX_QUEUE].clone() {
                self.handle_control_tx(&handle);
            }
            return;
        }
        if let Some(port) = self.tx_queue_to_port(queue) {
            if let Some(handle) = self.queues[queue].clone() {
                self.handle_port_tx(port, &handle);
            }
        }
        // Receive-queue notifies (0, 2, 4, ...) just post buffers.
    }

    fn on_status(&mut self, status: u32) {
        if status & VIRTIO_STATUS_DRIVER_OK != 0 && !self.driver_ready {
            self.driver_ready = true;
            info!("virtio-serial driver ready");
        }
    }

    fn on_reset(&mut self) {
        self.driver_ready = false;
        for q in &mut self.queues {
            *q = None;
        }
        for p in &mut self.ports {
            p.guest_connected = false;
        }
    }
}

//! QGA proxy: framed JSON over the virtio-serial port named
//! `org.qemu.guest_agent.0`. Commands are single-line JSON objects; a
//! 0xFF byte resets the agent's parser before the sync handshake.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use tenbox_virtio::devices::serial::VirtioSerial;
use tracing::{debug, info, warn};

pub type ConnectedCallback = Box<dyn Fn(bool) + Send>;

struct AgentState {
    recv_buffer: Vec<u8>,
    sync_pending: bool,
    sync_id: i64,
}

pub struct GuestAgent {
    serial: Arc<Mutex<VirtioSerial>>,
    port: u32,
    state: Mutex<AgentState>,
    connected: AtomicBool,
    next_id: AtomicU64,
    connected_callback: Mutex<Option<ConnectedCallback>>,
}

fn fresh_sync_id() -> i64 {
    // Unique per boot is all QGA needs; wall-clock nanoseconds serve.
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(1);
    nanos.max(1)
}

impl GuestAgent {
    pub const PORT_NAME: &'static str = "org.qemu.guest_agent.0";

    pub fn new(serial: Arc<Mutex<VirtioSerial>>, port: u32) -> Arc<GuestAgent> {
        Arc::new(GuestAgent {
            serial,
            port,
            state: Mutex::new(AgentState {
                recv_buffer: Vec::new(),
                sync_pending: false,
                sync_id: 0,
            }),
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            connected_callback: Mutex::new(None),
        })
    }

    pub fn set_connected_callback(&self, cb: ConnectedCallback) {
        *self.connected_callback.lock().unwrap() = Some(cb);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Guest opened the agent port. Must NOT be called from the serial
    /// device's own callbacks (they hold the device lock); the VM wiring
    /// runs this on a helper thread.
    pub fn handle_port_opened(&self) {
        info!("guest agent port opened");
        let id = {
            let mut state = self.state.lock().unwrap();
            state.recv_buffer.clear();
            state.sync_id = fresh_sync_id();
            state.sync_pending = true;
            state.sync_id
        };
        self.start_sync_handshake(id);
    }

    /// Guest closed the agent port.
    pub fn handle_port_closed(&self) {
        info!("guest agent port closed");
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap();
            state.recv_buffer.clear();
            state.sync_pending = false;
        }
        if was_connected {
            self.fire_connected(false);
        }
    }

    fn start_sync_handshake(&self, id: i64) {
        // 0xFF flushes the agent's JSON parser, then guest-sync-delimited
        // with an id it must echo.
        {
            let mut serial = self.serial.lock().unwrap();
            serial.send_data(self.port, &[0xFF]);
        }
        let command = json!({
            "execute": "guest-sync-delimited",
            "arguments": { "id": id },
        });
        self.send_line(&command.to_string());
        info!(id, "guest agent sync sent");
    }

    /// Raw bytes from the guest's side of the port.
    pub fn on_data(&self, data: &[u8]) {
        let mut complete = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for byte in data {
                match byte {
                    0xFF => state.recv_buffer.clear(),
                    b'\n' | b'\r' => {
                        if !state.recv_buffer.is_empty() {
                            complete.push(std::mem::take(&mut state.recv_buffer));
                        }
                    }
                    other => state.recv_buffer.push(*other),
                }
            }
        }
        for line in complete {
            self.process_line(&line);
        }
    }

    fn process_line(&self, line: &[u8]) {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(line) else {
            debug!("guest agent sent undecodable line");
            return;
        };

        if let Some(err) = value.get("error") {
            warn!(%err, "guest agent error response");
        }

        let returned = value.get("return").and_then(|r| r.as_i64());
        let fire = {
            let mut state = self.state.lock().unwrap();
            if state.sync_pending && returned == Some(state.sync_id) {
                state.sync_pending = false;
                !self.connected.swap(true, Ordering::SeqCst)
            } else {
                false
            }
        };
        if fire {
            info!("guest agent synced");
            self.fire_connected(true);
        }
    }

    fn fire_connected(&self, connected: bool) {
        if let Some(cb) = self.connected_callback.lock().unwrap().as_ref() {
            cb(connected);
        }
    }

    fn send_line(&self, line: &str) {
        let mut framed = line.as_bytes().to_vec();
        framed.push(b'\n');
        let mut serial = self.serial.lock().unwrap();
        serial.send_data(self.port, &framed);
    }

    fn send_command(&self, command: &str, arguments: Option<serde_json::Value>) {
        if !self.is_connected() {
            warn!(command, "guest agent not connected, dropping command");
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = match arguments {
            Some(arguments) => json!({ "execute": command, "arguments": arguments, "id": id }),
            None => json!({ "execute": command, "id": id }),
        };
        info!(command, id, "guest agent command");
        self.send_line(&message.to_string());
    }

    /// `mode` is one of "powerdown", "halt", "reboot".
    pub fn shutdown(&self, mode: &str) {
        self.send_command("guest-shutdown", Some(json!({ "mode": mode })));
    }

    pub fn ping(&self) {
        self.send_command("guest-ping", None);
    }
}

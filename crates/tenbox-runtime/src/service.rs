//! The control endpoint service: one duplex byte stream to the manager,
//! a batching send worker and a decoding receive worker.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tenbox_ipc::{encode, Channel, Decoder, Kind, Message};
use tenbox_machine::{PortForward, Vm};
use tracing::{info, warn};

use crate::hex::{decode_hex, encode_hex};
use crate::ports::{ManagedAudioPort, ManagedConsolePort, ManagedDisplayPort};

/// Display frames queued beyond this are head-dropped so a slow manager
/// never builds unbounded latency; control traffic is never dropped.
const MAX_PENDING_FRAMES: usize = 8;
const FLUSH_INTERVAL: Duration = Duration::from_millis(20);

struct SendQueues {
    control: VecDeque<Vec<u8>>,
    frames: VecDeque<Vec<u8>>,
}

struct ServiceShared {
    vm_id: String,
    running: AtomicBool,
    next_event_id: AtomicU64,
    queues: Mutex<SendQueues>,
    send_cv: Condvar,
    // The stream write half is guarded separately so producers only
    // contend on the queue mutex.
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    vm: Mutex<Option<Arc<Vm>>>,
    console: Arc<ManagedConsolePort>,
}

impl ServiceShared {
    fn next_id(&self) -> u64 {
        self.next_event_id.fetch_add(1, Ordering::SeqCst)
    }

    fn queue_control(&self, message: &Message) {
        let encoded = encode(message);
        self.queues.lock().unwrap().control.push_back(encoded);
        self.send_cv.notify_one();
    }

    fn queue_frame(&self, message: &Message) {
        let encoded = encode(message);
        {
            let mut queues = self.queues.lock().unwrap();
            queues.frames.push_back(encoded);
            while queues.frames.len() > MAX_PENDING_FRAMES {
                queues.frames.pop_front();
            }
        }
        self.send_cv.notify_one();
    }

    fn event(&self, channel: Channel, msg_type: &str) -> Message {
        Message::new(channel, Kind::Event, msg_type, &self.vm_id, self.next_id())
    }
}

pub struct RuntimeService {
    shared: Arc<ServiceShared>,
    display: Arc<ManagedDisplayPort>,
    audio: Arc<ManagedAudioPort>,
    send_thread: Option<JoinHandle<()>>,
    recv_thread: Option<JoinHandle<()>>,
}

impl RuntimeService {
    /// Wire the service around an accepted manager connection.
    pub fn new(
        vm_id: &str,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
    ) -> RuntimeService {
        let console = ManagedConsolePort::new();
        let shared = Arc::new(ServiceShared {
            vm_id: vm_id.to_string(),
            running: AtomicBool::new(true),
            next_event_id: AtomicU64::new(1),
            queues: Mutex::new(SendQueues { control: VecDeque::new(), frames: VecDeque::new() }),
            send_cv: Condvar::new(),
            writer: Mutex::new(Some(writer)),
            vm: Mutex::new(None),
            console: console.clone(),
        });

        {
            let wake = shared.clone();
            console.set_output_wake(Box::new(move || wake.send_cv.notify_one()));
        }

        let display = ManagedDisplayPort::new();
        {
            let shared_frames = shared.clone();
            display.set_frame_handler(Box::new(move |frame| {
                let message = shared_frames
                    .event(Channel::Display, "display.frame")
                    .field("width", frame.width)
                    .field("height", frame.height)
                    .field("stride", frame.stride)
                    .field("format", frame.format)
                    .field("resource_width", frame.resource_width)
                    .field("resource_height", frame.resource_height)
                    .field("dirty_x", frame.dirty_x)
                    .field("dirty_y", frame.dirty_y)
                    .with_payload(frame.pixels);
                shared_frames.queue_frame(&message);
            }));

            let shared_cursor = shared.clone();
            display.set_cursor_handler(Box::new(move |cursor| {
                let mut message = shared_cursor
                    .event(Channel::Display, "display.cursor")
                    .field("x", cursor.x)
                    .field("y", cursor.y)
                    .field("hot_x", cursor.hot_x)
                    .field("hot_y", cursor.hot_y)
                    .field("width", cursor.width)
                    .field("height", cursor.height)
                    .field("visible", u32::from(cursor.visible))
                    .field("image_updated", u32::from(cursor.image_updated));
                if cursor.image_updated && !cursor.pixels.is_empty() {
                    message = message.with_payload(cursor.pixels);
                }
                shared_cursor.queue_control(&message);
            }));

            let shared_state = shared.clone();
            display.set_state_handler(Box::new(move |active, width, height| {
                let message = shared_state
                    .event(Channel::Display, "display.state")
                    .field("active", u32::from(active))
                    .field("width", width)
                    .field("height", height);
                shared_state.queue_control(&message);
            }));
        }

        let audio = ManagedAudioPort::new();
        {
            let shared_audio = shared.clone();
            audio.set_handler(Box::new(move |chunk| {
                let pcm: Vec<u8> = chunk.pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
                let message = shared_audio
                    .event(Channel::Audio, "audio.pcm")
                    .field("sample_rate", chunk.sample_rate)
                    .field("channels", chunk.channels)
                    .with_payload(pcm);
                shared_audio.queue_frame(&message);
            }));
        }

        let send_thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("tenbox-ipc-send".into())
                .spawn(move || send_worker(&shared))
                .expect("spawn send worker")
        };
        let recv_thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("tenbox-ipc-recv".into())
                .spawn(move || recv_worker(&shared, reader))
                .expect("spawn recv worker")
        };

        RuntimeService {
            shared,
            display,
            audio,
            send_thread: Some(send_thread),
            recv_thread: Some(recv_thread),
        }
    }

    pub fn console_port(&self) -> Arc<ManagedConsolePort> {
        self.shared.console.clone()
    }

    pub fn display_port(&self) -> Arc<ManagedDisplayPort> {
        self.display.clone()
    }

    pub fn audio_port(&self) -> Arc<ManagedAudioPort> {
        self.audio.clone()
    }

    pub fn attach_vm(&self, vm: Arc<Vm>) {
        if let Some(agent) = vm.guest_agent() {
            let shared = self.shared.clone();
            agent.set_connected_callback(Box::new(move |connected| {
                let message = shared
                    .event(Channel::Control, "guest_agent.state")
                    .field("connected", u32::from(connected));
                shared.queue_control(&message);
            }));
        }
        *self.shared.vm.lock().unwrap() = Some(vm);
    }

    pub fn publish_state(&self, state: &str, exit_code: i32) {
        let message = self
            .shared
            .event(Channel::Control, "runtime.state")
            .field("state", state)
            .field("exit_code", exit_code);
        self.shared.queue_control(&message);
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.send_cv.notify_all();
        // Dropping the writer unblocks the peer; the reader thread exits
        // on EOF or error.
        *self.shared.writer.lock().unwrap() = None;
        if let Some(thread) = self.send_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.recv_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RuntimeService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_worker(shared: &ServiceShared) {
    while shared.running.load(Ordering::SeqCst) {
        let mut batch = Vec::new();
        {
            let mut queues = shared.queues.lock().unwrap();
            let idle = queues.control.is_empty()
                && queues.frames.is_empty()
                && !shared.console.has_pending_output();
            if idle {
                let (guard, _) = shared
                    .send_cv
                    .wait_timeout(queues, FLUSH_INTERVAL)
                    .unwrap();
                queues = guard;
            } else {
                // Batch for up to one flush interval so console bytes and
                // frames coalesce.
                let (guard, _) = shared
                    .send_cv
                    .wait_timeout(queues, FLUSH_INTERVAL)
                    .unwrap();
                queues = guard;
            }
            if !shared.running.load(Ordering::SeqCst) {
                return;
            }

            let console_data = shared.console.take_pending_output();
            if !console_data.is_empty() {
                let message = shared
                    .event(Channel::Console, "console.data")
                    .field("data_hex", encode_hex(&console_data));
                batch.extend_from_slice(&encode(&message));
            }

            // Small control messages first, then display frames.
            while let Some(next) = queues.control.pop_front() {
                batch.extend_from_slice(&next);
            }
            while let Some(next) = queues.frames.pop_front() {
                batch.extend_from_slice(&next);
            }
        }

        if batch.is_empty() {
            continue;
        }

        let mut writer = shared.writer.lock().unwrap();
        let Some(stream) = writer.as_mut() else {
            return;
        };
        if stream.write_all(&batch).and_then(|_| stream.flush()).is_err() {
            warn!("control endpoint write failed, stopping send worker");
            *writer = None;
            return;
        }
    }
}

fn recv_worker(shared: &ServiceShared, mut reader: Box<dyn Read + Send>) {
    let mut decoder = Decoder::new();
    let mut buf = [0u8; 64 * 1024];
    while shared.running.load(Ordering::SeqCst) {
        let read = match reader.read(&mut buf) {
            Ok(0) => {
                info!("control endpoint closed by peer");
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                info!(error = %e, "control endpoint read ended");
                return;
            }
        };
        decoder.push(&buf[..read]);
        while let Some(message) = decoder.next_message() {
            handle_message(shared, message);
        }
    }
}

fn vm_of(shared: &ServiceShared) -> Option<Arc<Vm>> {
    shared.vm.lock().unwrap().clone()
}

fn handle_message(shared: &ServiceShared, message: Message) {
    match (message.channel, message.kind, message.msg_type.as_str()) {
        (Channel::Control, Kind::Request, "runtime.command") => {
            let mut response = Message::new(
                Channel::Control,
                Kind::Response,
                "runtime.command.result",
                &shared.vm_id,
                message.request_id,
            )
            .field("ok", "true");

            match message.get("command") {
                Some("stop") => {
                    if let Some(vm) = vm_of(shared) {
                        vm.request_stop();
                    }
                }
                Some("shutdown") => {
                    if let Some(vm) = vm_of(shared) {
                        if vm.is_guest_agent_connected() {
                            if let Some(agent) = vm.guest_agent() {
                                agent.shutdown("powerdown");
                            }
                        } else {
                            // Fall back to the power button plus a console
                            // nudge for init systems without ACPI wiring.
                            vm.trigger_power_button();
                            vm.inject_console_bytes(b"\npoweroff\n");
                        }
                    }
                }
                Some("reboot") => {
                    if let Some(vm) = vm_of(shared) {
                        if vm.is_guest_agent_connected() {
                            if let Some(agent) = vm.guest_agent() {
                                agent.shutdown("reboot");
                            }
                            // The guest restarts itself; when its exit
                            // arrives the runtime reports `rebooting` and
                            // exits 128 so the manager relaunches.
                            vm.set_reboot_requested();
                        } else {
                            vm.request_stop();
                            response = response.field("note", "guest agent unavailable, stopped");
                        }
                    }
                }
                Some("start") => {
                    response = response.field("note", "runtime already started by process launch");
                }
                Some(_) => {
                    response = response.field("ok", "false").field("error", "unknown command");
                }
                None => {
                    response = response.field("ok", "false").field("error", "missing command");
                }
            }
            shared.queue_control(&response);
        }

        (Channel::Control, Kind::Request, "runtime.update_network") => {
            let Some(vm) = vm_of(shared) else { return };
            if let Some(link) = message.get("link_up") {
                vm.set_net_link_up(link == "true" || link == "1");
            }
            if let Some(count) = message.get("forward_count").and_then(|c| c.parse::<usize>().ok())
            {
                let mut forwards = Vec::new();
                for i in 0..count {
                    let Some(spec) = message.get(&format!("forward_{i}")) else { continue };
                    let Some((host, guest)) = spec.split_once(':') else { continue };
                    if let (Ok(host_port), Ok(guest_port)) = (host.parse(), guest.parse()) {
                        forwards.push(PortForward { host_port, guest_port });
                    }
                }
                vm.update_port_forwards(forwards);
            }
            let response = Message::new(
                Channel::Control,
                Kind::Response,
                "runtime.update_network.result",
                &shared.vm_id,
                message.request_id,
            )
            .field("ok", "true");
            shared.queue_control(&response);
        }

        (Channel::Control, Kind::Request, "runtime.update_shared_folders") => {
            let Some(vm) = vm_of(shared) else { return };
            let count = message
                .get("folder_count")
                .and_then(|c| c.parse::<usize>().ok())
                .unwrap_or(0);
            let mut wanted = Vec::new();
            for i in 0..count {
                let Some(spec) = message.get(&format!("folder_{i}")) else { continue };
                let mut parts = spec.splitn(3, '|');
                let (Some(tag), Some(path), Some(ro)) = (parts.next(), parts.next(), parts.next())
                else {
                    continue;
                };
                wanted.push((tag.to_string(), path.to_string(), ro == "1"));
            }

            let current = vm.shared_folder_tags();
            for tag in &current {
                if !wanted.iter().any(|(t, _, _)| t == tag) {
                    vm.remove_shared_folder(tag);
                }
            }
            for (tag, path, readonly) in &wanted {
                if !current.contains(tag) {
                    vm.add_shared_folder(tag, std::path::Path::new(path), *readonly);
                }
            }
            let response = Message::new(
                Channel::Control,
                Kind::Response,
                "runtime.update_shared_folders.result",
                &shared.vm_id,
                message.request_id,
            )
            .field("ok", "true");
            shared.queue_control(&response);
        }

        (Channel::Control, Kind::Request, "runtime.ping") => {
            let response = Message::new(
                Channel::Control,
                Kind::Response,
                "runtime.pong",
                &shared.vm_id,
                message.request_id,
            );
            shared.queue_control(&response);
        }

        (Channel::Console, Kind::Request, "console.input") => {
            if let Some(bytes) = message.get("data_hex").and_then(decode_hex) {
                shared.console.push_input(&bytes);
            }
        }

        (Channel::Input, Kind::Request, "input.key_event") => {
            let Some(vm) = vm_of(shared) else { return };
            let (Some(code), Some(pressed)) = (message.get("key_code"), message.get("pressed"))
            else {
                return;
            };
            if let Ok(code) = code.parse::<u32>() {
                vm.inject_key_event(code, pressed == "1" || pressed == "true");
            }
        }

        (Channel::Input, Kind::Request, "input.pointer_event") => {
            let Some(vm) = vm_of(shared) else { return };
            let x = message.get("x").and_then(|v| v.parse().ok()).unwrap_or(0);
            let y = message.get("y").and_then(|v| v.parse().ok()).unwrap_or(0);
            let buttons = message.get("buttons").and_then(|v| v.parse().ok()).unwrap_or(0);
            vm.inject_pointer_event(x, y, buttons);
        }

        (Channel::Input, Kind::Request, "input.wheel_event") => {
            let Some(vm) = vm_of(shared) else { return };
            if let Some(delta) = message.get("delta").and_then(|v| v.parse().ok()) {
                vm.inject_wheel_event(delta);
            }
        }

        (Channel::Display, Kind::Request, "display.set_size") => {
            let Some(vm) = vm_of(shared) else { return };
            let (Some(width), Some(height)) = (
                message.get("width").and_then(|v| v.parse().ok()),
                message.get("height").and_then(|v| v.parse().ok()),
            ) else {
                return;
            };
            vm.set_display_size(width, height);
        }

        (Channel::Clipboard, _, _) => {
            // The clipboard bridge lives host-side; the runtime only
            // transports these messages and has nothing to apply yet.
        }

        (channel, kind, msg_type) => {
            warn!(?channel, ?kind, msg_type, "unhandled control message");
        }
    }
}

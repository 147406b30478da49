use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tenbox_net_stack::{Action, NetworkStack, StackConfig, TcpProxyEvent, UdpProxyEvent};
use tracing::{debug, info, warn};

use crate::icmp::IcmpRelay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForward {
    pub host_port: u16,
    pub guest_port: u16,
}

/// Receiver of frames destined for the guest (virtio-net RX).
pub trait FrameSink: Send + Sync {
    /// Returns false when the frame could not be delivered (link down or
    /// RX ring exhausted); the pump drops it like a lossy wire would.
    fn inject_frame(&self, frame: &[u8]) -> bool;
}

const UDP_FLOW_IDLE_MS: u64 = 60_000;
const PROXY_PORT_FIRST: u16 = 10_000;

struct Shared {
    running: AtomicBool,
    link_up: AtomicBool,
    tx_queue: Mutex<VecDeque<Vec<u8>>>,
    tx_pending: AtomicBool,
    forward_update: Mutex<Option<Vec<PortForward>>>,
}

/// User-mode network backend. `start` launches the single network thread;
/// everything else just posts work to it.
pub struct NetBackend {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl NetBackend {
    pub fn new(link_up: bool) -> Self {
        NetBackend {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                link_up: AtomicBool::new(link_up),
                tx_queue: Mutex::new(VecDeque::new()),
                tx_pending: AtomicBool::new(false),
                forward_update: Mutex::new(None),
            }),
            thread: None,
        }
    }

    pub fn start(&mut self, sink: Arc<dyn FrameSink>, forwards: Vec<PortForward>) {
        if self.thread.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        *self.shared.forward_update.lock().unwrap() = Some(forwards);
        let shared = self.shared.clone();
        self.thread = Some(
            std::thread::Builder::new()
                .name("tenbox-net".into())
                .spawn(move || Pump::new(shared, sink).run())
                .expect("spawn network thread"),
        );
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn set_link_up(&self, up: bool) {
        self.shared.link_up.store(up, Ordering::SeqCst);
    }

    /// Called from a vCPU thread for each guest TX frame.
    pub fn enqueue_tx(&self, frame: &[u8]) {
        self.shared.tx_queue.lock().unwrap().push_back(frame.to_vec());
        self.shared.tx_pending.store(true, Ordering::Release);
    }

    pub fn update_port_forwards(&self, forwards: Vec<PortForward>) {
        *self.shared.forward_update.lock().unwrap() = Some(forwards);
    }

    /// Cheap cloneable handle for the guest TX path, so virtio-net's
    /// transmit callback does not need to own the backend.
    pub fn tx_handle(&self) -> TxHandle {
        TxHandle { shared: self.shared.clone() }
    }
}

#[derive(Clone)]
pub struct TxHandle {
    shared: Arc<Shared>,
}

impl TxHandle {
    pub fn enqueue_tx(&self, frame: &[u8]) {
        self.shared.tx_queue.lock().unwrap().push_back(frame.to_vec());
        self.shared.tx_pending.store(true, Ordering::Release);
    }
}

impl Drop for NetBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

struct TcpFlow {
    stream: TcpStream,
    connecting: bool,
    pending_to_host: Vec<u8>,
    close_when_drained: bool,
}

struct UdpFlow {
    socket: UdpSocket,
    dst: SocketAddrV4,
    guest_src_port: u16,
    last_active: Instant,
}

struct PfListener {
    forward: PortForward,
    listener: TcpListener,
}

struct Pump {
    shared: Arc<Shared>,
    sink: Arc<dyn FrameSink>,
    stack: NetworkStack,
    tcp: HashMap<u32, TcpFlow>,
    udp: HashMap<(u16, Ipv4Addr, u16), UdpFlow>,
    listeners: Vec<PfListener>,
    icmp: Option<IcmpRelay>,
    next_proxy_port: u16,
    epoch: Instant,
}

impl Pump {
    fn new(shared: Arc<Shared>, sink: Arc<dyn FrameSink>) -> Self {
        Pump {
            shared,
            sink,
            stack: NetworkStack::new(StackConfig::default()),
            tcp: HashMap::new(),
            udp: HashMap::new(),
            listeners: Vec::new(),
            icmp: IcmpRelay::open(),
            next_proxy_port: PROXY_PORT_FIRST,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn run(mut self) {
        info!("network thread running");
        let mut last_poll = Instant::now();

        while self.shared.running.load(Ordering::SeqCst) {
            let mut busy = false;
            busy |= self.drain_guest_tx();
            busy |= self.service_tcp_flows();
            busy |= self.service_udp_flows();
            busy |= self.service_listeners();
            busy |= self.service_icmp();
            self.apply_forward_updates();

            if last_poll.elapsed() >= Duration::from_secs(1) {
                last_poll = Instant::now();
                let now = self.now_ms();
                let actions = self.stack.poll(now);
                self.execute(actions);
                self.reap_udp_flows();
            }

            if !busy {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        info!("network thread exiting");
    }

    fn drain_guest_tx(&mut self) -> bool {
        if !self.shared.tx_pending.swap(false, Ordering::Acquire) {
            return false;
        }
        let frames: Vec<Vec<u8>> = {
            let mut queue = self.shared.tx_queue.lock().unwrap();
            queue.drain(..).collect()
        };
        if frames.is_empty() {
            return false;
        }
        let now = self.now_ms();
        for frame in frames {
            let actions = self.stack.process_outbound_ethernet(&frame, now);
            self.execute(actions);
        }
        true
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::EmitFrame(frame) => {
                    if self.shared.link_up.load(Ordering::SeqCst) {
                        self.sink.inject_frame(&frame);
                    }
                }
                Action::TcpConnect { connection_id, remote_ip, remote_port } => {
                    self.open_host_tcp(connection_id, remote_ip, remote_port);
                }
                Action::TcpSend { connection_id, data } => {
                    if let Some(flow) = self.tcp.get_mut(&connection_id) {
                        flow.pending_to_host.extend_from_slice(&data);
                    }
                }
                Action::TcpClose { connection_id } => {
                    if let Some(flow) = self.tcp.get_mut(&connection_id) {
                        flow.close_when_drained = true;
                    }
                }
                Action::UdpSend { src_port, dst_ip, dst_port, data } => {
                    self.send_udp(src_port, dst_ip, dst_port, &data);
                }
                Action::IcmpEchoRequest { dst_ip, ident, seq, payload } => {
                    if let Some(icmp) = &mut self.icmp {
                        icmp.send_echo(dst_ip, ident, seq, &payload);
                    }
                }
            }
        }
    }

    fn alloc_proxy_port(&mut self) -> u16 {
        let port = self.next_proxy_port;
        self.next_proxy_port = if self.next_proxy_port == u16::MAX {
            PROXY_PORT_FIRST
        } else {
            self.next_proxy_port + 1
        };
        port
    }

    /// Non-blocking connect bound to a fresh proxy port.
    fn open_host_tcp(&mut self, id: u32, remote_ip: Ipv4Addr, remote_port: u16) {
        let result = (|| -> std::io::Result<TcpStream> {
            let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
            socket.set_nonblocking(true)?;
            // Proxy ports stay in the NAT range when the OS lets us have
            // one; otherwise fall back to an ephemeral port.
            for _ in 0..8 {
                let port = self.alloc_proxy_port();
                let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
                if socket.bind(&bind.into()).is_ok() {
                    break;
                }
            }
            let addr = SocketAddrV4::new(remote_ip, remote_port);
            match socket.connect(&addr.into()) {
                Ok(()) => {}
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock
                        || e.raw_os_error() == Some(115) // EINPROGRESS
                        || e.raw_os_error() == Some(10035) => {}
                Err(e) => return Err(e),
            }
            Ok(socket.into())
        })();

        match result {
            Ok(stream) => {
                self.tcp.insert(
                    id,
                    TcpFlow {
                        stream,
                        connecting: true,
                        pending_to_host: Vec::new(),
                        close_when_drained: false,
                    },
                );
            }
            Err(e) => {
                debug!(id, %remote_ip, remote_port, error = %e, "host connect failed");
                let now = self.now_ms();
                let actions = self
                    .stack
                    .handle_tcp_proxy_event(TcpProxyEvent::Error { connection_id: id }, now);
                self.execute(actions);
            }
        }
    }

    fn service_tcp_flows(&mut self) -> bool {
        let mut busy = false;
        let mut events = Vec::new();
        let mut dead = Vec::new();

        for (id, flow) in self.tcp.iter_mut() {
            if flow.connecting {
                match flow.stream.peer_addr() {
                    Ok(_) => {
                        flow.connecting = false;
                        events.push(TcpProxyEvent::Connected { connection_id: *id });
                        busy = true;
                    }
                    Err(e) if e.kind() == ErrorKind::NotConnected => {
                        if let Ok(Some(err)) = flow.stream.take_error() {
                            debug!(id, error = %err, "host connect failed");
                            events.push(TcpProxyEvent::Error { connection_id: *id });
                            dead.push(*id);
                        }
                        continue;
                    }
                    Err(_) => {
                        events.push(TcpProxyEvent::Error { connection_id: *id });
                        dead.push(*id);
                        continue;
                    }
                }
            }

            // Drain guest -> host bytes.
            while !flow.pending_to_host.is_empty() {
                match flow.stream.write(&flow.pending_to_host) {
                    Ok(0) => break,
                    Ok(n) => {
                        flow.pending_to_host.drain(..n);
                        busy = true;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        events.push(TcpProxyEvent::Error { connection_id: *id });
                        dead.push(*id);
                        break;
                    }
                }
            }

            if flow.close_when_drained && flow.pending_to_host.is_empty() {
                let _ = flow.stream.shutdown(std::net::Shutdown::Write);
            }

            // Host -> guest bytes.
            let mut buf = [0u8; 16 * 1024];
            loop {
                match flow.stream.read(&mut buf) {
                    Ok(0) => {
                        events.push(TcpProxyEvent::Closed { connection_id: *id });
                        dead.push(*id);
                        break;
                    }
                    Ok(n) => {
                        busy = true;
                        events.push(TcpProxyEvent::Data {
                            connection_id: *id,
                            data: buf[..n].to_vec(),
                        });
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => {
                        events.push(TcpProxyEvent::Error { connection_id: *id });
                        dead.push(*id);
                        break;
                    }
                }
            }
        }

        for id in dead {
            self.tcp.remove(&id);
        }
        let now = self.now_ms();
        for event in events {
            let actions = self.stack.handle_tcp_proxy_event(event, now);
            self.execute(actions);
        }
        busy
    }

    fn send_udp(&mut self, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16, data: &[u8]) {
        let key = (src_port, dst_ip, dst_port);
        if !self.udp.contains_key(&key) {
            // One host socket per flow, bound into the proxy-port range so
            // replies route back unambiguously.
            let socket = (0..8)
                .find_map(|_| {
                    let port = self.alloc_proxy_port();
                    UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).ok()
                })
                .or_else(|| UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).ok());
            let Some(socket) = socket else {
                warn!("failed to bind UDP proxy socket");
                return;
            };
            if socket.set_nonblocking(true).is_err() {
                return;
            }
            self.udp.insert(
                key,
                UdpFlow {
                    socket,
                    dst: SocketAddrV4::new(dst_ip, dst_port),
                    guest_src_port: src_port,
                    last_active: Instant::now(),
                },
            );
        }

        let flow = self.udp.get_mut(&key).unwrap();
        flow.last_active = Instant::now();
        if let Err(e) = flow.socket.send_to(data, flow.dst) {
            debug!(error = %e, %dst_ip, dst_port, "UDP send failed");
        }
    }

    fn service_udp_flows(&mut self) -> bool {
        let mut busy = false;
        let mut inbound = Vec::new();
        for flow in self.udp.values_mut() {
            let mut buf = [0u8; 64 * 1024];
            loop {
                match flow.socket.recv_from(&mut buf) {
                    Ok((n, SocketAddr::V4(from))) => {
                        busy = true;
                        flow.last_active = Instant::now();
                        inbound.push(UdpProxyEvent {
                            src_ip: *from.ip(),
                            src_port: from.port(),
                            dst_port: flow.guest_src_port,
                            data: buf[..n].to_vec(),
                        });
                    }
                    Ok(_) => continue,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }
        let now = self.now_ms();
        for event in inbound {
            let actions = self.stack.handle_udp_event(event, now);
            self.execute(actions);
        }
        busy
    }

    fn reap_udp_flows(&mut self) {
        let idle = Duration::from_millis(UDP_FLOW_IDLE_MS);
        self.udp.retain(|_, flow| flow.last_active.elapsed() < idle);
    }

    fn service_icmp(&mut self) -> bool {
        let Some(icmp) = &mut self.icmp else {
            return false;
        };
        let replies = icmp.recv_replies();
        let busy = !replies.is_empty();
        for (src, ident, seq, payload) in replies {
            let actions = self.stack.handle_icmp_echo_reply(src, ident, seq, &payload);
            self.execute(actions);
        }
        busy
    }

    fn apply_forward_updates(&mut self) {
        let Some(update) = self.shared.forward_update.lock().unwrap().take() else {
            return;
        };

        // Reconcile: tear down removed listeners, add new ones.
        self.listeners.retain(|l| {
            let keep = update.contains(&l.forward);
            if !keep {
                info!(host_port = l.forward.host_port, "port forward removed");
            }
            keep
        });

        for forward in update {
            if self.listeners.iter().any(|l| l.forward == forward) {
                continue;
            }
            let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, forward.host_port);
            match TcpListener::bind(addr) {
                Ok(listener) => {
                    if listener.set_nonblocking(true).is_ok() {
                        info!(
                            host_port = forward.host_port,
                            guest_port = forward.guest_port,
                            "port forward listening"
                        );
                        self.listeners.push(PfListener { forward, listener });
                    }
                }
                Err(e) => {
                    warn!(host_port = forward.host_port, error = %e, "port forward bind failed")
                }
            }
        }
    }

    fn service_listeners(&mut self) -> bool {
        let mut busy = false;
        let mut accepted = Vec::new();
        for l in &self.listeners {
            loop {
                match l.listener.accept() {
                    Ok((stream, peer)) => {
                        busy = true;
                        debug!(%peer, guest_port = l.forward.guest_port, "forward accepted");
                        accepted.push((stream, l.forward.guest_port));
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }

        let now = self.now_ms();
        for (stream, guest_port) in accepted {
            if stream.set_nonblocking(true).is_err() {
                continue;
            }
            let (id, actions) = self.stack.open_guest_connection(guest_port, now);
            self.tcp.insert(
                id,
                TcpFlow {
                    stream,
                    connecting: false,
                    pending_to_host: Vec::new(),
                    close_when_drained: false,
                },
            );
            self.execute(actions);
        }
        busy
    }
}

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing::{debug, warn};

use crate::packet::*;

pub const DEFAULT_GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);
pub const DEFAULT_GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
const DEFAULT_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
const DEFAULT_GATEWAY_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x57]);

const TCP_WINDOW: u16 = 0xFFFF;
const TCP_MSS: usize = 1460;
/// Data buffered toward a not-yet-connected proxy before the connection is
/// aborted.
const MAX_PENDING_TO_PROXY: usize = 256 * 1024;
/// Entries idle longer than this are reaped with a reset.
const IDLE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
    pub gateway_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway_mac: MacAddr,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            gateway_ip: DEFAULT_GATEWAY_IP,
            guest_ip: DEFAULT_GUEST_IP,
            netmask: DEFAULT_NETMASK,
            gateway_mac: DEFAULT_GATEWAY_MAC,
        }
    }
}

/// Host-side work the pump must perform for the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Deliver a frame to the guest via virtio-net.
    EmitFrame(Vec<u8>),
    /// Open a host TCP connection for a guest-initiated flow.
    TcpConnect { connection_id: u32, remote_ip: Ipv4Addr, remote_port: u16 },
    /// Forward guest payload bytes to the host side of a flow.
    TcpSend { connection_id: u32, data: Vec<u8> },
    /// Close the host side of a flow.
    TcpClose { connection_id: u32 },
    /// Send a UDP datagram from the flow's host socket.
    UdpSend { src_port: u16, dst_ip: Ipv4Addr, dst_port: u16, data: Vec<u8> },
    /// Relay a guest ping through the host ICMP socket.
    IcmpEchoRequest { dst_ip: Ipv4Addr, ident: u16, seq: u16, payload: Vec<u8> },
}

/// Host socket lifecycle events fed back into the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpProxyEvent {
    Connected { connection_id: u32 },
    Data { connection_id: u32, data: Vec<u8> },
    Closed { connection_id: u32 },
    Error { connection_id: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpProxyEvent {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
    /// Guest SYN seen, our SYN-ACK sent, waiting for the guest's ACK.
    SynReceived,
    /// Inbound port forward: our SYN sent to the guest.
    SynSentToGuest,
    Established,
    /// Our FIN is out, waiting for the guest to ACK it.
    FinWait,
    Closed,
}

struct TcpConn {
    id: u32,
    guest_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    state: TcpState,
    /// Next sequence number we send toward the guest.
    snd_nxt: u32,
    /// Next sequence number expected from the guest.
    rcv_nxt: u32,
    proxy_connected: bool,
    pending_to_proxy: Vec<u8>,
    guest_closed: bool,
    proxy_closed: bool,
    last_active_ms: u64,
}

/// The NAT core. One instance lives on the network thread; vCPU threads
/// only hand frames over through the pump's queue.
pub struct NetworkStack {
    config: StackConfig,
    guest_mac: Option<MacAddr>,
    ip_assigned: bool,
    connections: HashMap<u32, TcpConn>,
    /// (guest_port, remote_ip, remote_port) -> connection id.
    flows: HashMap<(u16, Ipv4Addr, u16), u32>,
    next_conn_id: u32,
    ipv4_ident: u16,
}

impl NetworkStack {
    pub fn new(config: StackConfig) -> Self {
        NetworkStack {
            config,
            guest_mac: None,
            ip_assigned: false,
            connections: HashMap::new(),
            flows: HashMap::new(),
            next_conn_id: 1,
            ipv4_ident: 1,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn is_ip_assigned(&self) -> bool {
        self.ip_assigned
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn guest_mac_or_broadcast(&self) -> MacAddr {
        self.guest_mac.unwrap_or(MacAddr::BROADCAST)
    }

    fn next_ident(&mut self) -> u16 {
        let id = self.ipv4_ident;
        self.ipv4_ident = self.ipv4_ident.wrapping_add(1);
        id
    }

    fn frame_to_guest(&mut self, protocol: u8, src_ip: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let ident = self.next_ident();
        let ip = build_ipv4(ident, protocol, src_ip, self.config.guest_ip, payload);
        build_ethernet(
            self.guest_mac_or_broadcast(),
            self.config.gateway_mac,
            ETHERTYPE_IPV4,
            &ip,
        )
    }

    fn tcp_to_guest(
        &mut self,
        conn: &ConnKeys,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let guest_ip = self.config.guest_ip;
        let tcp = build_tcp(
            conn.remote_ip,
            guest_ip,
            conn.remote_port,
            conn.guest_port,
            seq,
            ack,
            flags,
            TCP_WINDOW,
            payload,
        );
        self.frame_to_guest(IPPROTO_TCP, conn.remote_ip, &tcp)
    }

    /// Consume one guest-transmitted Ethernet frame.
    pub fn process_outbound_ethernet(&mut self, frame: &[u8], now_ms: u64) -> Vec<Action> {
        let Some(eth) = EthernetFrame::parse(frame) else {
            return Vec::new();
        };
        self.guest_mac = Some(eth.src_mac());

        match eth.ethertype() {
            ETHERTYPE_ARP => self.handle_arp(eth.payload()),
            ETHERTYPE_IPV4 => self.handle_ipv4(eth.payload(), now_ms),
            other => {
                debug!(ethertype = format_args!("{other:#06x}"), "dropping non-IPv4 frame");
                Vec::new()
            }
        }
    }

    fn handle_arp(&mut self, payload: &[u8]) -> Vec<Action> {
        let Some(arp) = ArpPacket::parse(payload) else {
            return Vec::new();
        };
        if arp.opcode() != ARP_OP_REQUEST {
            return Vec::new();
        }
        // Answer for the gateway (and on its behalf for anything outside
        // the guest's own address, so off-subnet traffic resolves).
        let target = arp.target_ip();
        if target == self.config.guest_ip {
            return Vec::new();
        }
        let reply = build_arp_reply(
            self.config.gateway_mac,
            target,
            arp.sender_mac(),
            arp.sender_ip(),
        );
        vec![Action::EmitFrame(build_ethernet(
            arp.sender_mac(),
            self.config.gateway_mac,
            ETHERTYPE_ARP,
            &reply,
        ))]
    }

    fn handle_ipv4(&mut self, payload: &[u8], now_ms: u64) -> Vec<Action> {
        let Some(ip) = Ipv4Packet::parse(payload) else {
            return Vec::new();
        };
        match ip.protocol() {
            IPPROTO_UDP => self.handle_udp(&ip, now_ms),
            IPPROTO_TCP => self.handle_tcp(&ip, now_ms),
            IPPROTO_ICMP => self.handle_icmp(&ip),
            other => {
                debug!(protocol = other, "dropping unhandled IP protocol");
                Vec::new()
            }
        }
    }

    fn handle_udp(&mut self, ip: &Ipv4Packet, _now_ms: u64) -> Vec<Action> {
        let Some(udp) = UdpPacket::parse(ip.payload()) else {
            return Vec::new();
        };

        if udp.dst_port() == 67 {
            return self.handle_dhcp(udp.payload());
        }

        if ip.dst_ip() == self.config.gateway_ip {
            return Vec::new();
        }

        vec![Action::UdpSend {
            src_port: udp.src_port(),
            dst_ip: ip.dst_ip(),
            dst_port: udp.dst_port(),
            data: udp.payload().to_vec(),
        }]
    }

    /// Reply path for a datagram the host socket received.
    pub fn handle_udp_event(&mut self, event: UdpProxyEvent, _now_ms: u64) -> Vec<Action> {
        let udp = build_udp(
            event.src_ip,
            self.config.guest_ip,
            event.src_port,
            event.dst_port,
            &event.data,
        );
        let frame = self.frame_to_guest(IPPROTO_UDP, event.src_ip, &udp);
        vec![Action::EmitFrame(frame)]
    }

    fn handle_icmp(&mut self, ip: &Ipv4Packet) -> Vec<Action> {
        let Some(echo) = IcmpEcho::parse(ip.payload()) else {
            return Vec::new();
        };
        if !echo.is_request() {
            return Vec::new();
        }

        if ip.dst_ip() == self.config.gateway_ip {
            // The gateway answers its own pings.
            let reply = build_icmp_echo(true, echo.ident(), echo.seq(), echo.payload());
            let frame = self.frame_to_guest(IPPROTO_ICMP, self.config.gateway_ip, &reply);
            return vec![Action::EmitFrame(frame)];
        }

        vec![Action::IcmpEchoRequest {
            dst_ip: ip.dst_ip(),
            ident: echo.ident(),
            seq: echo.seq(),
            payload: echo.payload().to_vec(),
        }]
    }

    /// An echo reply arrived on the host ICMP socket.
    pub fn handle_icmp_echo_reply(
        &mut self,
        src_ip: Ipv4Addr,
        ident: u16,
        seq: u16,
        payload: &[u8],
    ) -> Vec<Action> {
        let reply = build_icmp_echo(true, ident, seq, payload);
        let frame = self.frame_to_guest(IPPROTO_ICMP, src_ip, &reply);
        vec![Action::EmitFrame(frame)]
    }

    // --- DHCP -----------------------------------------------------------

    fn handle_dhcp(&mut self, payload: &[u8]) -> Vec<Action> {
        if payload.len() < 240 || payload[236..240] != [99, 130, 83, 99] {
            return Vec::new();
        }
        let xid = u32::from_be_bytes(payload[4..8].try_into().unwrap());
        let chaddr: [u8; 6] = payload[28..34].try_into().unwrap();

        // Find the message-type option (53).
        let mut msg_type = 0u8;
        let mut opts = &payload[240..];
        while opts.len() >= 2 {
            let (code, len) = (opts[0], usize::from(opts[1]));
            if code == 255 {
                break;
            }
            if opts.len() < 2 + len {
                break;
            }
            if code == 53 && len == 1 {
                msg_type = opts[2];
            }
            opts = &opts[2 + len..];
        }

        let reply_type = match msg_type {
            1 => 2, // DISCOVER -> OFFER
            3 => 5, // REQUEST -> ACK
            _ => return Vec::new(),
        };
        if reply_type == 5 {
            self.ip_assigned = true;
        }

        let reply = self.build_dhcp_reply(reply_type, xid, chaddr);
        let udp = build_udp(
            self.config.gateway_ip,
            Ipv4Addr::BROADCAST,
            67,
            68,
            &reply,
        );
        let ident = self.next_ident();
        let ip = build_ipv4(
            ident,
            IPPROTO_UDP,
            self.config.gateway_ip,
            Ipv4Addr::BROADCAST,
            &udp,
        );
        vec![Action::EmitFrame(build_ethernet(
            MacAddr(chaddr),
            self.config.gateway_mac,
            ETHERTYPE_IPV4,
            &ip,
        ))]
    }

    fn build_dhcp_reply(&self, msg_type: u8, xid: u32, chaddr: [u8; 6]) -> Vec<u8> {
        let mut out = vec![0u8; 240];
        out[0] = 2; // BOOTREPLY
        out[1] = 1; // Ethernet
        out[2] = 6;
        out[4..8].copy_from_slice(&xid.to_be_bytes());
        out[16..20].copy_from_slice(&self.config.guest_ip.octets()); // yiaddr
        out[20..24].copy_from_slice(&self.config.gateway_ip.octets()); // siaddr
        out[28..34].copy_from_slice(&chaddr);
        out[236..240].copy_from_slice(&[99, 130, 83, 99]);

        out.extend_from_slice(&[53, 1, msg_type]);
        out.extend_from_slice(&[54, 4]); // server id
        out.extend_from_slice(&self.config.gateway_ip.octets());
        out.extend_from_slice(&[51, 4, 0, 1, 0x51, 0x80]); // lease: 1 day
        out.extend_from_slice(&[1, 4]); // netmask
        out.extend_from_slice(&self.config.netmask.octets());
        out.extend_from_slice(&[3, 4]); // router
        out.extend_from_slice(&self.config.gateway_ip.octets());
        out.extend_from_slice(&[6, 4]); // DNS: point at a public resolver
        out.extend_from_slice(&[8, 8, 8, 8]);
        out.push(255);
        out
    }

    // --- TCP ------------------------------------------------------------

    fn initial_seq(&self, id: u32) -> u32 {
        // Deterministic but spread out; there is no attacker between the
        // guest and its own NAT.
        id.wrapping_mul(0x9E37_79B9) ^ 0x5DEE_CE66
    }

    fn handle_tcp(&mut self, ip: &Ipv4Packet, now_ms: u64) -> Vec<Action> {
        let Some(tcp) = TcpSegment::parse(ip.payload()) else {
            return Vec::new();
        };
        let flow = (tcp.src_port(), ip.dst_ip(), tcp.dst_port());
        let keys = ConnKeys {
            guest_port: tcp.src_port(),
            remote_ip: ip.dst_ip(),
            remote_port: tcp.dst_port(),
        };

        if let Some(&id) = self.flows.get(&flow) {
            return self.handle_tcp_segment(id, &keys, &tcp, now_ms);
        }

        if tcp.flags() & TCP_FLAG_SYN != 0 && tcp.flags() & TCP_FLAG_ACK == 0 {
            return self.handle_new_syn(&keys, &tcp, now_ms);
        }

        // Stray segment with no connection: answer RST unless it is one.
        if tcp.flags() & TCP_FLAG_RST == 0 {
            let seq = tcp.ack_number();
            let ack = tcp.seq_number().wrapping_add(1);
            let frame = self.tcp_to_guest(&keys, seq, ack, TCP_FLAG_RST | TCP_FLAG_ACK, &[]);
            return vec![Action::EmitFrame(frame)];
        }
        Vec::new()
    }

    fn handle_new_syn(&mut self, keys: &ConnKeys, tcp: &TcpSegment, now_ms: u64) -> Vec<Action> {
        let id = self.next_conn_id;
        self.next_conn_id = self.next_conn_id.wrapping_add(1);

        let isn = self.initial_seq(id);
        let conn = TcpConn {
            id,
            guest_port: keys.guest_port,
            remote_ip: keys.remote_ip,
            remote_port: keys.remote_port,
            state: TcpState::SynReceived,
            snd_nxt: isn.wrapping_add(1),
            rcv_nxt: tcp.seq_number().wrapping_add(1),
            proxy_connected: false,
            pending_to_proxy: Vec::new(),
            guest_closed: false,
            proxy_closed: false,
            last_active_ms: now_ms,
        };
        let rcv_nxt = conn.rcv_nxt;
        self.connections.insert(id, conn);
        self.flows
            .insert((keys.guest_port, keys.remote_ip, keys.remote_port), id);

        debug!(
            id,
            guest_port = keys.guest_port,
            remote = %keys.remote_ip,
            remote_port = keys.remote_port,
            "TCP flow intercepted"
        );

        let syn_ack = self.tcp_to_guest(keys, isn, rcv_nxt, TCP_FLAG_SYN | TCP_FLAG_ACK, &[]);
        vec![
            Action::TcpConnect {
                connection_id: id,
                remote_ip: keys.remote_ip,
                remote_port: keys.remote_port,
            },
            Action::EmitFrame(syn_ack),
        ]
    }

    fn handle_tcp_segment(
        &mut self,
        id: u32,
        keys: &ConnKeys,
        tcp: &TcpSegment,
        now_ms: u64,
    ) -> Vec<Action> {
        let mut actions = Vec::new();

        let Some(conn) = self.connections.get_mut(&id) else {
            return actions;
        };
        conn.last_active_ms = now_ms;

        if tcp.flags() & TCP_FLAG_RST != 0 {
            conn.state = TcpState::Closed;
            conn.guest_closed = true;
            conn.proxy_closed = true;
            actions.push(Action::TcpClose { connection_id: id });
            self.drop_conn(id);
            return actions;
        }

        match conn.state {
            TcpState::SynReceived => {
                if tcp.flags() & TCP_FLAG_ACK != 0 && tcp.ack_number() == conn.snd_nxt {
                    conn.state = TcpState::Established;
                } else {
                    return actions;
                }
            }
            TcpState::SynSentToGuest => {
                // Waiting for the guest's SYN-ACK, handled below via SYN.
                if tcp.flags() & TCP_FLAG_SYN != 0 && tcp.flags() & TCP_FLAG_ACK != 0 {
                    if tcp.ack_number() != conn.snd_nxt {
                        return actions;
                    }
                    conn.rcv_nxt = tcp.seq_number().wrapping_add(1);
                    conn.state = TcpState::Established;
                    let (snd, rcv) = (conn.snd_nxt, conn.rcv_nxt);
                    let ack = self.tcp_to_guest(keys, snd, rcv, TCP_FLAG_ACK, &[]);
                    actions.push(Action::EmitFrame(ack));
                    return actions;
                }
                return actions;
            }
            TcpState::Closed => return actions,
            _ => {}
        }

        let Some(conn) = self.connections.get_mut(&id) else {
            return actions;
        };

        let payload = tcp.payload();
        if !payload.is_empty() {
            if tcp.seq_number() == conn.rcv_nxt {
                conn.rcv_nxt = conn.rcv_nxt.wrapping_add(payload.len() as u32);

                if conn.proxy_connected {
                    actions.push(Action::TcpSend { connection_id: id, data: payload.to_vec() });
                } else {
                    conn.pending_to_proxy.extend_from_slice(payload);
                    if conn.pending_to_proxy.len() > MAX_PENDING_TO_PROXY {
                        warn!(id, "TCP flow overflowed its pre-connect buffer");
                        actions.push(Action::TcpClose { connection_id: id });
                        let seq = conn.snd_nxt;
                        let ack = conn.rcv_nxt;
                        let rst =
                            self.tcp_to_guest(keys, seq, ack, TCP_FLAG_RST | TCP_FLAG_ACK, &[]);
                        actions.push(Action::EmitFrame(rst));
                        self.drop_conn(id);
                        return actions;
                    }
                }
            }
            // Duplicate or out-of-window data is ACKed at rcv_nxt below
            // without forwarding.
            let conn = self.connections.get_mut(&id).unwrap();
            let (snd, rcv) = (conn.snd_nxt, conn.rcv_nxt);
            let ack = self.tcp_to_guest(keys, snd, rcv, TCP_FLAG_ACK, &[]);
            actions.push(Action::EmitFrame(ack));
        }

        let Some(conn) = self.connections.get_mut(&id) else {
            return actions;
        };

        if tcp.flags() & TCP_FLAG_FIN != 0 {
            let fin_seq = tcp.seq_number().wrapping_add(payload.len() as u32);
            if fin_seq == conn.rcv_nxt {
                conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
                conn.guest_closed = true;
                actions.push(Action::TcpClose { connection_id: id });

                let (snd, rcv) = (conn.snd_nxt, conn.rcv_nxt);
                let already_finished = conn.state == TcpState::FinWait;
                let ack = self.tcp_to_guest(keys, snd, rcv, TCP_FLAG_ACK, &[]);
                actions.push(Action::EmitFrame(ack));

                if already_finished {
                    // Both directions are done.
                    self.drop_conn(id);
                } else {
                    // Close our direction too.
                    let fin = self.tcp_to_guest(keys, snd, rcv, TCP_FLAG_FIN | TCP_FLAG_ACK, &[]);
                    actions.push(Action::EmitFrame(fin));
                    let conn = self.connections.get_mut(&id).unwrap();
                    conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
                    conn.state = TcpState::FinWait;
                    conn.proxy_closed = true;
                }
            }
            return actions;
        }

        // A bare ACK of our FIN finishes the close.
        if conn.state == TcpState::FinWait
            && conn.guest_closed
            && tcp.flags() & TCP_FLAG_ACK != 0
            && tcp.ack_number() == conn.snd_nxt
        {
            self.drop_conn(id);
        }

        actions
    }

    /// Host socket events for a flow (either direction of NAT).
    pub fn handle_tcp_proxy_event(&mut self, event: TcpProxyEvent, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        match event {
            TcpProxyEvent::Connected { connection_id } => {
                if let Some(conn) = self.connections.get_mut(&connection_id) {
                    conn.proxy_connected = true;
                    conn.last_active_ms = now_ms;
                    if !conn.pending_to_proxy.is_empty() {
                        let data = std::mem::take(&mut conn.pending_to_proxy);
                        actions.push(Action::TcpSend { connection_id, data });
                    }
                }
            }
            TcpProxyEvent::Data { connection_id, data } => {
                let Some(conn) = self.connections.get_mut(&connection_id) else {
                    return actions;
                };
                if conn.state != TcpState::Established && conn.state != TcpState::FinWait {
                    return actions;
                }
                conn.last_active_ms = now_ms;
                let keys = ConnKeys::of(conn);
                let mut seq = conn.snd_nxt;
                conn.snd_nxt = conn.snd_nxt.wrapping_add(data.len() as u32);
                let rcv = conn.rcv_nxt;
                for chunk in data.chunks(TCP_MSS) {
                    let frame =
                        self.tcp_to_guest(&keys, seq, rcv, TCP_FLAG_ACK | TCP_FLAG_PSH, chunk);
                    actions.push(Action::EmitFrame(frame));
                    seq = seq.wrapping_add(chunk.len() as u32);
                }
            }
            TcpProxyEvent::Closed { connection_id } => {
                let Some(conn) = self.connections.get_mut(&connection_id) else {
                    return actions;
                };
                conn.proxy_closed = true;
                conn.last_active_ms = now_ms;
                let keys = ConnKeys::of(conn);
                match conn.state {
                    TcpState::Established => {
                        let (snd, rcv) = (conn.snd_nxt, conn.rcv_nxt);
                        conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
                        conn.state = TcpState::FinWait;
                        let fin =
                            self.tcp_to_guest(&keys, snd, rcv, TCP_FLAG_FIN | TCP_FLAG_ACK, &[]);
                        actions.push(Action::EmitFrame(fin));
                    }
                    TcpState::SynReceived | TcpState::SynSentToGuest => {
                        // Never became a connection; reset the guest.
                        let (snd, rcv) = (conn.snd_nxt, conn.rcv_nxt);
                        let rst =
                            self.tcp_to_guest(&keys, snd, rcv, TCP_FLAG_RST | TCP_FLAG_ACK, &[]);
                        actions.push(Action::EmitFrame(rst));
                        self.drop_conn(connection_id);
                    }
                    _ => {}
                }
            }
            TcpProxyEvent::Error { connection_id } => {
                let Some(conn) = self.connections.get_mut(&connection_id) else {
                    return actions;
                };
                let keys = ConnKeys::of(conn);
                let (snd, rcv) = (conn.snd_nxt, conn.rcv_nxt);
                let rst = self.tcp_to_guest(&keys, snd, rcv, TCP_FLAG_RST | TCP_FLAG_ACK, &[]);
                actions.push(Action::EmitFrame(rst));
                self.drop_conn(connection_id);
            }
        }
        actions
    }

    /// A port-forward listener accepted a host connection; dial the guest
    /// service. Returns the new connection id with the SYN to emit.
    pub fn open_guest_connection(&mut self, guest_port: u16, now_ms: u64) -> (u32, Vec<Action>) {
        let id = self.next_conn_id;
        self.next_conn_id = self.next_conn_id.wrapping_add(1);

        // The guest sees the connection as coming from the gateway on an
        // ephemeral port derived from the flow id.
        let remote_port = 10000 + (id % 50000) as u16;
        let isn = self.initial_seq(id);

        let conn = TcpConn {
            id,
            guest_port,
            remote_ip: self.config.gateway_ip,
            remote_port,
            state: TcpState::SynSentToGuest,
            snd_nxt: isn.wrapping_add(1),
            rcv_nxt: 0,
            proxy_connected: true,
            pending_to_proxy: Vec::new(),
            guest_closed: false,
            proxy_closed: false,
            last_active_ms: now_ms,
        };
        let keys = ConnKeys::of(&conn);
        self.connections.insert(id, conn);
        self.flows
            .insert((guest_port, keys.remote_ip, keys.remote_port), id);

        let syn = self.tcp_to_guest(&keys, isn, 0, TCP_FLAG_SYN, &[]);
        (id, vec![Action::EmitFrame(syn)])
    }

    pub fn is_established(&self, connection_id: u32) -> bool {
        self.connections
            .get(&connection_id)
            .map(|c| c.state == TcpState::Established)
            .unwrap_or(false)
    }

    fn drop_conn(&mut self, id: u32) {
        if let Some(conn) = self.connections.remove(&id) {
            self.flows
                .remove(&(conn.guest_port, conn.remote_ip, conn.remote_port));
        }
    }

    /// Periodic housekeeping: reap idle connections with a reset.
    pub fn poll(&mut self, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let idle: Vec<u32> = self
            .connections
            .values()
            .filter(|c| now_ms.saturating_sub(c.last_active_ms) > IDLE_TIMEOUT_MS)
            .map(|c| c.id)
            .collect();
        for id in idle {
            let conn = &self.connections[&id];
            let keys = ConnKeys::of(conn);
            let (snd, rcv) = (conn.snd_nxt, conn.rcv_nxt);
            let rst = self.tcp_to_guest(&keys, snd, rcv, TCP_FLAG_RST | TCP_FLAG_ACK, &[]);
            actions.push(Action::EmitFrame(rst));
            actions.push(Action::TcpClose { connection_id: id });
            self.drop_conn(id);
        }
        actions
    }
}

struct ConnKeys {
    guest_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
}

impl ConnKeys {
    fn of(conn: &TcpConn) -> ConnKeys {
        ConnKeys {
            guest_port: conn.guest_port,
            remote_ip: conn.remote_ip,
            remote_port: conn.remote_port,
        }
    }
}

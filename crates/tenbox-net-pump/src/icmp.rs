use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

/// Host-side echo relay. Prefers an unprivileged ICMP datagram socket and
/// falls back to a raw socket where the platform allows it. With a
/// datagram socket the kernel owns the echo identifier, so the guest's
/// identifier is remembered per (destination, sequence) and restored on
/// the way back.
pub struct IcmpRelay {
    socket: Socket,
    raw: bool,
    pending: HashMap<(Ipv4Addr, u16), u16>,
}

impl IcmpRelay {
    pub fn open() -> Option<Self> {
        let (socket, raw) = match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)) {
            Ok(s) => (s, false),
            Err(_) => match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
                Ok(s) => (s, true),
                Err(e) => {
                    warn!(error = %e, "ICMP relay unavailable, guest pings will be dropped");
                    return None;
                }
            },
        };
        if let Err(e) = socket.set_nonblocking(true) {
            warn!(error = %e, "ICMP relay socket setup failed");
            return None;
        }
        Some(IcmpRelay { socket, raw, pending: HashMap::new() })
    }

    pub fn send_echo(&mut self, dst_ip: Ipv4Addr, ident: u16, seq: u16, payload: &[u8]) {
        let packet = tenbox_net_stack::packet::build_icmp_echo(false, ident, seq, payload);
        self.pending.insert((dst_ip, seq), ident);
        let addr = SocketAddrV4::new(dst_ip, 0);
        if let Err(e) = self.socket.send_to(&packet, &addr.into()) {
            debug!(error = %e, %dst_ip, "ICMP echo send failed");
            self.pending.remove(&(dst_ip, seq));
        }
    }

    /// Poll for replies: (source, guest ident, seq, payload).
    pub fn recv_replies(&mut self) -> Vec<(Ipv4Addr, u16, u16, Vec<u8>)> {
        let mut out = Vec::new();
        let mut buf = [std::mem::MaybeUninit::<u8>::uninit(); 2048];
        loop {
            let (len, addr) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(_) => break,
            };
            let raw: Vec<u8> = buf[..len]
                .iter()
                .map(|b| unsafe { b.assume_init() })
                .collect();
            // Raw sockets deliver the IP header too.
            let icmp = if self.raw {
                if raw.len() < 20 {
                    continue;
                }
                let ihl = usize::from(raw[0] & 0x0F) * 4;
                raw[ihl..].to_vec()
            } else {
                raw
            };
            if icmp.len() < 8 || icmp[0] != 0 {
                continue; // not an echo reply
            }
            let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
            let src = match addr.as_socket_ipv4() {
                Some(a) => *a.ip(),
                None => continue,
            };
            let Some(guest_ident) = self.pending.remove(&(src, seq)) else {
                continue;
            };
            out.push((src, guest_ident, seq, icmp[8..].to_vec()));
        }
        out
    }
}

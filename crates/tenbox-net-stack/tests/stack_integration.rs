use std::net::Ipv4Addr;

use tenbox_net_stack::packet::*;
use tenbox_net_stack::{Action, NetworkStack, StackConfig, TcpProxyEvent, UdpProxyEvent};

const GUEST_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

fn stack() -> NetworkStack {
    NetworkStack::new(StackConfig::default())
}

fn frames(actions: &[Action]) -> Vec<Vec<u8>> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::EmitFrame(f) => Some(f.clone()),
            _ => None,
        })
        .collect()
}

fn single_frame(actions: &[Action]) -> Vec<u8> {
    let fs = frames(actions);
    assert_eq!(fs.len(), 1, "expected one frame, got {actions:?}");
    fs.into_iter().next().unwrap()
}

fn wrap_udp(stack: &NetworkStack, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp = build_udp(stack.config().guest_ip, dst_ip, src_port, dst_port, payload);
    let ip = build_ipv4(1, IPPROTO_UDP, stack.config().guest_ip, dst_ip, &udp);
    build_ethernet(stack.config().gateway_mac, GUEST_MAC, ETHERTYPE_IPV4, &ip)
}

#[allow(clippy::too_many_arguments)]
fn wrap_tcp(
    stack: &NetworkStack,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let tcp = build_tcp(
        stack.config().guest_ip,
        dst_ip,
        src_port,
        dst_port,
        seq,
        ack,
        flags,
        65535,
        payload,
    );
    let ip = build_ipv4(2, IPPROTO_TCP, stack.config().guest_ip, dst_ip, &tcp);
    build_ethernet(stack.config().gateway_mac, GUEST_MAC, ETHERTYPE_IPV4, &ip)
}

fn parse_tcp(frame: &[u8]) -> (Ipv4Addr, Ipv4Addr, Vec<u8>, u8, u32, u32, u16, u16) {
    let eth = EthernetFrame::parse(frame).unwrap();
    assert_eq!(eth.ethertype(), ETHERTYPE_IPV4);
    let ip = Ipv4Packet::parse(eth.payload()).unwrap();
    assert_eq!(ip.protocol(), IPPROTO_TCP);
    let tcp = TcpSegment::parse(ip.payload()).unwrap();
    (
        ip.src_ip(),
        ip.dst_ip(),
        tcp.payload().to_vec(),
        tcp.flags(),
        tcp.seq_number(),
        tcp.ack_number(),
        tcp.src_port(),
        tcp.dst_port(),
    )
}

fn build_dhcp(msg_type: u8, xid: u32) -> Vec<u8> {
    let mut out = vec![0u8; 240];
    out[0] = 1;
    out[1] = 1;
    out[2] = 6;
    out[4..8].copy_from_slice(&xid.to_be_bytes());
    out[28..34].copy_from_slice(&GUEST_MAC.0);
    out[236..240].copy_from_slice(&[99, 130, 83, 99]);
    out.extend_from_slice(&[53, 1, msg_type]);
    out.push(255);
    out
}

fn dhcp_handshake(stack: &mut NetworkStack) {
    let discover = build_dhcp(1, 0x1020_3040);
    let udp = build_udp(Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST, 68, 67, &discover);
    let ip = build_ipv4(1, IPPROTO_UDP, Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST, &udp);
    let frame = build_ethernet(MacAddr::BROADCAST, GUEST_MAC, ETHERTYPE_IPV4, &ip);

    let offer = single_frame(&stack.process_outbound_ethernet(&frame, 0));
    let eth = EthernetFrame::parse(&offer).unwrap();
    let ip = Ipv4Packet::parse(eth.payload()).unwrap();
    let udp = UdpPacket::parse(ip.payload()).unwrap();
    assert_eq!(udp.src_port(), 67);
    assert_eq!(udp.dst_port(), 68);
    let payload = udp.payload();
    assert_eq!(payload[0], 2); // BOOTREPLY
    assert_eq!(
        payload[16..20],
        stack.config().guest_ip.octets(),
        "OFFER carries the guest lease"
    );

    let request = build_dhcp(3, 0x1020_3040);
    let udp = build_udp(Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST, 68, 67, &request);
    let ip = build_ipv4(2, IPPROTO_UDP, Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST, &udp);
    let frame = build_ethernet(MacAddr::BROADCAST, GUEST_MAC, ETHERTYPE_IPV4, &ip);
    let ack = single_frame(&stack.process_outbound_ethernet(&frame, 1));
    let eth = EthernetFrame::parse(&ack).unwrap();
    let ip = Ipv4Packet::parse(eth.payload()).unwrap();
    let udp = UdpPacket::parse(ip.payload()).unwrap();
    // Option 53 == 5 (ACK) right after the cookie.
    assert_eq!(&udp.payload()[240..243], &[53, 1, 5]);
    assert!(stack.is_ip_assigned());
}

#[test]
fn dhcp_lease_binds_the_guest_ip() {
    let mut stack = stack();
    dhcp_handshake(&mut stack);
}

#[test]
fn arp_request_for_gateway_is_answered() {
    let mut stack = stack();
    let mut arp = Vec::new();
    arp.extend_from_slice(&1u16.to_be_bytes());
    arp.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    arp.push(6);
    arp.push(4);
    arp.extend_from_slice(&ARP_OP_REQUEST.to_be_bytes());
    arp.extend_from_slice(&GUEST_MAC.0);
    arp.extend_from_slice(&stack.config().guest_ip.octets());
    arp.extend_from_slice(&[0u8; 6]);
    arp.extend_from_slice(&stack.config().gateway_ip.octets());
    let frame = build_ethernet(MacAddr::BROADCAST, GUEST_MAC, ETHERTYPE_ARP, &arp);

    let reply = single_frame(&stack.process_outbound_ethernet(&frame, 0));
    let eth = EthernetFrame::parse(&reply).unwrap();
    assert_eq!(eth.ethertype(), ETHERTYPE_ARP);
    assert_eq!(eth.dest_mac(), GUEST_MAC);
    let arp = ArpPacket::parse(eth.payload()).unwrap();
    assert_eq!(arp.opcode(), ARP_OP_REPLY);
    assert_eq!(arp.sender_ip(), stack.config().gateway_ip);
    assert_eq!(arp.sender_mac(), stack.config().gateway_mac);
}

#[test]
fn udp_dns_flow_round_trips_byte_identical() {
    let mut stack = stack();
    dhcp_handshake(&mut stack);

    let dns_server = Ipv4Addr::new(8, 8, 8, 8);
    let query = b"\x12\x34\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00\x07example\x03com\x00\x00\x01\x00\x01";
    let frame = wrap_udp(&stack, 53123, dns_server, 53, query);
    let actions = stack.process_outbound_ethernet(&frame, 10);

    // The guest datagram leaves through a host socket untouched.
    assert_eq!(
        actions,
        vec![Action::UdpSend {
            src_port: 53123,
            dst_ip: dns_server,
            dst_port: 53,
            data: query.to_vec(),
        }]
    );

    // The host reply comes back from 8.8.8.8:53 with identical bytes.
    let response = b"\x12\x34\x81\x80answer-bytes";
    let actions = stack.handle_udp_event(
        UdpProxyEvent {
            src_ip: dns_server,
            src_port: 53,
            dst_port: 53123,
            data: response.to_vec(),
        },
        11,
    );
    let frame = single_frame(&actions);
    let eth = EthernetFrame::parse(&frame).unwrap();
    let ip = Ipv4Packet::parse(eth.payload()).unwrap();
    assert_eq!(ip.src_ip(), dns_server);
    assert_eq!(ip.dst_ip(), stack.config().guest_ip);
    let udp = UdpPacket::parse(ip.payload()).unwrap();
    assert_eq!(udp.src_port(), 53);
    assert_eq!(udp.dst_port(), 53123);
    assert_eq!(udp.payload(), response);
}

#[test]
fn guest_ping_to_gateway_is_answered_locally() {
    let mut stack = stack();
    let echo = build_icmp_echo(false, 7, 1, b"pingdata");
    let ip = build_ipv4(3, IPPROTO_ICMP, stack.config().guest_ip, stack.config().gateway_ip, &echo);
    let frame = build_ethernet(stack.config().gateway_mac, GUEST_MAC, ETHERTYPE_IPV4, &ip);

    let reply = single_frame(&stack.process_outbound_ethernet(&frame, 0));
    let eth = EthernetFrame::parse(&reply).unwrap();
    let ip = Ipv4Packet::parse(eth.payload()).unwrap();
    let icmp = IcmpEcho::parse(ip.payload()).unwrap();
    assert!(!icmp.is_request());
    assert_eq!(icmp.ident(), 7);
    assert_eq!(icmp.payload(), b"pingdata");
}

#[test]
fn guest_ping_to_internet_is_relayed() {
    let mut stack = stack();
    let target = Ipv4Addr::new(1, 1, 1, 1);
    let echo = build_icmp_echo(false, 3, 9, b"x");
    let ip = build_ipv4(3, IPPROTO_ICMP, stack.config().guest_ip, target, &echo);
    let frame = build_ethernet(stack.config().gateway_mac, GUEST_MAC, ETHERTYPE_IPV4, &ip);

    let actions = stack.process_outbound_ethernet(&frame, 0);
    assert_eq!(
        actions,
        vec![Action::IcmpEchoRequest { dst_ip: target, ident: 3, seq: 9, payload: b"x".to_vec() }]
    );

    let reply = single_frame(&stack.handle_icmp_echo_reply(target, 3, 9, b"x"));
    let eth = EthernetFrame::parse(&reply).unwrap();
    let ip = Ipv4Packet::parse(eth.payload()).unwrap();
    assert_eq!(ip.src_ip(), target);
}

struct TcpFlow {
    remote_ip: Ipv4Addr,
    guest_port: u16,
    guest_next: u32,
    server_next: u32,
    conn_id: u32,
}

/// SYN -> SYN-ACK -> proxy connect -> ACK: an established NAT flow.
fn establish_tcp(stack: &mut NetworkStack, guest_port: u16) -> TcpFlow {
    let remote_ip = Ipv4Addr::new(93, 184, 216, 34);
    let guest_isn = 5000;

    let syn = wrap_tcp(stack, guest_port, remote_ip, 80, guest_isn, 0, TCP_FLAG_SYN, &[]);
    let actions = stack.process_outbound_ethernet(&syn, 0);

    let mut conn_id = None;
    for a in &actions {
        if let Action::TcpConnect { connection_id, remote_ip: rip, remote_port } = a {
            assert_eq!(*rip, remote_ip);
            assert_eq!(*remote_port, 80);
            conn_id = Some(*connection_id);
        }
    }
    let conn_id = conn_id.expect("TcpConnect action");

    let syn_ack = single_frame(&actions);
    let (_, _, _, flags, server_isn, ack, src_port, dst_port) = parse_tcp(&syn_ack);
    assert_eq!(flags, TCP_FLAG_SYN | TCP_FLAG_ACK);
    assert_eq!(ack, guest_isn + 1);
    assert_eq!(src_port, 80);
    assert_eq!(dst_port, guest_port);

    assert!(stack
        .handle_tcp_proxy_event(TcpProxyEvent::Connected { connection_id: conn_id }, 1)
        .is_empty());

    let ack_frame = wrap_tcp(
        stack,
        guest_port,
        remote_ip,
        80,
        guest_isn + 1,
        server_isn + 1,
        TCP_FLAG_ACK,
        &[],
    );
    assert!(stack.process_outbound_ethernet(&ack_frame, 2).is_empty());
    assert!(stack.is_established(conn_id));

    TcpFlow {
        remote_ip,
        guest_port,
        guest_next: guest_isn + 1,
        server_next: server_isn + 1,
        conn_id,
    }
}

#[test]
fn tcp_connect_send_and_receive() {
    let mut stack = stack();
    dhcp_handshake(&mut stack);
    let mut flow = establish_tcp(&mut stack, 40001);

    // Guest sends a request; it is forwarded to the proxy and ACKed.
    let payload = b"GET / HTTP/1.0\r\n\r\n";
    let psh = wrap_tcp(
        &stack,
        flow.guest_port,
        flow.remote_ip,
        80,
        flow.guest_next,
        flow.server_next,
        TCP_FLAG_ACK | TCP_FLAG_PSH,
        payload,
    );
    let actions = stack.process_outbound_ethernet(&psh, 3);
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::TcpSend { connection_id, data } if *connection_id == flow.conn_id && data == payload
    )));
    let ack = single_frame(&actions);
    let (_, _, _, flags, _, ack_no, _, _) = parse_tcp(&ack);
    assert_eq!(flags & TCP_FLAG_ACK, TCP_FLAG_ACK);
    assert_eq!(ack_no, flow.guest_next + payload.len() as u32);
    flow.guest_next += payload.len() as u32;

    // Proxy data flows back as PSH|ACK segments.
    let response = b"HTTP/1.0 200 OK\r\n\r\n";
    let actions = stack.handle_tcp_proxy_event(
        TcpProxyEvent::Data { connection_id: flow.conn_id, data: response.to_vec() },
        4,
    );
    let frame = single_frame(&actions);
    let (_, _, data, flags, seq, _, _, _) = parse_tcp(&frame);
    assert_eq!(flags, TCP_FLAG_ACK | TCP_FLAG_PSH);
    assert_eq!(seq, flow.server_next);
    assert_eq!(data, response);
}

#[test]
fn data_before_proxy_connect_is_buffered_and_flushed() {
    let mut stack = stack();
    let remote_ip = Ipv4Addr::new(10, 11, 12, 13);
    let syn = wrap_tcp(&stack, 41000, remote_ip, 443, 100, 0, TCP_FLAG_SYN, &[]);
    let actions = stack.process_outbound_ethernet(&syn, 0);
    let conn_id = actions
        .iter()
        .find_map(|a| match a {
            Action::TcpConnect { connection_id, .. } => Some(*connection_id),
            _ => None,
        })
        .unwrap();
    let (_, _, _, _, server_isn, ..) = parse_tcp(&single_frame(&actions));

    let ack = wrap_tcp(&stack, 41000, remote_ip, 443, 101, server_isn + 1, TCP_FLAG_ACK, &[]);
    stack.process_outbound_ethernet(&ack, 1);

    // Data while the host socket is still connecting is buffered.
    let psh = wrap_tcp(
        &stack,
        41000,
        remote_ip,
        443,
        101,
        server_isn + 1,
        TCP_FLAG_ACK | TCP_FLAG_PSH,
        b"early",
    );
    let actions = stack.process_outbound_ethernet(&psh, 2);
    assert!(actions.iter().all(|a| !matches!(a, Action::TcpSend { .. })));

    // Connect flushes the buffer in order.
    let actions =
        stack.handle_tcp_proxy_event(TcpProxyEvent::Connected { connection_id: conn_id }, 3);
    assert_eq!(
        actions,
        vec![Action::TcpSend { connection_id: conn_id, data: b"early".to_vec() }]
    );
}

#[test]
fn guest_fin_closes_both_sides_and_reaps_state() {
    let mut stack = stack();
    let flow = establish_tcp(&mut stack, 40010);
    assert_eq!(stack.connection_count(), 1);

    let fin = wrap_tcp(
        &stack,
        flow.guest_port,
        flow.remote_ip,
        80,
        flow.guest_next,
        flow.server_next,
        TCP_FLAG_ACK | TCP_FLAG_FIN,
        &[],
    );
    let actions = stack.process_outbound_ethernet(&fin, 3);
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::TcpClose { connection_id } if *connection_id == flow.conn_id
    )));
    let fs = frames(&actions);
    assert_eq!(fs.len(), 2, "ACK plus our FIN");
    let fin_seg = fs
        .iter()
        .map(|f| parse_tcp(f))
        .find(|t| t.3 & TCP_FLAG_FIN != 0)
        .expect("FIN from stack");

    // Final ACK of our FIN drains the table.
    let last_ack = wrap_tcp(
        &stack,
        flow.guest_port,
        flow.remote_ip,
        80,
        flow.guest_next + 1,
        fin_seg.4 + 1,
        TCP_FLAG_ACK,
        &[],
    );
    assert!(stack.process_outbound_ethernet(&last_ack, 4).is_empty());
    assert_eq!(stack.connection_count(), 0);

    // Late proxy data for the dead flow is ignored.
    assert!(stack
        .handle_tcp_proxy_event(
            TcpProxyEvent::Data { connection_id: flow.conn_id, data: b"late".to_vec() },
            5
        )
        .is_empty());
}

#[test]
fn proxy_error_resets_the_guest() {
    let mut stack = stack();
    let remote_ip = Ipv4Addr::new(203, 0, 113, 5);
    let syn = wrap_tcp(&stack, 42000, remote_ip, 22, 900, 0, TCP_FLAG_SYN, &[]);
    let actions = stack.process_outbound_ethernet(&syn, 0);
    let conn_id = actions
        .iter()
        .find_map(|a| match a {
            Action::TcpConnect { connection_id, .. } => Some(*connection_id),
            _ => None,
        })
        .unwrap();

    let actions =
        stack.handle_tcp_proxy_event(TcpProxyEvent::Error { connection_id: conn_id }, 1);
    let (_, _, _, flags, ..) = parse_tcp(&single_frame(&actions));
    assert_eq!(flags, TCP_FLAG_RST | TCP_FLAG_ACK);
    assert_eq!(stack.connection_count(), 0);
}

#[test]
fn proxy_close_after_establish_sends_fin() {
    let mut stack = stack();
    let flow = establish_tcp(&mut stack, 40020);
    let actions =
        stack.handle_tcp_proxy_event(TcpProxyEvent::Closed { connection_id: flow.conn_id }, 3);
    let (_, _, _, flags, seq, ..) = parse_tcp(&single_frame(&actions));
    assert_eq!(flags, TCP_FLAG_FIN | TCP_FLAG_ACK);
    assert_eq!(seq, flow.server_next);
}

#[test]
fn inbound_port_forward_dials_the_guest() {
    let mut stack = stack();
    dhcp_handshake(&mut stack);

    let (conn_id, actions) = stack.open_guest_connection(8080, 0);
    let syn = single_frame(&actions);
    let (src_ip, dst_ip, _, flags, isn, _, src_port, dst_port) = parse_tcp(&syn);
    assert_eq!(flags, TCP_FLAG_SYN);
    assert_eq!(src_ip, stack.config().gateway_ip);
    assert_eq!(dst_ip, stack.config().guest_ip);
    assert_eq!(dst_port, 8080);
    assert!((10000..60000).contains(&src_port));

    // Guest's server answers SYN-ACK; the stack completes with an ACK.
    let guest_isn = 7777;
    let syn_ack = wrap_tcp(
        &stack,
        8080,
        stack.config().gateway_ip,
        src_port,
        guest_isn,
        isn + 1,
        TCP_FLAG_SYN | TCP_FLAG_ACK,
        &[],
    );
    let actions = stack.process_outbound_ethernet(&syn_ack, 1);
    let (_, _, _, flags, _, ack, ..) = parse_tcp(&single_frame(&actions));
    assert_eq!(flags, TCP_FLAG_ACK);
    assert_eq!(ack, guest_isn + 1);
    assert!(stack.is_established(conn_id));

    // Host bytes flow to the guest service.
    let actions = stack.handle_tcp_proxy_event(
        TcpProxyEvent::Data { connection_id: conn_id, data: b"hello guest".to_vec() },
        2,
    );
    let (_, _, data, _, _, _, _, dst_port) = parse_tcp(&single_frame(&actions));
    assert_eq!(dst_port, 8080);
    assert_eq!(data, b"hello guest");

    // And guest bytes flow back out.
    let reply = wrap_tcp(
        &stack,
        8080,
        stack.config().gateway_ip,
        src_port,
        guest_isn + 1,
        isn + 1 + 11,
        TCP_FLAG_ACK | TCP_FLAG_PSH,
        b"hi host",
    );
    let actions = stack.process_outbound_ethernet(&reply, 3);
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::TcpSend { connection_id, data } if *connection_id == conn_id && data == b"hi host"
    )));
}

#[test]
fn idle_connections_are_reaped_by_poll() {
    let mut stack = stack();
    let _flow = establish_tcp(&mut stack, 40030);
    assert_eq!(stack.connection_count(), 1);

    assert!(stack.poll(1000).is_empty());
    let actions = stack.poll(10 * 60 * 1000);
    assert!(actions.iter().any(|a| matches!(a, Action::TcpClose { .. })));
    assert_eq!(stack.connection_count(), 0);
}

#[test]
fn retransmitted_data_is_acked_but_not_reforwarded() {
    let mut stack = stack();
    let flow = establish_tcp(&mut stack, 40040);

    let psh = wrap_tcp(
        &stack,
        flow.guest_port,
        flow.remote_ip,
        80,
        flow.guest_next,
        flow.server_next,
        TCP_FLAG_ACK | TCP_FLAG_PSH,
        b"once",
    );
    let first = stack.process_outbound_ethernet(&psh, 3);
    assert_eq!(
        first
            .iter()
            .filter(|a| matches!(a, Action::TcpSend { .. }))
            .count(),
        1
    );

    let second = stack.process_outbound_ethernet(&psh, 4);
    assert!(second.iter().all(|a| !matches!(a, Action::TcpSend { .. })));
    // Still ACKed at the same rcv_nxt so the guest stops retransmitting.
    let (_, _, _, flags, _, ack, ..) = parse_tcp(&single_frame(&second));
    assert_eq!(flags & TCP_FLAG_ACK, TCP_FLAG_ACK);
    assert_eq!(ack, flow.guest_next + 4);
}

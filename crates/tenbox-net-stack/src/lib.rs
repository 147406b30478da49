//! Sans-io user-mode NAT for the guest's virtio-net link.
//!
//! [`NetworkStack`] consumes raw Ethernet frames the guest transmits and
//! returns [`Action`]s for the caller (the network pump thread) to carry
//! out against real host sockets; host-side events feed back in through
//! `handle_*` methods and produce frames destined for the guest. The stack
//! itself owns no sockets and never blocks, so it can run single-threaded
//! inside the network thread and be tested hermetically.

pub mod packet;
mod stack;

pub use stack::{
    Action, NetworkStack, StackConfig, TcpProxyEvent, UdpProxyEvent, DEFAULT_GATEWAY_IP,
    DEFAULT_GUEST_IP,
};

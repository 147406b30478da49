//! The network thread. Owns the sans-io [`NetworkStack`] plus every host
//! socket backing a NAT flow, executes stack actions, and feeds socket
//! events back in. vCPU threads never touch sockets: they enqueue guest
//! TX frames under a mutex and the thread drains them on its next tick.

mod icmp;
mod pump;

pub use pump::{FrameSink, NetBackend, PortForward, TxHandle};

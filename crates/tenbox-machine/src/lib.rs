//! The VM object: composes guest memory, the address space, legacy and
//! virtio devices, the network backend and the vCPU threads on top of the
//! hypervisor substrate.

mod guest_agent;
mod vm;

pub use guest_agent::GuestAgent;
pub use tenbox_net_pump::PortForward;
pub use vm::{ShareConfig, Vm, VmConfig, VmError};

//! Virtio for TenBox: the split virtqueue, the virtio-mmio transport and
//! the device backends (blk, net, gpu, input, serial, fs, snd).

pub mod devices;
mod mmio;
mod queue;

pub use mmio::{
    QueueHandle, VirtioDevice, VirtioInterrupt, VirtioMmio, VIRTIO_MMIO_SIZE,
    VIRTIO_MMIO_INT_CONFIG, VIRTIO_MMIO_INT_VRING, VIRTIO_STATUS_DRIVER_OK,
};
pub use queue::{
    ChainElem, ChainReader, ChainWriter, VirtQueue, VIRTQ_DESC_F_INDIRECT, VIRTQ_DESC_F_NEXT,
    VIRTQ_DESC_F_WRITE,
};

/// Virtio 1.x feature bit every TenBox device advertises.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

pub const VIRTIO_ID_NET: u32 = 1;
pub const VIRTIO_ID_BLOCK: u32 = 2;
pub const VIRTIO_ID_CONSOLE: u32 = 3;
pub const VIRTIO_ID_GPU: u32 = 16;
pub const VIRTIO_ID_INPUT: u32 = 18;
pub const VIRTIO_ID_SOUND: u32 = 25;
pub const VIRTIO_ID_FS: u32 = 26;

//! Host-side ports: the seams between the VM core and whatever embeds it
//! (the runtime service, a stdio console, tests).

/// Byte-stream console attached to the UART.
pub trait ConsolePort: Send + Sync {
    /// Guest transmitted bytes toward the host.
    fn write(&self, data: &[u8]);
    /// Blocking-ish read of host input destined for the guest; returns the
    /// number of bytes placed in `out` (0 means try again).
    fn read(&self, out: &mut [u8]) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyboardEvent {
    pub key_code: u32,
    pub pressed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerEvent {
    pub x: i32,
    pub y: i32,
    pub buttons: u32,
}

/// Polled input source for the virtio input devices.
pub trait InputPort: Send + Sync {
    fn poll_keyboard(&self) -> Option<KeyboardEvent>;
    fn poll_pointer(&self) -> Option<PointerEvent>;
}

/// One display update: the dirty rectangle plus its pixels.
#[derive(Debug, Clone, Default)]
pub struct DisplayFrame {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: u32,
    pub resource_width: u32,
    pub resource_height: u32,
    pub dirty_x: u32,
    pub dirty_y: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct CursorInfo {
    pub x: i32,
    pub y: i32,
    pub hot_x: u32,
    pub hot_y: u32,
    pub width: u32,
    pub height: u32,
    pub visible: bool,
    pub image_updated: bool,
    pub pixels: Vec<u8>,
}

pub trait DisplayPort: Send + Sync {
    fn submit_frame(&self, frame: DisplayFrame);
    fn submit_cursor(&self, cursor: CursorInfo);
    fn submit_scanout_state(&self, active: bool, width: u32, height: u32);
}

/// Interleaved signed 16-bit PCM destined for the host audio player.
#[derive(Debug, Clone, Default)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub channels: u16,
    pub pcm: Vec<i16>,
}

pub trait AudioPort: Send + Sync {
    fn submit_pcm(&self, chunk: AudioChunk);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipboardEvent {
    Grab { selection: u32, available_types: Vec<u32> },
    Data { selection: u32, data_type: u32, data: Vec<u8> },
    Request { selection: u32, data_type: u32 },
    Release { selection: u32 },
}

pub trait ClipboardPort: Send + Sync {
    fn on_event(&self, event: ClipboardEvent);
}

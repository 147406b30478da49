//! Host port implementations the runtime hands to the VM: a managed
//! console buffered toward the IPC service, the display/audio ports that
//! turn device output into IPC events, and the stdio console used in
//! interactive mode.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tenbox_platform::ports::{AudioChunk, AudioPort, ConsolePort, CursorInfo, DisplayFrame, DisplayPort};

/// Console wired to the IPC service: guest output accumulates until the
/// send worker flushes it as `console.data`; host input queues for the
/// VM's console thread.
pub struct ManagedConsolePort {
    pending_output: Mutex<Vec<u8>>,
    input: Mutex<VecDeque<u8>>,
    input_cv: Condvar,
    wake: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl ManagedConsolePort {
    pub fn new() -> Arc<Self> {
        Arc::new(ManagedConsolePort {
            pending_output: Mutex::new(Vec::new()),
            input: Mutex::new(VecDeque::new()),
            input_cv: Condvar::new(),
            wake: Mutex::new(None),
        })
    }

    /// Hook the send worker's wakeup.
    pub fn set_output_wake(&self, wake: Box<dyn Fn() + Send + Sync>) {
        *self.wake.lock().unwrap() = Some(wake);
    }

    pub fn take_pending_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.pending_output.lock().unwrap())
    }

    pub fn has_pending_output(&self) -> bool {
        !self.pending_output.lock().unwrap().is_empty()
    }

    /// Manager-supplied input destined for the guest.
    pub fn push_input(&self, data: &[u8]) {
        self.input.lock().unwrap().extend(data.iter().copied());
        self.input_cv.notify_all();
    }
}

impl ConsolePort for ManagedConsolePort {
    fn write(&self, data: &[u8]) {
        let notify = {
            let mut pending = self.pending_output.lock().unwrap();
            let was_empty = pending.is_empty();
            pending.extend_from_slice(data);
            was_empty
        };
        if notify {
            if let Some(wake) = self.wake.lock().unwrap().as_ref() {
                wake();
            }
        }
    }

    fn read(&self, out: &mut [u8]) -> usize {
        let mut input = self.input.lock().unwrap();
        if input.is_empty() {
            let (guard, _) = self
                .input_cv
                .wait_timeout(input, Duration::from_millis(16))
                .unwrap();
            input = guard;
        }
        let mut copied = 0;
        while copied < out.len() {
            match input.pop_front() {
                Some(byte) => {
                    out[copied] = byte;
                    copied += 1;
                }
                None => break,
            }
        }
        copied
    }
}

/// Display port that forwards frames and cursors to the IPC service.
pub struct ManagedDisplayPort {
    frame_handler: Mutex<Option<Box<dyn Fn(DisplayFrame) + Send + Sync>>>,
    cursor_handler: Mutex<Option<Box<dyn Fn(CursorInfo) + Send + Sync>>>,
    state_handler: Mutex<Option<Box<dyn Fn(bool, u32, u32) + Send + Sync>>>,
}

impl ManagedDisplayPort {
    pub fn new() -> Arc<Self> {
        Arc::new(ManagedDisplayPort {
            frame_handler: Mutex::new(None),
            cursor_handler: Mutex::new(None),
            state_handler: Mutex::new(None),
        })
    }

    pub fn set_frame_handler(&self, handler: Box<dyn Fn(DisplayFrame) + Send + Sync>) {
        *self.frame_handler.lock().unwrap() = Some(handler);
    }

    pub fn set_cursor_handler(&self, handler: Box<dyn Fn(CursorInfo) + Send + Sync>) {
        *self.cursor_handler.lock().unwrap() = Some(handler);
    }

    pub fn set_state_handler(&self, handler: Box<dyn Fn(bool, u32, u32) + Send + Sync>) {
        *self.state_handler.lock().unwrap() = Some(handler);
    }
}

impl DisplayPort for ManagedDisplayPort {
    fn submit_frame(&self, frame: DisplayFrame) {
        if let Some(handler) = self.frame_handler.lock().unwrap().as_ref() {
            handler(frame);
        }
    }

    fn submit_cursor(&self, cursor: CursorInfo) {
        if let Some(handler) = self.cursor_handler.lock().unwrap().as_ref() {
            handler(cursor);
        }
    }

    fn submit_scanout_state(&self, active: bool, width: u32, height: u32) {
        if let Some(handler) = self.state_handler.lock().unwrap().as_ref() {
            handler(active, width, height);
        }
    }
}

/// Audio port that forwards PCM chunks to the IPC service.
pub struct ManagedAudioPort {
    handler: Mutex<Option<Box<dyn Fn(AudioChunk) + Send + Sync>>>,
}

impl ManagedAudioPort {
    pub fn new() -> Arc<Self> {
        Arc::new(ManagedAudioPort { handler: Mutex::new(None) })
    }

    pub fn set_handler(&self, handler: Box<dyn Fn(AudioChunk) + Send + Sync>) {
        *self.handler.lock().unwrap() = Some(handler);
    }
}

impl AudioPort for ManagedAudioPort {
    fn submit_pcm(&self, chunk: AudioChunk) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(chunk);
        }
    }
}

/// Interactive console on the runtime's own stdio.
pub struct StdioConsolePort;

impl ConsolePort for StdioConsolePort {
    fn write(&self, data: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(data);
        let _ = stdout.flush();
    }

    fn read(&self, out: &mut [u8]) -> usize {
        std::io::stdin().lock().read(out).unwrap_or(0)
    }
}

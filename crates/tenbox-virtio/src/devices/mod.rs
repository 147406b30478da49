pub mod blk;
pub mod fs;
pub mod gpu;
pub mod input;
pub mod net;
pub mod serial;
pub mod snd;

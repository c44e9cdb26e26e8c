//! Local sinks for the committed video track.

mod loopback;

pub use loopback::{pump_frames, LoopbackTransport, V4L2Output};

use anyhow::Result;
use image::RgbImage;

/// Somewhere frames of the outgoing track are written to.
pub trait OutputSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Resolution frames are scaled to before writing.
    fn resolution(&self) -> (u32, u32);
}

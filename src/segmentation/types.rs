use anyhow::Result;
use image::RgbImage;

/// Foreground probability per pixel: 0.0 = background, 1.0 = person.
/// Row-major, same dimensions as the frame it was computed from.
pub type Matte = Vec<f32>;

/// A body-segmentation backend.
///
/// Implementations are shared process-wide behind the
/// [`ModelManager`](super::ModelManager); only one compositor drives a model
/// at a time.
pub trait SegmentationModel: Send {
    /// Compute the foreground matte for one frame.
    fn segment(&mut self, frame: &RgbImage) -> Result<Matte>;

    /// Drop temporal state. Called whenever the compositor starts reading a
    /// different source track.
    fn reset_state(&mut self) {}

    /// Preferred input dimensions, (width, height).
    fn input_size(&self) -> (u32, u32);
}

use crate::capture::VideoConstraints;
use crate::resolution::ResolutionTier;
use std::time::Duration;

/// Tunables for the background pipeline.
#[derive(Debug, Clone)]
pub struct BackdropConfig {
    /// Frame rate of the composite output track.
    pub frame_rate: u32,

    /// Wait after the first frame is submitted to the model before the
    /// drawing surface is captured; the first mask is not ready synchronously.
    pub capture_delay: Duration,

    /// Give up on a source track that delivers no frame within this window.
    pub first_frame_timeout: Duration,

    /// Pause between disconnecting and reconnecting the outbound transport
    /// when it cannot acknowledge the disconnect.
    pub reconnect_settle: Duration,

    pub resolution_tier: ResolutionTier,

    /// Whether a committed background persists when the surface closes.
    pub keep_background: bool,

    /// Constraints for opening a camera when the session has none.
    pub constraints: VideoConstraints,

    /// Render the segmentation mask instead of the composite.
    pub show_matte: bool,
}

impl Default for BackdropConfig {
    fn default() -> Self {
        Self {
            frame_rate: 5,
            capture_delay: Duration::from_millis(500),
            first_frame_timeout: Duration::from_secs(5),
            reconnect_settle: Duration::from_millis(1000),
            resolution_tier: ResolutionTier::Standard,
            keep_background: true,
            constraints: VideoConstraints::default(),
            show_matte: false,
        }
    }
}

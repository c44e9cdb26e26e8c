mod lifecycle;
mod track;
mod v4l_capture;

pub use lifecycle::{TeardownContext, TrackLifecycle};
pub use track::{BroadcastTrack, FrameSource};
pub use v4l_capture::NokhwaDevice;

use async_trait::async_trait;
use image::RgbImage;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// One decoded video frame, shared between every reader of a track.
pub type Frame = Arc<RgbImage>;

/// Process-unique identity of a track handle. Clones get their own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(u64);

impl TrackId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Live,
    Ended,
}

/// Negotiated properties of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// A live video track handle.
#[async_trait]
pub trait VideoTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> TrackId;

    /// Label of the device feeding the track.
    fn label(&self) -> &str;

    fn ready_state(&self) -> ReadyState;

    fn settings(&self) -> TrackSettings;

    /// Independent handle on the same source. Stopping the clone leaves this
    /// handle untouched.
    fn clone_track(&self) -> Arc<dyn VideoTrack>;

    fn stop(&self);

    /// Wait for the next frame; `None` once the track has ended.
    async fn next_frame(&self) -> Option<Frame>;

    fn is_live(&self) -> bool {
        self.ready_state() == ReadyState::Live
    }
}

/// Requested capture properties; unset fields accept anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub device_index: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
}

impl VideoConstraints {
    /// Looser set tried after the preferred constraints fail: same device and
    /// frame rate, any resolution.
    pub fn relaxed(&self) -> Self {
        Self {
            width: None,
            height: None,
            ..self.clone()
        }
    }
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            device_index: None,
            width: Some(1280),
            height: Some(720),
            frame_rate: Some(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("camera permission denied")]
    PermissionDenied,

    #[error("no camera satisfies the constraints: {0}")]
    ConstraintNotSatisfied(String),

    #[error("camera unavailable: {0}")]
    Unavailable(String),
}

/// Opens camera streams (the `getUserMedia` of the host platform).
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<Arc<dyn VideoTrack>, DeviceError>;
}

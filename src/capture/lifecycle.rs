use super::{CaptureDevice, TrackId, VideoConstraints, VideoTrack};
use crate::error::BackgroundError;
use crate::session::SessionView;
use std::sync::Arc;

/// Where the owned capture track came from; decides whether it can be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TrackOrigin {
    /// Clone of the session's camera track with this id and label.
    Cloned { source: TrackId, label: String },
    /// Opened directly from the capture device.
    Device,
}

#[derive(Debug)]
struct OwnedTrack {
    track: Arc<dyn VideoTrack>,
    origin: TrackOrigin,
}

/// Facts the teardown decision depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownContext {
    pub applied: bool,
    pub kept: bool,
    pub camera_on: bool,
}

impl TeardownContext {
    /// An applied, kept background with the camera on keeps running after the
    /// surface closes.
    pub fn retains_resources(&self) -> bool {
        self.applied && self.kept && self.camera_on
    }
}

/// Owner of the capture track the compositor reads from.
///
/// The session's own camera track is never handed out; the compositor always
/// gets a clone, or a stream opened from the device when the session has no
/// camera track.
pub struct TrackLifecycle {
    device: Arc<dyn CaptureDevice>,
    session: Arc<dyn SessionView>,
    constraints: VideoConstraints,
    owned: Option<OwnedTrack>,
}

impl TrackLifecycle {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        session: Arc<dyn SessionView>,
        constraints: VideoConstraints,
    ) -> Self {
        Self {
            device,
            session,
            constraints,
            owned: None,
        }
    }

    /// Track for the compositor to read.
    ///
    /// With `use_existing_camera_track` and a live session camera, this is a
    /// clone of the camera track; otherwise a stream opened from the device.
    /// A previously acquired track is reused while it is live and still fed by
    /// the same source.
    pub async fn acquire_capture_track(
        &mut self,
        use_existing_camera_track: bool,
    ) -> Result<Arc<dyn VideoTrack>, BackgroundError> {
        let camera = if use_existing_camera_track {
            self.session.camera_track().filter(|track| track.is_live())
        } else {
            None
        };

        if let Some(owned) = &self.owned {
            if Self::can_reuse(owned, camera.as_ref()) {
                tracing::debug!("Reusing capture track {}", owned.track.id());
                return Ok(Arc::clone(&owned.track));
            }
        }

        self.release();

        let owned = match camera {
            Some(camera) => {
                let track = camera.clone_track();
                tracing::info!(
                    "Cloned camera track {} ({}) as {}",
                    camera.id(),
                    camera.label(),
                    track.id()
                );
                OwnedTrack {
                    track,
                    origin: TrackOrigin::Cloned {
                        source: camera.id(),
                        label: camera.label().to_string(),
                    },
                }
            }
            None => OwnedTrack {
                track: self.open_device().await?,
                origin: TrackOrigin::Device,
            },
        };

        let track = Arc::clone(&owned.track);
        self.owned = Some(owned);
        Ok(track)
    }

    fn can_reuse(owned: &OwnedTrack, camera: Option<&Arc<dyn VideoTrack>>) -> bool {
        if !owned.track.is_live() {
            return false;
        }
        match (&owned.origin, camera) {
            (TrackOrigin::Cloned { source, label }, Some(camera)) => {
                *source == camera.id() && label == camera.label()
            }
            (TrackOrigin::Device, None) => true,
            _ => false,
        }
    }

    async fn open_device(&self) -> Result<Arc<dyn VideoTrack>, BackgroundError> {
        match self.device.get_user_media(&self.constraints).await {
            Ok(track) => Ok(track),
            Err(first) => {
                tracing::warn!("Camera rejected preferred constraints ({}), retrying relaxed", first);
                self.device
                    .get_user_media(&self.constraints.relaxed())
                    .await
                    .map_err(|second| {
                        BackgroundError::DeviceAcquisitionFailed(format!(
                            "{}; relaxed retry: {}",
                            first, second
                        ))
                    })
            }
        }
    }

    /// The currently owned capture track, if any.
    pub fn capture_track(&self) -> Option<Arc<dyn VideoTrack>> {
        self.owned.as_ref().map(|owned| Arc::clone(&owned.track))
    }

    /// Stop and drop the owned track unless the context keeps it alive.
    /// Returns whether resources were released.
    pub fn teardown(&mut self, context: TeardownContext) -> bool {
        if context.retains_resources() {
            tracing::info!("Background kept; capture track stays live");
            return false;
        }
        self.release();
        true
    }

    /// Stop and drop the owned track unconditionally.
    pub fn release(&mut self) {
        if let Some(owned) = self.owned.take() {
            tracing::info!("Stopping capture track {}", owned.track.id());
            owned.track.stop();
        }
    }
}

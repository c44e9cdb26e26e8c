use super::surface::DrawingSurface;
use crate::capture::{Frame, ReadyState, TrackId, TrackSettings, VideoTrack};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Video track sampling a drawing surface at a fixed rate.
pub struct SurfaceTrack {
    id: TrackId,
    surface: Arc<DrawingSurface>,
    frame_rate: u32,
    stopped: CancellationToken,
    ticker: Mutex<Option<Interval>>,
}

impl SurfaceTrack {
    fn new(surface: Arc<DrawingSurface>, frame_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            id: TrackId::next(),
            surface,
            frame_rate: frame_rate.max(1),
            stopped: CancellationToken::new(),
            ticker: Mutex::new(None),
        })
    }
}

impl fmt::Debug for SurfaceTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceTrack")
            .field("id", &self.id)
            .field("frame_rate", &self.frame_rate)
            .field("stopped", &self.stopped.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl VideoTrack for SurfaceTrack {
    fn id(&self) -> TrackId {
        self.id
    }

    fn label(&self) -> &str {
        "composite"
    }

    fn ready_state(&self) -> ReadyState {
        if self.stopped.is_cancelled() {
            ReadyState::Ended
        } else {
            ReadyState::Live
        }
    }

    fn settings(&self) -> TrackSettings {
        let (width, height) = self.surface.dimensions();
        TrackSettings {
            width,
            height,
            frame_rate: self.frame_rate,
        }
    }

    fn clone_track(&self) -> Arc<dyn VideoTrack> {
        SurfaceTrack::new(Arc::clone(&self.surface), self.frame_rate)
    }

    fn stop(&self) {
        self.stopped.cancel();
    }

    async fn next_frame(&self) -> Option<Frame> {
        let mut ticker = self.ticker.lock().await;
        let ticker = ticker.get_or_insert_with(|| {
            let period = Duration::from_secs_f64(1.0 / self.frame_rate as f64);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        loop {
            tokio::select! {
                _ = self.stopped.cancelled() => return None,
                _ = ticker.tick() => {
                    if let Some(frame) = self.surface.latest() {
                        return Some(frame);
                    }
                }
            }
        }
    }
}

/// Output stream of the compositor, captured from its drawing surface.
#[derive(Debug, Clone)]
pub struct CompositeOutput {
    track: Arc<SurfaceTrack>,
}

impl CompositeOutput {
    pub(crate) fn capture(surface: Arc<DrawingSurface>, frame_rate: u32) -> Self {
        let track = SurfaceTrack::new(surface, frame_rate);
        tracing::info!(
            "Captured composite stream {} at {} fps",
            track.id,
            track.frame_rate
        );
        Self { track }
    }

    pub fn id(&self) -> TrackId {
        self.track.id
    }

    pub fn track(&self) -> Arc<dyn VideoTrack> {
        Arc::clone(&self.track) as Arc<dyn VideoTrack>
    }

    pub fn settings(&self) -> TrackSettings {
        self.track.settings()
    }

    pub fn is_live(&self) -> bool {
        self.track.is_live()
    }

    pub fn stop(&self) {
        self.track.stop();
    }
}

//! Collaborators the surrounding conferencing session provides.

use crate::capture::VideoTrack;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaKind {
    Audio,
    #[default]
    Video,
}

/// Snapshot of the session recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordingState {
    pub is_recording: bool,
    pub is_paused: bool,
    pub is_stopped: bool,
    pub media_kind: MediaKind,
}

impl RecordingState {
    /// A running video recording must be paused before the outgoing video
    /// changes.
    pub fn blocks_background_change(&self) -> bool {
        self.is_recording && !self.is_paused && !self.is_stopped && self.media_kind == MediaKind::Video
    }
}

/// Read-only view of the session state the pipeline depends on.
pub trait SessionView: Send + Sync {
    fn audio_only(&self) -> bool;

    fn camera_on(&self) -> bool;

    /// The user-visible camera track, if the session currently holds one.
    /// The pipeline only ever clones it.
    fn camera_track(&self) -> Option<Arc<dyn VideoTrack>>;

    fn recording(&self) -> RecordingState;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// User-facing notification sink.
pub trait Alerter: Send + Sync {
    fn alert(&self, message: &str, severity: Severity);
}

/// Alerter that only logs, for hosts without a notification surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlerter;

impl Alerter for TracingAlerter {
    fn alert(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => tracing::info!("{}", message),
            Severity::Warning => tracing::warn!("{}", message),
            Severity::Error => tracing::error!("{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_active_video_recording_blocks() {
        let active = RecordingState {
            is_recording: true,
            ..Default::default()
        };
        assert!(active.blocks_background_change());

        let paused = RecordingState {
            is_paused: true,
            ..active
        };
        assert!(!paused.blocks_background_change());

        let stopped = RecordingState {
            is_stopped: true,
            ..active
        };
        assert!(!stopped.blocks_background_change());

        let audio = RecordingState {
            media_kind: MediaKind::Audio,
            ..active
        };
        assert!(!audio.blocks_background_change());
    }
}

use crate::resolution::ResolutionTier;
use crate::session::Severity;
use thiserror::Error;

/// Failures surfaced by the background pipeline.
///
/// Each variant is reported through the session's [`Alerter`](crate::Alerter)
/// with the severity returned by [`BackgroundError::severity`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackgroundError {
    /// Non-fatal: the unmodified camera track stays the effective output.
    #[error("no background available: segmentation model unavailable ({0})")]
    ModelUnavailable(String),

    #[error("could not acquire a camera: {0}")]
    DeviceAcquisitionFailed(String),

    #[error(
        "background image is {width}x{height}, below the {min_width}x{min_height} minimum for {tier} output"
    )]
    ResolutionTooLow {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
        tier: ResolutionTier,
    },

    #[error(
        "background image is {width}x{height}, above the {max_width}x{max_height} maximum for {tier} output"
    )]
    ResolutionTooHigh {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
        tier: ResolutionTier,
    },

    #[error("virtual backgrounds are not available in audio-only rooms")]
    AudioOnlyRoomRejected,

    #[error("pause the video recording before changing the background")]
    RecordingInProgressRejected,

    /// The local applied state is kept so the user can retry the save.
    #[error("could not switch the outgoing video: {0}")]
    TransportRenegotiationFailed(String),

    #[error("background image could not be loaded: {0}")]
    ImageUnavailable(String),

    #[error("no live video track to send")]
    NoLiveTrack,
}

impl BackgroundError {
    pub fn severity(&self) -> Severity {
        match self {
            BackgroundError::ModelUnavailable(_) => Severity::Warning,
            BackgroundError::ResolutionTooLow { .. }
            | BackgroundError::ResolutionTooHigh { .. }
            | BackgroundError::AudioOnlyRoomRejected
            | BackgroundError::RecordingInProgressRejected => Severity::Warning,
            BackgroundError::DeviceAcquisitionFailed(_)
            | BackgroundError::TransportRenegotiationFailed(_)
            | BackgroundError::ImageUnavailable(_)
            | BackgroundError::NoLiveTrack => Severity::Error,
        }
    }
}

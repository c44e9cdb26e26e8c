use super::{CaptureDevice, DeviceError, FrameSource, TrackSettings, VideoConstraints, VideoTrack};
use async_trait::async_trait;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Consecutive read failures tolerated before the camera is treated as gone.
const MAX_FRAME_ERRORS: u32 = 10;

/// Webcam opened through nokhwa.
///
/// Each stream runs on its own capture thread that owns the camera and
/// publishes decoded frames to a [`FrameSource`]. The thread exits once every
/// track handed out for the stream has been stopped.
pub struct NokhwaDevice {
    default_index: u32,
}

impl NokhwaDevice {
    pub fn new(default_index: u32) -> Self {
        Self { default_index }
    }
}

#[async_trait]
impl CaptureDevice for NokhwaDevice {
    async fn get_user_media(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<Arc<dyn VideoTrack>, DeviceError> {
        let index = constraints.device_index.unwrap_or(self.default_index);
        let requested = requested_format(constraints);
        let constrained = constraints.width.is_some() || constraints.height.is_some();

        tracing::info!("Opening webcam {} ({:?})", index, constraints);

        let (ready_tx, ready_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name(format!("camola-capture-{}", index))
            .spawn(move || capture_thread(index, requested, constrained, ready_tx))
            .map_err(|e| DeviceError::Unavailable(format!("failed to spawn capture thread: {}", e)))?;

        let track = ready_rx
            .await
            .map_err(|_| DeviceError::Unavailable("capture thread exited early".to_string()))??;

        Ok(track)
    }
}

fn requested_format(constraints: &VideoConstraints) -> RequestedFormat<'static> {
    let format_type = match (constraints.width, constraints.height) {
        (Some(width), Some(height)) => RequestedFormatType::Closest(CameraFormat::new(
            Resolution::new(width, height),
            FrameFormat::MJPEG,
            constraints.frame_rate.unwrap_or(30),
        )),
        _ => RequestedFormatType::AbsoluteHighestResolution,
    };
    RequestedFormat::new::<RgbFormat>(format_type)
}

fn capture_thread(
    index: u32,
    requested: RequestedFormat<'static>,
    constrained: bool,
    ready: oneshot::Sender<Result<Arc<dyn VideoTrack>, DeviceError>>,
) {
    let mut camera = match Camera::new(CameraIndex::Index(index), requested) {
        Ok(camera) => camera,
        Err(e) => {
            let err = if constrained {
                DeviceError::ConstraintNotSatisfied(e.to_string())
            } else {
                DeviceError::Unavailable(e.to_string())
            };
            let _ = ready.send(Err(err));
            return;
        }
    };

    if let Err(e) = camera.open_stream() {
        let _ = ready.send(Err(DeviceError::Unavailable(format!(
            "failed to open camera stream: {}",
            e
        ))));
        return;
    }

    let resolution = camera.resolution();
    let settings = TrackSettings {
        width: resolution.width(),
        height: resolution.height(),
        frame_rate: camera.frame_rate(),
    };
    let label = camera.info().human_name();
    tracing::info!(
        "Webcam {} streaming at {}x{}@{}",
        label,
        settings.width,
        settings.height,
        settings.frame_rate
    );

    let source = FrameSource::new(label, settings);
    let track: Arc<dyn VideoTrack> = source.track();
    if ready.send(Ok(track)).is_err() {
        // Requester went away; the dropped track already ended the source.
        let _ = camera.stop_stream();
        return;
    }

    let mut errors = 0;
    while !source.is_ended() {
        let decoded = camera
            .frame()
            .and_then(|buffer| buffer.decode_image::<RgbFormat>());

        match decoded {
            Ok(image) => {
                errors = 0;
                if !source.publish(Arc::new(image)) {
                    break;
                }
            }
            Err(e) => {
                errors += 1;
                tracing::warn!("Failed to capture frame: {}", e);
                if errors >= MAX_FRAME_ERRORS {
                    tracing::warn!("Camera {} stopped delivering frames", index);
                    source.end();
                }
            }
        }
    }

    if let Err(e) = camera.stop_stream() {
        tracing::debug!("Failed to stop camera stream: {}", e);
    }
    tracing::info!("Webcam {} released", index);
}

use super::{Frame, ReadyState, TrackId, TrackSettings, VideoTrack};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

/// Frames buffered per reader before the slowest one starts skipping.
const FRAME_BUFFER: usize = 4;

/// Producer side of a camera: fans frames out to every track handle.
///
/// The source ends when its producer calls [`FrameSource::end`] (device
/// unplugged) or when the last handle created from it is stopped.
#[derive(Debug)]
pub struct FrameSource {
    label: String,
    settings: TrackSettings,
    frames: broadcast::Sender<Frame>,
    handles: AtomicUsize,
    ended: CancellationToken,
}

impl FrameSource {
    pub fn new(label: impl Into<String>, settings: TrackSettings) -> Arc<Self> {
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        Arc::new(Self {
            label: label.into(),
            settings,
            frames,
            handles: AtomicUsize::new(0),
            ended: CancellationToken::new(),
        })
    }

    /// New independent handle reading from this source.
    pub fn track(self: &Arc<Self>) -> Arc<BroadcastTrack> {
        self.handles.fetch_add(1, Ordering::SeqCst);
        Arc::new(BroadcastTrack {
            id: TrackId::next(),
            source: Arc::clone(self),
            frames: Mutex::new(self.frames.subscribe()),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Returns false once the source has ended and the producer should stop.
    pub fn publish(&self, frame: Frame) -> bool {
        if self.ended.is_cancelled() {
            return false;
        }
        // Nobody listening is fine; readers only see frames sent after they
        // subscribed.
        let _ = self.frames.send(frame);
        true
    }

    pub fn end(&self) {
        self.ended.cancel();
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    pub fn settings(&self) -> TrackSettings {
        self.settings
    }

    fn release_handle(&self) {
        if self.handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            tracing::debug!("Last track on {} stopped, ending source", self.label);
            self.end();
        }
    }
}

/// Track handle over a [`FrameSource`].
#[derive(Debug)]
pub struct BroadcastTrack {
    id: TrackId,
    source: Arc<FrameSource>,
    frames: Mutex<broadcast::Receiver<Frame>>,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

#[async_trait]
impl VideoTrack for BroadcastTrack {
    fn id(&self) -> TrackId {
        self.id
    }

    fn label(&self) -> &str {
        &self.source.label
    }

    fn ready_state(&self) -> ReadyState {
        if self.stopped.load(Ordering::SeqCst) || self.source.is_ended() {
            ReadyState::Ended
        } else {
            ReadyState::Live
        }
    }

    fn settings(&self) -> TrackSettings {
        self.source.settings
    }

    fn clone_track(&self) -> Arc<dyn VideoTrack> {
        self.source.track()
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            self.source.release_handle();
        }
    }

    async fn next_frame(&self) -> Option<Frame> {
        if !self.is_live() {
            return None;
        }

        let mut frames = self.frames.lock().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = self.source.ended.cancelled() => return None,
                received = frames.recv() => match received {
                    Ok(frame) => return Some(frame),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("{} skipped {} frames", self.id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}

impl Drop for BroadcastTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn source() -> Arc<FrameSource> {
        FrameSource::new(
            "Test Camera",
            TrackSettings {
                width: 4,
                height: 2,
                frame_rate: 30,
            },
        )
    }

    fn frame(value: u8) -> Frame {
        Arc::new(RgbImage::from_pixel(4, 2, image::Rgb([value, value, value])))
    }

    #[tokio::test]
    async fn clone_sees_the_same_frames() {
        let source = source();
        let original = source.track();
        let clone = original.clone_track();

        assert_ne!(original.id(), clone.id());
        assert_eq!(clone.label(), "Test Camera");

        source.publish(frame(7));
        assert_eq!(original.next_frame().await.unwrap().get_pixel(0, 0)[0], 7);
        assert_eq!(clone.next_frame().await.unwrap().get_pixel(0, 0)[0], 7);
    }

    #[tokio::test]
    async fn stopping_a_clone_leaves_the_original_live() {
        let source = source();
        let original = source.track();
        let clone = original.clone_track();

        clone.stop();
        assert_eq!(clone.ready_state(), ReadyState::Ended);
        assert!(clone.next_frame().await.is_none());
        assert_eq!(original.ready_state(), ReadyState::Live);
        assert!(!source.is_ended());
    }

    #[tokio::test]
    async fn last_stop_ends_the_source() {
        let source = source();
        let original = source.track();
        let clone = original.clone_track();

        clone.stop();
        original.stop();
        assert!(source.is_ended());
        assert!(!source.publish(frame(1)));
    }

    #[tokio::test]
    async fn stop_wakes_a_pending_reader() {
        let source = source();
        let track = source.track();
        let reader = {
            let track = Arc::clone(&track);
            tokio::spawn(async move { track.next_frame().await })
        };

        tokio::task::yield_now().await;
        track.stop();
        assert!(reader.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ended_source_ends_every_handle() {
        let source = source();
        let track = source.track();
        source.end();
        assert_eq!(track.ready_state(), ReadyState::Ended);
    }
}

mod output;
mod surface;

pub use output::{CompositeOutput, SurfaceTrack};
pub use surface::{Canvas, CompositeOp, DrawingSurface};

use crate::background::ResolvedBackground;
use crate::capture::{Frame, VideoTrack};
use crate::config::BackdropConfig;
use crate::error::BackgroundError;
use crate::segmentation::{ModelManager, Preprocessor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct CompositorConfig {
    pub frame_rate: u32,
    pub capture_delay: Duration,
    pub first_frame_timeout: Duration,
    pub show_matte: bool,
}

impl From<&BackdropConfig> for CompositorConfig {
    fn from(config: &BackdropConfig) -> Self {
        Self {
            frame_rate: config.frame_rate,
            capture_delay: config.capture_delay,
            first_frame_timeout: config.first_frame_timeout,
            show_matte: config.show_matte,
        }
    }
}

/// State the caller changes while the frame loop runs.
#[derive(Default)]
struct LoopControl {
    paused: AtomicBool,
    background: Mutex<Option<Frame>>,
}

impl LoopControl {
    fn background(&self) -> Option<Frame> {
        lock(&self.background).clone()
    }
}

struct RunningLoop {
    source: Arc<dyn VideoTrack>,
    output: CompositeOutput,
    task: JoinHandle<()>,
}

/// Per-frame mask-and-composite loop over one source track.
///
/// A loop is started the first time a track is composited and keeps running
/// until the track changes or the compositor is cleared; choosing another
/// background only swaps the image the running loop paints with.
pub struct Compositor {
    models: Arc<ModelManager>,
    config: CompositorConfig,
    control: Arc<LoopControl>,
    running: Option<RunningLoop>,
}

impl Compositor {
    pub fn new(models: Arc<ModelManager>, config: CompositorConfig) -> Self {
        Self {
            models,
            config,
            control: Arc::new(LoopControl::default()),
            running: None,
        }
    }

    /// Composite `background` behind the person in `source`.
    ///
    /// Returns once the output has a real frame on it: the surface is captured
    /// only after the first frame went through the model and the settling
    /// delay passed. `ResolvedBackground::None` stops and clears the previous
    /// output and returns `None`.
    pub async fn composite(
        &mut self,
        source: Arc<dyn VideoTrack>,
        background: &ResolvedBackground,
    ) -> Result<Option<CompositeOutput>, BackgroundError> {
        let Some(image) = background.image() else {
            self.clear();
            return Ok(None);
        };

        self.ensure_model().await?;
        self.set_background(Arc::clone(image));

        if let Some(running) = &self.running {
            if running.source.id() == source.id()
                && running.output.is_live()
                && !running.task.is_finished()
            {
                tracing::debug!("Switching background on running loop for {}", source.id());
                return Ok(Some(running.output.clone()));
            }
        }

        self.stop_loop();

        let settings = source.settings();
        let surface = DrawingSurface::new(settings.width, settings.height);
        if let Some(model) = self.models.current() {
            lock(&model).reset_state();
        }

        let (first_tx, first_rx) = oneshot::channel();
        let task = tokio::spawn(run_frame_loop(FrameLoop {
            source: Arc::clone(&source),
            models: Arc::clone(&self.models),
            surface: Arc::clone(&surface),
            control: Arc::clone(&self.control),
            first_submitted: Some(first_tx),
            show_matte: self.config.show_matte,
        }));

        match tokio::time::timeout(self.config.first_frame_timeout, first_rx).await {
            Ok(Ok(())) => {}
            _ => {
                task.abort();
                return Err(BackgroundError::DeviceAcquisitionFailed(format!(
                    "{} delivered no frames",
                    source.id()
                )));
            }
        }

        tokio::time::sleep(self.config.capture_delay).await;

        let output = CompositeOutput::capture(surface, self.config.frame_rate);
        self.running = Some(RunningLoop {
            source,
            output: output.clone(),
            task,
        });
        Ok(Some(output))
    }

    /// One lazy reload through the manager before giving up.
    async fn ensure_model(&self) -> Result<(), BackgroundError> {
        if let Err(first) = self.models.get_model().await {
            tracing::warn!("{}; retrying once", first);
            self.models.reset();
            self.models.get_model().await?;
        }
        Ok(())
    }

    /// Replace the image the running loop paints with.
    pub fn set_background(&self, image: Frame) {
        *lock(&self.control.background) = Some(image);
    }

    /// Stop writing frames; the loop and the output stay alive.
    pub fn pause(&self) {
        tracing::debug!("Compositor paused");
        self.control.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        tracing::debug!("Compositor resumed");
        self.control.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.control.paused.load(Ordering::Acquire)
    }

    pub fn output(&self) -> Option<CompositeOutput> {
        self.running.as_ref().map(|running| running.output.clone())
    }

    /// Stop the loop, stop the output track and forget the background.
    pub fn clear(&mut self) {
        self.stop_loop();
        *lock(&self.control.background) = None;
    }

    fn stop_loop(&mut self) {
        if let Some(running) = self.running.take() {
            tracing::info!(
                "Stopping frame loop on {} and output {}",
                running.source.id(),
                running.output.id()
            );
            running.task.abort();
            running.output.stop();
        }
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.task.abort();
        }
    }
}

struct FrameLoop {
    source: Arc<dyn VideoTrack>,
    models: Arc<ModelManager>,
    surface: Arc<DrawingSurface>,
    control: Arc<LoopControl>,
    first_submitted: Option<oneshot::Sender<()>>,
    show_matte: bool,
}

#[derive(Default)]
struct FrameStats {
    frames: u64,
    skipped: u64,
    segment: Duration,
    composite: Duration,
}

impl FrameStats {
    fn record(&mut self, segment: Duration, composite: Duration) {
        self.frames += 1;
        self.segment += segment;
        self.composite += composite;

        if self.frames % 30 == 0 {
            let avg_segment_ms = self.segment.as_secs_f64() * 1000.0 / self.frames as f64;
            let avg_composite_ms = self.composite.as_secs_f64() * 1000.0 / self.frames as f64;
            let total_ms = avg_segment_ms + avg_composite_ms;
            tracing::info!(
                "Frame {}: segment={:.1}ms, composite={:.1}ms, total={:.1}ms, fps={:.1}, skipped={}",
                self.frames,
                avg_segment_ms,
                avg_composite_ms,
                total_ms,
                1000.0 / total_ms.max(f64::EPSILON),
                self.skipped
            );
        }
    }
}

/// Runs once per frame the source delivers, not on a timer.
async fn run_frame_loop(mut ctx: FrameLoop) {
    let mut stats = FrameStats::default();
    tracing::info!("Frame loop started on {}", ctx.source.id());

    while let Some(frame) = ctx.source.next_frame().await {
        if ctx.control.paused.load(Ordering::Acquire) {
            continue;
        }
        let Some(model) = ctx.models.current() else {
            stats.skipped += 1;
            continue;
        };
        let Some(background) = ctx.control.background() else {
            continue;
        };

        let segment_start = Instant::now();
        let matte = lock(&model).segment(&frame);
        if let Some(first) = ctx.first_submitted.take() {
            let _ = first.send(());
        }
        let matte = match matte {
            Ok(matte) => matte,
            Err(e) => {
                tracing::debug!("Segmentation failed: {:#}", e);
                stats.skipped += 1;
                continue;
            }
        };
        let segment_time = segment_start.elapsed();

        let composite_start = Instant::now();
        if ctx.show_matte {
            let (width, height) = frame.dimensions();
            ctx.surface
                .present(&Preprocessor::matte_to_rgb(&matte, width, height));
        } else {
            ctx.surface.composite(&frame, &matte, &background);
        }
        stats.record(segment_time, composite_start.elapsed());
    }

    tracing::info!(
        "Frame loop on {} ended after {} frames",
        ctx.source.id(),
        stats.frames
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::BackgroundSelection;
    use crate::capture::{FrameSource, TrackSettings};
    use crate::segmentation::{ModelLoader, SegmentationModel};
    use anyhow::bail;
    use async_trait::async_trait;
    use image::RgbImage;
    use std::sync::atomic::AtomicUsize;

    const PERSON: [u8; 3] = [200, 150, 100];
    const BEACH: [u8; 3] = [10, 120, 240];

    /// Person on the left half of the frame.
    struct LeftHalf {
        calls: Arc<AtomicUsize>,
    }

    impl SegmentationModel for LeftHalf {
        fn segment(&mut self, frame: &RgbImage) -> anyhow::Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (width, height) = frame.dimensions();
            Ok((0..width * height)
                .map(|i| if i % width < width / 2 { 1.0 } else { 0.0 })
                .collect())
        }

        fn input_size(&self) -> (u32, u32) {
            (8, 8)
        }
    }

    struct Loader {
        calls: Arc<AtomicUsize>,
        loads: AtomicUsize,
        broken: bool,
    }

    #[async_trait]
    impl ModelLoader for Loader {
        async fn load(&self) -> anyhow::Result<Box<dyn SegmentationModel>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                bail!("no GPU");
            }
            Ok(Box::new(LeftHalf {
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    struct Fixture {
        compositor: Compositor,
        loader: Arc<Loader>,
        calls: Arc<AtomicUsize>,
    }

    fn fixture(broken: bool) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = Arc::new(Loader {
            calls: Arc::clone(&calls),
            loads: AtomicUsize::new(0),
            broken,
        });
        let models = ModelManager::new(loader.clone());
        let compositor = Compositor::new(models, CompositorConfig::from(&BackdropConfig::default()));
        Fixture {
            compositor,
            loader,
            calls,
        }
    }

    fn camera(label: &str) -> Arc<FrameSource> {
        let source = FrameSource::new(
            label,
            TrackSettings {
                width: 8,
                height: 4,
                frame_rate: 30,
            },
        );
        let feeder = Arc::clone(&source);
        tokio::spawn(async move {
            while feeder.publish(Arc::new(RgbImage::from_pixel(8, 4, image::Rgb(PERSON)))) {
                tokio::time::sleep(Duration::from_millis(33)).await;
            }
        });
        source
    }

    fn beach() -> ResolvedBackground {
        ResolvedBackground::Image {
            selection: BackgroundSelection::CustomImage {
                data_url: "beach".to_string(),
            },
            image: Arc::new(RgbImage::from_pixel(8, 4, image::Rgb(BEACH))),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn output_appears_after_settling_delay() {
        let mut fx = fixture(false);
        let source = camera("Front");
        let track: Arc<dyn VideoTrack> = source.track();

        let start = tokio::time::Instant::now();
        let output = fx
            .compositor
            .composite(Arc::clone(&track), &beach())
            .await
            .unwrap()
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));

        assert_eq!(output.settings().width, 8);
        assert_eq!(output.settings().height, 4);
        assert_eq!(output.settings().frame_rate, 5);

        let frame = output.track().next_frame().await.unwrap();
        assert_eq!(frame.get_pixel(0, 0).0, PERSON);
        assert_eq!(frame.get_pixel(7, 0).0, BEACH);
    }

    #[tokio::test(start_paused = true)]
    async fn new_background_on_same_track_reuses_output() {
        let mut fx = fixture(false);
        let source = camera("Front");
        let track: Arc<dyn VideoTrack> = source.track();

        let first = fx.compositor.composite(Arc::clone(&track), &beach()).await.unwrap().unwrap();
        let second = fx.compositor.composite(Arc::clone(&track), &beach()).await.unwrap().unwrap();
        assert_eq!(first.id(), second.id());
        assert!(first.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn new_track_gets_new_output() {
        let mut fx = fixture(false);
        let source = camera("Front");
        let first_track: Arc<dyn VideoTrack> = source.track();
        let second_track = first_track.clone_track();

        let first = fx.compositor.composite(first_track, &beach()).await.unwrap().unwrap();
        let second = fx.compositor.composite(second_track, &beach()).await.unwrap().unwrap();
        assert_ne!(first.id(), second.id());
        assert!(!first.is_live());
        assert!(second.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn none_stops_previous_output() {
        let mut fx = fixture(false);
        let source = camera("Front");
        let track: Arc<dyn VideoTrack> = source.track();

        let output = fx.compositor.composite(Arc::clone(&track), &beach()).await.unwrap().unwrap();
        let cleared = fx
            .compositor
            .composite(track, &ResolvedBackground::None)
            .await
            .unwrap();

        assert!(cleared.is_none());
        assert!(!output.is_live());
        assert!(fx.compositor.output().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_model_is_retried_once() {
        let mut fx = fixture(true);
        let source = camera("Front");

        let err = fx
            .compositor
            .composite(source.track(), &beach())
            .await
            .unwrap_err();
        assert!(matches!(err, BackgroundError::ModelUnavailable(_)));
        assert_eq!(fx.loader.loads.load(Ordering::SeqCst), 2);
        assert!(fx.compositor.output().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn paused_loop_submits_nothing() {
        let mut fx = fixture(false);
        let source = camera("Front");

        fx.compositor.composite(source.track(), &beach()).await.unwrap();
        fx.compositor.pause();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = fx.calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.calls.load(Ordering::SeqCst), before);

        fx.compositor.resume();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(fx.calls.load(Ordering::SeqCst) > before);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_source_times_out() {
        let mut fx = fixture(false);
        let silent = FrameSource::new(
            "Frozen",
            TrackSettings {
                width: 8,
                height: 4,
                frame_rate: 30,
            },
        );

        let err = fx
            .compositor
            .composite(silent.track(), &beach())
            .await
            .unwrap_err();
        assert!(matches!(err, BackgroundError::DeviceAcquisitionFailed(_)));
    }
}

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use camola_backdrop::capture::{CaptureDevice, NokhwaDevice, VideoConstraints, VideoTrack};
use camola_backdrop::output::LoopbackTransport;
use camola_backdrop::segmentation::{ModelLoader, ModelManager, OnnxModelLoader, SegmentationModel};
use camola_backdrop::{
    BackdropConfig, BackgroundSelection, BackgroundWorkflow, Collaborators, FsImageSource,
    RecordingState, ResolutionTier, SessionView, TracingAlerter,
};
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Output resolution width
    #[arg(long, default_value_t = 1280)]
    output_width: u32,

    /// Output resolution height
    #[arg(long, default_value_t = 720)]
    output_height: u32,

    /// Frame rate of the composited output
    #[arg(long, default_value_t = 5)]
    fps: u32,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Path to segmentation model (ONNX file)
    /// If not provided, the camera is passed through unchanged
    #[arg(long)]
    model: Option<String>,

    /// Background image: a path, file:// URL or base64 data: URL
    #[arg(long)]
    background: Option<String>,

    /// Background resolution tier; derived from the output size when omitted
    #[arg(long, value_enum)]
    tier: Option<ResolutionTier>,

    /// Show matte visualization (grayscale silhouette) instead of the composite
    #[arg(long)]
    show_matte: bool,
}

/// Stand-in session: one local camera, never audio-only, never recording.
struct LocalSession {
    camera: Arc<dyn VideoTrack>,
}

impl SessionView for LocalSession {
    fn audio_only(&self) -> bool {
        false
    }

    fn camera_on(&self) -> bool {
        self.camera.is_live()
    }

    fn camera_track(&self) -> Option<Arc<dyn VideoTrack>> {
        Some(Arc::clone(&self.camera)).filter(|camera| camera.is_live())
    }

    fn recording(&self) -> RecordingState {
        RecordingState::default()
    }
}

struct NoModel;

#[async_trait]
impl ModelLoader for NoModel {
    async fn load(&self) -> Result<Box<dyn SegmentationModel>> {
        Err(anyhow!("no segmentation model configured (pass --model)"))
    }
}

fn selection_for(background: Option<&str>) -> BackgroundSelection {
    match background {
        None => BackgroundSelection::None,
        Some(url) if url.starts_with("data:") => BackgroundSelection::CustomImage {
            data_url: url.to_string(),
        },
        Some(url) => BackgroundSelection::RemoteImage {
            thumbnail_url: url.to_string(),
            preview_url: url.to_string(),
            full_url: url.to_string(),
        },
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let tier = args
        .tier
        .unwrap_or_else(|| ResolutionTier::for_output(args.output_width, args.output_height));

    tracing::info!("Camola backdrop starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Output: {}x{} ({} tier)", args.output_width, args.output_height, tier);
    tracing::info!("Composite FPS: {}", args.fps);

    let config = BackdropConfig {
        frame_rate: args.fps,
        resolution_tier: tier,
        constraints: VideoConstraints {
            device_index: Some(args.input_device),
            width: Some(args.capture_width),
            height: Some(args.capture_height),
            frame_rate: Some(30),
        },
        show_matte: args.show_matte,
        ..BackdropConfig::default()
    };

    let loader: Arc<dyn ModelLoader> = match &args.model {
        Some(path) => {
            tracing::info!("Segmentation model: {}", path);
            Arc::new(OnnxModelLoader::new(path))
        }
        None => {
            tracing::info!("Running in passthrough mode (no segmentation)");
            Arc::new(NoModel)
        }
    };
    let models = ModelManager::new(loader);

    let device = Arc::new(NokhwaDevice::new(args.input_device));
    let camera = device
        .get_user_media(&config.constraints)
        .await
        .context("Failed to initialize webcam capture")?;
    tracing::info!("Camera {} ({}) is live", camera.id(), camera.label());

    let collaborators = Collaborators {
        device,
        session: Arc::new(LocalSession { camera }),
        transport: Arc::new(LoopbackTransport::new(
            &args.output_device,
            args.output_width,
            args.output_height,
        )),
        alerter: Arc::new(TracingAlerter),
        images: Arc::new(FsImageSource),
    };
    let mut workflow = BackgroundWorkflow::new(config, Arc::clone(&models), collaborators);

    let selection = if args.model.is_some() {
        selection_for(args.background.as_deref())
    } else {
        BackgroundSelection::None
    };

    // A failed preview leaves the plain camera selected.
    if let Err(e) = workflow.preview_background(selection).await {
        tracing::warn!("Background not applied: {}", e);
    }
    workflow
        .save_background()
        .await
        .context("Failed to start v4l2loopback output")?;

    tracing::info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    tracing::info!("Shutting down");
    workflow.shutdown();
    models.destroy();

    Ok(())
}

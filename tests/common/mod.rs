#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use camola_backdrop::capture::{
    CaptureDevice, DeviceError, FrameSource, TrackId, TrackSettings, VideoConstraints, VideoTrack,
};
use camola_backdrop::segmentation::{ModelLoader, ModelManager, SegmentationModel};
use camola_backdrop::workflow::{DisconnectAck, OutboundTransport, TransportError};
use camola_backdrop::{
    Alerter, BackdropConfig, BackgroundImageSource, BackgroundSelection, BackgroundWorkflow,
    Collaborators, RecordingState, SessionView, Severity,
};
use image::{Rgb, RgbImage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const PERSON: [u8; 3] = [200, 150, 100];

pub fn settings() -> TrackSettings {
    TrackSettings {
        width: 16,
        height: 8,
        frame_rate: 10,
    }
}

/// Source that keeps publishing solid frames until it ends.
pub fn start_camera(label: &str) -> Arc<FrameSource> {
    let source = FrameSource::new(label, settings());
    let feeder = Arc::clone(&source);
    tokio::spawn(async move {
        while feeder.publish(Arc::new(RgbImage::from_pixel(16, 8, Rgb(PERSON)))) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });
    source
}

/// Person on the left half of every frame.
struct LeftHalf;

impl SegmentationModel for LeftHalf {
    fn segment(&mut self, frame: &RgbImage) -> Result<Vec<f32>> {
        let (width, height) = frame.dimensions();
        Ok((0..width * height)
            .map(|i| if i % width < width / 2 { 1.0 } else { 0.0 })
            .collect())
    }

    fn input_size(&self) -> (u32, u32) {
        (16, 8)
    }
}

#[derive(Default)]
pub struct StubLoader {
    pub broken: bool,
    pub loads: AtomicUsize,
}

#[async_trait]
impl ModelLoader for StubLoader {
    async fn load(&self) -> Result<Box<dyn SegmentationModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            bail!("model weights missing");
        }
        Ok(Box::new(LeftHalf))
    }
}

#[derive(Default)]
pub struct FakeSession {
    pub audio_only: AtomicBool,
    camera: Mutex<Option<Arc<dyn VideoTrack>>>,
    recording: Mutex<RecordingState>,
}

impl FakeSession {
    pub fn set_camera(&self, camera: Option<Arc<dyn VideoTrack>>) {
        *self.camera.lock().unwrap() = camera;
    }

    pub fn set_recording(&self, recording: RecordingState) {
        *self.recording.lock().unwrap() = recording;
    }
}

impl SessionView for FakeSession {
    fn audio_only(&self) -> bool {
        self.audio_only.load(Ordering::SeqCst)
    }

    fn camera_on(&self) -> bool {
        self.camera
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|camera| camera.is_live())
    }

    fn camera_track(&self) -> Option<Arc<dyn VideoTrack>> {
        self.camera.lock().unwrap().clone()
    }

    fn recording(&self) -> RecordingState {
        *self.recording.lock().unwrap()
    }
}

/// Opens a fresh fed source per request.
#[derive(Default)]
pub struct FakeDevice {
    pub opened: AtomicUsize,
}

#[async_trait]
impl CaptureDevice for FakeDevice {
    async fn get_user_media(
        &self,
        _constraints: &VideoConstraints,
    ) -> Result<Arc<dyn VideoTrack>, DeviceError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(start_camera("Device Camera").track())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCall {
    Create(TrackId),
    Disconnect,
    Connect(TrackId),
}

/// Transport that records every call with the (virtual) time it was made.
pub struct RecordingTransport {
    ack: DisconnectAck,
    current: Mutex<Option<TrackId>>,
    calls: Mutex<Vec<(TransportCall, Instant)>>,
    pub fail_connect: AtomicBool,
}

impl RecordingTransport {
    pub fn new(ack: DisconnectAck) -> Self {
        Self {
            ack,
            current: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().iter().map(|(call, _)| *call).collect()
    }

    pub fn timed_calls(&self) -> Vec<(TransportCall, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push((call, Instant::now()));
    }
}

#[async_trait]
impl OutboundTransport for RecordingTransport {
    fn current_track(&self) -> Option<TrackId> {
        *self.current.lock().unwrap()
    }

    async fn create(&self, track: Arc<dyn VideoTrack>) -> Result<(), TransportError> {
        self.record(TransportCall::Create(track.id()));
        *self.current.lock().unwrap() = Some(track.id());
        Ok(())
    }

    async fn disconnect(&self) -> Result<DisconnectAck, TransportError> {
        self.record(TransportCall::Disconnect);
        *self.current.lock().unwrap() = None;
        Ok(self.ack)
    }

    async fn connect(&self, track: Arc<dyn VideoTrack>) -> Result<(), TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("producer closed".to_string()));
        }
        self.record(TransportCall::Connect(track.id()));
        *self.current.lock().unwrap() = Some(track.id());
        Ok(())
    }
}

#[derive(Default)]
pub struct CollectingAlerter {
    alerts: Mutex<Vec<(String, Severity)>>,
}

impl CollectingAlerter {
    pub fn severities(&self) -> Vec<Severity> {
        self.alerts.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }
}

impl Alerter for CollectingAlerter {
    fn alert(&self, message: &str, severity: Severity) {
        self.alerts.lock().unwrap().push((message.to_string(), severity));
    }
}

#[derive(Default)]
pub struct MemoryImageSource {
    images: HashMap<String, RgbImage>,
}

impl MemoryImageSource {
    pub fn with(mut self, url: &str, width: u32, height: u32, color: [u8; 3]) -> Self {
        self.images
            .insert(url.to_string(), RgbImage::from_pixel(width, height, Rgb(color)));
        self
    }
}

#[async_trait]
impl BackgroundImageSource for MemoryImageSource {
    async fn fetch(&self, url: &str) -> Result<RgbImage> {
        self.images
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("404 for {}", url))
    }
}

pub fn custom(url: &str) -> BackgroundSelection {
    BackgroundSelection::CustomImage {
        data_url: url.to_string(),
    }
}

/// A workflow wired to fakes, with handles on each of them.
pub struct Harness {
    pub workflow: BackgroundWorkflow,
    pub session: Arc<FakeSession>,
    pub device: Arc<FakeDevice>,
    pub transport: Arc<RecordingTransport>,
    pub alerter: Arc<CollectingAlerter>,
    pub loader: Arc<StubLoader>,
    pub camera: Arc<FrameSource>,
}

pub struct HarnessBuilder {
    config: BackdropConfig,
    ack: DisconnectAck,
    broken_model: bool,
    camera_on: bool,
    images: MemoryImageSource,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: BackdropConfig::default(),
            ack: DisconnectAck::Acknowledged,
            broken_model: false,
            camera_on: true,
            images: MemoryImageSource::default()
                .with("beach", 640, 640, [10, 120, 240])
                .with("forest", 640, 640, [20, 160, 40]),
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut BackdropConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn ack(mut self, ack: DisconnectAck) -> Self {
        self.ack = ack;
        self
    }

    pub fn broken_model(mut self) -> Self {
        self.broken_model = true;
        self
    }

    pub fn camera_off(mut self) -> Self {
        self.camera_on = false;
        self
    }

    pub fn image(mut self, url: &str, width: u32, height: u32) -> Self {
        self.images = self.images.with(url, width, height, [90, 90, 90]);
        self
    }

    pub fn build(self) -> Harness {
        let session = Arc::new(FakeSession::default());
        let camera = start_camera("Front Camera");
        if self.camera_on {
            session.set_camera(Some(camera.track()));
        }

        let device = Arc::new(FakeDevice::default());
        let transport = Arc::new(RecordingTransport::new(self.ack));
        let alerter = Arc::new(CollectingAlerter::default());
        let loader = Arc::new(StubLoader {
            broken: self.broken_model,
            ..Default::default()
        });

        let workflow = BackgroundWorkflow::new(
            self.config,
            ModelManager::new(loader.clone()),
            Collaborators {
                device: device.clone(),
                session: session.clone(),
                transport: transport.clone(),
                alerter: alerter.clone(),
                images: Arc::new(self.images),
            },
        );

        Harness {
            workflow,
            session,
            device,
            transport,
            alerter,
            loader,
            camera,
        }
    }
}

impl Harness {
    pub fn camera_track(&self) -> Arc<dyn VideoTrack> {
        self.session
            .camera_track()
            .expect("session camera is set")
    }
}

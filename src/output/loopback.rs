use super::OutputSink;
use crate::capture::{TrackId, VideoTrack};
use crate::workflow::{DisconnectAck, OutboundTransport, TransportError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use image::RgbImage;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use v4l::video::Output;
use v4l::{Device, Format, FourCC};

/// v4l2loopback device fed with YUYV frames.
pub struct V4L2Output {
    file: File,
    width: u32,
    height: u32,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;
        let format = Format::new(width, height, FourCC::new(b"YUYV"));
        Output::set_format(&device, &format).context("Failed to set loopback output format")?;

        // v4l2loopback accepts raw frames written to the device node
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {} for writing", path.display()))?;

        Ok(Self {
            file,
            width,
            height,
        })
    }
}

/// Pack RGB into YUYV 4:2:2; each pixel pair shares averaged chroma.
fn rgb_to_yuyv(image: &RgbImage) -> Vec<u8> {
    let (width, height) = image.dimensions();
    let mut yuyv = Vec::with_capacity((width * height * 2) as usize);

    for row in image.rows() {
        let pixels: Vec<_> = row.collect();
        for pair in pixels.chunks(2) {
            let left = pair[0];
            let right = pair.get(1).copied().unwrap_or(left);
            let (y0, u0, v0) = rgb_to_yuv(left.0);
            let (y1, u1, v1) = rgb_to_yuv(right.0);
            let u = ((u0 as u16 + u1 as u16) / 2) as u8;
            let v = ((v0 as u16 + v1 as u16) / 2) as u8;
            yuyv.extend_from_slice(&[y0, u, y1, v]);
        }
    }

    yuyv
}

fn rgb_to_yuv([r, g, b]: [u8; 3]) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);

    let y = (0.299 * r + 0.587 * g + 0.114 * b).clamp(0.0, 255.0) as u8;
    let u = ((-0.147 * r - 0.289 * g + 0.436 * b) + 128.0).clamp(0.0, 255.0) as u8;
    let v = ((0.615 * r - 0.515 * g - 0.100 * b) + 128.0).clamp(0.0, 255.0) as u8;

    (y, u, v)
}

impl OutputSink for V4L2Output {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let resized;
        let frame = if frame.dimensions() == (self.width, self.height) {
            frame
        } else {
            resized = image::imageops::resize(
                frame,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            );
            &resized
        };

        self.file
            .write_all(&rgb_to_yuyv(frame))
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Copy frames from `track` into `sink` until the track ends, the sink fails
/// or `stop` fires. Returns the number of frames written.
pub async fn pump_frames(
    track: Arc<dyn VideoTrack>,
    mut sink: impl OutputSink,
    stop: CancellationToken,
) -> u64 {
    let mut written = 0;
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            frame = track.next_frame() => frame,
        };
        let Some(frame) = frame else {
            tracing::info!("{} ended, loopback idle", track.id());
            break;
        };
        if let Err(e) = sink.write_frame(&frame) {
            tracing::warn!("Loopback write failed: {:#}", e);
            break;
        }
        written += 1;
    }
    written
}

struct Pump {
    track: TrackId,
    stop: CancellationToken,
    task: JoinHandle<u64>,
}

/// Outbound transport that sends the committed track to a v4l2loopback
/// device, turning the pipeline into a virtual camera.
pub struct LoopbackTransport {
    device_path: PathBuf,
    width: u32,
    height: u32,
    pump: Mutex<Option<Pump>>,
}

impl LoopbackTransport {
    pub fn new(device_path: impl Into<PathBuf>, width: u32, height: u32) -> Self {
        Self {
            device_path: device_path.into(),
            width,
            height,
            pump: Mutex::new(None),
        }
    }

    fn pump(&self) -> MutexGuard<'_, Option<Pump>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self, track: Arc<dyn VideoTrack>) -> Result<(), TransportError> {
        let mut pump = self.pump();
        if let Some(active) = pump.as_ref() {
            return Err(TransportError::Rejected(format!(
                "{} is still connected",
                active.track
            )));
        }

        let sink = V4L2Output::new(&self.device_path, self.width, self.height)?;
        let stop = CancellationToken::new();
        let id = track.id();
        let task = tokio::spawn(pump_frames(track, sink, stop.clone()));
        tracing::info!("Loopback now sending {}", id);

        *pump = Some(Pump {
            track: id,
            stop,
            task,
        });
        Ok(())
    }
}

#[async_trait]
impl OutboundTransport for LoopbackTransport {
    fn current_track(&self) -> Option<TrackId> {
        self.pump().as_ref().map(|pump| pump.track)
    }

    async fn create(&self, track: Arc<dyn VideoTrack>) -> Result<(), TransportError> {
        self.start(track)
    }

    async fn disconnect(&self) -> Result<DisconnectAck, TransportError> {
        let active = self.pump().take();
        if let Some(pump) = active {
            pump.stop.cancel();
            let written = pump.task.await.unwrap_or(0);
            tracing::info!("Loopback released {} after {} frames", pump.track, written);
        }
        // The pump has exited, so nothing else writes to the device.
        Ok(DisconnectAck::Acknowledged)
    }

    async fn connect(&self, track: Arc<dyn VideoTrack>) -> Result<(), TransportError> {
        self.start(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameSource, TrackSettings};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn yuyv_packs_pixel_pairs() {
        let image = RgbImage::from_pixel(4, 2, image::Rgb([255, 255, 255]));
        let yuyv = rgb_to_yuyv(&image);
        assert_eq!(yuyv.len(), 4 * 2 * 2);
        assert!(yuyv[0] >= 254);
        assert!(yuyv[1].abs_diff(128) <= 1);
    }

    #[test]
    fn odd_width_repeats_last_pixel() {
        let image = RgbImage::from_pixel(3, 1, image::Rgb([0, 0, 0]));
        assert_eq!(rgb_to_yuyv(&image), vec![0, 128, 0, 128, 0, 128, 0, 128]);
    }

    struct Counting(Arc<AtomicUsize>);

    impl OutputSink for Counting {
        fn write_frame(&mut self, _frame: &RgbImage) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn resolution(&self) -> (u32, u32) {
            (2, 2)
        }
    }

    #[tokio::test]
    async fn pump_stops_when_track_ends() {
        let source = FrameSource::new(
            "Front",
            TrackSettings {
                width: 2,
                height: 2,
                frame_rate: 30,
            },
        );
        let track = source.track();
        let written = Arc::new(AtomicUsize::new(0));
        let pump = tokio::spawn(pump_frames(
            track.clone(),
            Counting(Arc::clone(&written)),
            CancellationToken::new(),
        ));

        tokio::task::yield_now().await;
        source.publish(Arc::new(RgbImage::new(2, 2)));
        tokio::task::yield_now().await;
        source.end();

        assert_eq!(pump.await.unwrap(), written.load(Ordering::SeqCst) as u64);
    }
}

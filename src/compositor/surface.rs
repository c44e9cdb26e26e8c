use crate::capture::Frame;
use crate::segmentation::Preprocessor;
use image::{imageops, RgbImage};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How a draw call combines with what is already on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeOp {
    /// Draw on top.
    SourceOver,
    /// Keep the source only where the canvas is empty; clear the rest.
    SourceOut,
    /// Keep the canvas only where the source is drawn, with the source
    /// showing through the canvas' transparent parts.
    DestinationAtop,
}

/// Premultiplied RGBA pixel, components in 0..=1.
type Pixel = [f32; 4];

const CLEAR: Pixel = [0.0; 4];

fn blend(op: CompositeOp, dst: Pixel, src: Pixel) -> Pixel {
    let (src_alpha, dst_alpha) = (src[3], dst[3]);
    std::array::from_fn(|i| match op {
        CompositeOp::SourceOver => src[i] + dst[i] * (1.0 - src_alpha),
        CompositeOp::SourceOut => src[i] * (1.0 - dst_alpha),
        CompositeOp::DestinationAtop => dst[i] * src_alpha + src[i] * (1.0 - dst_alpha),
    })
}

fn opaque(rgb: &image::Rgb<u8>) -> Pixel {
    [
        rgb[0] as f32 / 255.0,
        rgb[1] as f32 / 255.0,
        rgb[2] as f32 / 255.0,
        1.0,
    ]
}

/// Software 2D canvas with the blend modes the compositing steps need.
pub struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<Pixel>,
    op: CompositeOp,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![CLEAR; (width * height) as usize],
            op: CompositeOp::SourceOver,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Make every pixel transparent and return to `SourceOver`.
    pub fn clear(&mut self) {
        self.pixels.fill(CLEAR);
        self.op = CompositeOp::SourceOver;
    }

    pub fn set_composite_op(&mut self, op: CompositeOp) {
        self.op = op;
    }

    fn draw_with(&mut self, mut source: impl FnMut(u32, u32) -> Pixel) {
        let op = self.op;
        let width = self.width;
        for (i, dst) in self.pixels.iter_mut().enumerate() {
            let x = i as u32 % width;
            let y = i as u32 / width;
            *dst = blend(op, *dst, source(x, y));
        }
    }

    /// Draw the matte as coverage: opaque where the person is.
    pub fn draw_mask(&mut self, matte: &[f32]) {
        let width = self.width;
        self.draw_with(|x, y| {
            let alpha = matte
                .get((y * width + x) as usize)
                .copied()
                .unwrap_or(0.0)
                .clamp(0.0, 1.0);
            [alpha; 4]
        });
    }

    /// Fill with `image`, tiled when it is smaller than the canvas in either
    /// direction, otherwise drawn once from the top-left corner.
    pub fn fill_background(&mut self, image: &RgbImage) {
        let (image_width, image_height) = image.dimensions();
        if image_width == 0 || image_height == 0 {
            return;
        }
        let repeat = image_width < self.width || image_height < self.height;
        self.draw_with(|x, y| {
            if repeat {
                opaque(image.get_pixel(x % image_width, y % image_height))
            } else {
                opaque(image.get_pixel(x, y))
            }
        });
    }

    /// Draw a frame scaled to the canvas.
    pub fn draw_image(&mut self, frame: &RgbImage) {
        let scaled;
        let frame = if frame.dimensions() == (self.width, self.height) {
            frame
        } else {
            scaled = imageops::resize(frame, self.width, self.height, imageops::FilterType::Triangle);
            &scaled
        };
        self.draw_with(|x, y| opaque(frame.get_pixel(x, y)));
    }

    /// Flatten over black.
    pub fn to_rgb(&self) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let pixel = self.pixels[(y * self.width + x) as usize];
            image::Rgb(std::array::from_fn(|i| {
                (pixel[i] * 255.0).round().clamp(0.0, 255.0) as u8
            }))
        })
    }
}

/// The compositor's drawing surface: a canvas plus the last finished frame.
///
/// Its size is fixed when it is created for a source track.
pub struct DrawingSurface {
    canvas: Mutex<Canvas>,
    latest: Mutex<Option<Frame>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DrawingSurface {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        tracing::debug!("Drawing surface sized to {}x{}", width, height);
        Arc::new(Self {
            canvas: Mutex::new(Canvas::new(width, height)),
            latest: Mutex::new(None),
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        lock(&self.canvas).dimensions()
    }

    /// Composite one frame.
    ///
    /// The order is load-bearing: the mask leaves the person opaque,
    /// `SourceOut` paints the background only into the uncovered region, and
    /// `DestinationAtop` puts the camera frame into what remains.
    ///
    /// `matte` has the frame's dimensions; it is scaled with the frame when
    /// the surface differs in size.
    pub fn composite(&self, frame: &RgbImage, matte: &[f32], background: &RgbImage) {
        let _span = tracing::debug_span!("composite").entered();
        let (width, height) = self.dimensions();
        let (frame_width, frame_height) = frame.dimensions();
        let scaled;
        let matte = if (frame_width, frame_height) == (width, height) {
            matte
        } else {
            match Preprocessor::postprocess_matte(matte, frame_width, frame_height, width, height) {
                Ok(resized) => {
                    scaled = resized;
                    &scaled
                }
                Err(e) => {
                    tracing::debug!("Dropping frame: {:#}", e);
                    return;
                }
            }
        };

        let output = {
            let mut canvas = lock(&self.canvas);
            canvas.clear();
            canvas.draw_mask(matte);
            canvas.set_composite_op(CompositeOp::SourceOut);
            canvas.fill_background(background);
            canvas.set_composite_op(CompositeOp::DestinationAtop);
            canvas.draw_image(frame);
            canvas.to_rgb()
        };
        self.publish(output);
    }

    /// Show `image` as-is (matte visualization).
    pub fn present(&self, image: &RgbImage) {
        let output = {
            let mut canvas = lock(&self.canvas);
            canvas.clear();
            canvas.draw_image(image);
            canvas.to_rgb()
        };
        self.publish(output);
    }

    fn publish(&self, output: RgbImage) {
        *lock(&self.latest) = Some(Arc::new(output));
    }

    /// Most recently finished frame.
    pub fn latest(&self) -> Option<Frame> {
        lock(&self.latest).clone()
    }
}

use anyhow::{ensure, Result};
use image::{imageops, GrayImage, Luma, RgbImage};
use ndarray::Array4;

/// Converts camera frames to model tensors and model mattes back to frame
/// space.
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
        }
    }

    /// Resize `image` to the model input size and lay it out as a
    /// normalized `[1, 3, height, width]` tensor.
    pub fn preprocess(&self, image: &RgbImage) -> Array4<f32> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized;
        let input = if image.dimensions() == (self.target_width, self.target_height) {
            image
        } else {
            // Triangle keeps per-frame cost low; the matte is smoothed on the
            // way back anyway.
            resized = imageops::resize(
                image,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            );
            &resized
        };

        let shape = (1, 3, self.target_height as usize, self.target_width as usize);
        Array4::from_shape_fn(shape, |(_, channel, y, x)| {
            input.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        })
    }

    /// Scale a model-resolution matte to `target_width`x`target_height`.
    pub fn postprocess_matte(
        matte: &[f32],
        matte_width: u32,
        matte_height: u32,
        target_width: u32,
        target_height: u32,
    ) -> Result<Vec<f32>> {
        let _span = tracing::debug_span!("postprocess").entered();

        ensure!(
            matte.len() == (matte_width * matte_height) as usize,
            "matte has {} values, expected {}x{}",
            matte.len(),
            matte_width,
            matte_height
        );

        if (matte_width, matte_height) == (target_width, target_height) {
            return Ok(matte.to_vec());
        }

        let gray = GrayImage::from_fn(matte_width, matte_height, |x, y| {
            Luma([to_byte(matte[(y * matte_width + x) as usize])])
        });

        let resized = imageops::resize(
            &gray,
            target_width,
            target_height,
            imageops::FilterType::Triangle,
        );

        Ok(resized.pixels().map(|p| p[0] as f32 / 255.0).collect())
    }

    /// Grayscale rendering of a matte, for `--show-matte`.
    pub fn matte_to_rgb(matte: &[f32], width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let value = to_byte(matte[(y * width + x) as usize]);
            image::Rgb([value, value, value])
        })
    }
}

fn to_byte(value: f32) -> u8 {
    (value * 255.0).clamp(0.0, 255.0) as u8
}

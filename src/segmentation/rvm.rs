use super::preprocess::Preprocessor;
use super::types::{Matte, SegmentationModel};
use anyhow::{ensure, Context, Result};
use image::RgbImage;
use ndarray::{Array1, Array4, Ix4};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{DynValue, TensorRef};
use std::path::Path;

/// Recurrent inputs r1..r4 carried from one frame to the next.
struct RecurrentState([Array4<f32>; 4]);

impl RecurrentState {
    /// The exported graph accepts 1x1x1x1 zeros for the first frame.
    fn zeros() -> Self {
        Self(std::array::from_fn(|_| Array4::zeros((1, 1, 1, 1))))
    }
}

/// RobustVideoMatting over ONNX Runtime.
///
/// Temporal consistency comes from the recurrent state, so the state must be
/// reset when the camera changes.
pub struct RobustVideoMatting {
    session: Session,
    preprocessor: Preprocessor,
    width: u32,
    height: u32,
    downsample_ratio: f32,
    recurrent: Option<RecurrentState>,
}

impl RobustVideoMatting {
    /// Load the model with a 512x512 input and a 0.25 downsample ratio.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        Self::with_input_size(model_path, 512, 512)
    }

    pub fn with_input_size<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading RVM model from {}", path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        // src, r1i..r4i, downsample_ratio
        ensure!(
            session.inputs.len() == 6,
            "{} is not a RobustVideoMatting export ({} inputs)",
            path.display(),
            session.inputs.len()
        );

        tracing::info!("RVM model loaded ({}x{} input)", width, height);

        Ok(Self {
            session,
            preprocessor: Preprocessor::new(width, height),
            width,
            height,
            downsample_ratio: 0.25,
            recurrent: None,
        })
    }
}

fn extract_4d(value: &DynValue) -> Result<Array4<f32>> {
    let array = value
        .try_extract_array::<f32>()?
        .to_owned()
        .into_dimensionality::<Ix4>()?;
    Ok(array)
}

impl SegmentationModel for RobustVideoMatting {
    fn segment(&mut self, frame: &RgbImage) -> Result<Matte> {
        let _span = tracing::debug_span!("rvm_segment").entered();

        let src = self.preprocessor.preprocess(frame);
        let ratio = Array1::from_elem(1, self.downsample_ratio);
        let RecurrentState([r1, r2, r3, r4]) =
            self.recurrent.take().unwrap_or_else(RecurrentState::zeros);

        let (pha, next) = {
            let _infer_span = tracing::debug_span!("inference").entered();
            let outputs = self
                .session
                .run(ort::inputs![
                    TensorRef::from_array_view(src.view())?,
                    TensorRef::from_array_view(r1.view())?,
                    TensorRef::from_array_view(r2.view())?,
                    TensorRef::from_array_view(r3.view())?,
                    TensorRef::from_array_view(r4.view())?,
                    TensorRef::from_array_view(ratio.view())?
                ])
                .context("Failed to run inference")?;

            // fgr, pha, r1o..r4o; only the alpha and the state are used.
            let pha = extract_4d(&outputs[1])?;
            let next = RecurrentState([
                extract_4d(&outputs[2])?,
                extract_4d(&outputs[3])?,
                extract_4d(&outputs[4])?,
                extract_4d(&outputs[5])?,
            ]);
            (pha, next)
        };
        self.recurrent = Some(next);

        let (_, _, matte_height, matte_width) = pha.dim();
        let matte: Vec<f32> = pha.iter().copied().collect();

        let (frame_width, frame_height) = frame.dimensions();
        Preprocessor::postprocess_matte(
            &matte,
            matte_width as u32,
            matte_height as u32,
            frame_width,
            frame_height,
        )
    }

    fn reset_state(&mut self) {
        tracing::info!("Resetting RVM recurrent state");
        self.recurrent = None;
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

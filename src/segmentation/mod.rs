mod manager;
mod preprocess;
mod rvm;
pub mod types;

pub use manager::{ModelLoader, ModelManager, ModelStatus, SharedModel};
pub use preprocess::Preprocessor;
pub use rvm::RobustVideoMatting;
pub use types::{Matte, SegmentationModel};

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

/// Loads RobustVideoMatting from an ONNX file on a blocking thread.
pub struct OnnxModelLoader {
    path: PathBuf,
}

impl OnnxModelLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ModelLoader for OnnxModelLoader {
    async fn load(&self) -> Result<Box<dyn SegmentationModel>> {
        let path = self.path.clone();
        let model = tokio::task::spawn_blocking(move || RobustVideoMatting::new(path))
            .await
            .context("Model loading task panicked")??;
        Ok(Box::new(model))
    }
}

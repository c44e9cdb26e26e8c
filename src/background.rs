//! Background selections and the images behind them.

use crate::capture::Frame;
use crate::error::BackgroundError;
use crate::resolution::ResolutionTier;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// What the user picked. Replaced wholesale on every selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackgroundSelection {
    #[default]
    None,
    RemoteImage {
        thumbnail_url: String,
        preview_url: String,
        full_url: String,
    },
    CustomImage {
        data_url: String,
    },
}

impl BackgroundSelection {
    pub fn is_none(&self) -> bool {
        matches!(self, BackgroundSelection::None)
    }

    /// URL of the full-resolution image used for compositing.
    pub fn full_resolution_url(&self) -> Option<&str> {
        match self {
            BackgroundSelection::None => None,
            BackgroundSelection::RemoteImage { full_url, .. } => Some(full_url),
            BackgroundSelection::CustomImage { data_url } => Some(data_url),
        }
    }
}

/// A selection with its image decoded and validated.
#[derive(Debug, Clone)]
pub enum ResolvedBackground {
    None,
    Image {
        selection: BackgroundSelection,
        image: Frame,
    },
}

impl ResolvedBackground {
    pub fn selection(&self) -> BackgroundSelection {
        match self {
            ResolvedBackground::None => BackgroundSelection::None,
            ResolvedBackground::Image { selection, .. } => selection.clone(),
        }
    }

    pub fn image(&self) -> Option<&Frame> {
        match self {
            ResolvedBackground::None => None,
            ResolvedBackground::Image { image, .. } => Some(image),
        }
    }
}

/// Fetches and decodes background images.
#[async_trait]
pub trait BackgroundImageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<RgbImage>;
}

/// Decode the selection's image and check it against the tier's bounds.
pub async fn resolve(
    selection: &BackgroundSelection,
    images: &dyn BackgroundImageSource,
    tier: ResolutionTier,
) -> Result<ResolvedBackground, BackgroundError> {
    let Some(url) = selection.full_resolution_url() else {
        return Ok(ResolvedBackground::None);
    };

    let image = images
        .fetch(url)
        .await
        .map_err(|e| BackgroundError::ImageUnavailable(format!("{:#}", e)))?;

    let (width, height) = image.dimensions();
    tier.validate(width, height)?;
    tracing::debug!("Background image {}x{} accepted for {}", width, height, tier);

    Ok(ResolvedBackground::Image {
        selection: selection.clone(),
        image: Arc::new(image),
    })
}

/// Reads images from local paths, `file://` URLs and base64 `data:` URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsImageSource;

impl FsImageSource {
    fn decode_data_url(url: &str) -> Result<RgbImage> {
        let (header, payload) = url
            .split_once(',')
            .ok_or_else(|| anyhow!("malformed data URL"))?;
        if !header.ends_with(";base64") {
            bail!("only base64 data URLs are supported");
        }
        let bytes = STANDARD
            .decode(payload.trim())
            .context("Invalid base64 in data URL")?;
        let image = image::load_from_memory(&bytes).context("Failed to decode data URL image")?;
        Ok(image.to_rgb8())
    }
}

#[async_trait]
impl BackgroundImageSource for FsImageSource {
    async fn fetch(&self, url: &str) -> Result<RgbImage> {
        if url.starts_with("data:") {
            return Self::decode_data_url(url);
        }

        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        tokio::task::spawn_blocking(move || {
            let image = image::open(&path)
                .with_context(|| format!("Failed to open background {}", path.display()))?;
            Ok(image.to_rgb8())
        })
        .await
        .context("Background decoding task panicked")?
    }
}

use crate::error::BackgroundError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Output resolution class of the session; each class bounds the size of
/// background images it accepts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionTier {
    #[default]
    Standard,
    Fhd,
    Qhd,
}

/// Inclusive pixel bounds, (width, height).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionBounds {
    pub min: (u32, u32),
    pub max: (u32, u32),
}

impl ResolutionTier {
    pub fn bounds(self) -> ResolutionBounds {
        match self {
            ResolutionTier::Standard => ResolutionBounds {
                min: (640, 640),
                max: (1920, 1920),
            },
            ResolutionTier::Fhd => ResolutionBounds {
                min: (1280, 1280),
                max: (2560, 2560),
            },
            ResolutionTier::Qhd => ResolutionBounds {
                min: (1920, 1920),
                max: (3840, 3840),
            },
        }
    }

    /// Tier for a session sending `width`x`height` video.
    pub fn for_output(width: u32, height: u32) -> Self {
        let short_side = width.min(height);
        if short_side >= 1440 {
            ResolutionTier::Qhd
        } else if short_side >= 1080 {
            ResolutionTier::Fhd
        } else {
            ResolutionTier::Standard
        }
    }

    pub fn validate(self, width: u32, height: u32) -> Result<(), BackgroundError> {
        let ResolutionBounds { min, max } = self.bounds();

        if width < min.0 || height < min.1 {
            return Err(BackgroundError::ResolutionTooLow {
                width,
                height,
                min_width: min.0,
                min_height: min.1,
                tier: self,
            });
        }

        if width > max.0 || height > max.1 {
            return Err(BackgroundError::ResolutionTooHigh {
                width,
                height,
                max_width: max.0,
                max_height: max.1,
                tier: self,
            });
        }

        Ok(())
    }
}

impl fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionTier::Standard => "standard",
            ResolutionTier::Fhd => "fhd",
            ResolutionTier::Qhd => "qhd",
        };
        f.write_str(name)
    }
}

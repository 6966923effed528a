//! Denoiser capability. Actual backends (OptiX, OIDN) live outside of this crate and are
//! registered by the application.

use crate::{bitmap::Bitmap, error::DenoiseError};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, sync::Arc};

/// Which denoiser to run on baked bitmaps.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DenoiserType {
    None,
    #[default]
    Optix,
    Oidn,
}

impl DenoiserType {
    /// Decodes the value stored in config files and property bags.
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Self::None),
            1 => Some(Self::Optix),
            2 => Some(Self::Oidn),
            _ => None,
        }
    }

    pub fn index(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Optix => 1,
            Self::Oidn => 2,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" | "off" => Some(Self::None),
            "optix" => Some(Self::Optix),
            "oidn" => Some(Self::Oidn),
            _ => None,
        }
    }
}

/// External `denoise(bitmap) -> bitmap` capability.
pub trait Denoiser: Send + Sync + Debug {
    /// Returns a denoised copy of `bitmap`. When `denoise_alpha` is set the alpha channel is
    /// denoised as well, otherwise it is passed through.
    fn denoise(&self, bitmap: &Bitmap, denoise_alpha: bool) -> Result<Bitmap, DenoiseError>;
}

/// Set of denoiser backends available to a bake.
#[derive(Clone, Debug, Default)]
pub struct DenoiserRegistry {
    backends: FxHashMap<DenoiserType, Arc<dyn Denoiser>>,
}

impl DenoiserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: DenoiserType, denoiser: Arc<dyn Denoiser>) {
        self.backends.insert(kind, denoiser);
    }

    pub fn with(mut self, kind: DenoiserType, denoiser: Arc<dyn Denoiser>) -> Self {
        self.register(kind, denoiser);
        self
    }

    /// Runs selected denoiser. `DenoiserType::None` is a pass-through.
    pub fn denoise(
        &self,
        kind: DenoiserType,
        bitmap: &Bitmap,
        denoise_alpha: bool,
    ) -> Result<Bitmap, DenoiseError> {
        if kind == DenoiserType::None {
            return Ok(bitmap.clone());
        }
        let backend = self
            .backends
            .get(&kind)
            .ok_or(DenoiseError::Unavailable(kind))?;
        let result = backend.denoise(bitmap, denoise_alpha)?;
        if result.dimensions() != bitmap.dimensions() {
            return Err(DenoiseError::Failed(format!(
                "denoiser returned {:?}, expected {:?}",
                result.dimensions(),
                bitmap.dimensions()
            )));
        }
        Ok(result)
    }
}

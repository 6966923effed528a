//! Error types of the baker.

use crate::denoise::DenoiserType;

/// Programmer errors: the operation was called with arguments that violate its contract.
/// These are never recovered from at runtime, the operation is rejected instead.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    /// Two bitmaps that must have identical dimensions do not.
    #[error("Bitmap dimensions mismatch: {left:?} vs {right:?} (width, height, array size).")]
    DimensionMismatch {
        left: (u32, u32, u32),
        right: (u32, u32, u32),
    },
    /// A texel address lies outside of width x height x array size.
    #[error("Texel ({x}, {y}, {slice}) is out of range of a {width}x{height}x{array_size} bitmap.")]
    TexelOutOfRange {
        x: u32,
        y: u32,
        slice: u32,
        width: u32,
        height: u32,
        array_size: u32,
    },
    /// Operation is only defined for square bitmaps.
    #[error("Bitmap must be square, got {width}x{height}.")]
    NotSquare { width: u32, height: u32 },
    /// An index of a vertex in a triangle is out of bounds.
    #[error("An index of a vertex in a triangle is out of bounds.")]
    InvalidIndex,
}

/// An error that may occur during baking or packing.
#[derive(thiserror::Error, Debug)]
pub enum BakeError {
    /// Baking was cancelled by the user.
    #[error("Baking was cancelled by the user.")]
    Cancelled,
    /// A bake is already running, or the scene was about to be replaced during a bake.
    #[error("A bake is already in progress.")]
    BakeInProgress,
    /// The thread running a bake panicked.
    #[error("Bake task panicked.")]
    TaskPanicked,
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),
}

/// Failure of an external denoiser. Always recovered from by keeping the noisy input.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DenoiseError {
    #[error("Denoiser {0:?} is not available.")]
    Unavailable(DenoiserType),
    #[error("Denoiser failed: {0}")]
    Failed(String),
}

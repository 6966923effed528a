//! Bitmap post-processing: hole filling, denoising, encode preparation and channel packing.

use crate::{
    bitmap::Bitmap,
    denoise::{DenoiserRegistry, DenoiserType},
    error::PreconditionError,
    logger::Logger,
};
use nalgebra::Vector4;

/// Fills unpopulated texels (alpha == 0) from populated ones, so that bilinear filtering at
/// UV island borders does not pull in black.
///
/// Works bottom-up on square blocks of growing size (2, 4, 8, ... up to the whole slice): in
/// every block that contains both populated and empty texels, the empty texels receive the
/// mean of the populated ones. Fully populated and fully empty blocks are left as is at that
/// level. Each array slice is processed independently.
pub fn dilate(bitmap: &mut Bitmap) -> Result<(), PreconditionError> {
    if !bitmap.is_square() {
        return Err(PreconditionError::NotSquare {
            width: bitmap.width(),
            height: bitmap.height(),
        });
    }

    let size = bitmap.width() as usize;
    if size < 2 {
        return Ok(());
    }
    let slice_len = bitmap.slice_len();

    for slice in bitmap.data_mut().chunks_exact_mut(slice_len) {
        let mut block = 2;
        loop {
            dilate_level(slice, size, block);
            if block >= size {
                break;
            }
            block = (block * 2).min(size);
        }
    }

    Ok(())
}

fn dilate_level(texels: &mut [Vector4<f32>], size: usize, block: usize) {
    for by in (0..size).step_by(block) {
        for bx in (0..size).step_by(block) {
            let rows = by..(by + block).min(size);
            let columns = bx..(bx + block).min(size);

            let mut sum = Vector4::zeros();
            let mut populated = 0usize;
            let mut total = 0usize;
            for y in rows.clone() {
                for texel in &texels[y * size + columns.start..y * size + columns.end] {
                    if Bitmap::is_populated(texel) {
                        sum += texel;
                        populated += 1;
                    }
                    total += 1;
                }
            }

            if populated == 0 || populated == total {
                continue;
            }

            let mean = sum / populated as f32;
            for y in rows {
                for texel in &mut texels[y * size + columns.start..y * size + columns.end] {
                    if !Bitmap::is_populated(texel) {
                        *texel = mean;
                    }
                }
            }
        }
    }
}

/// Runs selected denoiser over the bitmap. A failing or missing denoiser is not fatal: the
/// failure is logged and the input is returned unchanged.
pub fn denoise(
    bitmap: &Bitmap,
    denoisers: &DenoiserRegistry,
    kind: DenoiserType,
    denoise_alpha: bool,
    logger: &Logger,
) -> Bitmap {
    match denoisers.denoise(kind, bitmap, denoise_alpha) {
        Ok(denoised) => denoised,
        Err(err) => {
            logger.warn(format_args!(
                "Denoising failed, keeping noisy result. Reason: {}",
                err
            ));
            bitmap.clone()
        }
    }
}

/// Transforms applied right before quantization to 8 bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodeReadyFlags {
    /// Gamma 2.2 encoding, `pow(1 / 2.2)`.
    pub srgb: bool,
    /// Square root, a cheap perceptual curve for data decoded with `x * x`.
    pub sqrt: bool,
}

/// Applies encode transforms to the color channels of every texel, alpha is left intact.
/// Channels are clamped to `[0; 1]` first, non-finite values become zero.
pub fn make_encode_ready(bitmap: &mut Bitmap, flags: EncodeReadyFlags) {
    for texel in bitmap.data_mut() {
        for channel in texel.fixed_rows_mut::<3>(0).iter_mut() {
            let mut value = if channel.is_finite() {
                channel.clamp(0.0, 1.0)
            } else {
                0.0
            };
            if flags.sqrt {
                value = value.sqrt();
            }
            if flags.srgb {
                value = value.powf(1.0 / 2.2);
            }
            *channel = value;
        }
    }
}

/// Packs the shadow map into the alpha channel of the light map: color comes from `light`,
/// alpha is the mean of the shadow texel's color channels.
pub fn combine(light: &Bitmap, shadow: &Bitmap) -> Result<Bitmap, PreconditionError> {
    light.check_same_dimensions(shadow)?;
    let mut result = light.clone();
    for (texel, shadow) in result.data_mut().iter_mut().zip(shadow.data()) {
        texel.w = (shadow.x + shadow.y + shadow.z) / 3.0;
    }
    Ok(result)
}

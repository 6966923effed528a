//! In-memory float RGBA texture, backing store for every intermediate and final lightmap.

use crate::error::PreconditionError;
use nalgebra::{Vector2, Vector4};

/// `width x height x array_size` grid of RGBA float texels.
///
/// While a light map is being baked the alpha channel marks sampled texels (alpha > 0), texels
/// with zero alpha are "holes" which are filled later by dilation.
#[derive(Clone, Debug, PartialEq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    array_size: u32,
    data: Vec<Vector4<f32>>,
}

impl Bitmap {
    /// Creates a new bitmap filled with transparent black.
    pub fn new(width: u32, height: u32, array_size: u32) -> Self {
        Self::filled(width, height, array_size, Vector4::zeros())
    }

    /// Creates a new bitmap where every texel has the given color.
    pub fn filled(width: u32, height: u32, array_size: u32, color: Vector4<f32>) -> Self {
        let len = width as usize * height as usize * array_size as usize;
        Self {
            width,
            height,
            array_size,
            data: vec![color; len],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn array_size(&self) -> u32 {
        self.array_size
    }

    /// Returns `(width, height, array_size)`.
    pub fn dimensions(&self) -> (u32, u32, u32) {
        (self.width, self.height, self.array_size)
    }

    pub fn is_square(&self) -> bool {
        self.width == self.height
    }

    /// Amount of texels in a single array slice.
    pub fn slice_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Converts texel address into linear index, fails if the address is out of range.
    pub fn index(&self, x: u32, y: u32, slice: u32) -> Result<usize, PreconditionError> {
        if x >= self.width || y >= self.height || slice >= self.array_size {
            return Err(PreconditionError::TexelOutOfRange {
                x,
                y,
                slice,
                width: self.width,
                height: self.height,
                array_size: self.array_size,
            });
        }
        Ok(slice as usize * self.slice_len() + y as usize * self.width as usize + x as usize)
    }

    /// Converts linear index back into `(x, y, slice)`.
    pub fn coords(&self, index: usize) -> (u32, u32, u32) {
        let slice_len = self.slice_len().max(1);
        let slice = index / slice_len;
        let rest = index % slice_len;
        let width = self.width.max(1) as usize;
        ((rest % width) as u32, (rest / width) as u32, slice as u32)
    }

    pub fn get(&self, x: u32, y: u32, slice: u32) -> Result<Vector4<f32>, PreconditionError> {
        Ok(self.data[self.index(x, y, slice)?])
    }

    pub fn set(
        &mut self,
        x: u32,
        y: u32,
        slice: u32,
        color: Vector4<f32>,
    ) -> Result<(), PreconditionError> {
        let index = self.index(x, y, slice)?;
        self.data[index] = color;
        Ok(())
    }

    pub fn data(&self) -> &[Vector4<f32>] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [Vector4<f32>] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<Vector4<f32>> {
        self.data
    }

    /// Texels of a single array slice.
    pub fn slice(&self, slice: u32) -> &[Vector4<f32>] {
        let len = self.slice_len();
        let begin = (slice as usize * len).min(self.data.len());
        let end = (begin + len).min(self.data.len());
        &self.data[begin..end]
    }

    /// Returns true if texel was sampled (alpha is not zero).
    #[inline]
    pub fn is_populated(texel: &Vector4<f32>) -> bool {
        texel.w > 0.0
    }

    /// Nearest-neighbour lookup with periodic (repeat) addressing.
    pub fn sample_nearest(&self, uv: Vector2<f32>, slice: u32) -> Vector4<f32> {
        if self.width == 0 || self.height == 0 || self.array_size == 0 {
            return Vector4::zeros();
        }
        let u = uv.x - uv.x.floor();
        let v = uv.y - uv.y.floor();
        let x = ((u * self.width as f32) as u32).min(self.width - 1);
        let y = ((v * self.height as f32) as u32).min(self.height - 1);
        let slice = slice.min(self.array_size - 1);
        let index =
            slice as usize * self.slice_len() + y as usize * self.width as usize + x as usize;
        self.data[index]
    }

    /// Quantizes a slice into tightly packed RGBA8. Channels are clamped to `[0; 1]`.
    pub fn to_rgba8(&self, slice: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.slice_len() * 4);
        for texel in self.slice(slice) {
            for channel in texel.iter() {
                bytes.push((channel.clamp(0.0, 1.0) * 255.0 + 0.5) as u8);
            }
        }
        bytes
    }

    /// Checks that both bitmaps have identical dimensions.
    pub fn check_same_dimensions(&self, other: &Bitmap) -> Result<(), PreconditionError> {
        if self.dimensions() != other.dimensions() {
            return Err(PreconditionError::DimensionMismatch {
                left: self.dimensions(),
                right: other.dimensions(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn texel_access_is_bounds_checked() {
        let mut bitmap = Bitmap::new(4, 2, 3);
        let color = Vector4::new(1.0, 0.5, 0.25, 1.0);
        bitmap.set(3, 1, 2, color).unwrap();
        assert_eq!(bitmap.get(3, 1, 2).unwrap(), color);
        assert_eq!(bitmap.get(0, 0, 0).unwrap(), Vector4::zeros());

        assert!(matches!(
            bitmap.get(4, 0, 0),
            Err(PreconditionError::TexelOutOfRange { x: 4, .. })
        ));
        assert!(bitmap.set(0, 2, 0, color).is_err());
        assert!(bitmap.set(0, 0, 3, color).is_err());
    }

    #[test]
    fn coords_invert_index() {
        let bitmap = Bitmap::new(5, 3, 2);
        for slice in 0..2 {
            for y in 0..3 {
                for x in 0..5 {
                    let index = bitmap.index(x, y, slice).unwrap();
                    assert_eq!(bitmap.coords(index), (x, y, slice));
                }
            }
        }
    }

    #[test]
    fn nearest_sampling_wraps() {
        let mut bitmap = Bitmap::new(2, 2, 1);
        let red = Vector4::new(1.0, 0.0, 0.0, 1.0);
        bitmap.set(1, 0, 0, red).unwrap();
        assert_eq!(bitmap.sample_nearest(Vector2::new(0.75, 0.25), 0), red);
        assert_eq!(bitmap.sample_nearest(Vector2::new(1.75, -0.75), 0), red);
    }

    #[test]
    fn rgba8_quantization_clamps() {
        let bitmap = Bitmap::filled(1, 1, 1, Vector4::new(2.0, -1.0, 0.5, 1.0));
        assert_eq!(bitmap.to_rgba8(0), vec![255, 0, 128, 255]);
    }
}

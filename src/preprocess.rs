use image::{imageops::FilterType, DynamicImage};
use ndarray::prelude::*;

use crate::errors::Result;
use crate::imageops::{resize_square, to_grayscale, to_unit_array};

/// Side length the network is trained and served at.
pub const IMAGE_SIZE: u32 = 256;

/// Turns a decoded image into the `(1, size, size, 1)` network input.
///
/// Grayscale first, then a direct stretch to the square size, then
/// intensities divided by 255, then the batch axis.
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    pub image_size: u32,
    pub filter: FilterType,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(IMAGE_SIZE)
    }
}

impl Preprocessor {
    /// Serving preprocessor: bicubic resampling.
    pub const fn new(image_size: u32) -> Self {
        Self {
            image_size,
            filter: FilterType::CatmullRom,
        }
    }

    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    /// `(size, size)` grayscale plane in `[0, 1]`.
    pub fn plane(&self, image: &DynamicImage) -> Result<Array2<f32>> {
        let gray = to_grayscale(image);
        let resized = resize_square(&gray, self.image_size, self.filter);
        to_unit_array(&resized)
    }

    pub fn preprocess(&self, image: &DynamicImage) -> Result<Array4<f32>> {
        let plane = self.plane(image)?;
        Ok(plane.insert_axis(Axis(0)).insert_axis(Axis(3)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    #[test]
    fn output_has_batched_nhwc_shape() -> Result<()> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(300, 120, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 200])
        }));
        let tensor = Preprocessor::default().preprocess(&image)?;
        assert_eq!(tensor.shape(), &[1, 256, 256, 1]);
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
        Ok(())
    }

    #[test]
    fn small_rgba_input_is_stretched() -> Result<()> {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(3, 7, Rgba([255, 255, 255, 10])));
        let tensor = Preprocessor::default().preprocess(&image)?;
        assert_eq!(tensor.shape(), &[1, 256, 256, 1]);
        assert!(tensor.iter().all(|v| (*v - 1.0).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn custom_size_is_honoured() -> Result<()> {
        let image = DynamicImage::new_luma8(10, 10);
        let tensor = Preprocessor::new(32)
            .with_filter(FilterType::Nearest)
            .preprocess(&image)?;
        assert_eq!(tensor.shape(), &[1, 32, 32, 1]);
        Ok(())
    }
}

//! Explicit conversions between decoded images and network arrays.

use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, ImageBuffer, Luma, Primitive};
use ndarray::Array2;
use num_traits::{AsPrimitive, Bounded, NumCast};
use std::any::TypeId;

use crate::errors::Result;

pub fn is_floating_point<T: 'static>() -> bool {
    TypeId::of::<T>() == TypeId::of::<f32>() || TypeId::of::<T>() == TypeId::of::<f64>()
}

/// Full-scale value of a subpixel type: `1.0` for floats, the type maximum otherwise.
pub fn get_max_value<T: Bounded + NumCast + 'static>() -> T {
    if is_floating_point::<T>() {
        T::from(1.0).unwrap_or_else(T::max_value)
    } else {
        T::max_value()
    }
}

/// ITU-R 601-2 luma in 16-bit fixed point.
#[inline]
fn luma601(r: u8, g: u8, b: u8) -> u8 {
    let l = r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000;
    (l >> 16) as u8
}

/// Converts any color mode to a single 8-bit luminance channel.
///
/// Alpha is dropped, not composited.
pub fn to_grayscale(image: &DynamicImage) -> GrayImage {
    match image {
        DynamicImage::ImageLuma8(gray) => gray.clone(),
        DynamicImage::ImageLumaA8(gray_alpha) => {
            ImageBuffer::from_fn(gray_alpha.width(), gray_alpha.height(), |x, y| {
                Luma([gray_alpha.get_pixel(x, y)[0]])
            })
        }
        DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA16(_) => image.to_luma8(),
        other => {
            let rgb = other.to_rgb8();
            ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
                let [r, g, b] = rgb.get_pixel(x, y).0;
                Luma([luma601(r, g, b)])
            })
        }
    }
}

/// Stretches to `size`×`size`. No crop, no padding, aspect ratio is not kept.
pub fn resize_square(image: &GrayImage, size: u32, filter: FilterType) -> GrayImage {
    if image.dimensions() == (size, size) {
        return image.clone();
    }
    imageops::resize(image, size, size, filter)
}

/// Row-major `(height, width)` array scaled to `[0, 1]` by the subpixel maximum.
pub fn to_unit_array<S>(image: &ImageBuffer<Luma<S>, Vec<S>>) -> Result<Array2<f32>>
where
    S: Primitive + AsPrimitive<f32> + 'static,
{
    let max: f32 = get_max_value::<S>().as_();
    let (width, height) = image.dimensions();
    let values = image.as_raw().iter().map(|v| v.as_() / max).collect();
    Ok(Array2::from_shape_vec(
        (height as usize, width as usize),
        values,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    #[test]
    fn grayscale_uses_luma_weights() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([255, 0, 0])));
        let gray = to_grayscale(&image);
        assert_eq!(gray.get_pixel(0, 0)[0], 76);

        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 1, Rgb([255, 255, 255])));
        assert_eq!(to_grayscale(&white).get_pixel(0, 0)[0], 255);
    }

    #[test]
    fn grayscale_ignores_alpha() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba([0, 255, 0, 0])));
        assert_eq!(to_grayscale(&image).get_pixel(0, 0)[0], 150);
    }

    #[test]
    fn resize_stretches_to_square() {
        let image = GrayImage::from_pixel(40, 10, Luma([9]));
        let resized = resize_square(&image, 16, FilterType::Nearest);
        assert_eq!(resized.dimensions(), (16, 16));
        assert!(resized.pixels().all(|p| p[0] == 9));
    }

    #[test]
    fn unit_array_is_row_major_and_scaled() -> Result<()> {
        let mut image = GrayImage::new(3, 2);
        image.put_pixel(2, 1, Luma([255]));
        let array = to_unit_array(&image)?;
        assert_eq!(array.dim(), (2, 3));
        assert_eq!(array[[1, 2]], 1.0);
        assert_eq!(array[[0, 0]], 0.0);
        Ok(())
    }

    #[test]
    fn max_value_depends_on_subpixel() {
        assert_eq!(get_max_value::<u8>(), 255);
        assert_eq!(get_max_value::<u16>(), 65535);
        assert_eq!(get_max_value::<f32>(), 1.0);
    }
}

//! Two distinct output policies: the serving path rescales the continuous
//! probability to 8 bits, training-time cleanup binarizes at a threshold.

use std::path::Path;

use image::{GrayImage, ImageFormat};
use ndarray::prelude::*;

use crate::errors::{ProcareSegError, Result};

pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// `p * 255` truncated toward zero; out-of-range values saturate.
#[inline]
pub fn probability_to_intensity(probability: f32) -> u8 {
    (probability * 255.0) as u8
}

/// 1.0 where `p > threshold`, else 0.0. `p == threshold` maps to 0.
pub fn binarize<D: Dimension>(probabilities: &Array<f32, D>, threshold: f32) -> Array<f32, D> {
    probabilities.mapv(|p| if p > threshold { 1.0 } else { 0.0 })
}

/// Drops a leading batch axis of one and a trailing channel axis of one.
///
/// Accepts `(h, w)`, `(h, w, 1)` and `(1, h, w, 1)`.
pub fn squeeze_probabilities<'a>(
    probabilities: ArrayViewD<'a, f32>,
) -> Result<ArrayView2<'a, f32>> {
    let shape = probabilities.shape().to_vec();
    let plane = match shape.as_slice() {
        [_, _] => probabilities,
        [_, _, 1] => probabilities.index_axis_move(Axis(2), 0),
        [1, _, _, 1] => probabilities
            .index_axis_move(Axis(3), 0)
            .index_axis_move(Axis(0), 0),
        _ => {
            return Err(ProcareSegError::validation(
                "probabilities",
                format!("expected (h, w), (h, w, 1) or (1, h, w, 1), got {shape:?}"),
            ))
        }
    };
    Ok(plane.into_dimensionality::<Ix2>()?)
}

/// Serving-path export: a grayscale image of the rescaled probabilities.
pub fn to_mask_image(probabilities: ArrayViewD<f32>) -> Result<GrayImage> {
    let plane = squeeze_probabilities(probabilities)?;
    let (height, width) = plane.dim();
    let pixels: Vec<u8> = plane.iter().copied().map(probability_to_intensity).collect();
    GrayImage::from_raw(width as u32, height as u32, pixels).ok_or_else(|| {
        ProcareSegError::validation("mask", "buffer does not match its dimensions")
    })
}

pub fn save_mask(mask: &GrayImage, path: &Path, format: ImageFormat) -> Result<()> {
    mask.save_with_format(path, format)
        .map_err(|e| ProcareSegError::ImageProcessing {
            path: path.display().to_string(),
            operation: "mask save".to_string(),
            source: Box::new(e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_is_bounded_and_monotonic() {
        let mut previous = 0u8;
        for step in 0..=1000 {
            let p = step as f32 / 1000.0;
            let value = probability_to_intensity(p);
            assert!(value >= previous);
            previous = value;
        }
        assert_eq!(probability_to_intensity(0.0), 0);
        assert_eq!(probability_to_intensity(1.0), 255);
        assert_eq!(probability_to_intensity(0.5), 127);
    }

    #[test]
    fn rescale_saturates_outside_unit_range() {
        assert_eq!(probability_to_intensity(-0.3), 0);
        assert_eq!(probability_to_intensity(1.7), 255);
        assert_eq!(probability_to_intensity(f32::NAN), 0);
    }

    #[test]
    fn binarize_is_strict_at_threshold() {
        let probabilities = array![0.5f32, 0.5 + 1e-6, 0.49, 1.0, 0.0];
        let mask = binarize(&probabilities, DEFAULT_THRESHOLD);
        assert_eq!(mask, array![0.0, 1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn binarize_custom_threshold_keeps_shape() {
        let probabilities = Array4::<f32>::from_elem((1, 4, 4, 1), 0.3);
        let mask = binarize(&probabilities, 0.2);
        assert_eq!(mask.shape(), &[1, 4, 4, 1]);
        assert!(mask.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn mask_image_accepts_batched_and_squeezed_shapes() -> Result<()> {
        let batched = Array4::<f32>::from_elem((1, 3, 5, 1), 1.0);
        let image = to_mask_image(batched.view().into_dyn())?;
        assert_eq!(image.dimensions(), (5, 3));
        assert!(image.pixels().all(|p| p[0] == 255));

        let plane = Array2::<f32>::from_shape_fn((2, 2), |(y, x)| (y * 2 + x) as f32 / 3.0);
        let image = to_mask_image(plane.view().into_dyn())?;
        assert_eq!(image.get_pixel(1, 1)[0], 255);
        assert_eq!(image.get_pixel(0, 0)[0], 0);
        Ok(())
    }

    #[test]
    fn mask_image_rejects_multi_channel() {
        let probabilities = Array3::<f32>::zeros((4, 4, 2));
        assert!(to_mask_image(probabilities.view().into_dyn()).is_err());
    }
}

use crate::errors::Result;
use image::DynamicImage;
use ndarray::prelude::*;

/// Abstraction over the segmentation model so the directory processor can be
/// exercised without trained weights.
pub trait ImageSegmentationModel: Send + Sync {
    /// Foreground probability map of one image, `(size, size)`.
    fn segment_image(&self, img: &DynamicImage) -> Result<Array2<f32>>;

    /// Side length of the square network input.
    fn get_image_size(&self) -> u32;

    /// Low-level prediction on an NHWC `(n, size, size, 1)` tensor.
    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>>;
}

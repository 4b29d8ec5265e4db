use crate::errors::Result;
use crate::preprocess::Preprocessor;
use crate::traits::ImageSegmentationModel;
use image::DynamicImage;
use ndarray::prelude::*;

/// Mock segmentation model for tests: the predicted probability of a pixel
/// is its preprocessed intensity.
#[derive(Debug, Clone)]
pub struct MockSegmentationModel {
    pub image_size: u32,
}

impl MockSegmentationModel {
    pub const fn new(image_size: u32) -> Self {
        Self { image_size }
    }
}

impl ImageSegmentationModel for MockSegmentationModel {
    fn segment_image(&self, img: &DynamicImage) -> Result<Array2<f32>> {
        let tensor = Preprocessor::new(self.image_size).preprocess(img)?;
        let output = self.predict(tensor.view())?;
        Ok(output.index_axis_move(Axis(3), 0).index_axis_move(Axis(0), 0))
    }

    fn get_image_size(&self) -> u32 {
        self.image_size
    }

    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        Ok(tensor.to_owned())
    }
}

pub const fn create_mock_model() -> MockSegmentationModel {
    MockSegmentationModel::new(256)
}

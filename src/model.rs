use std::path::Path;

use burn::{
    backend::NdArray,
    tensor::{backend::Backend, Tensor, TensorData},
};
use image::DynamicImage;
use ndarray::prelude::*;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    artifact::{Checkpoint, ModelArtifact},
    errors::{ProcareSegError, Result},
    network::Unet,
    preprocess::Preprocessor,
    traits::ImageSegmentationModel,
};

pub type InferenceBackend = NdArray<f32>;

/// Trained network loaded once and shared read-only by every prediction.
///
/// The lock only guards taking a handle to the parameters; the forward pass
/// itself runs unlocked.
pub struct SegmentationModel<B: Backend = InferenceBackend> {
    network: Mutex<Unet<B>>,
    preprocessor: Preprocessor,
    device: B::Device,
}

impl<B: Backend> SegmentationModel<B> {
    pub fn new(network: Unet<B>, image_size: u32, device: B::Device) -> Self {
        Self {
            network: Mutex::new(network),
            preprocessor: Preprocessor::new(image_size),
            device,
        }
    }

    /// Loads `checkpoint` from an artifact directory written by the trainer.
    pub fn load(artifact_dir: &Path, checkpoint: Checkpoint, device: B::Device) -> Result<Self> {
        let artifact = ModelArtifact::new(artifact_dir);
        let (network, config) = artifact.load_model::<B>(checkpoint, &device)?;
        info!(
            artifact = %artifact_dir.display(),
            %checkpoint,
            image_size = config.model.image_size,
            "model loaded"
        );
        Ok(Self::new(network, config.model.image_size as u32, device))
    }

    pub fn image_size(&self) -> u32 {
        self.preprocessor.image_size
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// NHWC `(n, size, size, 1)` in, probabilities of the same shape out.
    pub fn predict_tensor(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch, height, width, channels) = tensor.dim();
        let size = self.image_size() as usize;
        if channels != 1 || height != size || width != size || batch == 0 {
            return Err(ProcareSegError::validation(
                "input tensor",
                format!("expected (n, {size}, {size}, 1), got {:?}", tensor.shape()),
            ));
        }

        // with a single channel NHWC and NCHW share one memory order
        let values: Vec<f32> = tensor.iter().copied().collect();
        let input = Tensor::<B, 4>::from_data(
            TensorData::new(values, [batch, 1, height, width]).convert::<B::FloatElem>(),
            &self.device,
        );

        let network = self.network.lock().clone();
        debug!(batch, "running forward pass");
        let output = network.forward(input).into_data().to_vec::<f32>()?;
        Ok(Array4::from_shape_vec((batch, height, width, 1), output)?)
    }

    /// Prediction for a single-image batch with batch and channel axes removed.
    pub fn predict_mask(&self, tensor: ArrayView4<f32>) -> Result<Array2<f32>> {
        if tensor.dim().0 != 1 {
            return Err(ProcareSegError::validation(
                "input tensor",
                format!("expected a batch of one, got {}", tensor.dim().0),
            ));
        }
        let output = self.predict_tensor(tensor)?;
        Ok(output.index_axis_move(Axis(3), 0).index_axis_move(Axis(0), 0))
    }

    /// Preprocesses a decoded image and predicts its probability map.
    pub fn predict_image(&self, image: &DynamicImage) -> Result<Array2<f32>> {
        let tensor = self.preprocessor.preprocess(image)?;
        self.predict_mask(tensor.view())
    }
}

impl<B: Backend> ImageSegmentationModel for SegmentationModel<B> {
    fn segment_image(&self, img: &DynamicImage) -> Result<Array2<f32>> {
        self.predict_image(img)
    }

    fn get_image_size(&self) -> u32 {
        self.image_size()
    }

    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        self.predict_tensor(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::UnetConfig;
    use image::{Rgb, RgbImage};
    use std::sync::Arc;

    fn tiny_model() -> Result<SegmentationModel> {
        let device = Default::default();
        let network = UnetConfig::new()
            .with_base_channels(2)
            .with_image_size(32)
            .try_init(&device)?;
        Ok(SegmentationModel::new(network, 32, device))
    }

    #[test]
    fn predict_image_returns_squeezed_probabilities() -> Result<()> {
        let model = tiny_model()?;
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(50, 70, Rgb([10, 200, 30])));
        let mask = model.predict_image(&image)?;
        assert_eq!(mask.dim(), (32, 32));
        assert!(mask.iter().all(|p| (0.0..=1.0).contains(p)));
        Ok(())
    }

    #[test]
    fn wrong_resolution_is_rejected() -> Result<()> {
        let model = tiny_model()?;
        let tensor = Array4::<f32>::zeros((1, 16, 16, 1));
        assert!(matches!(
            model.predict_tensor(tensor.view()),
            Err(ProcareSegError::Validation { .. })
        ));
        Ok(())
    }

    #[test]
    fn predict_mask_requires_single_batch() -> Result<()> {
        let model = tiny_model()?;
        let tensor = Array4::<f32>::zeros((2, 32, 32, 1));
        assert!(model.predict_mask(tensor.view()).is_err());
        assert_eq!(model.predict_tensor(tensor.view())?.shape(), &[2, 32, 32, 1]);
        Ok(())
    }

    #[test]
    fn shared_model_gives_identical_results_across_threads() -> Result<()> {
        let model = Arc::new(tiny_model()?);
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([90, 90, 90])));
        let expected = model.predict_image(&image)?;

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let model = Arc::clone(&model);
                let image = image.clone();
                std::thread::spawn(move || model.predict_image(&image))
            })
            .collect();
        for handle in handles {
            let mask = handle.join().expect("worker panicked")?;
            assert_eq!(mask, expected);
        }
        Ok(())
    }
}

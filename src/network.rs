//! U-Net for single-class segmentation.
//!
//! Three encoder stages, a bottleneck and three decoder stages joined by skip
//! connections, followed by a 1×1 sigmoid head. Tensors are NCHW.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Initializer, PaddingConfig2d,
    },
    tensor::{
        activation::{relu, sigmoid},
        backend::Backend,
        Tensor,
    },
};

use crate::errors::{ProcareSegError, Result};

/// Number of pooling stages between the input and the bottleneck.
pub const STAGES: usize = 3;

#[derive(Config, Debug)]
pub struct UnetConfig {
    #[config(default = 1)]
    pub in_channels: usize,
    /// Width of the first encoder stage; doubled at every stage.
    #[config(default = 64)]
    pub base_channels: usize,
    #[config(default = 256)]
    pub image_size: usize,
}

impl UnetConfig {
    /// Channel width of encoder stage `i`, the bottleneck being stage `STAGES`.
    pub fn stage_channels(&self, stage: usize) -> usize {
        self.base_channels << stage
    }

    /// Spatial side of the encoder activation kept for skip connection `stage`.
    pub fn stage_resolution(&self, stage: usize) -> usize {
        self.image_size >> stage
    }

    /// Checks that every decoder stage lands on the resolution of the encoder
    /// activation it is concatenated with.
    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 {
            return Err(ProcareSegError::validation("in_channels", "must be positive"));
        }
        if self.base_channels == 0 {
            return Err(ProcareSegError::validation("base_channels", "must be positive"));
        }
        let factor: usize = 1 << STAGES;
        if self.image_size == 0 || self.image_size % factor != 0 {
            return Err(ProcareSegError::validation(
                "image_size",
                format!("must be a positive multiple of {factor}, got {}", self.image_size),
            ));
        }

        let mut upsampled = self.stage_resolution(STAGES);
        for stage in (0..STAGES).rev() {
            upsampled *= 2;
            let skip = self.stage_resolution(stage);
            if upsampled != skip {
                return Err(ProcareSegError::validation(
                    "skip connection",
                    format!("stage {stage}: upsampled {upsampled} does not match encoder {skip}"),
                ));
            }
        }
        Ok(())
    }

    /// Validates the topology, then builds the network.
    pub fn try_init<B: Backend>(&self, device: &B::Device) -> Result<Unet<B>> {
        self.validate()?;
        Ok(self.init(device))
    }

    /// Builds the network without validation.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Unet<B> {
        let c = |stage| self.stage_channels(stage);

        Unet {
            enc1: DoubleConv::new(self.in_channels, c(0), device),
            enc2: DoubleConv::new(c(0), c(1), device),
            enc3: DoubleConv::new(c(1), c(2), device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            bottleneck: DoubleConv::new(c(2), c(3), device),
            dec3: DecoderStage::new(c(3), c(2), device),
            dec2: DecoderStage::new(c(2), c(1), device),
            dec1: DecoderStage::new(c(1), c(0), device),
            head: Conv2dConfig::new([c(0), 1], [1, 1])
                .with_initializer(glorot())
                .init(device),
        }
    }
}

fn glorot() -> Initializer {
    Initializer::XavierUniform { gain: 1.0 }
}

/// Glorot-uniform bound for a transposed convolution, computed by hand since
/// burn only passes `fan_in` to its initializer.
fn glorot_transposed(in_channels: usize, out_channels: usize, kernel: [usize; 2]) -> Initializer {
    let receptive = (kernel[0] * kernel[1]) as f64;
    let bound = (6.0 / ((in_channels + out_channels) as f64 * receptive)).sqrt();
    Initializer::Uniform {
        min: -bound,
        max: bound,
    }
}

/// Two 3×3 same-padded convolutions, each followed by ReLU.
#[derive(Module, Debug)]
pub struct DoubleConv<B: Backend> {
    first: Conv2d<B>,
    second: Conv2d<B>,
}

impl<B: Backend> DoubleConv<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = |channels: [usize; 2]| {
            Conv2dConfig::new(channels, [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .with_initializer(glorot())
                .init(device)
        };
        Self {
            first: conv([in_channels, out_channels]),
            second: conv([out_channels, out_channels]),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.first.forward(x));
        relu(self.second.forward(x))
    }
}

/// 2× transposed-convolution upsampling, skip concatenation, double conv.
#[derive(Module, Debug)]
pub struct DecoderStage<B: Backend> {
    up: ConvTranspose2d<B>,
    convs: DoubleConv<B>,
}

impl<B: Backend> DecoderStage<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            up: ConvTranspose2dConfig::new([in_channels, out_channels], [2, 2])
                .with_stride([2, 2])
                .with_initializer(glorot_transposed(in_channels, out_channels, [2, 2]))
                .init(device),
            // upsampled half + skip half
            convs: DoubleConv::new(out_channels * 2, out_channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let up = self.up.forward(x);
        self.convs.forward(Tensor::cat(vec![up, skip], 1))
    }
}

#[derive(Module, Debug)]
pub struct Unet<B: Backend> {
    enc1: DoubleConv<B>,
    enc2: DoubleConv<B>,
    enc3: DoubleConv<B>,
    pool: MaxPool2d,
    bottleneck: DoubleConv<B>,
    dec3: DecoderStage<B>,
    dec2: DecoderStage<B>,
    dec1: DecoderStage<B>,
    head: Conv2d<B>,
}

impl<B: Backend> Unet<B> {
    /// `[batch, 1, h, w]` in, per-pixel foreground probability out.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let s1 = self.enc1.forward(input);
        let s2 = self.enc2.forward(self.pool.forward(s1.clone()));
        let s3 = self.enc3.forward(self.pool.forward(s2.clone()));
        let x = self.bottleneck.forward(self.pool.forward(s3.clone()));

        let x = self.dec3.forward(x, s3);
        let x = self.dec2.forward(x, s2);
        let x = self.dec1.forward(x, s1);
        sigmoid(self.head.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn full_width_network_matches_reference_parameter_count() -> Result<()> {
        let device = Default::default();
        let model: Unet<TestBackend> = UnetConfig::new().try_init(&device)?;
        assert_eq!(model.num_params(), 7_696_193);
        Ok(())
    }

    #[test]
    fn output_keeps_input_resolution_and_unit_range() -> Result<()> {
        let device = Default::default();
        let config = UnetConfig::new().with_base_channels(2);
        let model: Unet<TestBackend> = config.try_init(&device)?;

        let input = Tensor::<TestBackend, 4>::random(
            [1, 1, 256, 256],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let output = model.forward(input);
        assert_eq!(output.dims(), [1, 1, 256, 256]);

        let values = output.into_data().to_vec::<f32>()?;
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        Ok(())
    }

    #[test]
    fn batched_forward_keeps_batch_axis() -> Result<()> {
        let device = Default::default();
        let model: Unet<TestBackend> = UnetConfig::new()
            .with_base_channels(2)
            .with_image_size(16)
            .try_init(&device)?;
        let output = model.forward(Tensor::zeros([3, 1, 16, 16], &device));
        assert_eq!(output.dims(), [3, 1, 16, 16]);
        Ok(())
    }

    #[test]
    fn resolution_not_divisible_by_pooling_is_rejected() {
        let config = UnetConfig::new().with_image_size(100);
        assert!(matches!(
            config.validate(),
            Err(ProcareSegError::Validation { .. })
        ));
    }

    #[test]
    fn transposed_initializer_uses_both_fans() {
        // 2x2 kernel, 128 -> 64 channels
        let Initializer::Uniform { min, max } = glorot_transposed(128, 64, [2, 2]) else {
            panic!("expected a uniform initializer");
        };
        let expected = (6.0f64 / (192.0 * 4.0)).sqrt();
        assert!((max - expected).abs() < 1e-12);
        assert_eq!(min, -max);
    }

    #[test]
    fn construction_returns_instead_of_panicking() {
        let device = Default::default();
        let result = std::panic::catch_unwind(|| {
            UnetConfig::new()
                .with_base_channels(4)
                .with_image_size(16)
                .try_init::<TestBackend>(&device)
                .map(|model| model.num_params())
        });
        assert!(matches!(result, Ok(Ok(count)) if count > 0));
    }

    #[test]
    fn stage_widths_double() {
        let config = UnetConfig::new();
        let widths: Vec<_> = (0..=STAGES).map(|s| config.stage_channels(s)).collect();
        assert_eq!(widths, vec![64, 128, 256, 512]);
        assert_eq!(config.stage_resolution(STAGES), 32);
    }
}

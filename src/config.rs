use clap::{Args, Parser, Subcommand};
use image::ImageFormat;
use std::path::PathBuf;

use crate::artifact::Checkpoint;
use crate::dataset::DatasetLayout;
use crate::network::UnetConfig;
use crate::training::TrainingConfig;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Train the U-Net on paired `{id}.jpg` images and masks.
    Train(TrainArgs),
    /// Predict probability masks for every image in a directory.
    Predict(PredictArgs),
    /// Average SSIM between reference and predicted mask directories.
    Evaluate(EvaluateArgs),
}

#[derive(Args, Clone, Debug)]
pub struct TrainArgs {
    #[arg(long)]
    pub images_dir: PathBuf,

    #[arg(long)]
    pub masks_dir: PathBuf,

    /// Receives config.json, best.mpk and final.mpk.
    #[arg(long, default_value = "artifacts")]
    pub artifact_dir: PathBuf,

    #[arg(long, default_value_t = 20)]
    pub epochs: usize,

    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1e-3)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = 5)]
    pub patience: usize,

    #[arg(long, default_value_t = 0.2)]
    pub validation_split: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Ignore identifiers above this value.
    #[arg(long)]
    pub max_index: Option<u32>,

    #[arg(long, default_value = "jpg")]
    pub extension: String,

    #[arg(long, default_value_t = 256)]
    pub image_size: usize,

    #[arg(long, default_value_t = 64)]
    pub base_channels: usize,
}

impl TrainArgs {
    pub fn layout(&self) -> DatasetLayout {
        DatasetLayout::new(&self.images_dir, &self.masks_dir)
            .with_extension(&self.extension)
            .with_max_index(self.max_index)
    }

    pub fn training_config(&self) -> TrainingConfig {
        let model = UnetConfig::new()
            .with_image_size(self.image_size)
            .with_base_channels(self.base_channels);
        TrainingConfig::new(model)
            .with_num_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_learning_rate(self.learning_rate)
            .with_patience(self.patience)
            .with_validation_split(self.validation_split)
            .with_seed(self.seed)
    }
}

#[derive(Args, Clone, Debug)]
pub struct PredictArgs {
    pub input_dir: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    /// Artifact directory written by `train`.
    #[arg(short, long, env = "PROCARE_MODEL_PATH")]
    pub model_path: PathBuf,

    #[arg(short, long, value_enum, default_value_t = Checkpoint::Best)]
    pub checkpoint: Checkpoint,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    /// Binarize at this threshold before export instead of saving raw probabilities.
    #[arg(short, long)]
    pub threshold: Option<f32>,
}

#[derive(Args, Clone, Debug)]
pub struct EvaluateArgs {
    pub reference_dir: PathBuf,

    pub candidate_dir: PathBuf,
}

fn check_format(s: &str) -> Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}

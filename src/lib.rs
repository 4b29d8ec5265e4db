pub mod artifact;
pub mod config;
pub mod dataset;
pub mod errors;
pub mod evaluator;
pub mod imageops;
pub mod model;
pub mod network;
pub mod postprocess;
pub mod preprocess;
pub mod ssim;
pub mod training;
pub mod traits;

pub mod mocks;

use image::ImageFormat;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub use artifact::{Checkpoint, ModelArtifact};
pub use config::{Config, PredictArgs};
pub use dataset::{Dataset, DatasetLayout, Sample};
pub use errors::{ProcareSegError, Result};
pub use evaluator::{calculate_average_ssim, AccuracyEvaluator, SsimSummary};
pub use model::SegmentationModel;
pub use network::{Unet, UnetConfig};
pub use preprocess::Preprocessor;
pub use training::{Trainer, TrainingConfig};
pub use traits::*;

#[cfg(test)]
pub use mocks::*;

/// Writes one mask image per input image, mirroring the input tree.
pub struct MaskProcessor<M: ImageSegmentationModel> {
    model: M,
    config: PredictArgs,
}

impl<M: ImageSegmentationModel> MaskProcessor<M> {
    pub const fn new(model: M, config: PredictArgs) -> Self {
        Self { model, config }
    }

    /// Returns the number of masks written.
    pub fn process_directory(&self) -> Result<usize> {
        let input_path = &self.config.input_dir;
        let output_path = &self.config.output_dir;

        if !input_path.exists() {
            return Err(ProcareSegError::FileSystem {
                path: input_path.clone(),
                operation: "input directory check".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "input directory does not exist",
                ),
            });
        }

        fs::create_dir_all(output_path).map_err(|e| ProcareSegError::FileSystem {
            path: output_path.clone(),
            operation: "output directory creation".to_string(),
            source: e,
        })?;

        let image_files = self.collect_image_files(input_path);

        if image_files.is_empty() {
            warn!(input = %input_path.display(), "no images to process");
            return Ok(0);
        }
        self.check_output_collisions(&image_files, output_path)?;

        let pb = ProgressBar::new(image_files.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }

        image_files
            .par_iter()
            .try_for_each(|input_file| -> Result<()> {
                self.process_single_image(input_file, output_path)?;
                pb.inc(1);
                Ok(())
            })?;

        pb.finish_and_clear();
        info!(count = image_files.len(), "all masks written");
        Ok(image_files.len())
    }

    fn collect_image_files(&self, input_path: &Path) -> Vec<PathBuf> {
        let mut image_files: Vec<PathBuf> = WalkDir::new(input_path)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|path| path.is_file() && self.is_supported_image_format(path))
            .collect();
        image_files.sort();
        image_files
    }

    /// Rejects inputs such as `1.jpg` and `1.png` that would write the same mask.
    fn check_output_collisions(&self, image_files: &[PathBuf], output_dir: &Path) -> Result<()> {
        let mut seen: HashMap<PathBuf, &Path> = HashMap::with_capacity(image_files.len());
        for input_file in image_files {
            let output_file = self.output_path(input_file, output_dir)?;
            if let Some(previous) = seen.insert(output_file.clone(), input_file) {
                return Err(ProcareSegError::validation(
                    "input_dir",
                    format!(
                        "{} and {} both map to {}",
                        previous.display(),
                        input_file.display(),
                        output_file.display()
                    ),
                ));
            }
        }
        Ok(())
    }

    fn output_path(&self, input_file: &Path, output_dir: &Path) -> Result<PathBuf> {
        let relative_path = self.get_relative_path(input_file)?;
        Ok(output_dir
            .join(relative_path)
            .with_extension(&self.config.format))
    }

    /// Uploads are restricted to JPEG; PNG is accepted for locally produced slices.
    pub fn is_supported_image_format(&self, path: &Path) -> bool {
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            matches!(extension.to_lowercase().as_str(), "jpg" | "jpeg" | "png")
        } else {
            false
        }
    }

    pub fn process_single_image(&self, input_file: &Path, output_dir: &Path) -> Result<PathBuf> {
        let img = image::open(input_file)
            .map_err(|e| ProcareSegError::decode(input_file.display().to_string(), e))?;

        let probabilities =
            self.model
                .segment_image(&img)
                .map_err(|e| ProcareSegError::ImageProcessing {
                    path: input_file.display().to_string(),
                    operation: "segmentation".to_string(),
                    source: Box::new(e),
                })?;
        let probabilities = match self.config.threshold {
            Some(threshold) => postprocess::binarize(&probabilities, threshold),
            None => probabilities,
        };
        let mask = postprocess::to_mask_image(probabilities.view().into_dyn())?;

        let output_file = self.output_path(input_file, output_dir)?;

        if let Some(parent) = output_file.parent() {
            fs::create_dir_all(parent).map_err(|e| ProcareSegError::FileSystem {
                path: parent.to_path_buf(),
                operation: "output directory creation".to_string(),
                source: e,
            })?;
        }

        let output_format =
            ImageFormat::from_extension(&self.config.format).unwrap_or(ImageFormat::Png);
        postprocess::save_mask(&mask, &output_file, output_format)?;
        Ok(output_file)
    }

    pub fn get_relative_path(&self, input_file: &Path) -> Result<PathBuf> {
        let input_dir = &self.config.input_dir;
        input_file
            .strip_prefix(input_dir)
            .map(|p| p.to_path_buf())
            .map_err(|_| ProcareSegError::FileSystem {
                path: input_file.to_path_buf(),
                operation: "relative path".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "input file is outside the input directory",
                ),
            })
    }
}

impl MaskProcessor<SegmentationModel> {
    /// Loads the trained network once for the whole run.
    pub fn with_trained_model(config: PredictArgs) -> Result<Self> {
        let model =
            SegmentationModel::load(&config.model_path, config.checkpoint, Default::default())?;
        Ok(Self::new(model, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    fn args(input_dir: PathBuf, output_dir: PathBuf) -> PredictArgs {
        PredictArgs {
            input_dir,
            output_dir,
            model_path: "artifacts".into(),
            checkpoint: Checkpoint::Best,
            format: "png".to_string(),
            threshold: None,
        }
    }

    #[test]
    fn test_supported_formats() {
        let processor = MaskProcessor::new(
            MockSegmentationModel::new(8),
            args("in".into(), "out".into()),
        );
        let test_cases = vec![
            ("scan.jpg", true),
            ("scan.JPEG", true),
            ("scan.png", true),
            ("scan.webp", false),
            ("scan.txt", false),
            ("scan", false),
        ];

        for (filename, expected) in test_cases {
            assert_eq!(
                processor.is_supported_image_format(Path::new(filename)),
                expected,
                "{filename}"
            );
        }
    }

    #[test]
    fn test_relative_path_calculation() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let input_dir = temp_dir.path().join("input");
        let subdir = input_dir.join("subdir");
        fs::create_dir_all(&subdir)?;

        let processor = MaskProcessor::new(
            MockSegmentationModel::new(256),
            args(input_dir, "output".into()),
        );

        let test_file = subdir.join("test.jpg");
        let relative = processor.get_relative_path(&test_file)?;

        assert_eq!(relative, Path::new("subdir/test.jpg"));
        Ok(())
    }

    #[test]
    fn colliding_outputs_are_rejected_before_writing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let input_dir = temp_dir.path().join("input");
        let output_dir = temp_dir.path().join("output");
        fs::create_dir_all(&input_dir)?;
        let scan = GrayImage::from_pixel(16, 16, Luma([90]));
        scan.save(input_dir.join("1.jpg"))?;
        scan.save(input_dir.join("1.png"))?;
        scan.save(input_dir.join("2.png"))?;

        let processor = MaskProcessor::new(
            MockSegmentationModel::new(16),
            args(input_dir, output_dir.clone()),
        );
        assert!(matches!(
            processor.process_directory(),
            Err(ProcareSegError::Validation { .. })
        ));
        assert!(!output_dir.join("2.png").exists());
        Ok(())
    }

    #[test]
    fn threshold_turns_probabilities_into_black_and_white() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let input_dir = temp_dir.path().join("input");
        fs::create_dir_all(&input_dir)?;
        let scan = input_dir.join("1.png");
        GrayImage::from_fn(16, 16, |x, _| Luma([if x < 8 { 50 } else { 200 }])).save(&scan)?;

        let mut config = args(input_dir, temp_dir.path().join("output"));
        config.threshold = Some(0.5);
        let processor = MaskProcessor::new(MockSegmentationModel::new(16), config);
        let written = processor.process_single_image(&scan, &processor.config.output_dir)?;

        let mask = image::open(written)?.into_luma8();
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
        assert_eq!(mask.get_pixel(15, 0)[0], 255);
        Ok(())
    }
}

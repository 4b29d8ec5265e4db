use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use ndarray::Array2;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::errors::{ProcareSegError, Result};
use crate::preprocess::Preprocessor;

/// Two parallel directories holding `{id}.{extension}` images and masks.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    pub images_dir: PathBuf,
    pub masks_dir: PathBuf,
    pub extension: String,
    /// Highest identifier considered; the reference corpus stops at 600.
    pub max_index: Option<u32>,
}

/// Paths of one identifier that exists on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePaths {
    pub id: u32,
    pub image: PathBuf,
    pub mask: PathBuf,
}

impl DatasetLayout {
    pub fn new(images_dir: impl Into<PathBuf>, masks_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
            masks_dir: masks_dir.into(),
            extension: "jpg".to_string(),
            max_index: None,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_max_index(mut self, max_index: Option<u32>) -> Self {
        self.max_index = max_index;
        self
    }

    fn file_name(&self, id: u32) -> String {
        format!("{id}.{}", self.extension)
    }

    /// Numeric identifiers found in the images directory, ascending.
    pub fn identifiers(&self) -> Result<Vec<u32>> {
        if !self.images_dir.is_dir() {
            return Err(ProcareSegError::FileSystem {
                path: self.images_dir.clone(),
                operation: "dataset scan".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "images directory does not exist",
                ),
            });
        }

        let mut ids: Vec<u32> = WalkDir::new(&self.images_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| self.identifier_of(e.path()))
            .filter(|id| self.max_index.map_or(true, |max| *id <= max))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn identifier_of(&self, path: &Path) -> Option<u32> {
        let extension = path.extension()?.to_str()?;
        if extension != self.extension {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let id: u32 = stem.parse().ok()?;
        // `001` or `+1` would parse but never match `{id}.{ext}` lookups
        (stem == id.to_string()).then_some(id)
    }

    /// Identifiers whose image and mask both exist. The others are skipped
    /// without being reported.
    pub fn pairs(&self) -> Result<Vec<SamplePaths>> {
        let pairs: Vec<_> = self
            .identifiers()?
            .into_iter()
            .filter_map(|id| {
                let name = self.file_name(id);
                let image = self.images_dir.join(&name);
                let mask = self.masks_dir.join(&name);
                if image.is_file() && mask.is_file() {
                    Some(SamplePaths { id, image, mask })
                } else {
                    debug!(id, "skipping identifier without a mask");
                    None
                }
            })
            .collect();
        Ok(pairs)
    }

    /// Decodes every pair at `image_size`×`image_size`.
    pub fn load(&self, image_size: u32) -> Result<Dataset> {
        let pairs = self.pairs()?;
        info!(
            pairs = pairs.len(),
            images_dir = %self.images_dir.display(),
            "loading dataset"
        );
        let samples = pairs
            .par_iter()
            .map(|paths| Sample::load(paths, image_size))
            .collect::<Result<Vec<_>>>()?;
        Ok(Dataset { samples })
    }
}

/// One grayscale image with its binary mask, both `(size, size)`.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: u32,
    pub image: Array2<f32>,
    pub mask: Array2<f32>,
}

impl Sample {
    /// Nearest-neighbour resize for both sides; mask values rounded to {0, 1}.
    pub fn load(paths: &SamplePaths, image_size: u32) -> Result<Self> {
        let preprocessor = Preprocessor::new(image_size).with_filter(FilterType::Nearest);
        let open = |path: &Path| {
            image::open(path).map_err(|e| ProcareSegError::decode(path.display().to_string(), e))
        };

        let image = preprocessor.plane(&open(&paths.image)?)?;
        let mask = preprocessor.plane(&open(&paths.mask)?)?.mapv(f32::round);
        Ok(Self {
            id: paths.id,
            image,
            mask,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    samples: Vec<Sample>,
}

impl Dataset {
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn ids(&self) -> Vec<u32> {
        self.samples.iter().map(|s| s.id).collect()
    }

    /// Seeded shuffle split into `(train, validation)`. The validation side
    /// gets `ceil(len * validation_fraction)` samples.
    pub fn split(self, validation_fraction: f64, seed: u64) -> Result<(Dataset, Dataset)> {
        if !(validation_fraction > 0.0 && validation_fraction < 1.0) {
            return Err(ProcareSegError::validation(
                "validation_fraction",
                format!("must be in (0, 1), got {validation_fraction}"),
            ));
        }

        let total = self.samples.len();
        let n_validation = (total as f64 * validation_fraction).ceil() as usize;
        if n_validation == 0 || n_validation >= total {
            return Err(ProcareSegError::validation(
                "dataset",
                format!("{total} samples cannot be split with fraction {validation_fraction}"),
            ));
        }

        let mut order: Vec<usize> = (0..total).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));

        let mut slots: Vec<Option<Sample>> = self.samples.into_iter().map(Some).collect();
        let mut take = |indices: &[usize]| -> Vec<Sample> {
            indices.iter().filter_map(|&i| slots[i].take()).collect()
        };
        let validation = take(&order[..n_validation]);
        let train = take(&order[n_validation..]);

        Ok((Dataset { samples: train }, Dataset { samples: validation }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    fn write_gray(path: &Path, value: u8) {
        GrayImage::from_pixel(12, 12, Luma([value]))
            .save(path)
            .unwrap();
    }

    fn corpus(ids: &[u32], mask_ids: &[u32]) -> (TempDir, DatasetLayout) {
        let temp = TempDir::new().unwrap();
        let images = temp.path().join("images");
        let masks = temp.path().join("masks");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&masks).unwrap();
        for id in ids {
            write_gray(&images.join(format!("{id}.png")), 120);
        }
        for id in mask_ids {
            write_gray(&masks.join(format!("{id}.png")), 250);
        }
        let layout = DatasetLayout::new(images, masks).with_extension("png");
        (temp, layout)
    }

    #[test]
    fn missing_mask_is_skipped() -> Result<()> {
        let (_temp, layout) = corpus(&[1, 2, 3, 4, 5], &[1, 2, 4, 5]);
        let ids: Vec<u32> = layout.pairs()?.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 4, 5]);

        let dataset = layout.load(8)?;
        assert_eq!(dataset.ids(), vec![1, 2, 4, 5]);
        Ok(())
    }

    #[test]
    fn identifiers_are_numeric_sorted_and_capped() -> Result<()> {
        let (temp, layout) = corpus(&[10, 2, 1, 600, 601], &[]);
        std::fs::write(temp.path().join("images").join("notes.png"), b"x").unwrap();
        std::fs::write(temp.path().join("images").join("3.txt"), b"x").unwrap();

        assert_eq!(layout.identifiers()?, vec![1, 2, 10, 600, 601]);
        let capped = layout.with_max_index(Some(600));
        assert_eq!(capped.identifiers()?, vec![1, 2, 10, 600]);
        Ok(())
    }

    #[test]
    fn non_canonical_numeric_stems_are_ignored() -> Result<()> {
        let (temp, layout) = corpus(&[4], &[4]);
        for name in ["001.png", "+2.png", "03.png"] {
            write_gray(&temp.path().join("images").join(name), 120);
            write_gray(&temp.path().join("masks").join(name), 250);
        }

        assert_eq!(layout.identifiers()?, vec![4]);
        let pairs = layout.pairs()?;
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].image.is_file() && pairs[0].mask.is_file());
        Ok(())
    }

    #[test]
    fn samples_are_scaled_and_masks_binarized() -> Result<()> {
        let (_temp, layout) = corpus(&[1], &[1]);
        let dataset = layout.load(8)?;
        let sample = &dataset.samples()[0];
        assert_eq!(sample.image.dim(), (8, 8));
        assert!(sample.image.iter().all(|v| (*v - 120.0 / 255.0).abs() < 1e-6));
        assert!(sample.mask.iter().all(|v| *v == 1.0));
        Ok(())
    }

    #[test]
    fn missing_images_dir_is_an_error() {
        let layout = DatasetLayout::new("/nonexistent/images", "/nonexistent/masks");
        assert!(matches!(
            layout.identifiers(),
            Err(ProcareSegError::FileSystem { .. })
        ));
    }

    fn synthetic(n: u32) -> Dataset {
        Dataset::from_samples(
            (1..=n)
                .map(|id| Sample {
                    id,
                    image: Array2::zeros((2, 2)),
                    mask: Array2::zeros((2, 2)),
                })
                .collect(),
        )
    }

    #[test]
    fn split_is_eighty_twenty_and_deterministic() -> Result<()> {
        let (train, validation) = synthetic(11).split(0.2, 42)?;
        assert_eq!(validation.len(), 3);
        assert_eq!(train.len(), 8);

        let (train_again, validation_again) = synthetic(11).split(0.2, 42)?;
        assert_eq!(train.ids(), train_again.ids());
        assert_eq!(validation.ids(), validation_again.ids());

        let mut all = train.ids();
        all.extend(validation.ids());
        all.sort_unstable();
        assert_eq!(all, (1..=11).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn split_rejects_degenerate_inputs() {
        assert!(synthetic(1).split(0.2, 42).is_err());
        assert!(synthetic(10).split(1.0, 42).is_err());
    }
}

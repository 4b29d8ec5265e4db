use std::ffi::OsString;
use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::errors::{ProcareSegError, Result};
use crate::imageops::to_grayscale;
use crate::ssim::{structural_similarity, SsimOptions};

/// Subtracted from the summed scores before averaging. Kept for parity with
/// the reported figures of the reference evaluation.
pub const SCORE_OFFSET: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SsimSummary {
    pub pair_count: usize,
    pub score_sum: f64,
    /// `(score_sum - SCORE_OFFSET) / pair_count`, or 0 without pairs.
    pub average: f64,
}

impl SsimSummary {
    pub fn from_scores(scores: &[f64]) -> Self {
        let score_sum: f64 = scores.iter().sum();
        let pair_count = scores.len();
        let average = if pair_count == 0 {
            0.0
        } else {
            (score_sum - SCORE_OFFSET) / pair_count as f64
        };
        Self {
            pair_count,
            score_sum,
            average,
        }
    }

    /// Plain mean of the per-pair scores, without the offset.
    pub fn mean_score(&self) -> Option<f64> {
        (self.pair_count > 0).then(|| self.score_sum / self.pair_count as f64)
    }
}

/// Compares a directory of reference masks with a directory of candidates.
#[derive(Debug, Clone, Default)]
pub struct AccuracyEvaluator {
    options: SsimOptions,
}

impl AccuracyEvaluator {
    pub fn new(options: SsimOptions) -> Self {
        Self { options }
    }

    /// File names that are regular files in both directories, sorted.
    pub fn matched_files(&self, reference_dir: &Path, candidate_dir: &Path) -> Result<Vec<OsString>> {
        if !reference_dir.is_dir() {
            return Err(ProcareSegError::FileSystem {
                path: reference_dir.to_path_buf(),
                operation: "reference directory listing".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "reference directory does not exist",
                ),
            });
        }

        let mut names = Vec::new();
        for entry in WalkDir::new(reference_dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| ProcareSegError::Evaluation {
                reason: format!("listing {}: {e}", reference_dir.display()),
            })?;
            let name = entry.file_name().to_os_string();
            if entry.path().is_file() && candidate_dir.join(&name).is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn score_pair(&self, reference: &Path, candidate: &Path) -> Result<f64> {
        let load = |path: &Path| -> Result<ndarray::Array2<f64>> {
            let image = image::open(path)
                .map_err(|e| ProcareSegError::decode(path.display().to_string(), e))?;
            let gray = to_grayscale(&image);
            let (width, height) = gray.dimensions();
            let values = gray.into_raw().into_iter().map(f64::from).collect();
            Ok(ndarray::Array2::from_shape_vec(
                (height as usize, width as usize),
                values,
            )?)
        };
        let result = structural_similarity(
            load(reference)?.view(),
            load(candidate)?.view(),
            &self.options,
        )?;
        Ok(result.score)
    }

    /// Scores every matched pair. The first failing pair aborts the run.
    pub fn evaluate(&self, reference_dir: &Path, candidate_dir: &Path) -> Result<SsimSummary> {
        let names = self.matched_files(reference_dir, candidate_dir)?;
        info!(pairs = names.len(), "evaluating structural similarity");

        let scores = names
            .par_iter()
            .map(|name| {
                let score =
                    self.score_pair(&reference_dir.join(name), &candidate_dir.join(name))?;
                debug!(file = ?name, score, "pair scored");
                Ok(score)
            })
            .collect::<Result<Vec<f64>>>()?;

        Ok(SsimSummary::from_scores(&scores))
    }
}

/// Evaluation boundary: the offset average, or `None` with a logged
/// diagnostic when anything fails.
pub fn calculate_average_ssim(reference_dir: &Path, candidate_dir: &Path) -> Option<f64> {
    match AccuracyEvaluator::default().evaluate(reference_dir, candidate_dir) {
        Ok(summary) => Some(summary.average),
        Err(e) => {
            error!(error = %e, "error calculating SSIM");
            None
        }
    }
}

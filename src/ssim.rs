//! Structural similarity between two grayscale images.
//!
//! Uniform 7×7 window with reflected borders, sample covariance, and the
//! mean taken over the map with the window half-width cropped from each edge.

use image::GrayImage;
use ndarray::prelude::*;

use crate::errors::{ProcareSegError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SsimOptions {
    /// Odd window side.
    pub win_size: usize,
    pub k1: f64,
    pub k2: f64,
    /// Dynamic range of the inputs (255 for 8-bit images).
    pub data_range: f64,
}

impl Default for SsimOptions {
    fn default() -> Self {
        Self {
            win_size: 7,
            k1: 0.01,
            k2: 0.03,
            data_range: 255.0,
        }
    }
}

/// Mean similarity plus the full per-pixel map.
#[derive(Debug, Clone)]
pub struct SsimResult {
    pub score: f64,
    pub map: Array2<f64>,
}

/// Index into `0..len` with half-sample symmetric reflection (`d c b a | a b c d`).
fn reflect(index: isize, len: usize) -> usize {
    let len = len as isize;
    let period = 2 * len;
    let mut i = index.rem_euclid(period);
    if i >= len {
        i = period - i - 1;
    }
    i as usize
}

/// Separable mean filter of side `size`.
fn uniform_filter(input: &Array2<f64>, size: usize) -> Array2<f64> {
    let (height, width) = input.dim();
    let radius = (size / 2) as isize;
    let norm = size as f64;

    let mut rows = Array2::<f64>::zeros((height, width));
    for y in 0..height {
        for x in 0..width {
            let sum: f64 = (-radius..=radius)
                .map(|d| input[[y, reflect(x as isize + d, width)]])
                .sum();
            rows[[y, x]] = sum / norm;
        }
    }

    let mut output = Array2::<f64>::zeros((height, width));
    for y in 0..height {
        for x in 0..width {
            let sum: f64 = (-radius..=radius)
                .map(|d| rows[[reflect(y as isize + d, height), x]])
                .sum();
            output[[y, x]] = sum / norm;
        }
    }
    output
}

pub fn structural_similarity(
    first: ArrayView2<f64>,
    second: ArrayView2<f64>,
    options: &SsimOptions,
) -> Result<SsimResult> {
    if first.dim() != second.dim() {
        return Err(ProcareSegError::Evaluation {
            reason: format!(
                "input images must have the same dimensions, got {:?} and {:?}",
                first.dim(),
                second.dim()
            ),
        });
    }
    let win = options.win_size;
    if win < 3 || win % 2 == 0 {
        return Err(ProcareSegError::validation("win_size", "must be odd and at least 3"));
    }
    let (height, width) = first.dim();
    if height < win || width < win {
        return Err(ProcareSegError::Evaluation {
            reason: format!("images of {height}x{width} are smaller than the {win}x{win} window"),
        });
    }

    let x = first.to_owned();
    let y = second.to_owned();
    let filter = |a: &Array2<f64>| uniform_filter(a, win);

    let np = (win * win) as f64;
    let cov_norm = np / (np - 1.0);

    let ux = filter(&x);
    let uy = filter(&y);
    let uxx = filter(&(&x * &x));
    let uyy = filter(&(&y * &y));
    let uxy = filter(&(&x * &y));

    let vx = (&uxx - &(&ux * &ux)) * cov_norm;
    let vy = (&uyy - &(&uy * &uy)) * cov_norm;
    let vxy = (&uxy - &(&ux * &uy)) * cov_norm;

    let c1 = (options.k1 * options.data_range).powi(2);
    let c2 = (options.k2 * options.data_range).powi(2);

    let a1 = &ux * &uy * 2.0 + c1;
    let a2 = &vxy * 2.0 + c2;
    let b1 = &ux * &ux + &uy * &uy + c1;
    let b2 = &vx + &vy + c2;
    let map = (&a1 * &a2) / (&b1 * &b2);

    let pad = (win - 1) / 2;
    let score = map
        .slice(s![pad..height - pad, pad..width - pad])
        .mean()
        .unwrap_or(0.0);
    Ok(SsimResult { score, map })
}

/// SSIM of two 8-bit grayscale images.
pub fn ssim_gray(first: &GrayImage, second: &GrayImage) -> Result<SsimResult> {
    let as_array = |image: &GrayImage| -> Result<Array2<f64>> {
        let (width, height) = image.dimensions();
        let values = image.as_raw().iter().map(|&v| v as f64).collect();
        Ok(Array2::from_shape_vec((height as usize, width as usize), values)?)
    };
    structural_similarity(
        as_array(first)?.view(),
        as_array(second)?.view(),
        &SsimOptions::default(),
    )
}

//! Pixel combination for master calibrations.
//!
//! A `Combiner` reduces the stack of values at one pixel position to a single
//! value. Masked inputs are left out of the stack; a pixel masked in every
//! input falls back to all of its values and stays masked in the master.

use crate::config::{CombineMethod, StackingConfig};
use crate::error::ReductionError;
use crate::frame::Frame;
use ndarray::Array2;

/// Per-pixel combination policy
pub trait Combiner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Combine the values at one pixel. `values` is never empty.
    fn combine_pixel(&self, values: &mut [f32]) -> f32;
}

/// Combiner configured by `stacking.method`
pub fn combiner_for(config: &StackingConfig) -> Box<dyn Combiner> {
    match config.method {
        CombineMethod::SigmaClip => Box::new(SigmaClip {
            iterations: config.clip_iterations,
            sigma: config.clip_sigma,
        }),
        CombineMethod::Mean => Box::new(Mean),
        CombineMethod::Median => Box::new(Median),
    }
}

/// Combine the pixels of a homogeneous frame set into master data and mask.
pub fn combine_frames(
    frames: &[Frame],
    combiner: &dyn Combiner,
) -> Result<(Array2<f32>, Array2<u8>), ReductionError> {
    let first = frames
        .first()
        .ok_or_else(|| ReductionError::processing("stack", "no frames to combine"))?;
    let (h, w) = first.shape();
    if let Some(odd) = frames.iter().find(|f| f.shape() != (h, w)) {
        return Err(ReductionError::InhomogeneousSet(format!(
            "{} has shape {:?}, expected {:?}",
            odd.frame_id(),
            odd.shape(),
            (h, w)
        )));
    }

    let mut data = Array2::<f32>::zeros((h, w));
    let mut mask = Array2::<u8>::zeros((h, w));
    let mut values = Vec::with_capacity(frames.len());

    for row in 0..h {
        for col in 0..w {
            values.clear();
            values.extend(
                frames
                    .iter()
                    .filter(|f| f.mask[[row, col]] == 0)
                    .map(|f| f.data[[row, col]]),
            );
            if values.is_empty() {
                values.extend(frames.iter().map(|f| f.data[[row, col]]));
                mask[[row, col]] = frames
                    .iter()
                    .fold(0u8, |acc, f| acc | f.mask[[row, col]]);
            }
            data[[row, col]] = combiner.combine_pixel(&mut values);
        }
    }
    Ok((data, mask))
}

/// Plain arithmetic mean
#[derive(Debug, Clone, Copy, Default)]
pub struct Mean;

impl Combiner for Mean {
    fn name(&self) -> &'static str {
        "mean"
    }

    fn combine_pixel(&self, values: &mut [f32]) -> f32 {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

/// Median; even-length stacks average the two middle values
#[derive(Debug, Clone, Copy, Default)]
pub struct Median;

impl Combiner for Median {
    fn name(&self) -> &'static str {
        "median"
    }

    fn combine_pixel(&self, values: &mut [f32]) -> f32 {
        let n = values.len();
        let mid = n / 2;
        let (_, upper, _) = values.select_nth_unstable_by(mid, f32::total_cmp);
        let upper = *upper;
        if n % 2 == 1 {
            return upper;
        }
        let lower = values[..mid]
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        (lower + upper) / 2.0
    }
}

/// Sigma-clipped mean.
///
/// Each iteration rejects values more than `sigma` standard deviations from
/// the mean of the surviving values. If everything is rejected the full mean
/// is used.
#[derive(Debug, Clone, Copy)]
pub struct SigmaClip {
    pub iterations: usize,
    pub sigma: f32,
}

impl Default for SigmaClip {
    fn default() -> Self {
        Self {
            iterations: 2,
            sigma: 2.5,
        }
    }
}

impl Combiner for SigmaClip {
    fn name(&self) -> &'static str {
        "sigma_clip"
    }

    fn combine_pixel(&self, values: &mut [f32]) -> f32 {
        let mut keep = vec![true; values.len()];
        for _ in 0..self.iterations {
            let (mean, stddev) = mean_stddev(values, &keep);
            if stddev < 1e-10 {
                break;
            }
            let lo = mean - self.sigma * stddev;
            let hi = mean + self.sigma * stddev;
            for (k, v) in keep.iter_mut().zip(values.iter()) {
                if *k && (*v < lo || *v > hi) {
                    *k = false;
                }
            }
        }

        let (sum, count) = values
            .iter()
            .zip(keep.iter())
            .filter(|(_, k)| **k)
            .fold((0.0f32, 0u32), |(s, c), (v, _)| (s + v, c + 1));
        if count > 0 {
            sum / count as f32
        } else {
            values.iter().sum::<f32>() / values.len() as f32
        }
    }
}

fn mean_stddev(values: &[f32], keep: &[bool]) -> (f32, f32) {
    let mut sum = 0.0f32;
    let mut count = 0u32;
    for (v, _) in values.iter().zip(keep).filter(|(_, k)| **k) {
        sum += v;
        count += 1;
    }
    if count == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / count as f32;
    let var_sum: f32 = values
        .iter()
        .zip(keep)
        .filter(|(_, k)| **k)
        .map(|(v, _)| (v - mean) * (v - mean))
        .sum();
    (mean, (var_sum / count as f32).sqrt())
}

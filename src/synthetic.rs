//! Synthetic frame generation for tests and simulations.
//!
//! Produces deterministic dark frames with known offset and noise so
//! calibration results can be checked against ground truth, plus helpers to
//! plant photon events at reproducible positions.

use crate::frame::FrameMeta;
use crate::geometry::FrameShape;
use crate::pixel_stats::PIXEL_VALUE_MAX;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Generate one dark frame with Gaussian noise around a fixed offset.
///
/// Values are rounded to the nearest ADU and clamped to the representable
/// range. Same seed, same frame.
///
/// # Arguments
/// * `shape` - frame geometry
/// * `offset` - baseline level in ADU
/// * `sigma` - noise standard deviation in ADU
/// * `seed` - random seed for deterministic output
pub fn dark_frame(shape: FrameShape, offset: f64, sigma: f64, seed: u64) -> Array2<i16> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(offset, sigma)
        .expect("normal distribution parameters must be valid (sigma > 0)");
    Array2::from_shape_fn(shape.to_dim(), |_| {
        let value = normal.sample(&mut rng).round();
        value.clamp(0.0, f64::from(PIXEL_VALUE_MAX)) as i16
    })
}

/// Generate a set of dark frames with per-frame seeds derived from `seed`.
pub fn dark_frame_set(
    shape: FrameShape,
    offset: f64,
    sigma: f64,
    count: usize,
    seed: u64,
) -> Vec<Array2<i16>> {
    (0..count)
        .map(|i| dark_frame(shape, offset, sigma, seed.wrapping_add(i as u64)))
        .collect()
}

/// Metadata for a frame set: consecutive indices and one-second spacing.
pub fn default_metas(count: usize) -> Vec<FrameMeta> {
    (0..count)
        .map(|i| FrameMeta::new(i as u32, 1_000 + i as u32, 0))
        .collect()
}

/// Add `count` single-pixel events of the given amplitude at random
/// positions.
pub fn sprinkle_events(frame: &mut Array2<i16>, count: usize, amplitude: i16, seed: u64) {
    let (height, width) = frame.dim();
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..count {
        let y = rng.gen_range(0..height);
        let x = rng.gen_range(0..width);
        frame[[y, x]] = frame[[y, x]].saturating_add(amplitude).min(PIXEL_VALUE_MAX);
    }
}

//! Signal extraction from live detector frames.
//!
//! A loaded dark calibration turns a raw frame into pixel signals: every
//! line segment gets its common mode estimated and subtracted, every pixel
//! its calibrated baseline removed, and values above the per-pixel event
//! threshold become photon hits.

use crate::bad_pixel_map::{BadPixelFlag, BadPixelMap};
use crate::common_mode::{CommonModeEstimator, IterativeThreshold};
use crate::geometry::FrameShape;
use crate::pixel_stats::PixelStatMap;
use ndarray::{Array2, ArrayView2};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from processing one data frame.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("no valid dark calibration is loaded")]
    CalibrationMissing,
    #[error("frame geometry {frame} does not match the calibration geometry {calibration}")]
    GeometryMismatch {
        frame: FrameShape,
        calibration: FrameShape,
    },
    #[error("output buffer geometry {output} does not match the calibration geometry {calibration}")]
    OutputMismatch {
        output: FrameShape,
        calibration: FrameShape,
    },
}

/// One above-threshold pixel in a processed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhotonHit {
    /// Column of the hit pixel
    pub x: u16,
    /// Line of the hit pixel
    pub y: u16,
    /// Baseline- and common-mode-corrected signal in ADU
    pub amplitude: u16,
    /// Uncorrected energy estimate; equals the amplitude until a pulse
    /// height correction is applied downstream
    pub energy: f32,
}

/// Calibration data in the derived form signal extraction needs: per-pixel
/// baseline means, event thresholds and bad flags.
#[derive(Debug, Clone, Default)]
struct LoadedCalibration {
    shape: FrameShape,
    means: Vec<i16>,
    thresholds: Vec<i16>,
    flags: Vec<BadPixelFlag>,
}

/// Applies a dark calibration to live frames.
///
/// The processor keeps only derived per-pixel views (means, thresholds,
/// flags) of the calibration; the statistics map itself stays with its
/// owner. Processing fails hard when no calibration is loaded or the frame
/// geometry disagrees with it.
pub struct SignalFrameProcessor {
    estimator: Box<dyn CommonModeEstimator>,
    /// Common-mode event-rejection depth used on data frames
    depth: usize,
    /// Event threshold multiplier in units of the pixel noise sigma
    threshold_multiplier: f64,
    calibration: Option<LoadedCalibration>,
}

impl SignalFrameProcessor {
    /// Create a processor with the iterative threshold common-mode
    /// estimator and the given event threshold multiplier.
    pub fn new(threshold_multiplier: f64, depth: usize) -> Self {
        Self {
            estimator: Box::new(IterativeThreshold),
            depth,
            threshold_multiplier,
            calibration: None,
        }
    }

    /// Replace the common-mode strategy.
    pub fn set_estimator(&mut self, estimator: Box<dyn CommonModeEstimator>) {
        self.estimator = estimator;
    }

    /// True once a calibration has been loaded.
    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_some()
    }

    /// Geometry of the loaded calibration, if any.
    pub fn calibration_shape(&self) -> Option<FrameShape> {
        self.calibration.as_ref().map(|c| c.shape)
    }

    /// Derive the per-pixel views from a calibration result.
    ///
    /// Thresholds become `multiplier * sigma`, capped at the signed 16-bit
    /// maximum. Replaces any previously loaded calibration.
    pub fn load_calibration(&mut self, stats: &PixelStatMap, bad_map: &BadPixelMap) {
        let shape = stats.shape();
        let thresholds = stats
            .entries()
            .iter()
            .map(|stat| {
                let value = self.threshold_multiplier * stat.sigma;
                if value > 32767.0 {
                    32767
                } else {
                    value.round() as i16
                }
            })
            .collect();
        self.calibration = Some(LoadedCalibration {
            shape,
            means: stats.mean_map(),
            thresholds,
            flags: bad_map.flags().to_vec(),
        });
        debug!(%shape, "signal processor calibration loaded");
    }

    /// Drop the loaded calibration.
    pub fn clear_calibration(&mut self) {
        self.calibration = None;
    }

    /// Process one raw frame.
    ///
    /// Writes the corrected signal of every pixel into `corrected` (bad
    /// pixels and skipped lines become 0) and appends one [`PhotonHit`] per
    /// pixel whose corrected value exceeds its event threshold. The raw
    /// frame is left untouched. Returns the number of hits appended.
    ///
    /// # Arguments
    /// * `raw` - input frame, calibration geometry
    /// * `number_of_adcs` - line segmentation for common-mode estimation
    /// * `corrected` - output buffer, calibration geometry
    /// * `hits` - hit list to append to
    pub fn process(
        &mut self,
        raw: &ArrayView2<i16>,
        number_of_adcs: usize,
        corrected: &mut Array2<i16>,
        hits: &mut Vec<PhotonHit>,
    ) -> Result<usize, ProcessError> {
        let calibration = self
            .calibration
            .as_ref()
            .ok_or(ProcessError::CalibrationMissing)?;

        let (height, width) = raw.dim();
        let frame_shape = FrameShape::new(width, height);
        if frame_shape != calibration.shape {
            return Err(ProcessError::GeometryMismatch {
                frame: frame_shape,
                calibration: calibration.shape,
            });
        }
        let (out_height, out_width) = corrected.dim();
        if (out_height, out_width) != (height, width) {
            return Err(ProcessError::OutputMismatch {
                output: FrameShape::new(out_width, out_height),
                calibration: calibration.shape,
            });
        }

        let adc_channels = width / number_of_adcs;
        let out = corrected
            .as_slice_mut()
            .expect("owned Array2 uses standard row-major layout");
        let mut scratch: Vec<i16> = Vec::with_capacity(adc_channels);
        let mut num_hits = 0usize;
        let mut skipped_lines = 0usize;

        for y in 0..height {
            for adc in 0..number_of_adcs {
                let seg = y * width + adc * adc_channels;
                scratch.clear();
                scratch.extend(raw.row(y).iter().skip(adc * adc_channels).take(adc_channels));

                let means = &calibration.means[seg..seg + adc_channels];
                let flags = &calibration.flags[seg..seg + adc_channels];
                let thresholds = &calibration.thresholds[seg..seg + adc_channels];
                let Some(cmode) =
                    self.estimator
                        .estimate(&mut scratch, thresholds, flags, means, self.depth)
                else {
                    out[seg..seg + adc_channels].fill(0);
                    skipped_lines += 1;
                    continue;
                };

                for i in 0..adc_channels {
                    if flags[i].is_bad() {
                        out[seg + i] = 0;
                        continue;
                    }
                    let signal = i32::from(scratch[i]) - i32::from(cmode) - i32::from(means[i]);
                    let signal = signal.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
                    out[seg + i] = signal;
                    if signal > thresholds[i] {
                        hits.push(PhotonHit {
                            x: (adc * adc_channels + i) as u16,
                            y: y as u16,
                            amplitude: signal as u16,
                            energy: f32::from(signal),
                        });
                        num_hits += 1;
                    }
                }
            }
        }

        if skipped_lines > 0 {
            warn!(skipped_lines, "line segments without a valid common mode");
        }
        debug!(hits = num_hits, "frame processed");
        Ok(num_hits)
    }
}
